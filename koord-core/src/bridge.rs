//! Bridge between event distribution and the durable consensus core.
//!
//! Outbound, every event the [`EventDistributor`] processes is translated
//! into a named core operation with a priority class and applied to the
//! [`DurableStore`]. Inbound, state updates posted by the core on a shared
//! [`MessageChannel`] are turned back into STATE_CHANGE events and fed to the
//! distributor for rebroadcast.
//!
//! [`EventDistributor`]: crate::distributor::EventDistributor

use crate::config::BridgeConfig;
use crate::directory::NodeRecord;
use crate::distributor::{DistributorMetrics, DistributorNotice, SharedDistributor};
use crate::election::PersistentState;
use crate::error::{Error, Result};
use crate::event::{ConsensusEvent, EventKind, EventType, StateChange};
use crate::store::{ClusterStats, DurableStore, SharedStore};
use crate::types::{NodeId, Role};
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::{Arc, Weak};
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Messages kept by the in-memory channel
const CHANNEL_RETENTION: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    Medium,
    High,
}

/// Canonical core operation name and priority for an event type
pub fn operation_for(event_type: EventType) -> (&'static str, Priority) {
    match event_type {
        EventType::VoteRequest => ("request_vote", Priority::High),
        EventType::VoteResponse => ("record_vote", Priority::High),
        EventType::LeaderElection => ("elect_leader", Priority::High),
        EventType::Heartbeat => ("heartbeat", Priority::Medium),
        EventType::StateChange => ("update_node_state", Priority::Medium),
        EventType::AppendEntries => ("append_entries", Priority::Low),
        EventType::AppendEntriesResponse => ("acknowledge_entries", Priority::Low),
        EventType::ConsensusAchieved => ("commit_consensus", Priority::Low),
    }
}

/// An event translated for the durable core
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CoreOperation {
    pub name: &'static str,
    pub priority: Priority,
    pub node_id: NodeId,
    pub term: u64,
}

impl CoreOperation {
    pub fn from_event(event: &ConsensusEvent) -> Self {
        let (name, priority) = operation_for(event.event_type());
        Self {
            name,
            priority,
            node_id: event.node_id.clone(),
            term: event.term,
        }
    }
}

/// One message on the shared channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelMessage {
    /// Assigned by the channel, increasing
    pub id: u64,
    pub kind: String,
    pub sender: NodeId,
    pub payload: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

/// Selects messages from `list_recent`
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MessageFilter {
    pub kind: Option<String>,
    /// Only messages with a larger id
    pub after: Option<u64>,
    /// Zero means no limit
    pub limit: usize,
}

impl MessageFilter {
    fn matches(&self, message: &ChannelMessage) -> bool {
        self.kind.as_ref().map_or(true, |k| *k == message.kind)
            && self.after.map_or(true, |after| message.id > after)
    }
}

/// Shared message channel used by the durable core
pub trait MessageChannel: Send + Sync {
    /// Post a message; returns its id
    fn post(&self, kind: &str, sender: &str, payload: serde_json::Value) -> Result<u64>;
    /// Matching messages, oldest first
    fn list_recent(&self, filter: &MessageFilter) -> Result<Vec<ChannelMessage>>;
}

/// In-process channel keeping the most recent messages
#[derive(Debug, Default)]
pub struct MemoryChannel {
    inner: Mutex<ChannelInner>,
}

#[derive(Debug, Default)]
struct ChannelInner {
    next_id: u64,
    messages: VecDeque<ChannelMessage>,
}

impl MemoryChannel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl MessageChannel for MemoryChannel {
    fn post(&self, kind: &str, sender: &str, payload: serde_json::Value) -> Result<u64> {
        let mut inner = self.inner.lock();
        inner.next_id += 1;
        let id = inner.next_id;
        inner.messages.push_back(ChannelMessage {
            id,
            kind: kind.to_string(),
            sender: sender.to_string(),
            payload,
            timestamp: Utc::now(),
        });
        while inner.messages.len() > CHANNEL_RETENTION {
            inner.messages.pop_front();
        }
        Ok(id)
    }

    fn list_recent(&self, filter: &MessageFilter) -> Result<Vec<ChannelMessage>> {
        let inner = self.inner.lock();
        let matching = inner.messages.iter().filter(|m| filter.matches(m));
        let out = if filter.limit == 0 {
            matching.cloned().collect()
        } else {
            matching.take(filter.limit).cloned().collect()
        };
        Ok(out)
    }
}

/// Payload of a state update posted by the durable core
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateUpdate {
    pub node_id: NodeId,
    pub role: Role,
    pub term: u64,
    #[serde(default)]
    pub reason: Option<String>,
}

/// Distribution metrics merged with durable-core metrics
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UnifiedStatus {
    pub connected_nodes: Vec<NodeId>,
    pub cluster_size: usize,
    pub current_term: u64,
    pub leader: Option<NodeId>,
    pub distribution: DistributorMetrics,
    pub core_connected: bool,
    /// None while no core is connected
    pub core: Option<ClusterStats>,
    pub forwarded: u64,
    pub forward_failures: u64,
    pub updates_applied: u64,
}

#[derive(Debug, Default)]
struct BridgeCounters {
    forwarded: u64,
    forward_failures: u64,
    updates_applied: u64,
    /// Last channel message id consumed
    cursor: Option<u64>,
}

/// Shared reference to a CoordinationBridge
pub type SharedBridge = Arc<CoordinationBridge>;

pub struct CoordinationBridge {
    distributor: SharedDistributor,
    channel: Arc<dyn MessageChannel>,
    core: RwLock<Option<SharedStore>>,
    config: BridgeConfig,
    counters: Mutex<BridgeCounters>,
}

impl CoordinationBridge {
    pub fn new(distributor: SharedDistributor, channel: Arc<dyn MessageChannel>, config: BridgeConfig) -> Self {
        Self {
            distributor,
            channel,
            core: RwLock::new(None),
            config,
            counters: Mutex::new(BridgeCounters::default()),
        }
    }

    pub fn shared(self) -> SharedBridge {
        Arc::new(self)
    }

    pub fn connect_core(&self, store: SharedStore) {
        info!("Bridge: Durable core connected");
        *self.core.write() = Some(store);
    }

    pub fn disconnect_core(&self) {
        if self.core.write().take().is_some() {
            info!("Bridge: Durable core disconnected");
        }
    }

    pub fn is_core_connected(&self) -> bool {
        self.core.read().is_some()
    }

    fn core(&self) -> Result<SharedStore> {
        self.core.read().clone().ok_or(Error::CoreDisconnected)
    }

    /// Apply one distribution event to the durable core
    pub fn forward(&self, event: &ConsensusEvent) -> Result<CoreOperation> {
        let operation = CoreOperation::from_event(event);
        let result = self.core().and_then(|store| apply_to_core(store.as_ref(), event));

        let mut counters = self.counters.lock();
        match result {
            Ok(()) => {
                counters.forwarded += 1;
                debug!(
                    operation = operation.name,
                    priority = ?operation.priority,
                    forwarded = true,
                    "Bridge: Forwarded {} from {}",
                    event.event_type(),
                    event.node_id
                );
                Ok(operation)
            }
            Err(e) => {
                counters.forward_failures += 1;
                warn!(
                    operation = operation.name,
                    priority = ?operation.priority,
                    forwarded = false,
                    "Bridge: Failed to forward {} from {}: {}",
                    event.event_type(),
                    event.node_id,
                    e
                );
                Err(e)
            }
        }
    }

    /// Register a newly connected node with the core
    pub fn register_node(&self, node_id: &str) -> Result<()> {
        let store = self.core()?;
        let record = store
            .node(node_id)?
            .unwrap_or_else(|| NodeRecord::new(node_id));
        store.upsert_node(&record.with_last_activity(Utc::now()))
    }

    /// Read pending state updates from the channel and rebroadcast them
    pub fn poll_once(&self) -> Result<usize> {
        self.core()?;

        let filter = MessageFilter {
            kind: Some(self.config.state_update_kind.clone()),
            after: self.counters.lock().cursor,
            limit: self.config.poll_batch,
        };
        let messages = self.channel.list_recent(&filter)?;

        let mut applied = 0;
        for message in messages {
            self.counters.lock().cursor = Some(message.id);
            let update: StateUpdate = match serde_json::from_value(message.payload) {
                Ok(update) => update,
                Err(e) => {
                    warn!("Bridge: Skipping malformed state update {}: {}", message.id, e);
                    continue;
                }
            };
            let event = self.state_change_for(update);
            self.distributor.handle_event(event);
            applied += 1;
        }

        if applied > 0 {
            self.counters.lock().updates_applied += applied as u64;
            debug!("Bridge: Applied {} state updates", applied);
        }
        Ok(applied)
    }

    fn state_change_for(&self, update: StateUpdate) -> ConsensusEvent {
        let previous_state = self
            .distributor
            .directory()
            .read()
            .get(&update.node_id)
            .map(|r| r.role)
            .unwrap_or_default();
        ConsensusEvent::new(
            update.node_id,
            update.term,
            EventKind::StateChange(StateChange {
                previous_state,
                new_state: update.role,
                reason: update.reason.unwrap_or_else(|| "core state update".to_string()),
            }),
        )
    }

    /// Durable-core aggregate; fails fast without a core
    pub fn core_stats(&self) -> Result<ClusterStats> {
        self.core()?.cluster_stats()
    }

    pub fn status(&self) -> UnifiedStatus {
        let distribution = self.distributor.metrics();
        let directory = self.distributor.directory();
        let (cluster_size, leader) = {
            let directory = directory.read();
            (directory.len(), directory.leader().map(|r| r.id.clone()))
        };
        let core = match self.core_stats() {
            Ok(stats) => Some(stats),
            Err(Error::CoreDisconnected) => None,
            Err(e) => {
                warn!("Bridge: Failed to read core stats: {}", e);
                None
            }
        };
        let counters = self.counters.lock();

        UnifiedStatus {
            connected_nodes: self.distributor.connected_nodes(),
            cluster_size,
            current_term: distribution
                .current_term
                .max(core.as_ref().map_or(0, |c| c.current_term)),
            leader: distribution.current_leader.clone().or(leader),
            core_connected: self.is_core_connected(),
            core,
            distribution,
            forwarded: counters.forwarded,
            forward_failures: counters.forward_failures,
            updates_applied: counters.updates_applied,
        }
    }
}

fn apply_to_core(store: &dyn DurableStore, event: &ConsensusEvent) -> Result<()> {
    let now = Utc::now();
    let observe = |id: &str, role: Role| -> Result<()> {
        let mut record = store.node(id)?.unwrap_or_else(|| NodeRecord::new(id));
        record.role = role;
        record.term = record.term.max(event.term);
        record.last_activity = now;
        store.upsert_node(&record)
    };

    match &event.kind {
        EventKind::VoteRequest(req) => {
            observe(&req.candidate_id, Role::Candidate)?;
            store.store_vote_request(event.term, req)
        }
        EventKind::VoteResponse(resp) => store.store_vote_response(resp),
        EventKind::Heartbeat(_) => observe(&event.node_id, Role::Leader),
        EventKind::AppendEntries(req) => {
            for entry in &req.entries {
                store.append_log(entry)?;
            }
            store.commit(req.leader_commit).map(|_| ())
        }
        EventKind::AppendEntriesResponse(_) => Ok(()),
        EventKind::StateChange(change) => observe(&event.node_id, change.new_state),
        EventKind::LeaderElection(elected) => {
            observe(&elected.new_leader_id, Role::Leader)?;
            if store.term()?.current_term < event.term {
                store.start_term(&PersistentState {
                    current_term: event.term,
                    voted_for: None,
                })?;
            }
            Ok(())
        }
        EventKind::ConsensusAchieved(done) => store.commit(done.log_index).map(|_| ()),
    }
}

/// Forward every processed event to the core until the distributor goes away
pub fn spawn_forwarder(bridge: &SharedBridge) -> JoinHandle<()> {
    let weak: Weak<CoordinationBridge> = Arc::downgrade(bridge);
    let mut notices = bridge.distributor.subscribe();
    tokio::spawn(async move {
        loop {
            let notice = match notices.recv().await {
                Ok(notice) => notice,
                Err(RecvError::Lagged(skipped)) => {
                    warn!("Bridge: Forwarder lagged, skipped {} notices", skipped);
                    continue;
                }
                Err(RecvError::Closed) => break,
            };
            let bridge = match weak.upgrade() {
                Some(bridge) => bridge,
                None => break,
            };
            match notice {
                DistributorNotice::EventProcessed(event) => {
                    let _ = bridge.forward(&event);
                }
                DistributorNotice::Connected(node_id) => {
                    if let Err(e) = bridge.register_node(&node_id) {
                        debug!("Bridge: Could not register {}: {}", node_id, e);
                    }
                }
                DistributorNotice::Disconnected(node_id) => {
                    debug!("Bridge: {} disconnected", node_id);
                }
                DistributorNotice::LeaderElected(_) => {}
            }
        }
        debug!("Bridge: Forwarder stopped");
    })
}

/// Poll the shared channel at the configured interval
pub fn spawn_poller(bridge: &SharedBridge) -> JoinHandle<()> {
    let weak: Weak<CoordinationBridge> = Arc::downgrade(bridge);
    let period = bridge.config.poll_interval();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        loop {
            ticker.tick().await;
            let bridge = match weak.upgrade() {
                Some(bridge) => bridge,
                None => break,
            };
            match bridge.poll_once() {
                Ok(_) | Err(Error::CoreDisconnected) => {}
                Err(e) => warn!("Bridge: Poll failed: {}", e),
            }
        }
    })
}
