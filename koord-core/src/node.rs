//! Election node actor.
//!
//! An [`ElectionNode`] owns one [`ElectionCore`] and a single mailbox.
//! Inbound events, timer fires and client commands are processed to
//! completion one at a time, so the core never sees concurrent access.

use crate::election::{Effect, ElectionCore, JournalRecord};
use crate::error::{Error, Result};
use crate::event::ConsensusEvent;
use crate::log::LogEntry;
use crate::timer::DelayedTask;
use crate::transport::Transport;
use crate::types::{NodeId, Role};
use serde::Serialize;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Capacity of the per-node outbound event feed
const EVENT_FEED_CAPACITY: usize = 256;

/// Everything a node's mailbox accepts
#[derive(Debug)]
pub enum NodeInput {
    Event(ConsensusEvent),
    ElectionTimeout(u64),
    HeartbeatTick(u64),
    Submit {
        key: String,
        value: serde_json::Value,
        reply: oneshot::Sender<Result<LogEntry>>,
    },
    Status(oneshot::Sender<NodeStatus>),
    UpdatePeers(Vec<NodeId>),
    Shutdown,
}

/// Point-in-time view of a node
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeStatus {
    pub node_id: NodeId,
    pub role: Role,
    pub term: u64,
    pub leader: Option<NodeId>,
    pub voted_for: Option<NodeId>,
    pub commit_index: u64,
    pub last_index: u64,
    pub peers: usize,
}

impl NodeStatus {
    fn of(core: &ElectionCore) -> Self {
        Self {
            node_id: core.node_id().clone(),
            role: core.role(),
            term: core.term(),
            leader: core.leader().cloned(),
            voted_for: core.voted_for().cloned(),
            commit_index: core.log().commit_index(),
            last_index: core.log().last_index(),
            peers: core.peers().len(),
        }
    }
}

/// Cloneable handle to a running node
#[derive(Clone)]
pub struct NodeHandle {
    node_id: NodeId,
    tx: mpsc::UnboundedSender<NodeInput>,
    feed: broadcast::Sender<ConsensusEvent>,
}

impl NodeHandle {
    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    /// Sender side of the mailbox, for transports
    pub fn mailbox(&self) -> mpsc::UnboundedSender<NodeInput> {
        self.tx.clone()
    }

    /// Events this node broadcasts (state changes, elections, commits)
    pub fn subscribe(&self) -> broadcast::Receiver<ConsensusEvent> {
        self.feed.subscribe()
    }

    /// Hand an inbound event to the node
    pub fn deliver(&self, event: ConsensusEvent) -> Result<()> {
        self.post(NodeInput::Event(event))
    }

    /// Submit a command; resolves once the leader appended it
    pub async fn submit(&self, key: impl Into<String>, value: serde_json::Value) -> Result<LogEntry> {
        let (reply, rx) = oneshot::channel();
        self.post(NodeInput::Submit {
            key: key.into(),
            value,
            reply,
        })?;
        rx.await.map_err(|_| self.stopped())?
    }

    pub async fn status(&self) -> Result<NodeStatus> {
        let (reply, rx) = oneshot::channel();
        self.post(NodeInput::Status(reply))?;
        rx.await.map_err(|_| self.stopped())
    }

    pub fn update_peers(&self, peers: Vec<NodeId>) -> Result<()> {
        self.post(NodeInput::UpdatePeers(peers))
    }

    /// Ask the node to stop; a stopped node ignores this
    pub fn shutdown(&self) {
        let _ = self.tx.send(NodeInput::Shutdown);
    }

    pub fn is_running(&self) -> bool {
        !self.tx.is_closed()
    }

    fn post(&self, input: NodeInput) -> Result<()> {
        self.tx.send(input).map_err(|_| self.stopped())
    }

    fn stopped(&self) -> Error {
        Error::Transport(format!("node {} is not running", self.node_id))
    }
}

/// Actor driving one election core
pub struct ElectionNode<T: Transport> {
    core: ElectionCore,
    transport: T,
    election_timer: DelayedTask,
    heartbeat_timer: DelayedTask,
    tx: mpsc::UnboundedSender<NodeInput>,
    rx: mpsc::UnboundedReceiver<NodeInput>,
    feed: broadcast::Sender<ConsensusEvent>,
    journal: Option<mpsc::UnboundedSender<JournalRecord>>,
}

impl<T: Transport> ElectionNode<T> {
    pub fn new(core: ElectionCore, transport: T) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let (feed, _) = broadcast::channel(EVENT_FEED_CAPACITY);
        Self {
            core,
            transport,
            election_timer: DelayedTask::new(),
            heartbeat_timer: DelayedTask::new(),
            tx,
            rx,
            feed,
            journal: None,
        }
    }

    /// Deliver every durable change to `journal`, in order
    pub fn with_journal(mut self, journal: mpsc::UnboundedSender<JournalRecord>) -> Self {
        self.journal = Some(journal);
        self
    }

    pub fn handle(&self) -> NodeHandle {
        NodeHandle {
            node_id: self.core.node_id().clone(),
            tx: self.tx.clone(),
            feed: self.feed.clone(),
        }
    }

    /// Run the actor on the tokio runtime
    pub fn spawn(self) -> (NodeHandle, JoinHandle<()>) {
        let handle = self.handle();
        (handle, tokio::spawn(self.run()))
    }

    pub async fn run(mut self) {
        info!(
            "Node: {} starting with {} peers",
            self.core.node_id(),
            self.core.peers().len()
        );
        self.arm_election_timer();

        while let Some(input) = self.rx.recv().await {
            match input {
                NodeInput::Event(event) => {
                    let effects = self.core.handle_event(event);
                    self.apply(effects);
                }
                NodeInput::ElectionTimeout(generation) => {
                    if !self.election_timer.is_current(generation) {
                        debug!("Node: Ignoring stale election timer {}", generation);
                        continue;
                    }
                    let effects = self.core.on_election_timeout();
                    self.apply(effects);
                }
                NodeInput::HeartbeatTick(generation) => {
                    if !self.heartbeat_timer.is_current(generation) {
                        continue;
                    }
                    let effects = self.core.on_heartbeat_tick();
                    self.apply(effects);
                    if self.core.is_leader() {
                        self.arm_heartbeat_timer();
                    }
                }
                NodeInput::Submit { key, value, reply } => {
                    let result = self.core.submit(key, value);
                    let effects = self.core.drain_effects();
                    self.apply(effects);
                    let _ = reply.send(result);
                }
                NodeInput::Status(reply) => {
                    let _ = reply.send(NodeStatus::of(&self.core));
                }
                NodeInput::UpdatePeers(peers) => {
                    self.core.set_peers(peers);
                }
                NodeInput::Shutdown => break,
            }
        }

        self.election_timer.cancel();
        self.heartbeat_timer.cancel();
        info!("Node: {} stopped at term {}", self.core.node_id(), self.core.term());
    }

    fn apply(&mut self, effects: Vec<Effect>) {
        for effect in effects {
            match effect {
                Effect::Send { to, event } => {
                    if let Err(e) = self.transport.send(&to, &event) {
                        warn!("Node: Send {} to {} failed: {}", event.event_type(), to, e);
                    }
                }
                Effect::Broadcast(event) => {
                    let _ = self.feed.send(event.clone());
                    if let Err(e) = self.transport.broadcast(&event) {
                        warn!("Node: Broadcast {} failed: {}", event.event_type(), e);
                    }
                }
                Effect::ResetElectionTimer => {
                    if !self.core.is_leader() {
                        self.arm_election_timer();
                    }
                }
                Effect::StartHeartbeats => {
                    self.election_timer.cancel();
                    self.arm_heartbeat_timer();
                }
                Effect::StopHeartbeats => {
                    self.heartbeat_timer.cancel();
                    self.arm_election_timer();
                }
                Effect::Persist(record) => {
                    let closed = match &self.journal {
                        Some(journal) => journal.send(record).is_err(),
                        None => false,
                    };
                    if closed {
                        warn!("Node: Journal closed, durable changes are no longer recorded");
                        self.journal = None;
                    }
                }
            }
        }
    }

    fn arm_election_timer(&mut self) {
        let timeout = self.core.config().random_election_timeout();
        self.election_timer
            .arm(timeout, self.tx.clone(), NodeInput::ElectionTimeout);
    }

    fn arm_heartbeat_timer(&mut self) {
        let interval = self.core.config().heartbeat_interval();
        self.heartbeat_timer
            .arm(interval, self.tx.clone(), NodeInput::HeartbeatTick);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ElectionConfig;
    use crate::event::EventType;
    use crate::transport::MemoryNetwork;
    use serde_json::json;
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn test_single_node_becomes_leader() {
        let network = MemoryNetwork::new();
        let core = ElectionCore::new("solo", vec![], ElectionConfig::default());
        let node = ElectionNode::new(core, network.endpoint("solo"));
        let (handle, task) = node.spawn();
        network.attach("solo", handle.mailbox());
        let mut feed = handle.subscribe();

        loop {
            let event = feed.recv().await.unwrap();
            if event.event_type() == EventType::LeaderElection {
                break;
            }
        }

        let status = handle.status().await.unwrap();
        assert_eq!(status.role, Role::Leader);
        assert_eq!(status.term, 1);

        let entry = handle.submit("k", json!(7)).await.unwrap();
        assert_eq!(entry.key, "k");
        let status = handle.status().await.unwrap();
        assert_eq!(status.commit_index, entry.index);

        handle.shutdown();
        task.await.unwrap();
        assert!(!handle.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_follower_rejects_submit() {
        let network = MemoryNetwork::new();
        let core = ElectionCore::new("a", vec!["b".into()], ElectionConfig::default());
        let (handle, _task) = ElectionNode::new(core, network.endpoint("a")).spawn();

        let err = handle.submit("k", json!(1)).await.unwrap_err();
        assert!(matches!(err, Error::NotLeader { .. }));

        // Without peers answering, the node keeps retrying as candidate
        tokio::time::sleep(Duration::from_millis(700)).await;
        let status = handle.status().await.unwrap();
        assert_eq!(status.role, Role::Candidate);
        assert!(status.term >= 2);
    }
}
