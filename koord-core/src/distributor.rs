//! Event distribution across live node connections.
//!
//! The [`EventDistributor`] keeps one outbound channel per connected node,
//! mirrors every observed role/term into the [`ClusterDirectory`] and relays
//! events to the other nodes. It also keeps per-candidate vote sets and
//! synthesizes a LEADER_ELECTION once a candidate holds a strict majority
//! of the connected nodes. It never decides proposal outcomes.
//!
//! [`ClusterDirectory`]: crate::directory::ClusterDirectory

use crate::directory::SharedDirectory;
use crate::error::{Error, Result};
use crate::event::{ConsensusEvent, EventKind, LeaderElection};
use crate::metrics::{RollingAverage, DEFAULT_WINDOW};
use crate::types::{majority, unix_timestamp_ms, NodeId, Role};
use chrono::Utc;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

/// Channel capacity for local notifications
const CHANNEL_CAPACITY: usize = 256;

/// Outbound half of a node connection
pub type Connection = mpsc::UnboundedSender<ConsensusEvent>;

/// Shared reference to an EventDistributor
pub type SharedDistributor = Arc<EventDistributor>;

/// Local notification published by the distributor
#[derive(Debug, Clone, PartialEq)]
pub enum DistributorNotice {
    Connected(NodeId),
    Disconnected(NodeId),
    LeaderElected(ElectionSummary),
    /// An event was handled; carries the event itself
    EventProcessed(ConsensusEvent),
}

/// Outcome of the most recent election seen by the distributor.
///
/// `votes_received` keeps counting grants that arrive after the majority.
/// The LEADER_ELECTION event relayed to nodes is sent once, when the majority
/// is reached, and carries the tally of that moment; it is not re-sent as
/// later grants arrive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ElectionSummary {
    pub leader: NodeId,
    pub term: u64,
    pub votes_received: usize,
    pub total_nodes: usize,
}

/// Aggregate distribution metrics
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DistributorMetrics {
    pub connected_nodes: usize,
    pub total_elections: u64,
    pub average_election_time_ms: f64,
    pub average_consensus_time_ms: f64,
    pub average_heartbeat_latency_ms: f64,
    pub participant_count: usize,
    pub events_relayed: u64,
    pub current_term: u64,
    pub current_leader: Option<NodeId>,
}

#[derive(Debug)]
struct VoteSet {
    term: u64,
    voters: HashSet<NodeId>,
}

#[derive(Default)]
struct DistributorState {
    connections: HashMap<NodeId, Connection>,
    vote_sets: HashMap<NodeId, VoteSet>,
    election_started: Option<Instant>,
    last_election: Option<ElectionSummary>,
    total_elections: u64,
    election_times: RollingAverage,
    consensus_times: RollingAverage,
    heartbeat_latency: RollingAverage,
    participant_count: usize,
    events_relayed: u64,
    current_term: u64,
}

/// Relay and bookkeeping hub for consensus events
pub struct EventDistributor {
    directory: SharedDirectory,
    state: Mutex<DistributorState>,
    notices: broadcast::Sender<DistributorNotice>,
}

impl EventDistributor {
    pub fn new(directory: SharedDirectory) -> Self {
        Self::with_window(directory, DEFAULT_WINDOW)
    }

    /// Distributor whose rolling metrics keep `window` samples
    pub fn with_window(directory: SharedDirectory, window: usize) -> Self {
        let (notices, _) = broadcast::channel(CHANNEL_CAPACITY);
        let state = DistributorState {
            election_times: RollingAverage::new(window),
            consensus_times: RollingAverage::new(window),
            heartbeat_latency: RollingAverage::new(window),
            ..Default::default()
        };
        Self {
            directory,
            state: Mutex::new(state),
            notices,
        }
    }

    pub fn shared(self) -> SharedDistributor {
        Arc::new(self)
    }

    pub fn directory(&self) -> SharedDirectory {
        self.directory.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DistributorNotice> {
        self.notices.subscribe()
    }

    /// Attach a node connection, replacing any previous one
    pub fn connect(&self, node_id: impl Into<NodeId>, connection: Connection) {
        let node_id = node_id.into();
        {
            let mut directory = self.directory.write();
            if !directory.contains(&node_id) {
                directory.observe(&node_id, Role::Follower, 0, Utc::now());
            } else {
                directory.touch(&node_id, Utc::now());
            }
        }
        self.state.lock().connections.insert(node_id.clone(), connection);
        info!("Distributor: {} connected", node_id);
        self.notify(DistributorNotice::Connected(node_id));
    }

    /// Drop a node connection and its directory record
    pub fn disconnect(&self, node_id: &str) {
        self.remove_connection(node_id, None);
    }

    /// Drop `node_id` only while `connection` is still the one attached for
    /// it. A node that reconnected under the same id is left alone.
    pub fn disconnect_connection(&self, node_id: &str, connection: &Connection) -> bool {
        self.remove_connection(node_id, Some(connection))
    }

    fn remove_connection(&self, node_id: &str, expected: Option<&Connection>) -> bool {
        let removed = {
            let mut state = self.state.lock();
            let current = match state.connections.get(node_id) {
                Some(current) => current,
                None => return false,
            };
            if let Some(expected) = expected {
                if !current.same_channel(expected) {
                    debug!("Distributor: {} has a newer connection, keeping it", node_id);
                    return false;
                }
            }
            state.vote_sets.remove(node_id);
            state.connections.remove(node_id).is_some()
        };
        self.directory.write().remove(node_id);
        if removed {
            info!("Distributor: {} disconnected", node_id);
            self.notify(DistributorNotice::Disconnected(node_id.to_string()));
        }
        removed
    }

    /// Connected node ids, sorted
    pub fn connected_nodes(&self) -> Vec<NodeId> {
        let mut ids: Vec<NodeId> = self.state.lock().connections.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn connection_count(&self) -> usize {
        self.state.lock().connections.len()
    }

    pub fn last_election(&self) -> Option<ElectionSummary> {
        self.state.lock().last_election.clone()
    }

    /// Candidates with an open vote set and their granted voters
    pub fn vote_sets(&self) -> HashMap<NodeId, HashSet<NodeId>> {
        self.state
            .lock()
            .vote_sets
            .iter()
            .map(|(candidate, set)| (candidate.clone(), set.voters.clone()))
            .collect()
    }

    pub fn metrics(&self) -> DistributorMetrics {
        let state = self.state.lock();
        DistributorMetrics {
            connected_nodes: state.connections.len(),
            total_elections: state.total_elections,
            average_election_time_ms: state.election_times.average(),
            average_consensus_time_ms: state.consensus_times.average(),
            average_heartbeat_latency_ms: state.heartbeat_latency.average(),
            participant_count: state.participant_count,
            events_relayed: state.events_relayed,
            current_term: state.current_term,
            current_leader: state.last_election.as_ref().map(|e| e.leader.clone()),
        }
    }

    /// Send directly to one node
    pub fn send_to(&self, node_id: &str, event: ConsensusEvent) -> Result<()> {
        let state = self.state.lock();
        let connection = state
            .connections
            .get(node_id)
            .ok_or_else(|| Error::Transport(format!("{} is not connected", node_id)))?;
        connection
            .send(event)
            .map_err(|_| Error::Transport(format!("connection to {} closed", node_id)))
    }

    /// Relay to every connected node except `except`; returns deliveries
    pub fn broadcast(&self, event: &ConsensusEvent, except: Option<&str>) -> usize {
        let mut state = self.state.lock();
        let mut delivered = 0;
        for (node_id, connection) in &state.connections {
            if Some(node_id.as_str()) == except {
                continue;
            }
            match connection.send(event.clone()) {
                Ok(()) => delivered += 1,
                Err(_) => warn!(
                    "Distributor: Relay of {} to {} failed (connection closed)",
                    event.event_type(),
                    node_id
                ),
            }
        }
        state.events_relayed += delivered as u64;
        delivered
    }

    /// Parse wire text and handle it; malformed input is logged and dropped
    pub fn handle_raw(&self, text: &str) -> Result<()> {
        match ConsensusEvent::from_json(text) {
            Ok(event) => {
                self.handle_event(event);
                Ok(())
            }
            Err(e) => {
                warn!("Distributor: Dropping malformed event: {}", e);
                Err(e)
            }
        }
    }

    /// Handle one event received from `event.node_id`
    pub fn handle_event(&self, event: ConsensusEvent) {
        self.process(event, true);
    }

    fn process(&self, event: ConsensusEvent, from_peer: bool) {
        let sender = event.node_id.clone();
        let now = Utc::now();
        debug!("Distributor: {} from {} (term {})", event.event_type(), sender, event.term);

        {
            let mut state = self.state.lock();
            state.current_term = state.current_term.max(event.term);
        }

        let mut synthesized = None;
        match &event.kind {
            EventKind::VoteRequest(req) => {
                self.directory
                    .write()
                    .observe(&req.candidate_id, Role::Candidate, event.term, now);
                let mut state = self.state.lock();
                let set = state
                    .vote_sets
                    .entry(req.candidate_id.clone())
                    .or_insert_with(|| VoteSet {
                        term: event.term,
                        voters: HashSet::new(),
                    });
                if set.term != event.term {
                    set.term = event.term;
                    set.voters.clear();
                }
                set.voters.insert(req.candidate_id.clone());
                if state.election_started.is_none() {
                    state.election_started = Some(Instant::now());
                }
                drop(state);
                self.broadcast(&event, Some(&sender));
            }
            EventKind::VoteResponse(resp) => {
                self.directory.write().touch(&resp.voter_id, now);
                self.broadcast(&event, Some(&sender));
                if resp.granted {
                    synthesized = self.record_grant(&resp.candidate_id, &resp.voter_id, resp.term);
                }
            }
            EventKind::Heartbeat(_) => {
                self.directory
                    .write()
                    .observe(&sender, Role::Leader, event.term, now);
                self.broadcast(&event, Some(&sender));
                let latency = unix_timestamp_ms().saturating_sub(event.timestamp);
                self.state.lock().heartbeat_latency.push(latency as f64);
            }
            EventKind::AppendEntries(_) | EventKind::AppendEntriesResponse(_) => {
                let mut directory = self.directory.write();
                let role = directory.get(&sender).map(|r| r.role).unwrap_or_default();
                directory.observe(&sender, role, event.term, now);
                drop(directory);
                self.broadcast(&event, Some(&sender));
            }
            EventKind::StateChange(change) => {
                self.directory
                    .write()
                    .observe(&sender, change.new_state, event.term, now);
                self.broadcast(&event, Some(&sender));
            }
            EventKind::LeaderElection(elected) => {
                self.record_leader(elected, event.term);
                let except = if from_peer { Some(sender.as_str()) } else { None };
                self.broadcast(&event, except);
            }
            EventKind::ConsensusAchieved(achieved) => {
                self.directory.write().touch(&sender, now);
                let elapsed = unix_timestamp_ms().saturating_sub(event.timestamp);
                {
                    let mut state = self.state.lock();
                    state.consensus_times.push(elapsed as f64);
                    state.participant_count = achieved.participating_nodes.len();
                }
                self.broadcast(&event, Some(&sender));
            }
        }

        self.notify(DistributorNotice::EventProcessed(event));

        if let Some(elected) = synthesized {
            self.process(elected, false);
        }
    }

    /// Count a granted vote; returns a LEADER_ELECTION once the candidate
    /// holds a strict majority of connected nodes
    fn record_grant(&self, candidate: &NodeId, voter: &NodeId, term: u64) -> Option<ConsensusEvent> {
        let mut state = self.state.lock();

        // Late grants for an election already decided only update its tally
        if let Some(last) = state.last_election.as_mut() {
            if last.term >= term {
                if last.leader == *candidate && last.term == term {
                    last.votes_received = (last.votes_received + 1).min(last.total_nodes);
                }
                return None;
            }
        }

        let set = state
            .vote_sets
            .entry(candidate.clone())
            .or_insert_with(|| VoteSet {
                term,
                voters: HashSet::new(),
            });
        if set.term != term {
            set.term = term;
            set.voters.clear();
        }
        set.voters.insert(candidate.clone());
        set.voters.insert(voter.clone());
        let votes = set.voters.len();
        let total = state.connections.len();

        if total > 0 && votes >= majority(total) {
            info!(
                "Distributor: {} holds {}/{} votes for term {}",
                candidate, votes, total, term
            );
            return Some(ConsensusEvent::new(
                candidate.clone(),
                term,
                EventKind::LeaderElection(LeaderElection {
                    new_leader_id: candidate.clone(),
                    votes_received: votes,
                    total_nodes: total,
                }),
            ));
        }
        None
    }

    fn record_leader(&self, elected: &LeaderElection, term: u64) {
        let mut state = self.state.lock();
        if let Some(last) = &state.last_election {
            if last.term == term && last.leader == elected.new_leader_id {
                debug!("Distributor: Election of {} for term {} already recorded", last.leader, term);
                return;
            }
        }

        self.directory
            .write()
            .demote_all_except(&elected.new_leader_id, term);
        state.vote_sets.clear();

        if let Some(started) = state.election_started.take() {
            let elapsed = started.elapsed().as_secs_f64() * 1000.0;
            state.election_times.push(elapsed);
        }
        state.total_elections += 1;
        state.participant_count = elected.votes_received;

        let summary = ElectionSummary {
            leader: elected.new_leader_id.clone(),
            term,
            votes_received: elected.votes_received,
            total_nodes: elected.total_nodes,
        };
        state.last_election = Some(summary.clone());
        drop(state);

        info!(
            "Distributor: {} elected leader for term {} ({}/{} votes)",
            summary.leader, summary.term, summary.votes_received, summary.total_nodes
        );
        self.notify(DistributorNotice::LeaderElected(summary));
    }

    fn notify(&self, notice: DistributorNotice) {
        // No receivers is fine
        let _ = self.notices.send(notice);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::ClusterDirectory;
    use crate::event::{EventType, StateChange, VoteRequest, VoteResponse};

    struct Harness {
        distributor: EventDistributor,
        inboxes: HashMap<NodeId, mpsc::UnboundedReceiver<ConsensusEvent>>,
    }

    fn harness(n: usize) -> Harness {
        let distributor = EventDistributor::new(ClusterDirectory::new().shared());
        let mut inboxes = HashMap::new();
        for i in 1..=n {
            let (tx, rx) = mpsc::unbounded_channel();
            let id = format!("n{}", i);
            distributor.connect(id.clone(), tx);
            inboxes.insert(id, rx);
        }
        Harness { distributor, inboxes }
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<ConsensusEvent>) -> Vec<ConsensusEvent> {
        let mut out = Vec::new();
        while let Ok(ev) = rx.try_recv() {
            out.push(ev);
        }
        out
    }

    fn request(candidate: &str, term: u64) -> ConsensusEvent {
        ConsensusEvent::new(
            candidate,
            term,
            EventKind::VoteRequest(VoteRequest {
                candidate_id: candidate.into(),
                last_log_index: 0,
                last_log_term: 0,
            }),
        )
    }

    fn grant(voter: &str, candidate: &str, term: u64) -> ConsensusEvent {
        ConsensusEvent::new(
            voter,
            term,
            EventKind::VoteResponse(VoteResponse {
                vote_id: format!("{}-{}-{}", voter, term, candidate),
                term,
                candidate_id: candidate.into(),
                voter_id: voter.into(),
                granted: true,
            }),
        )
    }

    #[test]
    fn test_vote_request_marks_candidate_and_relays() {
        let mut h = harness(3);
        h.distributor.handle_event(request("n1", 1));

        let dir = h.distributor.directory();
        assert_eq!(dir.read().get("n1").unwrap().role, Role::Candidate);
        assert_eq!(dir.read().get("n1").unwrap().term, 1);

        assert!(drain(h.inboxes.get_mut("n1").unwrap()).is_empty());
        assert_eq!(drain(h.inboxes.get_mut("n2").unwrap()).len(), 1);
        assert_eq!(drain(h.inboxes.get_mut("n3").unwrap()).len(), 1);
    }

    #[test]
    fn test_majority_synthesizes_single_leader_election() {
        let mut h = harness(3);
        let mut notices = h.distributor.subscribe();
        h.distributor.handle_event(request("n1", 1));
        h.distributor.handle_event(grant("n2", "n1", 1));
        h.distributor.handle_event(grant("n3", "n1", 1));

        let mut elected = 0;
        while let Ok(notice) = notices.try_recv() {
            if matches!(notice, DistributorNotice::LeaderElected(_)) {
                elected += 1;
            }
        }
        assert_eq!(elected, 1);

        // The candidate itself receives the synthesized election
        let to_n1 = drain(h.inboxes.get_mut("n1").unwrap());
        assert!(to_n1
            .iter()
            .any(|e| e.event_type() == EventType::LeaderElection));

        let summary = h.distributor.last_election().unwrap();
        assert_eq!(summary.leader, "n1");
        assert_eq!(summary.votes_received, 3);
        assert!(h.distributor.vote_sets().is_empty());
        assert_eq!(h.distributor.metrics().total_elections, 1);
        assert_eq!(
            h.distributor.directory().read().get("n2").unwrap().role,
            Role::Follower
        );
    }

    #[test]
    fn test_heartbeat_marks_leader() {
        let h = harness(2);
        let heartbeat = ConsensusEvent::new(
            "n2",
            3,
            EventKind::Heartbeat(crate::event::AppendEntries {
                leader_id: "n2".into(),
                prev_log_index: 0,
                prev_log_term: 0,
                entries: vec![],
                leader_commit: 0,
            }),
        );
        h.distributor.handle_event(heartbeat);
        let dir = h.distributor.directory();
        assert_eq!(dir.read().get("n2").unwrap().role, Role::Leader);
        assert_eq!(h.distributor.metrics().current_term, 3);
        assert_eq!(h.distributor.metrics().events_relayed, 1);
    }

    #[test]
    fn test_state_change_updates_role() {
        let h = harness(2);
        h.distributor.handle_event(ConsensusEvent::new(
            "n1",
            2,
            EventKind::StateChange(StateChange {
                previous_state: Role::Follower,
                new_state: Role::Candidate,
                reason: "election timeout".into(),
            }),
        ));
        let dir = h.distributor.directory();
        assert_eq!(dir.read().get("n1").unwrap().role, Role::Candidate);
    }

    #[test]
    fn test_malformed_raw_event_is_dropped() {
        let h = harness(2);
        let err = h
            .distributor
            .handle_raw(r#"{"type":"GOSSIP","nodeId":"n1","term":1,"timestamp":0,"payload":{}}"#)
            .unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
        assert_eq!(h.distributor.metrics().events_relayed, 0);
    }

    #[test]
    fn test_disconnect_removes_node() {
        let h = harness(3);
        let mut notices = h.distributor.subscribe();
        h.distributor.disconnect("n3");

        assert_eq!(h.distributor.connected_nodes(), vec!["n1".to_string(), "n2".to_string()]);
        assert!(!h.distributor.directory().read().contains("n3"));
        assert_eq!(
            notices.try_recv().unwrap(),
            DistributorNotice::Disconnected("n3".into())
        );
        assert!(h.distributor.send_to("n3", request("n1", 1)).is_err());
    }

    #[test]
    fn test_stale_connection_does_not_drop_reconnected_node() {
        let mut h = harness(2);
        let (old_tx, _old_rx) = mpsc::unbounded_channel();
        h.distributor.connect("n3", old_tx.clone());
        let (new_tx, new_rx) = mpsc::unbounded_channel();
        h.distributor.connect("n3", new_tx.clone());
        h.inboxes.insert("n3".into(), new_rx);

        assert!(!h.distributor.disconnect_connection("n3", &old_tx));
        assert_eq!(h.distributor.connection_count(), 3);
        assert!(h.distributor.directory().read().contains("n3"));
        h.distributor.send_to("n3", request("n1", 1)).unwrap();
        assert_eq!(drain(h.inboxes.get_mut("n3").unwrap()).len(), 1);

        assert!(h.distributor.disconnect_connection("n3", &new_tx));
        assert_eq!(h.distributor.connection_count(), 2);
        assert!(!h.distributor.directory().read().contains("n3"));
    }

    #[test]
    fn test_late_grants_raise_summary_but_not_relayed_tally() {
        let mut h = harness(5);
        h.distributor.handle_event(request("n1", 1));
        for voter in ["n2", "n3", "n4", "n5"] {
            h.distributor.handle_event(grant(voter, "n1", 1));
        }

        let relayed: Vec<usize> = drain(h.inboxes.get_mut("n4").unwrap())
            .into_iter()
            .filter_map(|e| match e.kind {
                EventKind::LeaderElection(elected) => Some(elected.votes_received),
                _ => None,
            })
            .collect();
        assert_eq!(relayed, vec![3]);
        assert_eq!(h.distributor.last_election().unwrap().votes_received, 5);
    }
}
