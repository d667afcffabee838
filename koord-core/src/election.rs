//! Raft-style leader election.
//!
//! Implements leader election with:
//! - State machine: Follower → Candidate → Leader
//! - Randomized election timeout and fixed heartbeat interval
//! - Term-based voting, at most one granted vote per term
//! - AppendEntries with log matching, backed by [`ReplicatedLog`]
//!
//! [`ElectionCore`] is a synchronous state machine. It never sleeps or sends;
//! every operation queues [`Effect`]s that the owning actor
//! ([`crate::node::ElectionNode`]) turns into transport sends and timer
//! re-arms.

use crate::config::ElectionConfig;
use crate::directory::NodeRecord;
use crate::error::{Error, Result};
use crate::event::{
    AppendEntries, AppendEntriesResponse, ConsensusAchieved, ConsensusEvent, EventKind,
    LeaderElection, StateChange, VoteRequest, VoteResponse,
};
use crate::log::{EntryType, LogEntry, ReplicatedLog};
use crate::types::{majority, NodeId, Role};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashSet;
use std::time::Instant;
use tracing::{debug, info};

/// State that must survive restarts
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistentState {
    /// Current term (monotonically increasing)
    pub current_term: u64,
    /// Node we voted for in current term
    pub voted_for: Option<NodeId>,
}

/// Action requested by the state machine
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    Send { to: NodeId, event: ConsensusEvent },
    Broadcast(ConsensusEvent),
    ResetElectionTimer,
    StartHeartbeats,
    StopHeartbeats,
    Persist(JournalRecord),
}

/// Change that has to reach durable storage
#[derive(Debug, Clone, PartialEq)]
pub enum JournalRecord {
    Term(PersistentState),
    /// Entries written to the log; later indices are superseded
    Entries(Vec<LogEntry>),
    Commit(u64),
}

/// Per-node leader election state machine
pub struct ElectionCore {
    node_id: NodeId,
    config: ElectionConfig,
    persistent: PersistentState,
    /// Last persistent state handed out as a journal record
    journaled: PersistentState,
    role: Role,
    leader_id: Option<NodeId>,
    /// Granted votes in the current candidacy (includes self)
    votes_received: HashSet<NodeId>,
    /// Other cluster members
    peers: Vec<NodeId>,
    log: ReplicatedLog,
    last_heartbeat: Option<Instant>,
    effects: Vec<Effect>,
}

impl ElectionCore {
    pub fn new(node_id: impl Into<NodeId>, peers: Vec<NodeId>, config: ElectionConfig) -> Self {
        let node_id = node_id.into();
        let peers = peers.into_iter().filter(|p| *p != node_id).collect();
        Self {
            node_id,
            config,
            persistent: PersistentState::default(),
            journaled: PersistentState::default(),
            role: Role::Follower,
            leader_id: None,
            votes_received: HashSet::new(),
            peers,
            log: ReplicatedLog::new(),
            last_heartbeat: None,
            effects: Vec::new(),
        }
    }

    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    pub fn config(&self) -> &ElectionConfig {
        &self.config
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn term(&self) -> u64 {
        self.persistent.current_term
    }

    pub fn leader(&self) -> Option<&NodeId> {
        self.leader_id.as_ref()
    }

    pub fn voted_for(&self) -> Option<&NodeId> {
        self.persistent.voted_for.as_ref()
    }

    pub fn is_leader(&self) -> bool {
        self.role == Role::Leader
    }

    pub fn peers(&self) -> &[NodeId] {
        &self.peers
    }

    /// Members including ourselves
    pub fn cluster_size(&self) -> usize {
        self.peers.len() + 1
    }

    pub fn log(&self) -> &ReplicatedLog {
        &self.log
    }

    pub fn last_heartbeat(&self) -> Option<Instant> {
        self.last_heartbeat
    }

    /// Load persistent state (called on startup)
    pub fn load_persistent_state(&mut self, state: PersistentState) {
        self.journaled = state.clone();
        self.persistent = state;
        self.log.set_term(self.persistent.current_term);
    }

    /// Replace the log with one recovered from storage
    pub fn restore_log(&mut self, log: ReplicatedLog) {
        self.log = log;
        self.log.set_term(self.persistent.current_term);
    }

    pub fn persistent_state(&self) -> &PersistentState {
        &self.persistent
    }

    /// Observed state of this node
    pub fn snapshot(&self) -> NodeRecord {
        let mut record = NodeRecord::new(self.node_id.clone());
        record.role = self.role;
        record.term = self.persistent.current_term;
        record.last_activity = Utc::now();
        record
    }

    /// Take the effects queued so far
    pub fn drain_effects(&mut self) -> Vec<Effect> {
        if self.persistent != self.journaled {
            self.journaled = self.persistent.clone();
            let record = JournalRecord::Term(self.journaled.clone());
            self.effects.insert(0, Effect::Persist(record));
        }
        std::mem::take(&mut self.effects)
    }

    /// Replace the peer set (membership change)
    pub fn set_peers(&mut self, peers: Vec<NodeId>) {
        let peers: Vec<NodeId> = peers.into_iter().filter(|p| *p != self.node_id).collect();
        if self.role == Role::Leader {
            for old in &self.peers {
                if !peers.contains(old) {
                    self.log.remove_follower(old);
                }
            }
            for new in &peers {
                self.log.add_follower(new);
            }
        }
        debug!("Election: Peer set is now {:?}", peers);
        self.peers = peers;
    }

    /// Election timer fired
    pub fn on_election_timeout(&mut self) -> Vec<Effect> {
        if self.role != Role::Leader {
            self.start_election();
        }
        self.drain_effects()
    }

    /// Heartbeat timer fired
    pub fn on_heartbeat_tick(&mut self) -> Vec<Effect> {
        if self.role == Role::Leader {
            self.replicate();
        }
        self.drain_effects()
    }

    /// Process one inbound event to completion
    pub fn handle_event(&mut self, event: ConsensusEvent) -> Vec<Effect> {
        if event.node_id == self.node_id {
            return Vec::new();
        }

        match &event.kind {
            EventKind::VoteRequest(req) => {
                let response = self.handle_vote_request(event.term, req);
                let reply = ConsensusEvent::new(
                    self.node_id.clone(),
                    self.persistent.current_term,
                    EventKind::VoteResponse(response),
                );
                self.effects.push(Effect::Send {
                    to: req.candidate_id.clone(),
                    event: reply,
                });
            }
            EventKind::VoteResponse(resp) => {
                self.observe_term(event.term.max(resp.term));
                self.handle_vote_response(resp);
            }
            EventKind::Heartbeat(req) | EventKind::AppendEntries(req) => {
                let response = self.handle_append_entries(event.term, req);
                let reply = ConsensusEvent::new(
                    self.node_id.clone(),
                    self.persistent.current_term,
                    EventKind::AppendEntriesResponse(response),
                );
                self.effects.push(Effect::Send {
                    to: req.leader_id.clone(),
                    event: reply,
                });
            }
            EventKind::AppendEntriesResponse(resp) => {
                self.observe_term(event.term.max(resp.term));
                self.handle_append_entries_response(resp);
            }
            EventKind::LeaderElection(elected) => {
                self.observe_term(event.term);
                if event.term == self.persistent.current_term
                    && elected.new_leader_id != self.node_id
                    && self.role != Role::Leader
                {
                    self.leader_id = Some(elected.new_leader_id.clone());
                }
            }
            EventKind::StateChange(_) | EventKind::ConsensusAchieved(_) => {
                self.observe_term(event.term);
            }
        }

        self.drain_effects()
    }

    /// Fails with [`Error::StaleTerm`] when `term` is behind ours
    pub fn check_term(&self, term: u64) -> Result<()> {
        if term < self.persistent.current_term {
            return Err(Error::StaleTerm {
                current: self.persistent.current_term,
                received: term,
            });
        }
        Ok(())
    }

    /// RequestVote RPC. Stale terms are rejected without mutation; a newer
    /// term is adopted (and the vote cleared) before the grant is evaluated.
    pub fn handle_vote_request(&mut self, term: u64, req: &VoteRequest) -> VoteResponse {
        if let Err(e) = self.check_term(term) {
            debug!("Election: Rejecting vote for {}: {}", req.candidate_id, e);
            return self.vote_response(&req.candidate_id, false);
        }

        self.observe_term(term);

        let can_vote = self.persistent.voted_for.is_none()
            || self.persistent.voted_for.as_ref() == Some(&req.candidate_id);

        let log_ok = req.last_log_term > self.log.last_term()
            || (req.last_log_term == self.log.last_term()
                && req.last_log_index >= self.log.last_index());

        let granted = can_vote && log_ok;

        if granted {
            self.persistent.voted_for = Some(req.candidate_id.clone());
            self.effects.push(Effect::ResetElectionTimer);
            info!(
                "Election: Granting vote to {} for term {}",
                req.candidate_id, term
            );
        } else {
            debug!(
                "Election: Rejecting vote for {} (can_vote={}, log_ok={})",
                req.candidate_id, can_vote, log_ok
            );
        }

        self.vote_response(&req.candidate_id, granted)
    }

    /// AppendEntries / heartbeat RPC
    pub fn handle_append_entries(&mut self, term: u64, req: &AppendEntries) -> AppendEntriesResponse {
        if let Err(e) = self.check_term(term) {
            debug!("Election: Rejecting entries from {}: {}", req.leader_id, e);
            return AppendEntriesResponse {
                term: self.persistent.current_term,
                follower_id: self.node_id.clone(),
                success: false,
                match_index: self.log.last_index(),
            };
        }

        self.observe_term(term);

        if self.role != Role::Follower {
            self.become_follower(format!("append entries from {}", req.leader_id));
        }

        if self.leader_id.as_ref() != Some(&req.leader_id) {
            info!(
                "Election: Recognized {} as leader for term {}",
                req.leader_id, term
            );
            self.leader_id = Some(req.leader_id.clone());
        }

        self.last_heartbeat = Some(Instant::now());
        self.effects.push(Effect::ResetElectionTimer);

        let outcome = self.log.handle_append_entries(req);
        if !outcome.appended.is_empty() {
            self.effects
                .push(Effect::Persist(JournalRecord::Entries(outcome.appended)));
        }
        if !outcome.applied.is_empty() {
            self.effects
                .push(Effect::Persist(JournalRecord::Commit(self.log.commit_index())));
        }

        AppendEntriesResponse {
            term: self.persistent.current_term,
            follower_id: self.node_id.clone(),
            success: outcome.success,
            match_index: outcome.match_index,
        }
    }

    /// Submit a command; only the leader accepts
    pub fn submit(&mut self, key: String, value: serde_json::Value) -> Result<LogEntry> {
        if self.role != Role::Leader {
            return Err(Error::NotLeader {
                leader: self.leader_id.clone(),
            });
        }

        let entry = self.log.append(key, value);
        self.effects
            .push(Effect::Persist(JournalRecord::Entries(vec![entry.clone()])));
        if self.peers.is_empty() {
            let applied = self.log.commit_single_node();
            self.announce_committed(applied);
        } else {
            self.replicate();
        }
        Ok(entry)
    }

    fn vote_response(&self, candidate_id: &NodeId, granted: bool) -> VoteResponse {
        VoteResponse {
            vote_id: format!(
                "{}-{}-{}",
                self.node_id, self.persistent.current_term, candidate_id
            ),
            term: self.persistent.current_term,
            candidate_id: candidate_id.clone(),
            voter_id: self.node_id.clone(),
            granted,
        }
    }

    fn handle_vote_response(&mut self, resp: &VoteResponse) {
        if self.role != Role::Candidate
            || resp.term != self.persistent.current_term
            || resp.candidate_id != self.node_id
        {
            return;
        }

        if resp.granted {
            self.votes_received.insert(resp.voter_id.clone());
            info!(
                "Election: Received vote from {} ({}/{} votes)",
                resp.voter_id,
                self.votes_received.len(),
                self.cluster_size()
            );

            if self.votes_received.len() >= majority(self.cluster_size()) {
                self.become_leader();
            }
        }
    }

    fn handle_append_entries_response(&mut self, resp: &AppendEntriesResponse) {
        if self.role != Role::Leader || resp.term != self.persistent.current_term {
            return;
        }
        let applied = self.log.handle_append_entries_response(resp);
        self.announce_committed(applied);
    }

    /// Adopt a newer term, stepping down to follower
    fn observe_term(&mut self, term: u64) {
        if term > self.persistent.current_term {
            debug!(
                "Election: Received higher term {} (current: {}), stepping down",
                term, self.persistent.current_term
            );
            self.step_down(term);
        }
    }

    fn start_election(&mut self) {
        self.persistent.current_term += 1;
        self.persistent.voted_for = Some(self.node_id.clone());
        self.log.set_term(self.persistent.current_term);
        self.leader_id = None;
        self.votes_received.clear();
        self.votes_received.insert(self.node_id.clone());

        info!(
            "Election: Starting election for term {} (was {})",
            self.persistent.current_term, self.role
        );

        if self.role != Role::Candidate {
            self.transition(Role::Candidate, "election timeout".to_string());
        }
        self.effects.push(Effect::ResetElectionTimer);

        let request = ConsensusEvent::new(
            self.node_id.clone(),
            self.persistent.current_term,
            EventKind::VoteRequest(VoteRequest {
                candidate_id: self.node_id.clone(),
                last_log_index: self.log.last_index(),
                last_log_term: self.log.last_term(),
            }),
        );
        self.effects.push(Effect::Broadcast(request));

        if self.votes_received.len() >= majority(self.cluster_size()) {
            self.become_leader();
        }
    }

    fn become_leader(&mut self) {
        info!(
            "Election: Won election for term {} with {}/{} votes",
            self.persistent.current_term,
            self.votes_received.len(),
            self.cluster_size()
        );

        self.transition(Role::Leader, "won election".to_string());
        self.leader_id = Some(self.node_id.clone());
        let noop = self.log.init_leader(&self.peers);
        self.effects
            .push(Effect::Persist(JournalRecord::Entries(vec![noop])));

        let elected = ConsensusEvent::new(
            self.node_id.clone(),
            self.persistent.current_term,
            EventKind::LeaderElection(LeaderElection {
                new_leader_id: self.node_id.clone(),
                votes_received: self.votes_received.len(),
                total_nodes: self.cluster_size(),
            }),
        );
        self.effects.push(Effect::Broadcast(elected));
        self.effects.push(Effect::StartHeartbeats);

        if self.peers.is_empty() {
            let applied = self.log.commit_single_node();
            self.announce_committed(applied);
        } else {
            self.replicate();
        }
    }

    fn become_follower(&mut self, reason: String) {
        let was_leader = self.role == Role::Leader;
        self.votes_received.clear();
        self.transition(Role::Follower, reason);
        if was_leader {
            self.effects.push(Effect::StopHeartbeats);
        }
    }

    fn step_down(&mut self, new_term: u64) {
        self.persistent.current_term = new_term;
        self.persistent.voted_for = None;
        self.log.set_term(new_term);
        self.votes_received.clear();
        if self.role != Role::Follower {
            info!(
                "Election: Stepped down from {} to Follower (term {})",
                self.role, new_term
            );
            self.leader_id = None;
            self.become_follower(format!("observed term {}", new_term));
        }
        self.effects.push(Effect::ResetElectionTimer);
    }

    fn transition(&mut self, new_state: Role, reason: String) {
        let previous_state = self.role;
        self.role = new_state;
        let change = ConsensusEvent::new(
            self.node_id.clone(),
            self.persistent.current_term,
            EventKind::StateChange(StateChange {
                previous_state,
                new_state,
                reason,
            }),
        );
        self.effects.push(Effect::Broadcast(change));
    }

    /// Queue AppendEntries (or an empty heartbeat) for every follower
    fn replicate(&mut self) {
        for peer in self.peers.clone() {
            let body = match self
                .log
                .append_entries_for(&self.node_id, &peer, self.config.max_batch_size)
            {
                Some(body) => body,
                None => continue,
            };
            let kind = if body.entries.is_empty() {
                EventKind::Heartbeat(body)
            } else {
                EventKind::AppendEntries(body)
            };
            self.effects.push(Effect::Send {
                to: peer,
                event: ConsensusEvent::new(self.node_id.clone(), self.persistent.current_term, kind),
            });
        }
    }

    fn announce_committed(&mut self, applied: Vec<LogEntry>) {
        if !applied.is_empty() {
            self.effects
                .push(Effect::Persist(JournalRecord::Commit(self.log.commit_index())));
        }
        for entry in applied {
            if entry.entry_type != EntryType::Data {
                continue;
            }
            let mut participating_nodes = vec![self.node_id.clone()];
            participating_nodes.extend(self.log.replicas_of(entry.index));
            let event = ConsensusEvent::new(
                self.node_id.clone(),
                self.persistent.current_term,
                EventKind::ConsensusAchieved(ConsensusAchieved {
                    decision: json!({ "key": entry.key, "value": entry.value }),
                    log_index: entry.index,
                    participating_nodes,
                }),
            );
            self.effects.push(Effect::Broadcast(event));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventType;

    fn core(id: &str, peers: &[&str]) -> ElectionCore {
        ElectionCore::new(
            id,
            peers.iter().map(|p| p.to_string()).collect(),
            ElectionConfig::default(),
        )
    }

    fn vote_request(candidate: &str, term: u64, last_log_index: u64, last_log_term: u64) -> ConsensusEvent {
        ConsensusEvent::new(
            candidate,
            term,
            EventKind::VoteRequest(VoteRequest {
                candidate_id: candidate.to_string(),
                last_log_index,
                last_log_term,
            }),
        )
    }

    fn grant(voter: &str, candidate: &str, term: u64) -> ConsensusEvent {
        ConsensusEvent::new(
            voter,
            term,
            EventKind::VoteResponse(VoteResponse {
                vote_id: format!("{}-{}", voter, term),
                term,
                candidate_id: candidate.to_string(),
                voter_id: voter.to_string(),
                granted: true,
            }),
        )
    }

    fn broadcasts(effects: &[Effect], event_type: EventType) -> Vec<ConsensusEvent> {
        effects
            .iter()
            .filter_map(|e| match e {
                Effect::Broadcast(ev) if ev.event_type() == event_type => Some(ev.clone()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_election_starts_as_follower() {
        let election = core("node1", &["node2", "node3"]);
        assert_eq!(election.role(), Role::Follower);
        assert_eq!(election.term(), 0);
        assert_eq!(election.snapshot().role, Role::Follower);
    }

    #[test]
    fn test_timeout_starts_candidacy() {
        let mut election = core("node1", &["node2", "node3"]);
        let effects = election.on_election_timeout();

        assert_eq!(election.role(), Role::Candidate);
        assert_eq!(election.term(), 1);
        assert_eq!(election.voted_for(), Some(&"node1".to_string()));
        assert!(effects.contains(&Effect::ResetElectionTimer));
        assert_eq!(broadcasts(&effects, EventType::VoteRequest).len(), 1);
        assert_eq!(broadcasts(&effects, EventType::StateChange).len(), 1);
    }

    #[test]
    fn test_request_vote_grants_on_first_request() {
        let mut election = core("node1", &["node2", "node3"]);
        let req = VoteRequest {
            candidate_id: "node2".into(),
            last_log_index: 0,
            last_log_term: 0,
        };
        let response = election.handle_vote_request(1, &req);
        assert!(response.granted);
        assert_eq!(response.term, 1);
    }

    #[test]
    fn test_one_vote_per_term() {
        let mut election = core("node1", &["node2", "node3"]);
        let req2 = VoteRequest {
            candidate_id: "node2".into(),
            last_log_index: 0,
            last_log_term: 0,
        };
        let req3 = VoteRequest {
            candidate_id: "node3".into(),
            ..req2.clone()
        };
        assert!(election.handle_vote_request(1, &req2).granted);
        assert!(!election.handle_vote_request(1, &req3).granted);
        // Repeated request from the same candidate is still granted
        assert!(election.handle_vote_request(1, &req2).granted);
        // A new term clears the vote
        assert!(election.handle_vote_request(2, &req3).granted);
    }

    #[test]
    fn test_request_vote_rejects_stale_term() {
        let mut election = core("node1", &["node2"]);
        election.load_persistent_state(PersistentState {
            current_term: 5,
            voted_for: None,
        });

        let req = VoteRequest {
            candidate_id: "node2".into(),
            last_log_index: 0,
            last_log_term: 0,
        };
        assert!(matches!(
            election.check_term(3),
            Err(Error::StaleTerm { current: 5, received: 3 })
        ));
        assert!(election.check_term(5).is_ok());

        let response = election.handle_vote_request(3, &req);
        assert!(!response.granted);
        assert_eq!(response.term, 5);
        assert_eq!(election.voted_for(), None);
        assert!(election.drain_effects().is_empty());
    }

    #[test]
    fn test_rejects_candidate_with_older_log() {
        let mut election = core("node1", &["node2"]);
        election.load_persistent_state(PersistentState {
            current_term: 2,
            voted_for: None,
        });
        election.handle_append_entries(
            2,
            &AppendEntries {
                leader_id: "node3".into(),
                prev_log_index: 0,
                prev_log_term: 0,
                entries: vec![LogEntry::new_data(1, 2, "k".into(), json!(1))],
                leader_commit: 0,
            },
        );

        let req = VoteRequest {
            candidate_id: "node2".into(),
            last_log_index: 5,
            last_log_term: 1,
        };
        assert!(!election.handle_vote_request(3, &req).granted);
        // Term was still adopted
        assert_eq!(election.term(), 3);
    }

    #[test]
    fn test_majority_makes_leader() {
        let mut election = core("node1", &["node2", "node3", "node4", "node5"]);
        election.on_election_timeout();

        let effects = election.handle_event(grant("node2", "node1", 1));
        assert_eq!(election.role(), Role::Candidate);
        assert!(broadcasts(&effects, EventType::LeaderElection).is_empty());

        let effects = election.handle_event(grant("node3", "node1", 1));
        assert_eq!(election.role(), Role::Leader);
        let elected = broadcasts(&effects, EventType::LeaderElection);
        assert_eq!(elected.len(), 1);
        match &elected[0].kind {
            EventKind::LeaderElection(e) => {
                assert_eq!(e.new_leader_id, "node1");
                assert_eq!(e.votes_received, 3);
                assert_eq!(e.total_nodes, 5);
            }
            other => panic!("Expected LeaderElection, got {:?}", other),
        }
        assert!(effects.contains(&Effect::StartHeartbeats));

        // Late grants do not elect twice
        let effects = election.handle_event(grant("node4", "node1", 1));
        assert!(broadcasts(&effects, EventType::LeaderElection).is_empty());
    }

    #[test]
    fn test_single_node_elects_itself() {
        let mut election = core("solo", &[]);
        election.on_election_timeout();
        assert!(election.is_leader());

        let entry = election.submit("k".into(), json!("v")).unwrap();
        assert_eq!(election.log().commit_index(), entry.index);
        assert_eq!(election.log().state().get("k"), Some(&json!("v")));
    }

    #[test]
    fn test_higher_term_steps_leader_down() {
        let mut election = core("node1", &["node2", "node3"]);
        election.on_election_timeout();
        election.handle_event(grant("node2", "node1", 1));
        assert!(election.is_leader());

        let effects = election.handle_event(vote_request("node3", 4, 1, 1));
        assert_eq!(election.role(), Role::Follower);
        assert_eq!(election.term(), 4);
        assert_eq!(election.voted_for(), Some(&"node3".to_string()));
        assert!(effects.contains(&Effect::StopHeartbeats));
    }

    #[test]
    fn test_heartbeat_makes_candidate_follow() {
        let mut election = core("node1", &["node2", "node3"]);
        election.on_election_timeout();
        assert_eq!(election.role(), Role::Candidate);

        let heartbeat = AppendEntries {
            leader_id: "node2".into(),
            prev_log_index: 0,
            prev_log_term: 0,
            entries: vec![],
            leader_commit: 0,
        };
        let resp = election.handle_append_entries(1, &heartbeat);
        assert!(resp.success);
        assert_eq!(election.role(), Role::Follower);
        assert_eq!(election.leader(), Some(&"node2".to_string()));
        assert!(election.last_heartbeat().is_some());
    }

    #[test]
    fn test_stale_append_entries_rejected_without_mutation() {
        let mut election = core("node1", &["node2"]);
        election.load_persistent_state(PersistentState {
            current_term: 3,
            voted_for: Some("node1".into()),
        });
        let resp = election.handle_append_entries(
            2,
            &AppendEntries {
                leader_id: "node2".into(),
                prev_log_index: 0,
                prev_log_term: 0,
                entries: vec![],
                leader_commit: 0,
            },
        );
        assert!(!resp.success);
        assert_eq!(resp.term, 3);
        assert_eq!(election.leader(), None);
        assert!(election.drain_effects().is_empty());
    }

    #[test]
    fn test_submit_requires_leadership() {
        let mut election = core("node1", &["node2"]);
        let err = election.submit("k".into(), json!(1)).unwrap_err();
        assert!(matches!(err, Error::NotLeader { leader: None }));
    }

    fn journal(effects: &[Effect]) -> Vec<JournalRecord> {
        effects
            .iter()
            .filter_map(|e| match e {
                Effect::Persist(record) => Some(record.clone()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_journal_records_term_entries_and_commit() {
        let mut election = core("solo", &[]);
        let effects = election.on_election_timeout();
        let records = journal(&effects);
        assert_eq!(
            records[0],
            JournalRecord::Term(PersistentState {
                current_term: 1,
                voted_for: Some("solo".into()),
            })
        );
        assert!(matches!(&records[1], JournalRecord::Entries(e) if e[0].entry_type == EntryType::Noop));
        assert_eq!(records[2], JournalRecord::Commit(1));

        let entry = election.submit("k".into(), json!("v")).unwrap();
        let records = journal(&election.drain_effects());
        assert_eq!(
            records,
            vec![
                JournalRecord::Entries(vec![entry.clone()]),
                JournalRecord::Commit(entry.index),
            ]
        );
    }

    #[test]
    fn test_follower_journals_written_entries_only() {
        let mut election = core("node1", &["node2"]);
        let body = AppendEntries {
            leader_id: "node2".into(),
            prev_log_index: 0,
            prev_log_term: 0,
            entries: vec![
                LogEntry::new_data(1, 1, "a".into(), json!(1)),
                LogEntry::new_data(2, 1, "b".into(), json!(2)),
            ],
            leader_commit: 1,
        };
        let resp = election.handle_append_entries(1, &body);
        assert_eq!(resp.match_index, 2);
        let records = journal(&election.drain_effects());
        assert_eq!(records.len(), 3);
        assert!(matches!(&records[0], JournalRecord::Term(state) if state.current_term == 1));
        assert!(matches!(&records[1], JournalRecord::Entries(e) if e.len() == 2));
        assert_eq!(records[2], JournalRecord::Commit(1));

        // Resending the same entries writes nothing new
        election.handle_append_entries(1, &body);
        assert!(journal(&election.drain_effects()).is_empty());
    }

    #[test]
    fn test_leader_replicates_and_announces_commit() {
        let mut leader = core("node1", &["node2", "node3"]);
        leader.on_election_timeout();
        leader.handle_event(grant("node2", "node1", 1));
        leader.drain_effects();

        leader.submit("mode".into(), json!("eco")).unwrap();
        let effects = leader.drain_effects();
        let sends: Vec<_> = effects
            .iter()
            .filter(|e| matches!(e, Effect::Send { .. }))
            .collect();
        assert_eq!(sends.len(), 2);

        let ack = ConsensusEvent::new(
            "node2",
            1,
            EventKind::AppendEntriesResponse(AppendEntriesResponse {
                term: 1,
                follower_id: "node2".into(),
                success: true,
                match_index: leader.log().last_index(),
            }),
        );
        let effects = leader.handle_event(ack);
        let achieved = broadcasts(&effects, EventType::ConsensusAchieved);
        assert_eq!(achieved.len(), 1);
        assert_eq!(leader.log().state().get("mode"), Some(&json!("eco")));
    }
}
