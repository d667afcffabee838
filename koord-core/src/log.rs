//! Raft-style replicated log.
//!
//! Implements:
//! - AppendEntries log matching (prevLogIndex / prevLogTerm)
//! - Conflict truncation on term mismatch
//! - Commit index tracking with majority match on the leader
//! - Application of committed entries to a key/value state machine

use crate::event::{AppendEntries, AppendEntriesResponse};
use crate::types::{majority, unix_timestamp_ms, NodeId};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Instant;
use tracing::{debug, info};

/// Maximum entries per AppendEntries batch
pub const MAX_BATCH_SIZE: usize = 8;

/// Log entry types
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum EntryType {
    /// Command submitted by a client
    Data,
    /// Membership change
    Config,
    /// No-op appended by a new leader
    Noop,
}

/// Single log entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogEntry {
    /// Index in the log (1-based, 0 = empty log)
    pub index: u64,
    /// Term when entry was created
    pub term: u64,
    pub entry_type: EntryType,
    pub key: String,
    pub value: serde_json::Value,
    /// Unix milliseconds
    pub timestamp: u64,
}

impl LogEntry {
    pub fn new_data(index: u64, term: u64, key: String, value: serde_json::Value) -> Self {
        Self {
            index,
            term,
            entry_type: EntryType::Data,
            key,
            value,
            timestamp: unix_timestamp_ms(),
        }
    }

    pub fn new_noop(index: u64, term: u64) -> Self {
        Self {
            index,
            term,
            entry_type: EntryType::Noop,
            key: String::new(),
            value: serde_json::Value::Null,
            timestamp: unix_timestamp_ms(),
        }
    }

    pub fn new_config(index: u64, term: u64, key: String, value: serde_json::Value) -> Self {
        Self {
            index,
            term,
            entry_type: EntryType::Config,
            key,
            value,
            timestamp: unix_timestamp_ms(),
        }
    }
}

/// Replication state for a single follower (leader-side)
/// Result of a follower applying one AppendEntries request
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AppendOutcome {
    pub success: bool,
    /// Highest index known to match the leader (on rejection, the hint for
    /// the leader's back-off)
    pub match_index: u64,
    /// Entries written to the log by this call
    pub appended: Vec<LogEntry>,
    /// Entries newly applied to the state machine
    pub applied: Vec<LogEntry>,
}

impl AppendOutcome {
    fn rejected(last_index: u64) -> Self {
        Self {
            success: false,
            match_index: last_index,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone)]
pub struct FollowerState {
    /// Next index to send to this follower
    pub next_index: u64,
    /// Highest index known to be replicated
    pub match_index: u64,
    pub last_contact: Instant,
}

/// Replicated log with Raft semantics
pub struct ReplicatedLog {
    /// Entries; position 0 holds a sentinel so positions equal indices
    entries: Vec<LogEntry>,
    commit_index: u64,
    last_applied: u64,
    /// Term of the owning node (kept in sync by the election core)
    current_term: u64,
    /// State machine (key-value store)
    state: HashMap<String, serde_json::Value>,
    /// Follower replication state (leader only)
    followers: HashMap<NodeId, FollowerState>,
}

impl Default for ReplicatedLog {
    fn default() -> Self {
        Self::new()
    }
}

impl ReplicatedLog {
    pub fn new() -> Self {
        Self {
            entries: vec![LogEntry::new_noop(0, 0)],
            commit_index: 0,
            last_applied: 0,
            current_term: 0,
            state: HashMap::new(),
            followers: HashMap::new(),
        }
    }

    /// Rebuild a log from recovered entries (indices must be contiguous from 1)
    pub fn restore(entries: Vec<LogEntry>, commit_index: u64) -> Self {
        let mut log = Self::new();
        for entry in entries {
            if entry.index == log.last_index() + 1 {
                log.entries.push(entry);
            }
        }
        log.current_term = log.last_term();
        log.commit_index = commit_index.min(log.last_index());
        log.apply_committed();
        log
    }

    pub fn last_index(&self) -> u64 {
        self.entries.last().map(|e| e.index).unwrap_or(0)
    }

    pub fn last_term(&self) -> u64 {
        self.entries.last().map(|e| e.term).unwrap_or(0)
    }

    pub fn commit_index(&self) -> u64 {
        self.commit_index
    }

    pub fn last_applied(&self) -> u64 {
        self.last_applied
    }

    /// Applied key/value state
    pub fn state(&self) -> &HashMap<String, serde_json::Value> {
        &self.state
    }

    pub fn set_term(&mut self, term: u64) {
        self.current_term = term;
    }

    pub fn get_entry(&self, index: u64) -> Option<&LogEntry> {
        if index == 0 {
            return None;
        }
        self.entries.get(index as usize)
    }

    /// Term at index (0 for the empty prefix)
    pub fn term_at(&self, index: u64) -> Option<u64> {
        if index == 0 {
            return Some(0);
        }
        self.get_entry(index).map(|e| e.term)
    }

    /// Entries from `from` (inclusive) to the end
    pub fn entries_from(&self, from: u64) -> &[LogEntry] {
        let start = (from.max(1) as usize).min(self.entries.len());
        &self.entries[start..]
    }

    /// Append a new data entry (leader only)
    pub fn append(&mut self, key: String, value: serde_json::Value) -> LogEntry {
        let index = self.last_index() + 1;
        let entry = LogEntry::new_data(index, self.current_term, key, value);
        self.entries.push(entry.clone());
        debug!("Log: Appended entry {} (term {})", index, self.current_term);
        entry
    }

    /// Reset follower tracking and append the term's no-op, which is returned
    pub fn init_leader(&mut self, peers: &[NodeId]) -> LogEntry {
        self.followers.clear();
        let next = self.last_index() + 1;
        for peer in peers {
            self.followers.insert(
                peer.clone(),
                FollowerState {
                    next_index: next,
                    match_index: 0,
                    last_contact: Instant::now(),
                },
            );
        }

        // No-op lets entries from previous terms commit
        let noop = LogEntry::new_noop(next, self.current_term);
        self.entries.push(noop.clone());
        noop
    }

    /// Track a follower that joined after the election
    pub fn add_follower(&mut self, peer: &NodeId) {
        let next = self.last_index() + 1;
        self.followers.entry(peer.clone()).or_insert(FollowerState {
            next_index: next,
            match_index: 0,
            last_contact: Instant::now(),
        });
    }

    pub fn remove_follower(&mut self, peer: &str) {
        self.followers.remove(peer);
    }

    /// Build the AppendEntries body for one follower
    pub fn append_entries_for(
        &self,
        leader_id: &NodeId,
        follower_id: &NodeId,
        max_batch: usize,
    ) -> Option<AppendEntries> {
        let follower = self.followers.get(follower_id)?;

        let prev_log_index = follower.next_index.saturating_sub(1);
        let prev_log_term = self.term_at(prev_log_index).unwrap_or(0);

        let entries: Vec<LogEntry> = self
            .entries_from(follower.next_index)
            .iter()
            .take(max_batch)
            .cloned()
            .collect();

        Some(AppendEntries {
            leader_id: leader_id.clone(),
            prev_log_index,
            prev_log_term,
            entries,
            leader_commit: self.commit_index,
        })
    }

    /// Follower side of AppendEntries. The caller has already rejected stale
    /// terms.
    pub fn handle_append_entries(&mut self, req: &AppendEntries) -> AppendOutcome {
        if req.prev_log_index > 0 {
            match self.term_at(req.prev_log_index) {
                None => {
                    debug!(
                        "Log: Missing entry at {} (have up to {})",
                        req.prev_log_index,
                        self.last_index()
                    );
                    return AppendOutcome::rejected(self.last_index());
                }
                Some(t) if t != req.prev_log_term => {
                    debug!(
                        "Log: Term mismatch at {} (have {}, want {})",
                        req.prev_log_index, t, req.prev_log_term
                    );
                    self.truncate_from(req.prev_log_index);
                    return AppendOutcome::rejected(self.last_index());
                }
                _ => {}
            }
        }

        let mut appended = Vec::new();
        for entry in &req.entries {
            if entry.index > self.last_index() {
                if entry.index == self.last_index() + 1 {
                    self.entries.push(entry.clone());
                    appended.push(entry.clone());
                }
            } else if self.term_at(entry.index) != Some(entry.term) {
                self.truncate_from(entry.index);
                self.entries.push(entry.clone());
                appended.push(entry.clone());
            }
        }

        // Entries past the ones the leader just matched may be stale
        let match_index = req.prev_log_index + req.entries.len() as u64;
        let mut applied = Vec::new();
        let target = req.leader_commit.min(match_index);
        if target > self.commit_index {
            self.commit_index = target;
            applied = self.apply_committed();
        }

        debug!(
            "Log: AppendEntries success (match={}, commit={}, last={})",
            match_index,
            self.commit_index,
            self.last_index()
        );
        AppendOutcome {
            success: true,
            match_index,
            appended,
            applied,
        }
    }

    /// Leader side of AppendEntriesResponse. Returns newly applied entries.
    pub fn handle_append_entries_response(&mut self, resp: &AppendEntriesResponse) -> Vec<LogEntry> {
        let follower = match self.followers.get_mut(&resp.follower_id) {
            Some(f) => f,
            None => return Vec::new(),
        };
        follower.last_contact = Instant::now();

        if resp.success {
            follower.match_index = resp.match_index;
            follower.next_index = resp.match_index + 1;
            debug!(
                "Log: {} match_index={}, next_index={}",
                resp.follower_id, follower.match_index, follower.next_index
            );
            self.try_advance_commit()
        } else {
            // Back off to just past the follower's last entry, at least one step
            let fallback = follower.next_index.saturating_sub(1).max(1);
            follower.next_index = (resp.match_index + 1).min(fallback);
            debug!(
                "Log: {} rejected, adjusting next_index to {}",
                resp.follower_id, follower.next_index
            );
            Vec::new()
        }
    }

    /// Followers whose log contains `index`
    pub fn replicas_of(&self, index: u64) -> Vec<NodeId> {
        let mut nodes: Vec<NodeId> = self
            .followers
            .iter()
            .filter(|(_, f)| f.match_index >= index)
            .map(|(id, _)| id.clone())
            .collect();
        nodes.sort();
        nodes
    }

    fn truncate_from(&mut self, index: u64) {
        let keep = (index as usize).max(1);
        if keep < self.entries.len() {
            self.entries.truncate(keep);
        }
    }

    fn try_advance_commit(&mut self) -> Vec<LogEntry> {
        let cluster = self.followers.len() + 1;
        for n in (self.commit_index + 1)..=self.last_index() {
            // Only entries from the current term commit by counting replicas
            if self.term_at(n) != Some(self.current_term) {
                continue;
            }
            let count = 1 + self.followers.values().filter(|f| f.match_index >= n).count();
            if count >= majority(cluster) {
                self.commit_index = n;
                info!("Log: Advanced commit index to {}", n);
            }
        }
        self.apply_committed()
    }

    /// Leader with no followers commits its own entries immediately
    pub fn commit_single_node(&mut self) -> Vec<LogEntry> {
        if self.followers.is_empty() {
            self.commit_index = self.last_index();
            return self.apply_committed();
        }
        Vec::new()
    }

    fn apply_committed(&mut self) -> Vec<LogEntry> {
        let mut applied = Vec::new();
        while self.last_applied < self.commit_index {
            self.last_applied += 1;
            let entry = match self.get_entry(self.last_applied) {
                Some(e) => e.clone(),
                None => break,
            };
            if entry.entry_type == EntryType::Data && !entry.key.is_empty() {
                self.state.insert(entry.key.clone(), entry.value.clone());
                info!("Log: Applied {}={}", entry.key, entry.value);
            }
            applied.push(entry);
        }
        applied
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn append_req(prev: u64, prev_term: u64, entries: Vec<LogEntry>, commit: u64) -> AppendEntries {
        AppendEntries {
            leader_id: "leader".to_string(),
            prev_log_index: prev,
            prev_log_term: prev_term,
            entries,
            leader_commit: commit,
        }
    }

    #[test]
    fn test_append_and_get() {
        let mut log = ReplicatedLog::new();
        log.set_term(1);

        let entry = log.append("key1".to_string(), json!("value1"));
        assert_eq!(entry.index, 1);
        assert_eq!(entry.term, 1);
        assert_eq!(log.get_entry(1).unwrap().key, "key1");
        assert_eq!(log.term_at(0), Some(0));
        assert_eq!(log.term_at(2), None);
    }

    #[test]
    fn test_handle_append_entries_applies_committed() {
        let mut log = ReplicatedLog::new();
        let req = append_req(
            0,
            0,
            vec![LogEntry::new_data(1, 1, "k1".to_string(), json!("v1"))],
            1,
        );

        let outcome = log.handle_append_entries(&req);
        assert!(outcome.success);
        assert_eq!(outcome.appended.len(), 1);
        assert_eq!(outcome.applied.len(), 1);
        assert_eq!(log.last_index(), 1);
        assert_eq!(log.state().get("k1"), Some(&json!("v1")));
    }

    #[test]
    fn test_missing_prev_entry_rejected() {
        let mut log = ReplicatedLog::new();
        let req = append_req(3, 1, vec![], 0);
        let outcome = log.handle_append_entries(&req);
        assert!(!outcome.success);
        assert_eq!(outcome.match_index, 0);
    }

    #[test]
    fn test_conflicting_suffix_truncated() {
        let mut log = ReplicatedLog::new();
        log.handle_append_entries(&append_req(
            0,
            0,
            vec![
                LogEntry::new_data(1, 1, "a".into(), json!(1)),
                LogEntry::new_data(2, 1, "b".into(), json!(2)),
                LogEntry::new_data(3, 1, "c".into(), json!(3)),
            ],
            0,
        ));
        assert_eq!(log.last_index(), 3);

        // New leader at term 2 overwrites index 2 onwards
        let outcome = log.handle_append_entries(&append_req(
            1,
            1,
            vec![LogEntry::new_data(2, 2, "b".into(), json!(20))],
            2,
        ));
        assert!(outcome.success);
        assert_eq!(outcome.appended.len(), 1);
        assert_eq!(log.last_index(), 2);
        assert_eq!(log.term_at(2), Some(2));
        assert_eq!(log.state().get("b"), Some(&json!(20)));
    }

    #[test]
    fn test_partial_batch_does_not_commit_stale_tail() {
        let entries = (1..=10)
            .map(|i| LogEntry::new_data(i, 1, format!("k{}", i), json!("stale")))
            .collect();
        let mut log = ReplicatedLog::restore(entries, 5);

        // Leader at term 2 resends 6 and 7 only, with its commit far ahead
        let outcome = log.handle_append_entries(&append_req(
            5,
            1,
            vec![
                LogEntry::new_data(6, 2, "k6".into(), json!("fresh")),
                LogEntry::new_data(7, 2, "k7".into(), json!("fresh")),
            ],
            10,
        ));
        assert!(outcome.success);
        assert_eq!(outcome.match_index, 7);
        assert_eq!(log.commit_index(), 7);
        assert_eq!(log.last_index(), 7);
        let applied: Vec<u64> = outcome.applied.iter().map(|e| e.index).collect();
        assert_eq!(applied, vec![6, 7]);
        assert_eq!(log.state().get("k7"), Some(&json!("fresh")));
        assert!(log.state().get("k9").is_none());
    }

    #[test]
    fn test_matching_prefix_keeps_tail_uncommitted() {
        let entries = (1..=10)
            .map(|i| LogEntry::new_data(i, 1, format!("k{}", i), json!(i)))
            .collect();
        let mut log = ReplicatedLog::restore(entries, 5);

        let outcome = log.handle_append_entries(&append_req(
            5,
            1,
            vec![
                LogEntry::new_data(6, 1, "k6".into(), json!(6)),
                LogEntry::new_data(7, 1, "k7".into(), json!(7)),
            ],
            10,
        ));
        assert!(outcome.success);
        assert!(outcome.appended.is_empty());
        assert_eq!(log.last_index(), 10);
        assert_eq!(log.commit_index(), 7);

        // A later heartbeat that matches the tail commits it
        let outcome = log.handle_append_entries(&append_req(10, 1, vec![], 10));
        assert_eq!(log.commit_index(), 10);
        assert_eq!(outcome.applied.len(), 3);
    }

    #[test]
    fn test_leader_commits_on_majority_match() {
        let mut log = ReplicatedLog::new();
        log.set_term(1);
        let peers = vec!["f1".to_string(), "f2".to_string()];
        log.init_leader(&peers);
        let entry = log.append("x".into(), json!(42));
        assert_eq!(entry.index, 2);

        let body = log.append_entries_for(&"leader".to_string(), &"f1".to_string(), MAX_BATCH_SIZE).unwrap();
        assert_eq!(body.prev_log_index, 0);
        assert_eq!(body.entries.len(), 2);

        let applied = log.handle_append_entries_response(&AppendEntriesResponse {
            term: 1,
            follower_id: "f1".into(),
            success: true,
            match_index: 2,
        });
        assert_eq!(log.commit_index(), 2);
        assert_eq!(applied.len(), 2);
        assert_eq!(log.state().get("x"), Some(&json!(42)));
        assert_eq!(log.replicas_of(2), vec!["f1".to_string()]);
    }

    #[test]
    fn test_rejection_backs_off_next_index() {
        let mut log = ReplicatedLog::new();
        log.set_term(1);
        for i in 0..3 {
            log.append(format!("k{}", i), json!(i));
        }
        log.init_leader(&["f1".to_string()]);
        log.handle_append_entries_response(&AppendEntriesResponse {
            term: 1,
            follower_id: "f1".into(),
            success: false,
            match_index: 0,
        });
        let body = log.append_entries_for(&"leader".to_string(), &"f1".to_string(), 2).unwrap();
        assert_eq!(body.prev_log_index, 0);
        assert_eq!(body.entries.len(), 2);
    }

    #[test]
    fn test_restore_reapplies_committed_prefix() {
        let entries = vec![
            LogEntry::new_data(1, 1, "a".into(), json!(1)),
            LogEntry::new_data(2, 1, "b".into(), json!(2)),
        ];
        let log = ReplicatedLog::restore(entries, 1);
        assert_eq!(log.last_index(), 2);
        assert_eq!(log.commit_index(), 1);
        assert_eq!(log.state().get("a"), Some(&json!(1)));
        assert!(log.state().get("b").is_none());
    }
}
