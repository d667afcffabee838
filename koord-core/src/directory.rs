//! Cluster directory: known nodes, their capabilities, weights and activity.
//!
//! The directory is an explicit object passed by handle ([`SharedDirectory`])
//! to every component that needs membership data. Records are keyed by the
//! stable node id and keep registration order, which star and ring
//! topologies rely on.

use crate::config::VotingConfig;
use crate::types::{NodeId, Role};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Shared handle to the cluster directory
pub type SharedDirectory = Arc<RwLock<ClusterDirectory>>;

/// Observed state of one node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeRecord {
    pub id: NodeId,
    pub role: Role,
    pub term: u64,
    pub capabilities: Vec<String>,
    /// Voting weight, never negative
    pub weight: f64,
    pub trust_score: f64,
    pub last_activity: DateTime<Utc>,
}

impl NodeRecord {
    /// Record with default weight and full trust, seen now
    pub fn new(id: impl Into<NodeId>) -> Self {
        Self {
            id: id.into(),
            role: Role::Follower,
            term: 0,
            capabilities: Vec::new(),
            weight: 1.0,
            trust_score: 1.0,
            last_activity: Utc::now(),
        }
    }

    pub fn with_capabilities<I, S>(mut self, caps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.capabilities = caps.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_weight(mut self, weight: f64) -> Self {
        self.weight = weight.max(0.0);
        self
    }

    pub fn with_trust(mut self, trust_score: f64) -> Self {
        self.trust_score = trust_score;
        self
    }

    pub fn with_last_activity(mut self, at: DateTime<Utc>) -> Self {
        self.last_activity = at;
        self
    }

    /// True if the node advertises every capability in `required`
    pub fn has_capabilities(&self, required: &[String]) -> bool {
        required.iter().all(|c| self.capabilities.contains(c))
    }
}

/// Voter eligibility criteria
#[derive(Debug, Clone, PartialEq)]
pub struct EligibilityFilter {
    pub min_trust_score: f64,
    pub max_inactive: Duration,
    pub required_capabilities: Vec<String>,
}

impl Default for EligibilityFilter {
    fn default() -> Self {
        Self::from_config(&VotingConfig::default())
    }
}

impl EligibilityFilter {
    pub fn from_config(config: &VotingConfig) -> Self {
        Self {
            min_trust_score: config.min_trust_score,
            max_inactive: config.max_inactive(),
            required_capabilities: Vec::new(),
        }
    }

    pub fn with_capabilities(mut self, caps: Vec<String>) -> Self {
        self.required_capabilities = caps;
        self
    }

    /// Check a record against the filter at time `now`
    pub fn admits(&self, record: &NodeRecord, now: DateTime<Utc>) -> bool {
        let age = now
            .signed_duration_since(record.last_activity)
            .to_std()
            .unwrap_or(Duration::ZERO);

        record.trust_score >= self.min_trust_score
            && age <= self.max_inactive
            && record.has_capabilities(&self.required_capabilities)
    }
}

/// Registry of cluster members in registration order
#[derive(Debug, Default)]
pub struct ClusterDirectory {
    records: HashMap<NodeId, NodeRecord>,
    order: Vec<NodeId>,
}

impl ClusterDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wrap into a shared handle
    pub fn shared(self) -> SharedDirectory {
        Arc::new(RwLock::new(self))
    }

    /// Insert or replace a record. Returns true if the node was new.
    pub fn register(&mut self, mut record: NodeRecord) -> bool {
        record.weight = record.weight.max(0.0);
        let id = record.id.clone();
        let is_new = self.records.insert(id.clone(), record).is_none();
        if is_new {
            debug!("Directory: Registered {}", id);
            self.order.push(id);
        }
        is_new
    }

    /// Refresh a node from an observed message, creating it on first contact
    pub fn observe(&mut self, id: &str, role: Role, term: u64, now: DateTime<Utc>) -> &NodeRecord {
        if !self.records.contains_key(id) {
            debug!("Directory: First contact with {}", id);
            self.order.push(id.to_string());
        }
        let record = self
            .records
            .entry(id.to_string())
            .or_insert_with(|| NodeRecord::new(id));
        record.role = role;
        record.term = record.term.max(term);
        record.last_activity = now;
        record
    }

    /// Update last activity only
    pub fn touch(&mut self, id: &str, now: DateTime<Utc>) -> bool {
        match self.records.get_mut(id) {
            Some(record) => {
                record.last_activity = now;
                true
            }
            None => false,
        }
    }

    pub fn set_role(&mut self, id: &str, role: Role) -> bool {
        match self.records.get_mut(id) {
            Some(record) => {
                record.role = role;
                true
            }
            None => false,
        }
    }

    pub fn set_weight(&mut self, id: &str, weight: f64) -> bool {
        match self.records.get_mut(id) {
            Some(record) => {
                record.weight = weight.max(0.0);
                true
            }
            None => false,
        }
    }

    pub fn set_trust(&mut self, id: &str, trust_score: f64) -> bool {
        match self.records.get_mut(id) {
            Some(record) => {
                record.trust_score = trust_score;
                true
            }
            None => false,
        }
    }

    /// Every node except `leader` becomes a follower at `term`
    pub fn demote_all_except(&mut self, leader: &str, term: u64) {
        for (id, record) in self.records.iter_mut() {
            if id == leader {
                record.role = Role::Leader;
            } else {
                record.role = Role::Follower;
            }
            record.term = record.term.max(term);
        }
    }

    pub fn remove(&mut self, id: &str) -> Option<NodeRecord> {
        let removed = self.records.remove(id);
        if removed.is_some() {
            self.order.retain(|n| n != id);
            debug!("Directory: Removed {}", id);
        }
        removed
    }

    pub fn get(&self, id: &str) -> Option<&NodeRecord> {
        self.records.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.records.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Node ids in registration order
    pub fn ids(&self) -> Vec<NodeId> {
        self.order.clone()
    }

    /// Records in registration order
    pub fn records(&self) -> impl Iterator<Item = &NodeRecord> {
        self.order.iter().filter_map(|id| self.records.get(id))
    }

    /// Records passing the eligibility filter at `now`, in registration order
    pub fn eligible(&self, filter: &EligibilityFilter, now: DateTime<Utc>) -> Vec<NodeRecord> {
        self.records()
            .filter(|r| filter.admits(r, now))
            .cloned()
            .collect()
    }

    /// Current leader as seen by the directory
    pub fn leader(&self) -> Option<&NodeRecord> {
        self.records().find(|r| r.role == Role::Leader)
    }

    /// Highest observed term
    pub fn max_term(&self) -> u64 {
        self.records.values().map(|r| r.term).max().unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    #[test]
    fn test_registration_order_is_kept() {
        let mut dir = ClusterDirectory::new();
        assert!(dir.register(NodeRecord::new("c")));
        assert!(dir.register(NodeRecord::new("a")));
        assert!(dir.register(NodeRecord::new("b")));
        assert!(!dir.register(NodeRecord::new("a")));

        assert_eq!(dir.ids(), vec!["c", "a", "b"]);
        dir.remove("a");
        assert_eq!(dir.ids(), vec!["c", "b"]);
        assert_eq!(dir.len(), 2);
    }

    #[test]
    fn test_observe_creates_and_refreshes() {
        let mut dir = ClusterDirectory::new();
        let now = Utc::now();
        dir.observe("n1", Role::Candidate, 3, now);
        let rec = dir.get("n1").unwrap();
        assert_eq!(rec.role, Role::Candidate);
        assert_eq!(rec.term, 3);

        // Lower term never moves the observed term backwards
        dir.observe("n1", Role::Follower, 1, now);
        assert_eq!(dir.get("n1").unwrap().term, 3);
    }

    #[test]
    fn test_weight_is_never_negative() {
        let mut dir = ClusterDirectory::new();
        dir.register(NodeRecord::new("n1").with_weight(-4.0));
        assert_eq!(dir.get("n1").unwrap().weight, 0.0);
        dir.set_weight("n1", -1.0);
        assert_eq!(dir.get("n1").unwrap().weight, 0.0);
    }

    #[test]
    fn test_eligibility_filter() {
        let now = Utc::now();
        let mut dir = ClusterDirectory::new();
        dir.register(NodeRecord::new("trusted").with_capabilities(["vote", "plan"]));
        dir.register(NodeRecord::new("untrusted").with_trust(0.5).with_capabilities(["vote"]));
        dir.register(
            NodeRecord::new("stale")
                .with_capabilities(["vote"])
                .with_last_activity(now - ChronoDuration::seconds(60)),
        );
        dir.register(NodeRecord::new("no-caps"));

        let filter = EligibilityFilter::default().with_capabilities(vec!["vote".to_string()]);
        let eligible: Vec<_> = dir.eligible(&filter, now).into_iter().map(|r| r.id).collect();
        assert_eq!(eligible, vec!["trusted"]);
    }

    #[test]
    fn test_demote_all_except() {
        let mut dir = ClusterDirectory::new();
        let now = Utc::now();
        dir.observe("a", Role::Candidate, 2, now);
        dir.observe("b", Role::Leader, 1, now);
        dir.observe("c", Role::Candidate, 2, now);

        dir.demote_all_except("a", 2);
        assert_eq!(dir.leader().unwrap().id, "a");
        assert_eq!(dir.get("b").unwrap().role, Role::Follower);
        assert_eq!(dir.get("b").unwrap().term, 2);
        assert_eq!(dir.get("c").unwrap().role, Role::Follower);
    }
}
