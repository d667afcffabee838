//! Core types shared by every Koord component

use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// Unique identifier for a cluster node
pub type NodeId = String;

/// Role of a node in the election state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum Role {
    /// Passive participant, accepts entries from the leader
    #[default]
    Follower,
    /// Attempting to become leader
    Candidate,
    /// Active leader, sends heartbeats and accepts commands
    Leader,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Follower => write!(f, "FOLLOWER"),
            Role::Candidate => write!(f, "CANDIDATE"),
            Role::Leader => write!(f, "LEADER"),
        }
    }
}

/// Current Unix timestamp in milliseconds
pub fn unix_timestamp_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Strict majority of a cluster with `cluster_size` members
pub fn majority(cluster_size: usize) -> usize {
    cluster_size / 2 + 1
}
