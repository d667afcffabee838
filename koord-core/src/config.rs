//! Configuration for the coordination engine
//!
//! Every section has defaults matching the protocol constants and can be
//! loaded from a JSON file; missing fields fall back to the defaults.

use crate::error::Result;
use crate::topology::TopologyKind;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

/// Election timeout range in milliseconds
pub const ELECTION_TIMEOUT_MIN_MS: u64 = 150;
pub const ELECTION_TIMEOUT_MAX_MS: u64 = 300;

/// Heartbeat interval (should be << election timeout)
pub const HEARTBEAT_INTERVAL_MS: u64 = 50;

/// Complete engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordConfig {
    /// Identity of the local node
    pub node_id: String,
    pub election: ElectionConfig,
    pub voting: VotingConfig,
    pub topology: TopologyConfig,
    pub bridge: BridgeConfig,
}

/// Leader election timing
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ElectionConfig {
    pub election_timeout_min_ms: u64,
    pub election_timeout_max_ms: u64,
    pub heartbeat_interval_ms: u64,
    /// Maximum log entries carried by one AppendEntries
    pub max_batch_size: usize,
}

/// Proposal voting defaults
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VotingConfig {
    /// Minimum trust score of an eligible voter
    pub min_trust_score: f64,
    /// Maximum activity age of an eligible voter
    pub max_inactive_ms: u64,
    /// Period of the deadline sweep
    pub sweep_interval_ms: u64,
    /// Deadline applied when a proposal does not carry one
    pub default_deadline_ms: Option<u64>,
    /// Number of resolved proposals kept for queries
    pub history_limit: usize,
}

/// Topology management
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TopologyConfig {
    /// Topology used before the first task arrives
    pub initial: TopologyKind,
    /// Success rate below which a performance warning is raised
    pub success_rate_floor: f64,
    /// Samples required before the floor is enforced
    pub min_samples: u64,
    /// Samples kept for rolling averages
    pub rolling_window: usize,
    /// Topology to fall back to when a type underperforms
    pub failover: HashMap<TopologyKind, TopologyKind>,
    /// Number of completed or failed tasks kept for queries
    pub finished_task_limit: usize,
}

/// Coordination bridge
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Interval between polls of the shared message channel
    pub poll_interval_ms: u64,
    /// Maximum messages read per poll
    pub poll_batch: usize,
    /// Message kind carrying state updates from the durable core
    pub state_update_kind: String,
}

impl Default for CoordConfig {
    fn default() -> Self {
        Self {
            node_id: "koord-node".to_string(),
            election: ElectionConfig::default(),
            voting: VotingConfig::default(),
            topology: TopologyConfig::default(),
            bridge: BridgeConfig::default(),
        }
    }
}

impl Default for ElectionConfig {
    fn default() -> Self {
        Self {
            election_timeout_min_ms: ELECTION_TIMEOUT_MIN_MS,
            election_timeout_max_ms: ELECTION_TIMEOUT_MAX_MS,
            heartbeat_interval_ms: HEARTBEAT_INTERVAL_MS,
            max_batch_size: 8,
        }
    }
}

impl Default for VotingConfig {
    fn default() -> Self {
        Self {
            min_trust_score: 0.7,
            max_inactive_ms: 30_000,
            sweep_interval_ms: 1_000,
            default_deadline_ms: None,
            history_limit: 1_000,
        }
    }
}

impl Default for TopologyConfig {
    fn default() -> Self {
        Self {
            initial: TopologyKind::Hierarchical,
            success_rate_floor: 0.7,
            min_samples: 5,
            rolling_window: 20,
            failover: HashMap::new(),
            finished_task_limit: 1_000,
        }
    }
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 200,
            poll_batch: 50,
            state_update_kind: "state_update".to_string(),
        }
    }
}

impl ElectionConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    /// Random election timeout between min and max
    pub fn random_election_timeout(&self) -> Duration {
        use rand::Rng;
        let min = self.election_timeout_min_ms;
        let max = self.election_timeout_max_ms.max(min);
        let ms = rand::thread_rng().gen_range(min..=max);
        Duration::from_millis(ms)
    }
}

impl VotingConfig {
    pub fn max_inactive(&self) -> Duration {
        Duration::from_millis(self.max_inactive_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }
}

impl BridgeConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

impl CoordConfig {
    /// Create config for a node with default sections
    pub fn new(node_id: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            ..Default::default()
        }
    }

    /// Load config from a JSON file
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let data = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&data)?)
    }

    /// Set election timeout range
    pub fn with_election_timeout(mut self, min_ms: u64, max_ms: u64) -> Self {
        self.election.election_timeout_min_ms = min_ms;
        self.election.election_timeout_max_ms = max_ms;
        self
    }

    /// Set heartbeat interval
    pub fn with_heartbeat_interval(mut self, ms: u64) -> Self {
        self.election.heartbeat_interval_ms = ms;
        self
    }

    /// Set voter eligibility thresholds
    pub fn with_eligibility(mut self, min_trust_score: f64, max_inactive_ms: u64) -> Self {
        self.voting.min_trust_score = min_trust_score;
        self.voting.max_inactive_ms = max_inactive_ms;
        self
    }

    /// Set initial topology
    pub fn with_initial_topology(mut self, kind: TopologyKind) -> Self {
        self.topology.initial = kind;
        self
    }

    /// Configure a failover topology for an underperforming type
    pub fn with_failover(mut self, from: TopologyKind, to: TopologyKind) -> Self {
        self.topology.failover.insert(from, to);
        self
    }

    /// Set bridge poll interval
    pub fn with_poll_interval(mut self, ms: u64) -> Self {
        self.bridge.poll_interval_ms = ms;
        self
    }
}
