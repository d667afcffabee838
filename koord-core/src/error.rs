//! Error types for the coordination engine

use crate::types::NodeId;
use thiserror::Error;

/// Errors surfaced by Koord components
#[derive(Debug, Error)]
pub enum Error {
    /// Malformed or unknown wire event
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Request carried a term older than the receiver's
    #[error("Stale term {received} (current {current})")]
    StaleTerm { current: u64, received: u64 },

    /// Vote rejected (unknown proposal or voter, malformed decision)
    #[error("Invalid vote: {0}")]
    InvalidVote(String),

    /// No eligible voters for a proposal
    #[error("No quorum: {0}")]
    Quorum(String),

    /// Send or broadcast failed
    #[error("Transport error: {0}")]
    Transport(String),

    /// Unsupported configuration or topology request
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Command submitted to a node that is not the leader
    #[error("Not leader (known leader: {leader:?})")]
    NotLeader { leader: Option<NodeId> },

    /// Operation needs a durable core and none is connected
    #[error("Durable core not connected")]
    CoreDisconnected,

    /// Durable store failure
    #[error("Storage error: {0}")]
    Storage(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result alias used across the crate
pub type Result<T> = std::result::Result<T, Error>;
