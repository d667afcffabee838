//! Koord Core Library
//!
//! Distributed consensus and coordination engine: Raft-style leader election,
//! event distribution across live node connections, threshold voting over
//! proposals, adaptive communication topology, and a bridge to a durable
//! consensus core.

pub mod bridge;
pub mod cluster;
pub mod config;
pub mod directory;
pub mod distributor;
pub mod election;
pub mod error;
pub mod event;
pub mod log;
pub mod metrics;
pub mod node;
pub mod store;
pub mod timer;
pub mod topology;
pub mod transport;
pub mod types;
pub mod voting;

pub use bridge::{CoordinationBridge, MemoryChannel, MessageChannel, SharedBridge, UnifiedStatus};
pub use cluster::LocalCluster;
pub use config::CoordConfig;
pub use directory::{ClusterDirectory, NodeRecord, SharedDirectory};
pub use distributor::{EventDistributor, SharedDistributor};
pub use election::ElectionCore;
pub use error::{Error, Result};
pub use event::{ConsensusEvent, EventKind, EventType};
pub use node::{ElectionNode, NodeHandle};
pub use store::{DurableStore, FileStore, MemoryStore};
pub use topology::{TopologyKind, TopologyManager};
pub use transport::{MemoryNetwork, Transport, UdpTransport};
pub use types::*;
pub use voting::{Outcome, ProposalSpec, Strategy, VotingEngine};
