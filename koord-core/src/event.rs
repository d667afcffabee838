//! Consensus events and their wire envelope.
//!
//! Every message exchanged between nodes is a [`ConsensusEvent`]: a closed
//! sum type over the eight event kinds. On the wire it travels as the JSON
//! envelope `{type, nodeId, term, timestamp, payload}`; unknown types and
//! malformed payloads surface as [`Error::Protocol`].

use crate::error::{Error, Result};
use crate::log::LogEntry;
use crate::types::{unix_timestamp_ms, NodeId, Role};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::str::FromStr;

/// Discriminant of a consensus event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventType {
    VoteRequest,
    VoteResponse,
    Heartbeat,
    AppendEntries,
    AppendEntriesResponse,
    StateChange,
    LeaderElection,
    ConsensusAchieved,
}

impl EventType {
    pub const ALL: [EventType; 8] = [
        EventType::VoteRequest,
        EventType::VoteResponse,
        EventType::Heartbeat,
        EventType::AppendEntries,
        EventType::AppendEntriesResponse,
        EventType::StateChange,
        EventType::LeaderElection,
        EventType::ConsensusAchieved,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::VoteRequest => "VOTE_REQUEST",
            EventType::VoteResponse => "VOTE_RESPONSE",
            EventType::Heartbeat => "HEARTBEAT",
            EventType::AppendEntries => "APPEND_ENTRIES",
            EventType::AppendEntriesResponse => "APPEND_ENTRIES_RESPONSE",
            EventType::StateChange => "STATE_CHANGE",
            EventType::LeaderElection => "LEADER_ELECTION",
            EventType::ConsensusAchieved => "CONSENSUS_ACHIEVED",
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        EventType::ALL
            .iter()
            .copied()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| Error::Protocol(format!("unknown event type {:?}", s)))
    }
}

/// Candidate asking for votes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VoteRequest {
    pub candidate_id: NodeId,
    pub last_log_index: u64,
    pub last_log_term: u64,
}

/// Answer to a vote request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VoteResponse {
    pub vote_id: String,
    pub term: u64,
    pub candidate_id: NodeId,
    pub voter_id: NodeId,
    pub granted: bool,
}

/// Leader heartbeat / AppendEntries body
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppendEntries {
    pub leader_id: NodeId,
    pub prev_log_index: u64,
    pub prev_log_term: u64,
    #[serde(default)]
    pub entries: Vec<LogEntry>,
    pub leader_commit: u64,
}

/// Follower answer to AppendEntries
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppendEntriesResponse {
    pub term: u64,
    pub follower_id: NodeId,
    pub success: bool,
    /// Follower's last log index
    pub match_index: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateChange {
    pub previous_state: Role,
    pub new_state: Role,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeaderElection {
    pub new_leader_id: NodeId,
    pub votes_received: usize,
    pub total_nodes: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsensusAchieved {
    pub decision: Value,
    pub log_index: u64,
    pub participating_nodes: Vec<NodeId>,
}

/// Type-specific part of an event
#[derive(Debug, Clone, PartialEq)]
pub enum EventKind {
    VoteRequest(VoteRequest),
    VoteResponse(VoteResponse),
    Heartbeat(AppendEntries),
    AppendEntries(AppendEntries),
    AppendEntriesResponse(AppendEntriesResponse),
    StateChange(StateChange),
    LeaderElection(LeaderElection),
    ConsensusAchieved(ConsensusAchieved),
}

impl EventKind {
    pub fn event_type(&self) -> EventType {
        match self {
            EventKind::VoteRequest(_) => EventType::VoteRequest,
            EventKind::VoteResponse(_) => EventType::VoteResponse,
            EventKind::Heartbeat(_) => EventType::Heartbeat,
            EventKind::AppendEntries(_) => EventType::AppendEntries,
            EventKind::AppendEntriesResponse(_) => EventType::AppendEntriesResponse,
            EventKind::StateChange(_) => EventType::StateChange,
            EventKind::LeaderElection(_) => EventType::LeaderElection,
            EventKind::ConsensusAchieved(_) => EventType::ConsensusAchieved,
        }
    }

    fn payload(&self) -> Result<Value> {
        let value = match self {
            EventKind::VoteRequest(p) => serde_json::to_value(p)?,
            EventKind::VoteResponse(p) => serde_json::to_value(p)?,
            EventKind::Heartbeat(p) | EventKind::AppendEntries(p) => serde_json::to_value(p)?,
            EventKind::AppendEntriesResponse(p) => serde_json::to_value(p)?,
            EventKind::StateChange(p) => serde_json::to_value(p)?,
            EventKind::LeaderElection(p) => serde_json::to_value(p)?,
            EventKind::ConsensusAchieved(p) => serde_json::to_value(p)?,
        };
        Ok(value)
    }

    fn from_payload(event_type: EventType, payload: Value) -> Result<Self> {
        let malformed =
            |e: serde_json::Error| Error::Protocol(format!("malformed {} payload: {}", event_type, e));
        let kind = match event_type {
            EventType::VoteRequest => {
                EventKind::VoteRequest(serde_json::from_value(payload).map_err(malformed)?)
            }
            EventType::VoteResponse => {
                EventKind::VoteResponse(serde_json::from_value(payload).map_err(malformed)?)
            }
            EventType::Heartbeat => {
                EventKind::Heartbeat(serde_json::from_value(payload).map_err(malformed)?)
            }
            EventType::AppendEntries => {
                EventKind::AppendEntries(serde_json::from_value(payload).map_err(malformed)?)
            }
            EventType::AppendEntriesResponse => {
                EventKind::AppendEntriesResponse(serde_json::from_value(payload).map_err(malformed)?)
            }
            EventType::StateChange => {
                EventKind::StateChange(serde_json::from_value(payload).map_err(malformed)?)
            }
            EventType::LeaderElection => {
                EventKind::LeaderElection(serde_json::from_value(payload).map_err(malformed)?)
            }
            EventType::ConsensusAchieved => {
                EventKind::ConsensusAchieved(serde_json::from_value(payload).map_err(malformed)?)
            }
        };
        Ok(kind)
    }
}

/// JSON envelope as it travels between nodes
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireEvent {
    #[serde(rename = "type")]
    pub event_type: String,
    pub node_id: NodeId,
    pub term: u64,
    pub timestamp: u64,
    #[serde(default)]
    pub payload: Value,
}

/// A consensus event with sender, term and timestamp
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "WireEvent", into = "WireEvent")]
pub struct ConsensusEvent {
    pub node_id: NodeId,
    pub term: u64,
    /// Unix milliseconds
    pub timestamp: u64,
    pub kind: EventKind,
}

impl ConsensusEvent {
    /// Create an event stamped with the current time
    pub fn new(node_id: impl Into<NodeId>, term: u64, kind: EventKind) -> Self {
        Self {
            node_id: node_id.into(),
            term,
            timestamp: unix_timestamp_ms(),
            kind,
        }
    }

    pub fn event_type(&self) -> EventType {
        self.kind.event_type()
    }

    /// Serialize to the JSON envelope
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(&WireEvent::try_from(self)?)?)
    }

    /// Serialize to JSON bytes
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(&WireEvent::try_from(self)?)?)
    }

    /// Parse a JSON envelope; every failure is a protocol error
    pub fn from_json(text: &str) -> Result<Self> {
        let wire: WireEvent = serde_json::from_str(text)
            .map_err(|e| Error::Protocol(format!("malformed envelope: {}", e)))?;
        Self::try_from(wire)
    }

    /// Parse JSON bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let wire: WireEvent = serde_json::from_slice(bytes)
            .map_err(|e| Error::Protocol(format!("malformed envelope: {}", e)))?;
        Self::try_from(wire)
    }
}

impl TryFrom<WireEvent> for ConsensusEvent {
    type Error = Error;

    fn try_from(wire: WireEvent) -> Result<Self> {
        let event_type: EventType = wire.event_type.parse()?;
        let kind = EventKind::from_payload(event_type, wire.payload)?;
        Ok(Self {
            node_id: wire.node_id,
            term: wire.term,
            timestamp: wire.timestamp,
            kind,
        })
    }
}

impl TryFrom<&ConsensusEvent> for WireEvent {
    type Error = Error;

    fn try_from(event: &ConsensusEvent) -> Result<Self> {
        Ok(Self {
            event_type: event.event_type().as_str().to_string(),
            node_id: event.node_id.clone(),
            term: event.term,
            timestamp: event.timestamp,
            payload: event.kind.payload()?,
        })
    }
}

impl From<ConsensusEvent> for WireEvent {
    fn from(event: ConsensusEvent) -> Self {
        let payload = event.kind.payload().unwrap_or(Value::Null);
        Self {
            event_type: event.event_type().as_str().to_string(),
            node_id: event.node_id,
            term: event.term,
            timestamp: event.timestamp,
            payload,
        }
    }
}
