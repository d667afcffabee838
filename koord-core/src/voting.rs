//! Multi-strategy proposal voting over the cluster directory.
//!
//! A proposal snapshots its eligible voters (and their weights) from the
//! [`ClusterDirectory`] when it is created. Votes overwrite per voter until
//! the proposal resolves; every vote and every sweep re-evaluates it:
//!
//! - ACHIEVED as soon as `approved / eligible >= threshold`
//! - FAILED as soon as `(approved + unvoted) / eligible < threshold`
//! - at the deadline: NO_QUORUM below 50% participation, otherwise the
//!   approve ratio among cast votes decides
//!
//! Ratios are compared with plain `f64 >=`, so 4 of 6 under a 0.67
//! threshold fails. A resolved proposal never changes again and further
//! votes on it are accepted as no-ops.
//!
//! [`ClusterDirectory`]: crate::directory::ClusterDirectory

use crate::config::VotingConfig;
use crate::directory::{EligibilityFilter, NodeRecord, SharedDirectory};
use crate::error::{Error, Result};
use crate::types::{NodeId, Role};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::str::FromStr;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Channel capacity for resolution notices
const CHANNEL_CAPACITY: usize = 256;

/// Minimum participation for a deadline decision
const MIN_PARTICIPATION: f64 = 0.5;

/// Voting strategy of a proposal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    SimpleMajority,
    Supermajority,
    Unanimous,
    /// Ratio over voter weights
    Weighted,
    /// Designated leader's threshold, simple majority without one
    LeaderBased,
}

impl Strategy {
    pub fn default_threshold(&self) -> f64 {
        match self {
            Strategy::SimpleMajority => 0.51,
            Strategy::Supermajority => 0.67,
            Strategy::Unanimous => 1.0,
            Strategy::Weighted => 0.6,
            Strategy::LeaderBased => 0.5,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Strategy::SimpleMajority => "simple_majority",
            Strategy::Supermajority => "supermajority",
            Strategy::Unanimous => "unanimous",
            Strategy::Weighted => "weighted",
            Strategy::LeaderBased => "leader_based",
        }
    }
}

impl std::fmt::Display for Strategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Strategy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "simple_majority" => Ok(Strategy::SimpleMajority),
            "supermajority" => Ok(Strategy::Supermajority),
            "unanimous" => Ok(Strategy::Unanimous),
            "weighted" => Ok(Strategy::Weighted),
            "leader_based" => Ok(Strategy::LeaderBased),
            other => Err(Error::Configuration(format!("unknown voting strategy {:?}", other))),
        }
    }
}

/// Lifecycle state of a proposal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Outcome {
    Pending,
    Achieved,
    Failed,
    NoQuorum,
}

impl Outcome {
    pub fn is_resolved(&self) -> bool {
        *self != Outcome::Pending
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Decision {
    Approve,
    Reject,
}

impl Decision {
    /// Only JSON booleans are decisions
    pub fn from_json(value: &Value) -> Result<Self> {
        match value {
            Value::Bool(true) => Ok(Decision::Approve),
            Value::Bool(false) => Ok(Decision::Reject),
            other => Err(Error::InvalidVote(format!(
                "decision must be a boolean, got {}",
                other
            ))),
        }
    }
}

/// One voter's decision on a proposal
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Vote {
    pub proposal_id: String,
    pub node_id: NodeId,
    pub decision: Decision,
    /// Voter weight at proposal creation
    pub weight: f64,
    pub timestamp: DateTime<Utc>,
    pub reason: Option<String>,
}

/// Request to open a proposal
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProposalSpec {
    /// Swarm or scope the decision belongs to
    pub scope_id: String,
    pub payload: Value,
    pub strategy: Strategy,
    /// Overrides the strategy's default threshold, must be in (0, 1]
    #[serde(default)]
    pub threshold: Option<f64>,
    #[serde(default)]
    pub deadline_ms: Option<u64>,
    #[serde(default)]
    pub required_capabilities: Vec<String>,
    /// Designated leader for `leader_based`; defaults to the directory leader
    #[serde(default)]
    pub leader: Option<NodeId>,
    #[serde(default)]
    pub proposer: Option<NodeId>,
}

impl ProposalSpec {
    pub fn new(scope_id: impl Into<String>, payload: Value, strategy: Strategy) -> Self {
        Self {
            scope_id: scope_id.into(),
            payload,
            strategy,
            threshold: None,
            deadline_ms: None,
            required_capabilities: Vec::new(),
            leader: None,
            proposer: None,
        }
    }

    pub fn with_threshold(mut self, threshold: f64) -> Self {
        self.threshold = Some(threshold);
        self
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline_ms = Some(deadline.as_millis() as u64);
        self
    }

    pub fn with_capabilities<I, S>(mut self, caps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.required_capabilities = caps.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_leader(mut self, leader: impl Into<NodeId>) -> Self {
        self.leader = Some(leader.into());
        self
    }

    pub fn with_proposer(mut self, proposer: impl Into<NodeId>) -> Self {
        self.proposer = Some(proposer.into());
        self
    }
}

/// Current counts of a proposal; weights for `weighted`, heads otherwise
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Tally {
    pub approved: f64,
    pub rejected: f64,
    pub remaining: f64,
    pub total: f64,
    pub votes_cast: usize,
    pub eligible: usize,
}

impl Tally {
    /// Approved share of all eligible voters
    pub fn approve_ratio(&self) -> f64 {
        if self.total <= 0.0 {
            return 0.0;
        }
        self.approved / self.total
    }

    /// Best ratio still reachable if every remaining voter approves
    pub fn reachable_ratio(&self) -> f64 {
        if self.total <= 0.0 {
            return 0.0;
        }
        (self.approved + self.remaining) / self.total
    }

    /// Approved share of cast votes
    pub fn cast_ratio(&self) -> f64 {
        let cast = self.approved + self.rejected;
        if cast <= 0.0 {
            return 0.0;
        }
        self.approved / cast
    }

    pub fn participation(&self) -> f64 {
        if self.eligible == 0 {
            return 0.0;
        }
        self.votes_cast as f64 / self.eligible as f64
    }
}

/// A decision submitted for multi-node agreement
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Proposal {
    pub id: String,
    pub scope_id: String,
    pub payload: Value,
    pub strategy: Strategy,
    /// Effective threshold after override and leader fallback
    pub threshold: f64,
    pub proposer: Option<NodeId>,
    /// Leader whose threshold applies (`leader_based` only)
    pub leader: Option<NodeId>,
    pub created_at: DateTime<Utc>,
    pub deadline: Option<DateTime<Utc>>,
    /// Eligible voters and their weights, fixed at creation
    pub eligible: Vec<(NodeId, f64)>,
    pub votes: HashMap<NodeId, Vote>,
    pub outcome: Outcome,
    pub resolved_at: Option<DateTime<Utc>>,
}

impl Proposal {
    pub fn is_eligible(&self, node_id: &str) -> bool {
        self.eligible.iter().any(|(id, _)| id == node_id)
    }

    fn weight_of(&self, node_id: &str) -> f64 {
        self.eligible
            .iter()
            .find(|(id, _)| id == node_id)
            .map(|(_, w)| *w)
            .unwrap_or(0.0)
    }

    pub fn tally(&self) -> Tally {
        let total_weight: f64 = self.eligible.iter().map(|(_, w)| *w).sum();
        // Zero total weight would make every ratio undefined; count heads instead
        let weighted = self.strategy == Strategy::Weighted && total_weight > 0.0;
        let share = |id: &str| if weighted { self.weight_of(id) } else { 1.0 };

        let mut tally = Tally {
            approved: 0.0,
            rejected: 0.0,
            remaining: 0.0,
            total: 0.0,
            votes_cast: 0,
            eligible: self.eligible.len(),
        };
        for (id, _) in &self.eligible {
            let s = share(id);
            tally.total += s;
            match self.votes.get(id).map(|v| v.decision) {
                Some(Decision::Approve) => {
                    tally.approved += s;
                    tally.votes_cast += 1;
                }
                Some(Decision::Reject) => {
                    tally.rejected += s;
                    tally.votes_cast += 1;
                }
                None => tally.remaining += s,
            }
        }
        tally
    }

    /// Outcome implied by the current votes at `now`
    pub fn evaluate(&self, now: DateTime<Utc>) -> Outcome {
        if self.outcome.is_resolved() {
            return self.outcome;
        }
        if self.eligible.is_empty() {
            return Outcome::NoQuorum;
        }

        let tally = self.tally();
        if tally.approve_ratio() >= self.threshold {
            return Outcome::Achieved;
        }
        if tally.reachable_ratio() < self.threshold {
            return Outcome::Failed;
        }

        match self.deadline {
            Some(deadline) if now >= deadline => {
                if tally.participation() < MIN_PARTICIPATION {
                    Outcome::NoQuorum
                } else if tally.cast_ratio() >= self.threshold {
                    Outcome::Achieved
                } else {
                    Outcome::Failed
                }
            }
            _ => Outcome::Pending,
        }
    }
}

/// Result of a vote submission
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VoteReceipt {
    /// Vote stored; carries the outcome after re-evaluation
    Recorded(Outcome),
    /// Proposal already resolved, vote discarded
    Ignored(Outcome),
}

/// Published once per proposal when it resolves
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProposalResolved {
    pub proposal_id: String,
    pub scope_id: String,
    pub outcome: Outcome,
    pub tally: Tally,
}

/// Advice for a voter on an open proposal
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Recommendation {
    pub decision: Decision,
    /// 0.0 ..= 1.0
    pub confidence: f64,
    pub rationale: String,
}

/// Caller-supplied recommendation policy
pub trait VoteAdvisor: Send + Sync {
    fn recommend(&self, proposal: &Proposal, voter: &NodeRecord) -> Option<Recommendation>;
}

/// Gives no advice
#[derive(Debug, Default, Clone, Copy)]
pub struct NoAdvice;

impl VoteAdvisor for NoAdvice {
    fn recommend(&self, _proposal: &Proposal, _voter: &NodeRecord) -> Option<Recommendation> {
        None
    }
}

/// Recommends whatever the proposal's leader voted
#[derive(Debug, Default, Clone, Copy)]
pub struct FollowLeader;

impl VoteAdvisor for FollowLeader {
    fn recommend(&self, proposal: &Proposal, voter: &NodeRecord) -> Option<Recommendation> {
        let leader = proposal.leader.as_ref()?;
        if *leader == voter.id {
            return None;
        }
        let vote = proposal.votes.get(leader)?;
        Some(Recommendation {
            decision: vote.decision,
            confidence: 1.0,
            rationale: format!("leader {} voted {:?}", leader, vote.decision),
        })
    }
}

#[derive(Default)]
struct EngineState {
    active: HashMap<String, Proposal>,
    history: VecDeque<Proposal>,
}

/// Shared reference to a VotingEngine
pub type SharedVotingEngine = Arc<VotingEngine>;

/// Proposal lifecycle and strategy evaluation
pub struct VotingEngine {
    directory: SharedDirectory,
    config: VotingConfig,
    filter: EligibilityFilter,
    state: Mutex<EngineState>,
    notices: broadcast::Sender<ProposalResolved>,
    advisor: Arc<dyn VoteAdvisor>,
}

impl VotingEngine {
    pub fn new(directory: SharedDirectory, config: VotingConfig) -> Self {
        let (notices, _) = broadcast::channel(CHANNEL_CAPACITY);
        let filter = EligibilityFilter::from_config(&config);
        Self {
            directory,
            config,
            filter,
            state: Mutex::new(EngineState::default()),
            notices,
            advisor: Arc::new(NoAdvice),
        }
    }

    pub fn with_advisor(mut self, advisor: Arc<dyn VoteAdvisor>) -> Self {
        self.advisor = advisor;
        self
    }

    pub fn shared(self) -> SharedVotingEngine {
        Arc::new(self)
    }

    pub fn config(&self) -> &VotingConfig {
        &self.config
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ProposalResolved> {
        self.notices.subscribe()
    }

    pub fn create_proposal(&self, spec: ProposalSpec) -> Result<Proposal> {
        self.create_proposal_at(spec, Utc::now())
    }

    /// Open a proposal as of `now`. A proposal without eligible voters
    /// resolves to NO_QUORUM immediately.
    pub fn create_proposal_at(&self, spec: ProposalSpec, now: DateTime<Utc>) -> Result<Proposal> {
        if let Some(threshold) = spec.threshold {
            if !(threshold > 0.0 && threshold <= 1.0) {
                return Err(Error::Configuration(format!(
                    "threshold {} outside (0, 1]",
                    threshold
                )));
            }
        }

        let filter = self
            .filter
            .clone()
            .with_capabilities(spec.required_capabilities.clone());
        let (eligible, directory_leader) = {
            let directory = self.directory.read();
            let eligible: Vec<(NodeId, f64)> = directory
                .eligible(&filter, now)
                .into_iter()
                .map(|r| (r.id, r.weight))
                .collect();
            let leader = directory
                .records()
                .find(|r| r.role == Role::Leader)
                .map(|r| r.id.clone());
            (eligible, leader)
        };

        let (threshold, leader) = match spec.strategy {
            Strategy::LeaderBased => {
                let designated = spec.leader.clone().or(directory_leader);
                match designated {
                    Some(id) if eligible.iter().any(|(e, _)| *e == id) => (
                        spec.threshold.unwrap_or(Strategy::LeaderBased.default_threshold()),
                        Some(id),
                    ),
                    _ => (Strategy::SimpleMajority.default_threshold(), None),
                }
            }
            other => (spec.threshold.unwrap_or(other.default_threshold()), None),
        };

        let deadline_ms = spec.deadline_ms.or(self.config.default_deadline_ms);
        let proposal = Proposal {
            id: Uuid::new_v4().to_string(),
            scope_id: spec.scope_id,
            payload: spec.payload,
            strategy: spec.strategy,
            threshold,
            proposer: spec.proposer,
            leader,
            created_at: now,
            deadline: deadline_ms.map(|ms| now + ChronoDuration::milliseconds(ms as i64)),
            eligible,
            votes: HashMap::new(),
            outcome: Outcome::Pending,
            resolved_at: None,
        };

        info!(
            "Voting: Created proposal {} ({}, threshold {}, {} eligible)",
            proposal.id,
            proposal.strategy,
            proposal.threshold,
            proposal.eligible.len()
        );

        let mut state = self.state.lock();
        if proposal.eligible.is_empty() {
            warn!("Voting: Proposal {} has no eligible voters", proposal.id);
            let resolved = self.resolve(&mut state, proposal, Outcome::NoQuorum, now);
            return Ok(resolved);
        }

        state.active.insert(proposal.id.clone(), proposal.clone());
        Ok(proposal)
    }

    pub fn submit_vote(
        &self,
        proposal_id: &str,
        node_id: &str,
        decision: Decision,
        reason: Option<String>,
    ) -> Result<VoteReceipt> {
        self.submit_vote_at(proposal_id, node_id, decision, reason, Utc::now())
    }

    /// Vote with an untyped JSON decision; non-booleans are rejected
    pub fn submit_raw_vote(
        &self,
        proposal_id: &str,
        node_id: &str,
        decision: &Value,
        reason: Option<String>,
    ) -> Result<VoteReceipt> {
        let decision = Decision::from_json(decision)?;
        self.submit_vote(proposal_id, node_id, decision, reason)
    }

    pub fn submit_vote_at(
        &self,
        proposal_id: &str,
        node_id: &str,
        decision: Decision,
        reason: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<VoteReceipt> {
        let mut state = self.state.lock();

        if !state.active.contains_key(proposal_id) {
            if let Some(done) = state.history.iter().find(|p| p.id == proposal_id) {
                debug!(
                    "Voting: Ignoring vote from {} on resolved proposal {}",
                    node_id, proposal_id
                );
                return Ok(VoteReceipt::Ignored(done.outcome));
            }
            return Err(Error::InvalidVote(format!("unknown proposal {}", proposal_id)));
        }

        let proposal = match state.active.get_mut(proposal_id) {
            Some(p) => p,
            None => return Err(Error::InvalidVote(format!("unknown proposal {}", proposal_id))),
        };

        if !proposal.is_eligible(node_id) {
            return Err(Error::InvalidVote(format!(
                "{} is not an eligible voter for {}",
                node_id, proposal_id
            )));
        }

        let weight = proposal.weight_of(node_id);
        proposal.votes.insert(
            node_id.to_string(),
            Vote {
                proposal_id: proposal_id.to_string(),
                node_id: node_id.to_string(),
                decision,
                weight,
                timestamp: now,
                reason,
            },
        );
        debug!("Voting: {} voted {:?} on {}", node_id, decision, proposal_id);

        let outcome = self.check_locked(&mut state, proposal_id, now);
        Ok(VoteReceipt::Recorded(outcome))
    }

    pub fn check_consensus(&self, proposal_id: &str) -> Result<Outcome> {
        self.check_consensus_at(proposal_id, Utc::now())
    }

    /// Re-evaluate one proposal; repeated checks are no-ops once resolved
    pub fn check_consensus_at(&self, proposal_id: &str, now: DateTime<Utc>) -> Result<Outcome> {
        let mut state = self.state.lock();
        if !state.active.contains_key(proposal_id) {
            return state
                .history
                .iter()
                .find(|p| p.id == proposal_id)
                .map(|p| p.outcome)
                .ok_or_else(|| Error::InvalidVote(format!("unknown proposal {}", proposal_id)));
        }
        Ok(self.check_locked(&mut state, proposal_id, now))
    }

    pub fn sweep(&self) -> Vec<(String, Outcome)> {
        self.sweep_at(Utc::now())
    }

    /// Evaluate every open proposal; returns the ones resolved by this call
    pub fn sweep_at(&self, now: DateTime<Utc>) -> Vec<(String, Outcome)> {
        let mut state = self.state.lock();
        let ids: Vec<String> = state.active.keys().cloned().collect();
        let mut resolved = Vec::new();
        for id in ids {
            let outcome = self.check_locked(&mut state, &id, now);
            if outcome.is_resolved() {
                resolved.push((id, outcome));
            }
        }
        resolved
    }

    /// Open or resolved proposal by id
    pub fn proposal(&self, proposal_id: &str) -> Option<Proposal> {
        let state = self.state.lock();
        state
            .active
            .get(proposal_id)
            .or_else(|| state.history.iter().find(|p| p.id == proposal_id))
            .cloned()
    }

    pub fn active_proposals(&self) -> Vec<Proposal> {
        let mut active: Vec<Proposal> = self.state.lock().active.values().cloned().collect();
        active.sort_by_key(|p| p.created_at);
        active
    }

    /// Resolved proposals, oldest first
    pub fn history(&self) -> Vec<Proposal> {
        self.state.lock().history.iter().cloned().collect()
    }

    /// Resolved proposals of one scope
    pub fn history_for_scope(&self, scope_id: &str) -> Vec<Proposal> {
        self.state
            .lock()
            .history
            .iter()
            .filter(|p| p.scope_id == scope_id)
            .cloned()
            .collect()
    }

    /// Ask the advisor what `voter` should vote on an open proposal
    pub fn recommend(&self, proposal_id: &str, voter: &str) -> Result<Option<Recommendation>> {
        let proposal = self
            .state
            .lock()
            .active
            .get(proposal_id)
            .cloned()
            .ok_or_else(|| Error::InvalidVote(format!("no open proposal {}", proposal_id)))?;
        let record = self
            .directory
            .read()
            .get(voter)
            .cloned()
            .ok_or_else(|| Error::InvalidVote(format!("unknown voter {}", voter)))?;
        Ok(self.advisor.recommend(&proposal, &record))
    }

    fn check_locked(&self, state: &mut EngineState, proposal_id: &str, now: DateTime<Utc>) -> Outcome {
        let outcome = match state.active.get(proposal_id) {
            Some(p) => p.evaluate(now),
            None => return Outcome::Pending,
        };
        if !outcome.is_resolved() {
            return outcome;
        }
        if let Some(proposal) = state.active.remove(proposal_id) {
            self.resolve(state, proposal, outcome, now);
        }
        outcome
    }

    fn resolve(
        &self,
        state: &mut EngineState,
        mut proposal: Proposal,
        outcome: Outcome,
        now: DateTime<Utc>,
    ) -> Proposal {
        proposal.outcome = outcome;
        proposal.resolved_at = Some(now);
        let tally = proposal.tally();

        info!(
            "Voting: Proposal {} resolved {:?} (approve {:.3}, participation {:.3})",
            proposal.id,
            outcome,
            tally.approve_ratio(),
            tally.participation()
        );

        let _ = self.notices.send(ProposalResolved {
            proposal_id: proposal.id.clone(),
            scope_id: proposal.scope_id.clone(),
            outcome,
            tally,
        });

        state.history.push_back(proposal.clone());
        while state.history.len() > self.config.history_limit.max(1) {
            state.history.pop_front();
        }
        proposal
    }
}

/// Periodically sweep deadlines until the engine is dropped
pub fn spawn_sweeper(engine: &SharedVotingEngine) -> JoinHandle<()> {
    let weak: Weak<VotingEngine> = Arc::downgrade(engine);
    let period = engine.config.sweep_interval();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        loop {
            ticker.tick().await;
            let engine = match weak.upgrade() {
                Some(engine) => engine,
                None => break,
            };
            for (id, outcome) in engine.sweep() {
                debug!("Voting: Sweep resolved {} as {:?}", id, outcome);
            }
        }
    })
}
