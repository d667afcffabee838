//! Execution plans: strategy phase tables and per-topology coordination.

use super::TopologyKind;
use crate::directory::NodeRecord;
use crate::error::{Error, Result};
use crate::types::{NodeId, Role};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStrategy {
    Parallel,
    Sequential,
    Adaptive,
    Consensus,
}

impl FromStr for TaskStrategy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "parallel" => Ok(TaskStrategy::Parallel),
            "sequential" => Ok(TaskStrategy::Sequential),
            "adaptive" => Ok(TaskStrategy::Adaptive),
            "consensus" => Ok(TaskStrategy::Consensus),
            other => Err(Error::Configuration(format!("unknown task strategy {:?}", other))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Complexity {
    Simple,
    #[default]
    Moderate,
    Complex,
    Critical,
}

/// Declared shape of a task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskSpec {
    pub name: String,
    pub strategy: TaskStrategy,
    #[serde(default)]
    pub complexity: Complexity,
    #[serde(default)]
    pub dependencies: Vec<String>,
}

impl TaskSpec {
    pub fn new(name: impl Into<String>, strategy: TaskStrategy) -> Self {
        Self {
            name: name.into(),
            strategy,
            complexity: Complexity::default(),
            dependencies: Vec::new(),
        }
    }

    pub fn with_complexity(mut self, complexity: Complexity) -> Self {
        self.complexity = complexity;
        self
    }

    pub fn with_dependencies<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dependencies = deps.into_iter().map(Into::into).collect();
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Assigned,
    Executing,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseKind {
    Work,
    /// Hub synchronisation point inserted by star coordination
    Checkpoint,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Phase {
    pub name: String,
    pub kind: PhaseKind,
    /// Higher runs earlier under hierarchical coordination
    pub priority: u8,
    pub parallelizable: bool,
    pub nodes: Vec<NodeId>,
}

impl Phase {
    fn work(name: &str, priority: u8, parallelizable: bool) -> Self {
        Self {
            name: name.to_string(),
            kind: PhaseKind::Work,
            priority,
            parallelizable,
            nodes: Vec::new(),
        }
    }

    fn checkpoint(after: &str, hub: &NodeId) -> Self {
        Self {
            name: format!("checkpoint_after_{}", after),
            kind: PhaseKind::Checkpoint,
            priority: 0,
            parallelizable: false,
            nodes: vec![hub.clone()],
        }
    }
}

/// Ordered, assigned phases of a task under one topology
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionPlan {
    pub strategy: TaskStrategy,
    pub topology: TopologyKind,
    pub phases: Vec<Phase>,
}

impl ExecutionPlan {
    /// Build the phase table for `strategy` and coordinate it over `nodes`
    /// (registration order)
    pub fn build(strategy: TaskStrategy, topology: TopologyKind, nodes: &[NodeRecord]) -> Self {
        let phases = coordinate(topology, phase_template(strategy), nodes);
        Self {
            strategy,
            topology,
            phases,
        }
    }

    /// First node assigned in the plan
    pub fn first_node(&self) -> Option<&NodeId> {
        self.phases.iter().find_map(|p| p.nodes.first())
    }

    pub fn phase_names(&self) -> Vec<&str> {
        self.phases.iter().map(|p| p.name.as_str()).collect()
    }
}

/// Phases per task strategy
pub fn phase_template(strategy: TaskStrategy) -> Vec<Phase> {
    match strategy {
        TaskStrategy::Parallel => vec![
            Phase::work("initialization", 3, false),
            Phase::work("parallel_execution", 2, true),
            Phase::work("aggregation", 1, false),
        ],
        TaskStrategy::Sequential => vec![
            Phase::work("initialization", 4, false),
            Phase::work("step_execution", 3, false),
            Phase::work("validation", 2, false),
            Phase::work("finalization", 1, false),
        ],
        TaskStrategy::Adaptive => vec![
            Phase::work("analysis", 4, false),
            Phase::work("strategy_selection", 3, false),
            Phase::work("execution", 2, true),
            Phase::work("optimization", 1, true),
        ],
        TaskStrategy::Consensus => vec![
            Phase::work("proposal", 4, false),
            Phase::work("voting", 3, true),
            Phase::work("consensus_resolution", 2, false),
            Phase::work("commitment", 1, false),
        ],
    }
}

/// Nodes ordered by weight, heaviest first; ties keep registration order
fn by_weight(nodes: &[NodeRecord]) -> Vec<&NodeRecord> {
    let mut sorted: Vec<&NodeRecord> = nodes.iter().collect();
    sorted.sort_by(|a, b| b.weight.partial_cmp(&a.weight).unwrap_or(std::cmp::Ordering::Equal));
    sorted
}

/// Assign nodes and reorder phases for the topology
pub fn coordinate(topology: TopologyKind, mut phases: Vec<Phase>, nodes: &[NodeRecord]) -> Vec<Phase> {
    if nodes.is_empty() {
        return phases;
    }

    match topology {
        TopologyKind::Hierarchical => {
            phases.sort_by(|a, b| b.priority.cmp(&a.priority));
            let weighted = by_weight(nodes);
            let leader = nodes
                .iter()
                .find(|r| r.role == Role::Leader)
                .unwrap_or(weighted[0]);
            let mut team = vec![leader.id.clone()];
            team.extend(
                weighted
                    .iter()
                    .filter(|r| r.id != leader.id)
                    .take(2)
                    .map(|r| r.id.clone()),
            );
            for phase in &mut phases {
                phase.nodes = team.clone();
            }
            phases
        }
        TopologyKind::Ring => {
            let n = nodes.len();
            let width = n.min(3);
            for (i, phase) in phases.iter_mut().enumerate() {
                phase.nodes = (0..width).map(|k| nodes[(i + k) % n].id.clone()).collect();
            }
            phases
        }
        TopologyKind::Mesh => {
            let (mut parallel, sequential): (Vec<Phase>, Vec<Phase>) =
                phases.into_iter().partition(|p| p.parallelizable);
            parallel.extend(sequential);
            let team: Vec<NodeId> = by_weight(nodes).iter().take(4).map(|r| r.id.clone()).collect();
            for phase in &mut parallel {
                phase.nodes = team.clone();
            }
            parallel
        }
        TopologyKind::Star => {
            let hub = &nodes[0].id;
            let team: Vec<NodeId> = nodes.iter().map(|r| r.id.clone()).collect();
            let count = phases.len();
            let mut out = Vec::with_capacity(count * 2);
            for (i, mut phase) in phases.into_iter().enumerate() {
                phase.nodes = team.clone();
                let name = phase.name.clone();
                out.push(phase);
                if i + 1 < count {
                    out.push(Phase::checkpoint(&name, hub));
                }
            }
            out
        }
    }
}
