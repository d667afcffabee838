//! Adaptive communication topology.
//!
//! The [`TopologyManager`] picks a topology per task, keeps the node set,
//! links and a full routing table consistent with the cluster directory, and
//! builds execution plans coordinated for the current topology. Switching
//! replaces nodes, links and routes under one write lock; readers never see
//! a half-built table.

pub mod plan;
pub mod routing;

pub use plan::{Complexity, ExecutionPlan, Phase, PhaseKind, TaskSpec, TaskStatus, TaskStrategy};
pub use routing::{Connection, CostModel, EdgeKind, FixedLatency, RandomLatency, Route, RoutingTable};

use crate::config::TopologyConfig;
use crate::directory::{NodeRecord, SharedDirectory};
use crate::error::{Error, Result};
use crate::metrics::RollingAverage;
use crate::types::NodeId;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Channel capacity for performance warnings
const CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TopologyKind {
    Mesh,
    Star,
    Ring,
    Hierarchical,
}

impl TopologyKind {
    pub const ALL: [TopologyKind; 4] = [
        TopologyKind::Mesh,
        TopologyKind::Star,
        TopologyKind::Ring,
        TopologyKind::Hierarchical,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TopologyKind::Mesh => "mesh",
            TopologyKind::Star => "star",
            TopologyKind::Ring => "ring",
            TopologyKind::Hierarchical => "hierarchical",
        }
    }
}

impl std::fmt::Display for TopologyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TopologyKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        TopologyKind::ALL
            .iter()
            .copied()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| Error::Configuration(format!("unsupported topology {:?}", s)))
    }
}

/// Live load used by adaptive selection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadSnapshot {
    pub node_count: usize,
    pub active_tasks: usize,
}

/// Topology for a task, given the current load
pub fn select_topology(task: &TaskSpec, load: LoadSnapshot) -> TopologyKind {
    if task.complexity == Complexity::Critical {
        return TopologyKind::Hierarchical;
    }
    if task.strategy == TaskStrategy::Parallel && task.complexity == Complexity::Complex {
        return TopologyKind::Mesh;
    }
    if task.strategy == TaskStrategy::Sequential || task.dependencies.len() > 2 {
        return TopologyKind::Ring;
    }
    match task.strategy {
        TaskStrategy::Consensus => TopologyKind::Star,
        TaskStrategy::Adaptive => {
            if load.node_count >= 4 && load.active_tasks <= load.node_count / 2 {
                TopologyKind::Mesh
            } else if load.active_tasks > load.node_count {
                TopologyKind::Star
            } else {
                TopologyKind::Hierarchical
            }
        }
        _ => TopologyKind::Hierarchical,
    }
}

/// A task tracked by the manager
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: String,
    pub spec: TaskSpec,
    pub status: TaskStatus,
    pub plan: ExecutionPlan,
    pub created_at: DateTime<Utc>,
    #[serde(skip)]
    pub started: Option<Instant>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Task {
    pub fn is_in_flight(&self) -> bool {
        matches!(
            self.status,
            TaskStatus::Pending | TaskStatus::Assigned | TaskStatus::Executing
        )
    }
}

/// Raised when a topology's success rate drops below the floor
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PerformanceWarning {
    pub topology: TopologyKind,
    pub success_rate: f64,
    pub samples: u64,
    /// Configured replacement, if any
    pub failover: Option<TopologyKind>,
}

/// Snapshot of per-topology metrics
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TopologyMetrics {
    pub usage_count: u64,
    pub samples: u64,
    pub average_execution_ms: f64,
    pub success_rate: f64,
}

#[derive(Debug, Clone)]
struct TopologyStats {
    usage_count: u64,
    samples: u64,
    execution_ms: RollingAverage,
    successes: RollingAverage,
}

impl TopologyStats {
    fn new(window: usize) -> Self {
        Self {
            usage_count: 0,
            samples: 0,
            execution_ms: RollingAverage::new(window),
            successes: RollingAverage::new(window),
        }
    }

    fn snapshot(&self) -> TopologyMetrics {
        TopologyMetrics {
            usage_count: self.usage_count,
            samples: self.samples,
            average_execution_ms: self.execution_ms.average(),
            success_rate: if self.successes.is_empty() {
                1.0
            } else {
                self.successes.average()
            },
        }
    }
}

struct TopologyState {
    kind: TopologyKind,
    nodes: Vec<NodeId>,
    connections: Vec<Connection>,
    routes: RoutingTable,
}

/// Shared reference to a TopologyManager
pub type SharedTopologyManager = Arc<TopologyManager>;

pub struct TopologyManager {
    directory: SharedDirectory,
    config: TopologyConfig,
    cost: Arc<dyn CostModel>,
    topology: RwLock<TopologyState>,
    tasks: Mutex<HashMap<String, Task>>,
    /// Finished task ids in completion order; locked after `tasks`
    finished: Mutex<VecDeque<String>>,
    stats: Mutex<HashMap<TopologyKind, TopologyStats>>,
    /// Topologies flagged by a performance warning
    degraded: Mutex<HashSet<TopologyKind>>,
    warnings: broadcast::Sender<PerformanceWarning>,
}

impl TopologyManager {
    pub fn new(directory: SharedDirectory, config: TopologyConfig) -> Self {
        Self::with_cost_model(directory, config, Arc::new(RandomLatency::default()))
    }

    pub fn with_cost_model(
        directory: SharedDirectory,
        config: TopologyConfig,
        cost: Arc<dyn CostModel>,
    ) -> Self {
        let (warnings, _) = broadcast::channel(CHANNEL_CAPACITY);
        let kind = config.initial;
        let manager = Self {
            directory,
            config,
            cost,
            topology: RwLock::new(TopologyState {
                kind,
                nodes: Vec::new(),
                connections: Vec::new(),
                routes: HashMap::new(),
            }),
            tasks: Mutex::new(HashMap::new()),
            finished: Mutex::new(VecDeque::new()),
            stats: Mutex::new(HashMap::new()),
            degraded: Mutex::new(HashSet::new()),
            warnings,
        };
        manager.rebuild(kind);
        manager
    }

    pub fn shared(self) -> SharedTopologyManager {
        Arc::new(self)
    }

    pub fn subscribe_warnings(&self) -> broadcast::Receiver<PerformanceWarning> {
        self.warnings.subscribe()
    }

    pub fn kind(&self) -> TopologyKind {
        self.topology.read().kind
    }

    pub fn nodes(&self) -> Vec<NodeId> {
        self.topology.read().nodes.clone()
    }

    pub fn connections(&self) -> Vec<Connection> {
        self.topology.read().connections.clone()
    }

    pub fn routing_table(&self) -> RoutingTable {
        self.topology.read().routes.clone()
    }

    /// Precomputed route; None for unknown nodes or `from == to`
    pub fn route(&self, from: &str, to: &str) -> Option<Route> {
        self.topology
            .read()
            .routes
            .get(&(from.to_string(), to.to_string()))
            .cloned()
    }

    pub fn next_hop(&self, from: &str, to: &str) -> Option<NodeId> {
        self.route(from, to).and_then(|r| r.first().cloned())
    }

    /// Switch by name; unsupported names leave everything unchanged
    pub fn switch_to_named(&self, name: &str) -> Result<()> {
        let kind: TopologyKind = name.parse()?;
        self.switch_to(kind);
        Ok(())
    }

    /// Rebuild for `kind` and re-plan every in-flight task
    pub fn switch_to(&self, kind: TopologyKind) {
        let previous = self.kind();
        self.rebuild(kind);
        info!("Topology: Switched from {} to {}", previous, kind);
        self.replan_in_flight();
    }

    /// Pick up directory membership changes
    pub fn refresh_nodes(&self) -> bool {
        let current = self.directory.read().ids();
        let (changed, kind) = {
            let topology = self.topology.read();
            (topology.nodes != current, topology.kind)
        };
        if changed {
            debug!("Topology: Node set changed, rebuilding {}", kind);
            self.rebuild(kind);
            self.replan_in_flight();
        }
        changed
    }

    fn rebuild(&self, kind: TopologyKind) {
        let nodes = self.directory.read().ids();
        let mut topology = self.topology.write();
        topology.connections = routing::build_connections(kind, &nodes, self.cost.as_ref());
        topology.routes = routing::build_routing_table(kind, &nodes);
        topology.nodes = nodes;
        topology.kind = kind;
    }

    fn node_records(&self) -> Vec<NodeRecord> {
        let nodes = self.nodes();
        let directory = self.directory.read();
        nodes
            .iter()
            .filter_map(|id| directory.get(id).cloned())
            .collect()
    }

    fn replan_in_flight(&self) {
        let kind = self.kind();
        let records = self.node_records();
        let mut tasks = self.tasks.lock();
        for task in tasks.values_mut().filter(|t| t.is_in_flight()) {
            task.plan = ExecutionPlan::build(task.spec.strategy, kind, &records);
            debug!("Topology: Re-planned task {} for {}", task.id, kind);
        }
    }

    pub fn load(&self) -> LoadSnapshot {
        let active_tasks = self
            .tasks
            .lock()
            .values()
            .filter(|t| t.is_in_flight())
            .count();
        LoadSnapshot {
            node_count: self.directory.read().len(),
            active_tasks,
        }
    }

    /// Selected topology after applying failover for degraded types
    pub fn select_for(&self, spec: &TaskSpec) -> TopologyKind {
        let selected = select_topology(spec, self.load());
        if self.degraded.lock().contains(&selected) {
            if let Some(failover) = self.config.failover.get(&selected) {
                info!("Topology: {} is degraded, failing over to {}", selected, failover);
                return *failover;
            }
        }
        selected
    }

    /// Register a task, switching topology if the task calls for another one
    pub fn submit_task(&self, spec: TaskSpec) -> Task {
        let kind = self.select_for(&spec);
        if kind != self.kind() {
            self.switch_to(kind);
        } else {
            self.refresh_nodes();
        }

        let records = self.node_records();
        let plan = ExecutionPlan::build(spec.strategy, kind, &records);
        let status = if plan.first_node().is_some() {
            TaskStatus::Assigned
        } else {
            TaskStatus::Pending
        };
        let task = Task {
            id: Uuid::new_v4().to_string(),
            spec,
            status,
            plan,
            created_at: Utc::now(),
            started: None,
            finished_at: None,
        };

        self.stats
            .lock()
            .entry(kind)
            .or_insert_with(|| TopologyStats::new(self.config.rolling_window))
            .usage_count += 1;

        info!(
            "Topology: Task {} ({}) planned on {} with {} phases",
            task.id,
            task.spec.name,
            kind,
            task.plan.phases.len()
        );
        self.tasks.lock().insert(task.id.clone(), task.clone());
        task
    }

    pub fn start_task(&self, task_id: &str) -> Result<()> {
        let mut tasks = self.tasks.lock();
        let task = tasks
            .get_mut(task_id)
            .ok_or_else(|| Error::Configuration(format!("unknown task {}", task_id)))?;
        if !task.is_in_flight() {
            return Err(Error::Configuration(format!("task {} already finished", task_id)));
        }
        task.status = TaskStatus::Executing;
        task.started.get_or_insert_with(Instant::now);
        Ok(())
    }

    /// Finish a task and record its outcome against its plan's topology
    pub fn complete_task(&self, task_id: &str, success: bool) -> Result<Task> {
        let task = {
            let mut tasks = self.tasks.lock();
            let task = tasks
                .get_mut(task_id)
                .ok_or_else(|| Error::Configuration(format!("unknown task {}", task_id)))?;
            if !task.is_in_flight() {
                return Err(Error::Configuration(format!("task {} already finished", task_id)));
            }
            task.status = if success {
                TaskStatus::Completed
            } else {
                TaskStatus::Failed
            };
            task.finished_at = Some(Utc::now());
            let task = task.clone();
            self.evict_finished(&mut tasks, task.id.clone());
            task
        };

        let elapsed = task.started.map(|s| s.elapsed()).unwrap_or_default();
        self.record_execution(task.plan.topology, elapsed, success);
        Ok(task)
    }

    /// Keep at most `finished_task_limit` finished tasks, dropping the oldest
    fn evict_finished(&self, tasks: &mut HashMap<String, Task>, done: String) {
        let limit = self.config.finished_task_limit.max(1);
        let mut finished = self.finished.lock();
        finished.push_back(done);
        while finished.len() > limit {
            if let Some(id) = finished.pop_front() {
                tasks.remove(&id);
                debug!("Topology: Evicted finished task {}", id);
            }
        }
    }

    /// Add one execution sample for a topology
    pub fn record_execution(&self, kind: TopologyKind, elapsed: Duration, success: bool) {
        let snapshot = {
            let mut stats = self.stats.lock();
            let entry = stats
                .entry(kind)
                .or_insert_with(|| TopologyStats::new(self.config.rolling_window));
            entry.samples += 1;
            entry.execution_ms.push(elapsed.as_secs_f64() * 1000.0);
            entry.successes.push(if success { 1.0 } else { 0.0 });
            entry.snapshot()
        };

        if snapshot.samples >= self.config.min_samples
            && snapshot.success_rate < self.config.success_rate_floor
        {
            let warning = PerformanceWarning {
                topology: kind,
                success_rate: snapshot.success_rate,
                samples: snapshot.samples,
                failover: self.config.failover.get(&kind).copied(),
            };
            warn!(
                "Topology: {} success rate {:.2} below {:.2}",
                kind, snapshot.success_rate, self.config.success_rate_floor
            );
            self.degraded.lock().insert(kind);
            let _ = self.warnings.send(warning);
        } else {
            self.degraded.lock().remove(&kind);
        }
    }

    pub fn task(&self, task_id: &str) -> Option<Task> {
        self.tasks.lock().get(task_id).cloned()
    }

    /// All tasks, oldest first
    pub fn tasks(&self) -> Vec<Task> {
        let mut tasks: Vec<Task> = self.tasks.lock().values().cloned().collect();
        tasks.sort_by_key(|t| t.created_at);
        tasks
    }

    pub fn metrics(&self) -> HashMap<TopologyKind, TopologyMetrics> {
        self.stats
            .lock()
            .iter()
            .map(|(kind, stats)| (*kind, stats.snapshot()))
            .collect()
    }
}
