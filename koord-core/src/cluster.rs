//! In-process multi-node cluster.
//!
//! Runs a set of [`ElectionNode`]s connected through a [`MemoryNetwork`] so
//! elections, replication and partitions can be exercised without sockets.

use crate::config::ElectionConfig;
use crate::directory::{ClusterDirectory, NodeRecord, SharedDirectory};
use crate::election::ElectionCore;
use crate::error::{Error, Result};
use crate::log::LogEntry;
use crate::node::{ElectionNode, NodeHandle, NodeStatus};
use crate::transport::MemoryNetwork;
use crate::types::{NodeId, Role};
use chrono::Utc;
use serde_json::Value;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info};

pub struct LocalCluster {
    network: MemoryNetwork,
    nodes: Vec<NodeHandle>,
    tasks: Vec<JoinHandle<()>>,
    directory: SharedDirectory,
    config: ElectionConfig,
}

impl LocalCluster {
    /// Start `size` nodes named `node-1` .. `node-N`
    pub fn start(size: usize, config: ElectionConfig) -> Self {
        let ids = (1..=size).map(|i| format!("node-{}", i)).collect();
        Self::with_ids(ids, config)
    }

    /// Start one node per id; must be called inside a tokio runtime
    pub fn with_ids(ids: Vec<NodeId>, config: ElectionConfig) -> Self {
        let network = MemoryNetwork::new();
        let mut directory = ClusterDirectory::new();
        let mut nodes = Vec::with_capacity(ids.len());
        let mut tasks = Vec::with_capacity(ids.len());

        for id in &ids {
            directory.register(NodeRecord::new(id.clone()));
            let core = ElectionCore::new(id.clone(), ids.clone(), config.clone());
            let node = ElectionNode::new(core, network.endpoint(id.clone()));
            network.attach(id.clone(), node.handle().mailbox());
            let (handle, task) = node.spawn();
            nodes.push(handle);
            tasks.push(task);
        }

        info!("Cluster: Started {} nodes", ids.len());
        Self {
            network,
            nodes,
            tasks,
            directory: directory.shared(),
            config,
        }
    }

    pub fn network(&self) -> &MemoryNetwork {
        &self.network
    }

    pub fn directory(&self) -> SharedDirectory {
        self.directory.clone()
    }

    pub fn ids(&self) -> Vec<NodeId> {
        self.nodes.iter().map(|n| n.node_id().clone()).collect()
    }

    pub fn handles(&self) -> &[NodeHandle] {
        &self.nodes
    }

    pub fn node(&self, id: &str) -> Option<&NodeHandle> {
        self.nodes.iter().find(|n| n.node_id() == id)
    }

    /// Status of every running node
    pub async fn statuses(&self) -> Vec<NodeStatus> {
        let mut statuses = Vec::with_capacity(self.nodes.len());
        for node in &self.nodes {
            if let Ok(status) = node.status().await {
                statuses.push(status);
            }
        }
        statuses
    }

    /// Leader with the highest term, if any
    pub async fn leader(&self) -> Option<NodeStatus> {
        self.statuses()
            .await
            .into_iter()
            .filter(|s| s.role == Role::Leader)
            .max_by_key(|s| s.term)
    }

    /// Poll until a leader is known to a majority of running nodes
    pub async fn wait_for_leader(&self, timeout: Duration) -> Result<NodeStatus> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(leader) = self.leader().await {
                let statuses = self.statuses().await;
                let followers = statuses
                    .iter()
                    .filter(|s| s.term == leader.term && s.leader.as_ref() == Some(&leader.node_id))
                    .count();
                if followers > statuses.len() / 2 {
                    debug!("Cluster: {} leads term {}", leader.node_id, leader.term);
                    return Ok(leader);
                }
            }
            if Instant::now() >= deadline {
                return Err(Error::Quorum(format!("no leader within {:?}", timeout)));
            }
            tokio::time::sleep(self.config.heartbeat_interval()).await;
        }
    }

    /// Submit through the current leader
    pub async fn submit(&self, key: impl Into<String>, value: Value) -> Result<LogEntry> {
        let leader = self
            .leader()
            .await
            .ok_or(Error::NotLeader { leader: None })?;
        let handle = self
            .node(&leader.node_id)
            .ok_or(Error::NotLeader { leader: None })?;
        handle.submit(key, value).await
    }

    /// Copy observed roles and terms into the shared directory
    pub async fn sync_directory(&self) {
        let statuses = self.statuses().await;
        let now = Utc::now();
        let mut directory = self.directory.write();
        for status in statuses {
            directory.observe(&status.node_id, status.role, status.term, now);
        }
    }

    pub fn partition(&self, left: &[NodeId], right: &[NodeId]) {
        self.network.partition(left, right);
    }

    pub fn isolate(&self, id: &str) {
        self.network.isolate(id);
    }

    pub fn heal(&self) {
        self.network.heal();
    }

    /// Stop a single node (crash)
    pub fn stop(&self, id: &str) {
        if let Some(node) = self.node(id) {
            node.shutdown();
            self.network.detach(id);
            info!("Cluster: Stopped {}", id);
        }
    }

    pub async fn shutdown(self) {
        for node in &self.nodes {
            node.shutdown();
        }
        for task in self.tasks {
            let _ = task.await;
        }
        info!("Cluster: Shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test(start_paused = true)]
    async fn test_three_nodes_elect_one_leader() {
        let cluster = LocalCluster::start(3, ElectionConfig::default());
        let leader = cluster.wait_for_leader(Duration::from_secs(5)).await.unwrap();

        let leaders = cluster
            .statuses()
            .await
            .into_iter()
            .filter(|s| s.role == Role::Leader && s.term == leader.term)
            .count();
        assert_eq!(leaders, 1);

        cluster.sync_directory().await;
        let dir_leader = cluster.directory().read().leader().map(|r| r.id.clone());
        assert_eq!(dir_leader, Some(leader.node_id.clone()));

        cluster.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_submit_replicates_to_followers() {
        let cluster = LocalCluster::start(3, ElectionConfig::default());
        cluster.wait_for_leader(Duration::from_secs(5)).await.unwrap();

        let entry = cluster.submit("setpoint", json!(42)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;

        for status in cluster.statuses().await {
            assert!(status.commit_index >= entry.index, "{:?}", status);
        }
        cluster.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_isolated_leader_is_replaced() {
        let cluster = LocalCluster::start(5, ElectionConfig::default());
        let first = cluster.wait_for_leader(Duration::from_secs(5)).await.unwrap();

        cluster.isolate(&first.node_id);
        tokio::time::sleep(Duration::from_secs(2)).await;

        let statuses = cluster.statuses().await;
        let new_leader = statuses
            .iter()
            .filter(|s| s.role == Role::Leader && s.node_id != first.node_id)
            .max_by_key(|s| s.term)
            .expect("majority side elects a new leader");
        assert!(new_leader.term > first.term);

        cluster.heal();
        tokio::time::sleep(Duration::from_secs(1)).await;
        let old = cluster.node(&first.node_id).unwrap().status().await.unwrap();
        assert_eq!(old.role, Role::Follower);
        assert!(old.term >= new_leader.term);

        cluster.shutdown().await;
    }
}
