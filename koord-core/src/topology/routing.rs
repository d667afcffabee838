//! Route computation and link construction per topology type.
//!
//! A route is the list of hops after the source, ending at the destination;
//! its first element is the next hop.

use super::TopologyKind;
use crate::types::NodeId;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

pub type Route = Vec<NodeId>;

/// Precomputed route for every ordered pair of distinct nodes
pub type RoutingTable = HashMap<(NodeId, NodeId), Route>;

/// Kind of link, used by cost models
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeKind {
    /// Mesh peer link
    Peer,
    /// Star hub to peripheral
    Spoke,
    /// Ring neighbour
    Ring,
    /// Hierarchical parent to child
    Tree,
}

/// Directed-agnostic link between two nodes
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Connection {
    pub from: NodeId,
    pub to: NodeId,
    pub kind: EdgeKind,
    pub latency: Duration,
}

/// Latency source for new links
pub trait CostModel: Send + Sync {
    fn sample_latency(&self, edge: EdgeKind) -> Duration;
}

/// Uniformly random latency within a per-edge range
#[derive(Debug, Clone)]
pub struct RandomLatency {
    ranges: HashMap<EdgeKind, (u64, u64)>,
}

impl Default for RandomLatency {
    fn default() -> Self {
        let mut ranges = HashMap::new();
        ranges.insert(EdgeKind::Peer, (5, 25));
        ranges.insert(EdgeKind::Spoke, (2, 10));
        ranges.insert(EdgeKind::Ring, (5, 15));
        ranges.insert(EdgeKind::Tree, (3, 12));
        Self { ranges }
    }
}

impl RandomLatency {
    /// Override the range (milliseconds, inclusive) of one edge kind
    pub fn with_range(mut self, edge: EdgeKind, min_ms: u64, max_ms: u64) -> Self {
        self.ranges.insert(edge, (min_ms.min(max_ms), min_ms.max(max_ms)));
        self
    }
}

impl CostModel for RandomLatency {
    fn sample_latency(&self, edge: EdgeKind) -> Duration {
        let (min, max) = self.ranges.get(&edge).copied().unwrap_or((5, 25));
        Duration::from_millis(rand::thread_rng().gen_range(min..=max))
    }
}

/// Same latency for every link
#[derive(Debug, Clone, Copy)]
pub struct FixedLatency(pub Duration);

impl CostModel for FixedLatency {
    fn sample_latency(&self, _edge: EdgeKind) -> Duration {
        self.0
    }
}

/// Children per node in the hierarchical tree: ceil(sqrt(n)), at least 2
pub fn branching_factor(n: usize) -> usize {
    let b = (n as f64).sqrt().ceil() as usize;
    b.max(2)
}

fn parent(index: usize, branching: usize) -> Option<usize> {
    if index == 0 {
        None
    } else {
        Some((index - 1) / branching)
    }
}

/// Indices from `index` up to the root, inclusive
fn ancestry(index: usize, branching: usize) -> Vec<usize> {
    let mut path = vec![index];
    let mut current = index;
    while let Some(p) = parent(current, branching) {
        path.push(p);
        current = p;
    }
    path
}

fn position(nodes: &[NodeId], id: &str) -> Option<usize> {
    nodes.iter().position(|n| n == id)
}

/// Route from `from` to `to` under `kind`; None for unknown or equal nodes
pub fn route(kind: TopologyKind, nodes: &[NodeId], from: &str, to: &str) -> Option<Route> {
    let a = position(nodes, from)?;
    let b = position(nodes, to)?;
    if a == b {
        return None;
    }
    let path = match kind {
        TopologyKind::Mesh => vec![b],
        TopologyKind::Star => {
            if a == 0 || b == 0 {
                vec![b]
            } else {
                vec![0, b]
            }
        }
        TopologyKind::Ring => ring_path(nodes.len(), a, b),
        TopologyKind::Hierarchical => tree_path(nodes.len(), a, b),
    };
    Some(path.into_iter().map(|i| nodes[i].clone()).collect())
}

/// Shorter arc around the ring, forward on ties
fn ring_path(n: usize, a: usize, b: usize) -> Vec<usize> {
    let forward = (b + n - a) % n;
    let backward = (a + n - b) % n;
    if forward <= backward {
        (1..=forward).map(|step| (a + step) % n).collect()
    } else {
        (1..=backward).map(|step| (a + n - step) % n).collect()
    }
}

/// Up the tree towards the root until the common ancestor, then down to `b`.
/// Endpoints in different root subtrees pass through the root; the walk turns
/// below it only where continuing would revisit a node. A direct hop gets one
/// intermediate node when a third node exists.
fn tree_path(n: usize, a: usize, b: usize) -> Vec<usize> {
    let branching = branching_factor(n);
    let up = ancestry(a, branching);
    let down = ancestry(b, branching);

    let (up_len, down_len) = match up.iter().position(|i| down.contains(i)) {
        Some(u) => {
            let common = up[u];
            let d = down.iter().position(|i| *i == common).unwrap_or(down.len() - 1);
            (u, d)
        }
        None => (up.len() - 1, down.len() - 1),
    };

    // Skip the source itself; keep the common ancestor once
    let mut path: Vec<usize> = up[1..=up_len].to_vec();
    if up_len == 0 {
        path.clear();
    }
    let mut descent: Vec<usize> = down[..down_len].to_vec();
    descent.reverse();
    path.extend(descent);

    if path.is_empty() {
        path.push(b);
    }

    if path.len() == 1 {
        let via = [parent(a, branching), Some(0), parent(b, branching)]
            .into_iter()
            .flatten()
            .chain(0..n)
            .find(|i| *i != a && *i != b);
        if let Some(via) = via {
            path.insert(0, via);
        }
    }
    path
}

/// Links of a topology over `nodes`, with sampled latency
pub fn build_connections(kind: TopologyKind, nodes: &[NodeId], cost: &dyn CostModel) -> Vec<Connection> {
    let mut pairs: Vec<(usize, usize, EdgeKind)> = Vec::new();
    let n = nodes.len();
    match kind {
        TopologyKind::Mesh => {
            for i in 0..n {
                for j in (i + 1)..n {
                    pairs.push((i, j, EdgeKind::Peer));
                }
            }
        }
        TopologyKind::Star => {
            for i in 1..n {
                pairs.push((0, i, EdgeKind::Spoke));
            }
        }
        TopologyKind::Ring => {
            if n == 2 {
                pairs.push((0, 1, EdgeKind::Ring));
            } else if n > 2 {
                for i in 0..n {
                    pairs.push((i, (i + 1) % n, EdgeKind::Ring));
                }
            }
        }
        TopologyKind::Hierarchical => {
            let branching = branching_factor(n);
            for i in 1..n {
                if let Some(p) = parent(i, branching) {
                    pairs.push((p, i, EdgeKind::Tree));
                }
            }
        }
    }

    pairs
        .into_iter()
        .map(|(i, j, edge)| Connection {
            from: nodes[i].clone(),
            to: nodes[j].clone(),
            kind: edge,
            latency: cost.sample_latency(edge),
        })
        .collect()
}

/// Routes for every ordered pair of distinct nodes
pub fn build_routing_table(kind: TopologyKind, nodes: &[NodeId]) -> RoutingTable {
    let mut table = HashMap::with_capacity(nodes.len() * nodes.len().saturating_sub(1));
    for from in nodes {
        for to in nodes {
            if from == to {
                continue;
            }
            if let Some(path) = route(kind, nodes, from, to) {
                table.insert((from.clone(), to.clone()), path);
            }
        }
    }
    table
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nodes(n: usize) -> Vec<NodeId> {
        (0..n).map(|i| format!("n{}", i)).collect()
    }

    fn r(kind: TopologyKind, nodes: &[NodeId], a: &str, b: &str) -> Vec<String> {
        route(kind, nodes, a, b).unwrap()
    }

    #[test]
    fn test_mesh_is_single_hop() {
        let ns = nodes(5);
        assert_eq!(r(TopologyKind::Mesh, &ns, "n1", "n4"), vec!["n4"]);
    }

    #[test]
    fn test_star_goes_through_hub() {
        let ns = nodes(4);
        assert_eq!(r(TopologyKind::Star, &ns, "n0", "n3"), vec!["n3"]);
        assert_eq!(r(TopologyKind::Star, &ns, "n2", "n0"), vec!["n0"]);
        assert_eq!(r(TopologyKind::Star, &ns, "n1", "n3"), vec!["n0", "n3"]);
    }

    #[test]
    fn test_ring_takes_shorter_arc() {
        let ns = nodes(6);
        assert_eq!(r(TopologyKind::Ring, &ns, "n0", "n2"), vec!["n1", "n2"]);
        assert_eq!(r(TopologyKind::Ring, &ns, "n0", "n5"), vec!["n5"]);
        assert_eq!(r(TopologyKind::Ring, &ns, "n1", "n5"), vec!["n0", "n5"]);
        // Tie goes forward
        assert_eq!(r(TopologyKind::Ring, &ns, "n0", "n3"), vec!["n1", "n2", "n3"]);
    }

    #[test]
    fn test_hierarchical_never_single_hop() {
        let ns = nodes(9);
        // branching 3: n0 -> n1..n3; n1 -> n4..n6; n2 -> n7, n8
        assert_eq!(branching_factor(9), 3);
        assert_eq!(r(TopologyKind::Hierarchical, &ns, "n4", "n7"), vec!["n1", "n0", "n2", "n7"]);
        assert_eq!(r(TopologyKind::Hierarchical, &ns, "n8", "n3"), vec!["n2", "n0", "n3"]);
        // Siblings turn at their parent instead of climbing to the root
        assert_eq!(r(TopologyKind::Hierarchical, &ns, "n4", "n5"), vec!["n1", "n5"]);
        // Parent/child pairs get an intermediate
        let path = r(TopologyKind::Hierarchical, &ns, "n1", "n4");
        assert_eq!(path.len(), 2);
        assert_eq!(path.last().unwrap(), "n4");
        for a in &ns {
            for b in &ns {
                if a != b {
                    assert!(r(TopologyKind::Hierarchical, &ns, a, b).len() >= 2, "{} -> {}", a, b);
                }
            }
        }
    }

    #[test]
    fn test_hierarchical_two_nodes_is_direct() {
        let ns = nodes(2);
        assert_eq!(r(TopologyKind::Hierarchical, &ns, "n0", "n1"), vec!["n1"]);
    }

    #[test]
    fn test_routing_table_covers_every_pair() {
        let ns = nodes(5);
        for kind in TopologyKind::ALL {
            let table = build_routing_table(kind, &ns);
            assert_eq!(table.len(), 20);
            for ((_, to), path) in &table {
                assert_eq!(path.last(), Some(to));
            }
        }
    }

    #[test]
    fn test_connections_per_kind() {
        let ns = nodes(4);
        let cost = FixedLatency(Duration::from_millis(7));
        assert_eq!(build_connections(TopologyKind::Mesh, &ns, &cost).len(), 6);
        assert_eq!(build_connections(TopologyKind::Star, &ns, &cost).len(), 3);
        assert_eq!(build_connections(TopologyKind::Ring, &ns, &cost).len(), 4);
        let tree = build_connections(TopologyKind::Hierarchical, &ns, &cost);
        assert_eq!(tree.len(), 3);
        assert!(tree.iter().all(|c| c.latency == Duration::from_millis(7)));
    }

    #[test]
    fn test_random_latency_in_range() {
        let cost = RandomLatency::default().with_range(EdgeKind::Peer, 10, 12);
        for _ in 0..50 {
            let latency = cost.sample_latency(EdgeKind::Peer);
            assert!(latency >= Duration::from_millis(10) && latency <= Duration::from_millis(12));
        }
    }
}
