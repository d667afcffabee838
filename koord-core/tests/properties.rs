//! Property tests for election and routing invariants

use koord_core::config::{ElectionConfig, TopologyConfig};
use koord_core::event::{AppendEntries, VoteRequest};
use koord_core::topology::routing::{branching_factor, build_routing_table, route};
use koord_core::topology::{FixedLatency, TopologyKind, TopologyManager};
use koord_core::{ClusterDirectory, ElectionCore, NodeRecord};
use proptest::prelude::*;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

// ============================================================================
// Strategies
// ============================================================================

#[derive(Debug, Clone)]
enum Op {
    Timeout,
    VoteRequest {
        term: u64,
        candidate: usize,
        last_log_index: u64,
        last_log_term: u64,
    },
    Heartbeat {
        term: u64,
        leader: usize,
    },
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        Just(Op::Timeout),
        (0u64..8, 1usize..5, 0u64..3, 0u64..3).prop_map(|(term, candidate, last_log_index, last_log_term)| {
            Op::VoteRequest {
                term,
                candidate,
                last_log_index,
                last_log_term,
            }
        }),
        (0u64..8, 1usize..5).prop_map(|(term, leader)| Op::Heartbeat { term, leader }),
    ]
}

fn kind() -> impl Strategy<Value = TopologyKind> {
    prop_oneof![
        Just(TopologyKind::Mesh),
        Just(TopologyKind::Star),
        Just(TopologyKind::Ring),
        Just(TopologyKind::Hierarchical),
    ]
}

fn node_ids(n: usize) -> Vec<String> {
    (0..n).map(|i| format!("n{}", i)).collect()
}

// ============================================================================
// Election
// ============================================================================

proptest! {
    /// Term never decreases and at most one candidate is granted per term
    #[test]
    fn term_monotonic_and_single_vote_per_term(ops in prop::collection::vec(op(), 1..60)) {
        let peers: Vec<String> = (1..5).map(|i| format!("p{}", i)).collect();
        let mut core = ElectionCore::new("p0", peers, ElectionConfig::default());
        let mut granted: HashMap<u64, String> = HashMap::new();
        let mut last_term = core.term();

        for op in ops {
            match op {
                Op::Timeout => {
                    core.on_election_timeout();
                }
                Op::VoteRequest { term, candidate, last_log_index, last_log_term } => {
                    let candidate_id = format!("p{}", candidate);
                    let resp = core.handle_vote_request(term, &VoteRequest {
                        candidate_id: candidate_id.clone(),
                        last_log_index,
                        last_log_term,
                    });
                    prop_assert_eq!(resp.term, core.term());
                    if resp.granted {
                        prop_assert!(term >= last_term);
                        let previous = granted.entry(resp.term).or_insert_with(|| candidate_id.clone());
                        prop_assert_eq!(previous.as_str(), candidate_id.as_str());
                    }
                }
                Op::Heartbeat { term, leader } => {
                    let resp = core.handle_append_entries(term, &AppendEntries {
                        leader_id: format!("p{}", leader),
                        prev_log_index: 0,
                        prev_log_term: 0,
                        entries: vec![],
                        leader_commit: 0,
                    });
                    if term < last_term {
                        prop_assert!(!resp.success);
                    }
                }
            }
            // Our own candidacy counts as a vote for ourselves
            if let Some(voted) = core.voted_for() {
                if voted == "p0" {
                    granted.entry(core.term()).or_insert_with(|| "p0".to_string());
                }
            }
            prop_assert!(core.term() >= last_term, "term went from {} to {}", last_term, core.term());
            last_term = core.term();
        }
    }
}

// ============================================================================
// Routing
// ============================================================================

proptest! {
    /// Routes end at the destination, never revisit the source and are
    /// recomputed identically
    #[test]
    fn routes_are_stable_and_well_formed(kind in kind(), n in 2usize..16) {
        let nodes = node_ids(n);
        let table = build_routing_table(kind, &nodes);
        prop_assert_eq!(table.len(), n * (n - 1));

        for ((from, to), path) in &table {
            prop_assert_eq!(path.last(), Some(to));
            prop_assert!(!path.contains(from));
            let distinct: HashSet<&String> = path.iter().collect();
            prop_assert_eq!(distinct.len(), path.len(), "{:?} revisits a node", path);
            let recomputed = route(kind, &nodes, from, to);
            prop_assert_eq!(recomputed.as_ref(), Some(path));
        }
    }

    #[test]
    fn mesh_single_hop_and_ring_shorter_arc(n in 2usize..16, a in 0usize..16, b in 0usize..16) {
        let nodes = node_ids(n);
        let (a, b) = (a % n, b % n);
        prop_assume!(a != b);

        let mesh = route(TopologyKind::Mesh, &nodes, &nodes[a], &nodes[b]).unwrap();
        prop_assert_eq!(mesh, vec![nodes[b].clone()]);

        let ring = route(TopologyKind::Ring, &nodes, &nodes[a], &nodes[b]).unwrap();
        let forward = (b + n - a) % n;
        prop_assert_eq!(ring.len(), forward.min(n - forward));
    }

    #[test]
    fn hierarchical_routes_are_never_single_hop(n in 3usize..20) {
        let nodes = node_ids(n);
        for (pair, path) in build_routing_table(TopologyKind::Hierarchical, &nodes) {
            prop_assert!(path.len() >= 2, "{:?} routed directly", pair);
        }
    }

    /// Nodes under different children of the root are joined through the root
    #[test]
    fn hierarchical_cross_subtree_routes_pass_root(n in 3usize..20, a in 1usize..20, b in 1usize..20) {
        let nodes = node_ids(n);
        let (a, b) = (a % n, b % n);
        prop_assume!(a != 0 && b != 0 && a != b);

        let branching = branching_factor(n);
        let top = |mut i: usize| {
            while (i - 1) / branching != 0 {
                i = (i - 1) / branching;
            }
            i
        };
        prop_assume!(top(a) != top(b));

        let path = route(TopologyKind::Hierarchical, &nodes, &nodes[a], &nodes[b]).unwrap();
        prop_assert!(path.contains(&nodes[0]), "{:?} skips the root", path);
    }

    /// Switching A -> B -> A with the same nodes restores every route
    #[test]
    fn switch_round_trip_restores_routes(a in kind(), b in kind(), n in 1usize..10) {
        let mut directory = ClusterDirectory::new();
        for id in node_ids(n) {
            directory.register(NodeRecord::new(id));
        }
        let manager = TopologyManager::with_cost_model(
            directory.shared(),
            TopologyConfig::default(),
            Arc::new(FixedLatency(Duration::from_millis(3))),
        );

        manager.switch_to(a);
        let before = manager.routing_table();
        manager.switch_to(b);
        manager.switch_to(a);
        prop_assert_eq!(manager.routing_table(), before);
        prop_assert_eq!(manager.kind(), a);
    }
}
