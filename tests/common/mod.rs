use std::sync::Arc;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use hypercut::{BlockId, Hypergraph, NodeId, PartitionedHypergraph};

/// Random hypergraph with `num_edges` edges of size 2..=max_edge_size and
/// unit weights.
pub fn random_hypergraph(
    num_nodes: usize,
    num_edges: usize,
    max_edge_size: usize,
    seed: u64,
) -> Arc<Hypergraph> {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut edges = Vec::with_capacity(num_edges);
    for _ in 0..num_edges {
        let size = rng.random_range(2..=max_edge_size);
        let mut pins: Vec<NodeId> = Vec::with_capacity(size);
        while pins.len() < size {
            let v = rng.random_range(0..num_nodes) as NodeId;
            if !pins.contains(&v) {
                pins.push(v);
            }
        }
        edges.push(pins);
    }
    Arc::new(Hypergraph::from_edges(num_nodes, &edges, None, None).unwrap())
}

/// Round-robin assignment, balanced by construction for unit weights.
pub fn round_robin_partition(num_nodes: usize, k: u32) -> Vec<BlockId> {
    (0..num_nodes).map(|v| v as BlockId % k).collect()
}

pub fn partitioned(
    hg: Arc<Hypergraph>,
    k: u32,
    assignment: &[BlockId],
) -> PartitionedHypergraph {
    let mut phg = PartitionedHypergraph::new(hg, k).unwrap();
    phg.set_partition(assignment).unwrap();
    phg
}
