//! Refines a random initial partition of a random hypergraph and prints
//! the objective before and after.

use std::sync::Arc;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use hypercut::{
    Hypergraph, Metrics, NodeId, PartitionedHypergraph, RefinementConfig, RefinementEngine, metrics,
};

fn main() -> Result<(), hypercut::EngineError> {
    let num_nodes = 10_000;
    let num_edges = 8_000;
    let k = 16;

    let mut rng = StdRng::seed_from_u64(1);
    let mut edges = Vec::with_capacity(num_edges);
    for _ in 0..num_edges {
        let size = rng.random_range(2..=6);
        let mut pins: Vec<NodeId> = Vec::with_capacity(size);
        while pins.len() < size {
            let v = rng.random_range(0..num_nodes) as NodeId;
            if !pins.contains(&v) {
                pins.push(v);
            }
        }
        edges.push(pins);
    }
    let hg = Arc::new(Hypergraph::from_edges(num_nodes, &edges, None, None)?);

    let assignment: Vec<u32> = (0..num_nodes).map(|_| rng.random_range(0..k)).collect();
    let mut phg = PartitionedHypergraph::new(Arc::clone(&hg), k)?;
    phg.set_partition(&assignment)?;

    let initial_km1 = metrics::km1(&phg);
    let config = RefinementConfig {
        k,
        seed: 42,
        ..Default::default()
    }
    .with_balanced_part_weights(hg.total_node_weight(), 0.03);

    let mut engine = RefinementEngine::new(config, &phg)?;
    let mut result = Metrics::default();
    engine.refine(&phg, &[], &mut result);

    println!("nodes: {num_nodes}, edges: {num_edges}, k: {k}");
    println!("km1 before: {initial_km1}");
    println!("km1 after:  {}", result.quality);
    println!("imbalance:  {:.4}", result.imbalance);
    Ok(())
}
