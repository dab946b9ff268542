mod common;

use std::sync::Arc;

use hypercut::fm::MultiTryKWayFm;
use hypercut::{FmAlgorithm, GainCache, RefinementConfig, metrics};

use common::{partitioned, random_hypergraph, round_robin_partition};

fn fm_config(k: u32, max_part_weight: i64, seed: u64) -> RefinementConfig {
    RefinementConfig {
        k,
        max_part_weights: vec![max_part_weight; k as usize],
        seed,
        ..Default::default()
    }
}

#[test]
fn improves_or_keeps_km1_on_random_instance() {
    // Random 3-uniform hypergraph, 16 blocks.
    let hg = random_hypergraph(1000, 700, 3, 42);
    let phg = partitioned(Arc::clone(&hg), 16, &round_robin_partition(1000, 16));
    let initial = metrics::km1(&phg);

    let config = Arc::new(fm_config(16, 65, 1));
    let pool = rayon::ThreadPoolBuilder::new().num_threads(4).build().unwrap();
    let mut fm = MultiTryKWayFm::new(Arc::clone(&config), phg.num_nodes(), 4);
    let improvement = pool.install(|| fm.refine_impl(&phg, &[]));

    let after = metrics::km1(&phg);
    assert!(after <= initial);
    assert_eq!(initial - after, improvement);
    assert!(phg.verify_internal_state());
}

#[test]
fn gain_cache_stays_consistent_after_refinement() {
    let hg = random_hypergraph(300, 220, 4, 7);
    let phg = partitioned(Arc::clone(&hg), 8, &round_robin_partition(300, 8));

    let config = Arc::new(fm_config(8, 40, 3));
    let pool = rayon::ThreadPoolBuilder::new().num_threads(4).build().unwrap();
    let mut fm = MultiTryKWayFm::new(Arc::clone(&config), phg.num_nodes(), 4);
    pool.install(|| fm.refine_impl(&phg, &[]));

    // Every cached benefit and penalty must match a fresh recomputation.
    assert!(fm.gain_cache().agrees_with(&phg));
    assert!(phg.verify_internal_state());
}

#[test]
fn rollback_leaves_consistent_state_without_improvement() {
    // A single search on a tiny instance: whatever prefix it keeps, the
    // partition, the aggregates and the gain cache must agree afterwards.
    let hg = random_hypergraph(40, 30, 3, 11);
    let phg = partitioned(Arc::clone(&hg), 2, &round_robin_partition(40, 2));
    let initial = metrics::km1(&phg);

    let mut config = fm_config(2, 21, 9);
    config.fm.num_seed_nodes = 5;
    config.fm.max_rounds = 1;
    let config = Arc::new(config);

    let pool = rayon::ThreadPoolBuilder::new().num_threads(1).build().unwrap();
    let mut fm = MultiTryKWayFm::new(Arc::clone(&config), phg.num_nodes(), 1);
    pool.install(|| fm.refine_impl(&phg, &[]));

    assert!(metrics::km1(&phg) <= initial);
    assert!(fm.gain_cache().agrees_with(&phg));
    assert!(phg.verify_internal_state());
}

#[test]
fn global_mode_matches_invariants() {
    let hg = random_hypergraph(300, 220, 4, 23);
    let phg = partitioned(Arc::clone(&hg), 4, &round_robin_partition(300, 4));
    let initial = metrics::km1(&phg);

    let mut config = fm_config(4, 78, 5);
    config.fm.perform_moves_global = true;
    let config = Arc::new(config);
    let pool = rayon::ThreadPoolBuilder::new().num_threads(4).build().unwrap();
    let mut fm = MultiTryKWayFm::new(Arc::clone(&config), phg.num_nodes(), 4);
    pool.install(|| fm.refine_impl(&phg, &[]));

    assert!(metrics::km1(&phg) <= initial);
    assert!(fm.gain_cache().agrees_with(&phg));
    assert!(phg.verify_internal_state());
}

#[test]
fn boundary_algorithm_runs_to_completion() {
    let hg = random_hypergraph(200, 150, 4, 5);
    let phg = partitioned(Arc::clone(&hg), 4, &round_robin_partition(200, 4));
    let initial = metrics::km1(&phg);

    let mut config = fm_config(4, 52, 2);
    config.fm.algorithm = FmAlgorithm::Boundary;
    config.fm.perform_moves_global = true;
    let config = Arc::new(config);
    let pool = rayon::ThreadPoolBuilder::new().num_threads(2).build().unwrap();
    let mut fm = MultiTryKWayFm::new(Arc::clone(&config), phg.num_nodes(), 2);
    pool.install(|| fm.refine_impl(&phg, &[]));

    assert!(metrics::km1(&phg) <= initial);
    assert!(phg.verify_internal_state());
}

#[test]
fn respects_uniform_balance_limits() {
    let hg = random_hypergraph(400, 300, 4, 77);
    let phg = partitioned(Arc::clone(&hg), 8, &round_robin_partition(400, 8));
    let max = 52;

    // Single worker: every speculative prefix replays exactly as validated.
    let config = Arc::new(fm_config(8, max, 6));
    let pool = rayon::ThreadPoolBuilder::new().num_threads(1).build().unwrap();
    let mut fm = MultiTryKWayFm::new(Arc::clone(&config), phg.num_nodes(), 1);
    pool.install(|| fm.refine_impl(&phg, &[]));

    for p in 0..8 {
        assert!(phg.part_weight(p) <= max, "block {p} overloaded");
    }
}

#[test]
fn seeds_restrict_the_first_round() {
    let hg = random_hypergraph(200, 150, 4, 55);
    let phg = partitioned(Arc::clone(&hg), 4, &round_robin_partition(200, 4));
    let initial = metrics::km1(&phg);

    let seeds: Vec<u32> = (0..50).collect();
    let config = Arc::new(fm_config(4, 52, 12));
    let pool = rayon::ThreadPoolBuilder::new().num_threads(2).build().unwrap();
    let mut fm = MultiTryKWayFm::new(Arc::clone(&config), phg.num_nodes(), 2);
    pool.install(|| fm.refine_impl(&phg, &seeds));

    assert!(metrics::km1(&phg) <= initial);
    assert!(phg.verify_internal_state());
}

#[test]
fn fresh_cache_agrees_with_recomputation() {
    let hg = random_hypergraph(100, 80, 4, 3);
    let phg = partitioned(Arc::clone(&hg), 4, &round_robin_partition(100, 4));

    let cache = GainCache::new(phg.num_nodes(), 4);
    cache.initialize(&phg);
    assert!(cache.agrees_with(&phg));
}
