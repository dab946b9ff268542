use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use rayon::prelude::*;
use rustc_hash::{FxHashMap, FxHashSet};
use tracing::debug;

use crate::config::{FmAlgorithm, RefinementConfig};
use crate::delta::DeltaPartitionedHypergraph;
use crate::gain::{DeltaGainCache, GainCache, GainView};
use crate::metrics;
use crate::moves::{INVALID_MOVE, Move, MoveId, MoveTracker, NodeTracker, SearchId};
use crate::partitioned::{PartitionView, PartitionedHypergraph, SyncEdgeUpdate};
use crate::pq::{AddressableMaxHeap, INVALID_POSITION, Position};
use crate::work::WorkContainer;
use crate::{BlockId, Gain, NodeId, NodeWeight};

/// State shared by all concurrent local searches of one FM round.
pub(crate) struct FmSharedData {
    pub refinement_nodes: WorkContainer,
    pub move_tracker: MoveTracker,
    pub node_tracker: NodeTracker,
    /// Seeds whose searches found nothing are not re-enqueued.
    pub fruitless_seed: Vec<AtomicBool>,
}

impl FmSharedData {
    fn new(num_nodes: usize, num_workers: usize) -> Self {
        Self {
            refinement_nodes: WorkContainer::new(num_workers, num_nodes),
            move_tracker: MoveTracker::new(num_nodes),
            node_tracker: NodeTracker::new(num_nodes),
            fruitless_seed: (0..num_nodes).map(|_| AtomicBool::new(false)).collect(),
        }
    }

    fn reset_round(&mut self) {
        self.refinement_nodes.clear();
        self.move_tracker.reset();
        self.node_tracker.reset();
        self.fruitless_seed
            .par_iter()
            .for_each(|f| f.store(false, Ordering::Relaxed));
    }
}

/// Random-walk stop rule over the gains observed since the last best
/// prefix. The search stops once the walk has a clearly negative drift, or
/// unconditionally after a fraction of |V| fruitless steps.
struct AdaptiveStopRule {
    steps: u64,
    gain_sum: f64,
    gain_sum_sq: f64,
    step_cap: u64,
    alpha: f64,
}

impl AdaptiveStopRule {
    fn new(num_nodes: usize, alpha: f64, step_fraction: f64) -> Self {
        Self {
            steps: 0,
            gain_sum: 0.0,
            gain_sum_sq: 0.0,
            step_cap: ((num_nodes as f64 * step_fraction) as u64).max(16),
            alpha,
        }
    }

    fn update(&mut self, gain: Gain) {
        self.steps += 1;
        self.gain_sum += gain as f64;
        self.gain_sum_sq += (gain * gain) as f64;
    }

    fn reset(&mut self) {
        self.steps = 0;
        self.gain_sum = 0.0;
        self.gain_sum_sq = 0.0;
    }

    fn should_stop(&self) -> bool {
        if self.steps >= self.step_cap {
            return true;
        }
        if self.steps < 2 {
            return false;
        }
        let s = self.steps as f64;
        let mean = self.gain_sum / s;
        if mean >= 0.0 {
            return false;
        }
        let variance = (self.gain_sum_sq / s - mean * mean).max(0.0);
        // Drift is pessimistic beyond alpha standard deviations of the walk.
        s * mean * mean > self.alpha * variance
    }
}

/// Multi-try localized k-way FM.
///
/// Every worker repeatedly pulls seed nodes from the shared work container
/// and expands a local search around them. Moves either speculate on a
/// delta overlay and publish only the best prefix, or publish immediately
/// and roll back to the best prefix afterwards.
pub struct MultiTryKWayFm {
    config: Arc<RefinementConfig>,
    shared: FmSharedData,
    gain_cache: GainCache,
}

impl MultiTryKWayFm {
    pub fn new(config: Arc<RefinementConfig>, num_nodes: usize, num_workers: usize) -> Self {
        Self {
            shared: FmSharedData::new(num_nodes, num_workers),
            gain_cache: GainCache::new(num_nodes, config.k),
            config,
        }
    }

    pub fn gain_cache(&self) -> &GainCache {
        &self.gain_cache
    }

    /// Runs FM rounds until the relative improvement per round falls under
    /// the configured threshold. Returns the total improvement.
    pub fn refine_impl(&mut self, phg: &PartitionedHypergraph, seeds: &[NodeId]) -> Gain {
        self.gain_cache.initialize(phg);

        let objective = self.config.objective;
        let mut quality = metrics::quality(phg, objective);
        let mut total_improvement: Gain = 0;

        for round in 0..self.config.fm.max_rounds {
            self.shared.reset_round();
            let nodes: Vec<NodeId> = if round == 0 && !seeds.is_empty() {
                seeds.to_vec()
            } else {
                (0..phg.num_nodes() as NodeId)
                    .into_par_iter()
                    .filter(|&v| phg.is_border_node(v))
                    .collect()
            };
            if nodes.is_empty() {
                break;
            }
            self.shared.refinement_nodes.seed(nodes);
            self.shared
                .refinement_nodes
                .shuffle(self.config.seed ^ (round as u64).wrapping_mul(0xD6E8_FEB8_6659_FD93));

            match self.config.fm.algorithm {
                FmAlgorithm::Boundary => self.boundary_round(phg),
                FmAlgorithm::Multitry => self.multitry_round(phg),
            }

            let mut new_quality = metrics::quality(phg, objective);
            if new_quality > quality {
                // Concurrent searches interfered badly. Unwind the whole
                // round through the move log.
                self.revert_round(phg);
                new_quality = metrics::quality(phg, objective);
                debug_assert_eq!(new_quality, quality);
            }
            let round_improvement = quality - new_quality;
            total_improvement += round_improvement;
            debug!(round, round_improvement, new_quality, "fm round finished");
            quality = new_quality;

            let relative = round_improvement as f64 / quality.max(1) as f64;
            if round_improvement <= 0
                || relative < self.config.fm.min_relative_round_improvement
            {
                break;
            }
        }
        total_improvement
    }

    /// Undoes every committed move of the current round in reverse order.
    fn revert_round(&self, phg: &PartitionedHypergraph) {
        let tracker = &self.shared.move_tracker;
        for id in (0..tracker.len() as MoveId).rev() {
            let m = tracker.get(id);
            if !m.is_valid() {
                continue;
            }
            let gain_cache = &self.gain_cache;
            phg.change_node_part(
                m.node,
                m.to,
                m.from,
                NodeWeight::MAX,
                || gain_cache.begin_node_move(m.node),
                |u| {
                    gain_cache.update_for_edge(phg.pins(u.edge), m.node, |x| phg.part_id(x), u);
                },
            );
            tracker.invalidate(id);
        }
    }

    /// One search over the full boundary, applied directly to the global
    /// partition.
    fn boundary_round(&self, phg: &PartitionedHypergraph) {
        let mut search = LocalSearch::new(&self.config, &self.shared, &self.gain_cache, phg, 0);
        search.run_full_boundary();
    }

    fn multitry_round(&self, phg: &PartitionedHypergraph) {
        let config = &self.config;
        let shared = &self.shared;
        let gain_cache = &self.gain_cache;
        rayon::broadcast(|ctx| {
            let mut search = LocalSearch::new(config, shared, gain_cache, phg, ctx.index());
            loop {
                let pulled_any = if config.fm.perform_moves_global {
                    search.run_localized_global()
                } else {
                    search.run_localized_delta()
                };
                if !pulled_any {
                    break;
                }
            }
        });
    }
}

/// One localized search: per-block vertex queues keyed by gain, a block
/// queue keyed by each block's best vertex, and bookkeeping for the best
/// prefix of the move sequence.
struct LocalSearch<'a> {
    config: &'a RefinementConfig,
    shared: &'a FmSharedData,
    gain_cache: &'a GainCache,
    phg: &'a PartitionedHypergraph,
    worker: usize,
    this_search: SearchId,
    block_pq: AddressableMaxHeap,
    block_positions: Vec<Position>,
    vertex_pqs: Vec<AddressableMaxHeap>,
    /// One handle array for all vertex queues; a node only ever sits in the
    /// queue of its current block.
    vertex_positions: Vec<Position>,
    update_deduplicator: FxHashSet<NodeId>,
    /// Hyperedges whose pins' queued gains are still accurate.
    valid_edges: FxHashMap<crate::EdgeId, bool>,
    seeds: Vec<NodeId>,
    local_moves: Vec<Move>,
    local_move_ids: Vec<MoveId>,
    pushes: usize,
    moves_made: usize,
}

impl<'a> LocalSearch<'a> {
    fn new(
        config: &'a RefinementConfig,
        shared: &'a FmSharedData,
        gain_cache: &'a GainCache,
        phg: &'a PartitionedHypergraph,
        worker: usize,
    ) -> Self {
        let k = config.k as usize;
        Self {
            config,
            shared,
            gain_cache,
            phg,
            worker,
            this_search: 0,
            block_pq: AddressableMaxHeap::new(),
            block_positions: vec![INVALID_POSITION; k],
            vertex_pqs: (0..k).map(|_| AddressableMaxHeap::new()).collect(),
            vertex_positions: vec![INVALID_POSITION; phg.num_nodes()],
            update_deduplicator: FxHashSet::default(),
            valid_edges: FxHashMap::default(),
            seeds: Vec::new(),
            local_moves: Vec::new(),
            local_move_ids: Vec::new(),
            pushes: 0,
            moves_made: 0,
        }
    }

    fn begin_search(&mut self) {
        self.this_search = self.shared.node_tracker.new_search();
        self.valid_edges.clear();
        self.update_deduplicator.clear();
        self.seeds.clear();
        self.local_moves.clear();
        self.local_move_ids.clear();
        self.pushes = 0;
        self.moves_made = 0;
    }

    /// Boundary variant: seeds with everything in the container and runs a
    /// single global-mode search.
    fn run_full_boundary(&mut self) {
        self.begin_search();
        while let Some(seed) = self.shared.refinement_nodes.try_pop(self.worker) {
            if !self.update_deduplicator.contains(&seed) {
                self.insert_or_update_pq_global(seed);
            }
        }
        self.update_blocks_all();
        if self.pushes > 0 {
            self.find_moves_global();
        }
    }

    /// Returns false once the work container handed out nothing, which is
    /// the worker's signal to stop.
    fn run_localized_global(&mut self) -> bool {
        self.begin_search();
        let pulled = self.pull_seeds();
        self.update_blocks_all();
        if self.pushes > 0 {
            self.find_moves_global();
        }
        pulled
    }

    fn run_localized_delta(&mut self) -> bool {
        self.begin_search();
        let pulled = self.pull_seeds();
        self.update_blocks_all();
        if self.pushes > 0 {
            self.find_moves_delta();
        }
        pulled
    }

    fn pull_seeds(&mut self) -> bool {
        let mut pulled = false;
        while self.pushes < self.config.fm.num_seed_nodes {
            let Some(seed) = self.shared.refinement_nodes.try_pop(self.worker) else {
                break;
            };
            pulled = true;
            if !self.update_deduplicator.contains(&seed) && self.insert_or_update_pq_global(seed) {
                self.seeds.push(seed);
            }
        }
        pulled
    }

    // ------------------------------------------------------------------
    // Queue maintenance, generic over the global and the delta view.
    // ------------------------------------------------------------------

    fn best_destination_block<P: PartitionView, G: GainView>(
        config: &RefinementConfig,
        view: &P,
        gains: &G,
        u: NodeId,
    ) -> (Option<BlockId>, Gain) {
        let w = view.node_weight(u);
        let from = view.part_id(u);
        let from_weight = view.part_weight(from);
        let mut to: Option<BlockId> = None;
        let mut to_penalty = Gain::MAX;
        let mut best_to_weight = from_weight - w;
        for i in 0..view.k() {
            if i == from {
                continue;
            }
            let to_weight = view.part_weight(i);
            let penalty = gains.move_to_penalty(u, i);
            if (penalty < to_penalty || (penalty == to_penalty && to_weight < best_to_weight))
                && (to_weight + w <= config.max_part_weights[i as usize]
                    || to_weight < best_to_weight)
            {
                to_penalty = penalty;
                to = Some(i);
                best_to_weight = to_weight;
            }
        }
        (to, gains.move_from_benefit(u) - to_penalty)
    }

    /// Tries to acquire `v` for this search and inserts it into the vertex
    /// queue of its block; adjusts its key if it is already ours.
    fn insert_or_update_pq<P: PartitionView, G: GainView>(
        &mut self,
        view: &P,
        gains: &G,
        v: NodeId,
    ) -> bool {
        let tracker = &self.shared.node_tracker;
        if tracker.acquire(v, self.this_search) {
            let pv = view.part_id(v);
            let (_, gain) = Self::best_destination_block(self.config, view, gains, v);
            self.vertex_pqs[pv as usize].insert(&mut self.vertex_positions, v, gain);
            self.pushes += 1;
            true
        } else if tracker.is_active_in(v, self.this_search) {
            let pv = view.part_id(v);
            debug_assert!(self.vertex_pqs[pv as usize].contains(&self.vertex_positions, v));
            let (_, gain) = Self::best_destination_block(self.config, view, gains, v);
            self.vertex_pqs[pv as usize].adjust_key(&mut self.vertex_positions, v, gain);
            true
        } else {
            false
        }
    }

    fn insert_or_update_pq_global(&mut self, v: NodeId) -> bool {
        let phg = self.phg;
        let gains = self.gain_cache;
        self.insert_or_update_pq(phg, gains, v)
    }

    fn update_block(&mut self, i: BlockId) {
        if !self.vertex_pqs[i as usize].is_empty() {
            self.block_pq.insert_or_adjust(
                &mut self.block_positions,
                i,
                self.vertex_pqs[i as usize].top_key(),
            );
        } else if self.block_pq.contains(&self.block_positions, i) {
            self.block_pq.remove(&mut self.block_positions, i);
        }
    }

    fn update_blocks_all(&mut self) {
        for i in 0..self.config.k {
            self.update_block(i);
        }
        self.update_deduplicator.clear();
    }

    fn update_blocks<P: PartitionView>(&mut self, view: &P, moved_from: BlockId) {
        if self.update_deduplicator.len() >= self.config.k as usize {
            self.update_blocks_all();
            return;
        }
        self.update_block(moved_from);
        let touched: Vec<BlockId> = self
            .update_deduplicator
            .iter()
            .map(|&v| view.part_id(v))
            .collect();
        for b in touched {
            self.update_block(b);
        }
        self.update_deduplicator.clear();
    }

    /// Re-evaluates the neighbors of `u` behind hyperedges whose gains may
    /// have shifted, deduplicated per search step.
    fn insert_or_update_neighbors<P: PartitionView, G: GainView>(
        &mut self,
        view: &P,
        gains: &G,
        u: NodeId,
    ) {
        for ei in 0..view.incident_edges(u).len() {
            let e = view.incident_edges(u)[ei];
            // Absent means not yet re-evaluated in this search.
            if *self.valid_edges.get(&e).unwrap_or(&false) {
                continue;
            }
            for pi in 0..view.pins(e).len() {
                let v = view.pins(e)[pi];
                if !self.update_deduplicator.contains(&v) {
                    self.update_deduplicator.insert(v);
                    self.insert_or_update_pq(view, gains, v);
                }
            }
            self.valid_edges.insert(e, true);
        }
    }

    /// Pops the most promising move. The queued key is only a hint; the
    /// destination and gain are recomputed and the entry retried until the
    /// recomputed gain is at least as good as its key.
    fn find_next_move<P: PartitionView, G: GainView>(
        &mut self,
        view: &P,
        gains: &G,
    ) -> Option<Move> {
        if self.block_pq.is_empty() {
            return None;
        }
        loop {
            if self.block_pq.is_empty() {
                return None;
            }
            let from = self.block_pq.top();
            let u = self.vertex_pqs[from as usize].top();
            let estimated_gain = self.vertex_pqs[from as usize].top_key();
            let (to, gain) = Self::best_destination_block(self.config, view, gains, u);
            if gain >= estimated_gain {
                self.vertex_pqs[from as usize].delete_top(&mut self.vertex_positions);
                let Some(to) = to else {
                    // No feasible target at all. Consume the node and keep
                    // searching.
                    self.shared.node_tracker.deactivate(u, self.this_search);
                    self.update_block(from);
                    continue;
                };
                return Some(Move {
                    node: u,
                    from,
                    to,
                    gain,
                });
            }
            self.vertex_pqs[from as usize].adjust_key(&mut self.vertex_positions, u, gain);
            let new_top = self.vertex_pqs[from as usize].top_key();
            if new_top != self.block_pq.key_of(&self.block_positions, from) {
                self.block_pq
                    .adjust_key(&mut self.block_positions, from, new_top);
            }
        }
    }

    // ------------------------------------------------------------------
    // Global mode: publish immediately, roll back to the best prefix.
    // ------------------------------------------------------------------

    fn find_moves_global(&mut self) {
        let mut stop_rule = AdaptiveStopRule::new(
            self.phg.num_nodes(),
            self.config.fm.stop_alpha,
            self.config.fm.stop_step_fraction,
        );

        let mut best_improvement_index = 0usize;
        let mut estimated_improvement: Gain = 0;
        let mut best_improvement: Gain = 0;

        while !stop_rule.should_stop() {
            let Some(m) = self.find_next_move(self.phg, self.gain_cache) else {
                break;
            };
            self.shared.node_tracker.deactivate(m.node, self.this_search);

            let heaviest = metrics::heaviest_part_weight(self.phg);
            let from_weight = self.phg.part_weight(m.from);
            let to_weight = self.phg.part_weight(m.to);
            // Tolerate an overweight target only while the source itself is
            // heavier.
            let budget = self.config.max_part_weights[m.to as usize].max(from_weight);

            let mut move_id = INVALID_MOVE;
            let tracker = &self.shared.move_tracker;
            let gain_cache = self.gain_cache;
            let valid_edges = &mut self.valid_edges;
            let phg = self.phg;
            let moved = phg.change_node_part(
                m.node,
                m.from,
                m.to,
                budget,
                || {
                    move_id = tracker.insert(m);
                    gain_cache.begin_node_move(m.node);
                },
                |u| {
                    gain_cache.update_for_edge(phg.pins(u.edge), m.node, |x| phg.part_id(x), u);
                    mark_if_gains_shifted(valid_edges, u);
                },
            );

            if moved {
                self.moves_made += 1;
                estimated_improvement += m.gain;
                self.local_move_ids.push(move_id);
                stop_rule.update(m.gain);

                if self.is_new_best(
                    estimated_improvement,
                    best_improvement,
                    to_weight + self.phg.node_weight(m.node),
                    heaviest,
                ) {
                    stop_rule.reset();
                    best_improvement = estimated_improvement;
                    best_improvement_index = self.local_move_ids.len();
                }
                self.insert_or_update_neighbors(self.phg, self.gain_cache, m.node);
            }
            self.update_blocks(self.phg, m.from);
        }

        self.revert_to_best_prefix(best_improvement_index);
        self.clear_queues(best_improvement_index);
    }

    fn revert_to_best_prefix(&mut self, best_index: usize) {
        while self.local_move_ids.len() > best_index {
            let id = self.local_move_ids.pop().unwrap();
            let m = self.shared.move_tracker.get(id);
            let gain_cache = self.gain_cache;
            let phg = self.phg;
            phg.change_node_part(
                m.node,
                m.to,
                m.from,
                NodeWeight::MAX,
                || gain_cache.begin_node_move(m.node),
                |u| {
                    gain_cache.update_for_edge(phg.pins(u.edge), m.node, |x| phg.part_id(x), u);
                },
            );
            self.shared.move_tracker.invalidate(id);
        }
    }

    // ------------------------------------------------------------------
    // Delta mode: speculate locally, replay the best prefix globally.
    // ------------------------------------------------------------------

    fn find_moves_delta(&mut self) {
        let mut delta_phg = DeltaPartitionedHypergraph::new(self.phg);
        let mut delta_cache = DeltaGainCache::new(self.gain_cache, self.config.k);
        let mut edge_updates: Vec<SyncEdgeUpdate> = Vec::new();
        let mut stop_rule = AdaptiveStopRule::new(
            self.phg.num_nodes(),
            self.config.fm.stop_alpha,
            self.config.fm.stop_step_fraction,
        );

        let mut best_improvement_index = 0usize;
        let mut estimated_improvement: Gain = 0;
        let mut best_improvement: Gain = 0;

        while !stop_rule.should_stop() {
            let Some(m) = self.find_next_move(&delta_phg, &delta_cache) else {
                break;
            };
            self.shared.node_tracker.deactivate(m.node, self.this_search);

            let heaviest = metrics::heaviest_part_weight(&delta_phg);
            let from_weight = delta_phg.part_weight(m.from);
            let to_weight = delta_phg.part_weight(m.to);
            let budget = self.config.max_part_weights[m.to as usize].max(from_weight);

            let moved = if to_weight + delta_phg.node_weight(m.node) <= budget {
                delta_cache.begin_node_move(m.node);
                let ok = delta_phg.change_node_part(
                    m.node,
                    m.from,
                    m.to,
                    NodeWeight::MAX,
                    &mut edge_updates,
                );
                debug_assert!(ok);
                for u in &edge_updates {
                    // Pin parts come from the overlay so earlier
                    // speculative moves of this search are respected.
                    delta_cache.update_for_edge(
                        self.phg.pins(u.edge),
                        m.node,
                        |x| delta_phg.part_id(x),
                        u,
                    );
                    mark_if_gains_shifted(&mut self.valid_edges, u);
                }
                ok
            } else {
                false
            };

            if moved {
                self.moves_made += 1;
                estimated_improvement += m.gain;
                self.local_moves.push(m);
                stop_rule.update(m.gain);

                if self.is_new_best(
                    estimated_improvement,
                    best_improvement,
                    to_weight + self.phg.node_weight(m.node),
                    heaviest,
                ) {
                    stop_rule.reset();
                    best_improvement = estimated_improvement;
                    best_improvement_index = self.local_moves.len();
                }
                self.insert_or_update_neighbors(&delta_phg, &delta_cache, m.node);
            }
            self.update_blocks(&delta_phg, m.from);
        }

        let applied = self.apply_best_prefix_globally(best_improvement_index);
        self.clear_queues(applied);
    }

    /// Replays the speculative prefix on the global hypergraph, attributing
    /// exact gains, and keeps only the best prefix of the replay.
    fn apply_best_prefix_globally(&mut self, best_index: usize) -> usize {
        debug_assert!(self.local_move_ids.is_empty());
        let objective = self.config.objective;
        let mut estimated_improvement: Gain = 0;
        let mut best_improvement: Gain = 0;
        let mut best_replay_index = 0usize;

        for i in 0..best_index {
            let m = self.local_moves[i];
            let mut move_id = INVALID_MOVE;
            let mut attributed: Gain = 0;
            let tracker = &self.shared.move_tracker;
            let gain_cache = self.gain_cache;
            let phg = self.phg;
            let moved = phg.change_node_part(
                m.node,
                m.from,
                m.to,
                NodeWeight::MAX,
                || {
                    move_id = tracker.insert(m);
                    gain_cache.begin_node_move(m.node);
                },
                |u| {
                    gain_cache.update_for_edge(phg.pins(u.edge), m.node, |x| phg.part_id(x), u);
                    attributed -= objective.attributed_delta(u);
                },
            );
            debug_assert!(moved);
            estimated_improvement += attributed;
            self.shared.move_tracker.set_gain(move_id, attributed);
            self.local_move_ids.push(move_id);
            if estimated_improvement >= best_improvement {
                best_improvement = estimated_improvement;
                best_replay_index = i + 1;
            }
        }

        if estimated_improvement < 0 {
            // The speculative gains were too optimistic. Keep only the
            // exact-best prefix of the replay.
            self.revert_to_best_prefix(best_replay_index);
            best_replay_index
        } else {
            best_index
        }
    }

    // ------------------------------------------------------------------

    fn is_new_best(
        &self,
        estimated: Gain,
        best: Gain,
        new_to_weight: NodeWeight,
        heaviest: NodeWeight,
    ) -> bool {
        if self.config.fm.allow_zero_gain_moves {
            estimated >= best
        } else {
            estimated > best || (estimated >= best && new_to_weight < heaviest)
        }
    }

    /// Releases everything still queued and hands re-usable nodes back to
    /// the work container for later searches.
    fn clear_queues(&mut self, best_index: usize) {
        let release = self.config.fm.algorithm == FmAlgorithm::Multitry && self.moves_made > 0;
        let reinsert_seeds = best_index > 0;

        if release {
            if !reinsert_seeds {
                for &u in &self.seeds {
                    self.shared.fruitless_seed[u as usize].store(true, Ordering::Relaxed);
                }
            }
            for pq in &self.vertex_pqs {
                for j in 0..pq.len() {
                    let (node, _) = pq.at(j);
                    self.shared.node_tracker.release(node);
                    if !self.shared.fruitless_seed[node as usize].load(Ordering::Relaxed)
                        && self.shared.refinement_nodes.was_pushed_and_removed(node)
                    {
                        // This worker is the only producer for its queue.
                        unsafe { self.shared.refinement_nodes.push(node, self.worker) };
                    }
                }
            }
        }

        for pq in &mut self.vertex_pqs {
            pq.clear(&mut self.vertex_positions);
        }
        self.block_pq.clear(&mut self.block_positions);
    }
}

/// A pin-count transition through 0, 1 or 2 shifts gains of the edge's
/// pins, so queued keys behind it can no longer be trusted.
fn mark_if_gains_shifted(
    valid_edges: &mut FxHashMap<crate::EdgeId, bool>,
    u: &SyncEdgeUpdate,
) {
    if u.pin_count_in_from_after == 0
        || u.pin_count_in_from_after == 1
        || u.pin_count_in_to_after == 1
        || u.pin_count_in_to_after == 2
    {
        valid_edges.insert(u.edge, false);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stop_rule_stops_on_negative_drift() {
        let mut rule = AdaptiveStopRule::new(10_000, 1.0, 0.25);
        assert!(!rule.should_stop());
        for _ in 0..50 {
            rule.update(-3);
        }
        assert!(rule.should_stop());
    }

    #[test]
    fn stop_rule_keeps_running_on_positive_drift() {
        let mut rule = AdaptiveStopRule::new(10_000, 1.0, 0.25);
        for _ in 0..100 {
            rule.update(1);
        }
        assert!(!rule.should_stop());
    }

    #[test]
    fn stop_rule_reset_clears_history() {
        let mut rule = AdaptiveStopRule::new(10_000, 1.0, 0.25);
        for _ in 0..50 {
            rule.update(-5);
        }
        assert!(rule.should_stop());
        rule.reset();
        assert!(!rule.should_stop());
    }

    #[test]
    fn stop_rule_hard_cap() {
        let mut rule = AdaptiveStopRule::new(100, 1.0, 0.25);
        // Zero-gain walk never develops a drift; the cap still fires.
        for _ in 0..100 {
            rule.update(0);
        }
        assert!(rule.should_stop());
    }
}
