use std::cmp::Ordering as CmpOrdering;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, AtomicU32, AtomicUsize, Ordering};

use parking_lot::Mutex;
use rayon::prelude::*;
use tracing::debug;

use crate::config::RefinementConfig;
use crate::metrics;
use crate::moves::{INVALID_MOVE, Move, MoveId};
use crate::parallel::{chunk_bounds, idiv_ceil, parallel_counting_sort};
use crate::partitioned::PartitionedHypergraph;
use crate::permutation::{NUM_BUCKETS, ParallelPermutation};
use crate::prefix::parallel_prefix_sum_in_place;
use crate::{BlockId, Gain, NodeId, NodeWeight};

const SEQUENTIAL_PREFIX_CUTOFF: usize = 2000;

/// Total order on move buffers: best gain first, node id as tie-breaker.
/// Every apply strategy sorts with it, which is what makes the applied set
/// a pure function of the computed moves.
fn move_order(a: &Move, b: &Move) -> CmpOrdering {
    b.gain.cmp(&a.gain).then_with(|| a.node.cmp(&b.node))
}

/// Synchronous label propagation with deterministic move application.
///
/// Each round computes best moves against the unchanged partition and then
/// realizes a subset of them through apply strategies whose outcome depends
/// only on the seed and the configuration, never on thread scheduling.
pub struct DeterministicLabelPropagation {
    config: Arc<RefinementConfig>,
    permutation: ParallelPermutation,
    active_nodes: Mutex<Vec<NodeId>>,
    /// Activation stamps for nodes and, shifted by |V|, hyperedges.
    last_moved_in_round: Vec<AtomicU32>,
    round: u32,
    /// Recalculation pass bookkeeping, lazily bumped per pass.
    last_recalc_round: Vec<AtomicU32>,
    recalc_round: u32,
    move_pos_of_node: Vec<AtomicU32>,
}

impl DeterministicLabelPropagation {
    pub fn new(config: Arc<RefinementConfig>, num_nodes: usize, num_edges: usize) -> Self {
        Self {
            config,
            permutation: ParallelPermutation::new(),
            active_nodes: Mutex::new(Vec::new()),
            last_moved_in_round: (0..num_nodes + num_edges)
                .map(|_| AtomicU32::new(0))
                .collect(),
            round: 0,
            last_recalc_round: (0..num_edges).map(|_| AtomicU32::new(0)).collect(),
            recalc_round: 0,
            move_pos_of_node: (0..num_nodes)
                .map(|_| AtomicU32::new(INVALID_MOVE))
                .collect(),
        }
    }

    /// Runs up to `lp.max_iterations` rounds. Returns the total improvement.
    pub fn refine_impl(&mut self, phg: &PartitionedHypergraph) -> Gain {
        let mut overall_improvement: Gain = 0;
        let mut num_sub_rounds = self.config.lp.num_sub_rounds.clamp(1, NUM_BUCKETS);
        let packages = self.config.shared_memory.static_balancing_work_packages;

        for iteration in 0..self.config.lp.max_iterations {
            self.advance_round();

            let use_active_nodes = self.config.lp.use_active_node_set;
            let mut active = std::mem::take(&mut *self.active_nodes.lock());
            if !use_active_nodes || iteration == 0 || active.is_empty() {
                self.permutation.random_grouping(
                    phg.num_nodes(),
                    packages,
                    self.config.seed ^ (iteration as u64).wrapping_mul(0xA076_1D64_78BD_642F),
                );
            } else {
                active.par_sort_unstable();
                self.permutation.sample_buckets_and_group_by(
                    &active,
                    packages,
                    self.config.seed ^ (iteration as u64).wrapping_mul(0xA076_1D64_78BD_642F),
                );
            }

            let buckets_per_sub_round = idiv_ceil(NUM_BUCKETS, num_sub_rounds);
            let mut num_moves = 0usize;
            let mut round_improvement: Gain = 0;
            let mut increase_sub_rounds = false;

            for sub_round in 0..num_sub_rounds {
                let (first_bucket, last_bucket) =
                    chunk_bounds(sub_round, NUM_BUCKETS, buckets_per_sub_round);
                if first_bucket >= last_bucket {
                    continue;
                }
                let first = self.permutation.bucket_bounds[first_bucket];
                let last = self.permutation.bucket_bounds[last_bucket];

                let moves: Vec<Move> = if phg.k() == 2 {
                    (first..last)
                        .into_par_iter()
                        .filter_map(|pos| self.best_move_two_way(phg, self.permutation.at(pos)))
                        .collect()
                } else {
                    (first..last)
                        .into_par_iter()
                        .filter_map(|pos| self.best_move(phg, self.permutation.at(pos)))
                        .collect()
                };
                if moves.is_empty() {
                    continue;
                }
                num_moves += moves.len();

                let (prefix_gain, reverted_all, leftover) =
                    self.apply_moves_by_maximal_prefixes_in_block_pairs(phg, &moves);
                increase_sub_rounds |= reverted_all;

                let mut sub_round_improvement = prefix_gain;
                if sub_round_improvement > 0 && !leftover.is_empty() {
                    sub_round_improvement +=
                        if self.config.lp.recalculate_gains_on_second_apply {
                            self.apply_moves_sorted_by_gain_with_recalculation(phg, leftover)
                        } else {
                            self.apply_moves_sorted_by_gain_and_revert_unbalanced(phg, leftover)
                        };
                }
                round_improvement += sub_round_improvement;
            }

            overall_improvement += round_improvement;
            debug!(iteration, round_improvement, num_moves, "lp round finished");

            if increase_sub_rounds {
                num_sub_rounds = (num_sub_rounds * 2).min(NUM_BUCKETS);
            }
            if num_moves == 0 {
                break;
            }
        }
        overall_improvement
    }

    fn advance_round(&mut self) {
        if self.round == u32::MAX {
            self.last_moved_in_round
                .par_iter()
                .for_each(|s| s.store(0, Ordering::Relaxed));
            self.round = 0;
        }
        self.round += 1;
    }

    /// Best feasible positive-gain move of `u`, computed against the
    /// current partition.
    fn best_move(&self, phg: &PartitionedHypergraph, u: NodeId) -> Option<Move> {
        let k = phg.k();
        let from = phg.part_id(u);
        let w = phg.node_weight(u);

        let mut benefit: Gain = 0;
        let mut total_weight: Gain = 0;
        let mut present = vec![0 as Gain; k as usize];
        for &e in phg.incident_edges(u) {
            let ew = phg.edge_weight(e);
            total_weight += ew;
            if phg.pin_count_in_part(e, from) == 1 {
                benefit += ew;
            }
            for p in phg.blocks_of_edge(e) {
                present[p as usize] += ew;
            }
        }

        let mut best: Option<Move> = None;
        let mut best_weight = NodeWeight::MAX;
        for to in 0..k {
            if to == from {
                continue;
            }
            let to_weight = phg.part_weight(to);
            if to_weight + w > self.config.max_part_weights[to as usize] {
                continue;
            }
            let gain = benefit - (total_weight - present[to as usize]);
            let better = match &best {
                None => gain > 0,
                Some(current) => {
                    gain > current.gain || (gain == current.gain && to_weight < best_weight)
                }
            };
            if better {
                best = Some(Move {
                    node: u,
                    from,
                    to,
                    gain,
                });
                best_weight = to_weight;
            }
        }
        best
    }

    /// k = 2 specialization: the only candidate target is the other block.
    fn best_move_two_way(&self, phg: &PartitionedHypergraph, u: NodeId) -> Option<Move> {
        let from = phg.part_id(u);
        let to = 1 - from;
        let w = phg.node_weight(u);
        if phg.part_weight(to) + w > self.config.max_part_weights[to as usize] {
            return None;
        }

        let mut gain: Gain = 0;
        for &e in phg.incident_edges(u) {
            let ew = phg.edge_weight(e);
            if phg.pin_count_in_part(e, from) == 1 {
                gain += ew;
            }
            if phg.pin_count_in_part(e, to) == 0 {
                gain -= ew;
            }
        }
        (gain > 0).then_some(Move {
            node: u,
            from,
            to,
            gain,
        })
    }

    /// Applies `m` and returns the exact attributed improvement. Positive
    /// results mean the objective shrank.
    fn perform_move_with_attributed_gain(
        &self,
        phg: &PartitionedHypergraph,
        m: &Move,
        activate_neighbors: bool,
    ) -> Gain {
        let objective = self.config.objective;
        let mut attributed: Gain = 0;
        let moved = phg.change_node_part(m.node, m.from, m.to, NodeWeight::MAX, || {}, |u| {
            attributed -= objective.attributed_delta(u);
        });

        if moved && activate_neighbors && self.config.lp.use_active_node_set {
            let n = phg.num_nodes() as usize;
            let round = self.round;
            for &e in phg.incident_edges(m.node) {
                if phg.edge_size(e) > self.config.lp.hyperedge_size_activation_threshold {
                    continue;
                }
                let edge_stamp = &self.last_moved_in_round[n + e as usize];
                if edge_stamp.load(Ordering::Relaxed) != round {
                    edge_stamp.store(round, Ordering::Relaxed);
                    for &v in phg.pins(e) {
                        let stamp = &self.last_moved_in_round[v as usize];
                        let seen = stamp.load(Ordering::Relaxed);
                        if seen != round
                            && stamp
                                .compare_exchange(seen, round, Ordering::AcqRel, Ordering::Relaxed)
                                .is_ok()
                        {
                            self.active_nodes.lock().push(v);
                        }
                    }
                }
            }
        }
        attributed
    }

    /// Applies the move at each position where `select` yields a concrete
    /// move, in parallel, summing attributed gains.
    fn apply_moves_if(
        &self,
        phg: &PartitionedHypergraph,
        moves: &[Move],
        select: impl Fn(usize, &Move) -> Option<Move> + Sync,
    ) -> Gain {
        moves
            .par_iter()
            .enumerate()
            .map(|(pos, m)| match select(pos, m) {
                Some(to_apply) => self.perform_move_with_attributed_gain(phg, &to_apply, true),
                None => 0,
            })
            .sum()
    }

    /// Strategy A. Groups the buffered moves by direction, then realizes
    /// for every unordered block pair the longest prefix pair whose weight
    /// exchange stays within the per-pair slack. Returns the attributed
    /// gain, whether everything had to be reverted, and the unapplied
    /// leftover moves.
    fn apply_moves_by_maximal_prefixes_in_block_pairs(
        &self,
        phg: &PartitionedHypergraph,
        moves: &[Move],
    ) -> (Gain, bool, Vec<Move>) {
        let k = phg.k() as usize;
        let max_key = k * k;
        let index = |from: BlockId, to: BlockId| from as usize * k + to as usize;

        let mut sorted_moves = vec![
            Move {
                node: 0,
                from: 0,
                to: 0,
                gain: 0
            };
            moves.len()
        ];
        let positions = parallel_counting_sort(
            moves,
            &mut sorted_moves,
            max_key,
            |m| index(m.from, m.to),
            self.config.shared_memory.static_balancing_work_packages,
        );

        let has_moves =
            |p1: BlockId, p2: BlockId| positions[index(p1, p2) + 1] != positions[index(p1, p2)];

        let mut relevant_block_pairs: Vec<(BlockId, BlockId)> = Vec::new();
        let mut involvements = vec![0usize; k];
        for p1 in 0..k as BlockId {
            for p2 in p1 + 1..k as BlockId {
                if has_moves(p1, p2) || has_moves(p2, p1) {
                    relevant_block_pairs.push((p1, p2));
                }
                // Traffic into a block shrinks its slack for every pair.
                if has_moves(p1, p2) {
                    involvements[p2 as usize] += 1;
                }
                if has_moves(p2, p1) {
                    involvements[p1 as usize] += 1;
                }
            }
        }

        // Hand each pair exclusive ownership of its two direction slices.
        let mut direction_slices: Vec<Option<&mut [Move]>> = Vec::with_capacity(max_key);
        let mut rest = sorted_moves.as_mut_slice();
        for d in 0..max_key {
            let len = positions[d + 1] - positions[d];
            let (slice, tail) = rest.split_at_mut(len);
            direction_slices.push(Some(slice));
            rest = tail;
        }
        let mut tasks = Vec::with_capacity(relevant_block_pairs.len());
        for &(p1, p2) in &relevant_block_pairs {
            let forward = direction_slices[index(p1, p2)].take().unwrap();
            let backward = direction_slices[index(p2, p1)].take().unwrap();
            tasks.push((p1, p2, forward, backward));
        }

        let applied_counts: Vec<AtomicUsize> =
            (0..max_key).map(|_| AtomicUsize::new(0)).collect();

        tasks.into_par_iter().for_each(|(p1, p2, forward, backward)| {
            let prefix_weights = |slice: &mut [Move]| -> Vec<i64> {
                slice.par_sort_unstable_by(move_order);
                let mut weights: Vec<i64> =
                    slice.iter().map(|m| phg.node_weight(m.node)).collect();
                parallel_prefix_sum_in_place(&mut weights, |a, b| a + b, 0);
                weights
            };
            let (c1, c2) = rayon::join(|| prefix_weights(forward), || prefix_weights(backward));

            let budget_p1 =
                self.config.max_part_weights[p1 as usize] - phg.part_weight(p1);
            let budget_p2 =
                self.config.max_part_weights[p2 as usize] - phg.part_weight(p2);
            let lb_p1 = -(budget_p1 / involvements[p1 as usize].max(1) as i64);
            let ub_p2 = budget_p2 / involvements[p2 as usize].max(1) as i64;

            let (a, b) = find_best_prefixes(&c1, &c2, lb_p1, ub_p2).unwrap_or((0, 0));
            applied_counts[index(p1, p2)].store(a, Ordering::Relaxed);
            applied_counts[index(p2, p1)].store(b, Ordering::Relaxed);
        });

        let applies = |pos: usize, m: &Move| {
            let d = index(m.from, m.to);
            pos - positions[d] < applied_counts[d].load(Ordering::Relaxed)
        };

        let mut gain = self.apply_moves_if(phg, &sorted_moves, |pos, m| {
            applies(pos, m).then_some(*m)
        });

        let leftover: Vec<Move> = sorted_moves
            .par_iter()
            .enumerate()
            .filter(|&(pos, m)| !applies(pos, m))
            .map(|(_, m)| *m)
            .collect();

        let revert_all = gain < 0;
        if revert_all {
            gain += self.apply_moves_if(phg, &sorted_moves, |pos, m| {
                applies(pos, m).then_some(Move {
                    node: m.node,
                    from: m.to,
                    to: m.from,
                    gain: m.gain,
                })
            });
        }
        (gain, revert_all, leftover)
    }

    /// Strategy B1. Sorts by gain, undoes enough tail moves to repair every
    /// overloaded block, applies the rest, and reverts everything if the
    /// realized gain turned out negative.
    fn apply_moves_sorted_by_gain_and_revert_unbalanced(
        &self,
        phg: &PartitionedHypergraph,
        mut moves: Vec<Move>,
    ) -> Gain {
        let k = phg.k() as usize;
        let max_part_weights = &self.config.max_part_weights;
        moves.par_sort_unstable_by(move_order);

        let mut part_weights: Vec<NodeWeight> = moves
            .par_iter()
            .fold(
                || vec![0 as NodeWeight; k],
                |mut acc, m| {
                    acc[m.from as usize] -= phg.node_weight(m.node);
                    acc[m.to as usize] += phg.node_weight(m.node);
                    acc
                },
            )
            .reduce(
                || vec![0 as NodeWeight; k],
                |mut a, b| {
                    for (x, y) in a.iter_mut().zip(b) {
                        *x += y;
                    }
                    a
                },
            );
        let mut num_overloaded = 0usize;
        for p in 0..k {
            part_weights[p] += phg.part_weight(p as BlockId);
            if part_weights[p] > max_part_weights[p] {
                num_overloaded += 1;
            }
        }

        let revert = |m: &mut Move,
                      part_weights: &mut Vec<NodeWeight>,
                      num_overloaded: &mut usize| {
            part_weights[m.to as usize] -= phg.node_weight(m.node);
            part_weights[m.from as usize] += phg.node_weight(m.node);
            if part_weights[m.to as usize] <= max_part_weights[m.to as usize] {
                *num_overloaded -= 1;
            }
            m.invalidate();
        };

        // First pass: undo moves whose target is overloaded, provided the
        // source can take the node back without overloading.
        let mut j = moves.len();
        while num_overloaded > 0 && j > 0 {
            j -= 1;
            let m = moves[j];
            if !m.is_valid() {
                continue;
            }
            if part_weights[m.to as usize] > max_part_weights[m.to as usize]
                && part_weights[m.from as usize] + phg.node_weight(m.node)
                    <= max_part_weights[m.from as usize]
            {
                let mut m = moves[j];
                revert(&mut m, &mut part_weights, &mut num_overloaded);
                moves[j] = m;
            }
        }

        // Extra passes: keep undoing into possibly-overloaded sources until
        // every block fits.
        if num_overloaded > 0 {
            let mut j = moves.len();
            let mut last_valid_move = 0usize;
            while num_overloaded > 0 {
                if j == 0 {
                    if last_valid_move == 0 {
                        // Nothing left to undo. The remaining overloads
                        // predate this round.
                        break;
                    }
                    j = last_valid_move;
                    last_valid_move = 0;
                }
                let m = moves[j - 1];
                if m.is_valid() && part_weights[m.to as usize] > max_part_weights[m.to as usize] {
                    if part_weights[m.from as usize] + phg.node_weight(m.node)
                        > max_part_weights[m.from as usize]
                        && part_weights[m.from as usize] <= max_part_weights[m.from as usize]
                    {
                        num_overloaded += 1;
                    }
                    let mut m = moves[j - 1];
                    revert(&mut m, &mut part_weights, &mut num_overloaded);
                    moves[j - 1] = m;
                }
                if last_valid_move == 0 && moves[j - 1].is_valid() {
                    last_valid_move = j;
                }
                j -= 1;
            }
        }

        let mut gain = self.apply_moves_if(phg, &moves, |_, m| m.is_valid().then_some(*m));
        if gain < 0 {
            gain += self.apply_moves_if(phg, &moves, |_, m| {
                m.is_valid().then_some(Move {
                    node: m.node,
                    from: m.to,
                    to: m.from,
                    gain: m.gain,
                })
            });
        }
        gain
    }

    /// Strategy B2. Sorts by gain, recomputes every move's exact gain as if
    /// the whole sorted sequence were applied in order, and realizes the
    /// best prefix that does not increase the number of overloaded blocks.
    fn apply_moves_sorted_by_gain_with_recalculation(
        &mut self,
        phg: &PartitionedHypergraph,
        mut moves: Vec<Move>,
    ) -> Gain {
        if self.recalc_round == u32::MAX {
            self.last_recalc_round
                .par_iter()
                .for_each(|s| s.store(0, Ordering::Relaxed));
            self.recalc_round = 0;
        }
        self.recalc_round += 1;
        let recalc_round = self.recalc_round;

        moves.par_sort_unstable_by(move_order);
        let num_moves = moves.len();

        // Number the moves 1..n. Zero stays below every real id, so the
        // zero-initialized `last_out` comparisons work out.
        moves.par_iter().enumerate().for_each(|(pos, m)| {
            self.move_pos_of_node[m.node as usize].store(pos as MoveId + 1, Ordering::Relaxed);
        });
        let recalculated: Vec<AtomicI64> = (0..num_moves).map(|_| AtomicI64::new(0)).collect();

        let move_id_of = |v: NodeId| self.move_pos_of_node[v as usize].load(Ordering::Relaxed);
        let was_moved = |v: NodeId| move_id_of(v) != INVALID_MOVE;

        moves.par_iter().for_each_init(
            || vec![RecalculationData::default(); phg.k() as usize],
            |scratch, m| {
                for &e in phg.incident_edges(m.node) {
                    let stamp = &self.last_recalc_round[e as usize];
                    let seen = stamp.load(Ordering::Relaxed);
                    // Exactly one thread recalculates each edge per pass.
                    if seen >= recalc_round
                        || stamp
                            .compare_exchange(seen, recalc_round, Ordering::AcqRel, Ordering::Relaxed)
                            .is_err()
                    {
                        continue;
                    }

                    for &v in phg.pins(e) {
                        if was_moved(v) {
                            let m_id = move_id_of(v);
                            let mv = &moves[m_id as usize - 1];
                            let to = &mut scratch[mv.to as usize];
                            to.first_in = to.first_in.min(m_id);
                            let from = &mut scratch[mv.from as usize];
                            from.last_out = from.last_out.max(m_id);
                        } else {
                            scratch[phg.part_id(v) as usize].remaining_pins += 1;
                        }
                    }

                    let we = phg.edge_weight(e);
                    for &v in phg.pins(e) {
                        if !was_moved(v) {
                            continue;
                        }
                        let m_id = move_id_of(v);
                        let mv = &moves[m_id as usize - 1];
                        let from = &scratch[mv.from as usize];
                        let to = &scratch[mv.to as usize];
                        let benefit = from.last_out == m_id
                            && from.first_in > m_id
                            && from.remaining_pins == 0;
                        let penalty =
                            to.first_in == m_id && to.last_out < m_id && to.remaining_pins == 0;
                        if benefit && !penalty {
                            recalculated[m_id as usize - 1].fetch_add(we, Ordering::Relaxed);
                        }
                        if penalty && !benefit {
                            recalculated[m_id as usize - 1].fetch_sub(we, Ordering::Relaxed);
                        }
                    }

                    // Clean only what this edge touched when that is cheaper
                    // than wiping all blocks.
                    if phg.k() as usize <= 2 * phg.edge_size(e) {
                        scratch.fill(RecalculationData::default());
                    } else {
                        for &v in phg.pins(e) {
                            if was_moved(v) {
                                let mv = &moves[move_id_of(v) as usize - 1];
                                scratch[mv.from as usize] = RecalculationData::default();
                                scratch[mv.to as usize] = RecalculationData::default();
                            } else {
                                scratch[phg.part_id(v) as usize] = RecalculationData::default();
                            }
                        }
                    }
                }
            },
        );

        moves.par_iter().for_each(|m| {
            self.move_pos_of_node[m.node as usize].store(INVALID_MOVE, Ordering::Relaxed);
        });

        // Walk the sorted sequence, tracking weights and overloads, and pick
        // the best prefix that does not add overloaded blocks.
        let k = phg.k() as usize;
        let max_part_weights = &self.config.max_part_weights;
        let mut part_weights: Vec<NodeWeight> =
            (0..k).map(|p| phg.part_weight(p as BlockId)).collect();
        let num_overloaded_before = metrics::num_overloaded_blocks(&part_weights, max_part_weights);
        let mut num_overloaded = num_overloaded_before;

        let mut best_gain: Gain = 0;
        let mut gain_sum: Gain = 0;
        let mut best_index = 0usize;
        for (pos, m) in moves.iter().enumerate() {
            let w = phg.node_weight(m.node);
            if part_weights[m.from as usize] > max_part_weights[m.from as usize]
                && part_weights[m.from as usize] - w <= max_part_weights[m.from as usize]
            {
                num_overloaded -= 1;
            }
            if part_weights[m.to as usize] <= max_part_weights[m.to as usize]
                && part_weights[m.to as usize] + w > max_part_weights[m.to as usize]
            {
                num_overloaded += 1;
            }
            part_weights[m.from as usize] -= w;
            part_weights[m.to as usize] += w;
            gain_sum += recalculated[pos].load(Ordering::Relaxed);
            if num_overloaded <= num_overloaded_before && gain_sum >= best_gain {
                best_index = pos + 1;
                best_gain = gain_sum;
            }
        }

        let attributed =
            self.apply_moves_if(phg, &moves[..best_index], |_, m| Some(*m));
        debug_assert_eq!(attributed, best_gain);
        attributed
    }
}

#[derive(Clone, Copy)]
struct RecalculationData {
    first_in: MoveId,
    last_out: MoveId,
    remaining_pins: u32,
}

impl Default for RecalculationData {
    fn default() -> Self {
        Self {
            first_in: MoveId::MAX,
            last_out: 0,
            remaining_pins: 0,
        }
    }
}

fn prefix_value(c: &[i64], len: usize) -> i64 {
    if len == 0 { 0 } else { c[len - 1] }
}

/// Longest prefix lengths `(a, b)` of the two direction sequences whose
/// exchanged weight `sum(c1[..a]) - sum(c2[..b])` lands in `[lb, ub]`.
/// `c1` and `c2` are cumulative node weights.
fn find_best_prefixes(c1: &[i64], c2: &[i64], lb: i64, ub: i64) -> Option<(usize, usize)> {
    find_best_prefixes_recursive(c1, c2, 0, c1.len(), 0, c2.len(), lb, ub)
}

fn find_best_prefixes_sequentially(
    c1: &[i64],
    c2: &[i64],
    a_min: usize,
    mut a: usize,
    b_min: usize,
    mut b: usize,
    lb: i64,
    ub: i64,
) -> Option<(usize, usize)> {
    loop {
        let balance = prefix_value(c1, a) - prefix_value(c2, b);
        if lb <= balance && balance <= ub {
            return Some((a, b));
        }
        if balance < 0 {
            if b == b_min {
                return None;
            }
            b -= 1;
        } else {
            if a == a_min {
                return None;
            }
            a -= 1;
        }
    }
}

/// Divide-and-conquer over the longer sequence: match the midpoint against
/// the other cumulative array, settle what the match decides, and fork into
/// the two remaining quadrants, preferring the rightmost feasible answer.
#[allow(clippy::too_many_arguments)]
fn find_best_prefixes_recursive(
    c1: &[i64],
    c2: &[i64],
    a_lo: usize,
    a_hi: usize,
    b_lo: usize,
    b_hi: usize,
    lb: i64,
    ub: i64,
) -> Option<(usize, usize)> {
    let n1 = a_hi - a_lo;
    let n2 = b_hi - b_lo;
    if n1 < SEQUENTIAL_PREFIX_CUTOFF && n2 < SEQUENTIAL_PREFIX_CUTOFF {
        return find_best_prefixes_sequentially(c1, c2, a_lo, a_hi, b_lo, b_hi, lb, ub);
    }

    let feasible = |a: usize, b: usize| {
        let bal = prefix_value(c1, a) - prefix_value(c2, b);
        lb <= bal && bal <= ub
    };

    if n1 > n2 {
        let a_mid = a_lo + n1 / 2 + 1; // candidate prefix length
        let target = prefix_value(c1, a_mid);
        let b_match = b_lo + c2[b_lo..b_hi].partition_point(|&x| x < target);

        if b_match != b_hi && a_mid != a_hi && feasible(a_mid, b_match + 1) {
            // Everything left of the match is dominated.
            return find_best_prefixes_recursive(c1, c2, a_mid, a_hi, b_match + 1, b_hi, lb, ub)
                .or(Some((a_mid, b_match + 1)));
        }
        if b_match == b_hi && prefix_value(c1, a_mid) - prefix_value(c2, b_hi) > ub {
            // The midpoint cannot be compensated, so neither can anything
            // to its right.
            return find_best_prefixes_recursive(c1, c2, a_lo, a_mid - 1, b_lo, b_match, lb, ub);
        }

        let (left, right) = rayon::join(
            || find_best_prefixes_recursive(c1, c2, a_lo, a_mid - 1, b_lo, b_match, lb, ub),
            || find_best_prefixes_recursive(c1, c2, a_mid - 1, a_hi, b_match, b_hi, lb, ub),
        );
        right.or(left)
    } else {
        let b_mid = b_lo + n2 / 2 + 1;
        let target = prefix_value(c2, b_mid);
        let a_match = a_lo + c1[a_lo..a_hi].partition_point(|&x| x < target);

        if a_match != a_hi && b_mid != b_hi && feasible(a_match + 1, b_mid) {
            return find_best_prefixes_recursive(c1, c2, a_match + 1, a_hi, b_mid, b_hi, lb, ub)
                .or(Some((a_match + 1, b_mid)));
        }
        if a_match == a_hi && prefix_value(c1, a_hi) - prefix_value(c2, b_mid) < lb {
            return find_best_prefixes_recursive(c1, c2, a_lo, a_match, b_lo, b_mid - 1, lb, ub);
        }

        let (left, right) = rayon::join(
            || find_best_prefixes_recursive(c1, c2, a_lo, a_match, b_lo, b_mid - 1, lb, ub),
            || find_best_prefixes_recursive(c1, c2, a_match, a_hi, b_mid - 1, b_hi, lb, ub),
        );
        right.or(left)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cumulative(weights: &[i64]) -> Vec<i64> {
        let mut c = weights.to_vec();
        let mut acc = 0;
        for x in c.iter_mut() {
            acc += *x;
            *x = acc;
        }
        c
    }

    #[test]
    fn sequential_prefixes_prefer_longest() {
        // Unit weights in both directions: any (a, b) with |a - b| <= 1 is
        // feasible with lb = -1, ub = 1, so the search keeps everything.
        let c1 = cumulative(&[1; 10]);
        let c2 = cumulative(&[1; 10]);
        assert_eq!(
            find_best_prefixes_sequentially(&c1, &c2, 0, 10, 0, 10, -1, 1),
            Some((10, 10))
        );
    }

    #[test]
    fn sequential_prefixes_trim_heavier_side() {
        let c1 = cumulative(&[5, 5, 5]);
        let c2 = cumulative(&[1, 1]);
        // Walking down from (3, 2): 13, 8, then 5 - 2 = 3 within [0, 4].
        assert_eq!(
            find_best_prefixes_sequentially(&c1, &c2, 0, 3, 0, 2, 0, 4),
            Some((1, 2))
        );
    }

    #[test]
    fn sequential_prefixes_fall_back_to_empty() {
        // A single heavy move that nothing compensates shrinks to (0, 0).
        let c1 = cumulative(&[10]);
        let c2: Vec<i64> = vec![];
        assert_eq!(
            find_best_prefixes_sequentially(&c1, &c2, 0, 1, 0, 0, -1, 1),
            Some((0, 0))
        );
        // With a nonzero floor there is no feasible pair at all.
        assert_eq!(
            find_best_prefixes_sequentially(&c1, &c2, 1, 1, 0, 0, -1, 1),
            None
        );
    }

    #[test]
    fn recursive_matches_sequential_on_large_inputs() {
        use rand::Rng;
        use rand::SeedableRng;
        use rand::rngs::SmallRng;

        let mut rng = SmallRng::seed_from_u64(99);
        for _ in 0..5 {
            let n1 = 3000 + rng.random_range(0..2000);
            let n2 = 2500 + rng.random_range(0..2000);
            let w1: Vec<i64> = (0..n1).map(|_| rng.random_range(1..5)).collect();
            let w2: Vec<i64> = (0..n2).map(|_| rng.random_range(1..5)).collect();
            let c1 = cumulative(&w1);
            let c2 = cumulative(&w2);
            let lb = -rng.random_range(0..50);
            let ub = rng.random_range(0..50);

            let sequential =
                find_best_prefixes_sequentially(&c1, &c2, 0, c1.len(), 0, c2.len(), lb, ub);
            let recursive = find_best_prefixes(&c1, &c2, lb, ub);
            assert_eq!(sequential, recursive);
        }
    }
}
