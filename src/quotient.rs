use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, AtomicUsize, Ordering};

use parking_lot::Mutex;
use rayon::prelude::*;
use tracing::debug;

use crate::config::RefinementConfig;
use crate::moves::SearchId;
use crate::partitioned::{PartitionedHypergraph, SyncEdgeUpdate};
use crate::{BlockId, EdgeId, Gain};

pub const INVALID_SEARCH_ID: SearchId = SearchId::MAX;

/// Unordered pair of blocks, stored with `i < j`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BlockPair {
    pub i: BlockId,
    pub j: BlockId,
}

impl BlockPair {
    pub fn new(a: BlockId, b: BlockId) -> Self {
        Self {
            i: a.min(b),
            j: a.max(b),
        }
    }
}

/// Solver for one block-pair subproblem. The engine schedules the
/// subproblems; constructing the flow network and computing min cuts lives
/// behind this trait.
pub trait TwoWayFlowRefiner: Sync {
    /// Improves the partition on `pair` using the given cut hyperedges as
    /// the seed of the subproblem. Moves go through
    /// [`PartitionedHypergraph::change_node_part`]; the implementation
    /// reports the achieved improvement (0 if none).
    fn refine_block_pair(
        &self,
        phg: &PartitionedHypergraph,
        quotient: &QuotientGraph,
        pair: BlockPair,
        cut_hyperedges: &[EdgeId],
    ) -> Gain;
}

/// One edge of the quotient graph: the cut hyperedges between two blocks
/// plus scheduling state.
struct QuotientGraphEdge {
    /// Search currently owning this pair, INVALID_SEARCH_ID when free.
    ownership: AtomicU32,
    is_in_queue: AtomicBool,
    cut_hes: Mutex<Vec<EdgeId>>,
    /// Entries before this position were already served to searches.
    first_valid_entry: AtomicUsize,
    cut_he_weight: AtomicI64,
    initial_cut_he_weight: AtomicI64,
    num_improvements_found: AtomicUsize,
    total_improvement: AtomicI64,
}

impl QuotientGraphEdge {
    fn new() -> Self {
        Self {
            ownership: AtomicU32::new(INVALID_SEARCH_ID),
            is_in_queue: AtomicBool::new(false),
            cut_hes: Mutex::new(Vec::new()),
            first_valid_entry: AtomicUsize::new(0),
            cut_he_weight: AtomicI64::new(0),
            initial_cut_he_weight: AtomicI64::new(0),
            num_improvements_found: AtomicUsize::new(0),
            total_improvement: AtomicI64::new(0),
        }
    }

    fn reset(&self) {
        self.ownership.store(INVALID_SEARCH_ID, Ordering::Relaxed);
        self.is_in_queue.store(false, Ordering::Relaxed);
        self.cut_hes.lock().clear();
        self.first_valid_entry.store(0, Ordering::Relaxed);
        self.cut_he_weight.store(0, Ordering::Relaxed);
        self.initial_cut_he_weight.store(0, Ordering::Relaxed);
        self.num_improvements_found.store(0, Ordering::Relaxed);
        self.total_improvement.store(0, Ordering::Relaxed);
    }

    fn acquire(&self, search: SearchId) -> bool {
        self.ownership
            .compare_exchange(
                INVALID_SEARCH_ID,
                search,
                Ordering::AcqRel,
                Ordering::Relaxed,
            )
            .is_ok()
    }

    fn release(&self, search: SearchId) {
        debug_assert_eq!(self.ownership.load(Ordering::Relaxed), search);
        self.ownership.store(INVALID_SEARCH_ID, Ordering::Release);
    }

    fn mark_in_queue(&self) -> bool {
        self.is_in_queue
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
    }

    fn mark_not_in_queue(&self) {
        self.is_in_queue.store(false, Ordering::Release);
    }

    fn add_hyperedge(&self, he: EdgeId, weight: Gain) {
        self.cut_hes.lock().push(he);
        self.cut_he_weight.fetch_add(weight, Ordering::Relaxed);
    }
}

struct Search {
    pair: BlockPair,
    round: usize,
    used_cut_hes: Vec<EdgeId>,
    is_finalized: bool,
}

/// One scheduling round: the unscheduled pairs plus the blocks that became
/// active for the next round.
struct SchedulingRound {
    unscheduled: Mutex<VecDeque<BlockPair>>,
    round_improvement: AtomicI64,
    active_blocks: Vec<AtomicBool>,
    active_searches: AtomicUsize,
}

impl SchedulingRound {
    fn new(k: usize) -> Self {
        Self {
            unscheduled: Mutex::new(VecDeque::new()),
            round_improvement: AtomicI64::new(0),
            active_blocks: (0..k).map(|_| AtomicBool::new(false)).collect(),
            active_searches: AtomicUsize::new(0),
        }
    }
}

/// Tracks the cut hyperedges of every block pair and schedules pairs for
/// flow-based refinement in rounds of active blocks.
pub struct QuotientGraph {
    config: Arc<RefinementConfig>,
    edges: Vec<QuotientGraphEdge>,
    register_search_lock: Mutex<()>,
    searches: Mutex<Vec<Search>>,
    rounds: Mutex<Vec<Arc<SchedulingRound>>>,
    first_active_round: AtomicUsize,
    num_active_searches_on_blocks: Vec<AtomicUsize>,
    num_active_searches: AtomicUsize,
    min_improvement_per_round: AtomicI64,
    terminate: AtomicBool,
}

impl QuotientGraph {
    pub fn new(config: Arc<RefinementConfig>) -> Self {
        let k = config.k as usize;
        Self {
            edges: (0..k * k).map(|_| QuotientGraphEdge::new()).collect(),
            register_search_lock: Mutex::new(()),
            searches: Mutex::new(Vec::new()),
            rounds: Mutex::new(Vec::new()),
            first_active_round: AtomicUsize::new(0),
            num_active_searches_on_blocks: (0..k).map(|_| AtomicUsize::new(0)).collect(),
            num_active_searches: AtomicUsize::new(0),
            min_improvement_per_round: AtomicI64::new(0),
            terminate: AtomicBool::new(false),
            config,
        }
    }

    fn edge(&self, pair: BlockPair) -> &QuotientGraphEdge {
        &self.edges[pair.i as usize * self.config.k as usize + pair.j as usize]
    }

    /// Collects all cut hyperedges and seeds round 0 with every block pair
    /// that has cut weight.
    pub fn initialize(&self, phg: &PartitionedHypergraph) {
        self.edges.par_iter().for_each(|e| e.reset());
        self.searches.lock().clear();
        self.rounds.lock().clear();
        self.first_active_round.store(0, Ordering::Relaxed);
        self.num_active_searches.store(0, Ordering::Relaxed);
        self.num_active_searches_on_blocks
            .par_iter()
            .for_each(|c| c.store(0, Ordering::Relaxed));
        self.terminate.store(false, Ordering::Relaxed);

        // Each cut hyperedge registers with the pair of its two smallest
        // blocks.
        (0..phg.num_edges() as EdgeId).into_par_iter().for_each(|he| {
            if phg.connectivity(he) >= 2 {
                let mut blocks = phg.blocks_of_edge(he);
                let a = blocks.next().unwrap();
                let b = blocks.next().unwrap();
                self.edge(BlockPair::new(a, b))
                    .add_hyperedge(he, phg.edge_weight(he));
            }
        });
        for edge in &self.edges {
            edge.initial_cut_he_weight
                .store(edge.cut_he_weight.load(Ordering::Relaxed), Ordering::Relaxed);
        }

        let round = Arc::new(SchedulingRound::new(self.config.k as usize));
        {
            let mut queue = round.unscheduled.lock();
            for i in 0..self.config.k {
                for j in i + 1..self.config.k {
                    let pair = BlockPair::new(i, j);
                    if self.edge(pair).cut_he_weight.load(Ordering::Relaxed) > 0 {
                        self.edge(pair).mark_in_queue();
                        queue.push_back(pair);
                    }
                }
            }
        }
        self.rounds.lock().push(round);
    }

    pub fn set_objective(&self, objective: Gain) {
        let min = (self.config.flow.min_relative_improvement_per_round * objective as f64) as i64;
        self.min_improvement_per_round.store(min, Ordering::Relaxed);
    }

    /// Hands out an unowned block pair whose blocks are below the search
    /// limit. Returns `None` when nothing is schedulable right now.
    pub fn request_new_search(&self) -> Option<(SearchId, BlockPair)> {
        if self.terminate.load(Ordering::Relaxed) {
            return None;
        }
        let _guard = self.register_search_lock.lock();

        let (round_index, round) = self.current_round()?;
        let limit = self.config.flow.max_searches_per_block;
        let mut attempts = round.unscheduled.lock().len();
        while attempts > 0 {
            attempts -= 1;
            let Some(pair) = round.unscheduled.lock().pop_front() else {
                break;
            };
            let edge = self.edge(pair);
            let under_limit = self.num_active_searches_on_blocks[pair.i as usize]
                .load(Ordering::Relaxed)
                < limit
                && self.num_active_searches_on_blocks[pair.j as usize].load(Ordering::Relaxed)
                    < limit;
            if under_limit && edge.acquire(self.next_search_id()) {
                edge.mark_not_in_queue();
                let sid = {
                    let mut searches = self.searches.lock();
                    let sid = searches.len() as SearchId;
                    searches.push(Search {
                        pair,
                        round: round_index,
                        used_cut_hes: Vec::new(),
                        is_finalized: false,
                    });
                    sid
                };
                // Re-tag the edge with the real search id.
                edge.ownership.store(sid, Ordering::Release);
                self.num_active_searches_on_blocks[pair.i as usize]
                    .fetch_add(1, Ordering::Relaxed);
                self.num_active_searches_on_blocks[pair.j as usize]
                    .fetch_add(1, Ordering::Relaxed);
                self.num_active_searches.fetch_add(1, Ordering::Relaxed);
                round.active_searches.fetch_add(1, Ordering::Relaxed);
                return Some((sid, pair));
            }
            // Not schedulable right now; try it again later.
            round.unscheduled.lock().push_back(pair);
        }
        None
    }

    fn next_search_id(&self) -> SearchId {
        // Placeholder distinct from INVALID while the search registers.
        INVALID_SEARCH_ID - 1
    }

    /// Advances past drained rounds. Returns the first round that still has
    /// work, or `None` when the schedule ran dry or terminated.
    fn current_round(&self) -> Option<(usize, Arc<SchedulingRound>)> {
        let rounds = self.rounds.lock();
        let mut first = self.first_active_round.load(Ordering::Relaxed);
        loop {
            if first >= rounds.len() {
                return None;
            }
            let round = &rounds[first];
            if !round.unscheduled.lock().is_empty() {
                self.first_active_round.store(first, Ordering::Relaxed);
                return Some((first, Arc::clone(round)));
            }
            if round.active_searches.load(Ordering::Relaxed) > 0 {
                // The round may still activate pairs for its successor.
                return None;
            }
            let improvement = round.round_improvement.load(Ordering::Relaxed);
            if first + 1 < rounds.len()
                && improvement < self.min_improvement_per_round.load(Ordering::Relaxed)
            {
                debug!(round = first, improvement, "flow scheduling terminated");
                self.terminate.store(true, Ordering::Relaxed);
                return None;
            }
            first += 1;
        }
    }

    /// Serves up to `max_num` hyperedges that are still cut between the
    /// pair of `search`. Stale entries are skipped and consumed.
    pub fn request_cut_hyperedges(
        &self,
        phg: &PartitionedHypergraph,
        search: SearchId,
        max_num: usize,
    ) -> Vec<EdgeId> {
        let pair = self.searches.lock()[search as usize].pair;
        let edge = self.edge(pair);
        let mut out = Vec::new();

        let cut_hes = edge.cut_hes.lock();
        let mut first_valid = edge.first_valid_entry.load(Ordering::Relaxed);
        while out.len() < max_num && first_valid < cut_hes.len() {
            let he = cut_hes[first_valid];
            first_valid += 1;
            if phg.pin_count_in_part(he, pair.i) > 0 && phg.pin_count_in_part(he, pair.j) > 0 {
                edge.cut_he_weight
                    .fetch_sub(phg.edge_weight(he), Ordering::Relaxed);
                out.push(he);
            }
        }
        edge.first_valid_entry.store(first_valid, Ordering::Relaxed);
        drop(cut_hes);

        self.searches.lock()[search as usize]
            .used_cut_hes
            .extend(&out);
        out
    }

    /// Called by move appliers whenever a hyperedge gains its first pin in
    /// `block`: the edge becomes cut against every other block it touches.
    pub fn add_new_cut_hyperedge(
        &self,
        phg: &PartitionedHypergraph,
        he: EdgeId,
        block: BlockId,
    ) {
        let weight = phg.edge_weight(he);
        for other in phg.blocks_of_edge(he) {
            if other != block {
                self.edge(BlockPair::new(other, block)).add_hyperedge(he, weight);
            }
        }
    }

    /// Convenience hook for [`TwoWayFlowRefiner`] implementations: keeps
    /// the quotient graph consistent under a `change_node_part` callback.
    pub fn notify_edge_update(&self, phg: &PartitionedHypergraph, update: &SyncEdgeUpdate) {
        if update.pin_count_in_to_after == 1 {
            self.add_new_cut_hyperedge(phg, update.edge, update.to);
        }
    }

    /// Releases the pair of `search` so other searches can schedule it
    /// while this one still solves the subproblem.
    pub fn finalize_construction(&self, search: SearchId) {
        let pair = {
            let mut searches = self.searches.lock();
            let s = &mut searches[search as usize];
            s.is_finalized = true;
            s.pair
        };
        self.edge(pair).release(search);
    }

    /// Records the outcome of a search, reactivates its blocks on
    /// improvement, and re-inserts its used cut hyperedges that are still
    /// cut.
    pub fn finalize_search(
        &self,
        phg: &PartitionedHypergraph,
        search: SearchId,
        improvement: Gain,
    ) {
        let (pair, round_index, used) = {
            let mut searches = self.searches.lock();
            let s = &mut searches[search as usize];
            debug_assert!(s.is_finalized);
            (s.pair, s.round, std::mem::take(&mut s.used_cut_hes))
        };

        let edge = self.edge(pair);
        if improvement > 0 {
            edge.num_improvements_found.fetch_add(1, Ordering::Relaxed);
            edge.total_improvement.fetch_add(improvement, Ordering::Relaxed);
            for he in used {
                if phg.pin_count_in_part(he, pair.i) > 0 && phg.pin_count_in_part(he, pair.j) > 0
                {
                    edge.add_hyperedge(he, phg.edge_weight(he));
                }
            }
        }

        let round = Arc::clone(&self.rounds.lock()[round_index]);
        round.round_improvement.fetch_add(improvement, Ordering::Relaxed);
        if improvement > 0 {
            self.activate_block(&round, round_index, pair.i);
            self.activate_block(&round, round_index, pair.j);
        }

        self.num_active_searches_on_blocks[pair.i as usize].fetch_sub(1, Ordering::Relaxed);
        self.num_active_searches_on_blocks[pair.j as usize].fetch_sub(1, Ordering::Relaxed);
        round.active_searches.fetch_sub(1, Ordering::Relaxed);
        self.num_active_searches.fetch_sub(1, Ordering::Relaxed);
    }

    /// Marks `block` active for the round after `round_index` and queues
    /// all its pairs that still carry cut weight.
    fn activate_block(&self, round: &SchedulingRound, round_index: usize, block: BlockId) {
        if round.active_blocks[block as usize].swap(true, Ordering::AcqRel) {
            return;
        }
        let next_round = {
            let mut rounds = self.rounds.lock();
            if round_index + 1 >= rounds.len() {
                rounds.push(Arc::new(SchedulingRound::new(self.config.k as usize)));
            }
            Arc::clone(&rounds[round_index + 1])
        };
        for other in 0..self.config.k {
            if other == block {
                continue;
            }
            let pair = BlockPair::new(block, other);
            let edge = self.edge(pair);
            if edge.cut_he_weight.load(Ordering::Relaxed) > 0 && edge.mark_in_queue() {
                next_round.unscheduled.lock().push_back(pair);
            }
        }
    }

    pub fn num_active_searches(&self) -> usize {
        self.num_active_searches.load(Ordering::Relaxed)
    }

    pub fn terminated(&self) -> bool {
        self.terminate.load(Ordering::Relaxed)
    }

    /// True when no queued pair remains in any round.
    pub fn drained(&self) -> bool {
        self.rounds
            .lock()
            .iter()
            .all(|r| r.unscheduled.lock().is_empty())
    }

    /// Cut weight currently registered between `a` and `b`. Test support.
    pub fn cut_weight_of_pair(&self, a: BlockId, b: BlockId) -> Gain {
        self.edge(BlockPair::new(a, b))
            .cut_he_weight
            .load(Ordering::Relaxed)
    }

    /// Number of live (unserved) cut-list entries of the pair. Test support.
    pub fn num_registered_cut_hyperedges(&self, a: BlockId, b: BlockId) -> usize {
        let edge = self.edge(BlockPair::new(a, b));
        let len = edge.cut_hes.lock().len();
        len - edge.first_valid_entry.load(Ordering::Relaxed)
    }
}

/// Runs flow-based refinement rounds: workers repeatedly request block
/// pairs, hand the subproblem to `refiner`, and feed the outcome back into
/// the scheduler.
pub(crate) fn schedule_flow_searches(
    phg: &PartitionedHypergraph,
    quotient: &QuotientGraph,
    refiner: &dyn TwoWayFlowRefiner,
    config: &RefinementConfig,
    objective_value: Gain,
) -> Gain {
    quotient.initialize(phg);
    quotient.set_objective(objective_value);

    let total_improvement = AtomicI64::new(0);
    let num_searches = (config.num_threads() / config.flow.num_threads_per_search.max(1)).max(1);

    rayon::scope(|s| {
        for _ in 0..num_searches {
            s.spawn(|_| {
                loop {
                    match quotient.request_new_search() {
                        Some((sid, pair)) => {
                            let mut cut_hes = Vec::new();
                            loop {
                                let batch = quotient.request_cut_hyperedges(
                                    phg,
                                    sid,
                                    config.flow.max_cut_hyperedges_per_request,
                                );
                                if batch.is_empty() {
                                    break;
                                }
                                cut_hes.extend(batch);
                            }
                            quotient.finalize_construction(sid);
                            let improvement =
                                refiner.refine_block_pair(phg, quotient, pair, &cut_hes);
                            total_improvement.fetch_add(improvement, Ordering::Relaxed);
                            quotient.finalize_search(phg, sid, improvement);
                        }
                        None => {
                            if quotient.terminated()
                                || (quotient.num_active_searches() == 0 && quotient.drained())
                            {
                                break;
                            }
                            std::thread::yield_now();
                        }
                    }
                }
            });
        }
    });

    total_improvement.load(Ordering::Relaxed)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::hypergraph::Hypergraph;

    fn setup() -> (PartitionedHypergraph, QuotientGraph) {
        let hg = Hypergraph::from_edges(
            8,
            &[
                vec![0, 1, 4],
                vec![1, 2, 5],
                vec![2, 3],
                vec![4, 5, 6],
                vec![6, 7],
                vec![0, 3],
            ],
            None,
            None,
        )
        .unwrap();
        let mut phg = PartitionedHypergraph::new(Arc::new(hg), 4).unwrap();
        phg.set_partition(&[0, 0, 1, 1, 2, 2, 3, 3]).unwrap();

        let config = Arc::new(crate::config::RefinementConfig {
            k: 4,
            max_part_weights: vec![3; 4],
            ..Default::default()
        });
        let qg = QuotientGraph::new(config);
        qg.initialize(&phg);
        (phg, qg)
    }

    #[test]
    fn every_cut_edge_registers_exactly_once() {
        let (phg, qg) = setup();
        let mut total_entries = 0;
        for a in 0..4u32 {
            for b in a + 1..4u32 {
                total_entries += qg.num_registered_cut_hyperedges(a, b);
            }
        }
        let num_cut = (0..phg.num_edges() as EdgeId)
            .filter(|&e| phg.connectivity(e) >= 2)
            .count();
        assert_eq!(total_entries, num_cut);
    }

    #[test]
    fn request_serves_only_still_cut_edges() {
        let (phg, qg) = setup();
        let (sid, pair) = qg.request_new_search().unwrap();
        let served = qg.request_cut_hyperedges(&phg, sid, 100);
        assert!(!served.is_empty());
        for he in &served {
            assert!(phg.pin_count_in_part(*he, pair.i) > 0);
            assert!(phg.pin_count_in_part(*he, pair.j) > 0);
        }
        // The stream pointer consumed the entries.
        assert_eq!(qg.num_registered_cut_hyperedges(pair.i, pair.j), 0);
    }

    #[test]
    fn pair_ownership_is_exclusive() {
        let (_phg, qg) = setup();
        let mut seen = Vec::new();
        while let Some((_, pair)) = qg.request_new_search() {
            assert!(!seen.contains(&pair));
            seen.push(pair);
        }
        assert!(!seen.is_empty());
    }

    #[test]
    fn improvement_reactivates_blocks() {
        let (phg, qg) = setup();
        qg.set_objective(1000);

        // Three pairs carry cut weight initially. The first search reports
        // an improvement, so its pair returns for a second round; the rest
        // report nothing and stay retired.
        let mut scheduled = 0;
        let mut first = true;
        while let Some((sid, _pair)) = qg.request_new_search() {
            scheduled += 1;
            qg.request_cut_hyperedges(&phg, sid, 100);
            qg.finalize_construction(sid);
            qg.finalize_search(&phg, sid, if first { 5 } else { 0 });
            first = false;
        }
        assert_eq!(scheduled, 4);
        assert!(qg.drained());
    }
}
