use std::sync::atomic::{AtomicI64, Ordering};

use rayon::prelude::*;
use rustc_hash::FxHashMap;

use crate::partitioned::{PartitionedHypergraph, SyncEdgeUpdate};
use crate::{BlockId, Gain, NodeId};

/// Gain lookups shared by the FM search code, served either from the global
/// cache or from a thread-local overlay.
pub trait GainView {
    fn move_from_benefit(&self, v: NodeId) -> Gain;
    fn move_to_penalty(&self, v: NodeId, p: BlockId) -> Gain;

    /// Signed improvement of moving `v` into `p`.
    fn gain(&self, v: NodeId, p: BlockId) -> Gain {
        self.move_from_benefit(v) - self.move_to_penalty(v, p)
    }
}

/// Per-(node, block) running gain terms, maintained atomically alongside
/// every pin-count transition.
///
/// `move_from_benefit[v]` is the weight of incident edges where `v` is the
/// last pin of its own block; `move_to_penalty[v][p]` is the weight of
/// incident edges with no pin in `p`.
pub struct GainCache {
    k: u32,
    benefit: Vec<AtomicI64>,
    penalty: Vec<AtomicI64>,
}

impl GainCache {
    pub fn new(num_nodes: usize, k: u32) -> Self {
        Self {
            k,
            benefit: (0..num_nodes).map(|_| AtomicI64::new(0)).collect(),
            penalty: (0..num_nodes * k as usize)
                .map(|_| AtomicI64::new(0))
                .collect(),
        }
    }

    pub fn initialize(&self, phg: &PartitionedHypergraph) {
        let k = self.k;
        (0..phg.num_nodes() as NodeId).into_par_iter().for_each(|v| {
            let own = phg.part_id(v);
            let mut benefit = 0;
            let mut total = 0;
            let mut present = vec![0 as Gain; k as usize];
            for &e in phg.incident_edges(v) {
                let w = phg.edge_weight(e);
                total += w;
                if phg.pin_count_in_part(e, own) == 1 {
                    benefit += w;
                }
                for p in phg.blocks_of_edge(e) {
                    present[p as usize] += w;
                }
            }
            self.benefit[v as usize].store(benefit, Ordering::Relaxed);
            for p in 0..k {
                self.penalty[v as usize * k as usize + p as usize]
                    .store(total - present[p as usize], Ordering::Relaxed);
            }
        });
    }

    /// Resets the moved node's benefit. The per-edge updates that follow
    /// rebuild it for the target block.
    pub fn begin_node_move(&self, v: NodeId) {
        self.benefit[v as usize].store(0, Ordering::Relaxed);
    }

    /// Applies one synchronized edge update.
    ///
    /// Only the four pin-count transitions that touch a cached term do any
    /// work: the target block gaining its first or second pin, and the
    /// source block dropping to one or zero pins.
    pub fn update_for_edge(
        &self,
        pins: &[NodeId],
        moved: NodeId,
        part_of: impl Fn(NodeId) -> BlockId,
        update: &SyncEdgeUpdate,
    ) {
        let w = update.edge_weight;
        if update.pin_count_in_from_after == 1 {
            for &u in pins {
                if u != moved && part_of(u) == update.from {
                    self.benefit[u as usize].fetch_add(w, Ordering::Relaxed);
                }
            }
        } else if update.pin_count_in_from_after == 0 {
            for &u in pins {
                self.penalty_slot(u, update.from).fetch_add(w, Ordering::Relaxed);
            }
        }

        if update.pin_count_in_to_after == 1 {
            for &u in pins {
                self.penalty_slot(u, update.to).fetch_sub(w, Ordering::Relaxed);
            }
            self.benefit[moved as usize].fetch_add(w, Ordering::Relaxed);
        } else if update.pin_count_in_to_after == 2 {
            for &u in pins {
                if u != moved && part_of(u) == update.to {
                    self.benefit[u as usize].fetch_sub(w, Ordering::Relaxed);
                }
            }
        }
    }

    pub fn recompute_benefit(phg: &PartitionedHypergraph, v: NodeId) -> Gain {
        let own = phg.part_id(v);
        phg.incident_edges(v)
            .iter()
            .filter(|&&e| phg.pin_count_in_part(e, own) == 1)
            .map(|&e| phg.edge_weight(e))
            .sum()
    }

    pub fn recompute_penalty(phg: &PartitionedHypergraph, v: NodeId, p: BlockId) -> Gain {
        phg.incident_edges(v)
            .iter()
            .filter(|&&e| phg.pin_count_in_part(e, p) == 0)
            .map(|&e| phg.edge_weight(e))
            .sum()
    }

    /// Compares every cached term against a fresh recomputation.
    pub fn agrees_with(&self, phg: &PartitionedHypergraph) -> bool {
        (0..phg.num_nodes() as NodeId).into_par_iter().all(|v| {
            if self.move_from_benefit(v) != Self::recompute_benefit(phg, v) {
                return false;
            }
            (0..self.k).all(|p| self.move_to_penalty(v, p) == Self::recompute_penalty(phg, v, p))
        })
    }

    fn penalty_slot(&self, v: NodeId, p: BlockId) -> &AtomicI64 {
        &self.penalty[v as usize * self.k as usize + p as usize]
    }
}

impl GainView for GainCache {
    fn move_from_benefit(&self, v: NodeId) -> Gain {
        self.benefit[v as usize].load(Ordering::Relaxed)
    }

    fn move_to_penalty(&self, v: NodeId, p: BlockId) -> Gain {
        self.penalty_slot(v, p).load(Ordering::Relaxed)
    }
}

/// Thread-local overlay recording gain changes of speculative moves without
/// publishing them to the shared cache.
pub(crate) struct DeltaGainCache<'a> {
    shared: &'a GainCache,
    k: u32,
    benefit_delta: FxHashMap<NodeId, Gain>,
    penalty_delta: FxHashMap<u64, Gain>,
}

impl<'a> DeltaGainCache<'a> {
    pub fn new(shared: &'a GainCache, k: u32) -> Self {
        Self {
            shared,
            k,
            benefit_delta: FxHashMap::default(),
            penalty_delta: FxHashMap::default(),
        }
    }

    pub fn begin_node_move(&mut self, v: NodeId) {
        self.benefit_delta
            .insert(v, -self.shared.move_from_benefit(v));
    }

    pub fn update_for_edge(
        &mut self,
        pins: &[NodeId],
        moved: NodeId,
        part_of: impl Fn(NodeId) -> BlockId,
        update: &SyncEdgeUpdate,
    ) {
        let w = update.edge_weight;
        if update.pin_count_in_from_after == 1 {
            for &u in pins {
                if u != moved && part_of(u) == update.from {
                    *self.benefit_delta.entry(u).or_insert(0) += w;
                }
            }
        } else if update.pin_count_in_from_after == 0 {
            for &u in pins {
                *self.penalty_delta.entry(self.key(u, update.from)).or_insert(0) += w;
            }
        }

        if update.pin_count_in_to_after == 1 {
            for &u in pins {
                *self.penalty_delta.entry(self.key(u, update.to)).or_insert(0) -= w;
            }
            *self.benefit_delta.entry(moved).or_insert(0) += w;
        } else if update.pin_count_in_to_after == 2 {
            for &u in pins {
                if u != moved && part_of(u) == update.to {
                    *self.benefit_delta.entry(u).or_insert(0) -= w;
                }
            }
        }
    }

    fn key(&self, v: NodeId, p: BlockId) -> u64 {
        v as u64 * self.k as u64 + p as u64
    }
}

impl GainView for DeltaGainCache<'_> {
    fn move_from_benefit(&self, v: NodeId) -> Gain {
        self.shared.move_from_benefit(v) + self.benefit_delta.get(&v).copied().unwrap_or(0)
    }

    fn move_to_penalty(&self, v: NodeId, p: BlockId) -> Gain {
        self.shared.move_to_penalty(v, p)
            + self.penalty_delta.get(&self.key(v, p)).copied().unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::hypergraph::Hypergraph;
    use crate::NodeWeight;

    fn phg() -> PartitionedHypergraph {
        let hg = Hypergraph::from_edges(
            6,
            &[vec![0, 1, 2], vec![2, 3, 4], vec![4, 5], vec![0, 5], vec![1, 3]],
            Some(vec![1, 2, 1, 3, 1]),
            None,
        )
        .unwrap();
        let mut phg = PartitionedHypergraph::new(Arc::new(hg), 3).unwrap();
        phg.set_partition(&[0, 0, 1, 1, 2, 2]).unwrap();
        phg
    }

    #[test]
    fn initialize_matches_recomputation() {
        let phg = phg();
        let cache = GainCache::new(phg.num_nodes(), phg.k());
        cache.initialize(&phg);
        assert!(cache.agrees_with(&phg));
    }

    #[test]
    fn cache_tracks_moves() {
        let phg = phg();
        let cache = GainCache::new(phg.num_nodes(), phg.k());
        cache.initialize(&phg);

        for (v, from, to) in [(2u32, 1u32, 0u32), (4, 2, 1), (0, 0, 2)] {
            cache.begin_node_move(v);
            phg.change_node_part(v, from, to, NodeWeight::MAX, || {}, |u| {
                cache.update_for_edge(phg.pins(u.edge), v, |x| phg.part_id(x), u);
            });
            assert!(cache.agrees_with(&phg), "cache drifted after moving {v}");
        }
    }

    #[test]
    fn delta_overlay_shadows_shared_cache() {
        let phg = phg();
        let cache = GainCache::new(phg.num_nodes(), phg.k());
        cache.initialize(&phg);

        let mut delta = DeltaGainCache::new(&cache, phg.k());
        let before = delta.gain(3, 0);
        delta.begin_node_move(2);
        // Pretend node 2 moved from 1 to 0 on edge 1 (pins 2, 3, 4).
        let update = SyncEdgeUpdate {
            edge: 1,
            edge_weight: 2,
            edge_size: 3,
            from: 1,
            to: 0,
            pin_count_in_from_after: 1,
            pin_count_in_to_after: 1,
        };
        let parts = [0u32, 0, 0, 1, 2, 2];
        delta.update_for_edge(&[2, 3, 4], 2, |x| parts[x as usize], &update);

        // Node 3 became the last pin of block 1 on edge 1 and block 0 is no
        // longer empty there.
        assert_eq!(delta.move_from_benefit(3), cache.move_from_benefit(3) + 2);
        assert_eq!(delta.move_to_penalty(3, 0), cache.move_to_penalty(3, 0) - 2);
        assert_ne!(delta.gain(3, 0), before);
        // The shared cache is untouched.
        assert!(cache.agrees_with(&phg));
    }
}
