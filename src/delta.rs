use rustc_hash::FxHashMap;

use crate::partitioned::{PartitionView, PartitionedHypergraph, SyncEdgeUpdate};
use crate::{BlockId, EdgeId, EdgeWeight, NodeId, NodeWeight};

/// Thread-local overlay over the shared partitioned hypergraph.
///
/// A local FM search speculates on it without publishing anything: moved
/// parts, pin-count changes and part-weight changes live in small local
/// maps until the search decides which prefix of its moves to replay on
/// the global structure.
pub(crate) struct DeltaPartitionedHypergraph<'a> {
    phg: &'a PartitionedHypergraph,
    part_delta: FxHashMap<NodeId, BlockId>,
    pin_count_delta: FxHashMap<u64, i64>,
    part_weight_delta: Vec<NodeWeight>,
}

impl<'a> DeltaPartitionedHypergraph<'a> {
    pub fn new(phg: &'a PartitionedHypergraph) -> Self {
        Self {
            phg,
            part_delta: FxHashMap::default(),
            pin_count_delta: FxHashMap::default(),
            part_weight_delta: vec![0; phg.k() as usize],
        }
    }

    /// Speculatively moves `v`, applying the same balance check as the
    /// global structure but only to the overlay. The per-edge post-states
    /// land in `updates` so the caller can process them with the overlay
    /// borrowable again.
    pub fn change_node_part(
        &mut self,
        v: NodeId,
        from: BlockId,
        to: BlockId,
        budget: NodeWeight,
        updates: &mut Vec<SyncEdgeUpdate>,
    ) -> bool {
        debug_assert_ne!(from, to);
        debug_assert_eq!(self.part_id(v), from);
        updates.clear();

        let w = self.phg.node_weight(v);
        if self.part_weight(to) + w > budget {
            return false;
        }
        self.part_weight_delta[to as usize] += w;
        self.part_weight_delta[from as usize] -= w;
        self.part_delta.insert(v, to);

        for &e in self.phg.incident_edges(v) {
            *self.pin_count_delta.entry(self.key(e, from)).or_insert(0) -= 1;
            *self.pin_count_delta.entry(self.key(e, to)).or_insert(0) += 1;
            updates.push(SyncEdgeUpdate {
                edge: e,
                edge_weight: self.phg.edge_weight(e),
                edge_size: self.phg.edge_size(e),
                from,
                to,
                pin_count_in_from_after: self.pin_count_in_part(e, from),
                pin_count_in_to_after: self.pin_count_in_part(e, to),
            });
        }
        true
    }

    fn key(&self, e: EdgeId, p: BlockId) -> u64 {
        e as u64 * self.phg.k() as u64 + p as u64
    }
}

impl PartitionView for DeltaPartitionedHypergraph<'_> {
    fn k(&self) -> u32 {
        self.phg.k()
    }

    fn part_id(&self, v: NodeId) -> BlockId {
        self.part_delta
            .get(&v)
            .copied()
            .unwrap_or_else(|| self.phg.part_id(v))
    }

    fn part_weight(&self, p: BlockId) -> NodeWeight {
        self.phg.part_weight(p) + self.part_weight_delta[p as usize]
    }

    fn node_weight(&self, v: NodeId) -> NodeWeight {
        self.phg.node_weight(v)
    }

    fn edge_weight(&self, e: EdgeId) -> EdgeWeight {
        self.phg.edge_weight(e)
    }

    fn edge_size(&self, e: EdgeId) -> usize {
        self.phg.edge_size(e)
    }

    fn pins(&self, e: EdgeId) -> &[NodeId] {
        self.phg.pins(e)
    }

    fn incident_edges(&self, v: NodeId) -> &[EdgeId] {
        self.phg.incident_edges(v)
    }

    fn pin_count_in_part(&self, e: EdgeId, p: BlockId) -> u32 {
        let delta = self.pin_count_delta.get(&self.key(e, p)).copied().unwrap_or(0);
        (self.phg.pin_count_in_part(e, p) as i64 + delta) as u32
    }
}
