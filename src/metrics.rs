use rayon::prelude::*;

use crate::partitioned::{Objective, PartitionedHypergraph};
use crate::{EdgeId, Gain, NodeWeight};

/// Quality and balance of the current partition, threaded through the
/// refiners so each pass can report what it changed.
#[derive(Clone, Copy, Debug, Default)]
pub struct Metrics {
    pub quality: Gain,
    pub imbalance: f64,
}

/// Connectivity objective: sum over all hyperedges of ω(e) · (λ(e) − 1).
pub fn km1(phg: &PartitionedHypergraph) -> Gain {
    (0..phg.num_edges() as EdgeId)
        .into_par_iter()
        .map(|e| phg.edge_weight(e) * (phg.connectivity(e) as Gain - 1))
        .sum()
}

/// Cut objective: total weight of hyperedges spanning more than one block.
pub fn cut(phg: &PartitionedHypergraph) -> Gain {
    (0..phg.num_edges() as EdgeId)
        .into_par_iter()
        .filter(|&e| phg.connectivity(e) > 1)
        .map(|e| phg.edge_weight(e))
        .sum()
}

pub fn quality(phg: &PartitionedHypergraph, objective: Objective) -> Gain {
    match objective {
        Objective::Km1 => km1(phg),
        Objective::Cut => cut(phg),
    }
}

pub fn imbalance(phg: &PartitionedHypergraph, max_part_weights: &[NodeWeight]) -> f64 {
    (0..phg.k())
        .map(|p| {
            phg.part_weight(p) as f64 / max_part_weights[p as usize].max(1) as f64 - 1.0
        })
        .fold(0.0_f64, f64::max)
}

pub(crate) fn heaviest_part_weight<P: crate::partitioned::PartitionView>(phg: &P) -> NodeWeight {
    (0..phg.k()).map(|p| phg.part_weight(p)).max().unwrap_or(0)
}

pub(crate) fn num_overloaded_blocks(
    part_weights: &[NodeWeight],
    max_part_weights: &[NodeWeight],
) -> usize {
    part_weights
        .iter()
        .zip(max_part_weights)
        .filter(|(w, max)| w > max)
        .count()
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::hypergraph::Hypergraph;

    #[test]
    fn objectives_on_small_instance() {
        let hg = Hypergraph::from_edges(
            6,
            &[vec![0, 1, 2], vec![2, 3, 4], vec![4, 5], vec![0, 5]],
            Some(vec![2, 1, 1, 3]),
            None,
        )
        .unwrap();
        let mut phg = PartitionedHypergraph::new(Arc::new(hg), 3).unwrap();
        phg.set_partition(&[0, 0, 1, 1, 2, 2]).unwrap();

        // λ = 2, 2, 1, 2 per edge.
        assert_eq!(km1(&phg), 2 + 1 + 0 + 3);
        assert_eq!(cut(&phg), 2 + 1 + 3);
        assert_eq!(quality(&phg, Objective::Km1), 6);

        let max = vec![2, 2, 2];
        assert!(imbalance(&phg, &max) <= 0.0);
    }
}
