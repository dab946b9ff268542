use rand::SeedableRng;
use rand::rngs::SmallRng;
use rand::seq::SliceRandom;
use rayon::prelude::*;

use crate::NodeId;
use crate::parallel::parallel_counting_sort;

pub(crate) const NUM_BUCKETS: usize = 256;

/// Splitmix-style finalizer. Gives every (seed, value) pair an independent
/// and platform-stable bucket choice.
fn mix(seed: u64, x: u64) -> u64 {
    let mut z = seed ^ x.wrapping_mul(0x9E37_79B9_7F4A_7C15);
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}

/// Reproducible permutation grouped into a fixed number of buckets.
///
/// Bucket membership is a pure function of (seed, node), grouping uses the
/// fixed-package counting sort, and the within-bucket order is shuffled
/// with one PRNG stream per bucket. The outcome therefore depends on the
/// seed and the static package count, never on the number of threads.
pub(crate) struct ParallelPermutation {
    pub permutation: Vec<NodeId>,
    pub bucket_bounds: Vec<usize>,
}

impl ParallelPermutation {
    pub fn new() -> Self {
        Self {
            permutation: Vec::new(),
            bucket_bounds: vec![0; NUM_BUCKETS + 1],
        }
    }

    pub fn at(&self, position: usize) -> NodeId {
        self.permutation[position]
    }

    /// Permutes `0..n`.
    pub fn random_grouping(&mut self, n: usize, num_tasks: usize, seed: u64) {
        let nodes: Vec<NodeId> = (0..n as NodeId).collect();
        self.group_nodes(&nodes, num_tasks, seed);
    }

    /// Permutes an explicit node set. Callers sort `nodes` first so the
    /// result does not depend on the order the set was collected in.
    pub fn sample_buckets_and_group_by(&mut self, nodes: &[NodeId], num_tasks: usize, seed: u64) {
        debug_assert!(nodes.is_sorted());
        self.group_nodes(nodes, num_tasks, seed);
    }

    fn group_nodes(&mut self, nodes: &[NodeId], num_tasks: usize, seed: u64) {
        self.permutation.clear();
        self.permutation.resize(nodes.len(), 0);
        self.bucket_bounds = parallel_counting_sort(
            nodes,
            &mut self.permutation,
            NUM_BUCKETS,
            |&v| (mix(seed, v as u64) % NUM_BUCKETS as u64) as usize,
            num_tasks,
        );

        let mut buckets: Vec<&mut [NodeId]> = Vec::with_capacity(NUM_BUCKETS);
        let mut rest = self.permutation.as_mut_slice();
        for b in 0..NUM_BUCKETS {
            let len = self.bucket_bounds[b + 1] - self.bucket_bounds[b];
            let (bucket, tail) = rest.split_at_mut(len);
            buckets.push(bucket);
            rest = tail;
        }
        buckets.into_par_iter().enumerate().for_each(|(b, bucket)| {
            let mut rng = SmallRng::seed_from_u64(mix(seed, 0x5EED ^ b as u64));
            bucket.shuffle(&mut rng);
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn is_a_permutation() {
        let mut perm = ParallelPermutation::new();
        perm.random_grouping(10_000, 8, 42);

        let mut seen = vec![false; 10_000];
        for &v in &perm.permutation {
            assert!(!seen[v as usize]);
            seen[v as usize] = true;
        }
        assert!(seen.iter().all(|&s| s));
        assert_eq!(perm.bucket_bounds[NUM_BUCKETS], 10_000);
    }

    #[test]
    fn deterministic_for_fixed_seed() {
        let mut a = ParallelPermutation::new();
        let mut b = ParallelPermutation::new();
        a.random_grouping(5000, 8, 7);
        b.random_grouping(5000, 8, 7);
        assert_eq!(a.permutation, b.permutation);
        assert_eq!(a.bucket_bounds, b.bucket_bounds);
    }

    #[test]
    fn different_seeds_differ() {
        let mut a = ParallelPermutation::new();
        let mut b = ParallelPermutation::new();
        a.random_grouping(5000, 8, 7);
        b.random_grouping(5000, 8, 8);
        assert_ne!(a.permutation, b.permutation);
    }

    #[test]
    fn groups_explicit_node_set() {
        let nodes: Vec<NodeId> = (0..1000).filter(|v| v % 3 == 0).collect();
        let mut perm = ParallelPermutation::new();
        perm.sample_buckets_and_group_by(&nodes, 4, 99);

        let mut sorted = perm.permutation.clone();
        sorted.sort();
        assert_eq!(sorted, nodes);
    }
}
