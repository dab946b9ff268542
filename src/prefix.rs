use rayon::prelude::*;

use crate::parallel::idiv_ceil;

/// In-place parallel inclusive prefix sum over an associative `op`.
///
/// After the call, `data[i] = identity ⊕ data_before[0] ⊕ ... ⊕ data_before[i]`.
/// The computation runs in two passes over fixed blocks (per-block totals,
/// then a carried rewrite), so for an associative `op` the result is
/// element-wise identical to the sequential fold.
pub fn parallel_prefix_sum_in_place<T, Op>(data: &mut [T], op: Op, identity: T)
where
    T: Copy + Send + Sync,
    Op: Fn(T, T) -> T + Sync,
{
    let n = data.len();
    if n == 0 {
        return;
    }

    let num_blocks = rayon::current_num_threads().max(1) * 4;
    let block_size = idiv_ceil(n, num_blocks);
    if block_size < 1 << 12 {
        sequential_prefix_sum_in_place(data, &op, identity);
        return;
    }

    let block_totals: Vec<T> = data
        .par_chunks(block_size)
        .map(|chunk| chunk.iter().fold(identity, |acc, &x| op(acc, x)))
        .collect();

    let mut block_offsets = Vec::with_capacity(block_totals.len());
    let mut running = identity;
    for total in &block_totals {
        block_offsets.push(running);
        running = op(running, *total);
    }

    data.par_chunks_mut(block_size)
        .zip(block_offsets)
        .for_each(|(chunk, offset)| {
            let mut acc = offset;
            for el in chunk.iter_mut() {
                acc = op(acc, *el);
                *el = acc;
            }
        });
}

/// Prefix sum from `input` into `output`. The buffers may not alias; for
/// the in-place form use [`parallel_prefix_sum_in_place`].
pub fn parallel_prefix_sum<T, Op>(input: &[T], output: &mut [T], op: Op, identity: T)
where
    T: Copy + Send + Sync,
    Op: Fn(T, T) -> T + Sync,
{
    assert_eq!(input.len(), output.len());
    output.copy_from_slice(input);
    parallel_prefix_sum_in_place(output, op, identity);
}

pub fn sequential_prefix_sum_in_place<T, Op>(data: &mut [T], op: &Op, identity: T)
where
    T: Copy,
    Op: Fn(T, T) -> T,
{
    let mut acc = identity;
    for el in data.iter_mut() {
        acc = op(acc, *el);
        *el = acc;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_input() {
        let mut data: Vec<u64> = vec![];
        parallel_prefix_sum_in_place(&mut data, |a, b| a + b, 0);
        assert!(data.is_empty());
    }

    #[test]
    fn single_element() {
        let mut data = vec![7u64];
        parallel_prefix_sum_in_place(&mut data, |a, b| a + b, 0);
        assert_eq!(data, vec![7]);
    }

    #[test]
    fn small_matches_sequential() {
        let input: Vec<u64> = (0..1000).map(|i| i * i % 97).collect();
        let mut expected = input.clone();
        sequential_prefix_sum_in_place(&mut expected, &|a: u64, b: u64| a.wrapping_add(b), 0);

        let mut out = vec![0u64; input.len()];
        parallel_prefix_sum(&input, &mut out, |a, b| a.wrapping_add(b), 0);
        assert_eq!(out, expected);
    }

    #[test]
    fn non_commutative_associative_op() {
        // 2x2 matrix product over Z_256, associative but not commutative.
        type M = [u8; 4];
        fn mul(a: M, b: M) -> M {
            [
                a[0].wrapping_mul(b[0]).wrapping_add(a[1].wrapping_mul(b[2])),
                a[0].wrapping_mul(b[1]).wrapping_add(a[1].wrapping_mul(b[3])),
                a[2].wrapping_mul(b[0]).wrapping_add(a[3].wrapping_mul(b[2])),
                a[2].wrapping_mul(b[1]).wrapping_add(a[3].wrapping_mul(b[3])),
            ]
        }
        let id: M = [1, 0, 0, 1];
        let input: Vec<M> = (0u8..200)
            .map(|i| [i, i.wrapping_add(1), i.wrapping_mul(3), 1])
            .collect();

        let mut expected = input.clone();
        sequential_prefix_sum_in_place(&mut expected, &mul, id);

        let mut out = input.clone();
        parallel_prefix_sum_in_place(&mut out, mul, id);
        assert_eq!(out, expected);
    }
}
