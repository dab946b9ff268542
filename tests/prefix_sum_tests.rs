use hypercut::prefix::{parallel_prefix_sum, parallel_prefix_sum_in_place};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

fn wrapping_add(a: u64, b: u64) -> u64 {
    a.wrapping_add(b)
}

#[test]
fn all_zeroes() {
    let n = 1usize << 19;
    let input = vec![0u64; n];
    let mut output = vec![420u64; n];

    parallel_prefix_sum(&input, &mut output, wrapping_add, 0);

    for (i, (a, b)) in input.iter().zip(&output).enumerate() {
        assert_eq!(a, b, "mismatch at {i}");
    }
}

#[test]
fn matches_sequential() {
    let n = 1usize << 19;
    let mut rng = StdRng::seed_from_u64(420);
    let input: Vec<u64> = (0..n).map(|_| rng.random()).collect();

    let mut output = vec![420u64; n];
    parallel_prefix_sum(&input, &mut output, wrapping_add, 0);

    let mut expected = Vec::with_capacity(n);
    let mut acc = 0u64;
    for &x in &input {
        acc = acc.wrapping_add(x);
        expected.push(acc);
    }
    assert_eq!(output, expected);
}

#[test]
fn works_in_place() {
    let n = 1usize << 19;
    let mut rng = StdRng::seed_from_u64(421);
    let mut data: Vec<u64> = (0..n).map(|_| rng.random()).collect();
    let mut expected = data.clone();

    parallel_prefix_sum_in_place(&mut data, wrapping_add, 0);

    let mut acc = 0u64;
    for x in expected.iter_mut() {
        acc = acc.wrapping_add(*x);
        *x = acc;
    }
    assert_eq!(data, expected);
}

#[test]
fn result_independent_of_thread_count() {
    let n = 1usize << 18;
    let mut rng = StdRng::seed_from_u64(7);
    let input: Vec<u64> = (0..n).map(|_| rng.random()).collect();

    let mut results = Vec::new();
    for threads in [1usize, 4, 16] {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .build()
            .unwrap();
        let mut data = input.clone();
        pool.install(|| parallel_prefix_sum_in_place(&mut data, wrapping_add, 0));
        results.push(data);
    }
    assert_eq!(results[0], results[1]);
    assert_eq!(results[1], results[2]);
}
