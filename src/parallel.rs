use std::hint;
use std::sync::atomic::{AtomicBool, Ordering};

use rayon::prelude::*;

/// Test-and-test-and-set lock guarding very short critical sections.
pub(crate) struct SpinLock {
    locked: AtomicBool,
}

impl SpinLock {
    pub const fn new() -> Self {
        Self {
            locked: AtomicBool::new(false),
        }
    }

    pub fn lock(&self) {
        loop {
            if !self.locked.swap(true, Ordering::Acquire) {
                return;
            }
            while self.locked.load(Ordering::Relaxed) {
                hint::spin_loop();
            }
        }
    }

    pub fn unlock(&self) {
        self.locked.store(false, Ordering::Release);
    }

    pub fn with<R>(&self, f: impl FnOnce() -> R) -> R {
        self.lock();
        let out = f();
        self.unlock();
        out
    }
}

pub(crate) fn idiv_ceil(a: usize, b: usize) -> usize {
    a.div_ceil(b)
}

/// Bounds of chunk `i` when `[0, n)` is split into chunks of `chunk_size`.
pub(crate) fn chunk_bounds(i: usize, n: usize, chunk_size: usize) -> (usize, usize) {
    let start = (i * chunk_size).min(n);
    let end = ((i + 1) * chunk_size).min(n);
    (start, end)
}

/// Raw pointer wrapper for disjoint parallel scatter writes.
///
/// Safety contract of users: no two tasks may write the same index.
struct ScatterPtr<T>(*mut T);

unsafe impl<T: Send> Send for ScatterPtr<T> {}
unsafe impl<T: Send> Sync for ScatterPtr<T> {}

/// Stable parallel counting sort of `input` into `output` by `get_key`.
///
/// The input is split into `num_tasks` fixed chunks, so the result depends
/// only on the inputs and `num_tasks`, not on how many threads execute it.
/// Returns the bucket bounds: `bounds[key] .. bounds[key + 1]` is the output
/// range holding the elements with that key.
pub(crate) fn parallel_counting_sort<T, K>(
    input: &[T],
    output: &mut [T],
    max_key: usize,
    get_key: K,
    num_tasks: usize,
) -> Vec<usize>
where
    T: Copy + Send + Sync,
    K: Fn(&T) -> usize + Sync,
{
    assert_eq!(input.len(), output.len());
    let n = input.len();
    let num_tasks = num_tasks.max(1);
    let chunk_size = idiv_ceil(n.max(1), num_tasks);

    // One histogram per chunk keeps the sort stable across chunks.
    let mut histograms: Vec<Vec<usize>> = (0..num_tasks)
        .into_par_iter()
        .map(|task| {
            let (start, end) = chunk_bounds(task, n, chunk_size);
            let mut counts = vec![0usize; max_key];
            for el in &input[start..end] {
                counts[get_key(el)] += 1;
            }
            counts
        })
        .collect();

    // Turn the per-chunk counts into per-chunk write offsets. Bucket `key`
    // holds chunk 0's elements first, then chunk 1's, preserving the input
    // order within each chunk.
    let mut bounds = vec![0usize; max_key + 1];
    let mut running = 0usize;
    for key in 0..max_key {
        bounds[key] = running;
        for hist in histograms.iter_mut() {
            let count = hist[key];
            hist[key] = running;
            running += count;
        }
    }
    bounds[max_key] = running;
    debug_assert_eq!(running, n);

    let out = ScatterPtr(output.as_mut_ptr());
    let out = &out;
    histograms
        .into_par_iter()
        .enumerate()
        .for_each(|(task, mut offsets)| {
            let (start, end) = chunk_bounds(task, n, chunk_size);
            for el in &input[start..end] {
                let key = get_key(el);
                let pos = offsets[key];
                offsets[key] += 1;
                // Offsets of distinct (chunk, key) pairs cover disjoint ranges.
                unsafe { out.0.add(pos).write(*el) };
            }
        });

    bounds
}
