use std::cell::UnsafeCell;
use std::hint;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

use rand::SeedableRng;
use rand::rngs::SmallRng;
use rand::seq::SliceRandom;

use crate::NodeId;

/// `front` values at or above this sentinel mean the owner is reallocating
/// and consumers must back off.
const IN_REALLOC: usize = usize::MAX / 2;

const STEAL_FAILURE_LIMIT: usize = 1024;

/// Single-producer multiple-consumer queue.
///
/// The owning thread appends at the back, any thread pops at the front by
/// fetch-adding `front`. When a push would reallocate, the owner parks
/// `front` at [`IN_REALLOC`], waits for in-flight reads to drain, grows and
/// compacts the storage, and re-publishes `front`.
pub(crate) struct SpmcQueue<T> {
    elements: UnsafeCell<Vec<T>>,
    /// Number of published elements. Only the owner stores to it.
    len: AtomicUsize,
    front: AtomicUsize,
    /// Consumers currently between claiming a slot and finishing the read.
    readers: AtomicUsize,
}

// Consumers only read published slots while holding a `readers` ticket, and
// the owner never mutates storage before `readers` drains to zero.
unsafe impl<T: Send> Sync for SpmcQueue<T> {}

impl<T: Copy> SpmcQueue<T> {
    pub fn new() -> Self {
        let mut elements = Vec::new();
        elements.reserve(1 << 13);
        Self {
            elements: UnsafeCell::new(elements),
            len: AtomicUsize::new(0),
            front: AtomicUsize::new(0),
            readers: AtomicUsize::new(0),
        }
    }

    pub fn clear(&mut self) {
        self.elements.get_mut().clear();
        self.len.store(0, Ordering::Relaxed);
        self.front.store(0, Ordering::Relaxed);
    }

    /// Appends an element.
    ///
    /// # Safety
    ///
    /// Only the owning thread may call this, and never concurrently with
    /// itself. Concurrent `try_pop_front` calls from other threads are fine.
    pub unsafe fn push_back(&self, el: T) {
        let elements = unsafe { &mut *self.elements.get() };

        // Pops may have driven `front` past the end. Pull it back so the
        // window arithmetic below stays meaningful.
        if self.front.load(Ordering::Acquire) > elements.len()
            && self.front.load(Ordering::Acquire) < IN_REALLOC
        {
            self.front.store(elements.len(), Ordering::Release);
        }

        if elements.len() < elements.capacity() {
            elements.push(el);
            self.len.store(elements.len(), Ordering::Release);
            return;
        }

        // Park `front` no matter what value the concurrent pops left in it.
        let mut observed = self.front.load(Ordering::Acquire);
        loop {
            match self.front.compare_exchange_weak(
                observed,
                IN_REALLOC,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(current) => observed = current,
            }
        }
        let old_front = observed.min(elements.len());

        // Late consumers that already claimed a slot may still be copying.
        while self.readers.load(Ordering::Acquire) > 0 {
            hint::spin_loop();
        }

        elements.push(el);

        // Compact the live window to the start of the (grown) storage.
        let live = elements.len() - old_front;
        elements.copy_within(old_front.., 0);
        elements.truncate(live);
        self.len.store(live, Ordering::Release);
        self.front.store(0, Ordering::Release);
    }

    pub fn try_pop_front(&self) -> Option<T> {
        let f = self.front.load(Ordering::Acquire);
        if f >= IN_REALLOC || f >= self.len.load(Ordering::Acquire) {
            return None;
        }

        self.readers.fetch_add(1, Ordering::AcqRel);
        let slot = self.front.fetch_add(1, Ordering::AcqRel);
        let result = if slot < IN_REALLOC && slot < self.len.load(Ordering::Acquire) {
            Some(unsafe { (&*self.elements.get())[slot] })
        } else {
            None
        };
        self.readers.fetch_sub(1, Ordering::Release);
        result
    }

    pub fn currently_blocked(&self) -> bool {
        self.front.load(Ordering::Acquire) >= IN_REALLOC
    }

    pub fn size(&self) -> usize {
        let f = self.front.load(Ordering::Acquire);
        let len = self.len.load(Ordering::Acquire);
        len.saturating_sub(f)
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }
}

/// Pool of refinement nodes pending examination, one queue per worker.
///
/// Pops prefer the worker's own queue and fall back to stealing. Each node
/// carries a timestamp so a node popped in the current round is recognized
/// by [`WorkContainer::was_pushed_and_removed`] and can be handed back for
/// later searches without being re-seeded twice.
pub struct WorkContainer {
    queues: Vec<SpmcQueue<NodeId>>,
    timestamps: Vec<AtomicU32>,
    current: u32,
    steal_failures: AtomicUsize,
}

impl WorkContainer {
    pub fn new(num_workers: usize, max_num_nodes: usize) -> Self {
        Self {
            queues: (0..num_workers.max(1)).map(|_| SpmcQueue::new()).collect(),
            timestamps: (0..max_num_nodes).map(|_| AtomicU32::new(0)).collect(),
            current: 2,
            steal_failures: AtomicUsize::new(0),
        }
    }

    pub fn num_workers(&self) -> usize {
        self.queues.len()
    }

    /// Distributes `nodes` round-robin over the worker queues.
    pub fn seed(&mut self, nodes: impl IntoIterator<Item = NodeId>) {
        let num_queues = self.queues.len();
        for (i, node) in nodes.into_iter().enumerate() {
            // Exclusive access, so the single-producer contract holds.
            unsafe { self.queues[i % num_queues].push_back(node) };
            self.timestamps[node as usize].store(self.current, Ordering::Relaxed);
        }
    }

    /// Appends `node` to the queue of `worker`.
    ///
    /// # Safety
    ///
    /// At most one thread may push with a given `worker` index at a time.
    /// The refiners uphold this by passing their own broadcast index.
    pub unsafe fn push(&self, node: NodeId, worker: usize) {
        unsafe { self.queues[worker].push_back(node) };
        self.timestamps[node as usize].store(self.current, Ordering::Relaxed);
    }

    /// Pops from the worker's own queue, then tries to steal. Spins while
    /// another queue is mid-reallocation, up to a bounded number of failed
    /// sweeps.
    pub fn try_pop(&self, worker: usize) -> Option<NodeId> {
        if let Some(node) = self.queues[worker].try_pop_front() {
            self.stamp_removed(node);
            return Some(node);
        }

        loop {
            let mut some_blocked = false;
            for queue in &self.queues {
                if let Some(node) = queue.try_pop_front() {
                    self.stamp_removed(node);
                    return Some(node);
                }
                some_blocked |= queue.currently_blocked();
            }
            if !some_blocked {
                return None;
            }
            if self.steal_failures.fetch_add(1, Ordering::Relaxed) >= STEAL_FAILURE_LIMIT {
                return None;
            }
            while self.queues.iter().any(|q| q.currently_blocked()) {
                hint::spin_loop();
            }
        }
    }

    pub fn was_pushed_and_removed(&self, node: NodeId) -> bool {
        self.timestamps[node as usize].load(Ordering::Relaxed) == self.current + 1
    }

    /// Shuffles every queue, each with its own deterministic stream.
    pub fn shuffle(&mut self, seed: u64) {
        for (i, queue) in self.queues.iter_mut().enumerate() {
            debug_assert_eq!(queue.front.load(Ordering::Relaxed), 0);
            let mut rng = SmallRng::seed_from_u64(seed ^ (i as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15));
            queue.elements.get_mut().shuffle(&mut rng);
        }
    }

    pub fn clear(&mut self) {
        if self.current >= u32::MAX - 2 {
            use rayon::prelude::*;
            self.timestamps
                .par_iter()
                .for_each(|ts| ts.store(0, Ordering::Relaxed));
            self.current = 0;
        }
        for queue in self.queues.iter_mut() {
            queue.clear();
        }
        self.current += 2;
        self.steal_failures.store(0, Ordering::Relaxed);
    }

    pub fn size(&self) -> usize {
        self.queues.iter().map(|q| q.size()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.queues.iter().all(|q| q.is_empty())
    }

    fn stamp_removed(&self, node: NodeId) {
        self.timestamps[node as usize].store(self.current + 1, Ordering::Relaxed);
    }
}
