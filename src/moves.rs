use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

use rayon::prelude::*;

use crate::{BlockId, Gain, NodeId};

pub type MoveId = u32;
pub type SearchId = u32;

pub const INVALID_MOVE: MoveId = MoveId::MAX;

const INVALID_GAIN: Gain = Gain::MIN;

/// One applied (or proposed) node move. `gain` is the signed objective
/// improvement: positive means the objective got smaller.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Move {
    pub node: NodeId,
    pub from: BlockId,
    pub to: BlockId,
    pub gain: Gain,
}

impl Move {
    pub fn invalidate(&mut self) {
        self.gain = INVALID_GAIN;
    }

    pub fn is_valid(&self) -> bool {
        self.gain != INVALID_GAIN
    }
}

/// Append-only log of committed moves, shared by all concurrent searches.
///
/// A slot is claimed with one fetch-add and then written and later read or
/// tombstoned only by the search that claimed it, which is what makes the
/// unsynchronized interior access sound.
pub struct MoveTracker {
    moves: Vec<UnsafeCell<Move>>,
    cursor: AtomicUsize,
}

unsafe impl Sync for MoveTracker {}

impl MoveTracker {
    pub fn new(capacity: usize) -> Self {
        Self {
            moves: (0..capacity)
                .map(|_| {
                    UnsafeCell::new(Move {
                        node: 0,
                        from: 0,
                        to: 0,
                        gain: INVALID_GAIN,
                    })
                })
                .collect(),
            cursor: AtomicUsize::new(0),
        }
    }

    /// Atomically appends `m`.
    ///
    /// Each node is acquired by at most one search per round and moved at
    /// most once by it, so the number of commits per round is bounded by
    /// the capacity. Running out of slots means that contract broke.
    pub fn insert(&self, m: Move) -> MoveId {
        let slot = self.cursor.fetch_add(1, Ordering::Relaxed);
        assert!(slot < self.moves.len(), "move log overflow");
        unsafe { *self.moves[slot].get() = m };
        slot as MoveId
    }

    pub fn get(&self, id: MoveId) -> Move {
        debug_assert!((id as usize) < self.len());
        unsafe { *self.moves[id as usize].get() }
    }

    pub fn set_gain(&self, id: MoveId, gain: Gain) {
        debug_assert!((id as usize) < self.len());
        unsafe { (*self.moves[id as usize].get()).gain = gain };
    }

    /// Tombstones a rolled-back move.
    pub fn invalidate(&self, id: MoveId) {
        debug_assert!((id as usize) < self.len());
        unsafe { (*self.moves[id as usize].get()).invalidate() };
    }

    pub fn len(&self) -> usize {
        self.cursor.load(Ordering::Relaxed).min(self.moves.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn reset(&mut self) {
        self.cursor.store(0, Ordering::Relaxed);
    }
}

const DEACTIVATED_BIT: u32 = 1 << 31;

const INACTIVE: u32 = 0;

/// Ownership of refinement nodes across concurrent local searches.
///
/// A node is INACTIVE until a search claims it with one compare-and-swap,
/// ACTIVE in that search while it sits in the search's queues, and
/// DEACTIVATED once the search moved it. Only the owning search may
/// deactivate; releasing returns the node to INACTIVE for later rounds.
pub struct NodeTracker {
    search_of_node: Vec<AtomicU32>,
    highest_active_search: AtomicU32,
}

impl NodeTracker {
    pub fn new(num_nodes: usize) -> Self {
        Self {
            search_of_node: (0..num_nodes).map(|_| AtomicU32::new(INACTIVE)).collect(),
            highest_active_search: AtomicU32::new(0),
        }
    }

    pub fn new_search(&self) -> SearchId {
        self.highest_active_search.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn acquire(&self, v: NodeId, search: SearchId) -> bool {
        debug_assert!(search & DEACTIVATED_BIT == 0);
        self.search_of_node[v as usize]
            .compare_exchange(INACTIVE, search, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
    }

    pub fn is_active_in(&self, v: NodeId, search: SearchId) -> bool {
        self.search_of_node[v as usize].load(Ordering::Acquire) == search
    }

    pub fn deactivate(&self, v: NodeId, search: SearchId) {
        debug_assert!(self.is_active_in(v, search));
        self.search_of_node[v as usize].store(search | DEACTIVATED_BIT, Ordering::Release);
    }

    pub fn release(&self, v: NodeId) {
        self.search_of_node[v as usize].store(INACTIVE, Ordering::Release);
    }

    pub fn reset(&self) {
        self.search_of_node
            .par_iter()
            .for_each(|s| s.store(INACTIVE, Ordering::Relaxed));
        self.highest_active_search.store(0, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tracker_append_and_tombstone() {
        let mut tracker = MoveTracker::new(8);
        let id = tracker.insert(Move {
            node: 3,
            from: 0,
            to: 1,
            gain: 5,
        });
        assert_eq!(tracker.get(id).node, 3);
        assert!(tracker.get(id).is_valid());

        tracker.invalidate(id);
        assert!(!tracker.get(id).is_valid());

        tracker.reset();
        assert!(tracker.is_empty());
    }

    #[test]
    fn tracker_concurrent_appends_get_distinct_slots() {
        let tracker = MoveTracker::new(4096);
        rayon::scope(|s| {
            for t in 0..4u32 {
                let tracker = &tracker;
                s.spawn(move |_| {
                    for i in 0..1024u32 {
                        tracker.insert(Move {
                            node: t * 1024 + i,
                            from: 0,
                            to: 1,
                            gain: 0,
                        });
                    }
                });
            }
        });
        assert_eq!(tracker.len(), 4096);
        let mut seen = vec![false; 4096];
        for id in 0..4096 {
            let m = tracker.get(id);
            assert!(!seen[m.node as usize]);
            seen[m.node as usize] = true;
        }
    }

    #[test]
    fn node_ownership_state_machine() {
        let tracker = NodeTracker::new(4);
        let s1 = tracker.new_search();
        let s2 = tracker.new_search();
        assert_ne!(s1, s2);

        assert!(tracker.acquire(0, s1));
        assert!(!tracker.acquire(0, s2));
        assert!(tracker.is_active_in(0, s1));

        tracker.deactivate(0, s1);
        assert!(!tracker.is_active_in(0, s1));
        assert!(!tracker.acquire(0, s2));

        tracker.release(0);
        assert!(tracker.acquire(0, s2));
    }
}
