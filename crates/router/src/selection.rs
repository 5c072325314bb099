//! Least-loaded worker selection
//!
//! Workers live in fixed slots (their registration order). [`LoadHeap`] keeps
//! the slots in an indexed binary min-heap keyed by `(load, tie_rank)`, so the
//! least-loaded worker is an O(1) peek and every load change re-keys its slot
//! in O(log n).

use crate::registry::{WorkerRecord, WorkerRegistry};
use handoff_common::error::Result;
use handoff_common::TieBreak;
use std::cmp::Ordering;

/// Indexed min-heap over worker slots
#[derive(Debug, Clone)]
pub struct LoadHeap {
    /// Heap array of slot indices
    heap: Vec<usize>,

    /// Position of each slot inside `heap`
    positions: Vec<usize>,

    /// Current load per slot
    loads: Vec<u64>,

    /// Fixed tie-break rank per slot, unique across slots
    ranks: Vec<usize>,
}

impl LoadHeap {
    /// Create a heap with every slot at load 0
    ///
    /// `ranks` must be a permutation of `0..ranks.len()`.
    pub fn new(ranks: Vec<usize>) -> Self {
        let len = ranks.len();
        let mut heap: Vec<usize> = (0..len).collect();
        // With equal loads the heap order is exactly rank order.
        heap.sort_by_key(|&slot| ranks[slot]);

        let mut positions = vec![0; len];
        for (pos, &slot) in heap.iter().enumerate() {
            positions[slot] = pos;
        }

        Self {
            heap,
            positions,
            loads: vec![0; len],
            ranks,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    /// Slot with the smallest `(load, rank)`
    pub fn peek(&self) -> Option<usize> {
        self.heap.first().copied()
    }

    pub fn load(&self, slot: usize) -> u64 {
        self.loads[slot]
    }

    pub fn loads(&self) -> &[u64] {
        &self.loads
    }

    /// Increase a slot's load, returning the new value
    pub fn add(&mut self, slot: usize, weight: u64) -> u64 {
        self.loads[slot] = self.loads[slot].saturating_add(weight);
        self.sift_down(self.positions[slot]);
        self.loads[slot]
    }

    /// Decrease a slot's load without going below zero
    ///
    /// Returns the new load and the part of `weight` that could not be
    /// subtracted.
    pub fn sub(&mut self, slot: usize, weight: u64) -> (u64, u64) {
        let current = self.loads[slot];
        let shortfall = weight.saturating_sub(current);
        self.loads[slot] = current.saturating_sub(weight);
        self.sift_up(self.positions[slot]);
        (self.loads[slot], shortfall)
    }

    fn less(&self, a: usize, b: usize) -> bool {
        (self.loads[a], self.ranks[a]) < (self.loads[b], self.ranks[b])
    }

    fn swap(&mut self, i: usize, j: usize) {
        self.heap.swap(i, j);
        self.positions[self.heap[i]] = i;
        self.positions[self.heap[j]] = j;
    }

    fn sift_up(&mut self, mut pos: usize) {
        while pos > 0 {
            let parent = (pos - 1) / 2;
            if !self.less(self.heap[pos], self.heap[parent]) {
                break;
            }
            self.swap(pos, parent);
            pos = parent;
        }
    }

    fn sift_down(&mut self, mut pos: usize) {
        let len = self.heap.len();
        loop {
            let left = 2 * pos + 1;
            let right = left + 1;
            let mut smallest = pos;

            if left < len && self.less(self.heap[left], self.heap[smallest]) {
                smallest = left;
            }
            if right < len && self.less(self.heap[right], self.heap[smallest]) {
                smallest = right;
            }
            if smallest == pos {
                break;
            }
            self.swap(pos, smallest);
            pos = smallest;
        }
    }
}

/// Tie-break rank per slot for workers listed in registration order
pub fn tie_ranks(ids: &[String], policy: TieBreak) -> Vec<usize> {
    match policy {
        TieBreak::FirstRegistered => (0..ids.len()).collect(),
        TieBreak::LowestId => {
            let mut order: Vec<usize> = (0..ids.len()).collect();
            order.sort_by(|&a, &b| ids[a].cmp(&ids[b]));

            let mut ranks = vec![0; ids.len()];
            for (rank, slot) in order.into_iter().enumerate() {
                ranks[slot] = rank;
            }
            ranks
        }
    }
}

/// Id of the worker with the minimal load
///
/// Fails with `NoWorkersAvailable` when the registry is empty.
pub fn select_least_loaded(registry: &WorkerRegistry) -> Result<String> {
    registry.least_loaded().map(|record| record.id)
}

/// Linear scan over a snapshot in registration order
///
/// Reference implementation of the heap's ordering.
pub fn scan_least_loaded(records: &[WorkerRecord], policy: TieBreak) -> Option<&WorkerRecord> {
    records.iter().min_by(|a, b| match a.load.cmp(&b.load) {
        Ordering::Equal => match policy {
            // `min_by` keeps the first of equal elements
            TieBreak::FirstRegistered => Ordering::Equal,
            TieBreak::LowestId => a.id.cmp(&b.id),
        },
        ord => ord,
    })
}
