//! Task queue with lazy deletion
//!
//! Uses std::collections::BinaryHeap with a HashMap of live entries.
//! Rescheduling and removal leave tombstones in the heap which are
//! discarded on peek/pop.

use crate::error::{ClockError, Result};
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};

static SEQUENCE: AtomicU64 = AtomicU64::new(0);

/// Allocate a fresh insertion sequence number.
/// Shared by every queue in the process so watermarks compare across clocks.
fn next_sequence() -> u64 {
    SEQUENCE.fetch_add(1, AtomicOrdering::SeqCst)
}

/// The sequence number the next insertion will receive.
/// Entries with a smaller sequence existed before this call.
pub fn sequence_watermark() -> u64 {
    SEQUENCE.load(AtomicOrdering::SeqCst)
}

/// Heap key: (priority, seq) with the item carried along.
#[derive(Clone, Debug)]
struct Key<T> {
    priority: f64,
    seq: u64,
    item: T,
}

impl<T> PartialEq for Key<T> {
    fn eq(&self, other: &Self) -> bool {
        self.priority.to_bits() == other.priority.to_bits() && self.seq == other.seq
    }
}

impl<T> Eq for Key<T> {}

impl<T> PartialOrd for Key<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

// BinaryHeap is a max-heap, so we reverse the ordering for min-heap behavior.
impl<T> Ord for Key<T> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .total_cmp(&other.priority)
            .then(self.seq.cmp(&other.seq))
            .reverse()
    }
}

/// A min-priority queue of schedulable items keyed by time.
///
/// An item has at most one live entry: `add` on an item that is already
/// queued replaces its entry. The `live` map is the source of truth; heap
/// entries that disagree with it are tombstones.
#[derive(Debug)]
pub struct TaskQueue<T: Clone + Eq + Hash> {
    heap: BinaryHeap<Key<T>>,
    live: HashMap<T, (f64, u64)>,
}

impl<T: Clone + Eq + Hash> Default for TaskQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone + Eq + Hash> TaskQueue<T> {
    pub fn new() -> Self {
        Self {
            heap: BinaryHeap::new(),
            live: HashMap::new(),
        }
    }

    /// Insert `item` at `priority`, replacing any entry it already has.
    pub fn add(&mut self, priority: f64, item: T) {
        let seq = next_sequence();
        // A replaced entry stays in the heap as a tombstone.
        self.live.insert(item.clone(), (priority, seq));
        self.heap.push(Key {
            priority,
            seq,
            item,
        });
        self.maybe_compact();
    }

    /// Tombstone the entry for `item`. Returns false if it was not queued.
    pub fn remove(&mut self, item: &T) -> bool {
        let removed = self.live.remove(item).is_some();
        if removed {
            self.maybe_compact();
        }
        removed
    }

    /// Whether `item` currently has a live entry.
    pub fn contains(&self, item: &T) -> bool {
        self.live.contains_key(item)
    }

    /// Priority of the live entry for `item`.
    pub fn priority_of(&self, item: &T) -> Option<f64> {
        self.live.get(item).map(|(p, _)| *p)
    }

    /// Pop the smallest live entry.
    pub fn pop(&mut self) -> Result<(f64, T)> {
        loop {
            let k = self.heap.pop().ok_or(ClockError::EmptyQueue)?;
            if self.is_live(&k) {
                self.live.remove(&k.item);
                return Ok((k.priority, k.item));
            }
        }
    }

    /// Peek without removing. `smallest = false` returns the largest live
    /// entry instead (latest insertion on ties).
    pub fn peek(&mut self, smallest: bool) -> Result<(f64, T)> {
        if smallest {
            return self
                .peek_entry()
                .map(|(p, _, item)| (p, item))
                .ok_or(ClockError::EmptyQueue);
        }
        self.live
            .iter()
            .max_by(|(_, (pa, sa)), (_, (pb, sb))| pa.total_cmp(pb).then(sa.cmp(sb)))
            .map(|(item, (p, _))| (*p, item.clone()))
            .ok_or(ClockError::EmptyQueue)
    }

    /// The smallest live entry as (priority, seq, item).
    pub fn peek_entry(&mut self) -> Option<(f64, u64, T)> {
        self.clean_top();
        self.heap
            .peek()
            .map(|k| (k.priority, k.seq, k.item.clone()))
    }

    /// Priority of the smallest live entry.
    pub fn peek_priority(&mut self) -> Option<f64> {
        self.clean_top();
        self.heap.peek().map(|k| k.priority)
    }

    /// Smallest live entry whose sequence is below `watermark`.
    /// Scans the live set, so only used off the hot path.
    pub fn peek_before(&self, watermark: u64) -> Option<(f64, u64, T)> {
        self.live
            .iter()
            .filter(|(_, (_, seq))| *seq < watermark)
            .min_by(|(_, (pa, sa)), (_, (pb, sb))| pa.total_cmp(pb).then(sa.cmp(sb)))
            .map(|(item, (p, seq))| (*p, *seq, item.clone()))
    }

    pub fn is_empty(&self) -> bool {
        self.live.is_empty()
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.live.len()
    }

    /// Number of dead heap entries not yet evicted.
    pub fn tombstones(&self) -> usize {
        self.heap.len() - self.live.len()
    }

    pub fn clear(&mut self) {
        self.heap.clear();
        self.live.clear();
    }

    /// Live entries in ascending (priority, insertion) order.
    pub fn iter(&self) -> impl Iterator<Item = (f64, &T)> {
        let mut entries: Vec<(f64, u64, &T)> = self
            .live
            .iter()
            .map(|(item, (p, seq))| (*p, *seq, item))
            .collect();
        entries.sort_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)));
        entries.into_iter().map(|(p, _, item)| (p, item))
    }

    /// Owned copy of `iter()`.
    pub fn snapshot(&self) -> Vec<(f64, T)> {
        self.iter().map(|(p, item)| (p, item.clone())).collect()
    }

    fn is_live(&self, k: &Key<T>) -> bool {
        matches!(self.live.get(&k.item), Some((_, seq)) if *seq == k.seq)
    }

    /// Remove tombstones from the top of the heap.
    fn clean_top(&mut self) {
        while let Some(k) = self.heap.peek() {
            if self.is_live(k) {
                break;
            }
            self.heap.pop();
        }
    }

    /// Rebuild the heap once tombstones dominate it.
    fn maybe_compact(&mut self) {
        if self.tombstones() <= 64 || self.tombstones() <= self.live.len() {
            return;
        }
        let heap = std::mem::take(&mut self.heap);
        let kept: BinaryHeap<Key<T>> = heap.into_iter().filter(|k| self.is_live(k)).collect();
        self.heap = kept;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pop_order_with_ties() {
        let mut q: TaskQueue<&str> = TaskQueue::new();
        q.add(5.0, "a");
        q.add(1.0, "b");
        q.add(1.0, "c");

        assert_eq!(q.pop().unwrap(), (1.0, "b"));
        assert_eq!(q.pop().unwrap(), (1.0, "c"));
        assert_eq!(q.pop().unwrap(), (5.0, "a"));
        assert!(q.is_empty());
        assert!(matches!(q.pop(), Err(ClockError::EmptyQueue)));
    }

    #[test]
    fn test_random_priorities_pop_sorted() {
        let mut rng = crate::rng::DetRng::new("pq");
        let mut q: TaskQueue<u32> = TaskQueue::new();
        for i in 0..500 {
            q.add((rng.random() * 100.0).floor(), i);
        }

        let mut last = (f64::NEG_INFINITY, 0u32);
        let mut count = 0;
        while let Ok((p, item)) = q.pop() {
            assert!(p >= last.0);
            if p == last.0 {
                // Items were inserted in increasing order, so FIFO means increasing ids.
                assert!(item > last.1);
            }
            last = (p, item);
            count += 1;
        }
        assert_eq!(count, 500);
    }

    #[test]
    fn test_reschedule_replaces_entry() {
        let mut q: TaskQueue<&str> = TaskQueue::new();
        q.add(1.0, "t");
        q.add(3.0, "t");
        q.add(2.0, "t");

        assert_eq!(q.len(), 1);
        assert_eq!(q.priority_of(&"t"), Some(2.0));
        assert_eq!(q.pop().unwrap(), (2.0, "t"));
        assert!(q.is_empty());
        assert!(q.pop().is_err());
    }

    #[test]
    fn test_remove_is_lazy() {
        let mut q: TaskQueue<&str> = TaskQueue::new();
        q.add(1.0, "x");
        assert!(q.remove(&"x"));
        assert!(q.is_empty());
        assert_eq!(q.tombstones(), 1);

        // Absent items are a no-op.
        assert!(!q.remove(&"missing"));
        assert!(q.is_empty());
        assert!(q.peek(true).is_err());
    }

    #[test]
    fn test_peek_smallest_and_largest() {
        let mut q: TaskQueue<&str> = TaskQueue::new();
        q.add(2.0, "mid");
        q.add(9.0, "high");
        q.add(0.5, "low");
        q.remove(&"high");

        assert_eq!(q.peek(true).unwrap(), (0.5, "low"));
        assert_eq!(q.peek(false).unwrap(), (2.0, "mid"));
        assert_eq!(q.len(), 2);
    }

    #[test]
    fn test_iter_is_sorted_and_non_destructive() {
        let mut q: TaskQueue<&str> = TaskQueue::new();
        q.add(3.0, "c");
        q.add(1.0, "a");
        q.add(2.0, "b");
        q.add(0.0, "gone");
        q.remove(&"gone");

        let seen: Vec<_> = q.iter().map(|(p, item)| (p, *item)).collect();
        assert_eq!(seen, vec![(1.0, "a"), (2.0, "b"), (3.0, "c")]);
        assert_eq!(q.len(), 3);
    }

    #[test]
    fn test_peek_before_watermark() {
        let mut q: TaskQueue<&str> = TaskQueue::new();
        q.add(2.0, "old");
        let mark = sequence_watermark();
        q.add(1.0, "new");

        assert_eq!(q.peek_entry().map(|e| e.2), Some("new"));
        assert_eq!(q.peek_before(mark).map(|e| e.2), Some("old"));
    }

    #[test]
    fn test_compaction_keeps_live_entries() {
        let mut q: TaskQueue<u32> = TaskQueue::new();
        for round in 0..200 {
            q.add(round as f64, 1);
            q.add(round as f64 + 0.5, 2);
        }
        assert_eq!(q.len(), 2);
        assert!(q.tombstones() <= 64 + 2);
        assert_eq!(q.pop().unwrap(), (199.0, 1));
        assert_eq!(q.pop().unwrap(), (199.5, 2));
    }

    #[test]
    fn test_clear() {
        let mut q: TaskQueue<u32> = TaskQueue::new();
        q.add(1.0, 1);
        q.add(2.0, 2);
        q.remove(&1);
        q.clear();
        assert!(q.is_empty());
        assert_eq!(q.tombstones(), 0);
    }
}
