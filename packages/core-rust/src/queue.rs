//! Comparator-ordered priority queue.
//!
//! Items are kept in a vector sorted by the caller's comparator, head first.
//! Insertion uses a binary search for the position after every item that
//! compares equal, so items with equal keys leave in insertion order. Callers
//! that need FIFO among equals as a contract should encode the insertion
//! sequence in the comparator.
//!
//! `peek` and `dequeue` both read the head of the same vector and therefore
//! always agree.

use std::cmp::Ordering;
use std::fmt;

use serde::Serialize;

/// Boxed comparator used to order queue items.
pub type Comparator<T> = Box<dyn Fn(&T, &T) -> Ordering + Send + Sync>;

/// Read-only queue counters for observability collectors.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    /// Items currently queued.
    pub depth: usize,
    /// Items ever enqueued (including merged items).
    pub enqueued_total: u64,
    /// Items ever removed by `dequeue`, `drain*` or `remove_where`.
    pub dequeued_total: u64,
}

/// Priority queue ordered by a caller-supplied comparator.
///
/// The item that compares `Less` than all others is dequeued first.
pub struct PriorityQueue<T> {
    items: Vec<T>,
    cmp: Comparator<T>,
    enqueued_total: u64,
    dequeued_total: u64,
}

impl<T> fmt::Debug for PriorityQueue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PriorityQueue")
            .field("depth", &self.items.len())
            .field("enqueued_total", &self.enqueued_total)
            .field("dequeued_total", &self.dequeued_total)
            .finish_non_exhaustive()
    }
}

impl<T> PriorityQueue<T> {
    /// Creates an empty queue ordered by `cmp`.
    pub fn new(cmp: impl Fn(&T, &T) -> Ordering + Send + Sync + 'static) -> Self {
        Self {
            items: Vec::new(),
            cmp: Box::new(cmp),
            enqueued_total: 0,
            dequeued_total: 0,
        }
    }

    /// Queue that dequeues the smallest key first.
    pub fn min_by_key<K: Ord>(key: impl Fn(&T) -> K + Send + Sync + 'static) -> Self {
        Self::new(move |a, b| key(a).cmp(&key(b)))
    }

    /// Queue that dequeues the largest key first.
    pub fn max_by_key<K: Ord>(key: impl Fn(&T) -> K + Send + Sync + 'static) -> Self {
        Self::new(move |a, b| key(b).cmp(&key(a)))
    }

    /// Inserts an item at its ordered position.
    pub fn enqueue(&mut self, item: T) {
        let idx = self
            .items
            .partition_point(|existing| (self.cmp)(existing, &item) != Ordering::Greater);
        self.items.insert(idx, item);
        self.enqueued_total += 1;
    }

    /// Returns the next item without removing it.
    #[must_use]
    pub fn peek(&self) -> Option<&T> {
        self.items.first()
    }

    /// Removes and returns the next item.
    pub fn dequeue(&mut self) -> Option<T> {
        if self.items.is_empty() {
            return None;
        }
        self.dequeued_total += 1;
        Some(self.items.remove(0))
    }

    /// Removes and returns up to `n` items in dequeue order.
    pub fn drain(&mut self, n: usize) -> Vec<T> {
        let n = n.min(self.items.len());
        self.dequeued_total += n as u64;
        self.items.drain(..n).collect()
    }

    /// Removes and returns the head-run of items for which `pred` holds.
    ///
    /// Stops at the first item that does not match; that item and everything
    /// behind it stay queued in order.
    pub fn drain_while(&mut self, mut pred: impl FnMut(&T) -> bool) -> Vec<T> {
        let n = self.items.iter().take_while(|item| pred(item)).count();
        self.drain(n)
    }

    /// Removes every matching item wherever it sits, in dequeue order.
    ///
    /// The remaining items keep their relative order.
    pub fn remove_where(&mut self, mut pred: impl FnMut(&T) -> bool) -> Vec<T> {
        let mut removed = Vec::new();
        let mut kept = Vec::with_capacity(self.items.len());
        for item in self.items.drain(..) {
            if pred(&item) {
                removed.push(item);
            } else {
                kept.push(item);
            }
        }
        self.items = kept;
        self.dequeued_total += removed.len() as u64;
        removed
    }

    /// Moves every item of `other` into this queue.
    ///
    /// Incoming items are re-ordered under this queue's comparator, so the
    /// merged dequeue sequence is fully sorted even when `other` was ordered
    /// by a different comparator.
    pub fn merge(&mut self, other: PriorityQueue<T>) {
        let mut incoming = other.items;
        self.enqueued_total += incoming.len() as u64;
        // Stable sort keeps insertion order among equals: existing items
        // stay ahead of incoming items with the same key.
        self.items.append(&mut incoming);
        let cmp = &self.cmp;
        self.items.sort_by(|a, b| cmp(a, b));
    }

    /// Iterates items in dequeue order.
    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.items.iter()
    }

    /// Number of queued items.
    #[must_use]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Returns `true` when no item is queued.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Snapshot of the queue counters.
    #[must_use]
    pub fn stats(&self) -> QueueStats {
        QueueStats {
            depth: self.items.len(),
            enqueued_total: self.enqueued_total,
            dequeued_total: self.dequeued_total,
        }
    }
}
