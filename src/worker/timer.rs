//! Session deadline bookkeeping.
//!
//! The worker arms one deadline per session on creation and re-arms it on
//! refresh or after a `Continue`/`Retry` timeout outcome. Time is expressed
//! as an offset from the worker's epoch so the queue can be driven by a
//! wall clock or advanced by hand in tests.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::time::Duration;

use crate::models::ids::EntityIndex;

/// Timer facility that reports elapsed session deadlines.
///
/// Each elapsed deadline is reported exactly once unless it was cancelled
/// or re-armed first.
pub trait TimeoutRegistrar: Send {
    /// Arm (or re-arm) the deadline of `session` at absolute offset `at`.
    fn arm(&mut self, session: EntityIndex, at: Duration);

    /// Cancel the deadline of `session`. Returns `true` if one was armed.
    fn cancel(&mut self, session: EntityIndex) -> bool;

    /// Currently armed deadline of `session`.
    fn deadline(&self, session: EntityIndex) -> Option<Duration>;

    /// Pop one session whose deadline is `<= now`.
    fn pop_expired(&mut self, now: Duration) -> Option<EntityIndex>;

    /// Earliest armed deadline.
    fn next_deadline(&self) -> Option<Duration>;
}

#[derive(Debug, PartialEq, Eq)]
struct Entry {
    at: Duration,
    seq: u64,
    session: EntityIndex,
}

impl Ord for Entry {
    // Reversed so the max-heap yields the earliest deadline first.
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .at
            .cmp(&self.at)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Binary-heap registrar with lazy cancellation.
///
/// Re-arming leaves the old heap entry in place; it is discarded when popped
/// because its sequence number no longer matches the armed one.
#[derive(Debug, Default)]
pub struct DeadlineQueue {
    heap: BinaryHeap<Entry>,
    armed: HashMap<EntityIndex, (u64, Duration)>,
    next_seq: u64,
}

impl DeadlineQueue {
    /// Create an empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of armed deadlines.
    #[must_use]
    pub fn len(&self) -> usize {
        self.armed.len()
    }

    /// Whether no deadline is armed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.armed.is_empty()
    }

    fn discard_stale(&mut self) {
        while let Some(top) = self.heap.peek() {
            match self.armed.get(&top.session) {
                Some((seq, _)) if *seq == top.seq => return,
                _ => {
                    self.heap.pop();
                }
            }
        }
    }
}

impl TimeoutRegistrar for DeadlineQueue {
    fn arm(&mut self, session: EntityIndex, at: Duration) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.armed.insert(session, (seq, at));
        self.heap.push(Entry { at, seq, session });
    }

    fn cancel(&mut self, session: EntityIndex) -> bool {
        self.armed.remove(&session).is_some()
    }

    fn deadline(&self, session: EntityIndex) -> Option<Duration> {
        self.armed.get(&session).map(|(_, at)| *at)
    }

    fn pop_expired(&mut self, now: Duration) -> Option<EntityIndex> {
        self.discard_stale();
        if self.heap.peek()?.at > now {
            return None;
        }
        let entry = self.heap.pop()?;
        self.armed.remove(&entry.session);
        Some(entry.session)
    }

    fn next_deadline(&self) -> Option<Duration> {
        self.armed.values().map(|(_, at)| *at).min()
    }
}
