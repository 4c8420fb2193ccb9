//! Keyed deadline scheduling for the state loop.
//!
//! The state loop never sleeps on its own: it asks the queue for the next
//! deadline, parks in `select!` until then, and drains the keys that came
//! due. Rescheduling a key replaces its deadline (health ticks and backoff
//! retries both want "latest schedule wins", in either direction).

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::collections::HashMap;
use std::hash::Hash;
use std::time::Instant;

/// Keyed timer queue with replace semantics.
///
/// One live deadline per key. The heap may hold stale entries for a key that
/// was rescheduled or cancelled; they are discarded by checking against
/// `pending` before use.
pub struct DeadlineQueue<K> {
    pending: HashMap<K, Instant>,
    heap: BinaryHeap<Reverse<(Instant, K)>>,
}

impl<K> Default for DeadlineQueue<K>
where
    K: Clone + Eq + Hash + Ord,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K> DeadlineQueue<K>
where
    K: Clone + Eq + Hash + Ord,
{
    pub fn new() -> Self {
        DeadlineQueue {
            pending: HashMap::new(),
            heap: BinaryHeap::new(),
        }
    }

    /// Schedule `key` to fire at `fire_at`, replacing any existing deadline.
    pub fn schedule(&mut self, key: K, fire_at: Instant) {
        if self.pending.get(&key).copied() == Some(fire_at) {
            return;
        }
        self.pending.insert(key.clone(), fire_at);
        self.heap.push(Reverse((fire_at, key)));
    }

    /// Cancel a pending deadline. Stale heap entries are left behind and
    /// discarded lazily.
    pub fn cancel(&mut self, key: &K) {
        self.pending.remove(key);
    }

    /// Cancel every pending key for which `predicate` holds.
    pub fn cancel_where(&mut self, predicate: impl Fn(&K) -> bool) {
        self.pending.retain(|key, _| !predicate(key));
    }

    /// The earliest live deadline across all keys, if any.
    pub fn next_deadline(&mut self) -> Option<Instant> {
        self.pop_stale();
        self.heap.peek().map(|Reverse((t, _))| *t)
    }

    /// Drain all keys whose deadline is due at `now`.
    ///
    /// Keys scheduled while the caller handles the drained batch are not
    /// re-examined until the next call, so a handler may reschedule its own
    /// key without spinning.
    pub fn drain_due(&mut self, now: Instant) -> Vec<K> {
        let mut due = Vec::new();
        loop {
            self.pop_stale();
            let Some(Reverse((fire_at, key))) = self.heap.peek().cloned() else {
                break;
            };
            if fire_at > now {
                break;
            }
            let _ = self.heap.pop();
            if self.pending.get(&key).copied() == Some(fire_at) {
                self.pending.remove(&key);
                due.push(key);
            }
        }
        due
    }

    pub fn is_pending(&self, key: &K) -> bool {
        self.pending.contains_key(key)
    }

    pub fn deadline_for(&self, key: &K) -> Option<Instant> {
        self.pending.get(key).copied()
    }

    fn pop_stale(&mut self) {
        while let Some(Reverse((fire_at, key))) = self.heap.peek() {
            match self.pending.get(key).copied() {
                Some(current) if current == *fire_at => break,
                _ => {
                    let _ = self.heap.pop();
                }
            }
        }
    }
}
