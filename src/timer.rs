//! Deadline-ordered timers used for connect timeouts (§4.3) and TLS
//! handshake timeouts (§4.4).
//!
//! The teacher's `timer.rs` implements a hierarchical timer wheel sized for
//! very large timer counts; this crate only ever has a handful of
//! in-flight deadlines per connection (one connect timeout, one handshake
//! timeout), so a sorted min-heap of deadlines is the right-sized
//! replacement — the wheel's O(1)-amortized insert doesn't pay for itself
//! at this scale.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::time::{Duration, Instant};

/// Identifies a scheduled timer so it can be cancelled before it fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerToken(u64);

struct Entry {
    deadline: Instant,
    token: TimerToken,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline
    }
}
impl Eq for Entry {}
impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for Entry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.deadline.cmp(&other.deadline)
    }
}

/// A single-thread registry of pending deadlines.
#[derive(Default)]
pub struct Timers {
    heap: BinaryHeap<Reverse<Entry>>,
    cancelled: std::collections::HashSet<TimerToken>,
    next_id: u64,
}

impl Timers {
    pub fn new() -> Self {
        Self {
            heap: BinaryHeap::new(),
            cancelled: std::collections::HashSet::new(),
            next_id: 0,
        }
    }

    /// Schedules a deadline `delay` from now, returning a token that can be
    /// passed to [`Timers::cancel`].
    pub fn schedule(&mut self, delay: Duration) -> TimerToken {
        let token = TimerToken(self.next_id);
        self.next_id += 1;
        self.heap.push(Reverse(Entry {
            deadline: Instant::now() + delay,
            token,
        }));
        token
    }

    /// Cancels a timer. Returns `true` if it was still pending.
    pub fn cancel(&mut self, token: TimerToken) -> bool {
        // Lazily removed: marked cancelled, skipped when it would fire.
        if self.heap.iter().any(|e| e.0.token == token) {
            self.cancelled.insert(token);
            true
        } else {
            false
        }
    }

    /// Pops every token whose deadline has passed.
    pub fn poll_expired(&mut self) -> Vec<TimerToken> {
        let now = Instant::now();
        let mut fired = Vec::new();
        while let Some(Reverse(entry)) = self.heap.peek() {
            if entry.deadline > now {
                break;
            }
            let Reverse(entry) = self.heap.pop().unwrap();
            if self.cancelled.remove(&entry.token) {
                continue;
            }
            fired.push(entry.token);
        }
        fired
    }

    /// Duration until the next pending (non-cancelled) deadline, or `None`
    /// if there are no pending timers — used to bound `Poll::poll`'s
    /// timeout so the reactor wakes up in time to fire it.
    pub fn next_deadline(&self) -> Option<Duration> {
        let now = Instant::now();
        self.heap
            .iter()
            .filter(|e| !self.cancelled.contains(&e.0.token))
            .map(|e| e.0.deadline.saturating_duration_since(now))
            .min()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expired_timer_is_returned_once() {
        let mut timers = Timers::new();
        let token = timers.schedule(Duration::from_millis(0));
        std::thread::sleep(Duration::from_millis(5));
        let fired = timers.poll_expired();
        assert_eq!(fired, vec![token]);
        assert!(timers.poll_expired().is_empty());
    }

    #[test]
    fn cancelled_timer_never_fires() {
        let mut timers = Timers::new();
        let token = timers.schedule(Duration::from_millis(0));
        assert!(timers.cancel(token));
        std::thread::sleep(Duration::from_millis(5));
        assert!(timers.poll_expired().is_empty());
    }
}
