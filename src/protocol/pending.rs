//! Bounded-TTL set of outbound message ids awaiting their echo.
//!
//! DESIGN
//! ======
//! Insertion-ordered `VecDeque<(Instant, id)>` plus a `HashMap` index, pruned
//! lazily on every access. An id matches at most once: the match removes it,
//! so each pending update is either consumed by exactly one echo or expires.
//! Entries removed by a match stay in the queue until pruning reaches them;
//! the index is authoritative.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

pub const DEFAULT_PENDING_TTL: Duration = Duration::from_secs(30);
pub const DEFAULT_PENDING_CAPACITY: usize = 1000;

pub struct PendingTracker {
    ttl: Duration,
    capacity: usize,
    order: VecDeque<(Instant, String)>,
    live: HashMap<String, Instant>,
}

impl PendingTracker {
    #[must_use]
    pub fn new(ttl: Duration, capacity: usize) -> Self {
        Self { ttl, capacity: capacity.max(1), order: VecDeque::new(), live: HashMap::new() }
    }

    /// Remember an outbound message id.
    pub fn register(&mut self, message_id: impl Into<String>) {
        self.register_at(message_id, Instant::now());
    }

    fn register_at(&mut self, message_id: impl Into<String>, now: Instant) {
        self.prune(now);
        while self.live.len() >= self.capacity {
            let Some((at, id)) = self.order.pop_front() else {
                break;
            };
            self.forget(&id, at);
        }
        let id = message_id.into();
        self.live.insert(id.clone(), now);
        self.order.push_back((now, id));
    }

    /// Check whether `message_id` is pending and consume it if so.
    pub fn matches(&mut self, message_id: &str) -> bool {
        self.matches_at(message_id, Instant::now())
    }

    fn matches_at(&mut self, message_id: &str, now: Instant) -> bool {
        self.prune(now);
        self.live.remove(message_id).is_some()
    }

    /// Number of unexpired, unmatched ids.
    #[must_use]
    pub fn len(&self) -> usize {
        self.live.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.live.is_empty()
    }

    fn prune(&mut self, now: Instant) {
        while let Some((at, _)) = self.order.front() {
            if now.duration_since(*at) <= self.ttl {
                break;
            }
            if let Some((at, id)) = self.order.pop_front() {
                self.forget(&id, at);
            }
        }
    }

    /// Drop `id` from the index unless it was re-registered after `at`.
    fn forget(&mut self, id: &str, at: Instant) {
        if self.live.get(id).is_some_and(|registered| *registered == at) {
            self.live.remove(id);
        }
    }
}

impl Default for PendingTracker {
    fn default() -> Self {
        Self::new(DEFAULT_PENDING_TTL, DEFAULT_PENDING_CAPACITY)
    }
}

#[cfg(test)]
#[path = "pending_test.rs"]
mod tests;
