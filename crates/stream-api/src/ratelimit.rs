//! Fixed-window request counter keyed by API key (falling back to client
//! IP), capacity-capped via a min-heap eviction on last-seen so the map
//! never grows unbounded under a spray of distinct keys/IPs.
//!
//! The heap holds one lazily-deleted entry per touch; an entry is only
//! acted on when its `seq` still matches the map's current `seq` for
//! that key, so stale heap entries from earlier touches are skipped
//! rather than corrupting state.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::Mutex;
use std::time::{Duration, Instant};

const DEFAULT_CAPACITY: usize = 10_000;

#[derive(Debug, Clone)]
struct Entry {
    count: u32,
    window_start: Instant,
    seq: u64,
}

#[derive(Debug)]
struct HeapItem {
    last_seen: Instant,
    seq: u64,
    key: String,
}

impl PartialEq for HeapItem {
    fn eq(&self, other: &Self) -> bool {
        self.last_seen == other.last_seen
    }
}
impl Eq for HeapItem {}
impl PartialOrd for HeapItem {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for HeapItem {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.last_seen.cmp(&other.last_seen)
    }
}

struct State {
    entries: HashMap<String, Entry>,
    heap: BinaryHeap<Reverse<HeapItem>>,
    next_seq: u64,
}

/// Per-key fixed-window limiter: `max_requests` per `window`, with the
/// key table capped at `capacity` entries. Used as an
/// `axum::middleware::from_fn_with_state` layer ahead of the public
/// routes only — the internal API is not rate-limited.
pub struct RateLimiter {
    state: Mutex<State>,
    capacity: usize,
    max_requests: u32,
    window: Duration,
}

impl RateLimiter {
    pub fn new(max_requests: u32, window: Duration) -> Self {
        Self::with_capacity(max_requests, window, DEFAULT_CAPACITY)
    }

    pub fn with_capacity(max_requests: u32, window: Duration, capacity: usize) -> Self {
        Self {
            state: Mutex::new(State {
                entries: HashMap::new(),
                heap: BinaryHeap::new(),
                next_seq: 0,
            }),
            capacity,
            max_requests,
            window,
        }
    }

    /// Returns `true` if `key`'s request is allowed under the current
    /// window, registering the attempt either way.
    pub fn check(&self, key: &str) -> bool {
        self.check_at(key, Instant::now())
    }

    fn check_at(&self, key: &str, now: Instant) -> bool {
        let mut state = self.state.lock().expect("rate limiter mutex poisoned");

        if !state.entries.contains_key(key) && state.entries.len() >= self.capacity {
            Self::evict_oldest(&mut state);
        }

        let seq = state.next_seq;
        state.next_seq += 1;

        let allowed = match state.entries.get_mut(key) {
            Some(entry) => {
                if now.duration_since(entry.window_start) >= self.window {
                    entry.window_start = now;
                    entry.count = 1;
                    entry.seq = seq;
                    true
                } else if entry.count < self.max_requests {
                    entry.count += 1;
                    entry.seq = seq;
                    true
                } else {
                    entry.seq = seq;
                    false
                }
            }
            None => {
                state.entries.insert(
                    key.to_string(),
                    Entry {
                        count: 1,
                        window_start: now,
                        seq,
                    },
                );
                true
            }
        };

        state.heap.push(Reverse(HeapItem {
            last_seen: now,
            seq,
            key: key.to_string(),
        }));

        allowed
    }

    fn evict_oldest(state: &mut State) {
        while let Some(Reverse(item)) = state.heap.pop() {
            let stale = match state.entries.get(&item.key) {
                Some(entry) => entry.seq != item.seq,
                None => true,
            };
            if stale {
                continue;
            }
            state.entries.remove(&item.key);
            break;
        }
    }

    pub fn len(&self) -> usize {
        self.state.lock().expect("rate limiter mutex poisoned").entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allows_up_to_the_limit_then_rejects() {
        let limiter = RateLimiter::new(2, Duration::from_secs(60));
        assert!(limiter.check("key-a"));
        assert!(limiter.check("key-a"));
        assert!(!limiter.check("key-a"));
    }

    #[test]
    fn distinct_keys_have_independent_budgets() {
        let limiter = RateLimiter::new(1, Duration::from_secs(60));
        assert!(limiter.check("a"));
        assert!(limiter.check("b"));
        assert!(!limiter.check("a"));
    }

    #[test]
    fn window_resets_after_it_elapses() {
        let limiter = RateLimiter::new(1, Duration::from_millis(10));
        let t0 = Instant::now();
        assert!(limiter.check_at("k", t0));
        assert!(!limiter.check_at("k", t0));
        assert!(limiter.check_at("k", t0 + Duration::from_millis(20)));
    }

    #[test]
    fn capacity_cap_evicts_oldest_key() {
        let limiter = RateLimiter::with_capacity(10, Duration::from_secs(60), 2);
        let t0 = Instant::now();
        assert!(limiter.check_at("a", t0));
        assert!(limiter.check_at("b", t0 + Duration::from_millis(1)));
        assert_eq!(limiter.len(), 2);
        assert!(limiter.check_at("c", t0 + Duration::from_millis(2)));
        assert_eq!(limiter.len(), 2);
        assert!(!limiter.state.lock().unwrap().entries.contains_key("a"));
    }
}
