use std::collections::{HashMap, HashSet, VecDeque};
use std::time::{Duration, Instant};

use tokio::sync::Mutex;

/// Bounded record of recently dispatched event identifiers.
///
/// An identifier stays "seen" for `window` after it was recorded, and at most
/// `capacity` identifiers are remembered (oldest evicted first). Identifiers
/// currently being dispatched are reserved so a concurrent redelivery is
/// suppressed too.
pub struct DedupFilter {
    inner: Mutex<DedupState>,
    window: Duration,
    capacity: usize,
}

#[derive(Default)]
struct DedupState {
    seen: HashMap<String, Instant>,
    /// Insertion order for expiry and capacity eviction
    order: VecDeque<(String, Instant)>,
    in_flight: HashSet<String>,
}

impl DedupState {
    fn evict(&mut self, now: Instant, window: Duration, capacity: usize) {
        while let Some((key, at)) = self.order.front() {
            let expired = now.saturating_duration_since(*at) >= window;
            if !expired && self.order.len() <= capacity {
                break;
            }
            // A key re-recorded later has a newer entry further back; only
            // drop the map entry if it still points at this record.
            if self.seen.get(key) == Some(at) {
                self.seen.remove(key);
            }
            self.order.pop_front();
        }
    }
}

impl DedupFilter {
    pub fn new(window: Duration, capacity: usize) -> Self {
        Self {
            inner: Mutex::new(DedupState::default()),
            window,
            capacity: capacity.max(1),
        }
    }

    /// Reserve `key` for dispatch. Returns false if it was already dispatched
    /// within the window or is being dispatched right now.
    pub async fn try_begin(&self, key: &str) -> bool {
        self.try_begin_at(key, Instant::now()).await
    }

    async fn try_begin_at(&self, key: &str, now: Instant) -> bool {
        let mut state = self.inner.lock().await;
        state.evict(now, self.window, self.capacity);
        if state.seen.contains_key(key) || state.in_flight.contains(key) {
            return false;
        }
        state.in_flight.insert(key.to_string());
        true
    }

    /// Record `key` as processed and release its reservation.
    pub async fn finish(&self, key: &str) {
        self.finish_at(key, Instant::now()).await
    }

    async fn finish_at(&self, key: &str, now: Instant) {
        let mut state = self.inner.lock().await;
        state.in_flight.remove(key);
        state.seen.insert(key.to_string(), now);
        state.order.push_back((key.to_string(), now));
        state.evict(now, self.window, self.capacity);
    }

    #[allow(dead_code)]
    pub async fn len(&self) -> usize {
        self.inner.lock().await.seen.len()
    }
}
