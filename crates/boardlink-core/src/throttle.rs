//! Per-key trailing-edge throttle for continuous local mutations.
//!
//! The first `schedule` for a key opens a window of `interval`. Later calls
//! inside the window replace the pending payload instead of queuing. When the
//! window closes, [`Throttle::drain_due`] releases the latest payload once.
//! A key therefore releases at most once per interval.

use std::collections::HashMap;
use std::hash::Hash;
use std::time::{Duration, Instant};

/// Default release interval for drag updates.
pub const DEFAULT_THROTTLE_INTERVAL: Duration = Duration::from_millis(100);

struct Pending<T> {
    payload: T,
    due: Instant,
}

/// Trailing-edge throttle keyed by `K`, coalescing payloads of type `T`.
pub struct Throttle<K, T> {
    interval: Duration,
    pending: HashMap<K, Pending<T>>,
}

impl<K: Eq + Hash + Clone, T> Throttle<K, T> {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            pending: HashMap::new(),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Schedule `payload` for `key`, replacing any pending payload.
    pub fn schedule(&mut self, key: K, payload: T) {
        self.schedule_at(key, payload, Instant::now());
    }

    /// [`Throttle::schedule`] with an explicit clock reading.
    pub fn schedule_at(&mut self, key: K, payload: T, now: Instant) {
        match self.pending.get_mut(&key) {
            Some(pending) => pending.payload = payload,
            None => {
                self.pending.insert(key, Pending { payload, due: now + self.interval });
            }
        }
    }

    /// Release every payload whose window has closed, oldest deadline first.
    pub fn drain_due(&mut self) -> Vec<(K, T)> {
        self.drain_due_at(Instant::now())
    }

    /// [`Throttle::drain_due`] with an explicit clock reading.
    pub fn drain_due_at(&mut self, now: Instant) -> Vec<(K, T)> {
        let mut due: Vec<K> = self
            .pending
            .iter()
            .filter(|(_, p)| p.due <= now)
            .map(|(k, _)| k.clone())
            .collect();
        due.sort_by_key(|k| self.pending[k].due);

        due.into_iter()
            .filter_map(|k| self.pending.remove(&k).map(|p| (k, p.payload)))
            .collect()
    }

    /// Release the pending payload for `key` immediately, ignoring its window.
    pub fn flush(&mut self, key: &K) -> Option<T> {
        self.pending.remove(key).map(|p| p.payload)
    }

    /// Drop the pending payload for `key` without releasing it.
    pub fn cancel(&mut self, key: &K) -> bool {
        self.pending.remove(key).is_some()
    }

    /// Keep only the pending payloads whose key satisfies `keep`.
    pub fn retain(&mut self, mut keep: impl FnMut(&K) -> bool) {
        self.pending.retain(|key, _| keep(key));
    }

    /// Drop every pending payload.
    pub fn clear(&mut self) {
        self.pending.clear();
    }

    pub fn is_pending(&self, key: &K) -> bool {
        self.pending.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Earliest deadline among pending keys, for hosts that arm a timer.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.pending.values().map(|p| p.due).min()
    }
}

impl<K: Eq + Hash + Clone, T> Default for Throttle<K, T> {
    fn default() -> Self {
        Self::new(DEFAULT_THROTTLE_INTERVAL)
    }
}
