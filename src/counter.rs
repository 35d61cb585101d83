//! Concurrency-safe named counters.

use parking_lot::Mutex;
use rustc_hash::FxHashMap;

/// A map from string key to a signed count, serialized under one lock.
///
/// Counts never go negative: an increment whose result is `<= 0` removes
/// the key and reports 0.
#[derive(Debug, Default)]
pub struct NamedCounter {
    counts: Mutex<FxHashMap<String, i32>>,
}

impl NamedCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current count for `key` (0 if untracked).
    pub fn count(&self, key: &str) -> i32 {
        self.counts.lock().get(key).copied().unwrap_or(0)
    }

    /// Apply `delta` to `key` and return the resulting count.
    pub fn increment(&self, key: &str, delta: i32) -> i32 {
        let mut counts = self.counts.lock();

        let current = counts.get(key).copied().unwrap_or(0);
        let next = current.saturating_add(delta);

        if next <= 0 {
            counts.remove(key);
            return 0;
        }

        counts.insert(key.to_string(), next);
        next
    }

    /// Number of tracked keys.
    pub fn len(&self) -> usize {
        self.counts.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.counts.lock().is_empty()
    }
}
