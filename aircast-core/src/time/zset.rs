//! Time-indexed ordered set with O(log n) remove-by-key.
//!
//! Entries order by `(ts, key)` with lexicographic key tie-break, so the
//! pop sequence is non-decreasing in `ts`. Not thread-safe; a single
//! driver task owns it.

use std::collections::{BTreeMap, HashMap};
use tokio::time::Instant;

/// One stored entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry<T> {
    pub key: String,
    pub data: T,
    pub ts: Instant,
}

#[derive(Debug, Default)]
pub struct Zset<T> {
    by_time: BTreeMap<(Instant, String), T>,
    index: HashMap<String, Instant>,
}

impl<T> Zset<T> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            by_time: BTreeMap::new(),
            index: HashMap::new(),
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.index.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// Upsert an entry; a prior entry under the same key is replaced.
    pub fn put(&mut self, key: impl Into<String>, data: T, ts: Instant) {
        let key = key.into();
        if let Some(prev_ts) = self.index.insert(key.clone(), ts) {
            self.by_time.remove(&(prev_ts, key.clone()));
        }
        self.by_time.insert((ts, key), data);
    }

    /// Remove by key; no-op when absent.
    pub fn remove(&mut self, key: &str) -> Option<Entry<T>> {
        let ts = self.index.remove(key)?;
        let data = self.by_time.remove(&(ts, key.to_string()))?;
        Some(Entry {
            key: key.to_string(),
            data,
            ts,
        })
    }

    /// Timestamp of the stored entry for `key`, if present.
    #[must_use]
    pub fn get_ts(&self, key: &str) -> Option<Instant> {
        self.index.get(key).copied()
    }

    /// Smallest `(ts, key)` entry without removing it.
    #[must_use]
    pub fn peek(&self) -> Option<(&str, &T, Instant)> {
        self.by_time
            .iter()
            .next()
            .map(|((ts, key), data)| (key.as_str(), data, *ts))
    }

    /// Remove and return the smallest `(ts, key)` entry.
    pub fn pop(&mut self) -> Option<Entry<T>> {
        let ((ts, key), data) = self.by_time.pop_first()?;
        self.index.remove(&key);
        Some(Entry { key, data, ts })
    }

    /// Drain up to `max_items` entries with `ts <= t`, smallest first.
    pub fn pop_before(&mut self, t: Instant, max_items: usize) -> Vec<Entry<T>> {
        let mut drained = Vec::new();
        while drained.len() < max_items {
            match self.peek() {
                Some((_, _, ts)) if ts <= t => {
                    // peek guarantees a head entry
                    if let Some(entry) = self.pop() {
                        drained.push(entry);
                    }
                }
                _ => break,
            }
        }
        drained
    }

    pub fn clear(&mut self) {
        self.by_time.clear();
        self.index.clear();
    }
}
