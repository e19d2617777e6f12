//! Counters shared between requests.

use std::borrow::Borrow;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;

use crate::executor::WorkerId;

/// Per-key atomic counters, safe to bump from any worker.
#[derive(Debug)]
pub struct CounterMap<K: Eq + Hash> {
    counters: DashMap<K, AtomicU64>,
}

impl<K: Eq + Hash> Default for CounterMap<K> {
    fn default() -> Self {
        CounterMap {
            counters: DashMap::new(),
        }
    }
}

impl<K: Eq + Hash + Clone> CounterMap<K> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `delta` to the counter of `key` and returns the new value.
    pub fn add<Q>(&self, key: &Q, delta: u64) -> u64
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ToOwned<Owned = K> + ?Sized,
    {
        if let Some(counter) = self.counters.get(key) {
            return counter.fetch_add(delta, Ordering::Relaxed) + delta;
        }
        self.counters
            .entry(key.to_owned())
            .or_default()
            .fetch_add(delta, Ordering::Relaxed)
            + delta
    }

    pub fn get<Q>(&self, key: &Q) -> u64
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.counters
            .get(key)
            .map(|c| c.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    pub fn reset(&self) {
        self.counters.clear();
    }

    /// A point-in-time copy of every counter.
    pub fn snapshot(&self) -> Vec<(K, u64)> {
        self.counters
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().load(Ordering::Relaxed)))
            .collect()
    }
}

/// Hits per route path.
pub type RouteStats = CounterMap<String>;

/// Hands out request prefixes of the form `"<worker>_<sequence>"`.
///
/// Each worker owns its own sequence, so prefixes never collide across workers.
#[derive(Debug, Default)]
pub struct RequestIds {
    sequences: CounterMap<WorkerId>,
}

impl RequestIds {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next(&self, worker: WorkerId) -> String {
        let seq = self.sequences.add(&worker, 1);
        format!("{worker}_{seq}")
    }

    pub fn reset(&self) {
        self.sequences.reset();
    }
}
