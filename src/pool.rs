use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use crate::error::{PoolError, PoolResult};

/// An object that can be wiped clean and handed to the next request.
pub trait Poolable {
    /// Clears every piece of per-request state.
    fn reset(&mut self);
}

type Factory<T> = Box<dyn Fn() -> PoolResult<T> + Send + Sync>;

/// A bounded free-list of reusable instances.
///
/// The lock guards only the free-list itself: it is taken for a single push or
/// pop and never held while an instance is in use. An instance is owned by the
/// pool while idle and by exactly one caller while checked out.
pub struct Pool<T> {
    free: Mutex<Vec<T>>,
    max_idle: AtomicUsize,
    factory: Factory<T>,
}

impl<T: Poolable> Pool<T> {
    /// Creates an empty pool keeping at most `max_idle` idle instances.
    pub fn new<F>(max_idle: usize, factory: F) -> Self
    where
        F: Fn() -> PoolResult<T> + Send + Sync + 'static,
    {
        Pool {
            free: Mutex::new(Vec::new()),
            max_idle: AtomicUsize::new(max_idle),
            factory: Box::new(factory),
        }
    }

    /// Takes an idle instance, or builds a fresh one when none is free.
    pub fn obtain(&self) -> PoolResult<T> {
        let reused = self.free.lock().map_err(|_| PoolError::LockPoisoned)?.pop();
        match reused {
            Some(instance) => Ok(instance),
            None => self.create(),
        }
    }

    /// Builds a fresh instance without touching the free-list.
    pub fn create(&self) -> PoolResult<T> {
        (self.factory)()
    }

    /// Resets `instance` and keeps it, unless the free-list is full.
    ///
    /// Returns whether the instance was kept. A poisoned lock discards it.
    pub fn free(&self, mut instance: T) -> bool {
        instance.reset();
        let max = self.max_idle.load(Ordering::Relaxed);
        match self.free.lock() {
            Ok(mut free) if free.len() < max => {
                free.push(instance);
                true
            }
            _ => false,
        }
    }

    /// Number of idle instances.
    pub fn idle(&self) -> usize {
        self.free.lock().map(|free| free.len()).unwrap_or(0)
    }

    pub fn max_idle(&self) -> usize {
        self.max_idle.load(Ordering::Relaxed)
    }

    /// Changes the bound. Surplus idle instances are dropped.
    pub fn set_max_idle(&self, max_idle: usize) {
        self.max_idle.store(max_idle, Ordering::Relaxed);
        if let Ok(mut free) = self.free.lock() {
            free.truncate(max_idle);
        }
    }

    /// Drops every idle instance.
    pub fn clear(&self) {
        if let Ok(mut free) = self.free.lock() {
            free.clear();
        }
    }
}

impl<T> fmt::Debug for Pool<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pool")
            .field("max_idle", &self.max_idle.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}
