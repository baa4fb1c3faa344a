//! Time-bounded memoization.

use parking_lot::Mutex;
use std::time::{Duration, Instant};

/// Caches the result of a fallible computation for a fixed lifetime.
///
/// Failed computations are not cached.
#[derive(Debug)]
pub struct Memo<T> {
    ttl: Duration,
    slot: Mutex<Option<(T, Instant)>>,
}

impl<T: Clone> Memo<T> {
    /// Creates an empty cache whose entries live for `ttl`.
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            slot: Mutex::new(None),
        }
    }

    /// Returns the cached value, or computes and caches a new one.
    pub fn get_or_try_insert<E>(&self, compute: impl FnOnce() -> Result<T, E>) -> Result<T, E> {
        let mut slot = self.slot.lock();
        if let Some((value, expires)) = slot.as_ref() {
            if Instant::now() < *expires {
                return Ok(value.clone());
            }
        }
        let value = compute()?;
        *slot = Some((value.clone(), Instant::now() + self.ttl));
        Ok(value)
    }

    /// Drops the cached value.
    pub fn invalidate(&self) {
        *self.slot.lock() = None;
    }
}
