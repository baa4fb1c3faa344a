//! Named advisory locks with acquisition timeouts.
//!
//! Each collection owns a `transaction` reader/writer lock and an `insert`
//! mutex. Acquisition either waits indefinitely (`None`) or gives up after
//! the timeout with [`CoreError::LockTimeout`]. Guards release on drop.

use crate::error::{CoreError, CoreResult};
use parking_lot::{Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;
use tracing::debug;

fn timeout_error(name: &str, timeout: Duration) -> CoreError {
    debug!(lock = name, timeout_ms = timeout.as_millis() as u64, "lock acquisition timed out");
    CoreError::LockTimeout {
        lock: name.to_owned(),
        timeout_ms: timeout.as_millis() as u64,
    }
}

/// A multi-reader/single-writer lock.
#[derive(Debug)]
pub struct NamedRwLock {
    name: &'static str,
    lock: RwLock<()>,
}

impl NamedRwLock {
    /// Creates an unlocked lock.
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            lock: RwLock::new(()),
        }
    }

    /// Returns the lock name.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Acquires shared access.
    pub fn read(&self, timeout: Option<Duration>) -> CoreResult<RwLockReadGuard<'_, ()>> {
        match timeout {
            None => Ok(self.lock.read()),
            Some(timeout) => self
                .lock
                .try_read_for(timeout)
                .ok_or_else(|| timeout_error(self.name, timeout)),
        }
    }

    /// Acquires exclusive access.
    pub fn write(&self, timeout: Option<Duration>) -> CoreResult<RwLockWriteGuard<'_, ()>> {
        match timeout {
            None => Ok(self.lock.write()),
            Some(timeout) => self
                .lock
                .try_write_for(timeout)
                .ok_or_else(|| timeout_error(self.name, timeout)),
        }
    }
}

/// An exclusive lock.
#[derive(Debug)]
pub struct NamedMutex {
    name: &'static str,
    lock: Mutex<()>,
}

impl NamedMutex {
    /// Creates an unlocked mutex.
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            lock: Mutex::new(()),
        }
    }

    /// Acquires the mutex.
    pub fn lock(&self, timeout: Option<Duration>) -> CoreResult<MutexGuard<'_, ()>> {
        match timeout {
            None => Ok(self.lock.lock()),
            Some(timeout) => self
                .lock
                .try_lock_for(timeout)
                .ok_or_else(|| timeout_error(self.name, timeout)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn readers_share() {
        let lock = NamedRwLock::new("transaction");
        let _a = lock.read(Some(Duration::from_millis(10))).unwrap();
        let _b = lock.read(Some(Duration::from_millis(10))).unwrap();
    }

    #[test]
    fn writer_excludes_readers() {
        let lock = NamedRwLock::new("transaction");
        let guard = lock.write(None).unwrap();
        let err = lock.read(Some(Duration::from_millis(20))).unwrap_err();
        assert!(matches!(
            err,
            CoreError::LockTimeout { ref lock, timeout_ms: 20 } if lock == "transaction"
        ));
        drop(guard);
        assert!(lock.read(Some(Duration::from_millis(20))).is_ok());
    }

    #[test]
    fn mutex_times_out_across_threads() {
        let lock = Arc::new(NamedMutex::new("insert"));
        let guard = lock.lock(None).unwrap();
        let other = Arc::clone(&lock);
        let result = thread::spawn(move || other.lock(Some(Duration::from_millis(20))).is_err())
            .join()
            .unwrap();
        assert!(result);
        drop(guard);
        assert!(lock.lock(Some(Duration::from_millis(20))).is_ok());
    }
}
