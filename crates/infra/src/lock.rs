//! Mutex acquisition with a deadline.
//!
//! Store operations never wait on a lock indefinitely: a contended lock that
//! is not acquired within its timeout surfaces as [`LockTimeout`], which the
//! stores report as a transient "unavailable" error.

use std::sync::{Mutex, MutexGuard, TryLockError};
use std::thread;
use std::time::{Duration, Instant};

/// Default time to wait for a store lock.
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(2);

const BACKOFF: Duration = Duration::from_micros(200);

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("lock not acquired within {0:?}")]
pub struct LockTimeout(pub Duration);

#[derive(Debug)]
pub struct TimedMutex<T> {
    inner: Mutex<T>,
    timeout: Duration,
}

impl<T> TimedMutex<T> {
    pub fn new(value: T, timeout: Duration) -> Self {
        Self {
            inner: Mutex::new(value),
            timeout,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Acquire the lock, giving up after the configured timeout.
    ///
    /// A poisoned lock is recovered: every mutation under these locks is a
    /// single map operation, so the data is consistent even if a holder panicked.
    pub fn acquire(&self) -> Result<MutexGuard<'_, T>, LockTimeout> {
        let deadline = Instant::now() + self.timeout;
        loop {
            match self.inner.try_lock() {
                Ok(guard) => return Ok(guard),
                Err(TryLockError::Poisoned(poisoned)) => return Ok(poisoned.into_inner()),
                Err(TryLockError::WouldBlock) => {
                    if Instant::now() >= deadline {
                        return Err(LockTimeout(self.timeout));
                    }
                    thread::sleep(BACKOFF);
                }
            }
        }
    }
}
