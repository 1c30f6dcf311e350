//! Bounded-wait resource locks
//!
//! The key manager guards its databases with coarse async mutexes.
//! Acquisition gives up after a configured bound and reports
//! [`Error::LockTimeout`] so callers can abort without partial mutation.

use std::time::Duration;

use tokio::sync::{Mutex, MutexGuard};

use crate::error::{Error, Result};
use crate::logging;

/// Named mutex with a bounded acquisition wait
#[derive(Debug)]
pub struct ResourceLock<T> {
    name: &'static str,
    inner: Mutex<T>,
    timeout: Duration,
}

impl<T> ResourceLock<T> {
    /// Wrap `value`
    pub fn new(name: &'static str, value: T, timeout: Duration) -> Self {
        ResourceLock {
            name,
            inner: Mutex::new(value),
            timeout,
        }
    }

    /// Acquire the lock, waiting at most the configured bound
    pub async fn acquire(&self) -> Result<MutexGuard<'_, T>> {
        match tokio::time::timeout(self.timeout, self.inner.lock()).await {
            Ok(guard) => Ok(guard),
            Err(_) => {
                logging::log_lock_timeout(self.name, self.timeout.as_millis() as u64);
                Err(Error::LockTimeout(self.name.to_string()))
            }
        }
    }

    /// Acquire without waiting
    pub fn try_acquire(&self) -> Result<MutexGuard<'_, T>> {
        self.inner
            .try_lock()
            .map_err(|_| Error::LockTimeout(self.name.to_string()))
    }

    /// Lock name used in logs and errors
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Configured wait bound
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Consume the lock and return the value
    pub fn into_inner(self) -> T {
        self.inner.into_inner()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_acquire_uncontended() {
        let lock = ResourceLock::new("spd", 5u32, Duration::from_millis(50));
        {
            let mut guard = lock.acquire().await.unwrap();
            *guard += 1;
        }
        assert_eq!(*lock.acquire().await.unwrap(), 6);
        assert_eq!(lock.name(), "spd");
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_times_out() {
        let lock = ResourceLock::new("ike", Vec::<u8>::new(), Duration::from_millis(100));
        let held = lock.acquire().await.unwrap();

        let err = lock.acquire().await.unwrap_err();
        assert_eq!(err, Error::LockTimeout("ike".into()));
        assert!(lock.try_acquire().is_err());

        drop(held);
        assert!(lock.try_acquire().is_ok());
    }
}
