//! Cross-instance migration lock
//!
//! The lock is a database-resident token, not an in-memory singleton: every
//! [`Locker`] implementation coordinates through the database it is connected to,
//! so separate processes observe the same mutual exclusion.

use super::error::LockError;
use std::time::{Duration, Instant};

#[cfg(feature = "metrics")]
use crate::metrics::METRICS;
#[cfg(feature = "tracing")]
use crate::metrics::tracing_helpers;

/// Capability interface over the lock primitive.
pub trait Locker {
    /// Block until this instance is the exclusive holder. No timeout; callers that
    /// need a bounded wait must impose it themselves.
    fn lock_migrations(&self) -> Result<(), LockError>;

    /// Release the lock. Fails with `LockError::NotHeld` when this instance is not
    /// the holder.
    fn unlock_migrations(&self) -> Result<(), LockError>;
}

/// Lock guard that releases the lock when dropped
///
/// Prefer [`LockGuard::release`] so a release failure can be reported; `Drop`
/// covers early returns and panics, where the error can only be logged.
pub struct LockGuard<'a> {
    locker: &'a dyn Locker,
    released: bool,
}

impl<'a> LockGuard<'a> {
    /// Acquire the lock and create a guard. Blocks while another instance holds it.
    pub fn acquire(locker: &'a dyn Locker) -> Result<Self, LockError> {
        #[cfg(feature = "tracing")]
        let _span = tracing_helpers::lock_span().entered();

        let start = Instant::now();
        locker.lock_migrations()?;
        let waited = start.elapsed();

        if waited > Duration::from_millis(100) {
            log::debug!("acquired migration lock after {waited:?}");
        }
        #[cfg(feature = "metrics")]
        METRICS.observe_lock_wait(waited);

        Ok(Self {
            locker,
            released: false,
        })
    }

    /// Release explicitly, surfacing any error.
    pub fn release(mut self) -> Result<(), LockError> {
        self.released = true;
        self.locker.unlock_migrations()
    }
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        if !self.released {
            if let Err(e) = self.locker.unlock_migrations() {
                log::warn!("failed to release migration lock: {e}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[derive(Default)]
    struct CountingLocker {
        held: Cell<bool>,
        unlocks: Cell<u32>,
    }

    impl Locker for CountingLocker {
        fn lock_migrations(&self) -> Result<(), LockError> {
            self.held.set(true);
            Ok(())
        }

        fn unlock_migrations(&self) -> Result<(), LockError> {
            if !self.held.replace(false) {
                return Err(LockError::NotHeld);
            }
            self.unlocks.set(self.unlocks.get() + 1);
            Ok(())
        }
    }

    #[test]
    fn explicit_release_unlocks_once() {
        let locker = CountingLocker::default();
        let guard = LockGuard::acquire(&locker).unwrap();
        assert!(locker.held.get());
        guard.release().unwrap();
        assert!(!locker.held.get());
        assert_eq!(locker.unlocks.get(), 1);
    }

    #[test]
    fn drop_unlocks() {
        let locker = CountingLocker::default();
        {
            let _guard = LockGuard::acquire(&locker).unwrap();
        }
        assert_eq!(locker.unlocks.get(), 1);
    }

    #[test]
    fn panic_inside_scope_still_unlocks() {
        let locker = CountingLocker::default();
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _guard = LockGuard::acquire(&locker).unwrap();
            panic!("script blew up");
        }));
        assert!(result.is_err());
        assert!(!locker.held.get());
        assert_eq!(locker.unlocks.get(), 1);
    }
}
