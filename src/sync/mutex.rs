// Robust, process-shared mutex (spec §4.5). Wraps `platform::RawMutex`,
// translating owner-dead recovery into a transparent retry: a caller never
// observes `OwnerDead`, only `Unrecoverable` if consistency could not be
// restored, after which the mutex is permanently poisoned.

use std::sync::atomic::{AtomicBool, Ordering};

use crate::error::{Error, Result};
use crate::platform::RawMutex;

pub struct RobustMutex {
    inner: RawMutex,
    poisoned: AtomicBool,
}

impl RobustMutex {
    pub fn open(name: &str) -> Result<Self> {
        let inner = RawMutex::open(name).map_err(Error::RegionUnavailable)?;
        Ok(Self {
            inner,
            poisoned: AtomicBool::new(false),
        })
    }

    fn check_poisoned(&self) -> Result<()> {
        if self.poisoned.load(Ordering::Acquire) {
            return Err(Error::Unrecoverable);
        }
        Ok(())
    }

    /// Acquire the lock, blocking indefinitely. Returns an RAII guard.
    pub fn lock(&self) -> Result<MutexGuard<'_>> {
        self.check_poisoned()?;
        match self.inner.lock() {
            Ok(recovered) => {
                if recovered {
                    tracing::warn!("recovered robust mutex from dead owner");
                }
                Ok(MutexGuard { mtx: self })
            }
            Err(e) => {
                self.poisoned.store(true, Ordering::Release);
                tracing::error!(error = %e, "robust mutex unrecoverable");
                Err(Error::Unrecoverable)
            }
        }
    }

    pub fn lock_timeout(&self, timeout_ms: u64) -> Result<Option<MutexGuard<'_>>> {
        self.check_poisoned()?;
        match self.inner.lock_timeout(timeout_ms) {
            Ok(Some(recovered)) => {
                if recovered {
                    tracing::warn!("recovered robust mutex from dead owner");
                }
                Ok(Some(MutexGuard { mtx: self }))
            }
            Ok(None) => Ok(None),
            Err(e) => {
                self.poisoned.store(true, Ordering::Release);
                tracing::error!(error = %e, "robust mutex unrecoverable");
                Err(Error::Unrecoverable)
            }
        }
    }

    pub fn try_lock(&self) -> Result<Option<MutexGuard<'_>>> {
        self.check_poisoned()?;
        match self.inner.try_lock() {
            Ok(Some(recovered)) => {
                if recovered {
                    tracing::warn!("recovered robust mutex from dead owner");
                }
                Ok(Some(MutexGuard { mtx: self }))
            }
            Ok(None) => Ok(None),
            Err(e) => {
                self.poisoned.store(true, Ordering::Release);
                tracing::error!(error = %e, "robust mutex unrecoverable");
                Err(Error::Unrecoverable)
            }
        }
    }

    pub(crate) fn raw(&self) -> &RawMutex {
        &self.inner
    }

    pub fn clear_storage(name: &str) {
        RawMutex::clear_storage(name);
    }
}

pub struct MutexGuard<'a> {
    mtx: &'a RobustMutex,
}

impl<'a> MutexGuard<'a> {
    /// Wrap an already-locked mutex as a guard. Used by `CondVar::wait`,
    /// which relies on the underlying pthread call to relock before
    /// returning.
    pub(crate) fn from_locked(mtx: &'a RobustMutex) -> Self {
        Self { mtx }
    }
}

impl Drop for MutexGuard<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.mtx.inner.unlock() {
            tracing::error!(error = %e, "failed to unlock robust mutex");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unique_name(tag: &str) -> String {
        format!("ringbus_test_mtx_{}_{}", std::process::id(), tag)
    }

    #[test]
    fn try_lock_fails_while_held_and_succeeds_after_unlock() {
        let name = unique_name("try_lock");
        let mtx = RobustMutex::open(&name).unwrap();

        let guard = mtx.lock().unwrap();
        assert!(mtx.try_lock().unwrap().is_none());
        drop(guard);
        assert!(mtx.try_lock().unwrap().is_some());

        RobustMutex::clear_storage(&name);
    }

    #[test]
    fn lock_timeout_expires_while_held() {
        let name = unique_name("lock_timeout");
        let mtx = RobustMutex::open(&name).unwrap();

        let guard = mtx.lock().unwrap();
        assert!(mtx.lock_timeout(20).unwrap().is_none());
        drop(guard);

        RobustMutex::clear_storage(&name);
    }
}
