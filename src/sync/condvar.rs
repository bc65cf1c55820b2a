// Process-shared condition variable, layered over `platform::RawCondVar`.
// Used directly by callers that want classic wait/notify semantics (as
// opposed to `Waiter`, which implements the semaphore-pair handshake the
// ring protocols use for blocking send/recv).

use crate::error::{Error, Result};
use crate::platform::RawCondVar;
use crate::sync::mutex::{MutexGuard, RobustMutex};

pub struct CondVar {
    inner: RawCondVar,
}

impl CondVar {
    pub fn open(name: &str) -> Result<Self> {
        let inner = RawCondVar::open(name).map_err(Error::RegionUnavailable)?;
        Ok(Self { inner })
    }

    /// Wait, releasing `guard`'s mutex for the duration and relocking before
    /// returning. `timeout_ms` of `None` waits indefinitely.
    pub fn wait<'a>(
        &self,
        guard: MutexGuard<'a>,
        mtx: &'a RobustMutex,
        timeout_ms: Option<u64>,
    ) -> Result<(MutexGuard<'a>, bool)> {
        // The guard's Drop would unlock the mutex a second time once the
        // platform wait call returns with it relocked, so forget it here and
        // rely on RawCondVar::wait's pthread-mandated relock.
        std::mem::forget(guard);
        let signalled = self.inner.wait(mtx.raw(), timeout_ms).map_err(Error::Os)?;
        Ok((MutexGuard::from_locked(mtx), signalled))
    }

    pub fn notify_one(&self) -> Result<()> {
        self.inner.notify_one().map_err(Error::Os)
    }

    pub fn notify_all(&self) -> Result<()> {
        self.inner.notify_all().map_err(Error::Os)
    }

    pub fn clear_storage(name: &str) {
        RawCondVar::clear_storage(name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    fn unique_name(tag: &str) -> String {
        format!("ringbus_test_cv_{}_{}", std::process::id(), tag)
    }

    #[test]
    fn notify_one_wakes_a_waiting_thread() {
        let name = unique_name("notify_one");
        let mtx = Arc::new(RobustMutex::open(&format!("{name}_mtx")).unwrap());
        let cv = Arc::new(CondVar::open(&format!("{name}_cv")).unwrap());

        let waiter_mtx = Arc::clone(&mtx);
        let waiter_cv = Arc::clone(&cv);
        let waiter = std::thread::spawn(move || {
            let guard = waiter_mtx.lock().unwrap();
            let (guard, signalled) = waiter_cv.wait(guard, &waiter_mtx, Some(5_000)).unwrap();
            drop(guard);
            signalled
        });

        // give the waiter thread a moment to actually block before notifying
        std::thread::sleep(Duration::from_millis(100));
        cv.notify_one().unwrap();

        assert!(waiter.join().unwrap());

        RobustMutex::clear_storage(&format!("{name}_mtx"));
        CondVar::clear_storage(&format!("{name}_cv"));
    }

    #[test]
    fn wait_times_out_without_a_notify() {
        let name = unique_name("timeout");
        let mtx = RobustMutex::open(&format!("{name}_mtx")).unwrap();
        let cv = CondVar::open(&format!("{name}_cv")).unwrap();

        let guard = mtx.lock().unwrap();
        let (guard, signalled) = cv.wait(guard, &mtx, Some(50)).unwrap();
        assert!(!signalled);
        drop(guard);

        RobustMutex::clear_storage(&format!("{name}_mtx"));
        CondVar::clear_storage(&format!("{name}_cv"));
    }
}
