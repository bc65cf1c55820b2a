// Named counting semaphore, used directly by callers that just need permits
// and as a building block for `Waiter`.

use crate::error::{Error, Result};
use crate::platform::RawSemaphore;

pub struct Semaphore {
    inner: RawSemaphore,
}

impl Semaphore {
    pub fn open(name: &str, initial_count: u32) -> Result<Self> {
        let inner = RawSemaphore::open(name, initial_count).map_err(Error::RegionUnavailable)?;
        Ok(Self { inner })
    }

    /// Block until a permit is available, or until `timeout_ms` elapses.
    /// `None` blocks indefinitely; `Some(0)` polls without blocking.
    pub fn wait(&self, timeout_ms: Option<u64>) -> Result<bool> {
        self.inner.wait(timeout_ms).map_err(Error::Os)
    }

    pub fn post(&self, count: u32) -> Result<()> {
        if count == 0 {
            return Ok(());
        }
        self.inner.post(count).map_err(Error::Os)
    }

    pub fn clear_storage(name: &str) {
        RawSemaphore::clear_storage(name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unique_name(tag: &str) -> String {
        format!("ringbus_test_sem_{}_{}", std::process::id(), tag)
    }

    #[test]
    fn post_then_wait_consumes_one_permit() {
        let name = unique_name("post_wait");
        let sem = Semaphore::open(&name, 0).unwrap();

        assert!(!sem.wait(Some(0)).unwrap());
        sem.post(1).unwrap();
        assert!(sem.wait(Some(1_000)).unwrap());
        assert!(!sem.wait(Some(0)).unwrap());

        Semaphore::clear_storage(&name);
    }

    #[test]
    fn initial_count_is_available_immediately() {
        let name = unique_name("initial_count");
        let sem = Semaphore::open(&name, 2).unwrap();

        assert!(sem.wait(Some(0)).unwrap());
        assert!(sem.wait(Some(0)).unwrap());
        assert!(!sem.wait(Some(0)).unwrap());

        Semaphore::clear_storage(&name);
    }
}
