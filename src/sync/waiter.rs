// Blocking wait/notify for ring send/recv (spec §4.5). Not condvar-based:
// notify must know its wakeup was actually observed before returning, so the
// handshake runs over a second, dedicated semaphore. `WaiterState` carries
// the waiting-count/predicate-counter bookkeeping and lives in the channel's
// shared region; `Waiter` itself is the process-local handle onto it plus
// the two named semaphores and the caller-supplied mutex.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, Ordering};

use crate::error::{Error, Result};
use crate::sync::mutex::{MutexGuard, RobustMutex};
use crate::sync::semaphore::Semaphore;

const HANDSHAKE_TIMEOUT_MS: u64 = 5_000;

/// Shared-memory-resident counters a `Waiter` operates on. Zero-initialized
/// memory is a valid `WaiterState`.
#[repr(C)]
pub struct WaiterState {
    waiting: AtomicU32,
    counter: AtomicI64,
    is_waiting: AtomicBool,
    is_closed: AtomicBool,
    need_dest: AtomicBool,
}

impl WaiterState {
    pub const fn new() -> Self {
        Self {
            waiting: AtomicU32::new(0),
            counter: AtomicI64::new(0),
            is_waiting: AtomicBool::new(false),
            is_closed: AtomicBool::new(false),
            need_dest: AtomicBool::new(false),
        }
    }

    pub fn mark_closed(&self) {
        self.is_closed.store(true, Ordering::Release);
    }
}

impl Default for WaiterState {
    fn default() -> Self {
        Self::new()
    }
}

pub struct Waiter<'a> {
    sem: Semaphore,
    handshake: Semaphore,
    state: &'a WaiterState,
}

impl<'a> Waiter<'a> {
    pub fn open(name: &str, state: &'a WaiterState) -> Result<Self> {
        let sem = Semaphore::open(&format!("{name}__WT_SEM"), 0)?;
        let handshake = Semaphore::open(&format!("{name}__WT_HAN"), 0)?;
        Ok(Self {
            sem,
            handshake,
            state,
        })
    }

    /// Block while `pred` returns `true`, releasing `mtx` for the wait and
    /// relocking before returning. Returns `(guard, true)` if woken by a
    /// notifier, `(guard, false)` on timeout.
    pub fn wait_if<'g>(
        &self,
        guard: MutexGuard<'g>,
        mtx: &'g RobustMutex,
        mut pred: impl FnMut() -> bool,
        timeout_ms: Option<u64>,
    ) -> Result<(MutexGuard<'g>, bool)> {
        if !pred() {
            return Ok((guard, false));
        }

        self.state.waiting.fetch_add(1, Ordering::AcqRel);
        self.state.is_waiting.store(true, Ordering::Release);
        self.state.counter.fetch_add(1, Ordering::AcqRel);

        // drop the guard's unlock-on-Drop behavior; we unlock explicitly and
        // relock through `mtx.lock()` before returning.
        std::mem::forget(guard);
        mtx.raw().unlock().map_err(Error::Os)?;

        let mut woken = false;
        loop {
            let got = self.sem.wait(timeout_ms)?;
            if !got {
                break;
            }
            if self.state.is_closed.load(Ordering::Acquire) || self.state.need_dest.load(Ordering::Acquire) {
                break;
            }
            if !self.state.is_waiting.load(Ordering::Acquire) {
                woken = true;
                break;
            }
        }

        self.state.waiting.fetch_sub(1, Ordering::AcqRel);
        self.handshake.post(1)?;

        let relocked = mtx.lock()?;
        Ok((relocked, woken))
    }

    /// Wake exactly one waiter, if any are waiting on a satisfied predicate.
    pub fn notify(&self) -> Result<()> {
        if self.state.counter.load(Ordering::Acquire) <= 0 {
            return Ok(());
        }
        self.state.is_waiting.store(false, Ordering::Release);
        self.sem.post(1)?;
        self.state.counter.fetch_sub(1, Ordering::AcqRel);
        self.handshake.wait(Some(HANDSHAKE_TIMEOUT_MS))?;
        Ok(())
    }

    /// Wake every waiter with a satisfied predicate.
    pub fn broadcast(&self) -> Result<()> {
        let count = self.state.counter.swap(0, Ordering::AcqRel);
        if count <= 0 {
            return Ok(());
        }
        self.state.is_waiting.store(false, Ordering::Release);
        self.sem.post(count as u32)?;
        for _ in 0..count {
            self.handshake.wait(Some(HANDSHAKE_TIMEOUT_MS))?;
        }
        Ok(())
    }

    /// Force every current waiter out, regardless of predicate state. Used
    /// when the channel is closing.
    pub fn quit_waiting(&self) -> Result<()> {
        self.state.need_dest.store(true, Ordering::Release);
        if self.state.waiting.load(Ordering::Acquire) > 0 {
            self.sem.post(1)?;
            self.handshake.wait(Some(HANDSHAKE_TIMEOUT_MS))?;
        }
        Ok(())
    }

    pub fn clear_storage(name: &str) {
        Semaphore::clear_storage(&format!("{name}__WT_SEM"));
        Semaphore::clear_storage(&format!("{name}__WT_HAN"));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::mutex::RobustMutex;
    use std::sync::atomic::AtomicBool;
    use std::sync::Arc;
    use std::time::Duration;

    fn unique_name(tag: &str) -> String {
        format!("ringbus_test_waiter_{}_{}", std::process::id(), tag)
    }

    #[test]
    fn wait_if_returns_immediately_when_predicate_is_already_false() {
        let name = unique_name("pred_false");
        let mtx = RobustMutex::open(&name).unwrap();
        let state = WaiterState::new();
        let waiter = Waiter::open(&name, &state).unwrap();

        let guard = mtx.lock().unwrap();
        let (_guard, woken) = waiter.wait_if(guard, &mtx, || false, Some(50)).unwrap();
        assert!(!woken);

        RobustMutex::clear_storage(&name);
        Waiter::clear_storage(&name);
    }

    #[test]
    fn notify_wakes_a_blocked_waiter() {
        let name = unique_name("notify");
        let mtx = Arc::new(RobustMutex::open(&name).unwrap());
        let state: &'static WaiterState = Box::leak(Box::new(WaiterState::new()));
        let waiter = Arc::new(Waiter::open(&name, state).unwrap());
        let condition_met = Arc::new(AtomicBool::new(false));

        let blocked_mtx = Arc::clone(&mtx);
        let blocked_waiter = Arc::clone(&waiter);
        let blocked_condition = Arc::clone(&condition_met);
        let handle = std::thread::spawn(move || {
            let guard = blocked_mtx.lock().unwrap();
            let (guard, woken) = blocked_waiter
                .wait_if(guard, &blocked_mtx, || true, Some(5_000))
                .unwrap();
            drop(guard);
            blocked_condition.store(true, Ordering::Release);
            woken
        });

        std::thread::sleep(Duration::from_millis(100));
        waiter.notify().unwrap();

        assert!(handle.join().unwrap());
        assert!(condition_met.load(Ordering::Acquire));

        RobustMutex::clear_storage(&name);
        Waiter::clear_storage(&name);
    }
}
