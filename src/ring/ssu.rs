// SSU: single producer, one or more consumers, unicast — each pushed
// message is claimed by exactly one consumer. Producer needs no CAS on the
// write side since it is alone; consumers race for `read_index` via CAS.
// Only `capacity - 1` slots are ever usable, so `write_index` catching up to
// `read_index - 1` is distinguishable from the empty `write_index == read_index`
// state without a separate counter.

use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU32, Ordering};

use crate::error::{Error, Result};
use crate::registry::ConnRegistry;
use crate::ring::{align_up, wrap_distance, ProtocolKind, RingConfig, RingProtocol};
use crate::sync::{Waiter, WaiterState};

#[repr(C)]
struct Header {
    write_index: AtomicU16,
    read_index: AtomicU16,
    registry: ConnRegistry,
    /// Set while a sender is attached; SSU allows exactly one at a time.
    sender_claimed: AtomicBool,
    waiter_state: WaiterState,
}

#[repr(C)]
struct SlotHeader {
    size: AtomicU32,
}

pub struct Ring<'a> {
    hdr: &'a Header,
    slots_base: *mut u8,
    slot_stride: usize,
    cfg: RingConfig,
    waiter: Waiter<'a>,
}

unsafe impl Send for Ring<'_> {}
unsafe impl Sync for Ring<'_> {}

fn slot_stride(cfg: &RingConfig) -> usize {
    let header = std::mem::size_of::<SlotHeader>();
    align_up(header, std::mem::align_of::<SlotHeader>()) + cfg.slot_size
}

/// Bytes required for the full ring (header + all slots) at this config.
pub fn layout_size(cfg: &RingConfig) -> usize {
    align_up(std::mem::size_of::<Header>(), std::mem::align_of::<Header>())
        + slot_stride(cfg) * cfg.capacity as usize
}

impl<'a> Ring<'a> {
    /// # Safety
    /// `base` must point to at least `layout_size(&cfg)` bytes of memory
    /// shared by every attaching process, zero-initialized before the first
    /// attach (true for freshly `ftruncate`d/`CreateFileMapping`d regions).
    pub unsafe fn attach(base: *mut u8, cfg: RingConfig, waiter_name: &str) -> Result<Self> {
        cfg.validate()?;
        let hdr = &*(base as *const Header);
        let hdr_size = align_up(std::mem::size_of::<Header>(), std::mem::align_of::<Header>());
        let slots_base = base.add(hdr_size);
        let waiter = Waiter::open(waiter_name, &hdr.waiter_state)?;
        Ok(Self {
            hdr,
            slots_base,
            slot_stride: slot_stride(&cfg),
            cfg,
            waiter,
        })
    }

    unsafe fn slot_header(&self, idx: u16) -> &SlotHeader {
        let off = idx as usize * self.slot_stride;
        &*(self.slots_base.add(off) as *const SlotHeader)
    }

    unsafe fn slot_data(&self, idx: u16) -> *mut u8 {
        let off = idx as usize * self.slot_stride
            + align_up(std::mem::size_of::<SlotHeader>(), std::mem::align_of::<SlotHeader>());
        self.slots_base.add(off)
    }

    pub fn connect(&self) -> Result<u32> {
        self.hdr.registry.connect()
    }

    pub fn disconnect(&self, conn_id: u32) {
        self.hdr.registry.disconnect(conn_id);
    }

    /// Release anyone blocked in `Waiter::wait_if` on this ring. Called when
    /// the last local handle onto a channel is dropped, so a peer process
    /// blocked on `recv`/`send` doesn't wait out its full timeout for no
    /// reason once this end is gone.
    pub fn close(&self) -> Result<()> {
        self.hdr.waiter_state.mark_closed();
        self.waiter.quit_waiting()
    }

    pub fn push_blocking(&self, payload: &[u8], timeout_ms: Option<u64>) -> Result<bool> {
        if self.try_push(payload)? {
            return Ok(true);
        }
        // no producer-side mutex is needed for SSU (single writer); block by
        // spinning the wait/notify predicate against read_index advancing.
        let mut k = 0u32;
        let deadline = timeout_ms.map(|ms| std::time::Instant::now() + std::time::Duration::from_millis(ms));
        loop {
            if self.try_push(payload)? {
                return Ok(true);
            }
            if let Some(dl) = deadline {
                if std::time::Instant::now() >= dl {
                    return Ok(false);
                }
            }
            crate::spin::adaptive_yield(&mut k);
        }
    }
}

impl RingProtocol for Ring<'_> {
    fn kind(&self) -> ProtocolKind {
        ProtocolKind::Ssu
    }

    fn try_push(&self, payload: &[u8]) -> Result<bool> {
        if payload.len() > self.cfg.slot_size {
            return Err(Error::InvalidArgument("payload exceeds slot_size".into()));
        }
        let w = self.hdr.write_index.load(Ordering::Relaxed);
        let r = self.hdr.read_index.load(Ordering::Acquire);
        if wrap_distance(w, r) >= self.cfg.capacity - 1 {
            return Ok(false);
        }
        let idx = w & self.cfg.mask();
        unsafe {
            let data = self.slot_data(idx);
            std::ptr::copy_nonoverlapping(payload.as_ptr(), data, payload.len());
            self.slot_header(idx).size.store(payload.len() as u32, Ordering::Release);
        }
        self.hdr.write_index.store(w.wrapping_add(1), Ordering::Release);
        self.waiter.broadcast()?;
        Ok(true)
    }

    fn try_pop(&self, _conn_id: u32) -> Result<Option<Vec<u8>>> {
        loop {
            let r = self.hdr.read_index.load(Ordering::Acquire);
            let w = self.hdr.write_index.load(Ordering::Acquire);
            if r == w {
                return Ok(None);
            }
            let idx = r & self.cfg.mask();
            let size = unsafe { self.slot_header(idx).size.load(Ordering::Acquire) };
            if size == 0 {
                // producer has reserved but not yet published this slot
                return Ok(None);
            }
            if self
                .hdr
                .read_index
                .compare_exchange_weak(r, r.wrapping_add(1), Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                continue;
            }
            let data = unsafe {
                std::slice::from_raw_parts(self.slot_data(idx), size as usize).to_vec()
            };
            unsafe { self.slot_header(idx).size.store(0, Ordering::Release) };
            return Ok(Some(data));
        }
    }

    fn pending(&self, _conn_id: u32) -> u16 {
        wrap_distance(
            self.hdr.write_index.load(Ordering::Acquire),
            self.hdr.read_index.load(Ordering::Acquire),
        )
    }

    fn claim_sender(&self) -> Result<()> {
        self.hdr
            .sender_claimed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(|_| Error::InvalidArgument("SSU ring already has a sender attached".into()))
    }

    fn release_sender(&self) {
        self.hdr.sender_claimed.store(false, Ordering::Release);
    }
}
