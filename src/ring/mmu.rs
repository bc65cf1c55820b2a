// MMU: multiple producers, one or more consumers, unicast. Producers must
// reserve a slot before writing to it (`ct`) but never block on each other to
// publish: a producer writes its payload, marks its own slot `committed`,
// and only then makes a best-effort attempt to walk `write_index` forward
// over every already-committed slot starting at the current boundary. If
// `write_index` isn't at this producer's own reservation yet, the walk is a
// no-op and the call returns immediately — a producer that reserved slot N
// and never gets around to publishing stalls visibility of slot N onward,
// but it never makes another producer's `try_push` spin waiting on it.

use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU32, Ordering};

use crate::error::{Error, Result};
use crate::registry::ConnRegistry;
use crate::ring::{align_up, wrap_distance, ProtocolKind, RingConfig, RingProtocol};
use crate::sync::{Waiter, WaiterState};

#[repr(C)]
struct Header {
    /// Next slot a producer may reserve.
    ct: AtomicU16,
    /// Highest index whose slot is fully written and consumer-visible.
    write_index: AtomicU16,
    read_index: AtomicU16,
    registry: ConnRegistry,
    waiter_state: WaiterState,
}

#[repr(C)]
struct SlotHeader {
    size: AtomicU32,
    /// Set once this slot's payload is fully written; cleared again once
    /// `write_index` has walked past it. Lets a producer publish out of
    /// reservation order without waiting for earlier reservations to land.
    committed: AtomicBool,
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
    align_up(std::mem::size_of::<SlotHeader>(), std::mem::align_of::<SlotHeader>()) + cfg.slot_size
}

pub fn layout_size(cfg: &RingConfig) -> usize {
    align_up(std::mem::size_of::<Header>(), std::mem::align_of::<Header>())
        + slot_stride(cfg) * cfg.capacity as usize
}

impl<'a> Ring<'a> {
    /// # Safety
    /// Same obligations as [`super::ssu::Ring::attach`].
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

    /// See [`super::ssu::Ring::close`].
    pub fn close(&self) -> Result<()> {
        self.hdr.waiter_state.mark_closed();
        self.waiter.quit_waiting()
    }

    /// Move `write_index` forward over every consecutive committed slot
    /// starting at the current boundary. Lock-free, not wait-free: a failed
    /// CAS here only ever means another producer just made the same
    /// progress, so the loop still terminates.
    fn advance_write_index(&self) {
        loop {
            let w = self.hdr.write_index.load(Ordering::Acquire);
            let idx = w & self.cfg.mask();
            let slot = unsafe { self.slot_header(idx) };
            if !slot.committed.load(Ordering::Acquire) {
                return;
            }
            if self
                .hdr
                .write_index
                .compare_exchange_weak(w, w.wrapping_add(1), Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                slot.committed.store(false, Ordering::Release);
            }
        }
    }
}

impl RingProtocol for Ring<'_> {
    fn kind(&self) -> ProtocolKind {
        ProtocolKind::Mmu
    }

    fn try_push(&self, payload: &[u8]) -> Result<bool> {
        if payload.len() > self.cfg.slot_size {
            return Err(Error::InvalidArgument("payload exceeds slot_size".into()));
        }

        // Reserve a slot.
        let reserved;
        let mut k = 0u32;
        loop {
            let ct = self.hdr.ct.load(Ordering::Acquire);
            let r = self.hdr.read_index.load(Ordering::Acquire);
            if wrap_distance(ct, r) >= self.cfg.capacity - 1 {
                return Ok(false);
            }
            match self.hdr.ct.compare_exchange_weak(
                ct,
                ct.wrapping_add(1),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    reserved = ct;
                    break;
                }
                Err(_) => {
                    crate::spin::adaptive_yield(&mut k);
                    continue;
                }
            }
        }

        let idx = reserved & self.cfg.mask();
        let slot = unsafe { self.slot_header(idx) };
        unsafe {
            let data = self.slot_data(idx);
            std::ptr::copy_nonoverlapping(payload.as_ptr(), data, payload.len());
        }
        slot.size.store(payload.len() as u32, Ordering::Release);
        slot.committed.store(true, Ordering::Release);

        // Best-effort: move the visible boundary forward if it happens to be
        // at (or reaches, via someone else's committed slots) our own
        // reservation. If it isn't our turn yet we don't wait for it.
        self.advance_write_index();

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
}
