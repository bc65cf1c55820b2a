// MMB: multiple producers, broadcasting to every connected consumer.
// Combines MMU's reservation/commit split (`ct` vs `write_index`, with a
// per-slot `committed` flag so concurrent producers publish without blocking
// on each other) with SMB's per-slot remaining-reader bitmask and epoch.
// `try_push` never evicts: it only claims a slot whose remaining-reader mask
// is already empty and fails otherwise. `force_push` claims unconditionally
// and evicts any reader still holding the slot.

use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU32, AtomicU64, Ordering};

use crate::error::{Error, Result};
use crate::registry::{ConnRegistry, MAX_CONNECTIONS};
use crate::ring::smb::lowest_bit;
use crate::ring::{align_up, wrap_distance, ProtocolKind, RingConfig, RingProtocol};
use crate::sync::{Waiter, WaiterState};

const EPOCH_SHIFT: u32 = 32;

#[inline]
fn pack_rc(remaining_mask: u32, epoch: u32) -> u64 {
    ((epoch as u64) << EPOCH_SHIFT) | remaining_mask as u64
}

#[inline]
fn unpack_rc(rc: u64) -> (u32, u32) {
    (rc as u32, (rc >> EPOCH_SHIFT) as u32)
}

#[repr(C)]
struct Header {
    ct: AtomicU16,
    write_index: AtomicU16,
    registry: ConnRegistry,
    cursors: [AtomicU16; MAX_CONNECTIONS as usize],
    waiter_state: WaiterState,
}

#[repr(C)]
struct SlotHeader {
    rc: AtomicU64,
    size: AtomicU32,
    /// Set once this slot's payload and `rc` claim are fully written; cleared
    /// again once `write_index` has walked past it.
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

    fn cursor(&self, conn_id: u32) -> &AtomicU16 {
        &self.hdr.cursors[conn_id.trailing_zeros() as usize]
    }

    pub fn connect(&self) -> Result<u32> {
        let conn_id = self.hdr.registry.connect()?;
        let w = self.hdr.write_index.load(Ordering::Acquire);
        self.cursor(conn_id).store(w, Ordering::Release);
        Ok(conn_id)
    }

    pub fn disconnect(&self, conn_id: u32) {
        self.hdr.registry.disconnect(conn_id);
    }

    /// See [`super::ssu::Ring::close`].
    pub fn close(&self) -> Result<()> {
        self.hdr.waiter_state.mark_closed();
        self.waiter.quit_waiting()
    }

    /// If a slot is still claimed by readers when a producer needs to reuse
    /// it, evict the slowest (lowest connection bit) reader one at a time
    /// until the slot frees up or only the evicted reader's own backlog
    /// remains (it will observe the gap as an `Overflow` on its next pop).
    fn force_clear(&self, slot: &SlotHeader) {
        loop {
            let rc = slot.rc.load(Ordering::Acquire);
            let (remaining, epoch) = unpack_rc(rc);
            if remaining == 0 {
                return;
            }
            let victim = lowest_bit(remaining);
            tracing::warn!(victim, "force-pushing, evicting lagging connection");
            let _ = slot.rc.compare_exchange_weak(
                rc,
                pack_rc(remaining & !victim, epoch),
                Ordering::AcqRel,
                Ordering::Acquire,
            );
        }
    }

    /// Move `write_index` forward over every consecutive committed slot
    /// starting at the current boundary, same helping scheme as MMU.
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

    /// Write `payload` into the slot at `reserved`, claim it for every
    /// currently connected reader, mark it committed and make a best-effort
    /// attempt to advance `write_index` over it.
    fn publish_reserved(&self, reserved: u16, payload: &[u8]) -> Result<()> {
        let idx = reserved & self.cfg.mask();
        let slot = unsafe { self.slot_header(idx) };
        let connected = self.hdr.registry.mask();
        unsafe {
            let data = self.slot_data(idx);
            std::ptr::copy_nonoverlapping(payload.as_ptr(), data, payload.len());
        }
        slot.size.store(payload.len() as u32, Ordering::Release);
        let (_, epoch) = unpack_rc(slot.rc.load(Ordering::Acquire));
        slot.rc.store(pack_rc(connected, epoch.wrapping_add(1)), Ordering::Release);
        slot.committed.store(true, Ordering::Release);
        self.advance_write_index();
        self.waiter.broadcast()
    }
}

impl RingProtocol for Ring<'_> {
    fn kind(&self) -> ProtocolKind {
        ProtocolKind::Mmb
    }

    fn try_push(&self, payload: &[u8]) -> Result<bool> {
        if payload.len() > self.cfg.slot_size {
            return Err(Error::InvalidArgument("payload exceeds slot_size".into()));
        }

        // Reserve the next slot only if it's free of unread readers; peeking
        // before the CAS means a slot we won't actually take is never
        // consumed from `ct`.
        let reserved;
        let mut k = 0u32;
        loop {
            let ct = self.hdr.ct.load(Ordering::Acquire);
            let idx = ct & self.cfg.mask();
            let slot = unsafe { self.slot_header(idx) };
            let (remaining, _epoch) = unpack_rc(slot.rc.load(Ordering::Acquire));
            if remaining != 0 {
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

        self.publish_reserved(reserved, payload)?;
        Ok(true)
    }

    fn force_push(&self, payload: &[u8]) -> Result<bool> {
        if payload.len() > self.cfg.slot_size {
            return Err(Error::InvalidArgument("payload exceeds slot_size".into()));
        }

        let reserved;
        let mut k = 0u32;
        loop {
            let ct = self.hdr.ct.load(Ordering::Acquire);
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
        self.force_clear(slot);

        self.publish_reserved(reserved, payload)?;
        Ok(true)
    }

    fn try_pop(&self, conn_id: u32) -> Result<Option<Vec<u8>>> {
        let cursor = self.cursor(conn_id);
        let r = cursor.load(Ordering::Acquire);
        let w = self.hdr.write_index.load(Ordering::Acquire);
        if r == w {
            return Ok(None);
        }
        let idx = r & self.cfg.mask();
        let slot = unsafe { self.slot_header(idx) };
        let rc = slot.rc.load(Ordering::Acquire);
        let (remaining, _epoch) = unpack_rc(rc);
        if remaining & conn_id == 0 {
            cursor.store(r.wrapping_add(1), Ordering::Release);
            return Err(Error::Overflow);
        }

        let size = slot.size.load(Ordering::Acquire);
        let data = unsafe { std::slice::from_raw_parts(self.slot_data(idx), size as usize).to_vec() };

        let mut k = 0u32;
        loop {
            let cur = slot.rc.load(Ordering::Acquire);
            let (rem, ep) = unpack_rc(cur);
            let next = pack_rc(rem & !conn_id, ep);
            if slot
                .rc
                .compare_exchange_weak(cur, next, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                break;
            }
            crate::spin::adaptive_yield(&mut k);
        }

        cursor.store(r.wrapping_add(1), Ordering::Release);
        Ok(Some(data))
    }

    fn pending(&self, conn_id: u32) -> u16 {
        wrap_distance(
            self.hdr.write_index.load(Ordering::Acquire),
            self.cursor(conn_id).load(Ordering::Acquire),
        )
    }
}
