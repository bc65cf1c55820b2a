// SMB: single producer broadcasting to every connected consumer. Each slot
// tracks, in its `rc` field, the bitmask of connections that still haven't
// read it (low 32 bits) and a wrap-safe epoch (high 32 bits) so a consumer
// that was evicted by a force-push can tell its old claim on a slot apart
// from a newer message reusing the same index.

use std::sync::atomic::{AtomicU16, AtomicU32, AtomicU64, Ordering};

use crate::error::{Error, Result};
use crate::registry::{ConnRegistry, MAX_CONNECTIONS};
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

/// Lowest set bit of a nonzero mask; the conventional choice of which
/// connection to force-evict first when a slot must be reclaimed.
#[inline]
pub(crate) fn lowest_bit(mask: u32) -> u32 {
    mask & mask.wrapping_neg()
}

#[repr(C)]
struct Header {
    write_index: AtomicU16,
    registry: ConnRegistry,
    cursors: [AtomicU16; MAX_CONNECTIONS as usize],
    waiter_state: WaiterState,
}

#[repr(C)]
struct SlotHeader {
    rc: AtomicU64,
    size: AtomicU32,
}

fn write_slot(slot: &SlotHeader, slot_data: *mut u8, payload: &[u8], connected: u32) {
    let (_, epoch) = unpack_rc(slot.rc.load(Ordering::Acquire));
    unsafe {
        std::ptr::copy_nonoverlapping(payload.as_ptr(), slot_data, payload.len());
    }
    slot.size.store(payload.len() as u32, Ordering::Release);
    slot.rc.store(pack_rc(connected, epoch.wrapping_add(1)), Ordering::Release);
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
        // a freshly connected consumer starts at the current write position,
        // it never sees messages published before it joined
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

    /// Publish into the head slot, without waiting: `Ok(false)` if it still
    /// has unread readers rather than evicting one of them.
    fn publish(&self, payload: &[u8]) -> Result<bool> {
        let connected = self.hdr.registry.mask();
        let w = self.hdr.write_index.load(Ordering::Relaxed);
        let idx = w & self.cfg.mask();
        let slot = unsafe { self.slot_header(idx) };

        let (remaining, _epoch) = unpack_rc(slot.rc.load(Ordering::Acquire));
        if remaining != 0 {
            return Ok(false);
        }
        write_slot(slot, unsafe { self.slot_data(idx) }, payload, connected);

        self.hdr.write_index.store(w.wrapping_add(1), Ordering::Release);
        self.waiter.broadcast()?;
        Ok(true)
    }

    /// Publish into the head slot, evicting the slowest lagging reader first
    /// if the slot still has one.
    fn publish_forced(&self, payload: &[u8]) -> Result<()> {
        let connected = self.hdr.registry.mask();
        let w = self.hdr.write_index.load(Ordering::Relaxed);
        let idx = w & self.cfg.mask();
        let slot = unsafe { self.slot_header(idx) };

        let mut k = 0u32;
        loop {
            let rc = slot.rc.load(Ordering::Acquire);
            let (remaining, epoch) = unpack_rc(rc);
            if remaining == 0 {
                write_slot(slot, unsafe { self.slot_data(idx) }, payload, connected);
                break;
            }
            tracing::warn!(remaining, "force-pushing over slot with unread readers");
            let evicted = slot.rc.compare_exchange_weak(
                rc,
                pack_rc(0, epoch),
                Ordering::AcqRel,
                Ordering::Acquire,
            );
            if evicted.is_err() {
                crate::spin::adaptive_yield(&mut k);
            }
        }

        self.hdr.write_index.store(w.wrapping_add(1), Ordering::Release);
        self.waiter.broadcast()?;
        Ok(())
    }

    pub fn push_blocking(&self, payload: &[u8], timeout_ms: Option<u64>) -> Result<bool> {
        if payload.len() > self.cfg.slot_size {
            return Err(Error::InvalidArgument("payload exceeds slot_size".into()));
        }
        let mut k = 0u32;
        let deadline = timeout_ms.map(|ms| std::time::Instant::now() + std::time::Duration::from_millis(ms));
        loop {
            if self.publish(payload)? {
                return Ok(true);
            }
            if let Some(dl) = deadline {
                if std::time::Instant::now() >= dl {
                    return Ok(false);
                }
            } else {
                return Ok(false);
            }
            crate::spin::adaptive_yield(&mut k);
        }
    }
}

impl RingProtocol for Ring<'_> {
    fn kind(&self) -> ProtocolKind {
        ProtocolKind::Smb
    }

    fn try_push(&self, payload: &[u8]) -> Result<bool> {
        if payload.len() > self.cfg.slot_size {
            return Err(Error::InvalidArgument("payload exceeds slot_size".into()));
        }
        self.publish(payload)
    }

    fn force_push(&self, payload: &[u8]) -> Result<bool> {
        if payload.len() > self.cfg.slot_size {
            return Err(Error::InvalidArgument("payload exceeds slot_size".into()));
        }
        self.publish_forced(payload)?;
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
            // a force-push evicted us from this slot before we read it
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
