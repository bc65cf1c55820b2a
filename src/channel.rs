// Application-facing channel API (spec §6): open/reconnect/disconnect a
// named channel backed by one of the four ring protocols, send/recv
// messages of arbitrary size through the fragmentation layer.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

use crate::error::{Error, Result};
use crate::fragment::{Fragmenter, FragmentHeader, Reassembler};
use crate::region::{OpenMode, Region};
use crate::ring::{mmb, mmu, smb, ssu, ProtocolKind, RingConfig, RingProtocol};

const FRAGMENT_HEADER_LEN: usize = 12;
const DEFAULT_REASSEMBLY_CAPACITY: usize = 64;

/// Which end(s) of the channel this handle participates as.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mode(u8);

impl Mode {
    pub const SENDER: Mode = Mode(0b01);
    pub const RECEIVER: Mode = Mode(0b10);
    pub const BOTH: Mode = Mode(0b11);

    pub fn contains(self, other: Mode) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for Mode {
    type Output = Mode;
    fn bitor(self, rhs: Mode) -> Mode {
        Mode(self.0 | rhs.0)
    }
}

enum AnyRing<'a> {
    Ssu(ssu::Ring<'a>),
    Mmu(mmu::Ring<'a>),
    Smb(smb::Ring<'a>),
    Mmb(mmb::Ring<'a>),
}

impl AnyRing<'_> {
    fn connect(&self) -> Result<u32> {
        match self {
            AnyRing::Ssu(r) => r.connect(),
            AnyRing::Mmu(r) => r.connect(),
            AnyRing::Smb(r) => r.connect(),
            AnyRing::Mmb(r) => r.connect(),
        }
    }

    fn disconnect(&self, conn_id: u32) {
        match self {
            AnyRing::Ssu(r) => r.disconnect(conn_id),
            AnyRing::Mmu(r) => r.disconnect(conn_id),
            AnyRing::Smb(r) => r.disconnect(conn_id),
            AnyRing::Mmb(r) => r.disconnect(conn_id),
        }
    }

    fn close(&self) -> Result<()> {
        match self {
            AnyRing::Ssu(r) => r.close(),
            AnyRing::Mmu(r) => r.close(),
            AnyRing::Smb(r) => r.close(),
            AnyRing::Mmb(r) => r.close(),
        }
    }
}

impl AnyRing<'_> {
    fn is_broadcast(&self) -> bool {
        matches!(self.kind(), ProtocolKind::Smb | ProtocolKind::Mmb)
    }
}

impl RingProtocol for AnyRing<'_> {
    fn kind(&self) -> ProtocolKind {
        match self {
            AnyRing::Ssu(r) => r.kind(),
            AnyRing::Mmu(r) => r.kind(),
            AnyRing::Smb(r) => r.kind(),
            AnyRing::Mmb(r) => r.kind(),
        }
    }

    fn try_push(&self, payload: &[u8]) -> Result<bool> {
        match self {
            AnyRing::Ssu(r) => r.try_push(payload),
            AnyRing::Mmu(r) => r.try_push(payload),
            AnyRing::Smb(r) => r.try_push(payload),
            AnyRing::Mmb(r) => r.try_push(payload),
        }
    }

    fn force_push(&self, payload: &[u8]) -> Result<bool> {
        match self {
            AnyRing::Ssu(r) => r.force_push(payload),
            AnyRing::Mmu(r) => r.force_push(payload),
            AnyRing::Smb(r) => r.force_push(payload),
            AnyRing::Mmb(r) => r.force_push(payload),
        }
    }

    fn claim_sender(&self) -> Result<()> {
        match self {
            AnyRing::Ssu(r) => r.claim_sender(),
            AnyRing::Mmu(r) => r.claim_sender(),
            AnyRing::Smb(r) => r.claim_sender(),
            AnyRing::Mmb(r) => r.claim_sender(),
        }
    }

    fn release_sender(&self) {
        match self {
            AnyRing::Ssu(r) => r.release_sender(),
            AnyRing::Mmu(r) => r.release_sender(),
            AnyRing::Smb(r) => r.release_sender(),
            AnyRing::Mmb(r) => r.release_sender(),
        }
    }

    fn try_pop(&self, conn_id: u32) -> Result<Option<Vec<u8>>> {
        match self {
            AnyRing::Ssu(r) => r.try_pop(conn_id),
            AnyRing::Mmu(r) => r.try_pop(conn_id),
            AnyRing::Smb(r) => r.try_pop(conn_id),
            AnyRing::Mmb(r) => r.try_pop(conn_id),
        }
    }

    fn pending(&self, conn_id: u32) -> u16 {
        match self {
            AnyRing::Ssu(r) => r.pending(conn_id),
            AnyRing::Mmu(r) => r.pending(conn_id),
            AnyRing::Smb(r) => r.pending(conn_id),
            AnyRing::Mmb(r) => r.pending(conn_id),
        }
    }
}

fn layout_size(kind: ProtocolKind, cfg: &RingConfig) -> usize {
    match kind {
        ProtocolKind::Ssu => ssu::layout_size(cfg),
        ProtocolKind::Mmu => mmu::layout_size(cfg),
        ProtocolKind::Smb => smb::layout_size(cfg),
        ProtocolKind::Mmb => mmb::layout_size(cfg),
    }
}

fn encode_fragment(header: FragmentHeader, chunk: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(FRAGMENT_HEADER_LEN + chunk.len());
    buf.extend_from_slice(&header.conn_id.to_le_bytes());
    buf.extend_from_slice(&header.msg_id.to_le_bytes());
    buf.extend_from_slice(&header.remain.to_le_bytes());
    buf.extend_from_slice(chunk);
    buf
}

fn decode_fragment(bytes: &[u8]) -> Result<(FragmentHeader, &[u8])> {
    if bytes.len() < FRAGMENT_HEADER_LEN {
        return Err(Error::InvalidArgument("fragment shorter than its header".into()));
    }
    let conn_id = u32::from_le_bytes(bytes[0..4].try_into().unwrap());
    let msg_id = u32::from_le_bytes(bytes[4..8].try_into().unwrap());
    let remain = i32::from_le_bytes(bytes[8..12].try_into().unwrap());
    Ok((
        FragmentHeader { conn_id, msg_id, remain },
        &bytes[FRAGMENT_HEADER_LEN..],
    ))
}

/// A shared-memory channel endpoint: a named region, one of the four ring
/// protocols attached over it, and the fragmentation layer needed to move
/// messages larger than a single slot.
pub struct Channel {
    ring: AnyRing<'static>,
    region: Region,
    name: String,
    mode: Mode,
    conn_id: Option<u32>,
    /// Whether this handle currently holds the ring's sender claim (always
    /// true once set for every protocol but SSU, where it enforces
    /// single-sender exclusivity).
    sender_claimed: bool,
    next_msg_id: AtomicU32,
    reassembler: Mutex<Reassembler>,
    fragmenter: Fragmenter,
}

impl Channel {
    pub fn open(name: &str, kind: ProtocolKind, mode: Mode, cfg: RingConfig) -> Result<Self> {
        if name.is_empty() {
            return Err(Error::InvalidArgument("channel name is empty".into()));
        }
        cfg.validate()?;

        let size = layout_size(kind, &cfg);
        let region = Region::open(name, size, OpenMode::CreateOrOpen)?;
        let waiter_name = format!("{name}_WT");
        let base = region.as_mut_ptr();

        let ring: AnyRing<'static> = unsafe {
            match kind {
                ProtocolKind::Ssu => AnyRing::Ssu(ssu::Ring::attach(base, cfg, &waiter_name)?),
                ProtocolKind::Mmu => AnyRing::Mmu(mmu::Ring::attach(base, cfg, &waiter_name)?),
                ProtocolKind::Smb => AnyRing::Smb(smb::Ring::attach(base, cfg, &waiter_name)?),
                ProtocolKind::Mmb => AnyRing::Mmb(mmb::Ring::attach(base, cfg, &waiter_name)?),
            }
        };

        let conn_id = if mode.contains(Mode::RECEIVER) {
            Some(ring.connect()?)
        } else {
            None
        };

        let sender_claimed = if mode.contains(Mode::SENDER) {
            ring.claim_sender()?;
            true
        } else {
            false
        };

        let chunk_size = cfg.slot_size.saturating_sub(FRAGMENT_HEADER_LEN);
        if chunk_size == 0 {
            return Err(Error::InvalidArgument(
                "slot_size too small to carry a fragment header".into(),
            ));
        }

        tracing::info!(name, ?kind, prev_ref = region.ref_count(), "channel opened");

        Ok(Self {
            ring,
            region,
            name: name.to_string(),
            mode,
            conn_id,
            sender_claimed,
            next_msg_id: AtomicU32::new(0),
            reassembler: Mutex::new(Reassembler::new(DEFAULT_REASSEMBLY_CAPACITY)?),
            fragmenter: Fragmenter::new(chunk_size)?,
        })
    }

    pub fn reconnect(&mut self, mode: Mode) -> Result<()> {
        if mode.contains(Mode::RECEIVER) && self.conn_id.is_none() {
            self.conn_id = Some(self.ring.connect()?);
        }
        if mode.contains(Mode::SENDER) && !self.sender_claimed {
            self.ring.claim_sender()?;
            self.sender_claimed = true;
        }
        self.mode = self.mode | mode;
        Ok(())
    }

    pub fn disconnect(&mut self) {
        if let Some(id) = self.conn_id.take() {
            self.ring.disconnect(id);
        }
    }

    fn send_fragments(&self, payload: &[u8], force: bool) -> Result<bool> {
        if !self.mode.contains(Mode::SENDER) {
            return Err(Error::InvalidArgument("channel not opened for sending".into()));
        }
        let conn_id = self.conn_id.unwrap_or(0);
        let msg_id = self.next_msg_id.fetch_add(1, Ordering::Relaxed);
        for frag in self.fragmenter.fragment(conn_id, msg_id, payload) {
            let wire = encode_fragment(frag.header, frag.chunk);
            let pushed = if force {
                self.ring.force_push(&wire)?
            } else {
                self.ring.try_push(&wire)?
            };
            if !pushed {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Non-blocking send, force-pushing over a lagging reader in the
    /// broadcast protocols (equivalent to [`Channel::send`] in the unicast
    /// ones, which have no reader to evict). `Ok(false)` means the ring was
    /// full for at least one of this message's fragments (the earlier
    /// fragments that did land are still visible to receivers — partial
    /// sends are not rolled back).
    pub fn try_send(&self, payload: &[u8]) -> Result<bool> {
        self.send_fragments(payload, true)
    }

    /// Blocking send. Never evicts a lagging broadcast reader: a slot that's
    /// still claimed makes this retry, same as an unconditionally full
    /// unicast ring, until `timeout_ms` elapses.
    pub fn send(&self, payload: &[u8], timeout_ms: Option<u64>) -> Result<bool> {
        let deadline =
            timeout_ms.map(|ms| std::time::Instant::now() + std::time::Duration::from_millis(ms));
        let mut k = 0u32;
        loop {
            if self.send_fragments(payload, false)? {
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

    /// Non-blocking receive. Skips fragments a force-push evicted us from,
    /// surfacing neither an error nor that message to the caller — the loop
    /// only ever returns a fully-reassembled message or `None`.
    pub fn try_recv(&self) -> Result<Option<Vec<u8>>> {
        let conn_id = self
            .conn_id
            .ok_or_else(|| Error::InvalidArgument("channel not opened for receiving".into()))?;
        let is_broadcast = self.ring.is_broadcast();
        loop {
            let wire = match self.ring.try_pop(conn_id) {
                Ok(Some(w)) => w,
                Ok(None) => return Ok(None),
                Err(Error::Overflow) => {
                    tracing::warn!(channel = %self.name, "receiver skipped a force-evicted fragment");
                    continue;
                }
                Err(e) => return Err(e),
            };
            let (header, chunk) = decode_fragment(&wire)?;
            if is_broadcast && header.conn_id == conn_id {
                // this endpoint is also the sender of this message on a
                // broadcast ring: it already has the data, discard its own
                // fragments rather than handing them back through recv().
                continue;
            }
            let mut reassembler = self.reassembler.lock().unwrap();
            match reassembler.push(header, chunk) {
                Ok(Some(msg)) => return Ok(Some(msg)),
                Ok(None) => continue,
                Err(Error::Overflow) => {
                    tracing::warn!(channel = %self.name, "reassembly cache dropped a partial message");
                    continue;
                }
                Err(e) => return Err(e),
            }
        }
    }

    pub fn recv(&self, timeout_ms: Option<u64>) -> Result<Option<Vec<u8>>> {
        let deadline =
            timeout_ms.map(|ms| std::time::Instant::now() + std::time::Duration::from_millis(ms));
        let mut k = 0u32;
        loop {
            if let Some(msg) = self.try_recv()? {
                return Ok(Some(msg));
            }
            if let Some(dl) = deadline {
                if std::time::Instant::now() >= dl {
                    return Ok(None);
                }
            }
            crate::spin::adaptive_yield(&mut k);
        }
    }

    /// Messages still queued for this endpoint's connection.
    pub fn recv_count(&self) -> u16 {
        self.conn_id.map(|id| self.ring.pending(id)).unwrap_or(0)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> ProtocolKind {
        self.ring.kind()
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        self.disconnect();
        if self.sender_claimed {
            self.ring.release_sender();
            self.sender_claimed = false;
        }
        // Only the last handle onto this channel (in any process) should
        // mark the shared waiter state closed — doing it unconditionally
        // would wake every other still-live handle's blocked send/recv with
        // a permanent "closed" result while the channel is still in use.
        if self.region.ref_count() == 1 {
            if let Err(e) = self.ring.close() {
                tracing::warn!(channel = %self.name, error = %e, "failed to release blocked waiters on close");
            }
        }
        tracing::debug!(channel = %self.name, "channel closed");
    }
}
