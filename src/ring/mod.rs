// The four ring protocols (spec §4.2-§4.4): SSU, MMU, SMB, MMB. Each is a
// distinct, fixed-at-creation-time layout over a shared region — there is no
// runtime switch between them, only a `ProtocolKind` tag recorded so a
// reattaching process knows which one to interpret the header as.
//
// All indices are 16-bit and monotonically increasing; comparisons use
// wrapping arithmetic so a producer/consumer pair can run indefinitely
// without ever needing to agree on an absolute origin.

pub mod mmb;
pub mod mmu;
pub mod smb;
pub mod ssu;

use crate::error::{Error, Result};

/// Which of the four ring layouts a channel uses. Chosen once at creation
/// and never changed: mixing producer/consumer ends built for different
/// kinds against the same region is a caller bug, not a recoverable state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProtocolKind {
    /// Single producer, one or more consumers, each message unicast to
    /// exactly one of them.
    Ssu,
    /// Multiple producers, one or more consumers, each message unicast to
    /// exactly one consumer.
    Mmu,
    /// Single producer, every connected consumer receives every message.
    Smb,
    /// Multiple producers, every connected consumer receives every message.
    Mmb,
}

#[derive(Debug, Clone, Copy)]
pub struct RingConfig {
    /// Slot count; must be a power of two.
    pub capacity: u16,
    /// Bytes of payload per slot, excluding the slot header.
    pub slot_size: usize,
}

pub const DEFAULT_CAPACITY: u16 = 256;
pub const DEFAULT_SLOT_SIZE: usize = 64;

impl Default for RingConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_CAPACITY,
            slot_size: DEFAULT_SLOT_SIZE,
        }
    }
}

impl RingConfig {
    pub fn validate(&self) -> Result<()> {
        if self.capacity == 0 || !self.capacity.is_power_of_two() {
            return Err(Error::InvalidArgument("ring capacity must be a power of two".into()));
        }
        if self.slot_size == 0 {
            return Err(Error::InvalidArgument("ring slot_size must be nonzero".into()));
        }
        Ok(())
    }

    pub fn mask(&self) -> u16 {
        self.capacity - 1
    }
}

/// Distance from `older` to `newer` along the monotonic 16-bit counter
/// space, handling wraparound. Used for fullness/emptiness checks.
#[inline]
pub fn wrap_distance(newer: u16, older: u16) -> u16 {
    newer.wrapping_sub(older)
}

#[inline]
pub(crate) fn align_up(n: usize, align: usize) -> usize {
    (n + align - 1) / align * align
}

/// Common interface the channel layer drives, regardless of which of the
/// four layouts backs a given region.
pub trait RingProtocol {
    fn kind(&self) -> ProtocolKind;

    /// Non-blocking enqueue. `Ok(false)` means the ring was full — for the
    /// broadcast protocols (SMB/MMB) that means the target slot still has at
    /// least one reader that hasn't consumed it; this call never evicts one.
    fn try_push(&self, payload: &[u8]) -> Result<bool>;

    /// Non-blocking enqueue that may evict a lagging reader to make room.
    /// For the unicast protocols (SSU/MMU), where there is no reader to
    /// evict, this is equivalent to [`RingProtocol::try_push`].
    fn force_push(&self, payload: &[u8]) -> Result<bool> {
        self.try_push(payload)
    }

    /// Non-blocking dequeue for the given connection. `Ok(None)` means
    /// nothing was available *for this connection* right now.
    fn try_pop(&self, conn_id: u32) -> Result<Option<Vec<u8>>>;

    /// Messages this connection has not yet consumed.
    fn pending(&self, conn_id: u32) -> u16;

    /// Claim this ring's sender slot. Every protocol but SSU allows any
    /// number of concurrent senders, so the default is a no-op; SSU overrides
    /// this to enforce its single-sender invariant.
    fn claim_sender(&self) -> Result<()> {
        Ok(())
    }

    /// Release a previously successful [`RingProtocol::claim_sender`] call.
    fn release_sender(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wrap_distance_handles_rollover() {
        assert_eq!(wrap_distance(5, 3), 2);
        assert_eq!(wrap_distance(1, 65535), 2);
        assert_eq!(wrap_distance(0, 0), 0);
    }

    #[test]
    fn config_rejects_non_power_of_two() {
        let cfg = RingConfig { capacity: 100, slot_size: 64 };
        assert!(cfg.validate().is_err());
    }
}
