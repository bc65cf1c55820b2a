// The shared region interface (spec §6): a named, fixed-size byte range
// attached by every process that opens the same channel. Reference counting
// and unlink-on-last-close live in `platform::RawRegion`; this layer adds
// `ringbus::Error` conversion and the create/open/create-or-open API shape
// callers see.

use crate::error::{Error, Result};
use crate::platform::{RawRegion, RegionMode as RawMode};

/// How a region should be attached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    /// Fail if a region with this name already exists.
    Create,
    /// Fail if no region with this name exists.
    Open,
    /// Create it if missing, attach to it if present.
    CreateOrOpen,
}

impl From<OpenMode> for RawMode {
    fn from(m: OpenMode) -> Self {
        match m {
            OpenMode::Create => RawMode::Create,
            OpenMode::Open => RawMode::Open,
            OpenMode::CreateOrOpen => RawMode::CreateOrOpen,
        }
    }
}

/// A handle to a named shared-memory region.
///
/// Dropping the last handle in the system unlinks the backing object.
/// Whether *this* handle was the creator is observable via [`Region::is_creator`],
/// which callers use to decide whether to run one-time header construction.
pub struct Region {
    raw: RawRegion,
}

impl Region {
    pub fn open(name: &str, size: usize, mode: OpenMode) -> Result<Self> {
        if name.is_empty() {
            return Err(Error::InvalidArgument("region name is empty".into()));
        }
        if size == 0 {
            return Err(Error::InvalidArgument("region size is 0".into()));
        }
        let raw = RawRegion::acquire(name, size, mode.into()).map_err(Error::RegionUnavailable)?;
        tracing::debug!(name, size, prev_ref = raw.prev_ref_count(), "region attached");
        Ok(Self { raw })
    }

    pub fn as_ptr(&self) -> *const u8 {
        self.raw.as_ptr()
    }

    pub fn as_mut_ptr(&self) -> *mut u8 {
        self.raw.as_mut_ptr()
    }

    pub fn user_size(&self) -> usize {
        self.raw.user_size()
    }

    pub fn name(&self) -> &str {
        self.raw.name()
    }

    /// True if this handle's `open` call created the backing object (the
    /// observed reference count, pre-increment, was zero).
    pub fn is_creator(&self) -> bool {
        self.raw.prev_ref_count() == 0
    }

    pub fn ref_count(&self) -> i32 {
        self.raw.ref_count()
    }

    /// Cast the region's byte range to `&T`. Caller guarantees `T` fits
    /// within `user_size()` and that the region was constructed as `T`
    /// (typically via [`Region::is_creator`] gating a one-time init).
    ///
    /// # Safety
    /// The region must contain a valid, fully-initialized `T` at offset 0,
    /// and no other thread/process may be racing the construction of `T`.
    pub unsafe fn as_ref<T>(&self) -> &T {
        debug_assert!(std::mem::size_of::<T>() <= self.raw.user_size());
        &*(self.raw.as_ptr() as *const T)
    }
}

impl Drop for Region {
    fn drop(&mut self) {
        tracing::debug!(name = self.raw.name(), "region detached");
    }
}
