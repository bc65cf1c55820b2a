// Error taxonomy for the ring/channel layer. Kinds mirror the failure modes
// a caller can actually observe; OS-level failures are wrapped rather than
// matched on, since their exact shape is platform-dependent.

use thiserror::Error;

/// Every failure mode `ringbus` can surface across its public API.
#[derive(Debug, Error)]
pub enum Error {
    /// Empty name, zero size, non-power-of-two capacity, or a bad alignment request.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The backing shared-memory region could not be created or opened.
    #[error("shared region unavailable: {0}")]
    RegionUnavailable(#[source] std::io::Error),

    /// The connection registry has no free bit (32 receivers already connected).
    #[error("connection registry is full")]
    RegistryFull,

    /// A robust mutex was found permanently unrecoverable (consistency not restored).
    #[error("synchronization primitive is unrecoverable")]
    Unrecoverable,

    /// A blocking call exceeded its deadline.
    #[error("operation timed out")]
    Timeout,

    /// The endpoint was closed while the operation was in flight.
    #[error("channel endpoint closed")]
    Closed,

    /// The reassembly cache evicted a partial message to stay within bounds.
    #[error("message reassembly overflow, a partial message was dropped")]
    Overflow,

    /// Catch-all for OS calls outside the cases above (mmap, pthread init, ...).
    #[error(transparent)]
    Os(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
