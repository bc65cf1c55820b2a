//! Cross-process IPC over shared memory: four ring producer/consumer
//! protocols (unicast/broadcast, single/multi-producer), a robust-mutex /
//! semaphore synchronization layer, and message fragmentation for payloads
//! larger than one ring slot.

mod platform;
mod shm_name;
mod spin;

pub mod alloc;
pub mod channel;
pub mod error;
pub mod fragment;
pub mod mem;
pub mod region;
pub mod registry;
pub mod ring;
pub mod sync;

pub use channel::{Channel, Mode};
pub use error::{Error, Result};
pub use region::{OpenMode, Region};
pub use ring::{ProtocolKind, RingConfig};
