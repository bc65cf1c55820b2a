// Per-OS primitives: named shared memory, robust mutex, condition variable,
// counting semaphore. Everything above this module talks to `RawRegion`,
// `RawMutex`, `RawCondVar`, `RawSemaphore` only — no `cfg(unix)`/`cfg(windows)`
// outside this directory.

#[cfg(unix)]
pub mod posix;
#[cfg(unix)]
pub use posix::{RawCondVar, RawMutex, RawRegion, RawSemaphore, RegionMode};

#[cfg(windows)]
pub mod windows;
#[cfg(windows)]
pub use windows::{RawCondVar, RawMutex, RawRegion, RawSemaphore, RegionMode};
