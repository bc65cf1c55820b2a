// Cross-process synchronization primitives (spec §4.5): a robust mutex, a
// condition variable, a counting semaphore, and the `Waiter` blocking
// send/recv helper built out of the two semaphores.

pub mod condvar;
pub mod mutex;
pub mod semaphore;
pub mod waiter;

pub use condvar::CondVar;
pub use mutex::{MutexGuard, RobustMutex};
pub use semaphore::Semaphore;
pub use waiter::{Waiter, WaiterState};
