//! Concurrency primitives: a FIFO semaphore and scoped cleanup.

mod scoped;
mod semaphore;

pub use scoped::{run_scoped, Scope};
pub use semaphore::AsyncSemaphore;
