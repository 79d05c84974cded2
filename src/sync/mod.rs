//! Fiber-aware synchronization within a strand.
//!
//! Strand serialization already excludes data races; what remains is
//! interleaving at suspension points. [`Mutex`] serializes critical
//! sections across suspension points, [`ExclusiveRef`] asserts that a
//! region has none.

mod exclusive;
mod mutex;

pub use exclusive::ExclusiveRef;
pub use mutex::{Mutex, MutexGuard};
