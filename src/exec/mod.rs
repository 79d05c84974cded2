//! The executor substrate: I/O context, strands and the deadline timer.
//!
//! This is the layer the fiber runtime sits on, kept to the interface the
//! runtime actually consumes: post, dispatch, work pinning and deadline
//! scheduling. The fiber machinery in [`crate::fiber`] only relies on the
//! guarantees documented here, most importantly strand serialization.

mod context;
mod strand;
mod timer;

pub use context::{context_aborted, IoContext};
pub use strand::Strand;
pub use timer::{sleep, Timer};

pub(crate) use context::{mark_context_aborted, WorkGuard};
