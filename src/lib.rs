//! Spindle: stackful fibers on serialized executors, with deferred
//! interruption.
//!
//! # Overview
//!
//! Spindle runs stackful fibers on top of strands: serializing executors
//! layered on an I/O-dispatching context. A fiber suspends by handing
//! control back to its strand and resumes when the event it waits on posts
//! a handler there; because every handler of one strand is serialized, the
//! fiber state machine needs no speculative locking and shared state on a
//! strand stays consistent between suspension points.
//!
//! # Core Guarantees
//!
//! - **Serialized re-entry**: a fiber's body, resume handlers and interrupt
//!   deliveries all execute on its strand, never overlapping.
//! - **Deferred cancellation**: [`FiberHandle::interrupt`] records a
//!   request; delivery happens only at a suspension point, only while
//!   enabled, as a typed [`Interrupt`] that generic error plumbing cannot
//!   swallow.
//! - **Joinable-thread discipline**: every [`FiberHandle`] is consumed by
//!   `join` or `detach`; an abandoned handle stops the owning context and
//!   is observable via [`context_aborted`].
//! - **No silent drops**: a completion dropped without being invoked fails
//!   the wait with [`ErrorKind::Abandoned`] instead of leaking a parked
//!   fiber.
//!
//! # Module Structure
//!
//! - [`exec`]: the substrate ([`IoContext`], [`Strand`], [`Timer`])
//! - [`fiber`]: spawning, [`FiberCx`], interruption, completion tokens
//! - [`sync`]: [`Mutex`] and [`ExclusiveRef`], synchronization across
//!   suspension points
//! - [`error`]: operation errors and the wait-error surface
//!
//! # Example
//!
//! ```ignore
//! use std::time::Duration;
//!
//! let ctx = spindle::IoContext::new();
//! let handle = spindle::spawn(&ctx, |fib| {
//!     for n in (1..=3).rev() {
//!         spindle::sleep(fib, Duration::from_secs(1))?;
//!         println!("{n}...");
//!     }
//!     Ok(())
//! });
//! handle.detach();
//! ctx.run();
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_panics_doc)]

pub mod error;
pub mod exec;
pub mod fiber;
pub mod sync;

pub use error::{Error, ErrorKind, Result, ResultExt, WaitError};
pub use exec::{context_aborted, sleep, IoContext, Strand, Timer};
pub use fiber::{
    spawn, spawn_on, AllowSuspend, Builder, CaptureError, Completer, DisableInterruption, FiberCx,
    FiberHandle, FiberId, FiberReturn, ForbidSuspend, Interrupt, RestoreInterruption, WaitToken,
};
pub use sync::{ExclusiveRef, Mutex, MutexGuard};
