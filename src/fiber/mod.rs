//! The fiber runtime: spawning, the in-fiber handle, interruption and
//! completion tokens.
//!
//! A fiber is a stackful thread of control cooperatively scheduled on a
//! [`Strand`](crate::exec::Strand). Within one strand at most one fiber
//! body runs at a time; fibers on different strands are concurrent with
//! respect to each other.
//!
//! Entry points:
//!
//! - [`spawn`] / [`spawn_on`] / [`FiberCx::spawn`] / [`Builder`] create
//!   fibers and hand back a [`FiberHandle`].
//! - The body receives a [`&FiberCx`](FiberCx), through which it yields,
//!   awaits completions and scopes interruption.
//! - [`FiberHandle::interrupt`] requests deferred cancellation, delivered
//!   as an [`Interrupt`] at the target's next eligible suspension point.

mod cx;
mod fcb;
mod handle;
mod interrupt;
mod token;

pub use cx::FiberCx;
pub use fcb::FiberId;
pub use handle::{spawn, spawn_on, Builder, FiberHandle, FiberReturn};
pub use interrupt::{
    AllowSuspend, DisableInterruption, ForbidSuspend, Interrupt, RestoreInterruption,
};
pub use token::{CaptureError, Completer, WaitToken};

pub(crate) use fcb::{active_fiber, resume_fiber, Fcb};
