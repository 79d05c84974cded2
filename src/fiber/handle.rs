//! Spawning fibers and the external fiber handle.
//!
//! A [`FiberHandle`] is the owner-side view of a fiber, usable from outside
//! the fiber body (including from other fibers and other strands). It
//! follows joinable-thread discipline: exactly one of [`FiberHandle::join`]
//! or [`FiberHandle::detach`] must consume it. A handle dropped without
//! either is a logic error; the runtime stops the owning I/O context and
//! raises the process-wide flag readable through
//! [`context_aborted`](crate::exec::context_aborted).
//!
//! # Spawn forms
//!
//! - [`spawn`]: on a fresh strand of the given context.
//! - [`spawn_on`]: on an explicit strand.
//! - [`FiberCx::spawn`]: on the calling fiber's strand.
//! - [`Builder`]: either of the above with a name and a custom stack size.
//!
//! # Example
//!
//! ```ignore
//! let ctx = IoContext::new();
//! let worker = spindle::spawn(&ctx, |fib| {
//!     fib.yield_now()?;
//!     Ok(())
//! });
//! spindle::spawn(&ctx, move |fib| {
//!     let mut worker = worker;
//!     worker.join(fib).expect("joiner was not interrupted");
//!     assert!(!worker.interruption_caught());
//! })
//! .detach();
//! ctx.run();
//! ```

use std::panic::{catch_unwind, resume_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use corosensei::stack::DefaultStack;
use corosensei::{Coroutine, Yielder};
use tracing::{debug, error};

use super::cx::FiberCx;
use super::fcb::{
    request_interrupt, resume_fiber, BodyOutcome, Fcb, FiberCoroutine, FiberId, Joiner,
};
use super::interrupt::Interrupt;
use crate::error::{Error, ErrorKind, Result, WaitError};
use crate::exec::{mark_context_aborted, IoContext, Strand};

mod sealed {
    pub trait Sealed {}
}

/// Return types accepted from a fiber body.
///
/// The closed set is `()`, `Result<(), Interrupt>` and
/// `Result<(), WaitError>`; the latter two let `?` forward an interruption
/// out of the body, which terminates the fiber with the interrupted flag
/// set.
pub trait FiberReturn: sealed::Sealed {
    #[doc(hidden)]
    fn interrupted(&self) -> bool;
}

impl sealed::Sealed for () {}

impl FiberReturn for () {
    fn interrupted(&self) -> bool {
        false
    }
}

impl sealed::Sealed for core::result::Result<(), Interrupt> {}

impl FiberReturn for core::result::Result<(), Interrupt> {
    fn interrupted(&self) -> bool {
        self.is_err()
    }
}

impl sealed::Sealed for core::result::Result<(), WaitError> {}

impl FiberReturn for core::result::Result<(), WaitError> {
    fn interrupted(&self) -> bool {
        matches!(self, Err(WaitError::Interrupted(_)))
    }
}

/// Spawns a fiber on a fresh strand of `ctx`.
///
/// The fiber is scheduled immediately; it starts running once `ctx` is
/// driven. The returned handle must be consumed by `join` or `detach`.
pub fn spawn<F, R>(ctx: &IoContext, body: F) -> FiberHandle
where
    F: FnOnce(&FiberCx<'_>) -> R + Send + 'static,
    R: FiberReturn,
{
    spawn_on(&Strand::new(ctx), body)
}

/// Spawns a fiber on an explicit strand.
///
/// Fibers sharing a strand never run concurrently with each other.
pub fn spawn_on<F, R>(strand: &Strand, body: F) -> FiberHandle
where
    F: FnOnce(&FiberCx<'_>) -> R + Send + 'static,
    R: FiberReturn,
{
    Builder::new()
        .spawn_on(strand, body)
        .expect("default fiber stack allocation failed")
}

/// Configures a fiber before spawning it.
#[derive(Debug, Default)]
pub struct Builder {
    name: Option<String>,
    stack_size: Option<usize>,
}

impl Builder {
    /// Creates a builder with the default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Names the fiber; the name appears in trace output.
    #[must_use]
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Sets the fiber's stack size in bytes. Rounded up to the platform's
    /// page granularity by the stack allocator.
    #[must_use]
    pub fn stack_size(mut self, bytes: usize) -> Self {
        self.stack_size = Some(bytes);
        self
    }

    /// Spawns the configured fiber on a fresh strand of `ctx`.
    ///
    /// # Errors
    ///
    /// [`ErrorKind::Resource`] if the fiber stack cannot be allocated.
    pub fn spawn<F, R>(self, ctx: &IoContext, body: F) -> Result<FiberHandle>
    where
        F: FnOnce(&FiberCx<'_>) -> R + Send + 'static,
        R: FiberReturn,
    {
        self.spawn_on(&Strand::new(ctx), body)
    }

    /// Spawns the configured fiber on an explicit strand.
    ///
    /// # Errors
    ///
    /// [`ErrorKind::Resource`] if the fiber stack cannot be allocated.
    pub fn spawn_on<F, R>(self, strand: &Strand, body: F) -> Result<FiberHandle>
    where
        F: FnOnce(&FiberCx<'_>) -> R + Send + 'static,
        R: FiberReturn,
    {
        let fcb = Fcb::new(strand.clone(), self.name);
        let entry_fcb = Arc::clone(&fcb);
        let entry = move |yielder: &Yielder<(), ()>, _input: ()| -> BodyOutcome {
            let fib = FiberCx::new(entry_fcb, yielder);
            match catch_unwind(AssertUnwindSafe(|| body(&fib))) {
                Ok(ret) if ret.interrupted() => BodyOutcome::Interrupted,
                Ok(_) => BodyOutcome::Completed,
                Err(payload) => BodyOutcome::Panicked(payload),
            }
        };
        let coroutine: FiberCoroutine = match self.stack_size {
            Some(bytes) => {
                let stack = DefaultStack::new(bytes).map_err(|e| {
                    Error::new(ErrorKind::Resource)
                        .with_context(format!("fiber stack allocation ({bytes} bytes)"))
                        .with_source(e)
                })?;
                Coroutine::with_stack(stack, entry)
            }
            None => Coroutine::new(entry),
        };
        fcb.state.lock().coroutine = Some(coroutine);
        debug!(
            fiber = %fcb.id,
            name = fcb.name.as_deref().unwrap_or(""),
            "fiber spawned"
        );
        let initial = Arc::clone(&fcb);
        strand.post(move || resume_fiber(&initial));
        Ok(FiberHandle {
            id: fcb.id,
            strand: strand.clone(),
            fcb: Some(fcb),
            joined: false,
            caught: false,
        })
    }
}

/// Movable owner of a fiber, usable from outside the fiber.
///
/// Must be consumed by exactly one of [`join`](Self::join) or
/// [`detach`](Self::detach); see the module docs for the consequences of
/// dropping an unconsumed handle.
#[must_use = "a fiber handle must be joined or detached"]
pub struct FiberHandle {
    id: FiberId,
    strand: Strand,
    fcb: Option<Arc<Fcb>>,
    joined: bool,
    caught: bool,
}

impl FiberHandle {
    /// Returns the fiber's identifier.
    #[must_use]
    pub fn id(&self) -> FiberId {
        self.id
    }

    /// Returns the strand the fiber executes on.
    #[must_use]
    pub fn executor(&self) -> &Strand {
        &self.strand
    }

    /// Suspends the calling fiber until this fiber terminates.
    ///
    /// The joiner may live on a different strand; the wakeup is posted onto
    /// the joiner's strand. On success the handle is consumed and
    /// [`interruption_caught`](Self::interruption_caught) reports how the
    /// fiber ended. If the joined fiber panicked, the panic payload is
    /// re-raised here.
    ///
    /// This is a suspension point for the *caller*. If the caller is
    /// interrupted while waiting, the join returns [`Interrupt`] and the
    /// handle stays joinable, exactly as before the call.
    ///
    /// # Errors
    ///
    /// Returns [`Interrupt`] if the calling fiber was interrupted.
    ///
    /// # Panics
    ///
    /// Panics if the handle was already consumed, or if the fiber joins
    /// itself.
    pub fn join(&mut self, fib: &FiberCx<'_>) -> core::result::Result<(), Interrupt> {
        let target = Arc::clone(
            self.fcb
                .as_ref()
                .expect("fiber handle already joined or detached"),
        );
        assert!(target.id != fib.id(), "a fiber cannot join itself");
        fib.assert_suspension_allowed("join");
        // Entry interruption point, even when the target has terminated.
        fib.deliver_pending()?;

        let caller = fib.fcb_arc();
        let woken = Arc::new(AtomicBool::new(false));
        let registered = {
            let mut state = target.state.lock();
            if state.outcome.is_some() {
                false
            } else {
                let wake = {
                    let woken = Arc::clone(&woken);
                    let caller = Arc::clone(&caller);
                    move || {
                        if !woken.swap(true, Ordering::SeqCst) {
                            let strand = caller.strand().clone();
                            strand.post(move || resume_fiber(&caller));
                        }
                    }
                };
                state.joiner = Joiner::Waiting(Box::new(wake));
                true
            }
        };

        if registered {
            // Wake the joiner early if it is interrupted while parked; the
            // join registration is withdrawn so the target wakes nobody.
            let hook_target = Arc::clone(&target);
            let hook_caller = Arc::clone(&caller);
            let hook_woken = Arc::clone(&woken);
            fib.set_interrupter(move || {
                if !hook_woken.swap(true, Ordering::SeqCst) {
                    hook_target.state.lock().joiner = Joiner::None;
                    let strand = hook_caller.strand().clone();
                    strand.post(move || resume_fiber(&hook_caller));
                }
            });
            fib.park();
            fib.deliver_pending()?;
        }

        let outcome = target
            .state
            .lock()
            .outcome
            .take()
            .expect("joined fiber has no recorded outcome");
        self.fcb = None;
        self.joined = true;
        match outcome {
            BodyOutcome::Completed => {
                self.caught = false;
                Ok(())
            }
            BodyOutcome::Interrupted => {
                self.caught = true;
                Ok(())
            }
            BodyOutcome::Panicked(payload) => resume_unwind(payload),
        }
    }

    /// Relinquishes the right to join; the fiber runs to completion on its
    /// own. Consumes the handle.
    pub fn detach(mut self) {
        let fcb = self
            .fcb
            .take()
            .expect("fiber handle already joined or detached");
        let mut state = fcb.state.lock();
        if let Some(BodyOutcome::Panicked(payload)) = &state.outcome {
            error!(
                fiber = %fcb.id,
                panic = super::fcb::panic_message(payload.as_ref()),
                "fiber detached after panicking"
            );
        }
        state.joiner = Joiner::Detached;
    }

    /// Requests interruption of the fiber.
    ///
    /// Sets the fiber's request flag on its strand and, if the fiber is
    /// currently suspended with delivery enabled, fires its interrupter.
    /// Never suspends the caller and is not itself an interruption point.
    /// Requesting interruption of a terminated fiber has no effect.
    ///
    /// # Panics
    ///
    /// Panics if the handle was already consumed.
    pub fn interrupt(&self) {
        let fcb = self
            .fcb
            .as_ref()
            .expect("fiber handle already joined or detached");
        request_interrupt(Arc::clone(fcb));
    }

    /// After a successful join, reports whether the fiber terminated by an
    /// interruption that escaped its body.
    ///
    /// # Panics
    ///
    /// Panics if the fiber has not been joined.
    #[must_use]
    pub fn interruption_caught(&self) -> bool {
        assert!(
            self.joined,
            "interruption_caught queried before a completed join"
        );
        self.caught
    }
}

impl Drop for FiberHandle {
    fn drop(&mut self) {
        if let Some(fcb) = self.fcb.take() {
            // Abortive shutdown: stop the owning context, leave the
            // process-wide flag for post-hoc queries.
            error!(
                fiber = %fcb.id,
                "fiber handle dropped without join or detach; stopping the I/O context"
            );
            mark_context_aborted();
            self.strand.context().stop();
        }
    }
}

impl std::fmt::Debug for FiberHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FiberHandle")
            .field("id", &self.id)
            .field("consumed", &self.fcb.is_none())
            .field("joined", &self.joined)
            .finish()
    }
}
