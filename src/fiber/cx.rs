//! The this-fiber handle.
//!
//! [`FiberCx`] is the capability object a fiber body receives; it is the
//! only surface through which running fiber code interacts with the
//! runtime: voluntary yielding, awaiting asynchronous completions,
//! registering an interrupter, scoped interruption/suspension toggles and
//! spawning sibling fibers on the same strand.
//!
//! A `FiberCx` borrows the fiber's stack context, so it cannot leave the
//! fiber body or cross threads; anything that must outlive a suspension
//! (guards, tokens) internally holds the control block instead.
//!
//! # Suspension points
//!
//! [`yield_now`](FiberCx::yield_now), [`wait_for`](FiberCx::wait_for) (and
//! every operation built on it), [`FiberHandle::join`] and
//! [`Mutex::lock`] are the suspension points of the runtime. Each one:
//!
//! 1. aborts if suspension is forbidden in the current scope,
//! 2. delivers a pending interruption instead of suspending when delivery
//!    is enabled,
//! 3. otherwise parks the fiber and, on resume, delivers any interruption
//!    that arrived in between (again, only while enabled).
//!
//! [`FiberHandle::join`]: crate::fiber::FiberHandle::join
//! [`Mutex::lock`]: crate::sync::Mutex::lock

use std::sync::Arc;

use corosensei::Yielder;
use parking_lot::Mutex;
use tracing::trace;

use super::fcb::{Fcb, FiberId, FiberStatus, Interrupter};
use super::handle::{spawn_on, FiberHandle, FiberReturn};
use super::interrupt::{
    AllowSuspend, DisableInterruption, ForbidSuspend, Interrupt, RestoreInterruption,
};
use super::token::{CaptureError, Completer};
use crate::error::{Error, WaitError};
use crate::exec::Strand;

/// The in-fiber capability handle, passed by reference to the fiber body.
pub struct FiberCx<'y> {
    fcb: Arc<Fcb>,
    yielder: &'y Yielder<(), ()>,
}

impl<'y> FiberCx<'y> {
    pub(crate) fn new(fcb: Arc<Fcb>, yielder: &'y Yielder<(), ()>) -> Self {
        Self { fcb, yielder }
    }

    /// Returns this fiber's identifier.
    #[must_use]
    pub fn id(&self) -> FiberId {
        self.fcb.id
    }

    /// Returns the strand this fiber executes on.
    #[must_use]
    pub fn executor(&self) -> &Strand {
        self.fcb.strand()
    }

    /// Spawns another fiber on this fiber's strand.
    ///
    /// The two fibers are serialized with respect to each other; see
    /// [`spawn`](crate::fiber::spawn) for the other spawn forms.
    pub fn spawn<F, R>(&self, body: F) -> FiberHandle
    where
        F: FnOnce(&FiberCx<'_>) -> R + Send + 'static,
        R: FiberReturn,
    {
        spawn_on(self.executor(), body)
    }

    /// Voluntarily suspends, letting every handler already queued on the
    /// strand run before this fiber continues.
    ///
    /// This is a suspension point: a pending interruption is delivered
    /// here instead of rescheduling.
    ///
    /// # Errors
    ///
    /// Returns [`Interrupt`] if an interruption was delivered.
    pub fn yield_now(&self) -> Result<(), Interrupt> {
        self.assert_suspension_allowed("yield_now");
        self.deliver_pending()?;
        trace!(fiber = %self.id(), "yield");
        let fcb = Arc::clone(&self.fcb);
        self.fcb.strand().post(move || super::fcb::resume_fiber(&fcb));
        self.park();
        self.deliver_pending()
    }

    /// Parks this fiber until the completion handed to `initiate` is
    /// invoked, then returns the operation's result.
    ///
    /// This is the completion-token adapter: `initiate` receives a
    /// [`Completer`] and starts the asynchronous operation; the substrate
    /// invokes the completer (from any thread) when done, which resumes the
    /// fiber on its strand. The resume observes all side effects of the
    /// completion.
    ///
    /// This is a suspension point. If an interruption is delivered on
    /// resume, the operation's result is discarded; in particular a
    /// [`Cancelled`](crate::ErrorKind::Cancelled) result caused by an
    /// interrupter cancelling the operation surfaces as
    /// [`WaitError::Interrupted`], not as an operation error.
    ///
    /// # Errors
    ///
    /// [`WaitError::Interrupted`] if an interruption was delivered,
    /// [`WaitError::Op`] if the operation failed.
    pub fn wait_for<T, I>(&self, initiate: I) -> Result<T, WaitError>
    where
        T: Send + 'static,
        I: FnOnce(Completer<T>),
    {
        self.assert_suspension_allowed("asynchronous wait");
        self.deliver_pending()?;
        let cell = Arc::new(Mutex::new(None));
        let completer = Completer::new(Arc::clone(&cell), Arc::clone(&self.fcb));
        initiate(completer);
        self.park();
        self.deliver_pending()?;
        let result = cell
            .lock()
            .take()
            .expect("fiber resumed without a completion result");
        result.map_err(WaitError::Op)
    }

    /// Returns the error-slot variant of the completion token.
    ///
    /// Awaiting with the returned token writes an operation error into
    /// `slot` instead of returning it; only an interruption ends the wait
    /// with an `Err`. The slot is cleared on success.
    pub fn capture_error<'f, 'e>(
        &'f self,
        slot: &'e mut Option<Error>,
    ) -> CaptureError<'f, 'y, 'e> {
        CaptureError { fib: self, slot }
    }

    /// Installs the interrupter: a hook invoked on this fiber's strand if
    /// an interruption request lands while the fiber is suspended with
    /// delivery enabled. Used to accelerate cancellation of the operation
    /// the fiber is waiting on.
    ///
    /// The slot holds at most one hook and is cleared on every resume, so
    /// it must be re-armed before each wait it should cover.
    pub fn set_interrupter<F>(&self, hook: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.fcb.state.lock().interrupter = Some(Box::new(hook) as Interrupter);
    }

    /// Removes a previously installed interrupter, if any.
    pub fn clear_interrupter(&self) {
        self.fcb.state.lock().interrupter = None;
    }

    /// Returns true if an interruption has been requested and not yet
    /// delivered.
    #[must_use]
    pub fn interruption_requested(&self) -> bool {
        self.fcb.state.lock().interrupt_requested
    }

    /// Returns true if interruption delivery is currently enabled.
    #[must_use]
    pub fn interruption_enabled(&self) -> bool {
        self.fcb.state.lock().disable_depth == 0
    }

    /// Defers interruption delivery until the returned guard (and any
    /// nested ones) are dropped. A pending request stays queued.
    pub fn disable_interruption(&self) -> DisableInterruption {
        DisableInterruption::enter(Arc::clone(&self.fcb))
    }

    /// Within a disable scope, temporarily restores the delivery state
    /// that was in effect before `scope` was entered.
    pub fn restore_interruption<'a>(
        &self,
        scope: &'a DisableInterruption,
    ) -> RestoreInterruption<'a> {
        RestoreInterruption::enter(Arc::clone(&self.fcb), scope)
    }

    /// Forbids suspension until the returned guard is dropped. Reaching a
    /// suspension point inside the scope aborts with a panic.
    pub fn forbid_suspend(&self) -> ForbidSuspend {
        ForbidSuspend::enter(Arc::clone(&self.fcb))
    }

    /// Within a forbid scope, temporarily re-allows suspension.
    pub fn allow_suspend<'a>(&self, scope: &'a ForbidSuspend) -> AllowSuspend<'a> {
        AllowSuspend::enter(Arc::clone(&self.fcb), scope)
    }

    pub(crate) fn fcb_arc(&self) -> Arc<Fcb> {
        Arc::clone(&self.fcb)
    }

    /// Marks the fiber suspended and yields to the strand. The caller must
    /// already have arranged for a resume handler to be posted.
    pub(crate) fn park(&self) {
        self.fcb.state.lock().status = FiberStatus::Suspended;
        self.yielder.suspend(());
    }

    /// Consumes a pending interruption request if delivery is enabled.
    pub(crate) fn deliver_pending(&self) -> Result<(), Interrupt> {
        let mut state = self.fcb.state.lock();
        if state.interrupt_requested && state.disable_depth == 0 {
            state.interrupt_requested = false;
            drop(state);
            trace!(fiber = %self.id(), "interruption delivered");
            return Err(Interrupt::new());
        }
        Ok(())
    }

    /// Aborts if this fiber is inside a forbid-suspend scope.
    pub(crate) fn assert_suspension_allowed(&self, operation: &str) {
        let depth = self.fcb.state.lock().forbid_depth;
        assert!(
            depth == 0,
            "{operation} attempted while suspension is forbidden (depth {depth})",
        );
    }
}

impl std::fmt::Debug for FiberCx<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FiberCx").field("fcb", &self.fcb).finish()
    }
}
