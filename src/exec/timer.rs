//! Deadline timer: the reference asynchronous operation of the substrate.
//!
//! [`Timer`] is a single-deadline waitable object in the style of the
//! substrate interface the fiber runtime consumes: arm it with
//! [`expires_after`](Timer::expires_after), then await it with a fiber
//! completion token. [`Timer::cancel`] completes a pending wait immediately
//! with [`ErrorKind::Cancelled`], which is what a fiber interrupter
//! typically does to cut a long wait short.
//!
//! One wait may be outstanding at a time; re-arming or re-waiting cancels
//! the previous wait.
//!
//! # Example
//!
//! ```ignore
//! let timer = Timer::new(fib.executor().context());
//! timer.expires_after(Duration::from_secs(1));
//! timer.wait(&fib)?;
//! ```

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::trace;

use super::context::IoContext;
use crate::error::{Error, ErrorKind, WaitError};
use crate::fiber::{Completer, FiberCx, WaitToken};

type WaitSlot = Arc<Mutex<Option<Completer<()>>>>;

/// A deadline timer bound to an [`IoContext`].
///
/// Clones share the same deadline and pending wait.
#[derive(Clone)]
pub struct Timer {
    ctx: IoContext,
    state: Arc<Mutex<TimerState>>,
}

struct TimerState {
    deadline: Option<Instant>,
    pending: Option<WaitSlot>,
}

impl Timer {
    /// Creates a timer with no deadline set. Waiting on it completes
    /// immediately.
    #[must_use]
    pub fn new(ctx: &IoContext) -> Self {
        Self {
            ctx: ctx.clone(),
            state: Arc::new(Mutex::new(TimerState {
                deadline: None,
                pending: None,
            })),
        }
    }

    /// Returns the owning context.
    #[must_use]
    pub fn context(&self) -> &IoContext {
        &self.ctx
    }

    /// Sets the deadline `delay` from now, cancelling any pending wait.
    pub fn expires_after(&self, delay: Duration) {
        self.expires_at(Instant::now() + delay);
    }

    /// Sets an absolute deadline, cancelling any pending wait.
    pub fn expires_at(&self, when: Instant) {
        let superseded = {
            let mut state = self.state.lock();
            state.deadline = Some(when);
            state.pending.take()
        };
        complete_cancelled(superseded, "timer expiry changed");
    }

    /// Completes a pending wait with [`ErrorKind::Cancelled`]. Has no
    /// effect if no wait is pending; the deadline itself is kept.
    pub fn cancel(&self) {
        let pending = self.state.lock().pending.take();
        complete_cancelled(pending, "timer wait cancelled");
    }

    /// Suspends the calling fiber until the deadline passes (or the wait is
    /// cancelled), using any fiber completion token.
    pub fn wait<Tok>(&self, token: Tok) -> Tok::Output
    where
        Tok: WaitToken<()>,
    {
        token.wait_with(|completer| self.arm(completer))
    }

    fn arm(&self, completer: Completer<()>) {
        let mut state = self.state.lock();
        let superseded = state.pending.take();
        let now = Instant::now();
        match state.deadline {
            Some(when) if when > now => {
                let slot: WaitSlot = Arc::new(Mutex::new(Some(completer)));
                state.pending = Some(Arc::clone(&slot));
                drop(state);
                trace!(in_ms = (when - now).as_millis() as u64, "timer armed");
                self.ctx.post_at(
                    when,
                    Box::new(move || {
                        if let Some(completer) = slot.lock().take() {
                            completer.complete(Ok(()));
                        }
                    }),
                );
            }
            // No deadline, or it already passed.
            _ => {
                drop(state);
                completer.complete(Ok(()));
            }
        }
        complete_cancelled(superseded, "superseded by a newer timer wait");
    }
}

fn complete_cancelled(slot: Option<WaitSlot>, context: &str) {
    if let Some(slot) = slot {
        if let Some(completer) = slot.lock().take() {
            completer.complete(Err(Error::new(ErrorKind::Cancelled).with_context(context)));
        }
    }
}

impl std::fmt::Debug for Timer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("Timer")
            .field("deadline", &state.deadline)
            .field("pending", &state.pending.is_some())
            .finish()
    }
}

/// Suspends the calling fiber for `duration`.
///
/// Convenience over a one-shot [`Timer`] on the fiber's own context.
///
/// # Errors
///
/// [`WaitError::Interrupted`] if the fiber is interrupted while sleeping.
pub fn sleep(fib: &FiberCx<'_>, duration: Duration) -> Result<(), WaitError> {
    let timer = Timer::new(fib.executor().context());
    timer.expires_after(duration);
    timer.wait(fib)
}
