//! Completion tokens: binding asynchronous completions to fiber resumes.
//!
//! An asynchronous operation in the substrate is anything that accepts a
//! [`Completer`] and invokes it, from any thread, when the operation
//! finishes. Passing a completion token to such an operation parks the
//! calling fiber and arranges for the completion to resume it on the
//! fiber's strand.
//!
//! Two token shapes exist, a closed set:
//!
//! - `&FiberCx`: the plain token. Operation errors surface in the returned
//!   [`WaitError`].
//! - [`CaptureError`]: the error-slot token obtained from
//!   [`FiberCx::capture_error`]. Operation errors are written to the
//!   caller's slot instead, and only an interruption ends the wait early.
//!
//! # Example
//!
//! ```ignore
//! // Plain token: errors are returned.
//! timer.wait(&fib)?;
//!
//! // Error-slot token: errors land in `ec`.
//! let mut ec = None;
//! timer.wait(fib.capture_error(&mut ec))?;
//! if let Some(err) = ec { /* inspect */ }
//! ```

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::trace;

use super::cx::FiberCx;
use super::fcb::{resume_fiber, Fcb};
use crate::error::{Error, ErrorKind, WaitError};
use crate::exec::WorkGuard;
use crate::fiber::Interrupt;

pub(crate) type ResultCell<T> = Arc<Mutex<Option<Result<T, Error>>>>;

/// One-shot completion handle for an asynchronous operation awaited by a
/// fiber.
///
/// Completing posts the fiber's resume onto its strand; the resume handler
/// observes every side effect of the completion. A `Completer` dropped
/// without being invoked completes the wait with
/// [`ErrorKind::Abandoned`] so the fiber is never silently leaked in a
/// suspended state.
///
/// While a `Completer` is alive the owning I/O context counts the
/// operation as outstanding work and will not run out.
#[must_use = "dropping a completer fails the wait with `Abandoned`"]
pub struct Completer<T> {
    cell: ResultCell<T>,
    fcb: Arc<Fcb>,
    work: Option<WorkGuard>,
    fired: bool,
}

impl<T: Send + 'static> Completer<T> {
    pub(crate) fn new(cell: ResultCell<T>, fcb: Arc<Fcb>) -> Self {
        let work = fcb.strand().context().work();
        Self {
            cell,
            fcb,
            work: Some(work),
            fired: false,
        }
    }

    /// Completes the operation and schedules the fiber's resume.
    pub fn complete(mut self, result: Result<T, Error>) {
        self.fire(result);
    }

    fn fire(&mut self, result: Result<T, Error>) {
        if self.fired {
            return;
        }
        self.fired = true;
        *self.cell.lock() = Some(result);
        let fcb = Arc::clone(&self.fcb);
        // The work pin rides in the resume handler so the context stays
        // alive until the fiber has actually observed the completion.
        let work = self.work.take();
        trace!(fiber = %fcb.id, "completion posted");
        self.fcb.strand().post(move || {
            let _work = work;
            resume_fiber(&fcb);
        });
    }
}

impl<T> std::fmt::Debug for Completer<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Completer")
            .field("fiber", &self.fcb.id)
            .field("fired", &self.fired)
            .finish_non_exhaustive()
    }
}

impl<T> Drop for Completer<T> {
    fn drop(&mut self) {
        if self.fired {
            return;
        }
        // Same shape as `fire`, without the `T: Send` bound Drop cannot add.
        self.fired = true;
        *self.cell.lock() = Some(Err(Error::new(ErrorKind::Abandoned)
            .with_context("completion dropped without being invoked")));
        let fcb = Arc::clone(&self.fcb);
        let work = self.work.take();
        self.fcb.strand().post(move || {
            let _work = work;
            resume_fiber(&fcb);
        });
    }
}

/// A value usable as the completion argument of an asynchronous operation
/// awaited from a fiber.
///
/// `Output` differs per token shape; see the module docs.
pub trait WaitToken<T> {
    /// What the awaiting call returns.
    type Output;

    /// Initiates the operation with a fresh [`Completer`] and parks the
    /// fiber until it completes.
    fn wait_with<I>(self, initiate: I) -> Self::Output
    where
        I: FnOnce(Completer<T>);
}

impl<T: Send + 'static> WaitToken<T> for &FiberCx<'_> {
    type Output = Result<T, WaitError>;

    fn wait_with<I>(self, initiate: I) -> Self::Output
    where
        I: FnOnce(Completer<T>),
    {
        self.wait_for(initiate)
    }
}

/// The error-slot completion token; see [`FiberCx::capture_error`].
#[derive(Debug)]
pub struct CaptureError<'f, 'y, 'e> {
    pub(crate) fib: &'f FiberCx<'y>,
    pub(crate) slot: &'e mut Option<Error>,
}

impl<T: Send + 'static> WaitToken<T> for CaptureError<'_, '_, '_> {
    type Output = Result<Option<T>, Interrupt>;

    fn wait_with<I>(self, initiate: I) -> Self::Output
    where
        I: FnOnce(Completer<T>),
    {
        match self.fib.wait_for(initiate) {
            Ok(value) => {
                *self.slot = None;
                Ok(Some(value))
            }
            Err(WaitError::Op(err)) => {
                *self.slot = Some(err);
                Ok(None)
            }
            Err(WaitError::Interrupted(i)) => Err(i),
        }
    }
}
