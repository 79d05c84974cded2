//! The interruption marker and the scoped interruption/suspension toggles.
//!
//! Interruption is deferred cancellation: [`interrupt`] on a fiber handle
//! only records a request, and the request is delivered at the next
//! suspension point reached while delivery is enabled. The guards in this
//! module adjust, per fiber and with strict nesting, whether delivery is
//! enabled ([`DisableInterruption`] / [`RestoreInterruption`]) and whether
//! suspending is allowed at all ([`ForbidSuspend`] / [`AllowSuspend`]).
//!
//! All four are RAII guards: the counter they touch is restored on drop,
//! including a drop that happens while unwinding.
//!
//! [`interrupt`]: crate::fiber::FiberHandle::interrupt

use core::fmt;
use std::sync::Arc;

use super::fcb::Fcb;

/// Delivered at a suspension point when a pending interruption request is
/// accepted.
///
/// An `Interrupt` that reaches the end of the fiber body terminates the
/// fiber with the interrupted flag set; this is the normal way out and not
/// a failure. Catching it earlier is allowed and simply means the fiber
/// terminates normally.
///
/// This type intentionally implements neither [`std::error::Error`] nor any
/// conversion into [`crate::Error`], so generic error plumbing cannot
/// swallow an interruption without naming it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use = "an ignored interruption leaves the fiber running"]
pub struct Interrupt(());

impl Interrupt {
    pub(crate) const fn new() -> Self {
        Self(())
    }
}

impl fmt::Display for Interrupt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "fiber interrupted")
    }
}

/// Defers interruption delivery while in scope.
///
/// While at least one `DisableInterruption` is alive on a fiber, a pending
/// interruption request stays queued instead of being delivered at
/// suspension points. Scopes nest.
#[must_use = "interruption is re-enabled immediately if the guard is dropped"]
#[derive(Debug)]
pub struct DisableInterruption {
    fcb: Arc<Fcb>,
    pub(crate) prior_depth: u32,
}

impl DisableInterruption {
    pub(crate) fn enter(fcb: Arc<Fcb>) -> Self {
        let prior_depth = {
            let mut state = fcb.state.lock();
            let prior = state.disable_depth;
            state.disable_depth += 1;
            prior
        };
        Self { fcb, prior_depth }
    }
}

impl Drop for DisableInterruption {
    fn drop(&mut self) {
        let mut state = self.fcb.state.lock();
        debug_assert!(state.disable_depth > 0, "disable scope count underflow");
        state.disable_depth -= 1;
    }
}

/// Temporarily restores the interruption state that was in effect before
/// the referenced [`DisableInterruption`] scope was entered.
///
/// On drop, the state active at construction comes back, so a
/// `disable { restore { .. } }` pairing round-trips exactly.
#[must_use = "the prior state is reinstated immediately if the guard is dropped"]
#[derive(Debug)]
pub struct RestoreInterruption<'a> {
    fcb: Arc<Fcb>,
    saved_depth: u32,
    _scope: std::marker::PhantomData<&'a DisableInterruption>,
}

impl<'a> RestoreInterruption<'a> {
    pub(crate) fn enter(fcb: Arc<Fcb>, scope: &'a DisableInterruption) -> Self {
        let saved_depth = {
            let mut state = fcb.state.lock();
            let saved = state.disable_depth;
            state.disable_depth = scope.prior_depth;
            saved
        };
        Self {
            fcb,
            saved_depth,
            _scope: std::marker::PhantomData,
        }
    }
}

impl Drop for RestoreInterruption<'_> {
    fn drop(&mut self) {
        self.fcb.state.lock().disable_depth = self.saved_depth;
    }
}

/// Forbids suspension while in scope.
///
/// Reaching any suspension point while a `ForbidSuspend` is alive is a
/// contract violation and aborts with a panic. Scopes nest. This is also
/// the "nothing borrowed" form of
/// [`ExclusiveRef`](crate::sync::ExclusiveRef).
#[must_use = "suspension is re-allowed immediately if the guard is dropped"]
#[derive(Debug)]
pub struct ForbidSuspend {
    fcb: Arc<Fcb>,
    pub(crate) prior_depth: u32,
}

impl ForbidSuspend {
    pub(crate) fn enter(fcb: Arc<Fcb>) -> Self {
        let prior_depth = {
            let mut state = fcb.state.lock();
            let prior = state.forbid_depth;
            state.forbid_depth += 1;
            prior
        };
        Self { fcb, prior_depth }
    }
}

impl Drop for ForbidSuspend {
    fn drop(&mut self) {
        let mut state = self.fcb.state.lock();
        debug_assert!(state.forbid_depth > 0, "forbid scope count underflow");
        state.forbid_depth -= 1;
    }
}

/// Temporarily re-allows suspension inside the referenced [`ForbidSuspend`]
/// scope, restoring the forbidding state on drop.
#[must_use = "suspension is forbidden again immediately if the guard is dropped"]
#[derive(Debug)]
pub struct AllowSuspend<'a> {
    fcb: Arc<Fcb>,
    saved_depth: u32,
    _scope: std::marker::PhantomData<&'a ForbidSuspend>,
}

impl<'a> AllowSuspend<'a> {
    pub(crate) fn enter(fcb: Arc<Fcb>, scope: &'a ForbidSuspend) -> Self {
        let saved_depth = {
            let mut state = fcb.state.lock();
            let saved = state.forbid_depth;
            state.forbid_depth = scope.prior_depth;
            saved
        };
        Self {
            fcb,
            saved_depth,
            _scope: std::marker::PhantomData,
        }
    }
}

impl Drop for AllowSuspend<'_> {
    fn drop(&mut self) {
        self.fcb.state.lock().forbid_depth = self.saved_depth;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::{IoContext, Strand};

    fn test_fcb() -> Arc<Fcb> {
        let ctx = IoContext::new();
        Fcb::for_tests(Strand::new(&ctx))
    }

    #[test]
    fn interrupt_displays() {
        assert_eq!(Interrupt::new().to_string(), "fiber interrupted");
    }

    #[test]
    fn disable_scope_balances() {
        let fcb = test_fcb();
        assert_eq!(fcb.state.lock().disable_depth, 0);
        {
            let _outer = DisableInterruption::enter(Arc::clone(&fcb));
            assert_eq!(fcb.state.lock().disable_depth, 1);
            {
                let _inner = DisableInterruption::enter(Arc::clone(&fcb));
                assert_eq!(fcb.state.lock().disable_depth, 2);
            }
            assert_eq!(fcb.state.lock().disable_depth, 1);
        }
        assert_eq!(fcb.state.lock().disable_depth, 0);
    }

    #[test]
    fn restore_round_trips_exactly() {
        let fcb = test_fcb();
        let outer = DisableInterruption::enter(Arc::clone(&fcb));
        let inner = DisableInterruption::enter(Arc::clone(&fcb));
        assert_eq!(fcb.state.lock().disable_depth, 2);
        {
            let _restore = RestoreInterruption::enter(Arc::clone(&fcb), &inner);
            // Back to the state before `inner`: still disabled by `outer`.
            assert_eq!(fcb.state.lock().disable_depth, 1);
        }
        assert_eq!(fcb.state.lock().disable_depth, 2);
        drop(inner);
        {
            let _restore = RestoreInterruption::enter(Arc::clone(&fcb), &outer);
            assert_eq!(fcb.state.lock().disable_depth, 0);
        }
        assert_eq!(fcb.state.lock().disable_depth, 1);
        drop(outer);
        assert_eq!(fcb.state.lock().disable_depth, 0);
    }

    #[test]
    fn forbid_and_allow_compose() {
        let fcb = test_fcb();
        let forbid = ForbidSuspend::enter(Arc::clone(&fcb));
        assert_eq!(fcb.state.lock().forbid_depth, 1);
        {
            let _allow = AllowSuspend::enter(Arc::clone(&fcb), &forbid);
            assert_eq!(fcb.state.lock().forbid_depth, 0);
        }
        assert_eq!(fcb.state.lock().forbid_depth, 1);
        drop(forbid);
        assert_eq!(fcb.state.lock().forbid_depth, 0);
    }
}
