//! The fiber control block and the strand-side resume driver.
//!
//! Everything here is internal. The control block ([`Fcb`]) is shared
//! between the fiber body, the external handle, pending completions and
//! waiting peers; every mutation of it happens either under its lock or,
//! for the stack context itself, inside a handler serialized by the fiber's
//! strand.

use core::fmt;
use std::any::Any;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use corosensei::stack::DefaultStack;
use corosensei::{Coroutine, CoroutineResult};
use parking_lot::Mutex;
use tracing::{debug, error, trace};

use crate::exec::{Strand, WorkGuard};

/// How a fiber body ended.
pub(crate) enum BodyOutcome {
    /// The body returned without a pending interruption escaping.
    Completed,
    /// An interruption escaped the body.
    Interrupted,
    /// The body panicked; the payload is re-raised at `join`.
    Panicked(Box<dyn Any + Send>),
}

impl fmt::Debug for BodyOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Completed => write!(f, "Completed"),
            Self::Interrupted => write!(f, "Interrupted"),
            Self::Panicked(_) => write!(f, "Panicked(..)"),
        }
    }
}

pub(crate) type FiberCoroutine = Coroutine<(), (), BodyOutcome, DefaultStack>;
pub(crate) type Interrupter = Box<dyn FnOnce() + Send + 'static>;

/// Identifier of a fiber, unique within the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FiberId(u64);

static NEXT_FIBER_ID: AtomicU64 = AtomicU64::new(1);

impl FiberId {
    fn next() -> Self {
        Self(NEXT_FIBER_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for FiberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "fiber-{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FiberStatus {
    /// Spawned, initial resume not yet run.
    Ready,
    /// The stack context is executing on the strand.
    Running,
    /// Parked at a suspension point; a resume handler will be posted by
    /// whichever event the fiber is waiting on.
    Suspended,
    /// The body returned.
    Terminated,
}

/// Who is waiting for the fiber to terminate.
pub(crate) enum Joiner {
    None,
    /// The handle was detached; nobody will observe the outcome.
    Detached,
    /// A join is parked; the callback wakes it on the joiner's strand.
    Waiting(Box<dyn FnOnce() + Send + 'static>),
}

pub(crate) struct FcbState {
    pub(crate) status: FiberStatus,
    pub(crate) coroutine: Option<FiberCoroutine>,
    pub(crate) interrupt_requested: bool,
    pub(crate) disable_depth: u32,
    pub(crate) forbid_depth: u32,
    pub(crate) interrupter: Option<Interrupter>,
    pub(crate) joiner: Joiner,
    pub(crate) outcome: Option<BodyOutcome>,
    pub(crate) work: Option<WorkGuard>,
}

/// The fiber control block.
pub(crate) struct Fcb {
    pub(crate) id: FiberId,
    pub(crate) name: Option<String>,
    strand: Strand,
    pub(crate) state: Mutex<FcbState>,
}

impl Fcb {
    pub(crate) fn new(strand: Strand, name: Option<String>) -> Arc<Self> {
        let work = strand.context().work();
        Arc::new(Self {
            id: FiberId::next(),
            name,
            strand,
            state: Mutex::new(FcbState {
                status: FiberStatus::Ready,
                coroutine: None,
                interrupt_requested: false,
                disable_depth: 0,
                forbid_depth: 0,
                interrupter: None,
                joiner: Joiner::None,
                outcome: None,
                work: Some(work),
            }),
        })
    }

    #[cfg(test)]
    pub(crate) fn for_tests(strand: Strand) -> Arc<Self> {
        Self::new(strand, None)
    }

    pub(crate) fn strand(&self) -> &Strand {
        &self.strand
    }
}

impl fmt::Debug for Fcb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("Fcb")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("status", &state.status)
            .field("interrupt_requested", &state.interrupt_requested)
            .field("disable_depth", &state.disable_depth)
            .field("forbid_depth", &state.forbid_depth)
            .finish_non_exhaustive()
    }
}

thread_local! {
    /// Identifier of the fiber whose stack context is running on this
    /// thread, or 0.
    static ACTIVE_FIBER: std::cell::Cell<u64> = const { std::cell::Cell::new(0) };
}

/// Returns the fiber currently executing on this thread, if any.
pub(crate) fn active_fiber() -> Option<FiberId> {
    let id = ACTIVE_FIBER.with(std::cell::Cell::get);
    (id != 0).then_some(FiberId(id))
}

struct ActiveFiberGuard {
    prev: u64,
}

impl ActiveFiberGuard {
    fn enter(id: FiberId) -> Self {
        let prev = ACTIVE_FIBER.with(|active| active.replace(id.0));
        Self { prev }
    }
}

impl Drop for ActiveFiberGuard {
    fn drop(&mut self) {
        let prev = self.prev;
        ACTIVE_FIBER.with(|active| active.set(prev));
    }
}

/// Re-enters the fiber's stack context. Must run on the fiber's strand.
///
/// On yield the stack context is stored back into the control block; on
/// return the fiber is finalized and any joiner is woken.
pub(crate) fn resume_fiber(fcb: &Arc<Fcb>) {
    let mut coroutine = {
        let mut state = fcb.state.lock();
        debug_assert!(
            matches!(state.status, FiberStatus::Ready | FiberStatus::Suspended),
            "resume of a {:?} fiber",
            state.status,
        );
        state.status = FiberStatus::Running;
        // The interrupter is armed per suspension; a resume consumes it.
        state.interrupter = None;
        state
            .coroutine
            .take()
            .expect("fiber resumed without a suspended stack context")
    };
    let _active = ActiveFiberGuard::enter(fcb.id);
    trace!(fiber = %fcb.id, "resuming");
    match coroutine.resume(()) {
        CoroutineResult::Yield(()) => {
            let mut state = fcb.state.lock();
            debug_assert_eq!(state.status, FiberStatus::Suspended);
            state.coroutine = Some(coroutine);
        }
        CoroutineResult::Return(outcome) => finalize(fcb, outcome),
    }
}

/// Records the outcome, wakes the joiner, releases the work pin.
fn finalize(fcb: &Arc<Fcb>, outcome: BodyOutcome) {
    let (joiner, work) = {
        let mut state = fcb.state.lock();
        debug_assert_eq!(state.disable_depth, 0, "unbalanced disable scope at exit");
        debug_assert_eq!(state.forbid_depth, 0, "unbalanced forbid scope at exit");
        state.status = FiberStatus::Terminated;
        let joiner = std::mem::replace(&mut state.joiner, Joiner::None);
        if let (Joiner::Detached, BodyOutcome::Panicked(payload)) = (&joiner, &outcome) {
            error!(
                fiber = %fcb.id,
                name = fcb.name.as_deref().unwrap_or(""),
                panic = panic_message(payload.as_ref()),
                "detached fiber panicked"
            );
        }
        state.outcome = Some(outcome);
        (joiner, state.work.take())
    };
    debug!(fiber = %fcb.id, "terminated");
    if let Joiner::Waiting(wake) = joiner {
        wake();
    }
    drop(work);
}

/// Records an interruption request on the target's strand and, if the
/// target is parked with delivery enabled, fires its interrupter.
pub(crate) fn request_interrupt(fcb: Arc<Fcb>) {
    let strand = fcb.strand().clone();
    strand.dispatch(move || {
        let hook = {
            let mut state = fcb.state.lock();
            if state.status == FiberStatus::Terminated {
                return;
            }
            state.interrupt_requested = true;
            if state.status == FiberStatus::Suspended && state.disable_depth == 0 {
                state.interrupter.take()
            } else {
                None
            }
        };
        debug!(fiber = %fcb.id, interrupter = hook.is_some(), "interruption requested");
        if let Some(hook) = hook {
            hook();
        }
    });
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s
    } else {
        "non-string panic payload"
    }
}
