//! The I/O-dispatching context.
//!
//! [`IoContext`] is the outer event loop the fiber runtime is layered on: a
//! FIFO queue of ready handlers, a queue of deadline handlers, and an
//! outstanding-work count that keeps [`IoContext::run`] alive while
//! operations are in flight but no handler is currently runnable.
//!
//! Handlers are not serialized by the context itself; serialization is the
//! job of [`Strand`](crate::exec::Strand). Several threads may call `run`
//! on the same context concurrently, in which case handlers of *different*
//! strands execute in parallel.
//!
//! # Work accounting
//!
//! `run` returns once the ready queue is empty and the outstanding-work
//! count is zero. Every spawned fiber and every pending completion holds a
//! [`WorkGuard`], so the loop cannot return while a fiber can still make
//! progress. A deadline whose completion was already consumed (a cancelled
//! timer) holds no work and does not delay shutdown.
//!
//! # Example
//!
//! ```ignore
//! let ctx = IoContext::new();
//! let handle = spindle::spawn(&ctx, |fib| { /* ... */ });
//! handle.detach();
//! ctx.run();
//! ```

use std::collections::{BinaryHeap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::{Condvar, Mutex};
use tracing::{debug, trace};

pub(crate) type Job = Box<dyn FnOnce() + Send + 'static>;

/// Set when a fiber handle is dropped without being joined or detached.
static CONTEXT_ABORTED: AtomicBool = AtomicBool::new(false);

/// Returns true if any I/O context was stopped because a fiber handle was
/// dropped without `join` or `detach`.
///
/// The flag is process-global and sticky: it reports that the abortive
/// shutdown happened, not that a context is currently stopped.
#[must_use]
pub fn context_aborted() -> bool {
    CONTEXT_ABORTED.load(Ordering::Acquire)
}

pub(crate) fn mark_context_aborted() {
    CONTEXT_ABORTED.store(true, Ordering::Release);
}

/// The I/O-dispatching context: ready handlers, deadlines, work count.
#[derive(Clone)]
pub struct IoContext {
    inner: Arc<ContextInner>,
}

struct ContextInner {
    state: Mutex<ContextState>,
    wakeup: Condvar,
}

struct ContextState {
    ready: VecDeque<Job>,
    deadlines: BinaryHeap<Deadline>,
    outstanding_work: usize,
    stopped: bool,
    deadline_seq: u64,
}

struct Deadline {
    when: Instant,
    seq: u64,
    fire: Job,
}

impl PartialEq for Deadline {
    fn eq(&self, other: &Self) -> bool {
        self.when == other.when && self.seq == other.seq
    }
}

impl Eq for Deadline {}

impl PartialOrd for Deadline {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Deadline {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // BinaryHeap is a max-heap; invert so the earliest deadline wins.
        other
            .when
            .cmp(&self.when)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl IoContext {
    /// Creates a new context with no pending handlers.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(ContextInner {
                state: Mutex::new(ContextState {
                    ready: VecDeque::new(),
                    deadlines: BinaryHeap::new(),
                    outstanding_work: 0,
                    stopped: false,
                    deadline_seq: 0,
                }),
                wakeup: Condvar::new(),
            }),
        }
    }

    /// Runs handlers until the context is stopped or runs out of work.
    ///
    /// Returns the number of handlers executed by this call. May be invoked
    /// from several threads at once; each thread then runs handlers.
    pub fn run(&self) -> usize {
        let mut executed = 0usize;
        loop {
            let Some(job) = self.next_job() else {
                break;
            };
            job();
            executed += 1;
            let mut state = self.inner.state.lock();
            state.outstanding_work -= 1;
            if state.outstanding_work == 0 && state.ready.is_empty() {
                drop(state);
                self.inner.wakeup.notify_all();
            }
        }
        trace!(executed, "run loop finished");
        executed
    }

    /// Blocks until a job is runnable, counting it as in-flight work.
    fn next_job(&self) -> Option<Job> {
        let mut state = self.inner.state.lock();
        loop {
            if state.stopped {
                return None;
            }
            if let Some(job) = state.ready.pop_front() {
                state.outstanding_work += 1;
                return Some(job);
            }
            let now = Instant::now();
            if state
                .deadlines
                .peek()
                .is_some_and(|deadline| deadline.when <= now)
            {
                let deadline = state.deadlines.pop().expect("deadline heap emptied");
                state.outstanding_work += 1;
                return Some(deadline.fire);
            }
            if state.outstanding_work == 0 {
                return None;
            }
            match state.deadlines.peek().map(|d| d.when) {
                Some(when) => {
                    self.inner.wakeup.wait_until(&mut state, when);
                }
                None => {
                    self.inner.wakeup.wait(&mut state);
                }
            }
        }
    }

    /// Stops the context. Pending and future handlers are not run; threads
    /// inside [`IoContext::run`] return as soon as their current handler
    /// finishes.
    pub fn stop(&self) {
        let mut state = self.inner.state.lock();
        if !state.stopped {
            debug!("context stopped");
            state.stopped = true;
        }
        drop(state);
        self.inner.wakeup.notify_all();
    }

    /// Returns true if [`IoContext::stop`] has been called.
    #[must_use]
    pub fn stopped(&self) -> bool {
        self.inner.state.lock().stopped
    }

    /// Queues a handler for execution.
    pub(crate) fn post(&self, job: Job) {
        let mut state = self.inner.state.lock();
        state.ready.push_back(job);
        drop(state);
        self.inner.wakeup.notify_one();
    }

    /// Queues a handler to fire once `when` has passed.
    pub(crate) fn post_at(&self, when: Instant, fire: Job) {
        let mut state = self.inner.state.lock();
        let seq = state.deadline_seq;
        state.deadline_seq += 1;
        state.deadlines.push(Deadline { when, seq, fire });
        drop(state);
        // The new deadline may be earlier than the one a runner is sleeping on.
        self.inner.wakeup.notify_all();
    }

    /// Pins the context: [`IoContext::run`] will not return while the guard
    /// is alive.
    pub(crate) fn work(&self) -> WorkGuard {
        let mut state = self.inner.state.lock();
        state.outstanding_work += 1;
        WorkGuard { ctx: self.clone() }
    }
}

impl Default for IoContext {
    fn default() -> Self {
        Self::new()
    }
}

impl PartialEq for IoContext {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for IoContext {}

impl std::fmt::Debug for IoContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("IoContext")
            .field("ready", &state.ready.len())
            .field("deadlines", &state.deadlines.len())
            .field("outstanding_work", &state.outstanding_work)
            .field("stopped", &state.stopped)
            .finish()
    }
}

/// Keeps an [`IoContext`] alive while in scope.
pub(crate) struct WorkGuard {
    ctx: IoContext,
}

impl Drop for WorkGuard {
    fn drop(&mut self) {
        let mut state = self.ctx.inner.state.lock();
        state.outstanding_work -= 1;
        let idle = state.outstanding_work == 0;
        drop(state);
        if idle {
            self.ctx.inner.wakeup.notify_all();
        }
    }
}

impl std::fmt::Debug for WorkGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkGuard").finish_non_exhaustive()
    }
}
