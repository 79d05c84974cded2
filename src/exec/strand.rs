//! The serializing executor.
//!
//! A [`Strand`] owns a FIFO queue of handlers layered on an
//! [`IoContext`](crate::exec::IoContext) and guarantees that at most one of
//! its handlers runs at any instant, regardless of how many threads drive
//! the context. Handlers posted to the same strand run in posting order.
//!
//! The strand is the unit of serialization for the fiber runtime: a fiber,
//! its resume handlers and its interrupt deliveries all execute on one
//! strand, which is what makes the fiber state machine race-free.

use std::cell::Cell;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::trace;

use super::context::{IoContext, Job};

static NEXT_STRAND_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    /// Identifier of the strand whose handler is running on this thread.
    static ACTIVE_STRAND: Cell<u64> = const { Cell::new(0) };
}

/// A serializing executor on top of an [`IoContext`].
#[derive(Clone)]
pub struct Strand {
    ctx: IoContext,
    inner: Arc<StrandInner>,
}

struct StrandInner {
    id: u64,
    queue: Mutex<StrandQueue>,
}

struct StrandQueue {
    jobs: VecDeque<Job>,
    /// True while a pump handler is queued on or running in the context.
    pumping: bool,
}

impl Strand {
    /// Creates a new strand executing on the given context.
    #[must_use]
    pub fn new(ctx: &IoContext) -> Self {
        Self {
            ctx: ctx.clone(),
            inner: Arc::new(StrandInner {
                id: NEXT_STRAND_ID.fetch_add(1, Ordering::Relaxed),
                queue: Mutex::new(StrandQueue {
                    jobs: VecDeque::new(),
                    pumping: false,
                }),
            }),
        }
    }

    /// Returns the owning I/O context.
    #[must_use]
    pub fn context(&self) -> &IoContext {
        &self.ctx
    }

    /// Queues a handler to run serialized on this strand, after all
    /// previously posted handlers.
    pub fn post(&self, f: impl FnOnce() + Send + 'static) {
        self.post_boxed(Box::new(f));
    }

    /// Runs the handler inline if the calling thread is already executing
    /// on this strand, otherwise posts it.
    pub fn dispatch(&self, f: impl FnOnce() + Send + 'static) {
        if self.running_on_this_thread() {
            f();
        } else {
            self.post_boxed(Box::new(f));
        }
    }

    /// Returns true if the calling thread is currently running a handler of
    /// this strand.
    #[must_use]
    pub fn running_on_this_thread(&self) -> bool {
        ACTIVE_STRAND.with(|active| active.get() == self.inner.id)
    }

    fn post_boxed(&self, job: Job) {
        let start_pump = {
            let mut queue = self.inner.queue.lock();
            queue.jobs.push_back(job);
            if queue.pumping {
                false
            } else {
                queue.pumping = true;
                true
            }
        };
        if start_pump {
            let strand = self.clone();
            self.ctx.post(Box::new(move || strand.pump()));
        }
    }

    /// Runs one queued handler, then reschedules itself if more are queued.
    ///
    /// One handler per context turn keeps strands fair with respect to each
    /// other when a single thread drives the context.
    fn pump(self) {
        let job = self.inner.queue.lock().jobs.pop_front();
        if let Some(job) = job {
            let _active = ActiveStrandGuard::enter(self.inner.id);
            trace!(strand = self.inner.id, "running strand handler");
            job();
        }
        let more = {
            let mut queue = self.inner.queue.lock();
            if queue.jobs.is_empty() {
                queue.pumping = false;
                false
            } else {
                true
            }
        };
        if more {
            let strand = self.clone();
            self.ctx.post(Box::new(move || strand.pump()));
        }
    }
}

impl PartialEq for Strand {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Strand {}

impl std::fmt::Debug for Strand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Strand")
            .field("id", &self.inner.id)
            .field("queued", &self.inner.queue.lock().jobs.len())
            .finish()
    }
}

/// Marks the current thread as running a strand handler, restoring the
/// previous marker on drop.
struct ActiveStrandGuard {
    prev: u64,
}

impl ActiveStrandGuard {
    fn enter(id: u64) -> Self {
        let prev = ACTIVE_STRAND.with(|active| active.replace(id));
        Self { prev }
    }
}

impl Drop for ActiveStrandGuard {
    fn drop(&mut self) {
        let prev = self.prev;
        ACTIVE_STRAND.with(|active| active.set(prev));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handlers_run_in_post_order() {
        let ctx = IoContext::new();
        let strand = Strand::new(&ctx);
        let order = Arc::new(Mutex::new(Vec::new()));
        for n in 0..5 {
            let order = Arc::clone(&order);
            strand.post(move || order.lock().push(n));
        }
        ctx.run();
        assert_eq!(*order.lock(), vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn dispatch_runs_inline_on_strand() {
        let ctx = IoContext::new();
        let strand = Strand::new(&ctx);
        let order = Arc::new(Mutex::new(Vec::new()));
        {
            let order = Arc::clone(&order);
            let strand2 = strand.clone();
            strand.post(move || {
                let inner = Arc::clone(&order);
                order.lock().push("outer");
                strand2.dispatch(move || inner.lock().push("inline"));
                order.lock().push("after");
            });
        }
        ctx.run();
        assert_eq!(*order.lock(), vec!["outer", "inline", "after"]);
    }

    #[test]
    fn dispatch_posts_from_foreign_thread() {
        let ctx = IoContext::new();
        let strand = Strand::new(&ctx);
        let hit = Arc::new(Mutex::new(false));
        {
            let hit = Arc::clone(&hit);
            strand.dispatch(move || *hit.lock() = true);
        }
        assert!(!*hit.lock());
        ctx.run();
        assert!(*hit.lock());
    }

    #[test]
    fn strands_interleave_on_one_context() {
        let ctx = IoContext::new();
        let a = Strand::new(&ctx);
        let b = Strand::new(&ctx);
        let order = Arc::new(Mutex::new(Vec::new()));
        for n in 0..3 {
            let order_a = Arc::clone(&order);
            a.post(move || order_a.lock().push(("a", n)));
            let order_b = Arc::clone(&order);
            b.post(move || order_b.lock().push(("b", n)));
        }
        ctx.run();
        let order = order.lock();
        // Per-strand FIFO holds even though the strands share the context.
        let a_seq: Vec<_> = order.iter().filter(|(s, _)| *s == "a").collect();
        let b_seq: Vec<_> = order.iter().filter(|(s, _)| *s == "b").collect();
        assert_eq!(a_seq, [&("a", 0), &("a", 1), &("a", 2)]);
        assert_eq!(b_seq, [&("b", 0), &("b", 1), &("b", 2)]);
    }

    #[test]
    fn running_on_this_thread_is_scoped() {
        let ctx = IoContext::new();
        let strand = Strand::new(&ctx);
        assert!(!strand.running_on_this_thread());
        let seen = Arc::new(Mutex::new(false));
        {
            let seen = Arc::clone(&seen);
            let strand2 = strand.clone();
            strand.post(move || *seen.lock() = strand2.running_on_this_thread());
        }
        ctx.run();
        assert!(*seen.lock());
        assert!(!strand.running_on_this_thread());
    }
}
