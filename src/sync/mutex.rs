//! Fiber-aware mutual exclusion within one strand.
//!
//! [`Mutex`] serializes critical sections *across suspension points*:
//! handlers on one strand never overlap, so a plain data structure needs no
//! lock at all, until a fiber suspends mid-update and another fiber of the
//! same strand runs. This mutex closes exactly that gap.
//!
//! # Semantics
//!
//! - Locking an unlocked mutex acquires it synchronously, without a trip
//!   through the strand queue.
//! - Locking a held mutex parks the fiber in a strictly FIFO wait queue.
//!   Interruption delivery is disabled for the duration of the `lock` call
//!   itself, so the caller never observes an interruption raised by the
//!   acquisition; a pending request stays queued and fires at the next
//!   eligible suspension point.
//! - Unlocking with waiters present transfers ownership directly to the
//!   oldest waiter and schedules its resume; the resumed fiber is the owner
//!   without re-checking.
//!
//! All users of one mutex must live on the mutex's strand; this mutex does
//! not synchronize fibers across strands.
//!
//! # Example
//!
//! ```ignore
//! let mutex = Arc::new(Mutex::new(&strand));
//! // in a fiber body:
//! let _guard = mutex.guard(&fib);
//! shared.push(value); // no other fiber of this strand is mid-update here
//! ```

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex as PlMutex;
use tracing::trace;

use crate::exec::Strand;
use crate::fiber::{active_fiber, resume_fiber, Fcb, FiberCx};

/// A fiber-aware, strictly FIFO mutex for fibers sharing one strand.
pub struct Mutex {
    strand: Strand,
    state: PlMutex<MutexState>,
}

struct MutexState {
    locked: bool,
    owner: Option<crate::fiber::FiberId>,
    waiters: VecDeque<Arc<Fcb>>,
}

impl Mutex {
    /// Creates an unlocked mutex bound to `strand`.
    #[must_use]
    pub fn new(strand: &Strand) -> Self {
        Self {
            strand: strand.clone(),
            state: PlMutex::new(MutexState {
                locked: false,
                owner: None,
                waiters: VecDeque::new(),
            }),
        }
    }

    /// Returns the strand this mutex serializes on.
    #[must_use]
    pub fn executor(&self) -> &Strand {
        &self.strand
    }

    /// Returns true if the mutex is currently held.
    #[must_use]
    pub fn is_locked(&self) -> bool {
        self.state.lock().locked
    }

    /// Returns the number of fibers parked waiting for the lock.
    #[must_use]
    pub fn waiters(&self) -> usize {
        self.state.lock().waiters.len()
    }

    /// Acquires the mutex, parking the calling fiber if it is held.
    ///
    /// Not an interruption point: a pending interruption request survives
    /// the call untouched and is delivered at the next eligible suspension
    /// point after the lock is held.
    ///
    /// # Panics
    ///
    /// Panics if called inside a forbid-suspend scope while the mutex is
    /// held by another fiber.
    pub fn lock(&self, fib: &FiberCx<'_>) {
        debug_assert!(
            *fib.executor() == self.strand,
            "mutex locked from a foreign strand"
        );
        {
            let mut state = self.state.lock();
            if !state.locked {
                state.locked = true;
                state.owner = Some(fib.id());
                return;
            }
            debug_assert!(state.owner != Some(fib.id()), "mutex is not recursive");
            fib.assert_suspension_allowed("mutex lock");
            state.waiters.push_back(fib.fcb_arc());
        }
        trace!(fiber = %fib.id(), "waiting for mutex");
        // A half-acquired state must not unwind out of here.
        let _deferred = fib.disable_interruption();
        fib.park();
        debug_assert!(
            self.state.lock().owner == Some(fib.id()),
            "fiber resumed from mutex wait without ownership"
        );
    }

    /// Acquires the mutex only if it can be done without parking.
    ///
    /// Returns true on acquisition.
    pub fn try_lock(&self, fib: &FiberCx<'_>) -> bool {
        debug_assert!(
            *fib.executor() == self.strand,
            "mutex locked from a foreign strand"
        );
        let mut state = self.state.lock();
        if state.locked {
            false
        } else {
            state.locked = true;
            state.owner = Some(fib.id());
            true
        }
    }

    /// Releases the mutex.
    ///
    /// Must be called by the owning fiber, on the mutex's strand. In debug
    /// builds a violation aborts; release builds do not check.
    ///
    /// If fibers are waiting, ownership passes to the oldest waiter and its
    /// resume is scheduled on the strand.
    pub fn unlock(&self) {
        let next = {
            let mut state = self.state.lock();
            debug_assert!(state.locked, "unlock of an unlocked mutex");
            debug_assert!(
                state.owner == active_fiber(),
                "mutex unlocked by a fiber that does not own it"
            );
            match state.waiters.pop_front() {
                Some(next) => {
                    state.owner = Some(next.id);
                    Some(next)
                }
                None => {
                    state.locked = false;
                    state.owner = None;
                    None
                }
            }
        };
        if let Some(next) = next {
            trace!(next = %next.id, "mutex ownership transferred");
            self.strand.post(move || resume_fiber(&next));
        }
    }

    /// Acquires the mutex and returns a guard that releases it on drop.
    pub fn guard<'m>(&'m self, fib: &FiberCx<'_>) -> MutexGuard<'m> {
        self.lock(fib);
        MutexGuard { mutex: self }
    }
}

impl std::fmt::Debug for Mutex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("Mutex")
            .field("locked", &state.locked)
            .field("owner", &state.owner)
            .field("waiters", &state.waiters.len())
            .finish()
    }
}

/// Scoped ownership of a [`Mutex`]; releases on drop.
#[must_use = "the mutex is released immediately if the guard is dropped"]
#[derive(Debug)]
pub struct MutexGuard<'m> {
    mutex: &'m Mutex,
}

impl Drop for MutexGuard<'_> {
    fn drop(&mut self) {
        self.mutex.unlock();
    }
}
