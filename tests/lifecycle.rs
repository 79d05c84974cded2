//! Fiber lifecycle: the spawn forms, join (same and cross strand), detach,
//! and panic containment.

mod common;

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use common::init_test_logging;
use parking_lot::Mutex as PlMutex;
use spindle::{Builder, Interrupt, IoContext, Strand};

#[test]
fn spawned_fiber_runs_to_completion() {
    init_test_logging();
    let ctx = IoContext::new();
    let ran = Arc::new(AtomicBool::new(false));
    {
        let ran = Arc::clone(&ran);
        spindle::spawn(&ctx, move |_fib| {
            ran.store(true, Ordering::SeqCst);
        })
        .detach();
    }
    ctx.run();
    assert!(ran.load(Ordering::SeqCst));
}

#[test]
fn fibers_on_one_strand_alternate_at_yields() {
    init_test_logging();
    let ctx = IoContext::new();
    let strand = Strand::new(&ctx);
    let order = Arc::new(PlMutex::new(Vec::new()));
    for name in ["a", "b"] {
        let order = Arc::clone(&order);
        spindle::spawn_on(&strand, move |fib| -> Result<(), Interrupt> {
            for round in 0..3 {
                order.lock().push((name, round));
                fib.yield_now()?;
            }
            Ok(())
        })
        .detach();
    }
    ctx.run();
    let order = order.lock();
    assert_eq!(
        *order,
        vec![
            ("a", 0),
            ("b", 0),
            ("a", 1),
            ("b", 1),
            ("a", 2),
            ("b", 2),
        ]
    );
}

#[test]
fn nested_spawn_inherits_the_strand() {
    init_test_logging();
    let ctx = IoContext::new();
    let strand = Strand::new(&ctx);
    let inherited = Arc::new(AtomicBool::new(false));
    {
        let inherited = Arc::clone(&inherited);
        let outer_strand = strand.clone();
        spindle::spawn_on(&strand, move |fib| {
            let inherited = Arc::clone(&inherited);
            let outer_strand = outer_strand.clone();
            let child = fib.spawn(move |child_fib| {
                inherited.store(
                    *child_fib.executor() == outer_strand,
                    Ordering::SeqCst,
                );
            });
            child.detach();
        })
        .detach();
    }
    ctx.run();
    assert!(inherited.load(Ordering::SeqCst));
}

#[test]
fn join_reports_normal_termination() {
    init_test_logging();
    let ctx = IoContext::new();
    let strand = Strand::new(&ctx);
    let observed = Arc::new(AtomicUsize::new(0));

    let worker = {
        let observed = Arc::clone(&observed);
        spindle::spawn_on(&strand, move |fib| -> Result<(), Interrupt> {
            fib.yield_now()?;
            observed.store(7, Ordering::SeqCst);
            Ok(())
        })
    };
    let after_join = Arc::new(AtomicUsize::new(0));
    {
        let after_join = Arc::clone(&after_join);
        let observed = Arc::clone(&observed);
        spindle::spawn_on(&strand, move |fib| {
            let mut worker = worker;
            worker.join(fib).expect("joiner was not interrupted");
            assert!(!worker.interruption_caught());
            after_join.store(observed.load(Ordering::SeqCst), Ordering::SeqCst);
        })
        .detach();
    }
    ctx.run();
    // The join completed only after the worker's store.
    assert_eq!(after_join.load(Ordering::SeqCst), 7);
}

#[test]
fn join_across_strands() {
    init_test_logging();
    let ctx = IoContext::new();
    let done = Arc::new(AtomicBool::new(false));
    let worker = {
        let done = Arc::clone(&done);
        spindle::spawn(&ctx, move |fib| -> Result<(), spindle::WaitError> {
            spindle::sleep(fib, Duration::from_millis(20))?;
            done.store(true, Ordering::SeqCst);
            Ok(())
        })
    };
    let joined_after_done = Arc::new(AtomicBool::new(false));
    {
        let joined_after_done = Arc::clone(&joined_after_done);
        let done = Arc::clone(&done);
        spindle::spawn(&ctx, move |fib| {
            let mut worker = worker;
            worker.join(fib).expect("joiner was not interrupted");
            joined_after_done.store(done.load(Ordering::SeqCst), Ordering::SeqCst);
        })
        .detach();
    }
    ctx.run();
    assert!(joined_after_done.load(Ordering::SeqCst));
}

#[test]
fn join_of_terminated_fiber_returns_immediately() {
    init_test_logging();
    let ctx = IoContext::new();
    let strand = Strand::new(&ctx);
    let worker = spindle::spawn_on(&strand, |_fib| {});
    {
        spindle::spawn_on(&strand, move |fib| -> Result<(), Interrupt> {
            let mut worker = worker;
            // Let the worker terminate first.
            fib.yield_now()?;
            fib.yield_now()?;
            worker.join(fib)?;
            assert!(!worker.interruption_caught());
            Ok(())
        })
        .detach();
    }
    ctx.run();
}

#[test]
fn panic_in_joined_fiber_resurfaces_at_join() {
    init_test_logging();
    let ctx = IoContext::new();
    let worker = spindle::spawn(&ctx, |_fib| {
        panic!("boom in fiber");
    });
    let caught = Arc::new(PlMutex::new(None));
    {
        let caught = Arc::clone(&caught);
        spindle::spawn(&ctx, move |fib| {
            let mut worker = worker;
            let result = catch_unwind(AssertUnwindSafe(|| worker.join(fib)));
            let payload = result.expect_err("join should re-raise the panic");
            let message = payload
                .downcast_ref::<&'static str>()
                .copied()
                .unwrap_or("other payload");
            *caught.lock() = Some(message.to_owned());
        })
        .detach();
    }
    ctx.run();
    assert_eq!(caught.lock().as_deref(), Some("boom in fiber"));
}

#[test]
fn detached_fiber_finishes_on_its_own() {
    init_test_logging();
    let ctx = IoContext::new();
    let finished = Arc::new(AtomicBool::new(false));
    {
        let finished = Arc::clone(&finished);
        let handle = spindle::spawn(&ctx, move |fib| -> Result<(), spindle::WaitError> {
            spindle::sleep(fib, Duration::from_millis(10))?;
            finished.store(true, Ordering::SeqCst);
            Ok(())
        });
        handle.detach();
    }
    ctx.run();
    assert!(finished.load(Ordering::SeqCst));
}

#[test]
fn builder_sets_name_and_stack_size() {
    init_test_logging();
    let ctx = IoContext::new();
    let strand = Strand::new(&ctx);
    let ran = Arc::new(AtomicBool::new(false));
    {
        let ran = Arc::clone(&ran);
        let handle = Builder::new()
            .name("worker")
            .stack_size(256 * 1024)
            .spawn_on(&strand, move |fib| -> Result<(), Interrupt> {
                fib.yield_now()?;
                ran.store(true, Ordering::SeqCst);
                Ok(())
            })
            .expect("spawn failed");
        handle.detach();
    }
    ctx.run();
    assert!(ran.load(Ordering::SeqCst));
}

#[test]
fn handle_reports_identity_and_executor() {
    init_test_logging();
    let ctx = IoContext::new();
    let strand = Strand::new(&ctx);
    let a = spindle::spawn_on(&strand, |_fib| {});
    let b = spindle::spawn_on(&strand, |_fib| {});
    assert_ne!(a.id(), b.id());
    assert!(*a.executor() == strand);
    a.detach();
    b.detach();
    ctx.run();
}
