//! Timer waits through fiber completion tokens: the countdown scenario,
//! cancellation, the error-slot token and re-arming.

mod common;

use std::sync::Arc;
use std::time::{Duration, Instant};

use common::init_test_logging;
use parking_lot::Mutex as PlMutex;
use spindle::{ErrorKind, Interrupt, IoContext, Timer, WaitError};

#[test]
fn countdown_emits_in_order() {
    init_test_logging();
    let ctx = IoContext::new();
    let output = Arc::new(PlMutex::new(String::new()));
    let started = Instant::now();
    {
        let output = Arc::clone(&output);
        spindle::spawn(&ctx, move |fib| -> Result<(), WaitError> {
            let timer = Timer::new(fib.executor().context());
            for n in (1..=3).rev() {
                timer.expires_after(Duration::from_millis(30));
                timer.wait(fib)?;
                output.lock().push_str(&format!("{n}... "));
            }
            output.lock().push('\n');
            Ok(())
        })
        .detach();
    }
    ctx.run();
    assert_eq!(*output.lock(), "3... 2... 1... \n");
    assert!(started.elapsed() >= Duration::from_millis(90));
}

#[test]
fn sleep_waits_at_least_the_requested_time() {
    init_test_logging();
    let ctx = IoContext::new();
    let started = Instant::now();
    spindle::spawn(&ctx, |fib| -> Result<(), WaitError> {
        spindle::sleep(fib, Duration::from_millis(40))?;
        Ok(())
    })
    .detach();
    ctx.run();
    assert!(started.elapsed() >= Duration::from_millis(40));
}

#[test]
fn wait_with_no_deadline_completes_immediately() {
    init_test_logging();
    let ctx = IoContext::new();
    let completed = Arc::new(PlMutex::new(false));
    {
        let completed = Arc::clone(&completed);
        spindle::spawn(&ctx, move |fib| -> Result<(), WaitError> {
            let timer = Timer::new(fib.executor().context());
            timer.wait(fib)?;
            *completed.lock() = true;
            Ok(())
        })
        .detach();
    }
    ctx.run();
    assert!(*completed.lock());
}

#[test]
fn error_slot_token_captures_cancellation() {
    init_test_logging();
    let ctx = IoContext::new();
    let timer = Timer::new(&ctx);
    timer.expires_after(Duration::from_secs(60));
    let seen = Arc::new(PlMutex::new(Vec::new()));
    {
        let timer = timer.clone();
        let seen = Arc::clone(&seen);
        spindle::spawn(&ctx, move |fib| -> Result<(), Interrupt> {
            let mut slot = None;
            let value = timer.wait(fib.capture_error(&mut slot))?;
            seen.lock()
                .push((value.is_some(), slot.map(|e| e.kind())));

            // A successful wait leaves the slot clear.
            timer.expires_after(Duration::from_millis(10));
            let mut slot = None;
            let value = timer.wait(fib.capture_error(&mut slot))?;
            seen.lock()
                .push((value.is_some(), slot.map(|e| e.kind())));
            Ok(())
        })
        .detach();
    }
    {
        let timer = timer.clone();
        spindle::spawn(&ctx, move |fib| -> Result<(), WaitError> {
            spindle::sleep(fib, Duration::from_millis(10))?;
            timer.cancel();
            Ok(())
        })
        .detach();
    }
    ctx.run();
    assert_eq!(
        *seen.lock(),
        vec![(false, Some(ErrorKind::Cancelled)), (true, None)]
    );
}

#[test]
fn rearming_cancels_the_pending_wait() {
    init_test_logging();
    let ctx = IoContext::new();
    let timer = Timer::new(&ctx);
    timer.expires_after(Duration::from_secs(60));
    let observed = Arc::new(PlMutex::new(None));
    let started = Instant::now();
    {
        let timer = timer.clone();
        let observed = Arc::clone(&observed);
        spindle::spawn(&ctx, move |fib| {
            match timer.wait(fib) {
                Err(WaitError::Op(err)) => *observed.lock() = Some(err.kind()),
                other => panic!("expected the superseded wait to fail, got {other:?}"),
            }
        })
        .detach();
    }
    {
        let timer = timer.clone();
        spindle::spawn(&ctx, move |fib| -> Result<(), WaitError> {
            spindle::sleep(fib, Duration::from_millis(10))?;
            timer.expires_after(Duration::from_millis(5));
            Ok(())
        })
        .detach();
    }
    ctx.run();
    assert_eq!(*observed.lock(), Some(ErrorKind::Cancelled));
    assert!(started.elapsed() < Duration::from_secs(5));
}
