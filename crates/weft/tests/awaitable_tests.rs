//! Awaitable state machine and completer behaviour.

use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::thread;
use std::time::Duration;

use weft::{block_on, start_async, Awaitable, Failure, Fault};

/// Drop probe for observing forced unwinding.
struct Probe(Rc<Cell<bool>>);

impl Drop for Probe {
    fn drop(&mut self) {
        self.0.set(true);
    }
}

// ---------------------------------------------------------------------------
// External-driven lifecycle
// ---------------------------------------------------------------------------

#[test]
fn immediate_completion() {
    let ticket = Awaitable::new("ticket");
    let completer = ticket.take_completer();

    assert!(!ticket.is_done());
    completer.complete();
    assert!(ticket.is_done());
    assert!(ticket.did_complete());
    assert!(!ticket.did_fail());

    // Awaiting a terminal awaitable returns without suspending, repeatedly.
    block_on(async {
        ticket.wait().await.unwrap();
        ticket.wait().await.unwrap();
    });
}

#[test]
#[should_panic(expected = "completer already taken")]
fn take_completer_twice_panics() {
    let ticket = Awaitable::new("ticket");
    let _first = ticket.take_completer();
    let _second = ticket.take_completer();
}

#[test]
fn first_completer_call_wins() {
    let ticket = Awaitable::new("ticket");
    let completer = ticket.take_completer();
    let copy = completer.clone();

    copy.complete();
    completer.fail(Fault::msg("too late"));

    assert!(ticket.did_complete());
    assert!(!ticket.did_fail());
    assert!(ticket.failure().is_none());
}

#[test]
fn completer_calls_after_terminal_are_noops() {
    let ticket = Awaitable::new("ticket");
    let completer = ticket.take_completer();

    completer.fail(Fault::msg("broken"));
    assert!(ticket.did_fail());

    completer.complete();
    completer.fail(Fault::msg("again"));
    assert!(ticket.did_fail());
    assert!(!ticket.did_complete());
}

#[test]
fn dropping_awaitable_expires_every_completer_copy() {
    let ticket = Awaitable::new("ticket");
    let completer = ticket.take_completer();
    let copy = completer.clone();
    assert!(!completer.is_expired());

    drop(ticket);
    assert!(completer.is_expired());
    assert!(copy.is_expired());

    // Late calls are silently dropped.
    completer.complete();
    copy.fail(Fault::msg("late"));
}

#[test]
fn failure_identity_is_stable_across_awaits() {
    let ticket = Awaitable::new("ticket");
    ticket.take_completer().fail(Fault::msg("broken"));

    let first = block_on(async { ticket.wait().await }).unwrap_err();
    let second = block_on(async { ticket.wait().await }).unwrap_err();
    assert!(Failure::ptr_eq(&first, &second));
    assert_eq!(second.to_string(), "broken");
}

#[test]
fn wrap_adapts_raw_callbacks() {
    let ok = Awaitable::new("ok");
    let callback = ok.take_completer().wrap(|| Ok(()));
    callback();
    assert!(ok.did_complete());

    let bad = Awaitable::new("bad");
    let callback = bad.take_completer().wrap_arg(|code: i32| {
        if code == 0 {
            Ok(())
        } else {
            Err(Fault::msg(format!("code {}", code)))
        }
    });
    callback(3);
    assert!(bad.did_fail());
    assert_eq!(bad.failure().unwrap().to_string(), "code 3");

    // Wrapped callback against a dropped awaitable does nothing.
    let gone = Awaitable::new("gone");
    let callback = gone.take_completer().wrap(|| Ok(()));
    drop(gone);
    callback();
}

// ---------------------------------------------------------------------------
// Rendezvous and ordering
// ---------------------------------------------------------------------------

#[test]
fn cross_thread_rendezvous_resumes_once() {
    let resumes = Rc::new(Cell::new(0));
    let counted = resumes.clone();

    block_on(async move {
        let ticket = Awaitable::new("ticket");
        let completer = ticket.take_completer();

        thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            completer.complete();
        });

        ticket.wait().await.unwrap();
        counted.set(counted.get() + 1);
    });

    assert_eq!(resumes.get(), 1);
}

#[test]
fn on_done_fires_before_awaiter_resumes() {
    let order: Rc<RefCell<Vec<&'static str>>> = Rc::new(RefCell::new(Vec::new()));

    let ticket = Rc::new(Awaitable::new("ticket"));
    let completer = ticket.take_completer();

    let log = order.clone();
    ticket.on_done(move || log.borrow_mut().push("done-callback"));

    let log = order.clone();
    let shared = ticket.clone();
    let waiter = start_async("waiter", async move {
        shared.wait().await?;
        log.borrow_mut().push("awaiter-resumed");
        Ok(())
    });

    block_on(async {
        completer.complete();
        // The completer call returns before the awaiter runs.
        order.borrow_mut().push("complete-returned");
        waiter.wait().await.unwrap();
    });

    assert_eq!(
        *order.borrow(),
        vec!["done-callback", "complete-returned", "awaiter-resumed"]
    );
}

#[test]
fn on_done_runs_immediately_when_already_terminal() {
    let ticket = Awaitable::new("ticket");
    ticket.take_completer().complete();

    let fired = Rc::new(Cell::new(false));
    let f = fired.clone();
    ticket.on_done(move || f.set(true));
    assert!(fired.get());
}

// ---------------------------------------------------------------------------
// Body-driven lifecycle
// ---------------------------------------------------------------------------

#[test]
fn body_runs_up_to_first_suspension_before_start_returns() {
    let order: Rc<RefCell<Vec<&'static str>>> = Rc::new(RefCell::new(Vec::new()));

    let gate = Rc::new(Awaitable::new("gate"));
    let completer = gate.take_completer();

    order.borrow_mut().push("before-start");
    let log = order.clone();
    let shared = gate.clone();
    let work = start_async("work", async move {
        log.borrow_mut().push("body-entered");
        shared.wait().await?;
        log.borrow_mut().push("body-finished");
        Ok(())
    });
    order.borrow_mut().push("start-returned");

    block_on(async {
        completer.complete();
        work.wait().await.unwrap();
    });

    assert_eq!(
        *order.borrow(),
        vec!["before-start", "body-entered", "start-returned", "body-finished"]
    );
}

#[test]
fn body_completing_without_suspending_leaves_terminal_awaitable() {
    let work = start_async("quick", async { Ok(()) });
    assert!(work.did_complete());
}

#[test]
fn body_failure_is_stored_and_rethrown() {
    let work = start_async("doomed", async { Err(Fault::msg("body failed")) });
    assert!(work.did_fail());

    let first = block_on(async { work.wait().await }).unwrap_err();
    let second = block_on(async { work.wait().await }).unwrap_err();
    assert!(Failure::ptr_eq(&first, &second));
}

#[test]
fn child_failure_propagates_through_body() {
    let inner = Awaitable::new("inner");
    inner.take_completer().fail(Fault::msg("inner broke"));

    let outer = start_async("outer", async move {
        inner.wait().await?;
        Ok(())
    });

    let failure = block_on(async { outer.wait().await }).unwrap_err();
    assert_eq!(failure.to_string(), "inner broke");
}

#[test]
fn dropping_awaitable_unwinds_suspended_body() {
    let unwound = Rc::new(Cell::new(false));
    let probe = Probe(unwound.clone());

    let inner = Awaitable::new("inner");
    let completer = inner.take_completer();

    let work = start_async("leak", async move {
        let _probe = probe;
        inner.wait().await?;
        Ok(())
    });
    assert!(!unwound.get());

    drop(work);

    // The body's drop glue ran, taking `inner` with it.
    assert!(unwound.get());
    assert!(completer.is_expired());
    completer.complete(); // silently dropped
}

#[test]
fn dropping_external_awaitable_fails_registered_awaiter() {
    let doomed = Awaitable::new("doomed");
    let _completer = doomed.take_completer();

    // The wait future keeps the shared state alive independently of the
    // awaitable handle.
    let wait = doomed.wait();
    let waiter = start_async("waiter", async move {
        wait.await?;
        Ok(())
    });

    drop(doomed);

    // The drop delivered an abandonment failure rather than leaking the
    // parked awaiter.
    let failure = block_on(async { waiter.wait().await }).unwrap_err();
    assert!(failure.to_string().contains("dropped before completion"));
}

#[test]
#[should_panic(expected = "awaited from two tasks")]
fn awaiting_from_two_tasks_panics() {
    let shared = Rc::new(Awaitable::new("shared"));
    let _completer = shared.take_completer();

    let first = shared.clone();
    let _first = start_async("first", async move {
        first.wait().await?;
        Ok(())
    });
    let second = shared.clone();
    let _second = start_async("second", async move {
        second.wait().await?;
        Ok(())
    });
}

#[test]
fn nested_bodies_compose() {
    let result = block_on(async {
        let inner = start_async("inner", async { Ok(()) });
        let outer = start_async("outer", async move {
            inner.wait().await?;
            Ok(())
        });
        outer.wait().await
    });
    assert!(result.is_ok());
}

#[test]
fn async_delay_completes_after_duration() {
    let start = std::time::Instant::now();
    let nap = weft::async_delay(Duration::from_millis(20));
    block_on(async { nap.wait().await }).unwrap();
    assert!(start.elapsed() >= Duration::from_millis(20));
}
