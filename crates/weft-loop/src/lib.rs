//! Run loop for a designated thread.
//!
//! A [`Looper`] accepts zero-argument actions — optionally delayed,
//! optionally repeating — from any thread, and invokes them on the one
//! thread that called [`run`](Looper::run). Between actions it drives the
//! weft executor, so actions that complete awaitables resume their awaiters
//! on the same thread within the same turn.
//!
//! # Scheduling semantics
//!
//! - An action is never invoked from inside [`schedule`](Looper::schedule),
//!   even with zero delay.
//! - Among actions due at the same instant, tickets run in ascending order;
//!   `schedule(a); schedule(b)` implies `b` cannot run before `a`.
//! - A repeating action re-arms while its predicate returns true. With
//!   `catch_up` the next trigger advances by `interval` from the previous
//!   trigger (a stalled loop fires the backlog); without it the next trigger
//!   is `now + interval` (missed firings are skipped).
//! - [`cancel`](Looper::cancel) and [`cancel_all`](Looper::cancel_all) are
//!   best-effort: an action already mid-execution runs to completion (a
//!   cancelled repeating action will not re-arm).
//!
//! The loop sleeps on a condition variable until the earliest trigger time
//! and wakes immediately on new schedules. Sleeps are additionally bounded
//! by the executor's next timer deadline (and a 10 ms cap while tasks are
//! parked) so executor work is never starved.

use std::collections::HashSet;
use std::sync::{Condvar, Mutex};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use weft::{Action, Scheduler};

/// Unique id for a scheduled action; used to cancel it.
pub type Ticket = u64;

type RepeatingAction = Box<dyn FnMut() -> bool + Send + 'static>;

struct ManagedAction {
    ticket: Ticket,
    action: RepeatingAction,
    interval: Duration,
    catch_up: bool,
    trigger_time: Instant,
}

struct LoopState {
    next_ticket: Ticket,
    pending: Vec<ManagedAction>,
    /// Ticket currently mid-execution, if any.
    executing: Option<Ticket>,
    /// Tickets cancelled while mid-execution; they must not re-arm.
    killed: HashSet<Ticket>,
    quit: bool,
}

/// Single-threaded action loop. See the module docs.
pub struct Looper {
    name: String,
    state: Mutex<LoopState>,
    wakeup: Condvar,
    loop_thread: Mutex<Option<ThreadId>>,
}

impl Looper {
    pub fn new(name: impl Into<String>) -> Self {
        Looper {
            name: name.into(),
            state: Mutex::new(LoopState {
                next_ticket: 1,
                pending: Vec::new(),
                executing: None,
                killed: HashSet::new(),
                quit: false,
            }),
            wakeup: Condvar::new(),
            loop_thread: Mutex::new(None),
        }
    }

    /// Schedule an action to run on the loop thread after `delay_ms`
    /// milliseconds. Thread safe; never runs the action inline.
    pub fn schedule(&self, action: impl FnOnce() + Send + 'static, delay_ms: u64) -> Ticket {
        let mut action = Some(action);
        self.schedule_managed(
            Box::new(move || {
                if let Some(action) = action.take() {
                    action();
                }
                false
            }),
            delay_ms,
            Duration::ZERO,
            false,
        )
    }

    /// Schedule a repeating action: first run after `delay_ms`, re-armed
    /// every `interval_ms` while `pred` returns true. Thread safe.
    pub fn schedule_repeating(
        &self,
        pred: impl FnMut() -> bool + Send + 'static,
        delay_ms: u64,
        interval_ms: u64,
        catch_up: bool,
    ) -> Ticket {
        self.schedule_managed(
            Box::new(pred),
            delay_ms,
            Duration::from_millis(interval_ms),
            catch_up,
        )
    }

    fn schedule_managed(
        &self,
        action: RepeatingAction,
        delay_ms: u64,
        interval: Duration,
        catch_up: bool,
    ) -> Ticket {
        let trigger_time = Instant::now() + Duration::from_millis(delay_ms);
        let mut state = self.state.lock().unwrap();
        let ticket = state.next_ticket;
        state.next_ticket += 1;
        state.pending.push(ManagedAction {
            ticket,
            action,
            interval,
            catch_up,
            trigger_time,
        });
        self.wakeup.notify_one();
        ticket
    }

    /// Cancel a scheduled action. Returns false if the ticket is unknown or
    /// the action already ran (a one-shot) / already stopped (a repeater).
    pub fn cancel(&self, ticket: Ticket) -> bool {
        let mut state = self.state.lock().unwrap();
        if let Some(position) = state.pending.iter().position(|a| a.ticket == ticket) {
            state.pending.remove(position);
            return true;
        }
        if state.executing == Some(ticket) {
            // Mid-execution: runs to completion, but will not re-arm.
            state.killed.insert(ticket);
            return true;
        }
        false
    }

    /// Cancel every scheduled action.
    pub fn cancel_all(&self) {
        let mut state = self.state.lock().unwrap();
        state.pending.clear();
        if let Some(ticket) = state.executing {
            state.killed.insert(ticket);
        }
    }

    /// Request the loop to stop after the current turn, discarding pending
    /// actions. Must be called from the loop thread (typically from within
    /// an action).
    pub fn quit(&self) {
        self.assert_loop_thread("quit");
        let mut state = self.state.lock().unwrap();
        state.quit = true;
        state.pending.clear();
    }

    fn assert_loop_thread(&self, what: &str) {
        let current = thread::current().id();
        let registered = *self.loop_thread.lock().unwrap();
        assert_eq!(
            registered,
            Some(current),
            "looper '{}': {}() called from outside the loop",
            self.name,
            what
        );
    }

    /// Drive the loop on the current thread until [`quit`](Self::quit).
    ///
    /// This thread becomes the master: it runs every scheduled action and
    /// drives the weft executor, so awaitables completed by actions resume
    /// their awaiters here.
    pub fn run(&self) {
        *self.loop_thread.lock().unwrap() = Some(thread::current().id());
        // Bind the executor to this thread before the first action runs.
        weft::executor::current_executor();

        loop {
            // Let tasks woken by actions, timers, or remote completions make
            // progress before deciding how long to sleep.
            while weft::drive_cycle() {}

            // Collect due actions, or sleep until something could be due.
            let mut due: Vec<ManagedAction> = Vec::new();
            {
                let mut state = self.state.lock().unwrap();
                if state.quit {
                    state.quit = false;
                    state.pending.clear();
                    break;
                }
                let now = Instant::now();
                let mut keep = Vec::new();
                for action in state.pending.drain(..) {
                    if action.trigger_time <= now {
                        due.push(action);
                    } else {
                        keep.push(action);
                    }
                }
                state.pending = keep;

                if due.is_empty() {
                    let earliest = state.pending.iter().map(|a| a.trigger_time).min();
                    let timeout = self.sleep_bound(earliest, now);
                    let (state, _) = self.wakeup.wait_timeout(state, timeout).unwrap();
                    drop(state);
                    continue;
                }
            }

            // Equal trigger times run in ticket order.
            due.sort_by_key(|a| (a.trigger_time, a.ticket));

            let mut stop = false;
            for mut entry in due {
                self.state.lock().unwrap().executing = Some(entry.ticket);
                let repeat = (entry.action)();

                let mut state = self.state.lock().unwrap();
                state.executing = None;
                let killed = state.killed.remove(&entry.ticket);
                if repeat && !killed && !state.quit {
                    entry.trigger_time = if entry.catch_up {
                        entry.trigger_time + entry.interval
                    } else {
                        Instant::now() + entry.interval
                    };
                    state.pending.push(entry);
                }
                if state.quit {
                    stop = true;
                    break;
                }
            }
            if stop {
                let mut state = self.state.lock().unwrap();
                state.quit = false;
                state.pending.clear();
                break;
            }
        }

        *self.loop_thread.lock().unwrap() = None;
    }

    /// How long the loop may sleep: until the earliest pending trigger,
    /// bounded by the executor's next timer and a 10 ms cap so parked tasks
    /// are revisited promptly.
    fn sleep_bound(&self, earliest: Option<Instant>, now: Instant) -> Duration {
        let mut bound = Duration::from_millis(10);
        if let Some(earliest) = earliest {
            bound = bound.min(earliest.saturating_duration_since(now));
        }
        if let Some(timer) = weft::executor::next_timer_deadline() {
            bound = bound.min(timer);
        }
        bound.max(Duration::from_millis(1))
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Scheduler for Looper {
    fn post(&self, action: Action) {
        self.schedule(action, 0);
    }
}
