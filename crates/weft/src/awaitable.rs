//! Awaitable operations and completer handles.
//!
//! An [`Awaitable`] wraps a unit of work expected to finish in the future.
//! Inside an async body, [`Awaitable::wait`] appears to block until the
//! operation completes or fails; the enclosing thread keeps processing other
//! tasks in the meantime.
//!
//! Two construction paths exist:
//!
//! - **External-driven**: [`Awaitable::new`] plus [`Awaitable::take_completer`].
//!   The outside world (a callback, another thread, a run-loop action) drives
//!   the operation to a terminal state through the [`Completer`].
//! - **Body-driven**: [`start_async`] spawns an async body as a task on the
//!   current thread's executor and binds it to a fresh awaitable. The body
//!   runs up to its first suspension before `start_async` returns; returning
//!   `Ok` completes the awaitable, returning `Err` fails it.
//!
//! The awaitable owns its operation: dropping it cancels a live body (drop
//! glue unwinds through every suspension point) and expires every
//! outstanding completer.
//!
//! # State machine
//!
//! `Initial → Running → (Completed | Failed)`, monotonic. Terminal state and
//! the stored failure never change afterwards; `wait()` on a terminal
//! awaitable resolves immediately, returning the same [`Failure`] identity
//! on every call.
//!
//! # Threading
//!
//! Awaitables are pinned to their creating thread. The one cross-thread
//! surface is [`Completer`]: it may be sent to and fired from any thread.
//! Off-thread outcomes are parked in a mutexed inbox cell and applied the
//! next time the owner thread observes the awaitable; the completion
//! callbacks and the awaiter wake always run on the owner thread.

use std::cell::RefCell;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::task::{Context, Poll, Waker};
use std::thread::{self, ThreadId};

use pin_project_lite::pin_project;

use crate::error::{Failure, Fault};
use crate::executor::{self, TaskId};
use crate::wf_debug;

// =============================================================================
// Inner state
// =============================================================================

pub(crate) enum State {
    Initial,
    Running,
    Completed,
    Failed(Failure),
}

impl State {
    fn is_terminal(&self) -> bool {
        matches!(self, State::Completed | State::Failed(_))
    }
}

struct Registration {
    cookie: u64,
    waker: Waker,
}

pub(crate) struct Inner {
    tag: String,
    state: State,
    awaiter: Option<Registration>,
    on_done: Vec<Box<dyn FnOnce()>>,
    bound_task: Option<TaskId>,
    inbox: Option<Arc<CompleterCell>>,
    completer_taken: bool,
}

static NEXT_COOKIE: AtomicU64 = AtomicU64::new(1);

fn next_cookie() -> u64 {
    NEXT_COOKIE.fetch_add(1, Ordering::Relaxed)
}

// =============================================================================
// Completer inbox cell
// =============================================================================

/// Back-pointer to the owner-side state. Only ever upgraded on the owner
/// thread (checked against `CompleterCell::owner`).
struct TargetRef(std::rc::Weak<RefCell<Inner>>);

unsafe impl Send for TargetRef {}
unsafe impl Sync for TargetRef {}

/// The shared indirection cell between an awaitable and its completers.
///
/// The awaitable holds the only `Arc`; completers hold `Weak`s, so dropping
/// the awaitable expires every outstanding completer. The first outcome to
/// land seals the cell — later calls are no-ops.
struct CompleterCell {
    owner: ThreadId,
    target: TargetRef,
    sealed: AtomicBool,
    outcome: Mutex<Option<Result<(), Fault>>>,
    notify: Mutex<Option<Waker>>,
}

/// Register `cookie` as the single awaiter. Panics if another task is
/// already registered (awaiting from two tasks is a programming error).
fn register_awaiter(inner: &Rc<RefCell<Inner>>, cookie: u64, waker: Waker) {
    let mut guard = inner.borrow_mut();
    match &mut guard.awaiter {
        Some(registration) if registration.cookie == cookie => {
            registration.waker = waker;
        }
        Some(_) => panic!("awaitable '{}' awaited from two tasks at once", guard.tag),
        None => {
            if matches!(guard.state, State::Initial) {
                guard.state = State::Running;
            }
            guard.awaiter = Some(Registration { cookie, waker });
        }
    }
}

fn unregister_awaiter(inner: &Rc<RefCell<Inner>>, cookie: u64) {
    let mut guard = inner.borrow_mut();
    if let Some(registration) = &guard.awaiter {
        if registration.cookie == cookie {
            guard.awaiter = None;
        }
    }
}

/// Park `waker` in the inbox cell so an off-thread completion can wake the
/// awaiter. Must happen before checking the state (lost-wake order).
fn store_notify(inner: &Rc<RefCell<Inner>>, waker: &Waker) {
    let guard = inner.borrow();
    if let Some(cell) = guard.inbox.as_ref() {
        *cell.notify.lock().unwrap() = Some(waker.clone());
    }
}

/// Apply a parked off-thread outcome, if any. Owner thread only.
pub(crate) fn sync_inbox(inner: &Rc<RefCell<Inner>>) {
    let outcome = {
        let guard = inner.borrow();
        if guard.state.is_terminal() {
            return;
        }
        match guard.inbox.as_ref() {
            Some(cell) => cell.outcome.lock().unwrap().take(),
            None => return,
        }
    };
    if let Some(outcome) = outcome {
        finish(inner, outcome);
    }
}

/// Move the awaitable to a terminal state, run completion callbacks, then
/// wake the registered awaiter. No-op if already terminal (first wins).
pub(crate) fn finish(inner: &Rc<RefCell<Inner>>, outcome: Result<(), Fault>) {
    let (callbacks, awaiter) = {
        let mut guard = inner.borrow_mut();
        if guard.state.is_terminal() {
            return;
        }
        match outcome {
            Ok(()) => {
                wf_debug!("complete awaitable '{}'", guard.tag);
                guard.state = State::Completed;
            }
            Err(fault) => {
                wf_debug!("fail awaitable '{}': {}", guard.tag, fault);
                guard.state = State::Failed(Failure::new(fault));
            }
        }
        if let Some(cell) = guard.inbox.as_ref() {
            cell.sealed.store(true, Ordering::SeqCst);
        }
        (std::mem::take(&mut guard.on_done), guard.awaiter.take())
    };
    // Completion callbacks fire before the awaiter is woken, outside any
    // borrow so they may inspect the awaitable.
    for callback in callbacks {
        callback();
    }
    if let Some(registration) = awaiter {
        registration.waker.wake();
    }
}

// =============================================================================
// Awaitable
// =============================================================================

/// Handle to an operation expected to finish in the future. See the module
/// docs for the lifecycle.
pub struct Awaitable {
    inner: Rc<RefCell<Inner>>,
}

impl Awaitable {
    /// Create an external-driven awaitable in the Initial state. Drive it
    /// with the completer from [`take_completer`](Self::take_completer).
    pub fn new(tag: impl Into<String>) -> Self {
        let inner = Rc::new(RefCell::new(Inner {
            tag: tag.into(),
            state: State::Initial,
            awaiter: None,
            on_done: Vec::new(),
            bound_task: None,
            inbox: None,
            completer_taken: false,
        }));
        let cell = Arc::new(CompleterCell {
            owner: thread::current().id(),
            target: TargetRef(Rc::downgrade(&inner)),
            sealed: AtomicBool::new(false),
            outcome: Mutex::new(None),
            notify: Mutex::new(None),
        });
        inner.borrow_mut().inbox = Some(cell);
        Awaitable { inner }
    }

    /// Issue the completer for this awaitable. At most one completer is ever
    /// issued; it may then be cloned freely (copies are equally entitled,
    /// first call wins).
    ///
    /// # Panics
    ///
    /// Panics on a second call, or on a body-driven awaitable (whose
    /// completer is considered already taken).
    pub fn take_completer(&self) -> Completer {
        let mut guard = self.inner.borrow_mut();
        assert!(
            !guard.completer_taken,
            "completer already taken for awaitable '{}'",
            guard.tag
        );
        guard.completer_taken = true;
        let cell = guard
            .inbox
            .as_ref()
            .expect("external-driven awaitable has an inbox");
        Completer { cell: Arc::downgrade(cell) }
    }

    /// Resolve once the operation reaches a terminal state.
    ///
    /// Completed → `Ok(())`, immediately and repeatably. Failed → `Err` with
    /// the same [`Failure`] identity on every call.
    ///
    /// # Panics
    ///
    /// Panics if a second task awaits while another is already registered.
    pub fn wait(&self) -> WaitFuture {
        WaitFuture {
            inner: self.inner.clone(),
            cookie: next_cookie(),
            registered: false,
        }
    }

    pub fn did_complete(&self) -> bool {
        sync_inbox(&self.inner);
        matches!(self.inner.borrow().state, State::Completed)
    }

    pub fn did_fail(&self) -> bool {
        sync_inbox(&self.inner);
        matches!(self.inner.borrow().state, State::Failed(_))
    }

    pub fn is_done(&self) -> bool {
        sync_inbox(&self.inner);
        self.inner.borrow().state.is_terminal()
    }

    /// The stored failure, present iff the awaitable failed.
    pub fn failure(&self) -> Option<Failure> {
        sync_inbox(&self.inner);
        match &self.inner.borrow().state {
            State::Failed(failure) => Some(failure.clone()),
            _ => None,
        }
    }

    pub fn tag(&self) -> String {
        self.inner.borrow().tag.clone()
    }

    pub fn set_tag(&self, tag: impl Into<String>) {
        self.inner.borrow_mut().tag = tag.into();
    }

    /// Register a callback to run when the awaitable reaches a terminal
    /// state, before any awaiter is resumed. Runs immediately if already
    /// terminal.
    pub fn on_done(&self, callback: impl FnOnce() + 'static) {
        sync_inbox(&self.inner);
        let mut callback = Some(callback);
        {
            let mut guard = self.inner.borrow_mut();
            if !guard.state.is_terminal() {
                guard.on_done.push(Box::new(callback.take().unwrap()));
            }
        }
        if let Some(callback) = callback {
            callback();
        }
    }

    // -- crate-internal hooks for the combinators ----------------------------

    pub(crate) fn poke(&self) {
        sync_inbox(&self.inner);
    }

    pub(crate) fn is_terminal_now(&self) -> bool {
        self.inner.borrow().state.is_terminal()
    }

    pub(crate) fn store_notify(&self, waker: &Waker) {
        store_notify(&self.inner, waker);
    }

    pub(crate) fn register_awaiter(&self, cookie: u64, waker: Waker) {
        register_awaiter(&self.inner, cookie, waker);
    }

    pub(crate) fn unregister_awaiter(&self, cookie: u64) {
        unregister_awaiter(&self.inner, cookie);
    }
}

impl Drop for Awaitable {
    fn drop(&mut self) {
        sync_inbox(&self.inner);

        let (status, bound) = {
            let mut guard = self.inner.borrow_mut();
            let status = match &guard.state {
                State::Completed => "completed",
                State::Failed(_) => "failed",
                _ => "interrupted",
            };
            let bound = if guard.state.is_terminal() { None } else { guard.bound_task.take() };
            (status, bound)
        };
        wf_debug!("destroy awaitable '{}' ({})", self.inner.borrow().tag, status);

        if let Some(task) = bound {
            // Force-unwind the body: dropping its future runs Drop glue
            // through every suspension point.
            wf_debug!("force unwinding body of '{}'", self.inner.borrow().tag);
            executor::cancel(task);
        }

        let leaked_awaiter = {
            let guard = self.inner.borrow();
            !guard.state.is_terminal() && guard.awaiter.is_some()
        };
        if leaked_awaiter {
            // A task is still parked on us; failing wakes it instead of
            // leaking it.
            wf_debug!("awaitable '{}' destroyed while awaited", self.inner.borrow().tag);
        }
        if !self.inner.borrow().state.is_terminal() {
            finish(&self.inner, Err(Fault::Abandoned));
        }

        // Expire every outstanding completer.
        self.inner.borrow_mut().inbox = None;
    }
}

// =============================================================================
// WaitFuture
// =============================================================================

/// Future returned by [`Awaitable::wait`].
pub struct WaitFuture {
    inner: Rc<RefCell<Inner>>,
    cookie: u64,
    registered: bool,
}

impl Future for WaitFuture {
    type Output = Result<(), Failure>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();

        // Park the waker in the inbox before reading the state, so an
        // off-thread completion landing in between still wakes us.
        store_notify(&this.inner, cx.waker());
        sync_inbox(&this.inner);

        let state_poll = {
            let guard = this.inner.borrow();
            match &guard.state {
                State::Completed => Some(Ok(())),
                State::Failed(failure) => Some(Err(failure.clone())),
                _ => None,
            }
        };
        match state_poll {
            Some(result) => {
                this.registered = false;
                Poll::Ready(result)
            }
            None => {
                register_awaiter(&this.inner, this.cookie, cx.waker().clone());
                this.registered = true;
                Poll::Pending
            }
        }
    }
}

impl Drop for WaitFuture {
    fn drop(&mut self) {
        if self.registered {
            let mut guard = self.inner.borrow_mut();
            if let Some(registration) = &guard.awaiter {
                if registration.cookie == self.cookie {
                    guard.awaiter = None;
                }
            }
        }
    }
}

// =============================================================================
// Completer
// =============================================================================

/// Weak handle that drives an external awaitable to a terminal state.
///
/// Clonable and sendable; all copies are equally entitled and the first
/// outcome wins. Calls on an expired handle (awaitable dropped) or a sealed
/// one (already terminal) are no-ops.
#[derive(Clone)]
pub struct Completer {
    cell: Weak<CompleterCell>,
}

impl Completer {
    fn deliver(&self, outcome: Result<(), Fault>) {
        let Some(cell) = self.cell.upgrade() else { return };
        if cell.sealed.swap(true, Ordering::SeqCst) {
            return;
        }
        *cell.outcome.lock().unwrap() = Some(outcome);

        if thread::current().id() == cell.owner {
            // Owner thread: apply the transition right away.
            if let Some(inner) = cell.target.0.upgrade() {
                sync_inbox(&inner);
            }
        } else if let Some(waker) = cell.notify.lock().unwrap().take() {
            // Foreign thread: wake the awaiter; it applies the transition.
            waker.wake();
        }
    }

    /// Transition the awaitable to Completed. No-op if expired or terminal.
    pub fn complete(&self) {
        self.deliver(Ok(()));
    }

    /// Transition the awaitable to Failed with `fault`. No-op if expired or
    /// terminal.
    pub fn fail(&self, fault: Fault) {
        self.deliver(Err(fault));
    }

    /// True once this handle can no longer affect the awaitable: it was
    /// dropped, or an outcome has already been delivered.
    pub fn is_expired(&self) -> bool {
        match self.cell.upgrade() {
            None => true,
            Some(cell) => cell.sealed.load(Ordering::SeqCst),
        }
    }

    /// Adapt a raw nullary callback: runs `f`, completing on `Ok` and
    /// failing on `Err`. Does nothing if this completer has expired.
    pub fn wrap<F>(&self, f: F) -> impl FnOnce()
    where
        F: FnOnce() -> Result<(), Fault>,
    {
        let completer = self.clone();
        move || {
            if completer.is_expired() {
                return;
            }
            match f() {
                Ok(()) => completer.complete(),
                Err(fault) => completer.fail(fault),
            }
        }
    }

    /// One-argument variant of [`wrap`](Self::wrap), for callback APIs that
    /// pass a payload.
    pub fn wrap_arg<A, F>(&self, f: F) -> impl FnOnce(A)
    where
        F: FnOnce(A) -> Result<(), Fault>,
    {
        let completer = self.clone();
        move |arg: A| {
            if completer.is_expired() {
                return;
            }
            match f(arg) {
                Ok(()) => completer.complete(),
                Err(fault) => completer.fail(fault),
            }
        }
    }
}

// =============================================================================
// start_async
// =============================================================================

pin_project! {
    /// Wrapper that settles the bound awaitable when the body returns.
    struct BoundBody<F> {
        #[pin]
        body: F,
        target: std::rc::Weak<RefCell<Inner>>,
    }
}

impl<F> Future for BoundBody<F>
where
    F: Future<Output = Result<(), Fault>>,
{
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        let this = self.project();
        match this.body.poll(cx) {
            Poll::Ready(result) => {
                if let Some(inner) = this.target.upgrade() {
                    inner.borrow_mut().bound_task = None;
                    finish(&inner, result);
                }
                Poll::Ready(())
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Run an async body as an awaitable operation.
///
/// The body is spawned as a task on the current thread's executor and
/// **polled once before this function returns** — it runs up to its first
/// suspension immediately. A body that never suspends leaves the awaitable
/// already terminal.
///
/// Returning `Ok(())` completes the awaitable; returning `Err` fails it.
/// Dropping the awaitable while the body is suspended cancels the task: the
/// body's drop glue unwinds through every suspension point, and no
/// completion is delivered.
pub fn start_async<F>(tag: impl Into<String>, body: F) -> Awaitable
where
    F: Future<Output = Result<(), Fault>> + 'static,
{
    let tag = tag.into();
    wf_debug!("start awaitable '{}'", tag);
    let inner = Rc::new(RefCell::new(Inner {
        tag,
        state: State::Running,
        awaiter: None,
        on_done: Vec::new(),
        bound_task: None,
        inbox: None,
        completer_taken: true,
    }));
    let task = executor::spawn(BoundBody {
        body,
        target: Rc::downgrade(&inner),
    });
    inner.borrow_mut().bound_task = Some(task);
    executor::poll_task_now(task);
    Awaitable { inner }
}
