//! Slab-based single-threaded task executor.
//!
//! One executor per thread, registered in a global table so that wakers can
//! pack `(executor_idx, task_id)` into the `RawWaker` data pointer — waking a
//! task allocates nothing.
//!
//! # Design
//!
//! Tasks are boxed futures stored in a growable slab of `TaskSlot`s. Each
//! slot carries a generation counter so a stale [`TaskId`] (slot reused after
//! free) is detected and ignored. A ready queue holds the ids of tasks that
//! have been woken; [`drive_cycle`] pops and polls them one at a time.
//!
//! Polling **takes the future out of its slot** before running it, so user
//! code inside a poll may freely re-enter the executor: spawn new tasks,
//! cancel others, register timers. Cancelling the task that is currently
//! being polled marks its slot `CANCELLED`; the future is dropped once its
//! poll returns.
//!
//! Wakes from the owning thread flip the slot PENDING → READY directly.
//! Wakes from any other thread go through a lock-free remote queue and
//! unpark the owner — this is what lets a completer fired on a worker
//! thread resume an awaiter inside [`block_on`].
//!
//! # Safety invariants
//!
//! - `with_executor` borrows are NEVER nested. All polls, future drops, and
//!   waker wakes happen OUTSIDE `with_executor` closures.
//! - Slots are touched only by the owner thread. Remote threads touch only
//!   the lock-free `remote` queue and the owner's park token.

use std::cell::{Cell, UnsafeCell};
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll, RawWaker, RawWakerVTable, Waker};
use std::thread::{self, Thread};
use std::time::{Duration, Instant};

use crossbeam_queue::SegQueue;

use crate::wf_debug;

// =============================================================================
// Constants
// =============================================================================

pub const MAX_EXECUTORS: usize = 256;

const STATE_EMPTY: u8 = 0;
const STATE_PENDING: u8 = 1;
const STATE_READY: u8 = 2;
const STATE_CANCELLED: u8 = 3;

// =============================================================================
// Task slot
// =============================================================================

type TaskFuture = Pin<Box<dyn Future<Output = ()>>>;

struct TaskSlot {
    /// `None` while the future is out being polled (or after release).
    future: Option<TaskFuture>,
    generation: u32,
    state: u8,
}

impl TaskSlot {
    const fn vacant() -> Self {
        Self { future: None, generation: 0, state: STATE_EMPTY }
    }
}

/// Identifies a spawned task. Stale ids (slot freed or reused) are detected
/// via the generation counter; operations on them are no-ops.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TaskId {
    index: u32,
    generation: u32,
    executor: u16,
}

// =============================================================================
// Timers
// =============================================================================

struct TimerEntry {
    deadline: Instant,
    waker: Waker,
}

// =============================================================================
// Executor (one per thread)
// =============================================================================

pub struct Executor {
    slots: Vec<TaskSlot>,
    ready: VecDeque<u32>,
    free: Vec<u32>,
    remote: SegQueue<u32>,
    owner: Option<Thread>,
    timers: Option<HashMap<u64, TimerEntry>>,
    next_timer_handle: u64,
}

impl Executor {
    const fn new() -> Self {
        Self {
            slots: Vec::new(),
            ready: VecDeque::new(),
            free: Vec::new(),
            remote: SegQueue::new(),
            owner: None,
            timers: None,
            next_timer_handle: 1,
        }
    }

    fn init(&mut self) {
        self.owner = Some(thread::current());
        self.timers = Some(HashMap::new());
    }

    #[inline]
    fn timers(&self) -> &HashMap<u64, TimerEntry> {
        self.timers.as_ref().unwrap()
    }

    #[inline]
    fn timers_mut(&mut self) -> &mut HashMap<u64, TimerEntry> {
        self.timers.as_mut().unwrap()
    }

    fn alloc_slot(&mut self) -> u32 {
        if let Some(index) = self.free.pop() {
            return index;
        }
        let index = self.slots.len();
        assert!(index <= u32::MAX as usize, "executor: out of task slots");
        self.slots.push(TaskSlot::vacant());
        index as u32
    }

    fn release_slot(&mut self, index: u32) {
        let slot = &mut self.slots[index as usize];
        slot.state = STATE_EMPTY;
        slot.future = None;
        self.free.push(index);
    }
}

// =============================================================================
// Global executor table
// =============================================================================

struct ExecutorCell(UnsafeCell<Executor>);

// Slots are only ever touched by the owning thread; other threads are
// restricted to the lock-free `remote` queue and `owner.unpark()`.
unsafe impl Sync for ExecutorCell {}

static EXECUTORS: [ExecutorCell; MAX_EXECUTORS] = {
    const INIT: ExecutorCell = ExecutorCell(UnsafeCell::new(Executor::new()));
    [INIT; MAX_EXECUTORS]
};
static NEXT_EXECUTOR: AtomicU16 = AtomicU16::new(0);

thread_local! {
    static CURRENT: Cell<u16> = const { Cell::new(u16::MAX) };
}

/// The current thread's executor index, initialising it on first use.
pub fn current_executor() -> u16 {
    CURRENT.with(|current| {
        let idx = current.get();
        if idx != u16::MAX {
            return idx;
        }
        let idx = NEXT_EXECUTOR.fetch_add(1, Ordering::Relaxed);
        assert!(
            (idx as usize) < MAX_EXECUTORS,
            "executor: more than {} executor threads",
            MAX_EXECUTORS
        );
        unsafe { (*EXECUTORS[idx as usize].0.get()).init() };
        current.set(idx);
        idx
    })
}

#[inline]
fn is_current_executor(executor_idx: u16) -> bool {
    // Deliberately does not auto-init: a foreign thread stays on the slow path.
    CURRENT.with(|current| current.get() == executor_idx)
}

/// Access the current thread's executor. MUST NOT be nested.
#[inline]
fn with_executor<R>(f: impl FnOnce(&mut Executor) -> R) -> R {
    let idx = current_executor() as usize;
    unsafe { f(&mut *EXECUTORS[idx].0.get()) }
}

/// Access a specific executor by index. MUST NOT be nested.
#[inline]
fn with_executor_idx<R>(idx: u16, f: impl FnOnce(&mut Executor) -> R) -> R {
    unsafe { f(&mut *EXECUTORS[idx as usize].0.get()) }
}

// =============================================================================
// Waker — packs (executor_idx, task_id) into the data pointer
// =============================================================================

#[inline]
fn pack_waker_data(executor_idx: u16, index: u32) -> usize {
    ((executor_idx as usize) << 48) | (index as usize)
}

#[inline]
fn unpack_waker_data(data: usize) -> (u16, u32) {
    ((data >> 48) as u16, (data & 0xFFFF_FFFF) as u32)
}

fn waker_clone(data: *const ()) -> RawWaker {
    RawWaker::new(data, &WAKER_VTABLE)
}

fn waker_wake(data: *const ()) {
    let (executor_idx, index) = unpack_waker_data(data as usize);

    if is_current_executor(executor_idx) {
        // Fast path: same thread. Safe because wakes only happen outside
        // with_executor closures.
        let ex = unsafe { &mut *EXECUTORS[executor_idx as usize].0.get() };
        if let Some(slot) = ex.slots.get_mut(index as usize) {
            if slot.state == STATE_PENDING {
                slot.state = STATE_READY;
                ex.ready.push_back(index);
            }
        }
    } else {
        // Slow path: cross-thread wake through the lock-free queue.
        let ex = unsafe { &*EXECUTORS[executor_idx as usize].0.get() };
        ex.remote.push(index);
        if let Some(ref owner) = ex.owner {
            owner.unpark();
        }
    }
}

fn waker_drop(_: *const ()) {}

static WAKER_VTABLE: RawWakerVTable =
    RawWakerVTable::new(waker_clone, waker_wake, waker_wake, waker_drop);

fn make_waker(executor_idx: u16, index: u32) -> Waker {
    let data = pack_waker_data(executor_idx, index);
    unsafe { Waker::from_raw(RawWaker::new(data as *const (), &WAKER_VTABLE)) }
}

// =============================================================================
// Debug logging
// =============================================================================

pub fn debug_enabled() -> bool {
    use std::sync::OnceLock;
    static ENABLED: OnceLock<bool> = OnceLock::new();
    *ENABLED.get_or_init(|| std::env::var("WEFT_DEBUG").map_or(false, |v| v == "1"))
}

// =============================================================================
// Spawn / prefetch / cancel
// =============================================================================

/// Spawn a future as a task on the current thread's executor.
///
/// The task is queued ready; it runs during the next [`drive_cycle`] unless
/// [`poll_task_now`] is called first.
pub fn spawn(future: impl Future<Output = ()> + 'static) -> TaskId {
    let executor = current_executor();
    let boxed: TaskFuture = Box::pin(future);
    with_executor(|ex| {
        let index = ex.alloc_slot();
        let slot = &mut ex.slots[index as usize];
        slot.generation = slot.generation.wrapping_add(1);
        slot.future = Some(boxed);
        slot.state = STATE_READY;
        let generation = slot.generation;
        ex.ready.push_back(index);
        wf_debug!("spawn task slot={} gen={}", index, generation);
        TaskId { index, generation, executor }
    })
}

/// Poll a freshly spawned task once, immediately, on the spawning thread.
///
/// This is the prefetch step of [`start_async`](crate::start_async): the body
/// runs up to its first suspension before the caller regains control. A task
/// that has already started (or finished) is left alone.
pub fn poll_task_now(id: TaskId) {
    let future = with_executor_idx(id.executor, |ex| {
        let slot = ex.slots.get_mut(id.index as usize)?;
        if slot.generation != id.generation || slot.state != STATE_READY {
            return None;
        }
        slot.state = STATE_PENDING;
        slot.future.take()
    });
    if let Some(future) = future {
        poll_and_settle(id.executor, id.index, future);
    }
}

/// Cancel a task: its future is dropped without completing, which unwinds
/// the body through every suspension point. Stale ids are ignored.
pub fn cancel(id: TaskId) {
    let future = with_executor_idx(id.executor, |ex| {
        let slot = ex.slots.get_mut(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        match slot.state {
            STATE_PENDING | STATE_READY => match slot.future.take() {
                Some(future) => {
                    wf_debug!("cancel task slot={}", id.index);
                    slot.state = STATE_EMPTY;
                    ex.free.push(id.index);
                    Some(future)
                }
                None => {
                    // Mid-poll: the drive loop drops the future once the
                    // poll returns.
                    wf_debug!("cancel task slot={} (mid-poll)", id.index);
                    slot.state = STATE_CANCELLED;
                    None
                }
            },
            _ => None,
        }
    });
    // Drop glue runs outside the executor borrow; it may re-enter (cancel
    // nested tasks, deregister timers).
    drop(future);
}

/// True once the task has completed, been cancelled, or its slot reused.
pub fn is_finished(id: TaskId) -> bool {
    with_executor_idx(id.executor, |ex| {
        let Some(slot) = ex.slots.get(id.index as usize) else { return true };
        slot.generation != id.generation || matches!(slot.state, STATE_EMPTY | STATE_CANCELLED)
    })
}

// =============================================================================
// Drive cycle
// =============================================================================

/// Poll one task to completion of its current step, outside any borrow.
fn poll_and_settle(executor_idx: u16, index: u32, mut future: TaskFuture) {
    let waker = make_waker(executor_idx, index);
    let mut cx = Context::from_waker(&waker);
    let poll = future.as_mut().poll(&mut cx);

    let finished = with_executor_idx(executor_idx, |ex| {
        match poll {
            Poll::Ready(()) => {
                ex.release_slot(index);
                Some(future)
            }
            Poll::Pending => {
                if ex.slots[index as usize].state == STATE_CANCELLED {
                    ex.release_slot(index);
                    Some(future)
                } else {
                    // A wake during the poll may have flipped the state to
                    // READY already; leave it as is.
                    ex.slots[index as usize].future = Some(future);
                    None
                }
            }
        }
    });
    // Finished or cancelled futures are dropped outside the borrow.
    drop(finished);
}

/// Execute one drive cycle: drain remote wakes, fire expired timers, poll
/// ready tasks. Returns true if any work was done.
pub fn drive_cycle() -> bool {
    let executor_idx = current_executor();
    let mut did_work = false;

    // Phase 1: drain remote wakes.
    with_executor(|ex| {
        while let Some(index) = ex.remote.pop() {
            if let Some(slot) = ex.slots.get_mut(index as usize) {
                if slot.state == STATE_PENDING {
                    slot.state = STATE_READY;
                    ex.ready.push_back(index);
                }
            }
            did_work = true;
        }
    });

    // Phase 2: fire expired timers (wakers extracted inside the borrow,
    // woken outside).
    let expired: Vec<Waker> = with_executor(|ex| {
        let now = Instant::now();
        let handles: Vec<u64> = ex
            .timers()
            .iter()
            .filter(|(_, entry)| entry.deadline <= now)
            .map(|(handle, _)| *handle)
            .collect();
        handles
            .iter()
            .filter_map(|handle| ex.timers_mut().remove(handle).map(|entry| entry.waker))
            .collect()
    });
    for waker in expired {
        waker.wake();
        did_work = true;
    }

    // Phase 3: poll ready tasks one at a time, borrow released between polls.
    loop {
        let next = with_executor(|ex| {
            while let Some(index) = ex.ready.pop_front() {
                if ex.slots[index as usize].state != STATE_READY {
                    continue;
                }
                ex.slots[index as usize].state = STATE_PENDING;
                match ex.slots[index as usize].future.take() {
                    Some(future) => return Some((index, future)),
                    None => {
                        // Unreachable in practice: READY with the future out
                        // only occurs mid-poll, and polls are synchronous.
                        ex.slots[index as usize].state = STATE_READY;
                        ex.ready.push_back(index);
                        return None;
                    }
                }
            }
            None
        });

        let Some((index, future)) = next else { break };
        poll_and_settle(executor_idx, index, future);
        did_work = true;
    }

    did_work
}

// =============================================================================
// Timers
// =============================================================================

/// Register or refresh a timer. Returns the timer handle; if `old_handle`
/// is still live its waker is updated instead of allocating a new entry.
pub fn timer_register(deadline: Instant, waker: Waker, old_handle: u64) -> u64 {
    with_executor(|ex| {
        if old_handle != 0 {
            if let Some(entry) = ex.timers_mut().get_mut(&old_handle) {
                entry.waker = waker;
                return old_handle;
            }
        }
        let handle = ex.next_timer_handle;
        ex.next_timer_handle += 1;
        ex.timers_mut().insert(handle, TimerEntry { deadline, waker });
        handle
    })
}

pub fn timer_cancel(handle: u64) {
    with_executor(|ex| {
        ex.timers_mut().remove(&handle);
    });
}

/// Time until the next timer fires. Zero if one is already overdue.
pub fn next_timer_deadline() -> Option<Duration> {
    with_executor(|ex| {
        let now = Instant::now();
        ex.timers()
            .values()
            .map(|entry| entry.deadline)
            .min()
            .map(|deadline| deadline.saturating_duration_since(now))
    })
}

// =============================================================================
// block_on
// =============================================================================

struct Unpark(Thread);

impl std::task::Wake for Unpark {
    fn wake(self: Arc<Self>) {
        self.0.unpark();
    }

    fn wake_by_ref(self: &Arc<Self>) {
        self.0.unpark();
    }
}

/// Drive the executor on the current thread until `future` resolves.
///
/// Parks between cycles; cross-thread wakes (remote queue) and expired
/// timers both unblock the park.
pub fn block_on<F: Future>(future: F) -> F::Output {
    current_executor();
    let mut future = std::pin::pin!(future);
    let waker = Waker::from(Arc::new(Unpark(thread::current())));
    let mut cx = Context::from_waker(&waker);

    loop {
        if let Poll::Ready(value) = future.as_mut().poll(&mut cx) {
            return value;
        }
        if drive_cycle() {
            continue;
        }
        match next_timer_deadline() {
            Some(timeout) => thread::park_timeout(timeout),
            None => thread::park(),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
