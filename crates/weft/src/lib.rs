//! weft — a single-threaded awaitable composition runtime.
//!
//! The central primitive is the [`Awaitable`]: a handle to an operation
//! expected to finish in the future — a timer, a bridged callback, a
//! composite of other awaitables. Async bodies suspend on awaitables as if
//! they were blocking calls while the owning thread keeps driving other
//! tasks.
//!
//! # Pieces
//!
//! - [`executor`] — the slab-based single-threaded task executor plus
//!   [`block_on`] and timers.
//! - [`Awaitable`] / [`Completer`] / [`start_async`] — the operation state
//!   machine and its two construction paths.
//! - [`await_all`] / [`await_any`] / [`async_all`] / [`async_any`] —
//!   combinators over collections.
//! - [`YieldSequence`] — lazy pull sequences driven by an async producer.
//! - [`Scheduler`] / [`CallbackGuard`] — the deferral capability and the
//!   late-callback guard used when bridging external callback APIs.
//!
//! # Example
//!
//! ```
//! use weft::{block_on, start_async, Awaitable};
//!
//! let ticket = Awaitable::new("ticket");
//! let completer = ticket.take_completer();
//!
//! let work = start_async("work", async move {
//!     ticket.wait().await?;
//!     Ok(())
//! });
//!
//! completer.complete();
//! block_on(async { work.wait().await }).unwrap();
//! ```
//!
//! Everything except [`Completer`] is pinned to its creating thread; the
//! completer may be sent anywhere and fired from any thread. Set
//! `WEFT_DEBUG=1` to trace state transitions on stderr.

macro_rules! wf_debug {
    ($($arg:tt)*) => {
        if $crate::executor::debug_enabled() {
            eprintln!("[weft] {}", format!($($arg)*));
        }
    };
}
pub(crate) use wf_debug;

pub mod executor;

mod awaitable;
mod combine;
mod error;
mod generate;
mod guard;
mod scheduler;
mod time;

pub use awaitable::{start_async, Awaitable, Completer, WaitFuture};
pub use combine::{async_all, async_any, await_all, await_any, AnyFuture, AsAwaitable};
pub use error::{Failure, Fault};
pub use executor::{block_on, drive_cycle};
pub use generate::{Next, YieldFuture, YieldSequence, Yielder};
pub use guard::{CallbackGuard, GuardToken};
pub use scheduler::{Action, Immediate, Scheduler};
pub use time::{async_delay, delay, Delay};
