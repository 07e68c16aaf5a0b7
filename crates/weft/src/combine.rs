//! Combinators over collections of awaitables.
//!
//! [`await_all`] awaits every element in slice order and short-circuits on
//! the first failure. [`await_any`] resolves to the position of the first
//! element to reach a terminal state — it never raises the failure itself;
//! the caller inspects the element and re-awaits to rethrow.
//!
//! [`async_all`] / [`async_any`] wrap the combinators in
//! [`start_async`](crate::start_async) to yield a composite awaitable.
//!
//! Elements are projected to [`Awaitable`]s through the [`AsAwaitable`]
//! selector — the one polymorphism surface. It is implemented for
//! `Awaitable`, references, `Rc`, and pairs (first element); implement it
//! on your own types to expose an awaitable field.

use std::cell::Cell;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll};

use crate::awaitable::{start_async, Awaitable};
use crate::error::Failure;

// =============================================================================
// Selector
// =============================================================================

/// Projects a collection element to its [`Awaitable`].
pub trait AsAwaitable {
    fn as_awaitable(&self) -> &Awaitable;
}

impl AsAwaitable for Awaitable {
    fn as_awaitable(&self) -> &Awaitable {
        self
    }
}

impl<T: AsAwaitable> AsAwaitable for &T {
    fn as_awaitable(&self) -> &Awaitable {
        (**self).as_awaitable()
    }
}

impl<T: AsAwaitable> AsAwaitable for Rc<T> {
    fn as_awaitable(&self) -> &Awaitable {
        (**self).as_awaitable()
    }
}

impl<A: AsAwaitable, B> AsAwaitable for (A, B) {
    fn as_awaitable(&self) -> &Awaitable {
        self.0.as_awaitable()
    }
}

// =============================================================================
// await_all
// =============================================================================

/// Await every element in slice order.
///
/// Sequential composition: the first failure short-circuits and propagates.
/// Elements that already completed stay completed — terminal states are
/// never rolled back.
pub async fn await_all<A: AsAwaitable>(items: &[A]) -> Result<(), Failure> {
    for item in items {
        item.as_awaitable().wait().await?;
    }
    Ok(())
}

// =============================================================================
// await_any
// =============================================================================

static NEXT_COOKIE: AtomicU64 = AtomicU64::new(1);

/// Resolve to the position of the first terminal element, or `None` for an
/// empty slice.
///
/// If several elements are already done on entry, the lowest position wins.
/// The element's failure (if any) is not propagated; `wait()` it to rethrow.
pub fn await_any<A: AsAwaitable>(items: &[A]) -> AnyFuture<'_, A> {
    AnyFuture {
        items,
        cookie: NEXT_COOKIE.fetch_add(1, Ordering::Relaxed),
        registered: false,
    }
}

/// Future returned by [`await_any`].
pub struct AnyFuture<'a, A: AsAwaitable> {
    items: &'a [A],
    cookie: u64,
    registered: bool,
}

impl<A: AsAwaitable> AnyFuture<'_, A> {
    fn unregister_all(&mut self) {
        if self.registered {
            for item in self.items {
                item.as_awaitable().unregister_awaiter(self.cookie);
            }
            self.registered = false;
        }
    }
}

impl<A: AsAwaitable> Future for AnyFuture<'_, A> {
    type Output = Option<usize>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();

        // First pass: an already-done element wins by position.
        let mut done_at = None;
        for (position, item) in this.items.iter().enumerate() {
            let awaitable = item.as_awaitable();
            awaitable.poke();
            if awaitable.is_terminal_now() {
                done_at = Some(position);
                break;
            }
        }
        if let Some(position) = done_at {
            this.unregister_all();
            return Poll::Ready(Some(position));
        }

        if this.items.is_empty() {
            return Poll::Ready(None);
        }

        // Register on every element; whichever finishes first wakes us and
        // the next poll's scan finds it.
        for item in this.items {
            let awaitable = item.as_awaitable();
            awaitable.store_notify(cx.waker());
            awaitable.register_awaiter(this.cookie, cx.waker().clone());
        }
        this.registered = true;
        Poll::Pending
    }
}

impl<A: AsAwaitable> Unpin for AnyFuture<'_, A> {}

impl<A: AsAwaitable> Drop for AnyFuture<'_, A> {
    fn drop(&mut self) {
        // Dropped mid-wait (e.g. a cancelled composite): leave no stale
        // registrations behind.
        self.unregister_all();
    }
}

// =============================================================================
// Composite awaitables
// =============================================================================

/// Compose a collection into one awaitable that completes when all members
/// complete, or fails with the first member failure.
pub fn async_all(awaitables: Vec<Awaitable>) -> Awaitable {
    start_async("async-all", async move {
        await_all(&awaitables).await?;
        Ok(())
    })
}

/// Compose a collection into one awaitable that completes when any member
/// reaches a terminal state. The winning position is published through the
/// returned cell. An empty collection never completes.
pub fn async_any(awaitables: Vec<Awaitable>) -> (Awaitable, Rc<Cell<Option<usize>>>) {
    let winner = Rc::new(Cell::new(None));
    let publish = winner.clone();
    let composite = start_async("async-any", async move {
        if awaitables.is_empty() {
            std::future::pending::<()>().await;
        }
        publish.set(await_any(&awaitables).await);
        Ok(())
    });
    (composite, winner)
}
