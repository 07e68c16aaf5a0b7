//! Timer futures over the executor's timer table.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use crate::awaitable::{start_async, Awaitable};
use crate::executor;

/// Resolve after `duration` has elapsed.
pub fn delay(duration: Duration) -> Delay {
    Delay {
        deadline: Instant::now() + duration,
        handle: 0,
    }
}

/// Future returned by [`delay`].
pub struct Delay {
    deadline: Instant,
    handle: u64,
}

impl Future for Delay {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        let this = self.get_mut();
        if Instant::now() >= this.deadline {
            if this.handle != 0 {
                executor::timer_cancel(this.handle);
                this.handle = 0;
            }
            Poll::Ready(())
        } else {
            this.handle = executor::timer_register(this.deadline, cx.waker().clone(), this.handle);
            Poll::Pending
        }
    }
}

impl Drop for Delay {
    fn drop(&mut self) {
        if self.handle != 0 {
            executor::timer_cancel(self.handle);
        }
    }
}

/// An awaitable that completes after `duration`.
pub fn async_delay(duration: Duration) -> Awaitable {
    start_async("delay", async move {
        delay(duration).await;
        Ok(())
    })
}
