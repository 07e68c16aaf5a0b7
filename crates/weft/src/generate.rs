//! Lazy pull-based sequences driven by an async producer.
//!
//! [`YieldSequence`] adapts a producer body into an iterable stream: each
//! pull resumes the producer until it parks on the next
//! [`Yielder::yield_value`], and the parked value is handed to the consumer.
//! The sequence is finite (the producer decides), single-pass, and not
//! restartable. Dropping it mid-iteration drops the producer, unwinding the
//! body through its suspension points.
//!
//! Implements [`Stream`], so the usual adapter ecosystem applies; [`next`]
//! gives a pull future for direct consumption under
//! [`block_on`](crate::executor::block_on).
//!
//! [`next`]: YieldSequence::next

use std::cell::RefCell;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll};

use futures_core::Stream;

/// A pull sequence over values of `T` produced by an async body.
pub struct YieldSequence<T> {
    producer: Option<Pin<Box<dyn Future<Output = ()>>>>,
    channel: Rc<RefCell<Option<T>>>,
}

/// Handed to the producer body; yields values to the consumer.
pub struct Yielder<T> {
    channel: Rc<RefCell<Option<T>>>,
}

impl<T> Yielder<T> {
    /// Deliver `value` to the consumer and park until the next pull.
    pub fn yield_value(&self, value: T) -> YieldFuture<T> {
        YieldFuture {
            channel: self.channel.clone(),
            value: Some(value),
        }
    }
}

/// Future returned by [`Yielder::yield_value`]; resolves once the consumer
/// has taken the value.
pub struct YieldFuture<T> {
    channel: Rc<RefCell<Option<T>>>,
    value: Option<T>,
}

// T is never pinned through this future; it is moved out whole.
impl<T> Unpin for YieldFuture<T> {}

impl<T> Future for YieldFuture<T> {
    type Output = ();

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<()> {
        let this = self.get_mut();
        if let Some(value) = this.value.take() {
            *this.channel.borrow_mut() = Some(value);
            // Park; the consumer's next pull re-polls the producer. No waker
            // is needed — the sequence drives the producer directly.
            return Poll::Pending;
        }
        if this.channel.borrow().is_some() {
            Poll::Pending
        } else {
            Poll::Ready(())
        }
    }
}

impl<T> YieldSequence<T> {
    /// Wrap a producer body into a sequence. The body receives a [`Yielder`]
    /// and runs lazily, one step per pull.
    pub fn new<F, Fut>(producer: F) -> Self
    where
        F: FnOnce(Yielder<T>) -> Fut,
        Fut: Future<Output = ()> + 'static,
    {
        let channel = Rc::new(RefCell::new(None));
        let body = producer(Yielder { channel: channel.clone() });
        YieldSequence {
            producer: Some(Box::pin(body)),
            channel,
        }
    }

    /// Pull the next value. Resolves to `None` once the producer returns.
    pub fn next(&mut self) -> Next<'_, T> {
        Next { sequence: self }
    }
}

impl<T> Stream for YieldSequence<T> {
    type Item = T;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<T>> {
        let this = self.get_mut();
        let Some(producer) = this.producer.as_mut() else {
            return Poll::Ready(None);
        };
        match producer.as_mut().poll(cx) {
            Poll::Ready(()) => {
                this.producer = None;
                // A value yielded without awaiting the yield future is still
                // delivered before end-of-stream.
                Poll::Ready(this.channel.borrow_mut().take())
            }
            Poll::Pending => match this.channel.borrow_mut().take() {
                Some(value) => Poll::Ready(Some(value)),
                // The producer is parked on something other than a yield;
                // its inner await has registered `cx`'s waker.
                None => Poll::Pending,
            },
        }
    }
}

/// Future returned by [`YieldSequence::next`].
pub struct Next<'a, T> {
    sequence: &'a mut YieldSequence<T>,
}

impl<T> Future for Next<'_, T> {
    type Output = Option<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<T>> {
        Pin::new(&mut *self.get_mut().sequence).poll_next(cx)
    }
}
