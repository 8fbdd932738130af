use crate::Error;
use futures::future::BoxFuture;
use futures::stream::FusedStream;
use futures::{FutureExt, Stream};
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

/// SingleShot adapts a Future into a Stream which yields its output once.
///
/// The Future is not polled until the stream is, so subscribing to the
/// stream is what starts the work. A SingleShot yields exactly one item
/// (an Ok result or an Error) and then ends, or is cancelled and ends
/// without yielding anything. Cancelling drops the pending Future, which
/// releases whatever it owns.
pub struct SingleShot<'a, T> {
    state: State<'a, T>,
}

enum State<'a, T> {
    Pending(BoxFuture<'a, Result<T, Error>>),
    Emitted,
    Errored,
    Cancelled,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Phase {
    Pending,
    Emitted,
    Errored,
    Cancelled,
}

impl<'a, T> SingleShot<'a, T> {
    pub fn new<F>(fut: F) -> Self
    where
        F: Future<Output = Result<T, Error>> + Send + 'a,
    {
        Self {
            state: State::Pending(fut.boxed()),
        }
    }

    /// A SingleShot which fails with `err` when polled.
    pub fn failed(err: Error) -> Self
    where
        T: Send + 'a,
    {
        Self::new(futures::future::ready(Err(err)))
    }

    pub(crate) fn cancelled() -> Self {
        Self {
            state: State::Cancelled,
        }
    }

    /// Cancel the pending Future, if it hasn't yet resolved.
    /// Returns true if this call cancelled it.
    pub fn cancel(&mut self) -> bool {
        if let State::Pending(_) = &self.state {
            self.state = State::Cancelled;
            true
        } else {
            false
        }
    }

    pub fn phase(&self) -> Phase {
        match &self.state {
            State::Pending(_) => Phase::Pending,
            State::Emitted => Phase::Emitted,
            State::Errored => Phase::Errored,
            State::Cancelled => Phase::Cancelled,
        }
    }
}

impl<'a, T> Stream for SingleShot<'a, T> {
    type Item = Result<T, Error>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();

        let State::Pending(fut) = &mut this.state else {
            return Poll::Ready(None);
        };
        let result = futures::ready!(fut.as_mut().poll(cx));

        this.state = if result.is_ok() {
            State::Emitted
        } else {
            State::Errored
        };
        Poll::Ready(Some(result))
    }
}

impl<'a, T> FusedStream for SingleShot<'a, T> {
    fn is_terminated(&self) -> bool {
        !matches!(self.state, State::Pending(_))
    }
}
