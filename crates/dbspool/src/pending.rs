//! Completion futures handed back by pool operations.
//!
//! Every operation on a transaction, command block, or worker slot is
//! recorded at call time and answers later through a [`Pending`]. Dropping a
//! `Pending` only discards the answer; the operation itself still runs in
//! its original position.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use pin_project_lite::pin_project;
use tokio::sync::oneshot;

use crate::error::{PoolError, Result};

pin_project! {
    /// The eventual result of a pool operation.
    #[must_use = "dropping a Pending discards the result, not the operation"]
    pub struct Pending<T> {
        #[pin]
        rx: oneshot::Receiver<Result<T>>,
    }
}

impl<T> Pending<T> {
    /// Create a connected completer/pending pair.
    pub(crate) fn channel() -> (Completer<T>, Self) {
        let (tx, rx) = oneshot::channel();
        (Completer { tx }, Self { rx })
    }

    /// A pending that is already resolved.
    pub(crate) fn ready(result: Result<T>) -> Self {
        let (completer, pending) = Self::channel();
        completer.complete(result);
        pending
    }

    /// A pending that already failed.
    pub(crate) fn failed(err: PoolError) -> Self {
        Self::ready(Err(err))
    }

    /// Check whether the result is available without waiting.
    ///
    /// Returns `None` while the operation is still outstanding. Once the
    /// result has been taken, it cannot be polled again.
    pub fn try_take(&mut self) -> Option<Result<T>> {
        match self.rx.try_recv() {
            Ok(result) => Some(result),
            Err(oneshot::error::TryRecvError::Empty) => None,
            Err(oneshot::error::TryRecvError::Closed) => Some(Err(PoolError::SlotGone)),
        }
    }
}

impl<T> Future for Pending<T> {
    type Output = Result<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match self.project().rx.poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            // The producing side was dropped without answering, which only
            // happens when a worker thread dies mid-operation.
            Poll::Ready(Err(_)) => Poll::Ready(Err(PoolError::SlotGone)),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl<T> fmt::Debug for Pending<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pending").finish_non_exhaustive()
    }
}

/// The producing half of a [`Pending`].
pub(crate) struct Completer<T> {
    tx: oneshot::Sender<Result<T>>,
}

impl<T> Completer<T> {
    /// Deliver the result. A caller that stopped listening is not an error.
    pub(crate) fn complete(self, result: Result<T>) {
        let _ = self.tx.send(result);
    }

    /// Deliver a failure.
    pub(crate) fn fail(self, err: PoolError) {
        self.complete(Err(err));
    }
}

impl<T> fmt::Debug for Completer<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Completer").finish_non_exhaustive()
    }
}
