//! Callback-to-stream bridge.
//!
//! Native services report through callbacks that may fire on any thread. The
//! bridge gives each service instance one unbounded, ordered channel: the
//! native-facing delegate holds an [`EventSink`] and only enqueues typed
//! events, while the consumer polls the matching [`EventStream`] from its own
//! task. Cancelling closes the stream for good; anything still queued or
//! racing in from a callback is dropped instead of delivered.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures_util::Stream;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_util::sync::{CancellationToken, WaitForCancellationFutureOwned};
use tracing::trace;

type Teardown = Box<dyn FnOnce() + Send>;

/// Create a connected sink/stream pair for one service instance.
pub fn channel<E>() -> (EventSink<E>, EventStream<E>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let token = CancellationToken::new();
    let handle = CancelHandle {
        token: token.clone(),
        teardown: Arc::new(Mutex::new(None)),
    };
    let sink = EventSink {
        tx,
        token: token.clone(),
    };
    let stream = EventStream {
        receiver: UnboundedReceiverStream::new(rx),
        cancelled: Box::pin(token.cancelled_owned()),
        handle,
    };
    (sink, stream)
}

/// Producer side of the bridge, safe to use from any thread.
pub struct EventSink<E> {
    tx: mpsc::UnboundedSender<E>,
    token: CancellationToken,
}

impl<E> EventSink<E> {
    /// Enqueue an event. Returns `false` if the stream is cancelled or gone.
    pub fn send(&self, event: E) -> bool {
        if self.token.is_cancelled() {
            trace!("dropping event for cancelled stream");
            return false;
        }
        self.tx.send(event).is_ok()
    }

    /// Whether nothing will ever consume further events.
    pub fn is_closed(&self) -> bool {
        self.token.is_cancelled() || self.tx.is_closed()
    }

    /// The token cancelled when the stream is torn down.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.token.clone()
    }
}

impl<E> Clone for EventSink<E> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            token: self.token.clone(),
        }
    }
}

impl<E> fmt::Debug for EventSink<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventSink")
            .field("cancelled", &self.token.is_cancelled())
            .finish()
    }
}

/// Handle that tears a service instance down.
///
/// Cancelling is synchronous: once [`cancel`](CancelHandle::cancel) returns,
/// the stream yields no further events and the instance's teardown (stop the
/// native service, drop the registry entry and release the delegate) has run.
#[derive(Clone)]
pub struct CancelHandle {
    token: CancellationToken,
    teardown: Arc<Mutex<Option<Teardown>>>,
}

impl CancelHandle {
    /// Cancel the stream and run its teardown once.
    pub fn cancel(&self) {
        self.token.cancel();
        let teardown = self.teardown.lock().take();
        if let Some(teardown) = teardown {
            teardown();
        }
    }

    /// Whether the stream was cancelled, explicitly or by its owner.
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Install the teardown to run on cancellation.
    ///
    /// Runs immediately if the handle is already cancelled.
    pub fn on_cancel(&self, teardown: impl FnOnce() + Send + 'static) {
        if self.token.is_cancelled() {
            teardown();
            return;
        }
        *self.teardown.lock() = Some(Box::new(teardown));
        // A cancel racing the install above may have missed the teardown.
        if self.token.is_cancelled() {
            let teardown = self.teardown.lock().take();
            if let Some(teardown) = teardown {
                teardown();
            }
        }
    }
}

impl fmt::Debug for CancelHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancelHandle")
            .field("cancelled", &self.token.is_cancelled())
            .finish()
    }
}

/// Ordered stream of events from one service instance.
///
/// Dropping the stream cancels it, like dropping any other subscription.
pub struct EventStream<E> {
    receiver: UnboundedReceiverStream<E>,
    cancelled: Pin<Box<WaitForCancellationFutureOwned>>,
    handle: CancelHandle,
}

impl<E> EventStream<E> {
    /// A handle that can cancel this stream from elsewhere.
    pub fn cancel_handle(&self) -> CancelHandle {
        self.handle.clone()
    }

    /// Cancel this stream.
    pub fn cancel(&self) {
        self.handle.cancel();
    }

    /// Whether the stream has been cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.handle.is_cancelled()
    }
}

impl<E> Stream for EventStream<E> {
    type Item = E;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        // Cancellation wins over anything already queued.
        if self.cancelled.as_mut().poll(cx).is_ready() {
            self.receiver.close();
            return Poll::Ready(None);
        }
        Pin::new(&mut self.receiver).poll_next(cx)
    }
}

impl<E> Drop for EventStream<E> {
    fn drop(&mut self) {
        self.handle.cancel();
    }
}

impl<E> fmt::Debug for EventStream<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventStream")
            .field("cancelled", &self.handle.is_cancelled())
            .finish()
    }
}
