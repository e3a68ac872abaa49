//! Single-consumer action dispatch for the reducer.
//!
//! Event streams from any number of service instances are mapped into the
//! application's action type and merged, together with actions sent directly
//! through an [`ActionSender`]. The reducer pulls one action at a time, so it
//! is never entered concurrently. Per-stream order is preserved; across
//! streams there is no ordering guarantee.

use std::pin::Pin;
use std::task::{Context, Poll};
use std::thread::{self, ThreadId};

use futures_util::stream::{BoxStream, SelectAll};
use futures_util::{Stream, StreamExt};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

/// Cloneable handle for feeding actions into a [`Dispatcher`] from anywhere.
#[derive(Debug)]
pub struct ActionSender<A> {
    tx: mpsc::UnboundedSender<A>,
}

impl<A> ActionSender<A> {
    /// Queue an action. Returns `false` if the dispatcher is gone.
    pub fn send(&self, action: A) -> bool {
        self.tx.send(action).is_ok()
    }
}

impl<A> Clone for ActionSender<A> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

/// Merges effect streams and direct actions into one sequential stream.
///
/// Must always be polled from the same thread; debug builds assert it.
/// Drive it with a current-thread runtime or `block_on`.
pub struct Dispatcher<A> {
    effects: SelectAll<BoxStream<'static, A>>,
    inbox: UnboundedReceiverStream<A>,
    tx: mpsc::UnboundedSender<A>,
    thread: Option<ThreadId>,
}

impl<A: Send + 'static> Dispatcher<A> {
    /// Create an empty dispatcher.
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            effects: SelectAll::new(),
            inbox: UnboundedReceiverStream::new(rx),
            tx,
            thread: None,
        }
    }

    /// A handle for sending actions directly.
    pub fn sender(&self) -> ActionSender<A> {
        ActionSender {
            tx: self.tx.clone(),
        }
    }

    /// Queue an action from the reducer itself.
    pub fn send(&self, action: A) {
        let _ = self.tx.send(action);
    }

    /// Merge an event stream, mapping each event into an action.
    pub fn subscribe<S, F>(&mut self, events: S, into_action: F)
    where
        S: Stream + Send + 'static,
        F: FnMut(S::Item) -> A + Send + 'static,
    {
        self.effects.push(events.map(into_action).boxed());
    }

    /// Number of merged streams that have not ended yet.
    pub fn active_subscriptions(&self) -> usize {
        self.effects.len()
    }

    /// The next action, in arrival order per source.
    pub async fn next_action(&mut self) -> Option<A> {
        self.next().await
    }
}

impl<A: Send + 'static> Default for Dispatcher<A> {
    fn default() -> Self {
        Self::new()
    }
}

impl<A: Send + 'static> Stream for Dispatcher<A> {
    type Item = A;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        let current = thread::current().id();
        let owner = *this.thread.get_or_insert(current);
        debug_assert_eq!(owner, current, "dispatcher polled from a second thread");

        if let Poll::Ready(Some(action)) = Pin::new(&mut this.inbox).poll_next(cx) {
            return Poll::Ready(Some(action));
        }
        match Pin::new(&mut this.effects).poll_next(cx) {
            Poll::Ready(Some(action)) => Poll::Ready(Some(action)),
            // An empty SelectAll reports None; new subscriptions may still come.
            Poll::Ready(None) | Poll::Pending => Poll::Pending,
        }
    }
}

#[cfg(test)]
mod tests {
    use futures_util::FutureExt;
    use tokio_test::{assert_pending, assert_ready, task};

    use super::*;
    use crate::bridge;

    #[derive(Debug, PartialEq)]
    enum Action {
        Tapped,
        Event(u8),
    }

    #[tokio::test]
    async fn merges_direct_and_streamed_actions() {
        let mut dispatcher = Dispatcher::new();
        let (sink, stream) = bridge::channel();
        dispatcher.subscribe(stream, Action::Event);

        sink.send(1);
        sink.send(2);
        dispatcher.sender().send(Action::Tapped);

        assert_eq!(dispatcher.next_action().await, Some(Action::Tapped));
        assert_eq!(dispatcher.next_action().await, Some(Action::Event(1)));
        assert_eq!(dispatcher.next_action().await, Some(Action::Event(2)));
        assert_eq!(dispatcher.active_subscriptions(), 1);
    }

    #[test]
    fn finished_streams_are_dropped() {
        let mut dispatcher = Dispatcher::new();
        let (sink, stream) = bridge::channel();
        dispatcher.subscribe(stream, Action::Event);
        sink.send(9);
        drop(sink);

        let mut dispatcher = task::spawn(dispatcher);
        assert_eq!(
            assert_ready!(dispatcher.poll_next()),
            Some(Action::Event(9))
        );
        assert_pending!(dispatcher.poll_next());
        assert_eq!(dispatcher.active_subscriptions(), 0);

        dispatcher.send(Action::Tapped);
        assert_eq!(assert_ready!(dispatcher.poll_next()), Some(Action::Tapped));
    }

    #[cfg(debug_assertions)]
    #[test]
    #[should_panic(expected = "dispatcher polled from a second thread")]
    fn polling_from_another_thread_panics() {
        let mut dispatcher = Dispatcher::<Action>::new();
        assert!(dispatcher.next().now_or_never().is_none());

        let moved = std::thread::spawn(move || {
            let _ = dispatcher.next().now_or_never();
        });
        if let Err(panic) = moved.join() {
            std::panic::resume_unwind(panic);
        }
    }
}
