//! Workspace events and cancellable subscriptions.
//!
//! Every stream handed to callers (workspace events, cursor updates, buffer
//! changes) is a [`Subscription`]: a lazy sequence over a broadcast channel
//! that yields a backlog first, skips over messages it lagged behind on, and
//! ends promptly once cancelled or once its producer is torn down.
//!
//! Controllers also offer a push style: a single callback slot run by their
//! receive task, and a `poll` that waits for the next change without taking
//! it from anyone. Both sit on a [`Notifier`].

use futures_util::{Stream, StreamExt};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::{broadcast, watch};
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tokio_util::sync::{CancellationToken, WaitForCancellationFutureOwned};
use tracing::debug;

use crate::buffer::OpId;
use crate::protocol::Member;

/// Something that happened in a workspace
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    /// A member joined the workspace
    UserJoined(Member),
    /// A member left, gracefully or through a transport failure
    UserLeft(Member),
    /// A buffer was added to the file tree
    BufferCreated { path: String },
    /// A buffer was removed from the file tree
    BufferDeleted { path: String },
    /// An attached buffer was torn down because it was deleted or moved.
    /// `unconfirmed` lists local operations the authority never acknowledged.
    BufferDetached { path: String, unconfirmed: Vec<OpId> },
    /// A buffer was moved in the file tree
    BufferRenamed { from: String, to: String },
    /// A buffer replica became inconsistent and is being resynced
    BufferDesynced { path: String, reason: String },
    /// A buffer finished resyncing from an authoritative snapshot
    BufferResynced { path: String },
    /// The workspace reached the detached state. `unconfirmed` lists local
    /// operations the authority never acknowledged.
    Detached {
        reason: Option<String>,
        unconfirmed: Vec<OpId>,
    },
}

impl Event {
    /// Buffer path the event concerns, if any
    pub fn path(&self) -> Option<&str> {
        match self {
            Event::BufferCreated { path }
            | Event::BufferDeleted { path }
            | Event::BufferDetached { path, .. }
            | Event::BufferDesynced { path, .. }
            | Event::BufferResynced { path } => Some(path),
            Event::BufferRenamed { to, .. } => Some(to),
            _ => None,
        }
    }
}

/// A cancellable stream of `T`.
///
/// Dropping the subscription or calling [`cancel`](Subscription::cancel)
/// ends it; so does tearing down the controller that produced it.
pub struct Subscription<T> {
    backlog: VecDeque<T>,
    inner: BroadcastStream<T>,
    token: CancellationToken,
    cancelled: Pin<Box<WaitForCancellationFutureOwned>>,
}

impl<T: Clone + Send + 'static> Subscription<T> {
    /// Subscribe to `rx`, ending when `parent` is cancelled
    pub(crate) fn new(rx: broadcast::Receiver<T>, parent: &CancellationToken) -> Self {
        let token = parent.child_token();
        Self {
            backlog: VecDeque::new(),
            inner: BroadcastStream::new(rx),
            cancelled: Box::pin(token.clone().cancelled_owned()),
            token,
        }
    }

    /// Yield `items` before any live message
    pub(crate) fn with_backlog(mut self, items: impl IntoIterator<Item = T>) -> Self {
        self.backlog.extend(items);
        self
    }

    /// Stop the subscription; pending and future `recv` calls return `None`
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Token that cancels this subscription, usable from another task
    pub fn cancellation_token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Next item, or `None` once cancelled or closed
    pub async fn recv(&mut self) -> Option<T>
    where
        T: Unpin,
    {
        self.next().await
    }

    /// Next item if one is immediately available
    pub fn try_recv(&mut self) -> Option<T>
    where
        T: Unpin,
    {
        let waker = futures_util::task::noop_waker();
        let mut cx = Context::from_waker(&waker);
        match Pin::new(self).poll_next(&mut cx) {
            Poll::Ready(item) => item,
            Poll::Pending => None,
        }
    }
}

impl<T: Clone + Send + Unpin + 'static> Stream for Subscription<T> {
    type Item = T;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<T>> {
        let this = self.get_mut();

        if this.cancelled.as_mut().poll(cx).is_ready() {
            return Poll::Ready(None);
        }

        if let Some(item) = this.backlog.pop_front() {
            return Poll::Ready(Some(item));
        }

        loop {
            match this.inner.poll_next_unpin(cx) {
                Poll::Ready(Some(Ok(item))) => return Poll::Ready(Some(item)),
                Poll::Ready(Some(Err(BroadcastStreamRecvError::Lagged(skipped)))) => {
                    debug!("Subscriber lagged, skipped {} messages", skipped);
                }
                Poll::Ready(None) => return Poll::Ready(None),
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

impl<T> std::fmt::Debug for Subscription<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("backlog", &self.backlog.len())
            .field("cancelled", &self.token.is_cancelled())
            .finish()
    }
}

/// Callback run by a controller's receive task
pub type ControllerCallback<T> = Arc<dyn Fn(T) + Send + Sync>;

/// Change notification shared by every handle of a controller: a generation
/// counter to wait on and a single callback slot
pub(crate) struct Notifier<T> {
    generation: watch::Sender<u64>,
    callback: Mutex<Option<ControllerCallback<T>>>,
}

impl<T> Notifier<T> {
    pub fn new() -> Self {
        Self {
            generation: watch::channel(0).0,
            callback: Mutex::new(None),
        }
    }

    pub fn set_callback(&self, callback: ControllerCallback<T>) {
        *self.callback.lock() = Some(callback);
    }

    pub fn clear_callback(&self) {
        self.callback.lock().take();
    }

    /// Run the callback with the handle built by `handle`, then wake waiters.
    /// Must not be called with the controller's state locked.
    pub fn notify(&self, handle: impl FnOnce() -> T) {
        let callback = self.callback.lock().clone();
        if let Some(callback) = callback {
            callback(handle());
        }
        self.generation.send_modify(|g| *g = g.wrapping_add(1));
    }

    /// Resolve on the next notification; `false` if `stop` fires first
    pub async fn wait(&self, stop: &CancellationToken) -> bool {
        let mut rx = self.generation.subscribe();
        tokio::select! {
            _ = stop.cancelled() => false,
            changed = rx.changed() => changed.is_ok(),
        }
    }
}

impl<T> std::fmt::Debug for Notifier<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Notifier")
            .field("generation", &*self.generation.borrow())
            .field("callback", &self.callback.lock().is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_backlog_then_live() {
        let root = CancellationToken::new();
        let (tx, rx) = broadcast::channel(8);
        let mut sub = Subscription::new(rx, &root).with_backlog([1, 2]);

        tx.send(3).unwrap();
        assert_eq!(sub.recv().await, Some(1));
        assert_eq!(sub.recv().await, Some(2));
        assert_eq!(sub.recv().await, Some(3));
    }

    #[tokio::test]
    async fn test_cancel_wakes_pending_recv() {
        let root = CancellationToken::new();
        let (_tx, rx) = broadcast::channel::<u32>(8);
        let mut sub = Subscription::new(rx, &root);
        let token = sub.cancellation_token();

        let waiter = tokio::spawn(async move { sub.recv().await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        token.cancel();

        let result = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("recv should end promptly")
            .unwrap();
        assert_eq!(result, None);
    }

    #[tokio::test]
    async fn test_parent_cancellation_ends_stream() {
        let root = CancellationToken::new();
        let (tx, rx) = broadcast::channel(8);
        let mut sub = Subscription::new(rx, &root).with_backlog([7]);

        root.cancel();
        tx.send(8).unwrap();
        assert_eq!(sub.recv().await, None);
        assert!(sub.is_cancelled());
    }

    #[tokio::test]
    async fn test_lagged_messages_are_skipped() {
        let root = CancellationToken::new();
        let (tx, rx) = broadcast::channel(2);
        let mut sub = Subscription::new(rx, &root);

        for n in 0..5 {
            tx.send(n).unwrap();
        }
        assert_eq!(sub.recv().await, Some(3));
        assert_eq!(sub.recv().await, Some(4));
    }

    #[tokio::test]
    async fn test_closed_channel_ends_stream() {
        let root = CancellationToken::new();
        let (tx, rx) = broadcast::channel::<u8>(2);
        let mut sub = Subscription::new(rx, &root);
        drop(tx);
        assert_eq!(sub.recv().await, None);
        assert_eq!(sub.try_recv(), None);
    }

    #[test]
    fn test_event_path() {
        let event = Event::BufferRenamed {
            from: "a.txt".into(),
            to: "b.txt".into(),
        };
        assert_eq!(event.path(), Some("b.txt"));
        assert_eq!(
            Event::Detached {
                reason: None,
                unconfirmed: Vec::new()
            }
            .path(),
            None
        );
    }

    #[tokio::test]
    async fn test_notifier_wakes_waiter_and_runs_callback() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        let stop = CancellationToken::new();
        let notifier = Arc::new(Notifier::<usize>::new());
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&seen);
        notifier.set_callback(Arc::new(move |n| {
            counter.fetch_add(n, Ordering::SeqCst);
        }));

        let waiter = {
            let notifier = Arc::clone(&notifier);
            let stop = stop.clone();
            tokio::spawn(async move { notifier.wait(&stop).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        notifier.notify(|| 5);
        assert!(tokio::time::timeout(Duration::from_secs(1), waiter).await.unwrap().unwrap());
        assert_eq!(seen.load(Ordering::SeqCst), 5);

        notifier.clear_callback();
        notifier.notify(|| 7);
        assert_eq!(seen.load(Ordering::SeqCst), 5);

        stop.cancel();
        assert!(!notifier.wait(&stop).await);
    }
}
