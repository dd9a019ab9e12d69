//! Cursor controller: local publishing and remote presence for one workspace.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};
use uuid::Uuid;

use super::{CursorState, CursorUpdate};
use crate::error::{DetachedError, Error};
use crate::event::{Notifier, Subscription};
use crate::protocol::ClientMessage;
use crate::transport::Outbound;

/// Timestamps above this are refused so the local clock can always move past
/// every stored value
pub const MAX_TIMESTAMP: u64 = u64::MAX / 2;

/// Departed members remembered at once; the oldest is forgotten first
const DEPARTED_CAPACITY: usize = 128;

/// Handle to a workspace's cursor map. Cheap to clone.
#[derive(Debug, Clone)]
pub struct CursorController(Arc<CursorInner>);

#[derive(Debug)]
struct CursorInner {
    user: Uuid,
    cursors: DashMap<Uuid, CursorState>,
    /// Members that left; late updates from them are dropped
    departed: Mutex<VecDeque<Uuid>>,
    clock: AtomicU64,
    updates: broadcast::Sender<CursorUpdate>,
    notify: Notifier<CursorController>,
    outbound: Outbound,
    inbound: mpsc::UnboundedSender<CursorUpdate>,
    stop: CancellationToken,
}

impl CursorController {
    /// Create the controller and its receive task
    pub(crate) fn spawn(
        user: Uuid,
        outbound: Outbound,
        capacity: usize,
        parent: &CancellationToken,
    ) -> Self {
        let (inbound, rx) = mpsc::unbounded_channel();
        let (updates, _) = broadcast::channel(capacity.max(1));
        let stop = parent.child_token();

        let controller = Self(Arc::new(CursorInner {
            user,
            cursors: DashMap::new(),
            departed: Mutex::new(VecDeque::new()),
            clock: AtomicU64::new(0),
            updates,
            notify: Notifier::new(),
            outbound,
            inbound,
            stop: stop.clone(),
        }));

        tokio::spawn(receive_loop(Arc::downgrade(&controller.0), rx, stop));
        controller
    }

    /// Identity this controller publishes as
    pub fn user(&self) -> Uuid {
        self.0.user
    }

    /// Publish the local cursor. Never blocks; the returned state carries the
    /// assigned timestamp.
    pub fn publish(&self, state: CursorState) -> Result<CursorState, Error> {
        if self.0.stop.is_cancelled() {
            return Err(DetachedError::Cursor.into());
        }

        let timestamp = self.tick(state.timestamp);
        let state = CursorState::new(state.buffer, state.start, state.end).with_timestamp(timestamp);

        self.store(self.0.user, state.clone());
        self.0.outbound.send(&ClientMessage::CursorUpdate {
            state: state.clone(),
        })?;
        Ok(state)
    }

    /// Latest known cursor of a member
    pub fn get(&self, user: &Uuid) -> Option<CursorState> {
        self.0.cursors.get(user).map(|c| c.clone())
    }

    /// Every known cursor
    pub fn states(&self) -> Vec<CursorUpdate> {
        let mut states: Vec<CursorUpdate> = self
            .0
            .cursors
            .iter()
            .map(|entry| CursorUpdate {
                user: *entry.key(),
                state: entry.value().clone(),
            })
            .collect();
        states.sort_by_key(|u| u.user);
        states
    }

    /// Current cursors followed by every accepted update
    pub fn subscribe(&self) -> Subscription<CursorUpdate> {
        let rx = self.0.updates.subscribe();
        Subscription::new(rx, &self.0.stop).with_backlog(self.states())
    }

    pub fn is_detached(&self) -> bool {
        self.0.stop.is_cancelled()
    }

    /// Run `callback` from the receive task whenever a remote cursor moves.
    /// Replaces any previous callback.
    pub fn callback(&self, callback: impl Fn(CursorController) + Send + Sync + 'static) {
        self.0.notify.set_callback(Arc::new(callback));
    }

    pub fn clear_callback(&self) {
        self.0.notify.clear_callback();
    }

    /// Wait for the next accepted remote update without consuming it
    pub async fn poll(&self) -> Result<(), Error> {
        if self.is_detached() {
            return Err(DetachedError::Cursor.into());
        }
        if self.0.notify.wait(&self.0.stop).await {
            Ok(())
        } else {
            Err(DetachedError::Cursor.into())
        }
    }

    /// Apply a remote update unless an equal or newer one is already stored.
    /// Returns whether it was accepted.
    pub(crate) fn apply_remote(&self, user: Uuid, state: CursorState) -> bool {
        if self.0.departed.lock().contains(&user) {
            trace!("Dropping cursor update from departed member {}", user);
            return false;
        }
        if state.timestamp > MAX_TIMESTAMP {
            trace!("Dropping cursor update from {} with timestamp {}", user, state.timestamp);
            return false;
        }
        self.0.clock.fetch_max(state.timestamp, Ordering::SeqCst);
        let accepted = self.store(user, state);
        if accepted {
            self.0.notify.notify(|| self.clone());
        }
        accepted
    }

    /// Hand a remote update to the receive task
    pub(crate) fn deliver(&self, user: Uuid, state: CursorState) {
        let _ = self.0.inbound.send(CursorUpdate { user, state });
    }

    /// Member departed: drop their cursor
    pub(crate) fn remove(&self, user: &Uuid) {
        {
            let mut departed = self.0.departed.lock();
            if !departed.contains(user) {
                if departed.len() == DEPARTED_CAPACITY {
                    departed.pop_front();
                }
                departed.push_back(*user);
            }
        }
        if self.0.cursors.remove(user).is_some() {
            debug!("Removed cursor of departed member {}", user);
        }
    }

    /// Member (re)joined: accept their updates again
    pub(crate) fn admit(&self, user: &Uuid) {
        self.0.departed.lock().retain(|u| u != user);
    }

    pub(crate) fn stop(&self) {
        self.0.stop.cancel();
    }

    fn tick(&self, at_least: u64) -> u64 {
        let at_least = at_least.min(MAX_TIMESTAMP);
        let previous = self
            .0
            .clock
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |t| {
                Some(t.max(at_least).saturating_add(1))
            })
            .unwrap_or_else(|t| t);
        previous.max(at_least).saturating_add(1)
    }

    #[cfg(test)]
    fn departed_len(&self) -> usize {
        self.0.departed.lock().len()
    }

    /// Last-writer-wins insert; the entry guard makes check-and-set atomic
    fn store(&self, user: Uuid, state: CursorState) -> bool {
        let accepted = match self.0.cursors.entry(user) {
            Entry::Occupied(mut entry) => {
                if state.timestamp > entry.get().timestamp {
                    entry.insert(state.clone());
                    true
                } else {
                    false
                }
            }
            Entry::Vacant(entry) => {
                entry.insert(state.clone());
                true
            }
        };

        if accepted {
            let _ = self.0.updates.send(CursorUpdate { user, state });
        }
        accepted
    }
}

async fn receive_loop(
    inner: Weak<CursorInner>,
    mut rx: mpsc::UnboundedReceiver<CursorUpdate>,
    stop: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = stop.cancelled() => break,
            update = rx.recv() => {
                let Some(update) = update else { break };
                let Some(inner) = inner.upgrade() else { break };
                CursorController(inner).apply_remote(update.user, update.state);
            }
        }
    }
    debug!("Cursor receive task stopped");
}
