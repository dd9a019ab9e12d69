//! Buffer controller: the handle editors use to read, edit and follow a
//! shared buffer.
//!
//! All mutations of a buffer's replica (local edits, remote integration,
//! acknowledgements, compaction, resync) go through one mutex, which is the
//! buffer's ordering point. It is never held across an await, so `read` and
//! `send` never wait on the network. Remote traffic arrives through the
//! buffer's own receive task; outbound operations share the workspace link.
//! Remote changes can be followed as a stream ([`BufferController::subscribe`]),
//! with a callback, or by polling; [`select_buffer`] waits on several buffers
//! at once.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::ops::Range;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::change::TextChange;
use super::crdt::{Applied, OpId, Operation, Replica, ReplicaSnapshot, VersionVector};
use crate::config::Config;
use crate::error::{ConnectionError, DetachedError, DrainTimeout, Error};
use crate::event::{Event, Notifier, Subscription};
use crate::protocol::ClientMessage;
use crate::transport::Outbound;

/// Replication status of a buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BufferStatus {
    /// Waiting for an authoritative snapshot; local edits are queued
    Resyncing,
    /// Replicating normally
    Synced,
    /// An integrity violation was detected; a resync is being requested
    Desynced,
    /// Torn down; every operation fails
    Detached,
}

/// Traffic routed to a buffer by the workspace
#[derive(Debug, Clone)]
pub(crate) enum BufferInbound {
    Snapshot(ReplicaSnapshot),
    Operation(Operation),
    Ack(OpId),
    Watermark(VersionVector),
}

/// Handle to one attached buffer. Cheap to clone.
#[derive(Debug, Clone)]
pub struct BufferController(Arc<BufferInner>);

#[derive(Debug)]
struct BufferInner {
    path: String,
    user: Uuid,
    state: Mutex<BufferState>,
    status: watch::Sender<BufferStatus>,
    unacked_len: watch::Sender<usize>,
    changes: broadcast::Sender<TextChange>,
    events: broadcast::Sender<Event>,
    notify: Notifier<BufferController>,
    outbound: Outbound,
    inbound: mpsc::UnboundedSender<BufferInbound>,
    stop: CancellationToken,
    max_pending: usize,
}

#[derive(Debug)]
struct BufferState {
    replica: Replica,
    /// Local operations not yet acknowledged, in sequence order
    unacked: VecDeque<Operation>,
    /// A resync was triggered by an integrity violation
    recovering: bool,
}

impl BufferController {
    /// Create the controller and its receive task. It starts in
    /// [`BufferStatus::Resyncing`] until the first snapshot arrives.
    pub(crate) fn spawn(
        path: impl Into<String>,
        user: Uuid,
        outbound: Outbound,
        events: broadcast::Sender<Event>,
        config: &Config,
        parent: &CancellationToken,
    ) -> Self {
        let (inbound, rx) = mpsc::unbounded_channel();
        let (changes, _) = broadcast::channel(config.channel_capacity.max(1));
        let (status, _) = watch::channel(BufferStatus::Resyncing);
        let (unacked_len, _) = watch::channel(0);
        let stop = parent.child_token();

        let controller = Self(Arc::new(BufferInner {
            path: path.into(),
            user,
            state: Mutex::new(BufferState {
                replica: Replica::new(user).with_max_pending(config.max_pending_ops),
                unacked: VecDeque::new(),
                recovering: false,
            }),
            status,
            unacked_len,
            changes,
            events,
            notify: Notifier::new(),
            outbound,
            inbound,
            stop: stop.clone(),
            max_pending: config.max_pending_ops,
        }));

        tokio::spawn(receive_loop(Arc::downgrade(&controller.0), rx, stop));
        controller
    }

    pub fn path(&self) -> &str {
        &self.0.path
    }

    pub fn status(&self) -> BufferStatus {
        *self.0.status.borrow()
    }

    pub fn is_detached(&self) -> bool {
        self.status() == BufferStatus::Detached
    }

    /// Current content, reflecting every locally applied operation
    pub fn read(&self) -> Result<String, Error> {
        self.ensure_attached()?;
        Ok(self.0.state.lock().replica.text())
    }

    /// Content length in characters
    pub fn len(&self) -> usize {
        self.0.state.lock().replica.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Everything integrated so far
    pub fn version(&self) -> VersionVector {
        self.0.state.lock().replica.version().clone()
    }

    /// Local operations still waiting for acknowledgement
    pub fn pending_acks(&self) -> usize {
        *self.0.unacked_len.borrow()
    }

    /// Identifiers of the unacknowledged local operations
    pub fn unconfirmed(&self) -> Vec<OpId> {
        self.0.state.lock().unacked.iter().map(|op| op.id).collect()
    }

    /// Replace the characters in `span` with `content`
    pub fn edit(&self, span: Range<usize>, content: impl Into<String>) -> Result<(), Error> {
        self.send(TextChange::new(span, content))
    }

    /// Apply a local change immediately and queue it for replication.
    ///
    /// The span is clamped to the current content. Queued operations are sent
    /// right away while synced, or after the next snapshot otherwise.
    pub fn send(&self, change: TextChange) -> Result<(), Error> {
        self.ensure_attached()?;
        if change.is_empty() {
            return Ok(());
        }

        let mut state = self.0.state.lock();
        let ops = state.replica.local_change(&change);
        let synced = self.status() == BufferStatus::Synced;
        let mut failed = None;

        for op in ops {
            if synced && failed.is_none() {
                failed = self.transmit(&op).err();
            }
            state.unacked.push_back(op);
        }
        self.0.unacked_len.send_replace(state.unacked.len());
        drop(state);

        if let Some(err) = failed {
            self.desync(&format!("could not send local edit: {}", err));
        }
        Ok(())
    }

    /// Stream of remote changes, in the coordinates left by the previous one
    pub fn subscribe(&self) -> Subscription<TextChange> {
        Subscription::new(self.0.changes.subscribe(), &self.0.stop)
    }

    /// Stream of status transitions, starting with the current status
    pub fn watch_status(&self) -> watch::Receiver<BufferStatus> {
        self.0.status.subscribe()
    }

    /// Run `callback` from the receive task whenever remote changes land.
    /// Replaces any previous callback.
    pub fn callback(&self, callback: impl Fn(BufferController) + Send + Sync + 'static) {
        self.0.notify.set_callback(Arc::new(callback));
    }

    pub fn clear_callback(&self) {
        self.0.notify.clear_callback();
    }

    /// Wait for the next remote change without consuming it: subscriptions
    /// still receive it. Fails once the buffer is detached.
    pub async fn poll(&self) -> Result<(), Error> {
        self.ensure_attached()?;
        if self.0.notify.wait(&self.0.stop).await {
            Ok(())
        } else {
            Err(DetachedError::Buffer(self.0.path.clone()).into())
        }
    }

    /// Integrate a remote operation.
    ///
    /// An integrity violation marks the buffer desynced, requests a snapshot
    /// and is returned to the caller.
    pub fn receive(&self, op: Operation) -> Result<(), Error> {
        self.ensure_attached()?;

        let mut state = self.0.state.lock();
        if self.status() != BufferStatus::Synced {
            // The pending snapshot already contains everything relayed before it
            debug!("Ignoring {} on {} while resyncing", op.id, self.0.path);
            return Ok(());
        }

        let outcome = state.replica.apply(op);
        match outcome {
            Ok(Applied::Integrated { changes, .. }) => {
                let changed = !changes.is_empty();
                for change in changes {
                    let _ = self.0.changes.send(change);
                }
                self.report_version(state.replica.version().clone());
                drop(state);
                if changed {
                    self.notify();
                }
                Ok(())
            }
            Ok(Applied::Parked) | Ok(Applied::Duplicate) => Ok(()),
            Err(err) => {
                drop(state);
                self.desync(&err.to_string());
                Err(err.into())
            }
        }
    }

    /// Wait until every local operation is acknowledged or `timeout` elapses
    pub async fn drain(&self, timeout: Duration) -> Result<(), DrainTimeout> {
        let mut rx = self.0.unacked_len.subscribe();
        let drained = matches!(
            tokio::time::timeout(timeout, rx.wait_for(|pending| *pending == 0)).await,
            Ok(Ok(_))
        );

        if drained {
            Ok(())
        } else {
            let unconfirmed = self.unconfirmed();
            warn!(
                "Buffer {} drain timed out with {} unconfirmed operations",
                self.0.path,
                unconfirmed.len()
            );
            Err(DrainTimeout {
                scope: self.0.path.clone(),
                unconfirmed,
            })
        }
    }

    /// Wait for the buffer to reach [`BufferStatus::Synced`]
    pub async fn wait_synced(&self, timeout: Duration) -> Result<(), Error> {
        let mut rx = self.0.status.subscribe();
        let reached = tokio::time::timeout(
            timeout,
            rx.wait_for(|s| matches!(s, BufferStatus::Synced | BufferStatus::Detached)),
        )
        .await;

        match reached {
            Ok(Ok(_)) if !self.is_detached() => Ok(()),
            Ok(_) => Err(DetachedError::Buffer(self.0.path.clone()).into()),
            Err(_) => Err(ConnectionError::Timeout(format!("snapshot of {}", self.0.path)).into()),
        }
    }

    /// Route remote traffic to the receive task
    pub(crate) fn deliver(&self, msg: BufferInbound) {
        let _ = self.0.inbound.send(msg);
    }

    /// Tear down: subscriptions end and every later call fails
    pub(crate) fn stop(&self) {
        self.0.status.send_replace(BufferStatus::Detached);
        self.0.stop.cancel();
        let _ = self.0.outbound.send(&ClientMessage::Detach {
            buffer: self.0.path.clone(),
        });
        debug!("Buffer {} detached", self.0.path);
    }

    pub(crate) fn handle(&self, msg: BufferInbound) {
        if self.is_detached() {
            return;
        }
        match msg {
            BufferInbound::Operation(op) => {
                if let Err(err) = self.receive(op) {
                    debug!("Remote operation on {} rejected: {}", self.0.path, err);
                }
            }
            BufferInbound::Ack(id) => self.acknowledge(id),
            BufferInbound::Watermark(version) => {
                let removed = self.0.state.lock().replica.compact(&version);
                if removed > 0 {
                    debug!("Compacted {} tombstones in {}", removed, self.0.path);
                }
            }
            BufferInbound::Snapshot(snapshot) => self.resync(snapshot),
        }
    }

    fn ensure_attached(&self) -> Result<(), Error> {
        if self.is_detached() {
            Err(DetachedError::Buffer(self.0.path.clone()).into())
        } else {
            Ok(())
        }
    }

    fn transmit(&self, op: &Operation) -> Result<(), Error> {
        let msg = ClientMessage::Operation {
            buffer: self.0.path.clone(),
            op: op.clone(),
        };
        self.0.outbound.send(&msg).map_err(|err| {
            warn!("Could not send {} on {}: {}", op.id, self.0.path, err);
            err
        })
    }

    fn notify(&self) {
        self.0.notify.notify(|| self.clone());
    }

    fn report_version(&self, version: VersionVector) {
        let _ = self.0.outbound.send(&ClientMessage::BufferVersion {
            buffer: self.0.path.clone(),
            version,
        });
    }

    fn acknowledge(&self, id: OpId) {
        let mut state = self.0.state.lock();
        let before = state.unacked.len();
        while state
            .unacked
            .front()
            .map_or(false, |op| op.author() == id.author && op.last().seq <= id.seq)
        {
            state.unacked.pop_front();
        }
        self.0.unacked_len.send_replace(state.unacked.len());

        if state.unacked.len() < before {
            self.report_version(state.replica.version().clone());
        }
    }

    /// Report the replica as inconsistent; the next snapshot recovers it
    fn mark_desynced(&self, reason: &str) {
        warn!("Buffer {} desynced: {}", self.0.path, reason);

        self.0.state.lock().recovering = true;
        self.0.status.send_replace(BufferStatus::Desynced);
        let _ = self.0.events.send(Event::BufferDesynced {
            path: self.0.path.clone(),
            reason: reason.to_string(),
        });
    }

    fn desync(&self, reason: &str) {
        self.mark_desynced(reason);
        match self.0.outbound.send(&ClientMessage::ResyncRequest {
            buffer: self.0.path.clone(),
        }) {
            Ok(()) => {
                self.0.status.send_replace(BufferStatus::Resyncing);
            }
            Err(send_err) => warn!("Could not request resync of {}: {}", self.0.path, send_err),
        }
    }

    /// Replace the replica with an authoritative snapshot and replay the
    /// local operations it does not contain yet.
    fn resync(&self, snapshot: ReplicaSnapshot) {
        let mut state = self.0.state.lock();
        let before = state.replica.text();

        let mut replica = Replica::from_snapshot(self.0.user, snapshot).with_max_pending(self.0.max_pending);
        let mut replayed = VecDeque::new();
        let mut lost = Vec::new();

        for op in state.unacked.drain(..) {
            if replica.version().contains(&op.last()) {
                continue;
            }
            if !lost.is_empty() {
                lost.push(op.id);
                continue;
            }
            match replica.apply(op.clone()) {
                Ok(Applied::Integrated { .. }) => replayed.push_back(op),
                Ok(_) | Err(_) => lost.push(op.id),
            }
        }
        replica.discard_pending();

        if !lost.is_empty() {
            warn!(
                "Buffer {} resync dropped {} local operations the authority never accepted",
                self.0.path,
                lost.len()
            );
        }

        let after = replica.text();
        let version = replica.version().clone();
        state.replica = replica;
        state.unacked = replayed;
        let recovering = std::mem::take(&mut state.recovering);

        self.0.status.send_replace(BufferStatus::Synced);
        let failed = state.unacked.iter().find_map(|op| self.transmit(op).err());
        self.0.unacked_len.send_replace(state.unacked.len());
        drop(state);

        let changed = before != after;
        if changed {
            let _ = self
                .0
                .changes
                .send(TextChange::new(0..before.chars().count(), after));
        }
        self.report_version(version);

        if let Some(err) = failed {
            // Requesting again would replay into the same failure
            self.mark_desynced(&format!("could not resend local edits: {}", err));
            return;
        }
        if changed {
            self.notify();
        }

        if recovering {
            info!("Buffer {} resynced", self.0.path);
            let _ = self.0.events.send(Event::BufferResynced {
                path: self.0.path.clone(),
            });
        }
    }
}

/// Wait until one of `buffers` receives a remote change and return it.
///
/// Returns `None` if `timeout` elapses first or `buffers` is empty. Detached
/// buffers drop out of the race; if all of them are detached the error of the
/// last one is returned.
pub async fn select_buffer(
    buffers: &[BufferController],
    timeout: Option<Duration>,
) -> Result<Option<BufferController>, Error> {
    let mut waiting: Vec<_> = buffers
        .iter()
        .cloned()
        .map(|buffer| Box::pin(async move { buffer.poll().await.map(|_| buffer) }))
        .collect();

    let race = async move {
        let mut failure = None;
        while !waiting.is_empty() {
            let (result, _, rest) = futures_util::future::select_all(waiting).await;
            match result {
                Ok(buffer) => return Ok(Some(buffer)),
                Err(err) => failure = Some(err),
            }
            waiting = rest;
        }
        match failure {
            Some(err) => Err(err),
            None => Ok(None),
        }
    };

    match timeout {
        Some(timeout) => tokio::time::timeout(timeout, race).await.unwrap_or(Ok(None)),
        None => race.await,
    }
}

async fn receive_loop(
    inner: Weak<BufferInner>,
    mut rx: mpsc::UnboundedReceiver<BufferInbound>,
    stop: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = stop.cancelled() => break,
            msg = rx.recv() => {
                let Some(msg) = msg else { break };
                let Some(inner) = inner.upgrade() else { break };
                BufferController(inner).handle(msg);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::crdt::OpKind;
    use crate::error::IntegrityError;
    use crate::protocol::SyncProtocol;
    use bytes::Bytes;

    struct Harness {
        buffer: BufferController,
        wire: mpsc::UnboundedReceiver<Bytes>,
        events: broadcast::Receiver<Event>,
        _root: CancellationToken,
    }

    fn harness() -> Harness {
        let (tx, wire) = mpsc::unbounded_channel();
        let (events_tx, events) = broadcast::channel(16);
        let root = CancellationToken::new();
        let config = Config::default().with_max_pending_ops(64);
        let buffer = BufferController::spawn("notes.txt", Uuid::new_v4(), Outbound::new(tx), events_tx, &config, &root);
        Harness {
            buffer,
            wire,
            events,
            _root: root,
        }
    }

    fn sent(wire: &mut mpsc::UnboundedReceiver<Bytes>) -> Vec<ClientMessage> {
        let mut out = Vec::new();
        while let Ok(frame) = wire.try_recv() {
            out.push(SyncProtocol::decode_client(&frame).unwrap());
        }
        out
    }

    fn sent_ops(wire: &mut mpsc::UnboundedReceiver<Bytes>) -> Vec<Operation> {
        sent(wire)
            .into_iter()
            .filter_map(|m| match m {
                ClientMessage::Operation { op, .. } => Some(op),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn test_edits_are_local_first() {
        let h = harness();
        drop(h.wire);

        h.buffer.edit(0..0, "offline").unwrap();
        assert_eq!(h.buffer.read().unwrap(), "offline");
        assert_eq!(h.buffer.pending_acks(), 1);
    }

    #[tokio::test]
    async fn test_edits_queue_until_first_snapshot() {
        let mut h = harness();
        assert_eq!(h.buffer.status(), BufferStatus::Resyncing);

        h.buffer.edit(0..0, "early").unwrap();
        assert!(sent_ops(&mut h.wire).is_empty());

        h.buffer.handle(BufferInbound::Snapshot(ReplicaSnapshot::default()));
        assert_eq!(h.buffer.status(), BufferStatus::Synced);
        assert_eq!(h.buffer.read().unwrap(), "early");

        let ops = sent_ops(&mut h.wire);
        assert_eq!(ops.len(), 1);
        assert_eq!(h.buffer.pending_acks(), 1);
    }

    #[tokio::test]
    async fn test_ack_drains_queue() {
        let mut h = harness();
        h.buffer.handle(BufferInbound::Snapshot(ReplicaSnapshot::default()));

        h.buffer.edit(0..0, "abc").unwrap();
        h.buffer.edit(3..3, "d").unwrap();
        let ops = sent_ops(&mut h.wire);
        assert_eq!(ops.len(), 2);
        assert_eq!(h.buffer.pending_acks(), 2);

        h.buffer.handle(BufferInbound::Ack(ops[0].last()));
        assert_eq!(h.buffer.pending_acks(), 1);

        let buffer = h.buffer.clone();
        let last = ops[1].last();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            buffer.deliver(BufferInbound::Ack(last));
        });
        h.buffer.drain(Duration::from_secs(1)).await.unwrap();
        assert_eq!(h.buffer.pending_acks(), 0);
    }

    #[tokio::test]
    async fn test_drain_timeout_reports_unconfirmed() {
        let h = harness();
        h.buffer.handle(BufferInbound::Snapshot(ReplicaSnapshot::default()));
        h.buffer.edit(0..0, "lost?").unwrap();

        let err = h.buffer.drain(Duration::from_millis(30)).await.unwrap_err();
        assert_eq!(err.scope, "notes.txt");
        assert_eq!(err.unconfirmed.len(), 1);
    }

    #[tokio::test]
    async fn test_remote_changes_reach_subscribers() {
        let h = harness();
        h.buffer.handle(BufferInbound::Snapshot(ReplicaSnapshot::default()));
        let mut sub = h.buffer.subscribe();

        let mut remote = Replica::new(Uuid::new_v4());
        let ops = remote.local_change(&TextChange::insertion(0, "hi"));
        h.buffer.receive(ops[0].clone()).unwrap();

        assert_eq!(h.buffer.read().unwrap(), "hi");
        assert_eq!(sub.recv().await, Some(TextChange::insertion(0, "hi")));
    }

    #[tokio::test]
    async fn test_integrity_error_triggers_resync() {
        let mut h = harness();
        h.buffer.handle(BufferInbound::Snapshot(ReplicaSnapshot::default()));
        h.buffer.edit(0..0, "hello").unwrap();
        let authoritative = {
            let mut hub = Replica::new(Uuid::nil());
            for op in sent_ops(&mut h.wire) {
                hub.apply(op).unwrap();
            }
            hub
        };

        let stranger = Uuid::new_v4();
        let ghost = OpId::new(Uuid::new_v4(), 1);
        let bad = Operation {
            id: OpId::new(stranger, 1),
            version: [(ghost.author, 1)].into_iter().collect(),
            kind: OpKind::Insert {
                origin_left: Some(ghost),
                origin_right: None,
                content: "?".into(),
            },
        };
        // Make the marker satisfiable so the reference itself is what fails
        {
            let mut state = h.buffer.0.state.lock();
            let mut snapshot = state.replica.snapshot();
            snapshot.version.observe(ghost.author, 1);
            state.replica = Replica::from_snapshot(h.buffer.0.user, snapshot);
        }

        let err = h.buffer.receive(bad).unwrap_err();
        assert!(matches!(err, Error::Integrity(IntegrityError::UnknownReference { .. })));
        assert_eq!(h.buffer.status(), BufferStatus::Resyncing);
        assert_eq!(h.buffer.read().unwrap(), "hello");

        let requested = sent(&mut h.wire)
            .into_iter()
            .any(|m| matches!(m, ClientMessage::ResyncRequest { .. }));
        assert!(requested);
        assert!(matches!(
            h.events.try_recv().unwrap(),
            Event::BufferDesynced { .. }
        ));

        h.buffer.handle(BufferInbound::Snapshot(authoritative.snapshot()));
        assert_eq!(h.buffer.status(), BufferStatus::Synced);
        assert_eq!(h.buffer.read().unwrap(), authoritative.text());
        assert!(matches!(
            h.events.try_recv().unwrap(),
            Event::BufferResynced { .. }
        ));
    }

    #[tokio::test]
    async fn test_resync_replays_unacknowledged_edits() {
        let mut h = harness();
        h.buffer.handle(BufferInbound::Snapshot(ReplicaSnapshot::default()));

        h.buffer.edit(0..0, "ab").unwrap();
        let first = sent_ops(&mut h.wire);
        h.buffer.edit(2..2, "c").unwrap();
        let _second = sent_ops(&mut h.wire);

        // Authority only has the first edit, plus someone else's text
        let mut hub = Replica::new(Uuid::nil());
        hub.apply(first[0].clone()).unwrap();
        let mut other = Replica::from_snapshot(Uuid::new_v4(), hub.snapshot());
        for op in other.local_change(&TextChange::insertion(0, ">")) {
            hub.apply(op).unwrap();
        }

        h.buffer.handle(BufferInbound::Snapshot(hub.snapshot()));
        assert_eq!(h.buffer.read().unwrap(), ">abc");
        assert_eq!(h.buffer.pending_acks(), 1);
        assert_eq!(sent_ops(&mut h.wire).len(), 1);
    }

    #[tokio::test]
    async fn test_transmit_failure_desyncs() {
        let mut h = harness();
        h.buffer.handle(BufferInbound::Snapshot(ReplicaSnapshot::default()));
        drop(h.wire);

        h.buffer.edit(0..0, "unsent").unwrap();
        assert_eq!(h.buffer.read().unwrap(), "unsent");
        assert_eq!(h.buffer.pending_acks(), 1);
        assert_eq!(h.buffer.status(), BufferStatus::Desynced);
        assert!(matches!(
            h.events.try_recv().unwrap(),
            Event::BufferDesynced { reason, .. } if reason.contains("could not send")
        ));
    }

    #[tokio::test]
    async fn test_callback_and_poll_follow_remote_changes() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        let h = harness();
        h.buffer.handle(BufferInbound::Snapshot(ReplicaSnapshot::default()));
        let mut sub = h.buffer.subscribe();

        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        h.buffer.callback(move |buffer| {
            assert_eq!(buffer.path(), "notes.txt");
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let mut remote = Replica::new(Uuid::new_v4());
        let first = remote.local_change(&TextChange::insertion(0, "hi")).remove(0);
        let second = remote.local_change(&TextChange::insertion(2, "!")).remove(0);

        let polled = {
            let buffer = h.buffer.clone();
            tokio::spawn(async move { buffer.poll().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        h.buffer.deliver(BufferInbound::Operation(first));
        tokio::time::timeout(Duration::from_secs(1), polled)
            .await
            .expect("poll should resolve")
            .unwrap()
            .unwrap();

        // Polling consumed nothing
        assert_eq!(sub.recv().await, Some(TextChange::insertion(0, "hi")));
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        h.buffer.clear_callback();
        h.buffer.receive(second).unwrap();
        assert_eq!(sub.recv().await, Some(TextChange::insertion(2, "!")));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_select_buffer_returns_first_changed() {
        let quiet = harness();
        let busy = harness();
        for h in [&quiet, &busy] {
            h.buffer.handle(BufferInbound::Snapshot(ReplicaSnapshot::default()));
        }
        let buffers = vec![quiet.buffer.clone(), busy.buffer.clone()];

        assert!(select_buffer(&buffers, Some(Duration::from_millis(20)))
            .await
            .unwrap()
            .is_none());

        let mut remote = Replica::new(Uuid::new_v4());
        let op = remote.local_change(&TextChange::insertion(0, "ping")).remove(0);
        let target = busy.buffer.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            target.deliver(BufferInbound::Operation(op));
        });

        let selected = select_buffer(&buffers, Some(Duration::from_secs(1)))
            .await
            .unwrap()
            .expect("a buffer changed");
        assert_eq!(selected.read().unwrap(), "ping");

        quiet.buffer.stop();
        busy.buffer.stop();
        assert!(matches!(select_buffer(&buffers, None).await, Err(Error::Detached(_))));
    }

    #[tokio::test]
    async fn test_detached_buffer_rejects_calls() {
        let h = harness();
        let mut sub = h.buffer.subscribe();
        h.buffer.stop();

        assert!(matches!(h.buffer.read(), Err(Error::Detached(_))));
        assert!(matches!(h.buffer.edit(0..0, "x"), Err(Error::Detached(_))));
        assert_eq!(sub.recv().await, None);
        assert!(h.buffer.wait_synced(Duration::from_millis(10)).await.is_err());
    }
}
