//! One workspace on the authority side: members, file tree and the
//! authoritative replica of every buffer.
//!
//! Lock order: a buffer's mutex may be taken before reading the member map,
//! never the other way around.

use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::buffer::{Applied, Replica, VersionVector};
use crate::error::RemoteError;
use crate::protocol::{ClientMessage, ErrorCode, FrameAssembler, Member, ServerMessage, SyncProtocol};
use crate::session::User;
use crate::transport::WorkspaceLink;
use crate::workspace::FileTree;

/// Authority state of one buffer
#[derive(Debug)]
struct AuthorityBuffer {
    replica: Replica,
    /// Latest version each attached member reported
    acked: HashMap<Uuid, VersionVector>,
    watermark: VersionVector,
    /// Per author, the sequence expected after one of their operations was
    /// rejected. Later sequences still in flight are dropped until it arrives.
    rejected: HashMap<Uuid, u64>,
}

impl AuthorityBuffer {
    fn new() -> Self {
        Self {
            replica: Replica::new(Uuid::nil()),
            acked: HashMap::new(),
            watermark: VersionVector::new(),
            rejected: HashMap::new(),
        }
    }
}

/// A connected member and its link
#[derive(Debug)]
struct MemberLink {
    member: Member,
    tx: mpsc::UnboundedSender<Bytes>,
    attached: HashSet<String>,
    stop: CancellationToken,
    sending: Mutex<()>,
}

impl MemberLink {
    fn send(&self, msg: &ServerMessage) {
        match SyncProtocol::encode_server_frames(msg) {
            Ok(frames) => {
                let _guard = self.sending.lock();
                for frame in frames {
                    if self.tx.send(frame).is_err() {
                        break;
                    }
                }
            }
            Err(err) => warn!("Failed to encode message for {}: {}", self.member.name, err),
        }
    }
}

#[derive(Debug)]
pub(crate) struct WorkspaceRoom {
    name: String,
    owner: String,
    invited: RwLock<HashSet<String>>,
    members: DashMap<Uuid, MemberLink>,
    buffers: DashMap<String, Arc<Mutex<AuthorityBuffer>>>,
    tree: RwLock<FileTree>,
    max_members: usize,
}

impl WorkspaceRoom {
    pub fn new(name: impl Into<String>, owner: impl Into<String>, max_members: usize) -> Self {
        Self {
            name: name.into(),
            owner: owner.into(),
            invited: RwLock::new(HashSet::new()),
            members: DashMap::new(),
            buffers: DashMap::new(),
            tree: RwLock::new(FileTree::new()),
            max_members,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_owner(&self, username: &str) -> bool {
        self.owner == username
    }

    pub fn is_invited(&self, username: &str) -> bool {
        self.invited.read().contains(username)
    }

    pub fn can_access(&self, username: &str) -> bool {
        self.is_owner(username) || self.is_invited(username)
    }

    pub fn invite(&self, username: &str) {
        self.invited.write().insert(username.to_string());
    }

    pub fn is_member(&self, user: &Uuid) -> bool {
        self.members.contains_key(user)
    }

    pub fn member_count(&self) -> usize {
        self.members.len()
    }

    pub fn members(&self) -> Vec<Member> {
        let mut members: Vec<Member> = self.members.iter().map(|m| m.member.clone()).collect();
        members.sort_by_key(|m| m.joined_at);
        members
    }

    pub fn buffers(&self) -> Vec<String> {
        self.tree.read().files()
    }

    pub fn buffer_users(&self, path: &str) -> Result<Vec<Uuid>, RemoteError> {
        if !self.tree.read().is_file(path) {
            return Err(RemoteError::NotFound(path.to_string()));
        }
        Ok(self
            .members
            .iter()
            .filter(|m| m.attached.contains(path))
            .map(|m| *m.key())
            .collect())
    }

    pub fn buffer_text(&self, path: &str) -> Option<String> {
        self.buffers.get(path).map(|b| b.lock().replica.text())
    }

    pub fn buffer_tombstones(&self, path: &str) -> Option<usize> {
        self.buffers.get(path).map(|b| b.lock().replica.tombstones())
    }

    /// Register a member and open its link
    pub fn admit(self: &Arc<Self>, user: &User, color: String) -> Result<WorkspaceLink, RemoteError> {
        if self.is_member(&user.id) {
            return Err(RemoteError::Invalid(format!("{} already joined {}", user.name, self.name)));
        }
        if self.members.len() >= self.max_members {
            return Err(RemoteError::Permission(format!("workspace {} is full", self.name)));
        }

        let member = Member {
            id: user.id,
            name: user.name.clone(),
            color,
            joined_at: chrono::Utc::now().timestamp_millis(),
        };

        let (to_client, inbound) = mpsc::unbounded_channel();
        let (outbound, from_client) = mpsc::unbounded_channel();
        let stop = CancellationToken::new();

        self.broadcast(&ServerMessage::MemberJoined { member: member.clone() }, None);
        self.members.insert(
            user.id,
            MemberLink {
                member: member.clone(),
                tx: to_client,
                attached: HashSet::new(),
                stop: stop.clone(),
                sending: Mutex::new(()),
            },
        );

        tokio::spawn(serve_member(Arc::clone(self), user.id, from_client, stop));
        info!("{} joined workspace {}", user.name, self.name);

        Ok(WorkspaceLink {
            member,
            members: self.members(),
            buffers: self.buffers(),
            outbound,
            inbound,
        })
    }

    /// Drop a member and close its link. Returns whether it was present.
    pub fn remove_member(&self, user: &Uuid, reason: &str) -> bool {
        let Some((_, link)) = self.members.remove(user) else {
            return false;
        };
        link.stop.cancel();

        for path in &link.attached {
            if let Some(buffer) = self.buffer(path) {
                let mut buffer = buffer.lock();
                buffer.acked.remove(user);
                self.advance_watermark(path, &mut buffer);
            }
        }

        self.broadcast(&ServerMessage::MemberLeft { member: link.member.clone() }, None);
        info!("{} left workspace {} ({})", link.member.name, self.name, reason);
        true
    }

    /// Say goodbye to everyone and drop every link
    pub fn close(&self, reason: &str) {
        self.broadcast(
            &ServerMessage::Goodbye {
                reason: Some(reason.to_string()),
            },
            None,
        );
        let ids: Vec<Uuid> = self.members.iter().map(|m| *m.key()).collect();
        for id in ids {
            if let Some((_, link)) = self.members.remove(&id) {
                link.stop.cancel();
            }
        }
    }

    pub fn create_buffer(&self, path: &str, requester: Option<Uuid>) -> Result<String, RemoteError> {
        let path = self
            .tree
            .write()
            .create_file(path)
            .map(|node| node.path.clone())
            .map_err(|e| match e {
                crate::workspace::FileTreeError::PathExists(p) => RemoteError::AlreadyExists(p),
                other => RemoteError::Invalid(other.to_string()),
            })?;

        self.buffers
            .entry(path.clone())
            .or_insert_with(|| Arc::new(Mutex::new(AuthorityBuffer::new())));
        self.broadcast(&ServerMessage::BufferCreated { path: path.clone() }, requester);
        debug!("Buffer {} created in {}", path, self.name);
        Ok(path)
    }

    pub fn delete_buffer(&self, path: &str, requester: Option<Uuid>) -> Result<(), RemoteError> {
        let removed = self
            .tree
            .write()
            .delete(path)
            .map_err(|e| RemoteError::NotFound(e.to_string()))?;

        for node in removed.iter().filter(|n| n.is_file()) {
            self.buffers.remove(&node.path);
            for mut member in self.members.iter_mut() {
                member.attached.remove(&node.path);
            }
            self.broadcast(
                &ServerMessage::BufferDeleted {
                    path: node.path.clone(),
                },
                requester,
            );
        }
        Ok(())
    }

    pub fn rename_buffer(&self, from: &str, to: &str, requester: Option<Uuid>) -> Result<(), RemoteError> {
        let moved = self.tree.write().rename(from, to).map_err(|e| match e {
            crate::workspace::FileTreeError::NodeNotFound(p) => RemoteError::NotFound(p),
            crate::workspace::FileTreeError::PathExists(p) => RemoteError::AlreadyExists(p),
            other => RemoteError::Invalid(other.to_string()),
        })?;

        for (old, new) in &moved {
            if let Some((_, buffer)) = self.buffers.remove(old) {
                buffer.lock().acked.clear();
                self.buffers.insert(new.clone(), buffer);
            }
            // Attachments do not follow a rename; members re-attach by the new path
            for mut member in self.members.iter_mut() {
                member.attached.remove(old);
            }
        }

        self.broadcast(
            &ServerMessage::BufferRenamed {
                from: from.to_string(),
                to: to.to_string(),
            },
            requester,
        );
        Ok(())
    }

    fn buffer(&self, path: &str) -> Option<Arc<Mutex<AuthorityBuffer>>> {
        self.buffers.get(path).map(|b| Arc::clone(b.value()))
    }

    /// Broadcast to every member, optionally skipping one
    fn broadcast(&self, msg: &ServerMessage, exclude: Option<Uuid>) {
        for member in self.members.iter() {
            if Some(*member.key()) != exclude {
                member.send(msg);
            }
        }
    }

    /// Broadcast to the members attached to `path`, optionally skipping one
    fn broadcast_attached(&self, path: &str, msg: &ServerMessage, exclude: Option<Uuid>) {
        for member in self.members.iter() {
            if Some(*member.key()) != exclude && member.attached.contains(path) {
                member.send(msg);
            }
        }
    }

    fn send_to(&self, user: &Uuid, msg: &ServerMessage) {
        if let Some(member) = self.members.get(user) {
            member.send(msg);
        }
    }

    fn send_error(&self, user: &Uuid, code: ErrorCode, message: impl Into<String>, buffer: Option<&str>) {
        self.send_to(
            user,
            &SyncProtocol::error_response(code, message, buffer.map(str::to_string)),
        );
    }

    fn send_snapshot(&self, user: &Uuid, path: &str, buffer: &AuthorityBuffer) {
        self.send_to(
            user,
            &ServerMessage::Snapshot {
                buffer: path.to_string(),
                snapshot: buffer.replica.snapshot(),
            },
        );
    }

    /// Recompute the watermark from the attached members' reports and compact
    fn advance_watermark(&self, path: &str, buffer: &mut AuthorityBuffer) {
        let attached: Vec<Uuid> = self
            .members
            .iter()
            .filter(|m| m.attached.contains(path))
            .map(|m| *m.key())
            .collect();
        if attached.is_empty() {
            return;
        }

        let mut watermark = buffer.replica.version().clone();
        for user in &attached {
            match buffer.acked.get(user) {
                Some(version) => watermark = watermark.meet(version),
                None => return,
            }
        }

        if watermark == buffer.watermark || !watermark.covers(&buffer.watermark) {
            return;
        }

        let removed = buffer.replica.compact(&watermark);
        if removed > 0 {
            debug!("Compacted {} tombstones in {}/{}", removed, self.name, path);
        }
        buffer.watermark = watermark.clone();
        self.broadcast_attached(
            path,
            &ServerMessage::Watermark {
                buffer: path.to_string(),
                version: watermark,
            },
            None,
        );
    }

    fn handle(&self, user: Uuid, msg: ClientMessage) {
        match msg {
            ClientMessage::Goodbye { reason } => {
                self.remove_member(&user, reason.as_deref().unwrap_or("goodbye"));
            }

            ClientMessage::Attach { buffer: path } => {
                if !self.tree.read().is_file(&path) {
                    if let Err(err) = self.create_buffer(&path, Some(user)) {
                        self.send_error(&user, ErrorCode::BufferNotFound, err.to_string(), Some(&path));
                        return;
                    }
                }
                match self.members.get_mut(&user) {
                    Some(mut member) => {
                        member.attached.insert(path.clone());
                    }
                    None => return,
                }
                if let Some(buffer) = self.buffer(&path) {
                    let buffer = buffer.lock();
                    self.send_snapshot(&user, &path, &buffer);
                }
            }

            ClientMessage::Detach { buffer: path } => {
                if let Some(mut member) = self.members.get_mut(&user) {
                    member.attached.remove(&path);
                }
                if let Some(buffer) = self.buffer(&path) {
                    let mut buffer = buffer.lock();
                    buffer.acked.remove(&user);
                    self.advance_watermark(&path, &mut buffer);
                }
            }

            ClientMessage::Operation { buffer: path, op } => {
                let attached = self
                    .members
                    .get(&user)
                    .map_or(false, |m| m.attached.contains(&path));
                let Some(buffer) = self.buffer(&path).filter(|_| attached) else {
                    self.send_error(&user, ErrorCode::NotAttached, "not attached", Some(&path));
                    return;
                };

                let mut buffer = buffer.lock();
                let (id, author) = (op.id, op.author());
                if let Some(expected) = buffer.rejected.get(&author).copied() {
                    if id.seq > expected {
                        debug!("Dropping {} on {}/{}, issued after a rejected operation", id, self.name, path);
                        return;
                    }
                    if id.seq == expected {
                        buffer.rejected.remove(&author);
                    }
                }

                let last = op.last();
                match buffer.replica.apply(op) {
                    Ok(Applied::Duplicate) => {
                        self.send_to(&user, &ServerMessage::Ack { buffer: path, id: last });
                    }
                    Ok(Applied::Parked) => {
                        debug!("Parked {} on {}/{}", id, self.name, path);
                    }
                    Ok(Applied::Integrated { ops, .. }) => {
                        for op in ops {
                            let author = op.author();
                            self.send_to(&author, &ServerMessage::Ack { buffer: path.clone(), id: op.last() });
                            self.broadcast_attached(&path, &ServerMessage::Operation { buffer: path.clone(), op }, Some(author));
                        }
                    }
                    Err(err) => {
                        warn!("Rejected operation {} on {}/{}: {}", id, self.name, path, err);
                        let expected = buffer.replica.version().get(&author).saturating_add(1);
                        buffer.rejected.insert(author, expected);
                        buffer.replica.discard_pending_from(&author);
                        self.send_error(&user, ErrorCode::Integrity, err.to_string(), Some(&path));
                        self.send_snapshot(&user, &path, &buffer);
                    }
                }
            }

            ClientMessage::BufferVersion { buffer: path, version } => {
                if let Some(buffer) = self.buffer(&path) {
                    let mut buffer = buffer.lock();
                    buffer.acked.insert(user, version);
                    self.advance_watermark(&path, &mut buffer);
                }
            }

            ClientMessage::ResyncRequest { buffer: path } => match self.buffer(&path) {
                Some(buffer) => {
                    let buffer = buffer.lock();
                    debug!("Serving resync of {}/{}", self.name, path);
                    self.send_snapshot(&user, &path, &buffer);
                }
                None => self.send_error(&user, ErrorCode::BufferNotFound, "no such buffer", Some(&path)),
            },

            ClientMessage::CursorUpdate { state } => {
                self.broadcast(&ServerMessage::CursorBroadcast { user, state }, Some(user));
            }
        }
    }
}

/// Reads one member's frames until the link closes or the member is removed
async fn serve_member(
    room: Arc<WorkspaceRoom>,
    user: Uuid,
    mut rx: mpsc::UnboundedReceiver<Bytes>,
    stop: CancellationToken,
) {
    let mut assembler = FrameAssembler::new();
    loop {
        tokio::select! {
            _ = stop.cancelled() => break,
            frame = rx.recv() => {
                let Some(frame) = frame else {
                    room.remove_member(&user, "link closed");
                    break;
                };
                match assembler.push_client(&frame) {
                    Ok(Some(msg)) => room.handle(user, msg),
                    Ok(None) => {}
                    Err(err) => {
                        warn!("Invalid frame from {}: {}", user, err);
                        room.send_error(&user, ErrorCode::InvalidMessage, err.to_string(), None);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::TextChange;
    use std::time::Duration;

    fn user(name: &str) -> User {
        User {
            id: Uuid::new_v4(),
            name: name.to_string(),
        }
    }

    async fn next(link: &mut WorkspaceLink) -> ServerMessage {
        let frame = tokio::time::timeout(Duration::from_secs(1), link.inbound.recv())
            .await
            .expect("message expected")
            .expect("link open");
        SyncProtocol::decode_server(&frame).unwrap()
    }

    fn send(link: &WorkspaceLink, msg: ClientMessage) {
        link.outbound.send(SyncProtocol::encode_client(&msg).unwrap()).unwrap();
    }

    #[tokio::test]
    async fn test_admit_and_remove_member() {
        let room = Arc::new(WorkspaceRoom::new("team", "alice", 8));
        let alice = user("alice");
        let bob = user("bob");

        let mut a = room.admit(&alice, "#3b82f6".into()).unwrap();
        let b = room.admit(&bob, "#ef4444".into()).unwrap();
        assert_eq!(b.members.len(), 2);
        assert!(matches!(next(&mut a).await, ServerMessage::MemberJoined { member } if member.id == bob.id));

        assert!(room.admit(&bob, "#000000".into()).is_err());

        assert!(room.remove_member(&bob.id, "test"));
        assert!(!room.remove_member(&bob.id, "test"));
        assert!(matches!(next(&mut a).await, ServerMessage::MemberLeft { member } if member.id == bob.id));
    }

    #[tokio::test]
    async fn test_attach_relay_and_ack() {
        let room = Arc::new(WorkspaceRoom::new("team", "alice", 8));
        let alice = user("alice");
        let bob = user("bob");
        let mut a = room.admit(&alice, "#111111".into()).unwrap();
        let mut b = room.admit(&bob, "#222222".into()).unwrap();
        let _ = next(&mut a).await; // bob joined

        send(&a, ClientMessage::Attach { buffer: "notes.txt".into() });
        assert!(matches!(next(&mut b).await, ServerMessage::BufferCreated { .. }));
        assert!(matches!(next(&mut a).await, ServerMessage::Snapshot { .. }));
        send(&b, ClientMessage::Attach { buffer: "notes.txt".into() });
        assert!(matches!(next(&mut b).await, ServerMessage::Snapshot { .. }));

        let mut replica = Replica::new(alice.id);
        let op = replica.local_change(&TextChange::insertion(0, "hi")).remove(0);
        send(&a, ClientMessage::Operation { buffer: "notes.txt".into(), op: op.clone() });

        assert_eq!(next(&mut a).await, ServerMessage::Ack { buffer: "notes.txt".into(), id: op.last() });
        assert_eq!(next(&mut b).await, ServerMessage::Operation { buffer: "notes.txt".into(), op });
        assert_eq!(room.buffer_text("notes.txt").as_deref(), Some("hi"));
        assert_eq!(room.buffer_users("notes.txt").unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_parked_operation_is_acked_once_integrated() {
        let room = Arc::new(WorkspaceRoom::new("team", "alice", 8));
        let alice = user("alice");
        let bob = user("bob");
        let mut a = room.admit(&alice, "#111111".into()).unwrap();
        let mut b = room.admit(&bob, "#222222".into()).unwrap();
        let _ = next(&mut a).await; // bob joined

        send(&a, ClientMessage::Attach { buffer: "notes.txt".into() });
        assert!(matches!(next(&mut b).await, ServerMessage::BufferCreated { .. }));
        assert!(matches!(next(&mut a).await, ServerMessage::Snapshot { .. }));
        send(&b, ClientMessage::Attach { buffer: "notes.txt".into() });
        assert!(matches!(next(&mut b).await, ServerMessage::Snapshot { .. }));

        let mut replica = Replica::new(alice.id);
        let first = replica.local_change(&TextChange::insertion(0, "ab")).remove(0);
        let second = replica.local_change(&TextChange::insertion(2, "cd")).remove(0);

        // Out of order: no acknowledgement and no relay until it integrates
        send(&a, ClientMessage::Operation { buffer: "notes.txt".into(), op: second.clone() });
        send(&a, ClientMessage::ResyncRequest { buffer: "notes.txt".into() });
        let ServerMessage::Snapshot { snapshot, .. } = next(&mut a).await else {
            panic!("expected the snapshot first");
        };
        assert_eq!(snapshot.text(), "");

        send(&a, ClientMessage::Operation { buffer: "notes.txt".into(), op: first.clone() });
        assert_eq!(next(&mut a).await, ServerMessage::Ack { buffer: "notes.txt".into(), id: first.last() });
        assert_eq!(next(&mut a).await, ServerMessage::Ack { buffer: "notes.txt".into(), id: second.last() });
        assert_eq!(next(&mut b).await, ServerMessage::Operation { buffer: "notes.txt".into(), op: first });
        assert_eq!(next(&mut b).await, ServerMessage::Operation { buffer: "notes.txt".into(), op: second });
        assert_eq!(room.buffer_text("notes.txt").as_deref(), Some("abcd"));
    }

    #[tokio::test]
    async fn test_operations_after_a_rejection_wait_for_reissue() {
        use crate::buffer::{OpId, OpKind, Operation};

        let room = Arc::new(WorkspaceRoom::new("team", "alice", 8));
        let alice = user("alice");
        let mut a = room.admit(&alice, "#111111".into()).unwrap();
        send(&a, ClientMessage::Attach { buffer: "a.txt".into() });
        let _ = next(&mut a).await; // snapshot

        let insert = |seq: u64, left: Option<OpId>, content: &str| Operation {
            id: OpId::new(alice.id, seq),
            version: [(alice.id, seq - 1)].into_iter().collect(),
            kind: OpKind::Insert {
                origin_left: left,
                origin_right: None,
                content: content.into(),
            },
        };

        send(&a, ClientMessage::Operation { buffer: "a.txt".into(), op: insert(1, None, "ab") });
        assert!(matches!(next(&mut a).await, ServerMessage::Ack { .. }));

        let ghost = OpId::new(Uuid::new_v4(), 9);
        send(&a, ClientMessage::Operation { buffer: "a.txt".into(), op: insert(3, Some(ghost), "x") });
        assert!(matches!(
            next(&mut a).await,
            ServerMessage::Error { code: ErrorCode::Integrity, .. }
        ));
        assert!(matches!(next(&mut a).await, ServerMessage::Snapshot { .. }));

        // Still in flight from before the snapshot: dropped
        send(&a, ClientMessage::Operation { buffer: "a.txt".into(), op: insert(4, None, "z") });
        send(&a, ClientMessage::ResyncRequest { buffer: "a.txt".into() });
        assert!(matches!(next(&mut a).await, ServerMessage::Snapshot { .. }));

        let reissued = insert(3, Some(OpId::new(alice.id, 2)), "c");
        send(&a, ClientMessage::Operation { buffer: "a.txt".into(), op: reissued.clone() });
        assert_eq!(next(&mut a).await, ServerMessage::Ack { buffer: "a.txt".into(), id: reissued.last() });
        assert_eq!(room.buffer_text("a.txt").as_deref(), Some("abc"));
    }

    #[tokio::test]
    async fn test_operation_without_attach_is_rejected() {
        let room = Arc::new(WorkspaceRoom::new("team", "alice", 8));
        let alice = user("alice");
        let mut a = room.admit(&alice, "#111111".into()).unwrap();
        room.create_buffer("a.txt", None).unwrap();
        let _ = next(&mut a).await; // created

        let op = Replica::new(alice.id).local_change(&TextChange::insertion(0, "x")).remove(0);
        send(&a, ClientMessage::Operation { buffer: "a.txt".into(), op });
        assert!(matches!(
            next(&mut a).await,
            ServerMessage::Error { code: ErrorCode::NotAttached, .. }
        ));
    }

    #[tokio::test]
    async fn test_watermark_compacts_when_everyone_reports() {
        let room = Arc::new(WorkspaceRoom::new("team", "alice", 8));
        let alice = user("alice");
        let mut a = room.admit(&alice, "#111111".into()).unwrap();
        send(&a, ClientMessage::Attach { buffer: "a.txt".into() });
        let _ = next(&mut a).await; // snapshot

        let mut replica = Replica::new(alice.id);
        for op in replica
            .local_change(&TextChange::insertion(0, "abc"))
            .into_iter()
            .chain(replica.local_change(&TextChange::deletion(0..2)))
        {
            send(&a, ClientMessage::Operation { buffer: "a.txt".into(), op });
            let _ = next(&mut a).await; // ack
        }
        assert_eq!(room.buffer_tombstones("a.txt"), Some(2));

        send(&a, ClientMessage::BufferVersion { buffer: "a.txt".into(), version: replica.version().clone() });
        assert!(matches!(next(&mut a).await, ServerMessage::Watermark { .. }));
        assert_eq!(room.buffer_tombstones("a.txt"), Some(0));
        assert_eq!(room.buffer_text("a.txt").as_deref(), Some("c"));
    }

    #[tokio::test]
    async fn test_closing_link_removes_member() {
        let room = Arc::new(WorkspaceRoom::new("team", "alice", 8));
        let alice = user("alice");
        let bob = user("bob");
        let mut a = room.admit(&alice, "#111111".into()).unwrap();
        let b = room.admit(&bob, "#222222".into()).unwrap();
        let _ = next(&mut a).await; // bob joined

        drop(b);
        assert!(matches!(next(&mut a).await, ServerMessage::MemberLeft { .. }));
        assert!(!room.is_member(&bob.id));
    }

    #[tokio::test]
    async fn test_rename_and_delete_buffers() {
        let room = Arc::new(WorkspaceRoom::new("team", "alice", 8));
        let alice = user("alice");
        let mut a = room.admit(&alice, "#111111".into()).unwrap();

        room.create_buffer("src/a.rs", None).unwrap();
        assert!(matches!(room.create_buffer("src/a.rs", None), Err(RemoteError::AlreadyExists(_))));
        room.rename_buffer("src", "lib", None).unwrap();
        assert_eq!(room.buffers(), vec!["lib/a.rs"]);
        room.delete_buffer("lib/a.rs", None).unwrap();
        assert!(room.buffers().is_empty());

        assert!(matches!(next(&mut a).await, ServerMessage::BufferCreated { .. }));
        assert!(matches!(next(&mut a).await, ServerMessage::BufferRenamed { .. }));
        assert!(matches!(next(&mut a).await, ServerMessage::BufferDeleted { .. }));
    }
}
