//! Workspace: the buffers, cursors, members and file tree of one joined
//! workspace.
//!
//! A workspace moves through `Joining -> Active -> Leaving -> Detached`.
//! While active, a router task reads the link and hands each message to the
//! controller it concerns; controllers run their own receive tasks, so
//! buffers never wait on each other. Leaving drains every buffer in
//! parallel, bounded by the configured drain timeout, and always ends
//! detached.

pub mod file_tree;
mod worker;

pub use file_tree::{FileNode, FileTree, FileTreeError, FileType, NestedNode};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures_util::future::join_all;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::buffer::{BufferController, OpId};
use crate::config::Config;
use crate::cursor::CursorController;
use crate::error::{DetachedError, DrainTimeout, Error, RemoteError, Result};
use crate::event::{Event, Subscription};
use crate::protocol::{ClientMessage, Member};
use crate::session::{SharedToken, User};
use crate::transport::{request, Outbound, Transport, WorkspaceLink};

/// Lifecycle of a joined workspace
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkspaceState {
    /// Waiting for the authority to accept the join
    Joining,
    /// Fully usable
    Active,
    /// Draining buffers before teardown
    Leaving,
    /// Terminal; every operation fails
    Detached,
}

/// Handle to a joined workspace. Cheap to clone.
#[derive(Clone)]
pub struct Workspace(Arc<WorkspaceInner>);

pub(crate) struct WorkspaceInner {
    name: String,
    user: User,
    transport: Arc<dyn Transport>,
    token: SharedToken,
    config: Config,
    state: watch::Sender<WorkspaceState>,
    cursor: CursorController,
    buffers: DashMap<String, BufferController>,
    members: DashMap<Uuid, Member>,
    tree: RwLock<FileTree>,
    events: broadcast::Sender<Event>,
    outbound: Outbound,
    stop: CancellationToken,
}

impl Drop for WorkspaceInner {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}

impl Workspace {
    /// Open a link to `name` and start routing its traffic
    pub(crate) async fn join(
        name: &str,
        user: User,
        transport: Arc<dyn Transport>,
        token: SharedToken,
        config: Config,
    ) -> Result<Self> {
        let (state, _) = watch::channel(WorkspaceState::Joining);
        debug!("Joining workspace {}", name);

        let current = token.read().clone();
        let WorkspaceLink {
            member,
            members,
            buffers,
            outbound,
            inbound,
        } = request(
            config.request_timeout,
            format!("join {}", name),
            transport.join(&current, name),
        )
        .await?;

        let stop = CancellationToken::new();
        let outbound = Outbound::new(outbound);
        let (events, _) = broadcast::channel(config.channel_capacity.max(1));
        let cursor = CursorController::spawn(member.id, outbound.clone(), config.channel_capacity, &stop);

        let inner = Arc::new(WorkspaceInner {
            name: name.to_string(),
            user,
            transport,
            token,
            state,
            cursor,
            buffers: DashMap::new(),
            members: members.into_iter().map(|m| (m.id, m)).collect(),
            tree: RwLock::new(FileTree::from_files(&buffers)),
            events,
            outbound,
            stop: stop.clone(),
            config,
        });

        tokio::spawn(worker::route(Arc::downgrade(&inner), inbound, stop));
        inner.state.send_replace(WorkspaceState::Active);
        info!("Joined workspace {} as {} ({})", name, member.name, member.color);

        Ok(Self(inner))
    }

    pub fn name(&self) -> &str {
        &self.0.name
    }

    /// Identity this workspace was joined with
    pub fn user(&self) -> &User {
        &self.0.user
    }

    pub fn state(&self) -> WorkspaceState {
        *self.0.state.borrow()
    }

    /// Stream of state transitions, starting with the current state
    pub fn watch_state(&self) -> watch::Receiver<WorkspaceState> {
        self.0.state.subscribe()
    }

    pub fn is_detached(&self) -> bool {
        self.state() == WorkspaceState::Detached
    }

    /// Whether both handles refer to the same joined workspace
    pub fn same(&self, other: &Workspace) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    pub fn cursor(&self) -> CursorController {
        self.0.cursor.clone()
    }

    /// Membership, file tree and buffer lifecycle notifications.
    ///
    /// [`Event::Detached`] is always the last event; the stream itself stays
    /// open until cancelled or until every handle of the workspace is dropped.
    pub fn events(&self) -> Subscription<Event> {
        Subscription::new(self.0.events.subscribe(), &CancellationToken::new())
    }

    /// Attach to a buffer, creating it if the file does not exist.
    ///
    /// The buffer is returned once it holds a snapshot, whether this call
    /// or an earlier one attached it.
    pub async fn attach(&self, path: &str) -> Result<BufferController> {
        self.ensure_active()?;
        let path = normalize(path)?;

        let (buffer, attaching) = match self.0.buffers.entry(path.clone()) {
            Entry::Occupied(entry) => (entry.get().clone(), false),
            Entry::Vacant(entry) => {
                let buffer = BufferController::spawn(
                    path.clone(),
                    self.0.user.id,
                    self.0.outbound.clone(),
                    self.0.events.clone(),
                    &self.0.config,
                    &self.0.stop,
                );
                (entry.insert(buffer).clone(), true)
            }
        };
        if !attaching {
            buffer.wait_synced(self.0.config.request_timeout).await?;
            return Ok(buffer);
        }

        let attached = match self.0.outbound.send(&ClientMessage::Attach { buffer: path.clone() }) {
            Ok(()) => buffer.wait_synced(self.0.config.request_timeout).await,
            Err(err) => Err(err),
        };
        if let Err(err) = attached {
            warn!("Attaching {} in {} failed: {}", path, self.0.name, err);
            self.0.buffers.remove(&path);
            buffer.stop();
            return Err(err);
        }

        let _ = self.0.tree.write().create_file(&path);
        debug!("Attached {} in {}", path, self.0.name);
        Ok(buffer)
    }

    /// Stop replicating a buffer after draining its local operations.
    ///
    /// The buffer is removed even when the drain times out.
    pub async fn detach(&self, path: &str) -> Result<()> {
        self.ensure_active()?;
        let path = normalize(path)?;
        let Some((_, buffer)) = self.0.buffers.remove(&path) else {
            return Ok(());
        };

        let drained = buffer.drain(self.0.config.drain_timeout).await;
        buffer.stop();
        debug!("Detached {} in {}", path, self.0.name);
        drained.map_err(Error::Timeout)
    }

    /// Attached buffer by path
    pub fn get_buffer(&self, path: &str) -> Result<Option<BufferController>> {
        self.ensure_active()?;
        let path = normalize(path)?;
        Ok(self.0.buffers.get(&path).map(|b| b.clone()))
    }

    /// Paths of the attached buffers, sorted
    pub fn active_buffers(&self) -> Vec<String> {
        let mut paths: Vec<String> = self.0.buffers.iter().map(|b| b.key().clone()).collect();
        paths.sort();
        paths
    }

    /// Add a file to the shared tree
    pub async fn create_buffer(&self, path: &str) -> Result<()> {
        self.ensure_active()?;
        let path = normalize(path)?;
        let token = self.token();
        request(
            self.0.config.request_timeout,
            format!("create {}", path),
            self.0.transport.create_buffer(&token, &self.0.name, &path),
        )
        .await?;

        let _ = self.0.tree.write().create_file(&path);
        self.emit(Event::BufferCreated { path });
        Ok(())
    }

    /// Remove a file (or a directory and everything under it) from the shared
    /// tree.
    ///
    /// Attached buffers under it are drained first, bounded by the drain
    /// timeout, then detached. Operations still unconfirmed are listed in the
    /// returned [`Error::Timeout`]; the deletion happens regardless.
    pub async fn delete_buffer(&self, path: &str) -> Result<()> {
        self.ensure_active()?;
        let path = normalize(path)?;
        let unconfirmed = self.drain_subtree(&path).await;
        let token = self.token();
        request(
            self.0.config.request_timeout,
            format!("delete {}", path),
            self.0.transport.delete_buffer(&token, &self.0.name, &path),
        )
        .await?;

        for deleted in self.forget_subtree(&path) {
            self.emit(Event::BufferDeleted { path: deleted });
        }
        unconfirmed.map_or(Ok(()), |timeout| Err(Error::Timeout(timeout)))
    }

    /// Move a file or directory. Attached buffers under `from` are drained
    /// like on deletion, then detached; they have to be attached again by
    /// their new path.
    pub async fn rename(&self, from: &str, to: &str) -> Result<()> {
        self.ensure_active()?;
        let from = normalize(from)?;
        let to = normalize(to)?;
        let unconfirmed = self.drain_subtree(&from).await;
        let token = self.token();
        request(
            self.0.config.request_timeout,
            format!("rename {} to {}", from, to),
            self.0.transport.rename_buffer(&token, &self.0.name, &from, &to),
        )
        .await?;

        self.apply_rename(&from, &to);
        self.emit(Event::BufferRenamed { from, to });
        unconfirmed.map_or(Ok(()), |timeout| Err(Error::Timeout(timeout)))
    }

    /// Ask the authority for the member list and refresh the local copy
    pub async fn fetch_users(&self) -> Result<Vec<Member>> {
        self.ensure_active()?;
        let token = self.token();
        let members = request(
            self.0.config.request_timeout,
            format!("members of {}", self.0.name),
            self.0.transport.list_members(&token, &self.0.name),
        )
        .await?;

        self.0.members.clear();
        for member in &members {
            self.0.members.insert(member.id, member.clone());
        }
        Ok(members)
    }

    /// Members as last seen, in join order
    pub fn user_list(&self) -> Result<Vec<Member>> {
        self.ensure_active()?;
        let mut members: Vec<Member> = self.0.members.iter().map(|m| m.value().clone()).collect();
        members.sort_by_key(|m| (m.joined_at, m.id));
        Ok(members)
    }

    /// Ask the authority for the file list and refresh the local tree
    pub async fn fetch_buffers(&self) -> Result<Vec<String>> {
        self.ensure_active()?;
        let token = self.token();
        let files = request(
            self.0.config.request_timeout,
            format!("buffers of {}", self.0.name),
            self.0.transport.list_buffers(&token, &self.0.name),
        )
        .await?;

        *self.0.tree.write() = FileTree::from_files(&files);
        Ok(self.0.tree.read().files())
    }

    /// File paths from the local tree: equal to `filter` when `strict`,
    /// starting with it otherwise
    pub fn search_buffers(&self, filter: Option<&str>, strict: bool) -> Result<Vec<String>> {
        self.ensure_active()?;
        Ok(self.0.tree.read().search(filter, strict))
    }

    /// Members currently attached to a buffer
    pub async fn fetch_buffer_users(&self, path: &str) -> Result<Vec<Member>> {
        self.ensure_active()?;
        let path = normalize(path)?;
        let token = self.token();
        let ids = request(
            self.0.config.request_timeout,
            format!("users of {}", path),
            self.0.transport.list_buffer_users(&token, &self.0.name, &path),
        )
        .await?;

        Ok(ids
            .into_iter()
            .filter_map(|id| self.0.members.get(&id).map(|m| m.value().clone()))
            .collect())
    }

    /// Nested view of the local file tree
    pub fn file_tree(&self) -> Result<NestedNode> {
        self.ensure_active()?;
        Ok(self.0.tree.read().to_nested(&self.0.name))
    }

    /// Drain every buffer, tear down and tell the authority.
    ///
    /// Calling it again, or on a workspace that already detached, does
    /// nothing. Teardown completes even when the drain times out; the
    /// returned [`Error::Timeout`] lists the unconfirmed operations.
    pub async fn leave(&self) -> Result<()> {
        let began = self.0.state.send_if_modified(|state| {
            if *state == WorkspaceState::Active {
                *state = WorkspaceState::Leaving;
                true
            } else {
                false
            }
        });
        if !began {
            debug!("Workspace {} already leaving or detached", self.0.name);
            return Ok(());
        }
        info!("Leaving workspace {}", self.0.name);

        let buffers: Vec<BufferController> = self.0.buffers.iter().map(|b| b.value().clone()).collect();
        let timeout = self.0.config.drain_timeout;
        let drained = join_all(buffers.iter().map(|b| b.drain(timeout))).await;
        let unconfirmed = DrainTimeout::merge(
            self.0.name.clone(),
            drained.into_iter().filter_map(|d| d.err()),
        );

        self.shutdown();
        let token = self.token();
        let left = request(
            self.0.config.request_timeout,
            format!("leave {}", self.0.name),
            self.0.transport.leave(&token, &self.0.name),
        )
        .await;
        if let Err(err) = left {
            debug!("Leave of {} not confirmed: {}", self.0.name, err);
            let _ = self.0.outbound.send(&ClientMessage::Goodbye {
                reason: Some("leaving".to_string()),
            });
        }

        self.finish(
            None,
            unconfirmed.as_ref().map(|t| t.unconfirmed.clone()).unwrap_or_default(),
        );
        match unconfirmed {
            Some(timeout) => {
                warn!("{}", timeout);
                Err(Error::Timeout(timeout))
            }
            None => Ok(()),
        }
    }

    fn ensure_active(&self) -> Result<()> {
        match self.state() {
            WorkspaceState::Active => Ok(()),
            _ => Err(DetachedError::Workspace(self.0.name.clone()).into()),
        }
    }

    fn token(&self) -> String {
        self.0.token.read().clone()
    }

    fn emit(&self, event: Event) {
        let _ = self.0.events.send(event);
    }

    /// Stop every controller and the router
    fn shutdown(&self) {
        let paths: Vec<String> = self.0.buffers.iter().map(|b| b.key().clone()).collect();
        for path in paths {
            if let Some((_, buffer)) = self.0.buffers.remove(&path) {
                buffer.stop();
            }
        }
        self.0.cursor.stop();
    }

    fn finish(&self, reason: Option<String>, unconfirmed: Vec<OpId>) {
        self.0.state.send_replace(WorkspaceState::Detached);
        self.emit(Event::Detached { reason, unconfirmed });
        self.0.stop.cancel();
        info!("Workspace {} detached", self.0.name);
    }

    /// The link is gone: tear down without draining
    pub(crate) fn lost_link(&self, reason: String) {
        let began = self.0.state.send_if_modified(|state| {
            if *state == WorkspaceState::Active {
                *state = WorkspaceState::Leaving;
                true
            } else {
                false
            }
        });
        if !began {
            return;
        }

        let unconfirmed: Vec<OpId> = self
            .0
            .buffers
            .iter()
            .flat_map(|b| b.value().unconfirmed())
            .collect();
        if unconfirmed.is_empty() {
            warn!("Workspace {} lost its link: {}", self.0.name, reason);
        } else {
            warn!(
                "Workspace {} lost its link with {} unconfirmed operations: {}",
                self.0.name,
                unconfirmed.len(),
                reason
            );
        }
        self.shutdown();
        self.finish(Some(reason), unconfirmed);
    }

    /// Attached buffers at `path` or below it
    fn subtree_buffers(&self, path: &str) -> Vec<BufferController> {
        self.0
            .buffers
            .iter()
            .filter(|b| file_tree::is_within(b.key(), path))
            .map(|b| b.value().clone())
            .collect()
    }

    /// Drain the attached buffers under `path` in parallel
    async fn drain_subtree(&self, path: &str) -> Option<DrainTimeout> {
        let buffers = self.subtree_buffers(path);
        if buffers.is_empty() {
            return None;
        }
        let timeout = self.0.config.drain_timeout;
        let drained = join_all(buffers.iter().map(|b| b.drain(timeout))).await;
        DrainTimeout::merge(path, drained.into_iter().filter_map(|d| d.err()))
    }

    /// Tear down an attached buffer whose file went away
    fn drop_buffer(&self, path: &str) {
        if let Some((_, buffer)) = self.0.buffers.remove(path) {
            let unconfirmed = buffer.unconfirmed();
            buffer.stop();
            self.emit(Event::BufferDetached {
                path: path.to_string(),
                unconfirmed,
            });
        }
    }

    /// Drop a subtree from the local tree and detach its buffers.
    /// Returns the removed file paths.
    fn forget_subtree(&self, path: &str) -> Vec<String> {
        let removed = self.0.tree.write().delete(path).unwrap_or_default();
        let files: Vec<String> = removed
            .into_iter()
            .filter(|node| node.is_file())
            .map(|node| node.path)
            .collect();
        for buffer in self.subtree_buffers(path) {
            self.drop_buffer(buffer.path());
        }
        files
    }

    fn apply_rename(&self, from: &str, to: &str) {
        let mut tree = self.0.tree.write();
        let moved = match tree.rename(from, to) {
            Ok(moved) => moved,
            Err(err) => {
                debug!("Local tree out of date for rename {} -> {}: {}", from, to, err);
                let _ = tree.create_file(to);
                Vec::new()
            }
        };
        drop(tree);
        for (old, _) in moved {
            self.drop_buffer(&old);
        }
        for buffer in self.subtree_buffers(from) {
            self.drop_buffer(buffer.path());
        }
    }
}

fn normalize(path: &str) -> Result<String> {
    file_tree::normalize(path).map_err(|e| Error::Remote(RemoteError::Invalid(e.to_string())))
}

impl std::fmt::Debug for Workspace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Workspace")
            .field("name", &self.0.name)
            .field("user", &self.0.user)
            .field("state", &self.state())
            .field("buffers", &self.active_buffers())
            .finish()
    }
}
