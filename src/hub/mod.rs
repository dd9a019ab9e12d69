//! In-process authority.
//!
//! [`LocalHub`] implements [`Transport`] without any network: accounts,
//! session tokens and workspaces live in memory, and every joined member gets
//! a pair of frame channels served by its own task. It is the reference
//! authority the client core is exercised against, and a convenient backend
//! for demos and embedding.

mod room;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{ConnectionError, RemoteError};
use crate::protocol::Member;
use crate::session::User;
use crate::transport::{Grant, Transport, WorkspaceLink, WorkspaceList};

use room::WorkspaceRoom;

/// Hub limits
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Maximum concurrent members per workspace
    pub max_members: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self { max_members: 32 }
    }
}

/// Counters for monitoring
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct HubStats {
    pub accounts: usize,
    pub sessions: usize,
    pub workspaces: usize,
    pub members: usize,
}

#[derive(Debug)]
struct Account {
    password_digest: String,
}

#[derive(Debug, Default)]
struct HubInner {
    config: HubConfig,
    accounts: DashMap<String, Account>,
    sessions: DashMap<String, User>,
    workspaces: DashMap<String, Arc<WorkspaceRoom>>,
}

/// In-memory authority; cheap to clone
#[derive(Debug, Clone, Default)]
pub struct LocalHub(Arc<HubInner>);

impl LocalHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(config: HubConfig) -> Self {
        Self(Arc::new(HubInner {
            config,
            ..HubInner::default()
        }))
    }

    /// Create an account
    pub fn register(&self, username: &str, password: &str) -> Result<(), RemoteError> {
        if username.trim().is_empty() {
            return Err(RemoteError::Invalid("empty username".to_string()));
        }
        match self.0.accounts.entry(username.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                Err(RemoteError::AlreadyExists(username.to_string()))
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(Account {
                    password_digest: password_digest(username, password),
                });
                debug!("Registered account {}", username);
                Ok(())
            }
        }
    }

    /// Drop every link held by `user`, as if their connection died.
    /// Other members see them leave. Returns how many links were dropped.
    pub fn disconnect(&self, user: &Uuid) -> usize {
        self.0
            .workspaces
            .iter()
            .filter(|room| room.remove_member(user, "connection lost"))
            .count()
    }

    /// Authoritative content of a buffer
    pub fn buffer_text(&self, workspace: &str, path: &str) -> Option<String> {
        self.0.workspaces.get(workspace)?.buffer_text(path)
    }

    /// Tombstones still held by the authority's copy of a buffer
    pub fn buffer_tombstones(&self, workspace: &str, path: &str) -> Option<usize> {
        self.0.workspaces.get(workspace)?.buffer_tombstones(path)
    }

    pub fn stats(&self) -> HubStats {
        HubStats {
            accounts: self.0.accounts.len(),
            sessions: self.0.sessions.len(),
            workspaces: self.0.workspaces.len(),
            members: self.0.workspaces.iter().map(|r| r.member_count()).sum(),
        }
    }

    fn authenticate(&self, token: &str) -> Result<User, ConnectionError> {
        self.0
            .sessions
            .get(token)
            .map(|user| user.clone())
            .ok_or(ConnectionError::SessionExpired)
    }

    fn room(&self, name: &str) -> Result<Arc<WorkspaceRoom>, RemoteError> {
        self.0
            .workspaces
            .get(name)
            .map(|room| Arc::clone(room.value()))
            .ok_or_else(|| RemoteError::NotFound(format!("workspace {}", name)))
    }

    /// Resolve the token and check the user may see the workspace
    fn accessible(&self, token: &str, workspace: &str) -> Result<(User, Arc<WorkspaceRoom>), RemoteError> {
        let user = self.authenticate(token)?;
        let room = self.room(workspace)?;
        if !room.can_access(&user.name) {
            return Err(RemoteError::Permission(format!(
                "{} may not access workspace {}",
                user.name, workspace
            )));
        }
        Ok((user, room))
    }

    /// The requesting member, if it is currently joined
    fn requester(room: &WorkspaceRoom, user: &User) -> Option<Uuid> {
        room.is_member(&user.id).then_some(user.id)
    }
}

#[async_trait]
impl Transport for LocalHub {
    async fn login(&self, username: &str, password: &str) -> Result<Grant, ConnectionError> {
        let valid = self
            .0
            .accounts
            .get(username)
            .map_or(false, |a| a.password_digest == password_digest(username, password));
        if !valid {
            return Err(ConnectionError::Authentication(username.to_string()));
        }

        let user = User {
            id: Uuid::new_v4(),
            name: username.to_string(),
        };
        let token = generate_session_token();
        self.0.sessions.insert(token.clone(), user.clone());
        info!("{} logged in as {}", username, user.id);
        Ok(Grant { user, token })
    }

    async fn refresh(&self, token: &str) -> Result<String, ConnectionError> {
        let (_, user) = self
            .0
            .sessions
            .remove(token)
            .ok_or(ConnectionError::SessionExpired)?;
        let token = generate_session_token();
        self.0.sessions.insert(token.clone(), user);
        Ok(token)
    }

    async fn logout(&self, token: &str) {
        if let Some((_, user)) = self.0.sessions.remove(token) {
            self.disconnect(&user.id);
            info!("{} logged out", user.name);
        }
    }

    async fn create_workspace(&self, token: &str, name: &str) -> Result<(), RemoteError> {
        let user = self.authenticate(token)?;
        if name.trim().is_empty() {
            return Err(RemoteError::Invalid("empty workspace name".to_string()));
        }
        match self.0.workspaces.entry(name.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                Err(RemoteError::AlreadyExists(format!("workspace {}", name)))
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(Arc::new(WorkspaceRoom::new(
                    name,
                    user.name.clone(),
                    self.0.config.max_members,
                )));
                info!("{} created workspace {}", user.name, name);
                Ok(())
            }
        }
    }

    async fn delete_workspace(&self, token: &str, name: &str) -> Result<(), RemoteError> {
        let user = self.authenticate(token)?;
        let room = self.room(name)?;
        if !room.is_owner(&user.name) {
            return Err(RemoteError::Permission(format!(
                "only the owner may delete workspace {}",
                name
            )));
        }
        self.0.workspaces.remove(name);
        room.close("workspace deleted");
        info!("{} deleted workspace {}", user.name, name);
        Ok(())
    }

    async fn invite(&self, token: &str, workspace: &str, username: &str) -> Result<(), RemoteError> {
        let user = self.authenticate(token)?;
        let room = self.room(workspace)?;
        if !room.is_owner(&user.name) {
            return Err(RemoteError::Permission(format!(
                "only the owner may invite to {}",
                workspace
            )));
        }
        if !self.0.accounts.contains_key(username) {
            return Err(RemoteError::NotFound(format!("user {}", username)));
        }
        room.invite(username);
        debug!("{} invited {} to {}", user.name, username, workspace);
        Ok(())
    }

    async fn list_workspaces(&self, token: &str) -> Result<WorkspaceList, RemoteError> {
        let user = self.authenticate(token)?;
        let mut list = WorkspaceList::default();
        for room in self.0.workspaces.iter() {
            if room.is_owner(&user.name) {
                list.owned.push(room.name().to_string());
            } else if room.is_invited(&user.name) {
                list.invited.push(room.name().to_string());
            }
        }
        list.owned.sort();
        list.invited.sort();
        Ok(list)
    }

    async fn join(&self, token: &str, workspace: &str) -> Result<WorkspaceLink, RemoteError> {
        let (user, room) = self.accessible(token, workspace)?;
        room.admit(&user, generate_peer_color())
    }

    async fn leave(&self, token: &str, workspace: &str) -> Result<(), RemoteError> {
        let user = self.authenticate(token)?;
        let room = self.room(workspace)?;
        room.remove_member(&user.id, "left");
        Ok(())
    }

    async fn list_members(&self, token: &str, workspace: &str) -> Result<Vec<Member>, RemoteError> {
        let (_, room) = self.accessible(token, workspace)?;
        Ok(room.members())
    }

    async fn list_buffers(&self, token: &str, workspace: &str) -> Result<Vec<String>, RemoteError> {
        let (_, room) = self.accessible(token, workspace)?;
        Ok(room.buffers())
    }

    async fn list_buffer_users(
        &self,
        token: &str,
        workspace: &str,
        path: &str,
    ) -> Result<Vec<Uuid>, RemoteError> {
        let (_, room) = self.accessible(token, workspace)?;
        room.buffer_users(path)
    }

    async fn create_buffer(&self, token: &str, workspace: &str, path: &str) -> Result<(), RemoteError> {
        let (user, room) = self.accessible(token, workspace)?;
        room.create_buffer(path, Self::requester(&room, &user)).map(|_| ())
    }

    async fn delete_buffer(&self, token: &str, workspace: &str, path: &str) -> Result<(), RemoteError> {
        let (user, room) = self.accessible(token, workspace)?;
        room.delete_buffer(path, Self::requester(&room, &user))
    }

    async fn rename_buffer(
        &self,
        token: &str,
        workspace: &str,
        from: &str,
        to: &str,
    ) -> Result<(), RemoteError> {
        let (user, room) = self.accessible(token, workspace)?;
        room.rename_buffer(from, to, Self::requester(&room, &user))
    }
}

fn password_digest(username: &str, password: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(username.as_bytes());
    hasher.update(b":");
    hasher.update(password.as_bytes());
    hex::encode(hasher.finalize())
}

/// Generate a secure session token
pub fn generate_session_token() -> String {
    let random_bytes: [u8; 32] = rand::random();
    let mut hasher = Sha256::new();
    hasher.update(random_bytes);
    hasher.update(chrono::Utc::now().timestamp_nanos_opt().unwrap_or(0).to_le_bytes());
    hex::encode(hasher.finalize())
}

/// Pick a display color for a new member
pub fn generate_peer_color() -> String {
    use rand::Rng;
    let colors = [
        "#3b82f6", // blue
        "#ef4444", // red
        "#22c55e", // green
        "#f59e0b", // amber
        "#8b5cf6", // violet
        "#ec4899", // pink
        "#06b6d4", // cyan
        "#f97316", // orange
        "#14b8a6", // teal
        "#a855f7", // purple
        "#84cc16", // lime
        "#6366f1", // indigo
        "#d946ef", // fuchsia
        "#0ea5e9", // sky
    ];
    let idx = rand::thread_rng().gen_range(0..colors.len());
    colors[idx].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn hub_with(users: &[&str]) -> LocalHub {
        let hub = LocalHub::new();
        for name in users {
            hub.register(name, "secret").unwrap();
        }
        hub
    }

    #[tokio::test]
    async fn test_login_rejects_bad_password() {
        let hub = hub_with(&["alice"]).await;
        assert!(matches!(
            hub.login("alice", "wrong").await,
            Err(ConnectionError::Authentication(_))
        ));
        assert!(matches!(
            hub.login("nobody", "secret").await,
            Err(ConnectionError::Authentication(_))
        ));

        let grant = hub.login("alice", "secret").await.unwrap();
        assert_eq!(grant.user.name, "alice");
        assert_eq!(grant.token.len(), 64);
    }

    #[tokio::test]
    async fn test_register_duplicate() {
        let hub = hub_with(&["alice"]).await;
        assert!(matches!(hub.register("alice", "x"), Err(RemoteError::AlreadyExists(_))));
        assert!(matches!(hub.register("  ", "x"), Err(RemoteError::Invalid(_))));
    }

    #[tokio::test]
    async fn test_refresh_rotates_token() {
        let hub = hub_with(&["alice"]).await;
        let grant = hub.login("alice", "secret").await.unwrap();

        let fresh = hub.refresh(&grant.token).await.unwrap();
        assert_ne!(fresh, grant.token);
        assert!(matches!(
            hub.list_workspaces(&grant.token).await,
            Err(RemoteError::Connection(ConnectionError::SessionExpired))
        ));
        assert!(hub.list_workspaces(&fresh).await.is_ok());
    }

    #[tokio::test]
    async fn test_workspace_access_control() {
        let hub = hub_with(&["alice", "bob", "carol"]).await;
        let alice = hub.login("alice", "secret").await.unwrap();
        let bob = hub.login("bob", "secret").await.unwrap();

        hub.create_workspace(&alice.token, "team").await.unwrap();
        assert!(matches!(
            hub.create_workspace(&bob.token, "team").await,
            Err(RemoteError::AlreadyExists(_))
        ));

        assert!(matches!(hub.join(&bob.token, "team").await, Err(RemoteError::Permission(_))));
        assert!(matches!(hub.join(&bob.token, "missing").await, Err(RemoteError::NotFound(_))));
        assert!(matches!(
            hub.invite(&bob.token, "team", "carol").await,
            Err(RemoteError::Permission(_))
        ));
        assert!(matches!(
            hub.invite(&alice.token, "team", "mallory").await,
            Err(RemoteError::NotFound(_))
        ));

        hub.invite(&alice.token, "team", "bob").await.unwrap();
        let link = hub.join(&bob.token, "team").await.unwrap();
        assert_eq!(link.member.name, "bob");

        let listed = hub.list_workspaces(&bob.token).await.unwrap();
        assert_eq!(listed.invited, vec!["team"]);
        assert!(listed.owned.is_empty());

        assert!(matches!(
            hub.delete_workspace(&bob.token, "team").await,
            Err(RemoteError::Permission(_))
        ));
    }

    #[tokio::test]
    async fn test_delete_workspace_closes_links() {
        let hub = hub_with(&["alice"]).await;
        let alice = hub.login("alice", "secret").await.unwrap();
        hub.create_workspace(&alice.token, "team").await.unwrap();
        let mut link = hub.join(&alice.token, "team").await.unwrap();

        hub.delete_workspace(&alice.token, "team").await.unwrap();

        let goodbye = link.inbound.recv().await.unwrap();
        assert!(matches!(
            crate::protocol::SyncProtocol::decode_server(&goodbye).unwrap(),
            crate::protocol::ServerMessage::Goodbye { .. }
        ));
        assert!(link.inbound.recv().await.is_none());
        assert_eq!(hub.stats().workspaces, 0);
    }

    #[tokio::test]
    async fn test_disconnect_drops_links() {
        let hub = hub_with(&["alice"]).await;
        let alice = hub.login("alice", "secret").await.unwrap();
        hub.create_workspace(&alice.token, "one").await.unwrap();
        hub.create_workspace(&alice.token, "two").await.unwrap();
        let mut one = hub.join(&alice.token, "one").await.unwrap();
        let _two = hub.join(&alice.token, "two").await.unwrap();
        assert_eq!(hub.stats().members, 2);

        assert_eq!(hub.disconnect(&alice.user.id), 2);
        assert!(one.inbound.recv().await.is_none());
        assert_eq!(hub.stats().members, 0);
    }

    #[test]
    fn test_generate_peer_color() {
        let color = generate_peer_color();
        assert!(color.starts_with('#'));
        assert_eq!(color.len(), 7);
    }
}
