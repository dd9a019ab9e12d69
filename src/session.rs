//! Identity and session: one authenticated participant and the workspaces it
//! has joined.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::error::{ConnectionError, Error, Result};
use crate::transport::{request, Transport, WorkspaceList};
use crate::workspace::{Workspace, WorkspaceState};

/// Identity of a connected participant
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct User {
    /// Unique per session, assigned at connect time
    pub id: Uuid,
    pub name: String,
}

/// Session token shared with every joined workspace, so a refresh reaches
/// all of them
pub(crate) type SharedToken = Arc<RwLock<String>>;

/// A connected participant. Cheap to clone.
#[derive(Clone)]
pub struct Session(Arc<SessionInner>);

struct SessionInner {
    config: Config,
    user: User,
    token: SharedToken,
    transport: Arc<dyn Transport>,
    workspaces: DashMap<String, Workspace>,
    closed: AtomicBool,
}

impl Session {
    /// Authenticate with the configured credentials
    pub async fn connect(config: Config, transport: Arc<dyn Transport>) -> Result<Self> {
        let grant = request(
            config.request_timeout,
            format!("login to {}", config.endpoint()),
            transport.login(&config.username, &config.password),
        )
        .await?;
        info!("Connected to {} as {} ({})", config.endpoint(), grant.user.name, grant.user.id);

        Ok(Self(Arc::new(SessionInner {
            config,
            user: grant.user,
            token: Arc::new(RwLock::new(grant.token)),
            transport,
            workspaces: DashMap::new(),
            closed: AtomicBool::new(false),
        })))
    }

    pub fn user(&self) -> &User {
        &self.0.user
    }

    pub fn config(&self) -> &Config {
        &self.0.config
    }

    pub fn is_connected(&self) -> bool {
        !self.0.closed.load(Ordering::SeqCst)
    }

    /// Join a workspace, or return the handle if it is already joined
    pub async fn join(&self, name: &str) -> Result<Workspace> {
        self.ensure_connected()?;
        if let Some(workspace) = self.get_workspace(name) {
            return Ok(workspace);
        }

        let workspace = Workspace::join(
            name,
            self.0.user.clone(),
            Arc::clone(&self.0.transport),
            Arc::clone(&self.0.token),
            self.0.config.clone(),
        )
        .await?;

        let existing = match self.0.workspaces.entry(name.to_string()) {
            Entry::Occupied(mut entry) if entry.get().state() == WorkspaceState::Detached => {
                entry.insert(workspace.clone());
                None
            }
            Entry::Occupied(entry) => Some(entry.get().clone()),
            Entry::Vacant(entry) => {
                entry.insert(workspace.clone());
                None
            }
        };

        match existing {
            // Lost a race with a concurrent join; the extra handle's tasks end when it drops
            Some(existing) => {
                debug!("Discarding duplicate join of {}", name);
                Ok(existing)
            }
            None => Ok(workspace),
        }
    }

    /// Leave a workspace. Leaving one that is not joined is a no-op.
    ///
    /// The workspace is detached even when the drain times out; the returned
    /// [`Error::Timeout`] lists the operations that were never confirmed.
    pub async fn leave(&self, name: &str) -> Result<()> {
        match self.0.workspaces.remove(name) {
            Some((_, workspace)) => workspace.leave().await,
            None => {
                debug!("Leave of {} ignored: not joined", name);
                Ok(())
            }
        }
    }

    /// Joined workspace by name, unless it has detached
    pub fn get_workspace(&self, name: &str) -> Option<Workspace> {
        self.0
            .workspaces
            .get(name)
            .map(|w| w.clone())
            .filter(|w| w.state() != WorkspaceState::Detached)
    }

    /// Names of the joined workspaces that are still attached
    pub fn active_workspaces(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .0
            .workspaces
            .iter()
            .filter(|w| w.state() != WorkspaceState::Detached)
            .map(|w| w.key().clone())
            .collect();
        names.sort();
        names
    }

    pub async fn create_workspace(&self, name: &str) -> Result<()> {
        self.ensure_connected()?;
        let token = self.token();
        request(
            self.0.config.request_timeout,
            format!("create workspace {}", name),
            self.0.transport.create_workspace(&token, name),
        )
        .await
    }

    pub async fn delete_workspace(&self, name: &str) -> Result<()> {
        self.ensure_connected()?;
        let token = self.token();
        request(
            self.0.config.request_timeout,
            format!("delete workspace {}", name),
            self.0.transport.delete_workspace(&token, name),
        )
        .await
    }

    /// Grant `username` access to a workspace this user owns
    pub async fn invite(&self, workspace: &str, username: &str) -> Result<()> {
        self.ensure_connected()?;
        let token = self.token();
        request(
            self.0.config.request_timeout,
            format!("invite {} to {}", username, workspace),
            self.0.transport.invite(&token, workspace, username),
        )
        .await
    }

    /// Workspaces this user owns or was invited to
    pub async fn list_workspaces(&self) -> Result<WorkspaceList> {
        self.ensure_connected()?;
        let token = self.token();
        request(
            self.0.config.request_timeout,
            "list workspaces",
            self.0.transport.list_workspaces(&token),
        )
        .await
    }

    /// Rotate the session token
    pub async fn refresh(&self) -> Result<()> {
        self.ensure_connected()?;
        let token = self.token();
        let fresh = request(
            self.0.config.request_timeout,
            "token refresh",
            self.0.transport.refresh(&token),
        )
        .await?;
        *self.0.token.write() = fresh;
        debug!("Session token refreshed for {}", self.0.user.name);
        Ok(())
    }

    /// Leave every workspace and log out. Later calls fail with
    /// [`ConnectionError::Closed`].
    pub async fn disconnect(&self) -> Result<()> {
        if self.0.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let names: Vec<String> = self.0.workspaces.iter().map(|w| w.key().clone()).collect();
        let mut failure = None;
        for name in names {
            if let Err(err) = self.leave(&name).await {
                warn!("Leaving {} during disconnect: {}", name, err);
                failure.get_or_insert(err);
            }
        }

        let token = self.token();
        self.0.transport.logout(&token).await;
        info!("{} disconnected", self.0.user.name);

        match failure {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn token(&self) -> String {
        self.0.token.read().clone()
    }

    fn ensure_connected(&self) -> Result<()> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(Error::Connection(ConnectionError::Closed))
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("user", &self.0.user)
            .field("endpoint", &self.0.config.endpoint())
            .field("workspaces", &self.active_workspaces())
            .field("connected", &self.is_connected())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hub::LocalHub;
    use tokio_test::{assert_err, assert_ok};

    fn hub() -> LocalHub {
        let hub = LocalHub::new();
        hub.register("alice", "secret").unwrap();
        hub.register("bob", "secret").unwrap();
        hub
    }

    async fn connect(hub: &LocalHub, name: &str) -> Session {
        Session::connect(Config::new(name, "secret"), Arc::new(hub.clone()))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_connect_rejects_bad_credentials() {
        let hub = hub();
        let result = Session::connect(Config::new("alice", "nope"), Arc::new(hub)).await;
        let err = assert_err!(result);
        assert!(matches!(err, Error::Connection(ConnectionError::Authentication(_))));
    }

    #[tokio::test]
    async fn test_identities_are_unique_per_session() {
        let hub = hub();
        let first = connect(&hub, "alice").await;
        let second = connect(&hub, "alice").await;
        assert_eq!(first.user().name, second.user().name);
        assert_ne!(first.user().id, second.user().id);
    }

    #[tokio::test]
    async fn test_join_errors() {
        let hub = hub();
        let alice = connect(&hub, "alice").await;
        let bob = connect(&hub, "bob").await;
        alice.create_workspace("team").await.unwrap();

        assert!(bob.join("missing").await.unwrap_err().is_not_found());
        assert!(bob.join("team").await.unwrap_err().is_permission());

        alice.invite("team", "bob").await.unwrap();
        let workspace = bob.join("team").await.unwrap();
        assert_eq!(workspace.state(), WorkspaceState::Active);
        assert_eq!(bob.active_workspaces(), vec!["team"]);
    }

    #[tokio::test]
    async fn test_join_twice_returns_same_workspace() {
        let hub = hub();
        let alice = connect(&hub, "alice").await;
        alice.create_workspace("team").await.unwrap();

        let first = alice.join("team").await.unwrap();
        let second = alice.join("team").await.unwrap();
        assert!(first.same(&second));
        assert_eq!(hub.stats().members, 1);
    }

    #[tokio::test]
    async fn test_leave_is_idempotent() {
        let hub = hub();
        let alice = connect(&hub, "alice").await;
        alice.create_workspace("team").await.unwrap();
        let workspace = alice.join("team").await.unwrap();

        assert_ok!(alice.leave("team").await);
        assert_ok!(alice.leave("team").await);
        assert_ok!(alice.leave("never-joined").await);
        assert_eq!(workspace.state(), WorkspaceState::Detached);
        assert!(alice.get_workspace("team").is_none());
    }

    #[tokio::test]
    async fn test_list_workspaces_and_refresh() {
        let hub = hub();
        let alice = connect(&hub, "alice").await;
        alice.create_workspace("b-team").await.unwrap();
        alice.create_workspace("a-team").await.unwrap();

        alice.refresh().await.unwrap();
        let list = alice.list_workspaces().await.unwrap();
        assert_eq!(list.owned, vec!["a-team", "b-team"]);
        assert!(list.invited.is_empty());
    }

    #[tokio::test]
    async fn test_disconnect_leaves_everything() {
        let hub = hub();
        let alice = connect(&hub, "alice").await;
        alice.create_workspace("team").await.unwrap();
        let workspace = alice.join("team").await.unwrap();

        alice.disconnect().await.unwrap();
        alice.disconnect().await.unwrap();
        assert!(workspace.is_detached());
        assert!(!alice.is_connected());
        assert!(matches!(
            alice.join("team").await,
            Err(Error::Connection(ConnectionError::Closed))
        ));
        assert_eq!(hub.stats().sessions, 0);
    }
}
