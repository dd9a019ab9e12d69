//! The seam between the session core and whatever carries bytes to the
//! authority.
//!
//! Request/response calls (authentication, workspace administration, listing)
//! are plain async methods. Joining a workspace opens a [`WorkspaceLink`]: a
//! pair of unbounded frame channels carrying the streaming traffic encoded by
//! [`SyncProtocol`](crate::protocol::SyncProtocol).

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::error::{ConnectionError, Error, RemoteError};
use crate::protocol::{ClientMessage, Member, SyncProtocol};
use crate::session::User;

/// Result of a successful login
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Grant {
    pub user: User,
    pub token: String,
}

/// Workspaces visible to a user
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkspaceList {
    pub owned: Vec<String>,
    pub invited: Vec<String>,
}

/// Streaming connection to one workspace
#[derive(Debug)]
pub struct WorkspaceLink {
    /// The joining user as the other members see it
    pub member: Member,
    /// Members present at join time, including the joining user
    pub members: Vec<Member>,
    /// File tree at join time
    pub buffers: Vec<String>,
    /// Frames towards the authority
    pub outbound: mpsc::UnboundedSender<Bytes>,
    /// Frames from the authority; closes when the link fails
    pub inbound: mpsc::UnboundedReceiver<Bytes>,
}

#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn login(&self, username: &str, password: &str) -> Result<Grant, ConnectionError>;

    /// Rotate a session token
    async fn refresh(&self, token: &str) -> Result<String, ConnectionError>;

    async fn logout(&self, token: &str);

    async fn create_workspace(&self, token: &str, name: &str) -> Result<(), RemoteError>;

    async fn delete_workspace(&self, token: &str, name: &str) -> Result<(), RemoteError>;

    async fn invite(&self, token: &str, workspace: &str, username: &str) -> Result<(), RemoteError>;

    async fn list_workspaces(&self, token: &str) -> Result<WorkspaceList, RemoteError>;

    async fn join(&self, token: &str, workspace: &str) -> Result<WorkspaceLink, RemoteError>;

    async fn leave(&self, token: &str, workspace: &str) -> Result<(), RemoteError>;

    async fn list_members(&self, token: &str, workspace: &str) -> Result<Vec<Member>, RemoteError>;

    async fn list_buffers(&self, token: &str, workspace: &str) -> Result<Vec<String>, RemoteError>;

    /// Members currently attached to a buffer
    async fn list_buffer_users(
        &self,
        token: &str,
        workspace: &str,
        path: &str,
    ) -> Result<Vec<Uuid>, RemoteError>;

    async fn create_buffer(&self, token: &str, workspace: &str, path: &str) -> Result<(), RemoteError>;

    async fn delete_buffer(&self, token: &str, workspace: &str, path: &str) -> Result<(), RemoteError>;

    async fn rename_buffer(
        &self,
        token: &str,
        workspace: &str,
        from: &str,
        to: &str,
    ) -> Result<(), RemoteError>;
}

/// Run a transport request, bounded by `timeout`
pub(crate) async fn request<T, E, F>(timeout: Duration, what: impl Into<String>, call: F) -> Result<T, Error>
where
    F: Future<Output = Result<T, E>>,
    E: Into<Error>,
{
    match tokio::time::timeout(timeout, call).await {
        Ok(result) => result.map_err(Into::into),
        Err(_) => Err(ConnectionError::Timeout(what.into()).into()),
    }
}

/// Shared, non-blocking send path of a workspace link
#[derive(Debug, Clone)]
pub(crate) struct Outbound {
    tx: mpsc::UnboundedSender<Bytes>,
    /// Keeps the fragments of one message together
    sending: Arc<Mutex<()>>,
}

impl Outbound {
    pub fn new(tx: mpsc::UnboundedSender<Bytes>) -> Self {
        Self {
            tx,
            sending: Arc::new(Mutex::new(())),
        }
    }

    /// Encode and queue a message
    pub fn send(&self, msg: &ClientMessage) -> Result<(), Error> {
        let frames = SyncProtocol::encode_client_frames(msg)?;
        let _guard = self.sending.lock();
        for frame in frames {
            self.tx
                .send(frame)
                .map_err(|_| Error::Connection(ConnectionError::Closed))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outbound_frames_messages() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let outbound = Outbound::new(tx);

        let msg = ClientMessage::Attach {
            buffer: "notes.txt".into(),
        };
        outbound.send(&msg).unwrap();

        let frame = rx.try_recv().unwrap();
        assert_eq!(SyncProtocol::decode_client(&frame).unwrap(), msg);
    }

    #[tokio::test]
    async fn test_request_times_out() {
        let slow = async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok::<_, RemoteError>(())
        };
        let result = request(Duration::from_millis(10), "slow call", slow).await;
        assert!(matches!(result, Err(Error::Connection(ConnectionError::Timeout(what))) if what == "slow call"));

        let refused = async { Err::<(), _>(RemoteError::NotFound("team".into())) };
        let result = request(Duration::from_secs(1), "join", refused).await;
        assert!(result.unwrap_err().is_not_found());
    }

    #[test]
    fn test_outbound_closed_link() {
        let (tx, rx) = mpsc::unbounded_channel();
        let outbound = Outbound::new(tx);
        drop(rx);

        let result = outbound.send(&ClientMessage::Goodbye { reason: None });
        assert!(matches!(result, Err(Error::Connection(ConnectionError::Closed))));
    }
}
