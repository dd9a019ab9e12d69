//! Error taxonomy for sessions, workspaces and controllers.
//!
//! Each failure class gets its own type so callers can react precisely:
//! connection failures are fatal to the link, remote refusals are fatal to a
//! single request, integrity failures trigger a resync of one buffer, and drain
//! timeouts are reported but never block teardown.

use crate::buffer::OpId;
use crate::protocol::ProtocolError;

/// Result type used across the crate
pub type Result<T> = std::result::Result<T, Error>;

/// Transport-level failures: fatal for the session or workspace link.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConnectionError {
    #[error("Transport unavailable: {0}")]
    Transport(String),

    #[error("Authentication failed for {0}")]
    Authentication(String),

    #[error("Session token expired or revoked")]
    SessionExpired,

    #[error("Link closed")]
    Closed,

    #[error("Timed out waiting for {0}")]
    Timeout(String),
}

/// Refusals returned by the remote authority for a single request.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RemoteError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Permission denied: {0}")]
    Permission(String),

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    #[error("Invalid request: {0}")]
    Invalid(String),

    #[error(transparent)]
    Connection(#[from] ConnectionError),
}

/// Replica consistency violations. Recovery is a resync from the authority.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IntegrityError {
    #[error("Operation {op} references unknown identifier {missing}")]
    UnknownReference { op: OpId, missing: OpId },

    #[error("Malformed operation {op}: {reason}")]
    Malformed { op: OpId, reason: String },

    #[error("{0} operations are waiting on dependencies that never arrived")]
    Stalled(usize),
}

/// Use of a handle whose workspace, buffer or cursor has been torn down.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DetachedError {
    #[error("Workspace {0} is detached")]
    Workspace(String),

    #[error("Buffer {0} is detached")]
    Buffer(String),

    #[error("Cursor controller is detached")]
    Cursor,
}

/// A drain did not finish in time. Teardown still completes.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Timed out draining {scope}: {} operations unconfirmed", unconfirmed.len())]
pub struct DrainTimeout {
    pub scope: String,
    pub unconfirmed: Vec<OpId>,
}

impl DrainTimeout {
    /// Merge several drain failures into one report
    pub fn merge(scope: impl Into<String>, parts: impl IntoIterator<Item = DrainTimeout>) -> Option<Self> {
        let unconfirmed: Vec<OpId> = parts.into_iter().flat_map(|p| p.unconfirmed).collect();
        if unconfirmed.is_empty() {
            None
        } else {
            Some(Self {
                scope: scope.into(),
                unconfirmed,
            })
        }
    }
}

/// Umbrella error returned by public operations
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error(transparent)]
    Remote(RemoteError),

    #[error(transparent)]
    Integrity(#[from] IntegrityError),

    #[error(transparent)]
    Detached(#[from] DetachedError),

    #[error(transparent)]
    Timeout(#[from] DrainTimeout),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

impl From<RemoteError> for Error {
    fn from(err: RemoteError) -> Self {
        match err {
            RemoteError::Connection(conn) => Error::Connection(conn),
            other => Error::Remote(other),
        }
    }
}

impl Error {
    /// True when the error means the session or workspace link is gone
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Connection(_) | Error::Detached(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::Remote(RemoteError::NotFound(_)))
    }

    pub fn is_permission(&self) -> bool {
        matches!(self, Error::Remote(RemoteError::Permission(_)))
    }
}
