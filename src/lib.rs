//! Client core for real-time collaborative editing.
//!
//! A [`Session`] authenticates one participant against a [`Transport`] and
//! joins [`Workspace`]s. Each workspace owns one [`CursorController`] for
//! presence and one [`BufferController`] per attached file; buffers replicate
//! through a sequence CRDT so every replica converges whatever the delivery
//! order. [`LocalHub`] is an in-process authority implementing the transport.
//!
//! ```no_run
//! use std::sync::Arc;
//! use collab_client::{Config, LocalHub, Session};
//!
//! # async fn demo() -> collab_client::Result<()> {
//! let hub = LocalHub::new();
//! hub.register("alice", "secret")?;
//!
//! let session = Session::connect(Config::new("alice", "secret"), Arc::new(hub)).await?;
//! session.create_workspace("team").await?;
//! let workspace = session.join("team").await?;
//!
//! let notes = workspace.attach("notes.txt").await?;
//! notes.edit(0..0, "hello")?;
//! assert_eq!(notes.read()?, "hello");
//!
//! session.leave("team").await?;
//! # Ok(())
//! # }
//! ```

pub mod buffer;
pub mod config;
pub mod cursor;
pub mod error;
pub mod event;
pub mod hub;
pub mod protocol;
pub mod session;
pub mod transport;
pub mod workspace;

pub use buffer::{
    select_buffer, BufferController, BufferStatus, IdRange, OpId, Operation, TextChange, VersionVector,
};
pub use config::Config;
pub use cursor::{CursorController, CursorState, CursorUpdate};
pub use error::{
    ConnectionError, DetachedError, DrainTimeout, Error, IntegrityError, RemoteError, Result,
};
pub use event::{ControllerCallback, Event, Subscription};
pub use hub::{HubConfig, HubStats, LocalHub};
pub use protocol::Member;
pub use session::{Session, User};
pub use transport::{Grant, Transport, WorkspaceLink, WorkspaceList};
pub use workspace::{FileTree, NestedNode, Workspace, WorkspaceState};
