//! Router task: reads a workspace link and dispatches each message.

use bytes::Bytes;
use std::sync::Weak;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{Workspace, WorkspaceInner};
use crate::buffer::controller::BufferInbound;
use crate::event::Event;
use crate::protocol::{ErrorCode, ServerMessage, SyncProtocol};

pub(super) async fn route(
    inner: Weak<WorkspaceInner>,
    mut inbound: mpsc::UnboundedReceiver<Bytes>,
    stop: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = stop.cancelled() => break,
            frame = inbound.recv() => {
                let Some(inner) = inner.upgrade() else { break };
                let workspace = Workspace(inner);
                let Some(frame) = frame else {
                    workspace.lost_link("link closed".to_string());
                    break;
                };
                match SyncProtocol::decode_server(&frame) {
                    Ok(msg) => workspace.dispatch(msg),
                    Err(err) => warn!("Dropping undecodable frame in {}: {}", workspace.name(), err),
                }
            }
        }
    }
    debug!("Workspace router stopped");
}

impl Workspace {
    fn deliver(&self, path: &str, msg: BufferInbound) {
        match self.0.buffers.get(path) {
            Some(buffer) => buffer.deliver(msg),
            None => debug!("Traffic for unattached buffer {} ignored", path),
        }
    }

    fn dispatch(&self, msg: ServerMessage) {
        match msg {
            ServerMessage::Snapshot { buffer, snapshot } => {
                self.deliver(&buffer, BufferInbound::Snapshot(snapshot))
            }
            ServerMessage::Operation { buffer, op } => self.deliver(&buffer, BufferInbound::Operation(op)),
            ServerMessage::Ack { buffer, id } => self.deliver(&buffer, BufferInbound::Ack(id)),
            ServerMessage::Watermark { buffer, version } => {
                self.deliver(&buffer, BufferInbound::Watermark(version))
            }

            ServerMessage::CursorBroadcast { user, state } => self.0.cursor.deliver(user, state),

            ServerMessage::MemberJoined { member } => {
                self.0.cursor.admit(&member.id);
                self.0.members.insert(member.id, member.clone());
                self.emit(Event::UserJoined(member));
            }
            ServerMessage::MemberLeft { member } => {
                self.0.cursor.remove(&member.id);
                self.0.members.remove(&member.id);
                self.emit(Event::UserLeft(member));
            }

            ServerMessage::BufferCreated { path } => {
                let _ = self.0.tree.write().create_file(&path);
                self.emit(Event::BufferCreated { path });
            }
            ServerMessage::BufferDeleted { path } => {
                self.forget_subtree(&path);
                self.emit(Event::BufferDeleted { path });
            }
            ServerMessage::BufferRenamed { from, to } => {
                self.apply_rename(&from, &to);
                self.emit(Event::BufferRenamed { from, to });
            }

            ServerMessage::Error { code, message, buffer } => match (code, buffer) {
                // A snapshot follows a rejected operation
                (ErrorCode::Integrity, Some(path)) => {
                    warn!("Authority rejected an operation on {}: {}", path, message)
                }
                (ErrorCode::BufferNotFound, Some(path)) => {
                    warn!("Authority has no buffer {}: {}", path, message);
                    self.drop_buffer(&path);
                }
                (code, path) => warn!(
                    "Authority error {:?} in {} ({}): {}",
                    code,
                    self.name(),
                    path.as_deref().unwrap_or("-"),
                    message
                ),
            },

            ServerMessage::Goodbye { reason } => {
                self.lost_link(reason.unwrap_or_else(|| "closed by authority".to_string()))
            }
        }
    }
}
