use serde::{Deserialize, Serialize};

use crate::error::SessionError;
use crate::ids::{MessageId, SessionId};
use crate::message::Message;
use crate::part::Part;
use crate::permission::{PermissionReply, PermissionRequest};
use crate::project::Project;
use crate::session::Session;
use crate::todo::Todo;

/// Every event the core publishes. The serde tag is the dotted event name
/// delivered to SSE clients as `{type, properties}`.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", content = "properties")]
pub enum BusEvent {
    #[serde(rename = "session.updated")]
    SessionUpdated { session: Session },

    #[serde(rename = "session.deleted")]
    SessionDeleted { session_id: SessionId },

    #[serde(rename = "session.error")]
    SessionError {
        session_id: SessionId,
        error: SessionError,
    },

    /// Always published when a turn ends, success or not; UIs re-enable input.
    #[serde(rename = "session.idle")]
    SessionIdle { session_id: SessionId },

    #[serde(rename = "session.compacted")]
    SessionCompacted {
        session_id: SessionId,
        message_id: MessageId,
    },

    #[serde(rename = "message.updated")]
    MessageUpdated { message: Message },

    #[serde(rename = "message.part.updated")]
    MessagePartUpdated { part: Part },

    #[serde(rename = "message.removed")]
    MessageRemoved {
        session_id: SessionId,
        message_id: MessageId,
    },

    #[serde(rename = "todo.updated")]
    TodoUpdated {
        session_id: SessionId,
        todos: Vec<Todo>,
    },

    #[serde(rename = "permission.updated")]
    PermissionUpdated { request: PermissionRequest },

    #[serde(rename = "permission.replied")]
    PermissionReplied {
        session_id: SessionId,
        permission_id: String,
        response: PermissionReply,
    },

    #[serde(rename = "file.edited")]
    FileEdited { path: String },

    #[serde(rename = "file.watcher.updated")]
    FileWatcherUpdated { path: String, event: String },

    #[serde(rename = "project.updated")]
    ProjectUpdated { project: Project },

    /// Synthetic marker injected into a slow subscriber's stream when its
    /// buffer overflowed; never published globally.
    #[serde(rename = "bus.dropped")]
    Dropped { count: u64 },
}

impl BusEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::SessionUpdated { .. } => "session.updated",
            Self::SessionDeleted { .. } => "session.deleted",
            Self::SessionError { .. } => "session.error",
            Self::SessionIdle { .. } => "session.idle",
            Self::SessionCompacted { .. } => "session.compacted",
            Self::MessageUpdated { .. } => "message.updated",
            Self::MessagePartUpdated { .. } => "message.part.updated",
            Self::MessageRemoved { .. } => "message.removed",
            Self::TodoUpdated { .. } => "todo.updated",
            Self::PermissionUpdated { .. } => "permission.updated",
            Self::PermissionReplied { .. } => "permission.replied",
            Self::FileEdited { .. } => "file.edited",
            Self::FileWatcherUpdated { .. } => "file.watcher.updated",
            Self::ProjectUpdated { .. } => "project.updated",
            Self::Dropped { .. } => "bus.dropped",
        }
    }

    pub fn session_id(&self) -> Option<&SessionId> {
        match self {
            Self::SessionUpdated { session } => Some(&session.id),
            Self::SessionDeleted { session_id }
            | Self::SessionError { session_id, .. }
            | Self::SessionIdle { session_id }
            | Self::SessionCompacted { session_id, .. }
            | Self::MessageRemoved { session_id, .. }
            | Self::TodoUpdated { session_id, .. }
            | Self::PermissionReplied { session_id, .. } => Some(session_id),
            Self::MessageUpdated { message } => Some(message.session_id()),
            Self::MessagePartUpdated { part } => Some(&part.session_id),
            Self::PermissionUpdated { request } => Some(&request.session_id),
            Self::FileEdited { .. }
            | Self::FileWatcherUpdated { .. }
            | Self::ProjectUpdated { .. }
            | Self::Dropped { .. } => None,
        }
    }
}
