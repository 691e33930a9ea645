use serde::{Deserialize, Serialize};

/// Canonical error taxonomy. The serde tag is the wire name carried on
/// assistant messages, API error bodies and `session.error` events.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, thiserror::Error)]
#[serde(tag = "type")]
pub enum SessionError {
    /// The turn was cancelled; its lock token fired.
    #[error("aborted")]
    Aborted,

    #[error("provider rejected credentials: {message}")]
    AuthError { message: String },

    /// The provider signalled output truncation.
    #[error("model output hit the length limit")]
    OutputLengthError,

    /// Context exceeds the model limit and compaction is disabled.
    #[error("context window overflow: {tokens} tokens > {limit} limit")]
    OverflowError { tokens: u64, limit: u64 },

    /// Another turn already holds the session lock.
    #[error("session {session_id} is busy")]
    Busy { session_id: String },

    /// A validate hook blocked the tool call.
    #[error("tool blocked: {reason}")]
    ToolBlocked { reason: String },

    #[error("permission denied: {message}")]
    PermissionDenied { message: String },

    #[error("not found: {message}")]
    NotFound { message: String },

    #[error("{message}")]
    Unknown { message: String },
}

impl SessionError {
    pub fn not_found(what: impl std::fmt::Display) -> Self {
        Self::NotFound {
            message: what.to_string(),
        }
    }

    pub fn unknown(message: impl Into<String>) -> Self {
        Self::Unknown {
            message: message.into(),
        }
    }

    /// The wire name, identical to the serde tag.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Aborted => "Aborted",
            Self::AuthError { .. } => "AuthError",
            Self::OutputLengthError => "OutputLengthError",
            Self::OverflowError { .. } => "OverflowError",
            Self::Busy { .. } => "Busy",
            Self::ToolBlocked { .. } => "ToolBlocked",
            Self::PermissionDenied { .. } => "PermissionDenied",
            Self::NotFound { .. } => "NotFound",
            Self::Unknown { .. } => "Unknown",
        }
    }

    /// Tool-local errors are captured on the tool part; the turn continues.
    pub fn is_tool_local(&self) -> bool {
        matches!(self, Self::ToolBlocked { .. } | Self::PermissionDenied { .. })
    }
}
