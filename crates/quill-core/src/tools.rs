use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::error::SessionError;
use crate::ids::{now_millis, MessageId, SessionId};
use crate::part::ToolAttachment;

/// Tool definition sent to the model.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub parameters_schema: Value,
}

/// Which end of an oversized output survives truncation.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TruncateDirection {
    #[default]
    Head,
    Tail,
}

/// What a successful tool execution hands back.
#[derive(Clone, Debug, Default)]
pub struct ToolOutput {
    pub title: String,
    pub output: String,
    pub metadata: Value,
    pub attachments: Vec<ToolAttachment>,
}

impl ToolOutput {
    pub fn text(title: impl Into<String>, output: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            output: output.into(),
            metadata: Value::Null,
            attachments: Vec::new(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ToolFailure {
    #[error("invalid arguments: {0}")]
    InvalidArguments(String),
    #[error("{0}")]
    Failed(String),
    /// Already-classified errors (permission denied, aborted, blocked)
    /// pass through unchanged.
    #[error(transparent)]
    Session(#[from] SessionError),
}

impl ToolFailure {
    pub fn into_session_error(self) -> SessionError {
        match self {
            Self::Session(err) => err,
            other => SessionError::unknown(other.to_string()),
        }
    }
}

/// Trait implemented by each tool.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    fn parameters_schema(&self) -> Value;

    fn truncation(&self) -> TruncateDirection {
        TruncateDirection::Head
    }

    async fn run(&self, args: Value, ctx: &ToolContext) -> Result<ToolOutput, ToolFailure>;

    fn to_definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: self.name().to_string(),
            description: self.description().to_string(),
            parameters_schema: self.parameters_schema(),
        }
    }
}

/// Interactive approval request raised by a tool.
#[derive(Clone, Debug)]
pub struct AskRequest {
    pub session_id: SessionId,
    pub call_id: String,
    pub tool: String,
    /// Keys evaluated against the layered rulesets.
    pub patterns: Vec<String>,
    /// Patterns persisted on an `always` reply; defaults to `patterns`.
    pub always: Vec<String>,
    pub metadata: Value,
    pub abort: CancellationToken,
}

/// Seam to the permission gate, kept abstract so tools depend only on the
/// contract.
#[async_trait]
pub trait PermissionAsk: Send + Sync {
    /// Resolves `Ok(())` when allowed, `PermissionDenied` otherwise.
    /// A pending ask resolves as rejected when `abort` fires.
    async fn ask(&self, request: AskRequest) -> Result<(), SessionError>;
}

/// Permission handle that approves everything; for tests and headless runs.
pub struct UnrestrictedPermissions;

#[async_trait]
impl PermissionAsk for UnrestrictedPermissions {
    async fn ask(&self, _request: AskRequest) -> Result<(), SessionError> {
        Ok(())
    }
}

/// Outcome of one sub-call routed through a [`ToolInvoker`].
#[derive(Clone, Debug)]
pub struct SubcallOutcome {
    pub tool: String,
    pub ok: bool,
    pub summary: String,
}

/// Seam that lets composite tools (batch) execute other tools through the
/// engine, each sub-call producing its own tool part and permission ask.
#[async_trait]
pub trait ToolInvoker: Send + Sync {
    async fn invoke(&self, ctx: &ToolContext, tool: &str, input: Value) -> SubcallOutcome;
}

/// Read/write timestamps per file, shared by the tools of one session.
/// Editing tools require a read to have happened first.
#[derive(Default)]
pub struct FileTimes {
    read: Mutex<HashMap<PathBuf, u64>>,
}

impl FileTimes {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_read(&self, path: impl Into<PathBuf>) {
        self.read.lock().insert(path.into(), now_millis());
    }

    pub fn last_read(&self, path: &Path) -> Option<u64> {
        self.read.lock().get(path).copied()
    }

    /// Guard used by editing tools before touching a file.
    pub fn assert_read(&self, path: &Path) -> Result<(), SessionError> {
        if self.read.lock().contains_key(path) {
            Ok(())
        } else {
            Err(SessionError::unknown(format!(
                "file must be read before editing: {}",
                path.display()
            )))
        }
    }
}

/// Everything a tool can see during one call.
#[derive(Clone)]
pub struct ToolContext {
    pub session_id: SessionId,
    pub message_id: MessageId,
    pub call_id: String,
    pub abort: CancellationToken,
    pub worktree: PathBuf,
    pub permissions: Arc<dyn PermissionAsk>,
    pub file_times: Arc<FileTimes>,
    /// Present when the engine is driving the call; composite tools need it.
    pub invoker: Option<Arc<dyn ToolInvoker>>,
}

impl ToolContext {
    /// Resolve a possibly-relative path against the session worktree.
    pub fn resolve_path(&self, path: &str) -> PathBuf {
        let p = Path::new(path);
        if p.is_absolute() {
            p.to_path_buf()
        } else {
            self.worktree.join(p)
        }
    }

    /// Shorthand for the common single-pattern ask.
    pub async fn ask(
        &self,
        tool: &str,
        patterns: Vec<String>,
        metadata: Value,
    ) -> Result<(), SessionError> {
        let always = patterns.clone();
        self.permissions
            .ask(AskRequest {
                session_id: self.session_id.clone(),
                call_id: self.call_id.clone(),
                tool: tool.to_string(),
                patterns,
                always,
                metadata,
                abort: self.abort.clone(),
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> ToolContext {
        ToolContext {
            session_id: SessionId::new(),
            message_id: MessageId::new(),
            call_id: "call_1".into(),
            abort: CancellationToken::new(),
            worktree: PathBuf::from("/work"),
            permissions: Arc::new(UnrestrictedPermissions),
            file_times: Arc::new(FileTimes::new()),
            invoker: None,
        }
    }

    #[test]
    fn resolve_path_joins_relative() {
        let ctx = ctx();
        assert_eq!(ctx.resolve_path("src/main.rs"), PathBuf::from("/work/src/main.rs"));
        assert_eq!(ctx.resolve_path("/abs/x"), PathBuf::from("/abs/x"));
    }

    #[test]
    fn file_times_guard() {
        let times = FileTimes::new();
        let path = Path::new("/work/a.rs");
        assert!(times.assert_read(path).is_err());
        times.record_read(path);
        assert!(times.assert_read(path).is_ok());
        assert!(times.last_read(path).is_some());
    }

    #[tokio::test]
    async fn unrestricted_permissions_allow() {
        let ctx = ctx();
        assert!(ctx
            .ask("read", vec!["/work/a.rs".into()], Value::Null)
            .await
            .is_ok());
    }

    #[test]
    fn tool_failure_mapping() {
        let err = ToolFailure::InvalidArguments("missing path".into());
        assert_eq!(err.into_session_error().kind(), "Unknown");

        let err = ToolFailure::Session(SessionError::PermissionDenied {
            message: "no".into(),
        });
        assert_eq!(err.into_session_error().kind(), "PermissionDenied");
    }
}
