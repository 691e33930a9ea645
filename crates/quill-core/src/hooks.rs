use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ids::SessionId;

/// Why a turn ended, as reported to `session.stop` hooks.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStopReason {
    Stop,
    Compact,
    Error,
}

/// Input to a `tool.execute.validate` hook.
#[derive(Clone, Debug)]
pub struct ToolValidateInput {
    pub tool: String,
    pub session_id: SessionId,
    pub call_id: String,
    pub args: Value,
}

/// Mutable outcome of the validate chain. `blocked` is a first-class result;
/// the engine raises `ToolBlocked` carrying `reason`.
#[derive(Clone, Debug)]
pub struct ToolValidateOutput {
    pub args: Value,
    pub blocked: bool,
    pub reason: Option<String>,
}

impl ToolValidateOutput {
    pub fn pass_through(args: Value) -> Self {
        Self {
            args,
            blocked: false,
            reason: None,
        }
    }

    pub fn block(&mut self, reason: impl Into<String>) {
        self.blocked = true;
        self.reason = Some(reason.into());
    }
}

/// Input to a `tool.result.transform` hook.
#[derive(Clone, Debug)]
pub struct ToolTransformInput {
    pub tool: String,
    pub session_id: SessionId,
    pub call_id: String,
}

/// Mutable result fields a transform hook may rewrite.
#[derive(Clone, Debug)]
pub struct ToolTransformOutput {
    pub title: String,
    pub output: String,
    pub metadata: Value,
}

/// Input to a `notification.send` hook.
#[derive(Clone, Debug)]
pub struct NotificationInput {
    pub session_id: SessionId,
    pub kind: String,
}

#[derive(Clone, Debug, Default)]
pub struct Notification {
    pub title: String,
    pub body: String,
    pub data: Value,
}

/// Pre-tool, blocking. May mutate `out.args` or block the call.
#[async_trait]
pub trait ToolValidateHook: Send + Sync {
    fn name(&self) -> &str;
    async fn validate(&self, input: &ToolValidateInput, out: &mut ToolValidateOutput);
}

/// Post-tool. May mutate title/output/metadata before the part is finalised.
#[async_trait]
pub trait ToolTransformHook: Send + Sync {
    fn name(&self) -> &str;
    async fn transform(&self, input: &ToolTransformInput, out: &mut ToolTransformOutput);
}

/// Fire-and-forget at turn end.
#[async_trait]
pub trait SessionStopHook: Send + Sync {
    fn name(&self) -> &str;
    async fn on_stop(&self, session_id: &SessionId, reason: SessionStopReason);
}

/// Async notification fan-out; errors are swallowed by the dispatcher.
#[async_trait]
pub trait NotificationHook: Send + Sync {
    fn name(&self) -> &str;
    async fn send(&self, input: &NotificationInput, out: &mut Notification) -> Result<(), String>;
}
