use std::sync::Arc;

use tracing::{debug, warn};

use quill_core::hooks::{
    Notification, NotificationHook, NotificationInput, SessionStopHook, SessionStopReason,
    ToolTransformHook, ToolTransformInput, ToolTransformOutput, ToolValidateHook,
    ToolValidateInput, ToolValidateOutput,
};
use quill_core::ids::SessionId;

/// Dispatcher for the lifecycle extension points. Hook failures are logged
/// and never rethrown; the one first-class outcome is a validate block.
#[derive(Default)]
pub struct HookRegistry {
    validators: Vec<Arc<dyn ToolValidateHook>>,
    transformers: Vec<Arc<dyn ToolTransformHook>>,
    stop: Vec<Arc<dyn SessionStopHook>>,
    notifiers: Vec<Arc<dyn NotificationHook>>,
}

impl HookRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_tool_validate(&mut self, hook: Arc<dyn ToolValidateHook>) {
        self.validators.push(hook);
    }

    pub fn on_tool_transform(&mut self, hook: Arc<dyn ToolTransformHook>) {
        self.transformers.push(hook);
    }

    pub fn on_session_stop(&mut self, hook: Arc<dyn SessionStopHook>) {
        self.stop.push(hook);
    }

    pub fn on_notification(&mut self, hook: Arc<dyn NotificationHook>) {
        self.notifiers.push(hook);
    }

    /// Pre-tool chain. Hooks run in registration order and may rewrite the
    /// arguments; the first block ends the chain.
    pub async fn validate_tool(&self, input: &ToolValidateInput) -> ToolValidateOutput {
        let mut out = ToolValidateOutput::pass_through(input.args.clone());
        for hook in &self.validators {
            hook.validate(input, &mut out).await;
            if out.blocked {
                debug!(
                    hook = hook.name(),
                    tool = %input.tool,
                    reason = out.reason.as_deref().unwrap_or(""),
                    "tool call blocked by validate hook"
                );
                break;
            }
        }
        out
    }

    /// Post-tool chain; every hook sees the previous hook's output.
    pub async fn transform_result(
        &self,
        input: &ToolTransformInput,
        out: &mut ToolTransformOutput,
    ) {
        for hook in &self.transformers {
            hook.transform(input, out).await;
        }
    }

    /// Fire-and-forget turn-end notification.
    pub fn session_stop(&self, session_id: SessionId, reason: SessionStopReason) {
        for hook in &self.stop {
            let hook = Arc::clone(hook);
            let session_id = session_id.clone();
            tokio::spawn(async move {
                hook.on_stop(&session_id, reason).await;
            });
        }
    }

    /// Async notification fan-out; hook errors are swallowed with a log line.
    pub fn notify(&self, input: NotificationInput) {
        for hook in &self.notifiers {
            let hook = Arc::clone(hook);
            let input = input.clone();
            tokio::spawn(async move {
                let mut out = Notification::default();
                if let Err(e) = hook.send(&input, &mut out).await {
                    warn!(hook = hook.name(), error = %e, "notification hook failed");
                }
            });
        }
    }

    pub fn validator_count(&self) -> usize {
        self.validators.len()
    }
}
