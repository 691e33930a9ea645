use std::path::PathBuf;
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::{error, instrument};

use quill_core::bus::Bus;
use quill_core::error::SessionError;
use quill_core::event::BusEvent;
use quill_core::hooks::{ToolTransformInput, ToolTransformOutput, ToolValidateInput};
use quill_core::ids::{generate, now_millis, MessageId, SessionId};
use quill_core::part::{Part, PartBody, ToolState, ToolTime};
use quill_core::tools::{
    FileTimes, PermissionAsk, SubcallOutcome, ToolContext, ToolInvoker, ToolOutput,
};
use quill_store::parts::PartRepo;
use quill_store::Database;

use crate::hooks::HookRegistry;
use crate::registry::ToolRegistry;
use crate::tools::batch::BATCH_DENYLIST;
use crate::truncate::Truncator;

/// Per-turn execution environment shared by every tool call of one
/// assistant message.
#[derive(Clone)]
pub struct CallEnv {
    pub session_id: SessionId,
    pub message_id: MessageId,
    pub worktree: PathBuf,
    pub abort: tokio_util::sync::CancellationToken,
    pub permissions: Arc<dyn PermissionAsk>,
    pub file_times: Arc<FileTimes>,
}

/// Drives one tool call through its full lifecycle: pending part → validate
/// hook → execution under the permission gate → truncation → transform hook
/// → terminal part state. Tool errors stay local; the part records them and
/// the turn continues.
pub struct ToolExecutor {
    parts: PartRepo,
    bus: Bus,
    registry: Arc<ToolRegistry>,
    hooks: Arc<HookRegistry>,
    truncator: Arc<Truncator>,
    /// Handed to tool contexts as the batch invoker seam.
    self_ref: Weak<ToolExecutor>,
}

impl ToolExecutor {
    pub fn new(
        db: Database,
        bus: Bus,
        registry: Arc<ToolRegistry>,
        hooks: Arc<HookRegistry>,
        truncator: Arc<Truncator>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            parts: PartRepo::new(db),
            bus,
            registry,
            hooks,
            truncator,
            self_ref: self_ref.clone(),
        })
    }

    /// Execute one call and return the terminal tool part.
    #[instrument(skip(self, env, input), fields(session_id = %env.session_id, tool = tool_name, call_id))]
    pub async fn execute(
        &self,
        env: &CallEnv,
        call_id: &str,
        tool_name: &str,
        input: Value,
        in_batch: bool,
    ) -> Part {
        let mut part = Part::new(
            env.message_id.clone(),
            env.session_id.clone(),
            PartBody::Tool {
                call_id: call_id.to_string(),
                tool: tool_name.to_string(),
                state: ToolState::Pending {
                    input: input.clone(),
                    raw: None,
                },
            },
        );
        self.persist(&part);

        let started = now_millis();
        let result = self
            .run_call(env, call_id, tool_name, input.clone(), in_batch)
            .await;
        let time = ToolTime {
            start: started,
            end: now_millis(),
            compacted: None,
        };

        let state = match result {
            Ok((output, metadata)) => ToolState::Completed {
                input,
                output: output.output,
                title: output.title,
                metadata,
                attachments: output.attachments,
                time,
            },
            Err(err) => ToolState::Error {
                input,
                error: err,
                time,
            },
        };
        if let PartBody::Tool { state: slot, .. } = &mut part.body {
            *slot = state;
        }
        self.persist(&part);
        part
    }

    async fn run_call(
        &self,
        env: &CallEnv,
        call_id: &str,
        tool_name: &str,
        input: Value,
        in_batch: bool,
    ) -> Result<(ToolOutput, Value), SessionError> {
        if in_batch && BATCH_DENYLIST.contains(&tool_name) {
            return Err(SessionError::ToolBlocked {
                reason: format!("{tool_name} cannot run inside a batch"),
            });
        }

        let validated = self
            .hooks
            .validate_tool(&ToolValidateInput {
                tool: tool_name.to_string(),
                session_id: env.session_id.clone(),
                call_id: call_id.to_string(),
                args: input,
            })
            .await;
        if validated.blocked {
            return Err(SessionError::ToolBlocked {
                reason: validated
                    .reason
                    .unwrap_or_else(|| "blocked by hook".to_string()),
            });
        }

        let tool = self
            .registry
            .get(tool_name)
            .ok_or_else(|| SessionError::unknown(format!("unknown tool: {tool_name}")))?;

        let invoker = self
            .self_ref
            .upgrade()
            .map(|e| e as Arc<dyn ToolInvoker>);
        let ctx = ToolContext {
            session_id: env.session_id.clone(),
            message_id: env.message_id.clone(),
            call_id: call_id.to_string(),
            abort: env.abort.clone(),
            worktree: env.worktree.clone(),
            permissions: env.permissions.clone(),
            file_times: env.file_times.clone(),
            invoker,
        };

        // Biased, tool first: an ask parked inside the tool resolves as
        // reject on the same token, and that answer must win over the
        // redundant cancellation arm. Only a tool still pending after its
        // own poll is force-cancelled.
        let output = tokio::select! {
            biased;
            result = tool.run(validated.args, &ctx) => {
                result.map_err(|f| f.into_session_error())?
            }
            _ = env.abort.cancelled() => return Err(SessionError::Aborted),
        };

        let truncated = self
            .truncator
            .process(&output.output, tool.truncation())
            .map_err(|e| SessionError::unknown(format!("tool output spill failed: {e}")))?;

        let mut transformed = ToolTransformOutput {
            title: output.title.clone(),
            output: truncated.content,
            metadata: output.metadata.clone(),
        };
        self.hooks
            .transform_result(
                &ToolTransformInput {
                    tool: tool_name.to_string(),
                    session_id: env.session_id.clone(),
                    call_id: call_id.to_string(),
                },
                &mut transformed,
            )
            .await;

        let mut metadata = match transformed.metadata {
            Value::Object(map) => Value::Object(map),
            Value::Null => json!({}),
            other => json!({ "value": other }),
        };
        if truncated.truncated {
            metadata["truncated"] = json!(true);
            if let Some(spill) = &truncated.spill {
                metadata["output_file"] = json!(spill.to_string_lossy());
            }
        }

        Ok((
            ToolOutput {
                title: transformed.title,
                output: transformed.output,
                metadata: Value::Null,
                attachments: output.attachments,
            },
            metadata,
        ))
    }

    fn persist(&self, part: &Part) {
        if let Err(e) = self.parts.put(part) {
            error!(part_id = %part.id, error = %e, "failed to persist tool part");
        }
        self.bus
            .publish(BusEvent::MessagePartUpdated { part: part.clone() });
    }
}

#[async_trait]
impl ToolInvoker for ToolExecutor {
    /// Batch seam: run a sub-call with its own call id, tool part and
    /// permission ask.
    async fn invoke(&self, ctx: &ToolContext, tool: &str, input: Value) -> SubcallOutcome {
        let env = CallEnv {
            session_id: ctx.session_id.clone(),
            message_id: ctx.message_id.clone(),
            worktree: ctx.worktree.clone(),
            abort: ctx.abort.clone(),
            permissions: ctx.permissions.clone(),
            file_times: ctx.file_times.clone(),
        };
        let call_id = generate("call");
        let part = self.execute(&env, &call_id, tool, input, true).await;

        match part.tool_state() {
            Some(ToolState::Completed { title, .. }) => SubcallOutcome {
                tool: tool.to_string(),
                ok: true,
                summary: title.clone(),
            },
            Some(ToolState::Error { error, .. }) => SubcallOutcome {
                tool: tool.to_string(),
                ok: false,
                summary: error.to_string(),
            },
            _ => SubcallOutcome {
                tool: tool.to_string(),
                ok: false,
                summary: "tool call did not reach a terminal state".into(),
            },
        }
    }
}
