use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};

use quill_core::tools::{Tool, ToolContext, ToolFailure, ToolOutput};

pub const BATCH_MIN: usize = 1;
pub const BATCH_MAX: usize = 10;

/// Tools that may not run inside a batch: the batch itself (no recursion)
/// and tools whose ordering against sibling calls matters.
pub const BATCH_DENYLIST: &[&str] = &["batch", "edit", "todoread"];

#[derive(Deserialize)]
struct BatchArgs {
    tool_calls: Vec<BatchCall>,
}

#[derive(Deserialize)]
struct BatchCall {
    tool: String,
    #[serde(default)]
    parameters: Value,
}

/// Runs several tool calls concurrently through the engine. Each sub-call
/// gets its own tool part and its own permission ask; one failing sub-call
/// does not fail the batch.
pub struct BatchTool;

#[async_trait]
impl Tool for BatchTool {
    fn name(&self) -> &str {
        "batch"
    }

    fn description(&self) -> &str {
        "Execute up to 10 independent tool calls concurrently. \
         Use for clusters of reads/searches that do not depend on each other."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "tool_calls": {
                    "type": "array",
                    "minItems": BATCH_MIN,
                    "maxItems": BATCH_MAX,
                    "items": {
                        "type": "object",
                        "properties": {
                            "tool": { "type": "string" },
                            "parameters": { "type": "object" }
                        },
                        "required": ["tool"]
                    }
                }
            },
            "required": ["tool_calls"]
        })
    }

    async fn run(&self, args: Value, ctx: &ToolContext) -> Result<ToolOutput, ToolFailure> {
        let args: BatchArgs = serde_json::from_value(args)
            .map_err(|e| ToolFailure::InvalidArguments(format!("batch: {e}")))?;

        if args.tool_calls.len() < BATCH_MIN || args.tool_calls.len() > BATCH_MAX {
            return Err(ToolFailure::InvalidArguments(format!(
                "batch requires between {BATCH_MIN} and {BATCH_MAX} tool calls, got {}",
                args.tool_calls.len()
            )));
        }

        let invoker = ctx
            .invoker
            .as_ref()
            .ok_or_else(|| ToolFailure::Failed("batch is unavailable outside the engine".into()))?;

        let outcomes = futures::future::join_all(
            args.tool_calls
                .iter()
                .map(|call| invoker.invoke(ctx, &call.tool, call.parameters.clone())),
        )
        .await;

        let ok = outcomes.iter().filter(|o| o.ok).count();
        let total = outcomes.len();
        let mut lines = vec![format!("{ok}/{total} successful")];
        for outcome in &outcomes {
            let mark = if outcome.ok { "ok" } else { "error" };
            lines.push(format!("[{mark}] {}: {}", outcome.tool, outcome.summary));
        }

        Ok(ToolOutput {
            title: format!("batch ({ok}/{total})"),
            output: lines.join("\n"),
            metadata: json!({ "successful": ok, "total": total }),
            attachments: Vec::new(),
        })
    }
}
