use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::SessionError;
use crate::ids::{now_millis, MessageId, PartId, SessionId};
use crate::provider::TokenUsage;

/// The atomic content unit inside a message.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Part {
    pub id: PartId,
    pub message_id: MessageId,
    pub session_id: SessionId,
    #[serde(flatten)]
    pub body: PartBody,
}

impl Part {
    pub fn new(message_id: MessageId, session_id: SessionId, body: PartBody) -> Self {
        Self {
            id: PartId::new(),
            message_id,
            session_id,
            body,
        }
    }

    pub fn text(message_id: MessageId, session_id: SessionId, text: impl Into<String>) -> Self {
        Self::new(
            message_id,
            session_id,
            PartBody::Text {
                text: text.into(),
                synthetic: false,
                time: Some(Timespan::started(now_millis())),
            },
        )
    }

    pub fn tool_state(&self) -> Option<&ToolState> {
        match &self.body {
            PartBody::Tool { state, .. } => Some(state),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum PartBody {
    Text {
        text: String,
        /// Fed to the model but hidden from UI chrome.
        #[serde(default, skip_serializing_if = "std::ops::Not::not")]
        synthetic: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        time: Option<Timespan>,
    },
    Reasoning {
        text: String,
        time: Timespan,
    },
    Tool {
        call_id: String,
        tool: String,
        state: ToolState,
    },
    File {
        mime: String,
        url: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        filename: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        source: Option<String>,
    },
    StepStart,
    StepFinish {
        tokens: TokenUsage,
        cost: f64,
    },
    Patch {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        hash: Option<String>,
        files: Vec<String>,
    },
}

impl PartBody {
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Text { .. } => "text",
            Self::Reasoning { .. } => "reasoning",
            Self::Tool { .. } => "tool",
            Self::File { .. } => "file",
            Self::StepStart => "step-start",
            Self::StepFinish { .. } => "step-finish",
            Self::Patch { .. } => "patch",
        }
    }
}

/// Start/end wall-clock bounds in epoch milliseconds.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Timespan {
    pub start: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end: Option<u64>,
}

impl Timespan {
    pub fn started(start: u64) -> Self {
        Self { start, end: None }
    }

    pub fn finish(&mut self) {
        self.end = Some(now_millis());
    }
}

/// Tool call lifecycle: `pending` then exactly one of `completed` / `error`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ToolState {
    Pending {
        input: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        raw: Option<String>,
    },
    Completed {
        input: Value,
        output: String,
        title: String,
        metadata: Value,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        attachments: Vec<ToolAttachment>,
        time: ToolTime,
    },
    Error {
        input: Value,
        error: SessionError,
        time: ToolTime,
    },
}

impl ToolState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending { .. })
    }

    pub fn status_name(&self) -> &'static str {
        match self {
            Self::Pending { .. } => "pending",
            Self::Completed { .. } => "completed",
            Self::Error { .. } => "error",
        }
    }

    /// Elision timestamp, if this output was compacted out of the prompt.
    pub fn compacted(&self) -> Option<u64> {
        match self {
            Self::Completed { time, .. } => time.compacted,
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolTime {
    pub start: u64,
    pub end: u64,
    /// Set once the output is elided from prompt replay. UI keeps the output.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compacted: Option<u64>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolAttachment {
    pub mime: String,
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
}
