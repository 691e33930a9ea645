use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::SessionError;
use crate::message::Message;
use crate::part::Part;
use crate::tools::ToolDefinition;

/// A `(provider, model)` pair as addressed by callers.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ModelRef {
    #[serde(rename = "providerID")]
    pub provider_id: String,
    #[serde(rename = "modelID")]
    pub model_id: String,
}

impl ModelRef {
    pub fn new(provider_id: impl Into<String>, model_id: impl Into<String>) -> Self {
        Self {
            provider_id: provider_id.into(),
            model_id: model_id.into(),
        }
    }
}

/// Static properties of one model.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ModelSpec {
    pub provider_id: String,
    pub model_id: String,
    /// Context window size in tokens. 0 means unknown (overflow never fires).
    pub context_limit: u64,
    /// Maximum output tokens per response.
    pub output_limit: u64,
    pub cost: ModelCost,
}

impl ModelSpec {
    pub fn model_ref(&self) -> ModelRef {
        ModelRef::new(self.provider_id.clone(), self.model_id.clone())
    }
}

/// USD per million tokens.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ModelCost {
    pub input: f64,
    pub output: f64,
    pub cache_read: f64,
    pub cache_write: f64,
}

impl ModelCost {
    pub fn cost_of(&self, usage: &TokenUsage) -> f64 {
        (self.input * usage.input as f64
            + self.output * (usage.output + usage.reasoning) as f64
            + self.cache_read * usage.cache.read as f64
            + self.cache_write * usage.cache.write as f64)
            / 1_000_000.0
    }
}

/// Per-step token usage as reported by the provider.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input: u64,
    pub output: u64,
    pub reasoning: u64,
    pub cache: CacheUsage,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheUsage {
    pub read: u64,
    pub write: u64,
}

impl TokenUsage {
    /// Fold another step's usage into this accumulator.
    pub fn add(&mut self, other: &TokenUsage) {
        self.input += other.input;
        self.output += other.output;
        self.reasoning += other.reasoning;
        self.cache.read += other.cache.read;
        self.cache.write += other.cache.write;
    }

    /// Tokens occupying the context window after this step.
    pub fn context_tokens(&self) -> u64 {
        self.input + self.output + self.cache.read
    }
}

/// Why a model step ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStop {
    EndTurn,
    ToolUse,
    /// The provider truncated the output at its length limit.
    MaxTokens,
}

/// Events emitted by a provider adapter during one model step.
///
/// Contract: zero or more delta/tool-call events, then exactly one
/// `StepFinish` — unless `Error` ends the stream early.
#[derive(Clone, Debug)]
pub enum ProviderEvent {
    TextDelta { text: String },
    TextEnd,
    ReasoningDelta { text: String },
    ReasoningEnd,
    ToolCall { call_id: String, tool: String, input: Value },
    StepFinish { usage: TokenUsage, stop: StepStop },
    Error { error: ProviderError },
}

impl ProviderEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::StepFinish { .. } | Self::Error { .. })
    }
}

/// Typed provider-layer failures, classified for the retry policy.
#[derive(Clone, Debug, thiserror::Error)]
pub enum ProviderError {
    // Fatal — never retried
    #[error("authentication failed: {0}")]
    AuthFailed(String),
    #[error("context window exceeded: {tokens} > {limit}")]
    ContextExceeded { limit: u64, tokens: u64 },
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    // Retryable
    #[error("rate limited")]
    RateLimited { retry_after: Option<Duration> },
    #[error("server error {status}: {body}")]
    ServerError { status: u16, body: String },
    #[error("provider overloaded")]
    Overloaded,
    #[error("network error: {0}")]
    Network(String),
    #[error("stream interrupted: {0}")]
    StreamInterrupted(String),

    // Operational
    #[error("cancelled")]
    Cancelled,
}

impl ProviderError {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::RateLimited { .. }
                | Self::ServerError { .. }
                | Self::Overloaded
                | Self::Network(_)
                | Self::StreamInterrupted(_)
        )
    }

    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::AuthFailed(_) | Self::ContextExceeded { .. } | Self::InvalidRequest(_)
        )
    }

    pub fn suggested_delay(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }

    /// Map into the session-level taxonomy recorded on assistant messages.
    pub fn to_session_error(&self) -> SessionError {
        match self {
            Self::AuthFailed(message) => SessionError::AuthError {
                message: message.clone(),
            },
            Self::ContextExceeded { limit, tokens } => SessionError::OverflowError {
                tokens: *tokens,
                limit: *limit,
            },
            Self::Cancelled => SessionError::Aborted,
            other => SessionError::unknown(other.to_string()),
        }
    }
}

pub type ProviderStream = Pin<Box<dyn Stream<Item = ProviderEvent> + Send>>;

/// One message plus its parts, as reconstructed for the provider.
#[derive(Clone, Debug)]
pub struct ModelTurn {
    pub message: Message,
    pub parts: Vec<Part>,
}

/// The complete request for one model step.
#[derive(Clone, Debug)]
pub struct StreamRequest {
    pub system: Vec<String>,
    pub turns: Vec<ModelTurn>,
    pub tools: Vec<ToolDefinition>,
}

impl StreamRequest {
    pub fn empty() -> Self {
        Self {
            system: Vec::new(),
            turns: Vec::new(),
            tools: Vec::new(),
        }
    }
}

/// Generation knobs forwarded to the provider.
#[derive(Clone, Debug, Default)]
pub struct StreamOptions {
    pub max_tokens: Option<u32>,
    pub temperature: Option<f64>,
}

/// Implemented by each provider adapter. One `stream` call is one model step.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    fn spec(&self) -> &ModelSpec;

    async fn stream(
        &self,
        request: &StreamRequest,
        options: &StreamOptions,
    ) -> Result<ProviderStream, ProviderError>;
}

/// Resolves a model reference to a live provider adapter.
pub trait ProviderResolver: Send + Sync {
    fn resolve(&self, model: &ModelRef) -> Option<std::sync::Arc<dyn LlmProvider>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn usage_accumulates() {
        let mut acc = TokenUsage::default();
        acc.add(&TokenUsage {
            input: 100,
            output: 50,
            reasoning: 10,
            cache: CacheUsage { read: 200, write: 30 },
        });
        acc.add(&TokenUsage {
            input: 20,
            output: 5,
            reasoning: 0,
            cache: CacheUsage { read: 40, write: 0 },
        });
        assert_eq!(acc.input, 120);
        assert_eq!(acc.output, 55);
        assert_eq!(acc.reasoning, 10);
        assert_eq!(acc.cache.read, 240);
        assert_eq!(acc.cache.write, 30);
        assert_eq!(acc.context_tokens(), 120 + 55 + 240);
    }

    #[test]
    fn cost_is_per_million() {
        let cost = ModelCost {
            input: 3.0,
            output: 15.0,
            cache_read: 0.3,
            cache_write: 3.75,
        };
        let usage = TokenUsage {
            input: 1_000_000,
            output: 1_000_000,
            reasoning: 0,
            cache: CacheUsage::default(),
        };
        assert!((cost.cost_of(&usage) - 18.0).abs() < 1e-9);
    }

    #[test]
    fn reasoning_billed_as_output() {
        let cost = ModelCost {
            output: 10.0,
            ..Default::default()
        };
        let usage = TokenUsage {
            reasoning: 500_000,
            ..Default::default()
        };
        assert!((cost.cost_of(&usage) - 5.0).abs() < 1e-9);
    }

    #[test]
    fn retryable_classification() {
        assert!(ProviderError::RateLimited { retry_after: None }.is_retryable());
        assert!(ProviderError::ServerError {
            status: 500,
            body: "err".into()
        }
        .is_retryable());
        assert!(ProviderError::Overloaded.is_retryable());
        assert!(ProviderError::Network("tcp".into()).is_retryable());
        assert!(ProviderError::StreamInterrupted("eof".into()).is_retryable());
        assert!(!ProviderError::Cancelled.is_retryable());
    }

    #[test]
    fn fatal_classification() {
        assert!(ProviderError::AuthFailed("bad".into()).is_fatal());
        assert!(ProviderError::ContextExceeded {
            limit: 200_000,
            tokens: 250_000
        }
        .is_fatal());
        assert!(ProviderError::InvalidRequest("bad".into()).is_fatal());
        assert!(!ProviderError::Overloaded.is_fatal());
    }

    #[test]
    fn session_error_mapping() {
        assert_eq!(
            ProviderError::AuthFailed("bad key".into())
                .to_session_error()
                .kind(),
            "AuthError"
        );
        assert_eq!(
            ProviderError::Cancelled.to_session_error(),
            SessionError::Aborted
        );
        assert_eq!(
            ProviderError::ContextExceeded {
                limit: 10,
                tokens: 20
            }
            .to_session_error()
            .kind(),
            "OverflowError"
        );
        assert_eq!(
            ProviderError::Overloaded.to_session_error().kind(),
            "Unknown"
        );
    }

    #[test]
    fn terminal_events() {
        assert!(ProviderEvent::StepFinish {
            usage: TokenUsage::default(),
            stop: StepStop::EndTurn
        }
        .is_terminal());
        assert!(!ProviderEvent::TextDelta { text: "x".into() }.is_terminal());
    }
}
