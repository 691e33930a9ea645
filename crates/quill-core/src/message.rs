use serde::{Deserialize, Serialize};

use crate::error::SessionError;
use crate::ids::{now_millis, MessageId, SessionId};
use crate::provider::{ModelRef, TokenUsage};

/// A message in a session, either side of the conversation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "role", rename_all = "snake_case")]
pub enum Message {
    User(UserMessage),
    Assistant(AssistantMessage),
}

impl Message {
    pub fn id(&self) -> &MessageId {
        match self {
            Self::User(m) => &m.id,
            Self::Assistant(m) => &m.id,
        }
    }

    pub fn session_id(&self) -> &SessionId {
        match self {
            Self::User(m) => &m.session_id,
            Self::Assistant(m) => &m.session_id,
        }
    }

    pub fn created(&self) -> u64 {
        match self {
            Self::User(m) => m.time.created,
            Self::Assistant(m) => m.time.created,
        }
    }

    pub fn as_assistant(&self) -> Option<&AssistantMessage> {
        match self {
            Self::Assistant(m) => Some(m),
            _ => None,
        }
    }

    pub fn is_user(&self) -> bool {
        matches!(self, Self::User(_))
    }

    /// An assistant message flagged as a compaction summary.
    pub fn is_summary(&self) -> bool {
        matches!(self, Self::Assistant(m) if m.summary)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageTime {
    pub created: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed: Option<u64>,
}

impl MessageTime {
    pub fn now() -> Self {
        Self {
            created: now_millis(),
            completed: None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct UserMessage {
    pub id: MessageId,
    pub session_id: SessionId,
    pub time: MessageTime,
    pub agent: String,
    pub model: ModelRef,
}

impl UserMessage {
    pub fn new(session_id: SessionId, agent: impl Into<String>, model: ModelRef) -> Self {
        Self {
            id: MessageId::new(),
            session_id,
            time: MessageTime::now(),
            agent: agent.into(),
            model,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AssistantMessage {
    pub id: MessageId,
    pub session_id: SessionId,
    /// The user message this responds to.
    pub parent_id: MessageId,
    pub time: MessageTime,
    pub provider_id: String,
    pub model_id: String,
    pub agent: String,
    /// Snapshot of the system prompt blocks in effect for this turn.
    pub system: Vec<String>,
    pub path: MessagePath,
    /// Accumulated; monotonically grows while the turn streams.
    pub cost: f64,
    pub tokens: TokenUsage,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub summary: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<SessionError>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessagePath {
    pub cwd: String,
    pub root: String,
}

impl AssistantMessage {
    pub fn new(
        session_id: SessionId,
        parent_id: MessageId,
        model: &ModelRef,
        agent: impl Into<String>,
        system: Vec<String>,
        path: MessagePath,
    ) -> Self {
        Self {
            id: MessageId::new(),
            session_id,
            parent_id,
            time: MessageTime::now(),
            provider_id: model.provider_id.clone(),
            model_id: model.model_id.clone(),
            agent: agent.into(),
            system,
            path,
            cost: 0.0,
            tokens: TokenUsage::default(),
            summary: false,
            error: None,
        }
    }

    /// Set once; later calls keep the original completion time.
    pub fn finish(&mut self) {
        if self.time.completed.is_none() {
            self.time.completed = Some(now_millis());
        }
    }

    pub fn is_finished(&self) -> bool {
        self.time.completed.is_some()
    }
}
