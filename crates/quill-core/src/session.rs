use serde::{Deserialize, Serialize};

use crate::ids::{now_millis, MessageId, PartId, SessionId};
use crate::permission::PermissionRule;

/// An ordered conversation owned by a project.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: SessionId,
    pub project_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<SessionId>,
    pub title: String,
    pub directory: String,
    pub version: String,
    pub time: SessionTime,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revert: Option<RevertAnchor>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub share: Option<ShareInfo>,
    /// Session-level permission ruleset override; consulted before agent and
    /// project rules.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub permissions: Vec<PermissionRule>,
}

impl Session {
    pub fn new(
        project_id: impl Into<String>,
        directory: impl Into<String>,
        title: Option<String>,
        parent_id: Option<SessionId>,
        version: impl Into<String>,
    ) -> Self {
        let id = SessionId::new();
        let now = now_millis();
        Self {
            title: title.unwrap_or_else(|| format!("New session - {}", id.as_str())),
            id,
            project_id: project_id.into(),
            parent_id,
            directory: directory.into(),
            version: version.into(),
            time: SessionTime {
                created: now,
                updated: now,
                compacting: None,
                archived: None,
            },
            revert: None,
            share: None,
            permissions: Vec::new(),
        }
    }

    pub fn touch(&mut self) {
        self.time.updated = now_millis();
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionTime {
    pub created: u64,
    pub updated: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compacting: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub archived: Option<u64>,
}

/// Point-in-time anchor a session can be reverted to.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RevertAnchor {
    pub message_id: MessageId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub part_id: Option<PartId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diff: Option<String>,
}

/// Opaque handle to an external publishing service.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShareInfo {
    pub id: String,
    pub secret: String,
    pub url: String,
}
