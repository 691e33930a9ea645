use serde::{Deserialize, Serialize};

use crate::ids::now_millis;

/// Project id used when a directory has no version control root.
pub const GLOBAL_PROJECT_ID: &str = "global";

/// Logical root for a set of sessions, keyed by the root commit of its VCS
/// (or `"global"`). The id survives worktree moves.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Project {
    pub id: String,
    pub worktree: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vcs: Option<VcsKind>,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icon: Option<ProjectIcon>,
    pub time: ProjectTime,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sandboxes: Vec<String>,
}

impl Project {
    pub fn new(id: impl Into<String>, worktree: impl Into<String>, vcs: Option<VcsKind>) -> Self {
        let worktree = worktree.into();
        let name = std::path::Path::new(&worktree)
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("project")
            .to_string();
        let now = now_millis();
        Self {
            id: id.into(),
            worktree,
            vcs,
            name,
            icon: None,
            time: ProjectTime {
                created: now,
                updated: now,
                initialized: None,
            },
            sandboxes: Vec::new(),
        }
    }

    pub fn global(worktree: impl Into<String>) -> Self {
        Self::new(GLOBAL_PROJECT_ID, worktree, None)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VcsKind {
    Git,
}

impl std::fmt::Display for VcsKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Git => write!(f, "git"),
        }
    }
}

impl std::str::FromStr for VcsKind {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "git" => Ok(Self::Git),
            other => Err(format!("unknown vcs kind: {other}")),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectIcon {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectTime {
    pub created: u64,
    pub updated: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initialized: Option<u64>,
}
