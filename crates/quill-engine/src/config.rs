use std::collections::{HashMap, HashSet};
use std::path::PathBuf;

use quill_core::permission::PermissionRule;

/// Process-level engine configuration, wired once at startup.
#[derive(Clone, Debug)]
pub struct EngineConfig {
    /// Root of persisted state (`quill.db`, `tool-output/`, `storage/`).
    pub data_dir: PathBuf,
    /// Worktree the sessions operate in.
    pub directory: PathBuf,
    pub project_id: String,
    pub version: String,
    /// Custom rule blocks appended to every system prompt.
    pub instructions: Vec<String>,
    /// When off, a context overflow before a turn is an error instead of a
    /// compaction.
    pub auto_compact: bool,
    pub agents: HashMap<String, AgentConfig>,
}

impl EngineConfig {
    pub fn new(
        data_dir: impl Into<PathBuf>,
        directory: impl Into<PathBuf>,
        project_id: impl Into<String>,
    ) -> Self {
        let mut agents = HashMap::new();
        agents.insert("build".to_string(), AgentConfig::named("build"));
        Self {
            data_dir: data_dir.into(),
            directory: directory.into(),
            project_id: project_id.into(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            instructions: Vec::new(),
            auto_compact: true,
            agents,
        }
    }

    /// Agent configuration by name, falling back to an unrestricted agent of
    /// that name.
    pub fn agent(&self, name: &str) -> AgentConfig {
        self.agents
            .get(name)
            .cloned()
            .unwrap_or_else(|| AgentConfig::named(name))
    }
}

/// A named bundle of system-prompt style, allowed tools and permission rules.
#[derive(Clone, Debug, Default)]
pub struct AgentConfig {
    pub name: String,
    /// Replaces the base system prompt when set.
    pub prompt: Option<String>,
    /// Allowed tool names; `None` allows every registered tool.
    pub tools: Option<HashSet<String>>,
    pub permissions: Vec<PermissionRule>,
}

impl AgentConfig {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }
}
