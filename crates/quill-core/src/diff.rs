use serde::{Deserialize, Serialize};

/// Accumulated file changes for one session.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDiff {
    pub additions: u64,
    pub deletions: u64,
    #[serde(default)]
    pub files: Vec<FileDiff>,
}

impl SessionDiff {
    /// Merge one file's change in, replacing any earlier record for the path
    /// and refreshing the counters.
    pub fn apply(&mut self, diff: FileDiff) {
        self.files.retain(|f| f.path != diff.path);
        self.files.push(diff);
        self.additions = self.files.iter().map(|f| f.additions).sum();
        self.deletions = self.files.iter().map(|f| f.deletions).sum();
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileDiff {
    pub path: String,
    pub additions: u64,
    pub deletions: u64,
    /// Unified diff text.
    pub diff: String,
}
