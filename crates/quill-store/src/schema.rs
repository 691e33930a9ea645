//! SQL for the quill database. Connection-time pragmas plus the forward-only
//! migration list consumed by [`crate::migrate`].

pub const PRAGMAS: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;
PRAGMA foreign_keys = ON;
PRAGMA busy_timeout = 5000;
PRAGMA cache_size = -65536;
"#;

/// A named migration. Names must sort after every previously shipped name.
pub struct Migration {
    pub name: &'static str,
    pub sql: &'static str,
}

pub const MIGRATIONS: &[Migration] = &[Migration {
    name: "0001_initial",
    sql: r#"
CREATE TABLE IF NOT EXISTS project (
    id TEXT PRIMARY KEY,
    worktree TEXT NOT NULL,
    vcs TEXT,
    name TEXT NOT NULL,
    icon_url TEXT,
    icon_color TEXT,
    time_created INTEGER NOT NULL,
    time_updated INTEGER NOT NULL,
    time_initialized INTEGER,
    sandboxes_json TEXT NOT NULL DEFAULT '[]'
);

CREATE TABLE IF NOT EXISTS session (
    id TEXT PRIMARY KEY,
    project_id TEXT NOT NULL REFERENCES project(id) ON DELETE CASCADE,
    parent_id TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    data_json TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_session_project ON session(project_id);
CREATE INDEX IF NOT EXISTS idx_session_parent ON session(parent_id);

CREATE TABLE IF NOT EXISTS message (
    id TEXT PRIMARY KEY,
    session_id TEXT NOT NULL REFERENCES session(id) ON DELETE CASCADE,
    created_at TEXT NOT NULL,
    data_json TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_message_session ON message(session_id);

CREATE TABLE IF NOT EXISTS part (
    id TEXT PRIMARY KEY,
    message_id TEXT NOT NULL REFERENCES message(id) ON DELETE CASCADE,
    session_id TEXT NOT NULL,
    data_json TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_part_message ON part(message_id);
CREATE INDEX IF NOT EXISTS idx_part_session ON part(session_id);

CREATE TABLE IF NOT EXISTS session_diff (
    session_id TEXT PRIMARY KEY REFERENCES session(id) ON DELETE CASCADE,
    data_json TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS todo (
    session_id TEXT PRIMARY KEY REFERENCES session(id) ON DELETE CASCADE,
    data_json TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS permission (
    project_id TEXT PRIMARY KEY REFERENCES project(id) ON DELETE CASCADE,
    data_json TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS session_share (
    session_id TEXT PRIMARY KEY REFERENCES session(id) ON DELETE CASCADE,
    data_json TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS share (
    session_id TEXT PRIMARY KEY,
    data_json TEXT NOT NULL
);
"#,
}];
