use std::fs;
use std::path::{Path, PathBuf};

use rusqlite::Connection;
use tracing::{info, warn};

use quill_core::message::Message;
use quill_core::part::Part;
use quill_core::permission::PermissionRule;
use quill_core::project::Project;
use quill_core::session::Session;
use quill_core::todo::Todo;

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;

/// Written into `<data>/storage/` once the import has committed; its
/// presence makes every later run a no-op.
pub const MARKER_FILE: &str = "sqlite-migrated";

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ImportReport {
    pub projects: usize,
    pub sessions: usize,
    pub messages: usize,
    pub parts: usize,
    pub todos: usize,
    pub permissions: usize,
    pub skipped: usize,
}

impl ImportReport {
    pub fn total(&self) -> usize {
        self.projects + self.sessions + self.messages + self.parts + self.todos + self.permissions
    }
}

/// One-shot import of the legacy JSON tree under `<data>/storage/`:
///
/// ```text
/// storage/project/<projectID>.json
/// storage/session/<projectID>/<sessionID>.json
/// storage/message/<sessionID>/<messageID>.json
/// storage/part/<messageID>/<partID>.json
/// storage/todo/<sessionID>.json
/// storage/permission/<projectID>.json
/// ```
///
/// Files are parsed, FK-validated (orphans skipped with a warning) and
/// inserted with conflict-ignore inside one transaction; the marker file is
/// written last, so a crash before commit simply re-runs the import.
pub fn run(db: &Database, data_dir: &Path) -> Result<ImportReport, StoreError> {
    let storage = data_dir.join("storage");
    if !storage.is_dir() {
        return Ok(ImportReport::default());
    }
    let marker = storage.join(MARKER_FILE);
    if marker.exists() {
        return Ok(ImportReport::default());
    }

    let report = db.transaction(|conn| import_tree(conn, &storage))?;

    fs::write(&marker, chrono::Utc::now().to_rfc3339())?;
    info!(
        imported = report.total(),
        skipped = report.skipped,
        "legacy storage imported"
    );
    Ok(report)
}

fn import_tree(conn: &Connection, storage: &Path) -> Result<ImportReport, StoreError> {
    let mut report = ImportReport::default();

    for path in json_files(&storage.join("project")) {
        let Some(project) = parse::<Project>(&path, &mut report) else {
            continue;
        };
        conn.execute(
            "INSERT OR IGNORE INTO project
                (id, worktree, vcs, name, icon_url, icon_color,
                 time_created, time_updated, time_initialized, sandboxes_json)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            rusqlite::params![
                project.id,
                project.worktree,
                project.vcs.map(|v| v.to_string()),
                project.name,
                project.icon.as_ref().and_then(|i| i.url.clone()),
                project.icon.as_ref().and_then(|i| i.color.clone()),
                project.time.created as i64,
                project.time.updated as i64,
                project.time.initialized.map(|t| t as i64),
                serde_json::to_string(&project.sandboxes)?,
            ],
        )?;
        report.projects += 1;
    }

    for dir in sub_dirs(&storage.join("session")) {
        let project_id = dir_name(&dir);
        if !exists(conn, "project", "id", &project_id)? {
            warn!(project_id, "skipping sessions of unknown project");
            report.skipped += json_files(&dir).len();
            continue;
        }
        for path in json_files(&dir) {
            let Some(session) = parse::<Session>(&path, &mut report) else {
                continue;
            };
            conn.execute(
                "INSERT OR IGNORE INTO session
                    (id, project_id, parent_id, created_at, updated_at, data_json)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                rusqlite::params![
                    session.id.as_str(),
                    session.project_id,
                    session.parent_id.as_ref().map(|p| p.as_str()),
                    row_helpers::rfc3339_from_ms(session.time.created),
                    row_helpers::rfc3339_from_ms(session.time.updated),
                    serde_json::to_string(&session)?,
                ],
            )?;
            report.sessions += 1;
        }
    }

    for dir in sub_dirs(&storage.join("message")) {
        let session_id = dir_name(&dir);
        if !exists(conn, "session", "id", &session_id)? {
            warn!(session_id, "skipping messages of unknown session");
            report.skipped += json_files(&dir).len();
            continue;
        }
        for path in json_files(&dir) {
            let Some(message) = parse::<Message>(&path, &mut report) else {
                continue;
            };
            conn.execute(
                "INSERT OR IGNORE INTO message (id, session_id, created_at, data_json)
                 VALUES (?1, ?2, ?3, ?4)",
                rusqlite::params![
                    message.id().as_str(),
                    message.session_id().as_str(),
                    row_helpers::rfc3339_from_ms(message.created()),
                    serde_json::to_string(&message)?,
                ],
            )?;
            report.messages += 1;
        }
    }

    for dir in sub_dirs(&storage.join("part")) {
        let message_id = dir_name(&dir);
        if !exists(conn, "message", "id", &message_id)? {
            warn!(message_id, "skipping parts of unknown message");
            report.skipped += json_files(&dir).len();
            continue;
        }
        for path in json_files(&dir) {
            let Some(part) = parse::<Part>(&path, &mut report) else {
                continue;
            };
            conn.execute(
                "INSERT OR IGNORE INTO part (id, message_id, session_id, data_json)
                 VALUES (?1, ?2, ?3, ?4)",
                rusqlite::params![
                    part.id.as_str(),
                    part.message_id.as_str(),
                    part.session_id.as_str(),
                    serde_json::to_string(&part)?,
                ],
            )?;
            report.parts += 1;
        }
    }

    for path in json_files(&storage.join("todo")) {
        let session_id = file_stem(&path);
        if !exists(conn, "session", "id", &session_id)? {
            warn!(session_id, "skipping todos of unknown session");
            report.skipped += 1;
            continue;
        }
        let Some(todos) = parse::<Vec<Todo>>(&path, &mut report) else {
            continue;
        };
        conn.execute(
            "INSERT OR IGNORE INTO todo (session_id, data_json) VALUES (?1, ?2)",
            rusqlite::params![session_id, serde_json::to_string(&todos)?],
        )?;
        report.todos += 1;
    }

    for path in json_files(&storage.join("permission")) {
        let project_id = file_stem(&path);
        if !exists(conn, "project", "id", &project_id)? {
            warn!(project_id, "skipping permissions of unknown project");
            report.skipped += 1;
            continue;
        }
        let Some(rules) = parse::<Vec<PermissionRule>>(&path, &mut report) else {
            continue;
        };
        conn.execute(
            "INSERT OR IGNORE INTO permission (project_id, data_json) VALUES (?1, ?2)",
            rusqlite::params![project_id, serde_json::to_string(&rules)?],
        )?;
        report.permissions += 1;
    }

    Ok(report)
}

fn parse<T: serde::de::DeserializeOwned>(path: &Path, report: &mut ImportReport) -> Option<T> {
    let raw = match fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "unreadable legacy file skipped");
            report.skipped += 1;
            return None;
        }
    };
    match serde_json::from_str(&raw) {
        Ok(value) => Some(value),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "unparseable legacy file skipped");
            report.skipped += 1;
            None
        }
    }
}

fn exists(
    conn: &Connection,
    table: &str,
    column: &str,
    value: &str,
) -> Result<bool, StoreError> {
    let found = conn
        .query_row(
            &format!("SELECT 1 FROM {table} WHERE {column} = ?1"),
            [value],
            |_| Ok(()),
        )
        .map(|_| true);
    match found {
        Ok(v) => Ok(v),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(false),
        Err(e) => Err(e.into()),
    }
}

fn json_files(dir: &Path) -> Vec<PathBuf> {
    let mut files: Vec<PathBuf> = fs::read_dir(dir)
        .map(|entries| {
            entries
                .flatten()
                .map(|e| e.path())
                .filter(|p| p.extension().is_some_and(|ext| ext == "json"))
                .collect()
        })
        .unwrap_or_default();
    files.sort();
    files
}

fn sub_dirs(dir: &Path) -> Vec<PathBuf> {
    let mut dirs: Vec<PathBuf> = fs::read_dir(dir)
        .map(|entries| {
            entries
                .flatten()
                .map(|e| e.path())
                .filter(|p| p.is_dir())
                .collect()
        })
        .unwrap_or_default();
    dirs.sort();
    dirs
}

fn dir_name(dir: &Path) -> String {
    dir.file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default()
}

fn file_stem(path: &Path) -> String {
    path.file_stem()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default()
}
