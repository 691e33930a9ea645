use std::path::Path;

use tracing::instrument;

use quill_core::ids::now_millis;
use quill_core::project::{Project, ProjectIcon, ProjectTime, VcsKind};

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;

const SELECT: &str = "SELECT id, worktree, vcs, name, icon_url, icon_color,
        time_created, time_updated, time_initialized, sandboxes_json
 FROM project";

pub struct ProjectRepo {
    db: Database,
}

impl ProjectRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Insert-or-replace by id.
    #[instrument(skip(self, project), fields(project_id = %project.id))]
    pub fn put(&self, project: &Project) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT OR REPLACE INTO project
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
            Ok(())
        })
    }

    #[instrument(skip(self))]
    pub fn get(&self, id: &str) -> Result<Project, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!("{SELECT} WHERE id = ?1"))?;
            let mut rows = stmt.query([id])?;
            match rows.next()? {
                Some(row) => row_to_project(row),
                None => Err(StoreError::NotFound(format!("project {id}"))),
            }
        })
    }

    pub fn list(&self) -> Result<Vec<Project>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!("{SELECT} ORDER BY time_created ASC"))?;
            let mut rows = stmt.query([])?;
            let mut out = Vec::new();
            while let Some(row) = rows.next()? {
                out.push(row_to_project(row)?);
            }
            Ok(out)
        })
    }

    /// Resolve the project for a worktree directory, creating it on first
    /// open. The id is the root commit of the directory's VCS, or `"global"`
    /// when there is none; the id is stable across worktree moves, so a
    /// resolve from a new location updates the stored worktree.
    #[instrument(skip(self))]
    pub fn resolve_for_directory(&self, directory: &Path) -> Result<Project, StoreError> {
        let detected = detect_vcs_root(directory);
        let (id, vcs) = match &detected {
            Some(root_commit) => (root_commit.as_str(), Some(VcsKind::Git)),
            None => (quill_core::project::GLOBAL_PROJECT_ID, None),
        };

        let worktree = directory.to_string_lossy().to_string();
        match self.get(id) {
            Ok(mut project) => {
                if project.worktree != worktree {
                    project.worktree = worktree;
                    project.time.updated = now_millis();
                    self.put(&project)?;
                }
                Ok(project)
            }
            Err(StoreError::NotFound(_)) => {
                let project = Project::new(id, worktree, vcs);
                self.put(&project)?;
                Ok(project)
            }
            Err(e) => Err(e),
        }
    }
}

/// Root-commit hash of the git repository containing `directory`, if any.
fn detect_vcs_root(directory: &Path) -> Option<String> {
    let output = std::process::Command::new("git")
        .arg("-C")
        .arg(directory)
        .args(["rev-list", "--max-parents=0", "--first-parent", "HEAD"])
        .output()
        .ok()?;
    if !output.status.success() {
        return None;
    }
    let text = String::from_utf8_lossy(&output.stdout);
    let first = text.lines().next()?.trim();
    if first.is_empty() {
        None
    } else {
        Some(first.to_string())
    }
}

fn row_to_project(row: &rusqlite::Row<'_>) -> Result<Project, StoreError> {
    let vcs: Option<String> = row_helpers::get_opt(row, 2, "project", "vcs")?;
    let icon_url: Option<String> = row_helpers::get_opt(row, 4, "project", "icon_url")?;
    let icon_color: Option<String> = row_helpers::get_opt(row, 5, "project", "icon_color")?;
    let sandboxes_raw: String = row_helpers::get(row, 9, "project", "sandboxes_json")?;

    Ok(Project {
        id: row_helpers::get(row, 0, "project", "id")?,
        worktree: row_helpers::get(row, 1, "project", "worktree")?,
        vcs: match vcs {
            Some(raw) => Some(raw.parse().map_err(|_| StoreError::CorruptRow {
                table: "project",
                column: "vcs",
                detail: format!("unknown variant: {raw}"),
            })?),
            None => None,
        },
        name: row_helpers::get(row, 3, "project", "name")?,
        icon: if icon_url.is_some() || icon_color.is_some() {
            Some(ProjectIcon {
                url: icon_url,
                color: icon_color,
            })
        } else {
            None
        },
        time: ProjectTime {
            created: row_helpers::get::<i64>(row, 6, "project", "time_created")? as u64,
            updated: row_helpers::get::<i64>(row, 7, "project", "time_updated")? as u64,
            initialized: row_helpers::get_opt::<i64>(row, 8, "project", "time_initialized")?
                .map(|t| t as u64),
        },
        sandboxes: row_helpers::parse_json(&sandboxes_raw, "project", "sandboxes_json")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn put_and_get() {
        let db = Database::in_memory().unwrap();
        let repo = ProjectRepo::new(db);
        let project = Project::new("abc123", "/home/user/repo", Some(VcsKind::Git));
        repo.put(&project).unwrap();

        let fetched = repo.get("abc123").unwrap();
        assert_eq!(fetched, project);
    }

    #[test]
    fn get_missing_is_not_found() {
        let db = Database::in_memory().unwrap();
        let repo = ProjectRepo::new(db);
        assert!(matches!(
            repo.get("nope"),
            Err(StoreError::NotFound(_))
        ));
    }

    #[test]
    fn put_is_upsert() {
        let db = Database::in_memory().unwrap();
        let repo = ProjectRepo::new(db);
        let mut project = Project::global("/a");
        repo.put(&project).unwrap();

        project.worktree = "/b".into();
        project.icon = Some(ProjectIcon {
            url: None,
            color: Some("#aabbcc".into()),
        });
        repo.put(&project).unwrap();

        let fetched = repo.get(&project.id).unwrap();
        assert_eq!(fetched.worktree, "/b");
        assert_eq!(
            fetched.icon.as_ref().and_then(|i| i.color.as_deref()),
            Some("#aabbcc")
        );
        assert_eq!(repo.list().unwrap().len(), 1);
    }

    #[test]
    fn resolve_without_vcs_is_global() {
        let dir = std::env::temp_dir().join(format!("quill-proj-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();

        let db = Database::in_memory().unwrap();
        let repo = ProjectRepo::new(db);
        let project = repo.resolve_for_directory(&dir).unwrap();
        assert_eq!(project.id, quill_core::project::GLOBAL_PROJECT_ID);
        assert!(project.vcs.is_none());

        // Second resolve returns the same project.
        let again = repo.resolve_for_directory(&dir).unwrap();
        assert_eq!(again.id, project.id);
        assert_eq!(repo.list().unwrap().len(), 1);

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn resolve_updates_moved_worktree() {
        let dir_a = std::env::temp_dir().join(format!("quill-proj-{}", uuid::Uuid::new_v4()));
        let dir_b = std::env::temp_dir().join(format!("quill-proj-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir_a).unwrap();
        std::fs::create_dir_all(&dir_b).unwrap();

        let db = Database::in_memory().unwrap();
        let repo = ProjectRepo::new(db);
        // Both dirs are VCS-less, so they share the "global" id; the stored
        // worktree follows the most recent resolve.
        repo.resolve_for_directory(&dir_a).unwrap();
        let project = repo.resolve_for_directory(&dir_b).unwrap();
        assert_eq!(project.worktree, dir_b.to_string_lossy());

        let _ = std::fs::remove_dir_all(&dir_a);
        let _ = std::fs::remove_dir_all(&dir_b);
    }
}
