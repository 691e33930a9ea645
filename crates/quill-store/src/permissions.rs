use tracing::instrument;

use quill_core::permission::PermissionRule;

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;

/// Project-level permission rulesets. Session-level overrides live on the
/// session record itself; agent-level rules come from configuration.
pub struct PermissionRepo {
    db: Database,
}

impl PermissionRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub fn get(&self, project_id: &str) -> Result<Vec<PermissionRule>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt =
                conn.prepare("SELECT data_json FROM permission WHERE project_id = ?1")?;
            let mut rows = stmt.query([project_id])?;
            match rows.next()? {
                Some(row) => {
                    let raw: String = row_helpers::get(row, 0, "permission", "data_json")?;
                    row_helpers::parse_json(&raw, "permission", "data_json")
                }
                None => Ok(Vec::new()),
            }
        })
    }

    #[instrument(skip(self, rules), fields(project_id, count = rules.len()))]
    pub fn set(&self, project_id: &str, rules: &[PermissionRule]) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT OR REPLACE INTO permission (project_id, data_json) VALUES (?1, ?2)",
                rusqlite::params![project_id, serde_json::to_string(rules)?],
            )?;
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::projects::ProjectRepo;
    use quill_core::permission::PermissionAction;
    use quill_core::project::Project;

    fn setup() -> (Database, String) {
        let db = Database::in_memory().unwrap();
        let project = Project::global("/test");
        ProjectRepo::new(db.clone()).put(&project).unwrap();
        (db, project.id)
    }

    #[test]
    fn empty_by_default() {
        let (db, pid) = setup();
        assert!(PermissionRepo::new(db).get(&pid).unwrap().is_empty());
    }

    #[test]
    fn set_and_get() {
        let (db, pid) = setup();
        let repo = PermissionRepo::new(db);
        let rules = vec![
            PermissionRule::new("git *", PermissionAction::Allow),
            PermissionRule::new("rm *", PermissionAction::Deny),
        ];
        repo.set(&pid, &rules).unwrap();
        assert_eq!(repo.get(&pid).unwrap(), rules);
    }

    #[test]
    fn set_requires_project() {
        let (db, _) = setup();
        let repo = PermissionRepo::new(db);
        assert!(repo.set("ghost", &[]).is_err());
    }
}
