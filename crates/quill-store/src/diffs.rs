use tracing::instrument;

use quill_core::diff::{FileDiff, SessionDiff};
use quill_core::ids::SessionId;

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;

pub struct DiffRepo {
    db: Database,
}

impl DiffRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub fn get(&self, session_id: &SessionId) -> Result<SessionDiff, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt =
                conn.prepare("SELECT data_json FROM session_diff WHERE session_id = ?1")?;
            let mut rows = stmt.query([session_id.as_str()])?;
            match rows.next()? {
                Some(row) => {
                    let raw: String = row_helpers::get(row, 0, "session_diff", "data_json")?;
                    row_helpers::parse_json(&raw, "session_diff", "data_json")
                }
                None => Ok(SessionDiff::default()),
            }
        })
    }

    #[instrument(skip(self, diff), fields(session_id = %session_id))]
    pub fn set(&self, session_id: &SessionId, diff: &SessionDiff) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT OR REPLACE INTO session_diff (session_id, data_json) VALUES (?1, ?2)",
                rusqlite::params![session_id.as_str(), serde_json::to_string(diff)?],
            )?;
            Ok(())
        })
    }

    /// Fold one file change into the stored record and return the new state.
    pub fn apply(&self, session_id: &SessionId, file: FileDiff) -> Result<SessionDiff, StoreError> {
        let mut diff = self.get(session_id)?;
        diff.apply(file);
        self.set(session_id, &diff)?;
        Ok(diff)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::projects::ProjectRepo;
    use crate::sessions::SessionRepo;
    use quill_core::project::Project;
    use quill_core::session::Session;

    fn setup() -> (Database, SessionId) {
        let db = Database::in_memory().unwrap();
        let project = Project::global("/test");
        ProjectRepo::new(db.clone()).put(&project).unwrap();
        let session = Session::new(&project.id, "/test", None, None, "0.1.0");
        SessionRepo::new(db.clone()).put(&session).unwrap();
        (db, session.id)
    }

    #[test]
    fn default_when_absent() {
        let (db, sid) = setup();
        let diff = DiffRepo::new(db).get(&sid).unwrap();
        assert_eq!(diff, SessionDiff::default());
    }

    #[test]
    fn apply_accumulates() {
        let (db, sid) = setup();
        let repo = DiffRepo::new(db);
        repo.apply(
            &sid,
            FileDiff {
                path: "src/a.rs".into(),
                additions: 4,
                deletions: 1,
                diff: "@@ -1 +1,4 @@".into(),
            },
        )
        .unwrap();
        let state = repo
            .apply(
                &sid,
                FileDiff {
                    path: "src/b.rs".into(),
                    additions: 2,
                    deletions: 0,
                    diff: String::new(),
                },
            )
            .unwrap();
        assert_eq!(state.additions, 6);
        assert_eq!(state.deletions, 1);
        assert_eq!(repo.get(&sid).unwrap(), state);
    }
}
