use tracing::instrument;

use quill_core::ids::SessionId;
use quill_core::session::ShareInfo;

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;

pub struct ShareRepo {
    db: Database,
}

impl ShareRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Share handle for a session this process published.
    pub fn get(&self, session_id: &SessionId) -> Result<Option<ShareInfo>, StoreError> {
        self.read("session_share", session_id)
    }

    #[instrument(skip(self, share), fields(session_id = %session_id))]
    pub fn set(&self, session_id: &SessionId, share: &ShareInfo) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT OR REPLACE INTO session_share (session_id, data_json) VALUES (?1, ?2)",
                rusqlite::params![session_id.as_str(), serde_json::to_string(share)?],
            )?;
            Ok(())
        })
    }

    #[instrument(skip(self), fields(session_id = %session_id))]
    pub fn remove(&self, session_id: &SessionId) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            conn.execute(
                "DELETE FROM session_share WHERE session_id = ?1",
                [session_id.as_str()],
            )?;
            Ok(())
        })
    }

    /// Shares downloaded from a remote; no FK, the session may not exist
    /// locally.
    pub fn get_remote(&self, session_id: &SessionId) -> Result<Option<ShareInfo>, StoreError> {
        self.read("share", session_id)
    }

    pub fn set_remote(
        &self,
        session_id: &SessionId,
        share: &ShareInfo,
    ) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT OR REPLACE INTO share (session_id, data_json) VALUES (?1, ?2)",
                rusqlite::params![session_id.as_str(), serde_json::to_string(share)?],
            )?;
            Ok(())
        })
    }

    fn read(
        &self,
        table: &'static str,
        session_id: &SessionId,
    ) -> Result<Option<ShareInfo>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt =
                conn.prepare(&format!("SELECT data_json FROM {table} WHERE session_id = ?1"))?;
            let mut rows = stmt.query([session_id.as_str()])?;
            match rows.next()? {
                Some(row) => {
                    let raw: String = row_helpers::get(row, 0, "session_share", "data_json")?;
                    Ok(Some(row_helpers::parse_json(
                        &raw,
                        "session_share",
                        "data_json",
                    )?))
                }
                None => Ok(None),
            }
        })
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

    fn share() -> ShareInfo {
        ShareInfo {
            id: "share_1".into(),
            secret: "s3cret".into(),
            url: "https://example.test/s/share_1".into(),
        }
    }

    #[test]
    fn absent_by_default() {
        let (db, sid) = setup();
        assert!(ShareRepo::new(db).get(&sid).unwrap().is_none());
    }

    #[test]
    fn set_get_remove() {
        let (db, sid) = setup();
        let repo = ShareRepo::new(db);
        repo.set(&sid, &share()).unwrap();
        assert_eq!(repo.get(&sid).unwrap(), Some(share()));
        repo.remove(&sid).unwrap();
        assert!(repo.get(&sid).unwrap().is_none());
    }

    #[test]
    fn remote_shares_need_no_session() {
        let (db, _) = setup();
        let repo = ShareRepo::new(db);
        let sid = SessionId::from_raw("ses_remote_only");
        repo.set_remote(&sid, &share()).unwrap();
        assert_eq!(repo.get_remote(&sid).unwrap(), Some(share()));
        // The FK-backed table rejects the same id.
        assert!(repo.set(&sid, &share()).is_err());
    }
}
