use tracing::instrument;

use quill_core::ids::SessionId;
use quill_core::session::Session;

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;

pub struct SessionRepo {
    db: Database,
}

impl SessionRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Insert-or-replace the full session record.
    #[instrument(skip(self, session), fields(session_id = %session.id))]
    pub fn put(&self, session: &Session) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT OR REPLACE INTO session
                    (id, project_id, parent_id, created_at, updated_at, data_json)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                rusqlite::params![
                    session.id.as_str(),
                    session.project_id,
                    session.parent_id.as_ref().map(|p| p.as_str()),
                    row_helpers::rfc3339_from_ms(session.time.created),
                    row_helpers::rfc3339_from_ms(session.time.updated),
                    serde_json::to_string(session)?,
                ],
            )?;
            Ok(())
        })
    }

    #[instrument(skip(self), fields(session_id = %id))]
    pub fn get(&self, id: &SessionId) -> Result<Session, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT data_json FROM session WHERE id = ?1")?;
            let mut rows = stmt.query([id.as_str()])?;
            match rows.next()? {
                Some(row) => {
                    let raw: String = row_helpers::get(row, 0, "session", "data_json")?;
                    row_helpers::parse_json(&raw, "session", "data_json")
                }
                None => Err(StoreError::NotFound(format!("session {id}"))),
            }
        })
    }

    /// Sessions of a project, newest first.
    #[instrument(skip(self))]
    pub fn list_for_project(&self, project_id: &str) -> Result<Vec<Session>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT data_json FROM session WHERE project_id = ?1 ORDER BY id DESC",
            )?;
            let mut rows = stmt.query([project_id])?;
            let mut out = Vec::new();
            while let Some(row) = rows.next()? {
                let raw: String = row_helpers::get(row, 0, "session", "data_json")?;
                out.push(row_helpers::parse_json(&raw, "session", "data_json")?);
            }
            Ok(out)
        })
    }

    /// Child sessions (subagents / branches) of a session.
    pub fn children(&self, parent: &SessionId) -> Result<Vec<Session>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn
                .prepare("SELECT data_json FROM session WHERE parent_id = ?1 ORDER BY id ASC")?;
            let mut rows = stmt.query([parent.as_str()])?;
            let mut out = Vec::new();
            while let Some(row) = rows.next()? {
                let raw: String = row_helpers::get(row, 0, "session", "data_json")?;
                out.push(row_helpers::parse_json(&raw, "session", "data_json")?);
            }
            Ok(out)
        })
    }

    /// Hard delete; messages, parts, todos, diffs and shares cascade.
    #[instrument(skip(self), fields(session_id = %id))]
    pub fn delete(&self, id: &SessionId) -> Result<(), StoreError> {
        let deleted = self.db.with_conn(|conn| {
            Ok(conn.execute("DELETE FROM session WHERE id = ?1", [id.as_str()])?)
        })?;
        if deleted == 0 {
            return Err(StoreError::NotFound(format!("session {id}")));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::projects::ProjectRepo;
    use quill_core::project::Project;

    fn setup() -> (Database, String) {
        let db = Database::in_memory().unwrap();
        let project = Project::global("/test");
        ProjectRepo::new(db.clone()).put(&project).unwrap();
        (db, project.id)
    }

    fn session(project_id: &str) -> Session {
        Session::new(project_id, "/test", None, None, "0.1.0")
    }

    #[test]
    fn put_and_get() {
        let (db, pid) = setup();
        let repo = SessionRepo::new(db);
        let s = session(&pid);
        repo.put(&s).unwrap();
        assert_eq!(repo.get(&s.id).unwrap(), s);
    }

    #[test]
    fn get_missing_is_not_found() {
        let (db, _) = setup();
        let repo = SessionRepo::new(db);
        assert!(matches!(
            repo.get(&SessionId::from_raw("ses_missing")),
            Err(StoreError::NotFound(_))
        ));
    }

    #[test]
    fn put_requires_existing_project() {
        let (db, _) = setup();
        let repo = SessionRepo::new(db);
        let s = session("does-not-exist");
        assert!(repo.put(&s).is_err());
    }

    #[test]
    fn list_newest_first() {
        let (db, pid) = setup();
        let repo = SessionRepo::new(db);
        let a = session(&pid);
        let b = session(&pid);
        repo.put(&a).unwrap();
        repo.put(&b).unwrap();

        let list = repo.list_for_project(&pid).unwrap();
        assert_eq!(list.len(), 2);
        assert_eq!(list[0].id, b.id);
        assert_eq!(list[1].id, a.id);
    }

    #[test]
    fn upsert_replaces() {
        let (db, pid) = setup();
        let repo = SessionRepo::new(db);
        let mut s = session(&pid);
        repo.put(&s).unwrap();

        s.title = "renamed".into();
        s.touch();
        repo.put(&s).unwrap();

        let fetched = repo.get(&s.id).unwrap();
        assert_eq!(fetched.title, "renamed");
        assert_eq!(repo.list_for_project(&pid).unwrap().len(), 1);
    }

    #[test]
    fn children_linked_by_parent() {
        let (db, pid) = setup();
        let repo = SessionRepo::new(db);
        let parent = session(&pid);
        repo.put(&parent).unwrap();

        let child = Session::new(&pid, "/test", None, Some(parent.id.clone()), "0.1.0");
        repo.put(&child).unwrap();

        let children = repo.children(&parent.id).unwrap();
        assert_eq!(children.len(), 1);
        assert_eq!(children[0].id, child.id);
    }

    #[test]
    fn delete_missing_is_not_found() {
        let (db, _) = setup();
        let repo = SessionRepo::new(db);
        assert!(matches!(
            repo.delete(&SessionId::from_raw("ses_missing")),
            Err(StoreError::NotFound(_))
        ));
    }

    #[test]
    fn delete_cascades_to_project_scope() {
        let (db, pid) = setup();
        let repo = SessionRepo::new(db);
        let s = session(&pid);
        repo.put(&s).unwrap();
        repo.delete(&s.id).unwrap();
        assert!(repo.get(&s.id).is_err());
        assert!(repo.list_for_project(&pid).unwrap().is_empty());
    }
}
