use tracing::instrument;

use quill_core::ids::SessionId;
use quill_core::todo::Todo;

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;

pub struct TodoRepo {
    db: Database,
}

impl TodoRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Replace a session's todo list wholesale.
    #[instrument(skip(self, todos), fields(session_id = %session_id, count = todos.len()))]
    pub fn set(&self, session_id: &SessionId, todos: &[Todo]) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT OR REPLACE INTO todo (session_id, data_json) VALUES (?1, ?2)",
                rusqlite::params![session_id.as_str(), serde_json::to_string(todos)?],
            )?;
            Ok(())
        })
    }

    pub fn get(&self, session_id: &SessionId) -> Result<Vec<Todo>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT data_json FROM todo WHERE session_id = ?1")?;
            let mut rows = stmt.query([session_id.as_str()])?;
            match rows.next()? {
                Some(row) => {
                    let raw: String = row_helpers::get(row, 0, "todo", "data_json")?;
                    row_helpers::parse_json(&raw, "todo", "data_json")
                }
                None => Ok(Vec::new()),
            }
        })
    }
}
