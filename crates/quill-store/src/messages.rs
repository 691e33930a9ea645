use rusqlite::Connection;
use tracing::instrument;

use quill_core::ids::{MessageId, SessionId};
use quill_core::message::Message;
use quill_core::part::Part;

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;

pub struct MessageRepo {
    db: Database,
}

impl MessageRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Insert-or-replace one message.
    #[instrument(skip(self, message), fields(message_id = %message.id()))]
    pub fn put(&self, message: &Message) -> Result<(), StoreError> {
        self.db.with_conn(|conn| put_in(conn, message))
    }

    /// Persist a message together with its parts in one transaction: the
    /// atomic persistence step of a turn tick. Partial writes are never
    /// observable.
    #[instrument(skip(self, message, parts), fields(message_id = %message.id(), parts = parts.len()))]
    pub fn put_with_parts(&self, message: &Message, parts: &[Part]) -> Result<(), StoreError> {
        self.db.transaction(|conn| {
            put_in(conn, message)?;
            for part in parts {
                crate::parts::put_in(conn, part)?;
            }
            Ok(())
        })
    }

    #[instrument(skip(self), fields(message_id = %id))]
    pub fn get(&self, id: &MessageId) -> Result<Message, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT data_json FROM message WHERE id = ?1")?;
            let mut rows = stmt.query([id.as_str()])?;
            match rows.next()? {
                Some(row) => {
                    let raw: String = row_helpers::get(row, 0, "message", "data_json")?;
                    row_helpers::parse_json(&raw, "message", "data_json")
                }
                None => Err(StoreError::NotFound(format!("message {id}"))),
            }
        })
    }

    /// All messages of a session in conversation order (ids are sortable).
    #[instrument(skip(self), fields(session_id = %session_id))]
    pub fn list(&self, session_id: &SessionId) -> Result<Vec<Message>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt =
                conn.prepare("SELECT data_json FROM message WHERE session_id = ?1 ORDER BY id ASC")?;
            let mut rows = stmt.query([session_id.as_str()])?;
            let mut out = Vec::new();
            while let Some(row) = rows.next()? {
                let raw: String = row_helpers::get(row, 0, "message", "data_json")?;
                out.push(row_helpers::parse_json(&raw, "message", "data_json")?);
            }
            Ok(out)
        })
    }

    /// Remove one message; its parts cascade.
    #[instrument(skip(self), fields(message_id = %id))]
    pub fn remove(&self, id: &MessageId) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            conn.execute("DELETE FROM message WHERE id = ?1", [id.as_str()])?;
            Ok(())
        })
    }

    pub fn count(&self, session_id: &SessionId) -> Result<i64, StoreError> {
        self.db.with_conn(|conn| {
            Ok(conn.query_row(
                "SELECT COUNT(*) FROM message WHERE session_id = ?1",
                [session_id.as_str()],
                |row| row.get(0),
            )?)
        })
    }
}

pub(crate) fn put_in(conn: &Connection, message: &Message) -> Result<(), StoreError> {
    conn.execute(
        "INSERT OR REPLACE INTO message (id, session_id, created_at, data_json)
         VALUES (?1, ?2, ?3, ?4)",
        rusqlite::params![
            message.id().as_str(),
            message.session_id().as_str(),
            row_helpers::rfc3339_from_ms(message.created()),
            serde_json::to_string(message)?,
        ],
    )?;
    Ok(())
}
