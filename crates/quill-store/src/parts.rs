use rusqlite::Connection;
use tracing::instrument;

use quill_core::ids::{now_millis, MessageId, PartId, SessionId};
use quill_core::part::{Part, PartBody, ToolState};

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;

pub struct PartRepo {
    db: Database,
}

impl PartRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Insert-or-replace one part.
    #[instrument(skip(self, part), fields(part_id = %part.id))]
    pub fn put(&self, part: &Part) -> Result<(), StoreError> {
        self.db.with_conn(|conn| put_in(conn, part))
    }

    #[instrument(skip(self), fields(part_id = %id))]
    pub fn get(&self, id: &PartId) -> Result<Part, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT data_json FROM part WHERE id = ?1")?;
            let mut rows = stmt.query([id.as_str()])?;
            match rows.next()? {
                Some(row) => {
                    let raw: String = row_helpers::get(row, 0, "part", "data_json")?;
                    row_helpers::parse_json(&raw, "part", "data_json")
                }
                None => Err(StoreError::NotFound(format!("part {id}"))),
            }
        })
    }

    /// Parts of one message, in id (stream) order.
    pub fn list_for_message(&self, message_id: &MessageId) -> Result<Vec<Part>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt =
                conn.prepare("SELECT data_json FROM part WHERE message_id = ?1 ORDER BY id ASC")?;
            let mut rows = stmt.query([message_id.as_str()])?;
            let mut out = Vec::new();
            while let Some(row) = rows.next()? {
                let raw: String = row_helpers::get(row, 0, "part", "data_json")?;
                out.push(row_helpers::parse_json(&raw, "part", "data_json")?);
            }
            Ok(out)
        })
    }

    /// Every part of a session, in id order across messages.
    pub fn list_for_session(&self, session_id: &SessionId) -> Result<Vec<Part>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt =
                conn.prepare("SELECT data_json FROM part WHERE session_id = ?1 ORDER BY id ASC")?;
            let mut rows = stmt.query([session_id.as_str()])?;
            let mut out = Vec::new();
            while let Some(row) = rows.next()? {
                let raw: String = row_helpers::get(row, 0, "part", "data_json")?;
                out.push(row_helpers::parse_json(&raw, "part", "data_json")?);
            }
            Ok(out)
        })
    }

    /// Mark a completed tool part's output as elided from prompt replay.
    /// Pure metadata change; the output text itself is untouched. Returns the
    /// updated part, or `None` if the part is not an un-compacted completed
    /// tool call.
    #[instrument(skip(self), fields(part_id = %id))]
    pub fn mark_compacted(&self, id: &PartId) -> Result<Option<Part>, StoreError> {
        let mut part = self.get(id)?;
        let PartBody::Tool { state, .. } = &mut part.body else {
            return Ok(None);
        };
        let ToolState::Completed { time, .. } = state else {
            return Ok(None);
        };
        if time.compacted.is_some() {
            return Ok(None);
        }
        time.compacted = Some(now_millis());
        self.put(&part)?;
        Ok(Some(part))
    }
}

pub(crate) fn put_in(conn: &Connection, part: &Part) -> Result<(), StoreError> {
    conn.execute(
        "INSERT OR REPLACE INTO part (id, message_id, session_id, data_json)
         VALUES (?1, ?2, ?3, ?4)",
        rusqlite::params![
            part.id.as_str(),
            part.message_id.as_str(),
            part.session_id.as_str(),
            serde_json::to_string(part)?,
        ],
    )?;
    Ok(())
}
