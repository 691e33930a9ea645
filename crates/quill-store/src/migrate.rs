use rusqlite::Connection;
use tracing::info;

use crate::error::StoreError;
use crate::schema::MIGRATIONS;

/// Apply all pending migrations in name order. Each migration runs in its own
/// transaction and is recorded in `_migrations`; already-recorded names are
/// skipped. Returns how many were applied.
pub fn run(conn: &Connection) -> Result<usize, StoreError> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS _migrations (
            name TEXT PRIMARY KEY,
            applied_at TEXT NOT NULL
        );",
    )?;

    debug_assert!(
        MIGRATIONS.windows(2).all(|w| w[0].name < w[1].name),
        "migrations must be declared in name order"
    );

    let mut applied = 0;
    for migration in MIGRATIONS {
        let done: bool = conn
            .query_row(
                "SELECT 1 FROM _migrations WHERE name = ?1",
                [migration.name],
                |_| Ok(true),
            )
            .unwrap_or(false);
        if done {
            continue;
        }

        let tx = conn
            .unchecked_transaction()
            .map_err(|e| migration_error(migration.name, e))?;
        tx.execute_batch(migration.sql)
            .map_err(|e| migration_error(migration.name, e))?;
        tx.execute(
            "INSERT INTO _migrations (name, applied_at) VALUES (?1, ?2)",
            rusqlite::params![migration.name, chrono::Utc::now().to_rfc3339()],
        )
        .map_err(|e| migration_error(migration.name, e))?;
        tx.commit().map_err(|e| migration_error(migration.name, e))?;

        info!(name = migration.name, "migration applied");
        applied += 1;
    }
    Ok(applied)
}

fn migration_error(name: &str, e: rusqlite::Error) -> StoreError {
    StoreError::Migration {
        name: name.to_string(),
        detail: e.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::PRAGMAS;

    fn raw_conn() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(PRAGMAS).unwrap();
        conn
    }

    #[test]
    fn applies_once(){
        let conn = raw_conn();
        let first = run(&conn).unwrap();
        assert_eq!(first, MIGRATIONS.len());

        let second = run(&conn).unwrap();
        assert_eq!(second, 0);
    }

    #[test]
    fn records_names() {
        let conn = raw_conn();
        run(&conn).unwrap();
        let names: Vec<String> = conn
            .prepare("SELECT name FROM _migrations ORDER BY name")
            .unwrap()
            .query_map([], |row| row.get(0))
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap();
        assert!(names.contains(&"0001_initial".to_string()));
    }

    #[test]
    fn applied_at_is_rfc3339() {
        let conn = raw_conn();
        run(&conn).unwrap();
        let applied_at: String = conn
            .query_row("SELECT applied_at FROM _migrations LIMIT 1", [], |row| {
                row.get(0)
            })
            .unwrap();
        assert!(chrono::DateTime::parse_from_rfc3339(&applied_at).is_ok());
    }
}
