//! SQLite persistence for the quill session engine: the connection handle,
//! forward-only migrations, per-entity repositories, and the one-shot
//! legacy-JSON import.

pub mod database;
pub mod diffs;
pub mod error;
pub mod import;
pub mod messages;
pub mod migrate;
pub mod parts;
pub mod permissions;
pub mod projects;
mod row_helpers;
pub mod schema;
pub mod sessions;
pub mod shares;
pub mod todos;

pub use database::Database;
pub use error::StoreError;

/// File name of the SQLite database inside the data directory.
pub const DB_FILE: &str = "quill.db";
