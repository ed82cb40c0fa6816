//! SQL schema and migration setup for the SQLite backend.
//!
//! Uses `rusqlite_migration` to manage schema migrations via SQLite's
//! `user_version` pragma. Migrations are embedded at compile time via
//! `include_str!`.

use rusqlite::Connection;
use rusqlite_migration::{Migrations, M};

use gridstore_core::GridError;

/// All schema migrations, applied in order via `user_version` tracking.
fn migrations() -> Migrations<'static> {
    Migrations::new(vec![M::up(include_str!("migrations/001_initial_schema.sql"))])
}

/// Maps a SQLite failure into the backend error bucket.
pub(crate) fn sqlite_error(err: rusqlite::Error) -> GridError {
    GridError::Backend(format!("sqlite: {err}"))
}

/// Opens (or creates) a SQLite database at `path` with WAL mode and all
/// pending migrations applied.
pub fn open_database(path: &str) -> Result<Connection, GridError> {
    let mut conn = Connection::open(path).map_err(sqlite_error)?;
    configure_and_migrate(&mut conn)?;
    Ok(conn)
}

/// Opens an in-memory SQLite database with all pending migrations applied.
pub fn open_in_memory() -> Result<Connection, GridError> {
    let mut conn = Connection::open_in_memory().map_err(sqlite_error)?;
    configure_and_migrate(&mut conn)?;
    Ok(conn)
}

fn configure_and_migrate(conn: &mut Connection) -> Result<(), GridError> {
    // WAL gives concurrent readers alongside the single writer.
    conn.pragma_update(None, "journal_mode", "WAL").map_err(sqlite_error)?;
    conn.pragma_update(None, "synchronous", "NORMAL").map_err(sqlite_error)?;

    migrations()
        .to_latest(conn)
        .map_err(|e| GridError::Backend(format!("migration failed: {e}")))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn migrations_are_valid() {
        assert!(migrations().validate().is_ok());
    }

    #[test]
    fn in_memory_database_has_version_row() {
        let conn = open_in_memory().unwrap();
        let last: i64 = conn
            .query_row("SELECT last_version FROM kv_versions WHERE id = 1", [], |row| row.get(0))
            .unwrap();
        assert_eq!(last, 0);
    }
}
