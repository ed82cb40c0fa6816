//! SQLite implementation of [`KeyValueClient`].
//!
//! [`SqliteKeyValueStore`] keeps every entry in one `kv_entries` table.
//! Each write runs in its own transaction, so `compare_and_set` is atomic
//! with respect to every other call on the same database.

use std::sync::{Mutex, PoisonError};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use rusqlite::{params, Connection, OptionalExtension, Transaction};

use gridstore_core::GridError;

use crate::client::{KeyValueClient, Version, Versioned};
use crate::schema::sqlite_error;

/// SQLite-backed implementation of [`KeyValueClient`].
pub struct SqliteKeyValueStore {
    conn: Mutex<Connection>,
}

fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

fn expires_at(ttl: Option<Duration>) -> Option<i64> {
    ttl.map(|ttl| now_millis().saturating_add(ttl.as_millis() as i64))
}

/// Version of the live entry at `key`, if any.
fn live_version(tx: &Transaction<'_>, key: &str, now: i64) -> rusqlite::Result<Option<Version>> {
    tx.query_row(
        "SELECT version FROM kv_entries WHERE key = ?1 AND (expires_at IS NULL OR expires_at > ?2)",
        params![key, now],
        |row| row.get::<_, i64>(0),
    )
    .optional()
    .map(|version| version.map(|v| v as Version))
}

fn next_version(tx: &Transaction<'_>) -> rusqlite::Result<Version> {
    tx.query_row(
        "UPDATE kv_versions SET last_version = last_version + 1 WHERE id = 1 RETURNING last_version",
        [],
        |row| row.get::<_, i64>(0),
    )
    .map(|v| v as Version)
}

fn upsert(tx: &Transaction<'_>, key: &str, value: &str, ttl: Option<Duration>) -> rusqlite::Result<Version> {
    let version = next_version(tx)?;
    tx.execute(
        "INSERT INTO kv_entries (key, value, version, expires_at) VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT(key) DO UPDATE SET
             value = excluded.value,
             version = excluded.version,
             expires_at = excluded.expires_at",
        params![key, value, version as i64, expires_at(ttl)],
    )?;
    Ok(version)
}

impl SqliteKeyValueStore {
    /// Opens (or creates) a SQLite database at `path`.
    pub fn new(path: &str) -> Result<Self, GridError> {
        let conn = crate::schema::open_database(path)?;
        Ok(SqliteKeyValueStore { conn: Mutex::new(conn) })
    }

    /// Opens an in-memory SQLite database (for testing).
    pub fn in_memory() -> Result<Self, GridError> {
        let conn = crate::schema::open_in_memory()?;
        Ok(SqliteKeyValueStore { conn: Mutex::new(conn) })
    }

    /// Runs `f` in a transaction that commits when it returns `Ok`.
    fn transaction<T>(&self, f: impl FnOnce(&Transaction<'_>) -> rusqlite::Result<T>) -> Result<T, GridError> {
        let mut conn = self.conn.lock().unwrap_or_else(PoisonError::into_inner);
        let tx = conn.transaction().map_err(sqlite_error)?;
        let result = f(&tx).map_err(sqlite_error)?;
        tx.commit().map_err(sqlite_error)?;
        Ok(result)
    }

    /// Deletes expired rows, returning how many were removed.
    pub fn purge_expired(&self) -> Result<usize, GridError> {
        let now = now_millis();
        self.transaction(|tx| {
            tx.execute(
                "DELETE FROM kv_entries WHERE expires_at IS NOT NULL AND expires_at <= ?1",
                params![now],
            )
        })
    }

    /// Number of live entries.
    pub fn len(&self) -> Result<usize, GridError> {
        let now = now_millis();
        self.transaction(|tx| {
            tx.query_row(
                "SELECT COUNT(*) FROM kv_entries WHERE expires_at IS NULL OR expires_at > ?1",
                params![now],
                |row| row.get::<_, i64>(0),
            )
        })
        .map(|n| n as usize)
    }

    pub fn is_empty(&self) -> Result<bool, GridError> {
        Ok(self.len()? == 0)
    }
}

impl KeyValueClient for SqliteKeyValueStore {
    fn get(&self, key: &str) -> Result<Option<Versioned>, GridError> {
        let now = now_millis();
        let conn = self.conn.lock().unwrap_or_else(PoisonError::into_inner);
        conn.query_row(
            "SELECT value, version FROM kv_entries WHERE key = ?1 AND (expires_at IS NULL OR expires_at > ?2)",
            params![key, now],
            |row| {
                Ok(Versioned {
                    value: row.get(0)?,
                    version: row.get::<_, i64>(1)? as Version,
                })
            },
        )
        .optional()
        .map_err(sqlite_error)
    }

    fn put(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<Version, GridError> {
        self.transaction(|tx| upsert(tx, key, value, ttl))
    }

    fn compare_and_set(
        &self,
        key: &str,
        expected: Option<Version>,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<bool, GridError> {
        let now = now_millis();
        self.transaction(|tx| {
            if live_version(tx, key, now)? != expected {
                return Ok(false);
            }
            upsert(tx, key, value, ttl)?;
            Ok(true)
        })
    }

    fn delete(&self, key: &str) -> Result<bool, GridError> {
        let now = now_millis();
        self.transaction(|tx| {
            let live = live_version(tx, key, now)?.is_some();
            tx.execute("DELETE FROM kv_entries WHERE key = ?1", params![key])?;
            Ok(live)
        })
    }
}
