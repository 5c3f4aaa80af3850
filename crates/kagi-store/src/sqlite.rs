//! SQLite KV backend.
//!
//! One `kv` table, WAL mode, and SQL savepoints for the crank transaction
//! discipline. The connection is owned exclusively by the kernel task, so no
//! pooling or locking is needed here.

use std::path::Path;

use rusqlite::{Connection, OptionalExtension, params};
use tracing::debug;

use crate::kv::{KVError, KVStore};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS kv (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
) WITHOUT ROWID;
"#;

/// rusqlite-backed [`KVStore`].
pub struct SqliteKVStore {
    conn: Connection,
}

impl SqliteKVStore {
    /// Open (or create) a database file.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, KVError> {
        let conn = Connection::open(path.as_ref())?;
        Self::init(conn)
    }

    /// A private in-memory database; used by ephemeral kernels.
    pub fn open_in_memory() -> Result<Self, KVError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, KVError> {
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.execute_batch(SCHEMA)?;
        debug!("kv store ready");
        Ok(Self { conn })
    }

    /// Savepoint labels become SQL identifiers; keep them boring.
    fn quote_label(label: &str) -> String {
        format!("\"sp_{}\"", label.replace('"', ""))
    }
}

impl KVStore for SqliteKVStore {
    fn get(&self, key: &str) -> Result<Option<String>, KVError> {
        let value = self
            .conn
            .query_row("SELECT value FROM kv WHERE key = ?1", params![key], |row| {
                row.get::<_, String>(0)
            })
            .optional()?;
        Ok(value)
    }

    fn set(&mut self, key: &str, value: &str) -> Result<(), KVError> {
        self.conn.execute(
            "INSERT INTO kv (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![key, value],
        )?;
        Ok(())
    }

    fn delete(&mut self, key: &str) -> Result<(), KVError> {
        self.conn
            .execute("DELETE FROM kv WHERE key = ?1", params![key])?;
        Ok(())
    }

    fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, KVError> {
        // range scan on the primary key; '\u{10FFFF}' is past any key byte
        let mut stmt = self
            .conn
            .prepare_cached("SELECT key FROM kv WHERE key >= ?1 AND key < ?2 ORDER BY key")?;
        let upper = format!("{}\u{10FFFF}", prefix);
        let keys = stmt
            .query_map(params![prefix, upper], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(keys)
    }

    fn create_savepoint(&mut self, label: &str) -> Result<(), KVError> {
        self.conn
            .execute_batch(&format!("SAVEPOINT {}", Self::quote_label(label)))?;
        Ok(())
    }

    fn rollback_to_savepoint(&mut self, label: &str) -> Result<(), KVError> {
        self.conn
            .execute_batch(&format!("ROLLBACK TO {}", Self::quote_label(label)))?;
        Ok(())
    }

    fn release_savepoint(&mut self, label: &str) -> Result<(), KVError> {
        self.conn
            .execute_batch(&format!("RELEASE {}", Self::quote_label(label)))?;
        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::contract;

    #[test]
    fn test_basic_ops() {
        contract::basic_ops(&mut SqliteKVStore::open_in_memory().unwrap());
    }

    #[test]
    fn test_prefix_iteration() {
        contract::prefix_iteration(&mut SqliteKVStore::open_in_memory().unwrap());
    }

    #[test]
    fn test_savepoint_rollback() {
        contract::savepoint_rollback(&mut SqliteKVStore::open_in_memory().unwrap());
    }

    #[test]
    fn test_nested_savepoints() {
        contract::nested_savepoints(&mut SqliteKVStore::open_in_memory().unwrap());
    }

    #[test]
    fn test_rollback_unknown_label_fails() {
        contract::rollback_unknown_label_fails(&mut SqliteKVStore::open_in_memory().unwrap());
    }

    #[test]
    fn test_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kernel.db");
        {
            let mut kv = SqliteKVStore::open(&path).unwrap();
            kv.set("nextVatId", "4").unwrap();
        }
        let kv = SqliteKVStore::open(&path).unwrap();
        assert_eq!(kv.get("nextVatId").unwrap().as_deref(), Some("4"));
    }
}
