pub mod migrations;
pub mod models;
pub mod queries;

use anyhow::Result;
pub use rusqlite::{Connection, Transaction};
use std::path::Path;
use std::sync::Mutex;
use tracing::info;

/// Local event store. One connection, serialized behind a mutex; callers on
/// the async runtime go through `spawn_blocking`.
pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;

        // WAL mode for concurrent readers in other processes
        conn.pragma_update(None, "journal_mode", "WAL")?;
        Self::init(conn, &path.display().to_string())
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?, ":memory:")
    }

    fn init(conn: Connection, label: &str) -> Result<Self> {
        conn.pragma_update(None, "foreign_keys", "ON")?;
        migrations::run(&conn)?;

        info!("Database opened at {}", label);
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn with_conn<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T>,
    {
        let conn = self.conn.lock().map_err(|e| anyhow::anyhow!("DB lock poisoned: {}", e))?;
        f(&conn)
    }

    /// Run `f` inside a transaction. Any error rolls back every write `f` made.
    pub fn transaction<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Transaction<'_>) -> Result<T>,
    {
        let mut conn = self.conn.lock().map_err(|e| anyhow::anyhow!("DB lock poisoned: {}", e))?;
        let txn = conn.transaction()?;
        let value = f(&txn)?;
        txn.commit()?;
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use murmur_types::models::{PrevBatch, Room};

    #[test]
    fn failed_transaction_rolls_back() {
        let db = Database::open_in_memory().unwrap();
        let result: Result<()> = db.transaction(|txn| {
            queries::rooms::upsert(txn, &Room::new("!a:x".into()))?;
            anyhow::bail!("boom")
        });
        assert!(result.is_err());
        let room = db.with_conn(|c| queries::rooms::get(c, &"!a:x".into())).unwrap();
        assert!(room.is_none());
    }

    #[test]
    fn reopen_keeps_data() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("murmur.db");
        {
            let db = Database::open(&path).unwrap();
            let mut room = Room::new("!a:x".into());
            room.prev_batch = PrevBatch::Token("t0".into());
            db.transaction(|txn| queries::rooms::upsert(txn, &room)).unwrap();
        }
        let db = Database::open(&path).unwrap();
        let room = db
            .with_conn(|c| queries::rooms::get(c, &"!a:x".into()))
            .unwrap()
            .unwrap();
        assert_eq!(room.prev_batch, PrevBatch::Token("t0".into()));
    }
}
