use anyhow::Result;
use rusqlite::Connection;

use super::OptionalExt;

/// `next_batch` of the last fully applied sync response.
pub fn get(conn: &Connection) -> Result<Option<String>> {
    conn.query_row("SELECT next_batch FROM sync_token WHERE id = 0", [], |r| r.get(0))
        .optional()
}

pub fn set(conn: &Connection, next_batch: &str) -> Result<()> {
    conn.execute(
        "INSERT INTO sync_token (id, next_batch) VALUES (0, ?1)
         ON CONFLICT (id) DO UPDATE SET next_batch = excluded.next_batch",
        [next_batch],
    )?;
    Ok(())
}
