use anyhow::Result;
use rusqlite::Connection;
use tracing::info;

pub fn run(conn: &Connection) -> Result<()> {
    conn.execute_batch("CREATE TABLE IF NOT EXISTS schema_version (version INTEGER NOT NULL);")?;

    let version: i64 = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_version",
        [],
        |r| r.get(0),
    )?;

    if version < 1 {
        info!("Running migration v1 (initial schema)");
        conn.execute_batch(
            "
            CREATE TABLE rooms (
                room_id               TEXT PRIMARY KEY,
                name                  TEXT,
                avatar                TEXT,
                topic                 TEXT,
                canonical_alias       TEXT,
                lazy_load_summary     TEXT,
                encryption_algorithm  TEXT,
                has_member_list       INTEGER NOT NULL DEFAULT 0,
                preview_event_rowid   INTEGER,
                sorting_timestamp     INTEGER NOT NULL DEFAULT 0,
                unread_highlights     INTEGER NOT NULL DEFAULT 0,
                unread_notifications  INTEGER NOT NULL DEFAULT 0,
                unread_messages       INTEGER NOT NULL DEFAULT 0,
                prev_batch            TEXT
            );

            CREATE INDEX idx_rooms_sorting
                ON rooms(sorting_timestamp, room_id);

            CREATE TABLE events (
                rowid              INTEGER PRIMARY KEY AUTOINCREMENT,
                room_id            TEXT NOT NULL,
                event_id           TEXT NOT NULL UNIQUE,
                sender             TEXT NOT NULL,
                type               TEXT NOT NULL,
                state_key          TEXT,
                timestamp          INTEGER NOT NULL,
                content            TEXT NOT NULL,
                decrypted          TEXT,
                decrypted_type     TEXT,
                unsigned           TEXT,
                redacted_by        TEXT,
                relates_to         TEXT,
                relation_type      TEXT,
                megolm_session_id  TEXT,
                decryption_error   TEXT,
                last_edit_rowid    INTEGER,
                unread_type        INTEGER NOT NULL DEFAULT 0
            );

            CREATE INDEX idx_events_relations
                ON events(room_id, relates_to, relation_type);
            CREATE INDEX idx_events_session
                ON events(megolm_session_id);

            CREATE TABLE timeline (
                rowid        INTEGER PRIMARY KEY,
                room_id      TEXT NOT NULL REFERENCES rooms(room_id) ON DELETE CASCADE,
                event_rowid  INTEGER NOT NULL REFERENCES events(rowid) ON DELETE CASCADE,
                UNIQUE(room_id, event_rowid)
            );

            CREATE INDEX idx_timeline_room
                ON timeline(room_id, rowid);

            CREATE TABLE current_state (
                room_id      TEXT NOT NULL REFERENCES rooms(room_id) ON DELETE CASCADE,
                event_type   TEXT NOT NULL,
                state_key    TEXT NOT NULL,
                event_rowid  INTEGER NOT NULL REFERENCES events(rowid),
                membership   TEXT,
                PRIMARY KEY (room_id, event_type, state_key)
            );

            CREATE TABLE media (
                uri         TEXT PRIMARY KEY,
                created_at  TEXT NOT NULL DEFAULT (datetime('now'))
            );

            CREATE TABLE media_reference (
                event_rowid  INTEGER NOT NULL REFERENCES events(rowid) ON DELETE CASCADE,
                media_uri    TEXT NOT NULL REFERENCES media(uri),
                PRIMARY KEY (event_rowid, media_uri)
            );

            CREATE TABLE session_request (
                session_id  TEXT PRIMARY KEY,
                room_id     TEXT NOT NULL,
                sender      TEXT NOT NULL,
                min_index   INTEGER NOT NULL,
                created_at  TEXT NOT NULL DEFAULT (datetime('now'))
            );

            CREATE TABLE sync_token (
                id          INTEGER PRIMARY KEY CHECK (id = 0),
                next_batch  TEXT NOT NULL
            );

            INSERT INTO schema_version (version) VALUES (1);
            ",
        )?;
    }

    info!("Database migrations complete");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn migrations_are_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        run(&conn).unwrap();
        run(&conn).unwrap();
        let version: i64 = conn
            .query_row("SELECT MAX(version) FROM schema_version", [], |r| r.get(0))
            .unwrap();
        assert_eq!(version, 1);
    }
}
