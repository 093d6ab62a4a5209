use anyhow::Result;
use rusqlite::{Connection, params};

use murmur_types::ids::{EventRowId, RoomId, TimelineRowId};
use murmur_types::models::{Event, TimelineRowTuple};

use super::sql_limit;
use crate::models::{EVENT_COLUMNS, event_from_row};

/// Up to `limit` timeline events of `room_id` strictly below `before`,
/// newest first.
pub fn get(conn: &Connection, room_id: &RoomId, before: TimelineRowId, limit: usize) -> Result<Vec<Event>> {
    let sql = format!(
        "SELECT {} FROM timeline t JOIN events e ON e.rowid = t.event_rowid
         WHERE t.room_id = ?1 AND t.rowid < ?2
         ORDER BY t.rowid DESC
         LIMIT ?3",
        EVENT_COLUMNS
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(params![room_id.as_str(), before.0, sql_limit(limit)], event_from_row)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn has(conn: &Connection, room_id: &RoomId, event_rowid: EventRowId) -> Result<bool> {
    let found: i64 = conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM timeline WHERE room_id = ?1 AND event_rowid = ?2)",
        params![room_id.as_str(), event_rowid.0],
        |r| r.get(0),
    )?;
    Ok(found != 0)
}

/// Insert older history before everything already stored. `event_rowids` is
/// newest first; the first entry gets the largest of the new positions.
/// Events already in the room's timeline are skipped.
pub fn prepend(conn: &Connection, room_id: &RoomId, event_rowids: &[EventRowId]) -> Result<Vec<TimelineRowTuple>> {
    let lowest: i64 = conn.query_row("SELECT COALESCE(MIN(rowid), 0) FROM timeline", [], |r| r.get(0))?;
    let positions = (1..).map(|i| lowest - i);
    insert_at(conn, room_id, event_rowids, positions)
}

/// Insert live events after everything already stored. `event_rowids` is
/// oldest first.
pub fn append(conn: &Connection, room_id: &RoomId, event_rowids: &[EventRowId]) -> Result<Vec<TimelineRowTuple>> {
    let highest: i64 = conn.query_row("SELECT COALESCE(MAX(rowid), 0) FROM timeline", [], |r| r.get(0))?;
    let positions = (1..).map(|i| highest + i);
    insert_at(conn, room_id, event_rowids, positions)
}

fn insert_at(
    conn: &Connection,
    room_id: &RoomId,
    event_rowids: &[EventRowId],
    positions: impl Iterator<Item = i64>,
) -> Result<Vec<TimelineRowTuple>> {
    let mut stmt = conn.prepare_cached(
        "INSERT INTO timeline (rowid, room_id, event_rowid) VALUES (?1, ?2, ?3)
         ON CONFLICT (room_id, event_rowid) DO NOTHING",
    )?;
    let mut inserted = Vec::with_capacity(event_rowids.len());
    for (event_rowid, position) in event_rowids.iter().zip(positions) {
        if stmt.execute(params![position, room_id.as_str(), event_rowid.0])? > 0 {
            inserted.push(TimelineRowTuple {
                timeline_rowid: TimelineRowId(position),
                event_rowid: *event_rowid,
            });
        }
    }
    Ok(inserted)
}

/// Drop the stored timeline of a room, leaving its events in place.
pub fn clear(conn: &Connection, room_id: &RoomId) -> Result<usize> {
    Ok(conn.execute("DELETE FROM timeline WHERE room_id = ?1", [room_id.as_str()])?)
}
