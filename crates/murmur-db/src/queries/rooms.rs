use anyhow::Result;
use chrono::{DateTime, Utc};
use rusqlite::types::Value as SqlValue;
use rusqlite::{Connection, params, params_from_iter};

use murmur_types::ids::RoomId;
use murmur_types::models::{PrevBatch, Room};

use super::{OptionalExt, sql_limit};
use crate::models::{ROOM_COLUMNS, room_from_row};

pub fn get(conn: &Connection, room_id: &RoomId) -> Result<Option<Room>> {
    let sql = format!("SELECT {} FROM rooms WHERE room_id = ?1", ROOM_COLUMNS);
    conn.query_row(&sql, [room_id.as_str()], room_from_row).optional()
}

/// Fetch a room, creating an empty row on first sighting.
pub fn get_or_create(conn: &Connection, room_id: &RoomId) -> Result<Room> {
    conn.execute(
        "INSERT INTO rooms (room_id) VALUES (?1) ON CONFLICT (room_id) DO NOTHING",
        [room_id.as_str()],
    )?;
    let sql = format!("SELECT {} FROM rooms WHERE room_id = ?1", ROOM_COLUMNS);
    Ok(conn.query_row(&sql, [room_id.as_str()], room_from_row)?)
}

pub fn upsert(conn: &Connection, room: &Room) -> Result<()> {
    let summary = room
        .lazy_load_summary
        .as_ref()
        .map(serde_json::to_string)
        .transpose()?;
    conn.execute(
        "INSERT INTO rooms (room_id, name, avatar, topic, canonical_alias, lazy_load_summary,
                            encryption_algorithm, has_member_list, preview_event_rowid,
                            sorting_timestamp, unread_highlights, unread_notifications,
                            unread_messages, prev_batch)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)
         ON CONFLICT (room_id) DO UPDATE SET
            name = excluded.name,
            avatar = excluded.avatar,
            topic = excluded.topic,
            canonical_alias = excluded.canonical_alias,
            lazy_load_summary = excluded.lazy_load_summary,
            encryption_algorithm = excluded.encryption_algorithm,
            has_member_list = excluded.has_member_list,
            preview_event_rowid = excluded.preview_event_rowid,
            sorting_timestamp = excluded.sorting_timestamp,
            unread_highlights = excluded.unread_highlights,
            unread_notifications = excluded.unread_notifications,
            unread_messages = excluded.unread_messages,
            prev_batch = excluded.prev_batch",
        params![
            room.room_id.as_str(),
            room.name,
            room.avatar,
            room.topic,
            room.canonical_alias,
            summary,
            room.encryption_algorithm,
            room.has_member_list,
            room.preview_event_rowid.map(|r| r.0),
            room.sorting_timestamp.timestamp_millis(),
            room.unread_highlights,
            room.unread_notifications,
            room.unread_messages,
            room.prev_batch.as_token(),
        ],
    )?;
    Ok(())
}

pub fn set_prev_batch(conn: &Connection, room_id: &RoomId, prev_batch: &PrevBatch) -> Result<()> {
    conn.execute(
        "UPDATE rooms SET prev_batch = ?2 WHERE room_id = ?1",
        params![room_id.as_str(), prev_batch.as_token()],
    )?;
    Ok(())
}

pub fn delete(conn: &Connection, room_id: &RoomId) -> Result<()> {
    conn.execute("DELETE FROM rooms WHERE room_id = ?1", [room_id.as_str()])?;
    Ok(())
}

/// All rooms in first-sighting order.
pub fn get_all(conn: &Connection) -> Result<Vec<Room>> {
    let sql = format!("SELECT {} FROM rooms ORDER BY rowid", ROOM_COLUMNS);
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map([], room_from_row)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Keyset cursor for walking rooms by descending activity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SortCursor {
    pub sorting_timestamp: DateTime<Utc>,
    pub room_id: RoomId,
}

impl SortCursor {
    pub fn after(room: &Room) -> Self {
        Self {
            sorting_timestamp: room.sorting_timestamp,
            room_id: room.room_id.clone(),
        }
    }
}

/// Up to `limit` rooms strictly older than `before`, newest first.
///
/// Rooms sharing a timestamp are ordered by ID so no room is skipped or
/// repeated at a batch boundary.
pub fn get_by_sort_ts(conn: &Connection, before: Option<&SortCursor>, limit: usize) -> Result<Vec<Room>> {
    let mut args: Vec<SqlValue> = Vec::with_capacity(3);
    let filter = match before {
        Some(cursor) => {
            args.push(SqlValue::Integer(cursor.sorting_timestamp.timestamp_millis()));
            args.push(SqlValue::Text(cursor.room_id.to_string()));
            "WHERE (sorting_timestamp, room_id) < (?1, ?2)"
        }
        None => "",
    };
    args.push(SqlValue::Integer(sql_limit(limit)));
    let sql = format!(
        "SELECT {} FROM rooms {} ORDER BY sorting_timestamp DESC, room_id DESC LIMIT ?{}",
        ROOM_COLUMNS,
        filter,
        args.len()
    );

    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(params_from_iter(args), room_from_row)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}
