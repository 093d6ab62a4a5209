//! Row mapping between SQLite and the shared models.

use chrono::{DateTime, Utc};
use rusqlite::Row;
use serde_json::Value;

use murmur_types::ids::{EventId, EventRowId, RoomId, SessionId, TimelineRowId, UserId};
use murmur_types::models::{Event, LazyLoadSummary, PrevBatch, Room, UnreadType};

pub(crate) const ROOM_COLUMNS: &str = "room_id, name, avatar, topic, canonical_alias, lazy_load_summary, \
     encryption_algorithm, has_member_list, preview_event_rowid, sorting_timestamp, \
     unread_highlights, unread_notifications, unread_messages, prev_batch";

/// Event columns prefixed with `e.`, plus the timeline row as the second column.
pub(crate) const EVENT_COLUMNS: &str = "e.rowid, t.rowid, e.room_id, e.event_id, e.sender, e.type, e.state_key, \
     e.timestamp, e.content, e.decrypted, e.decrypted_type, e.unsigned, e.redacted_by, \
     e.relates_to, e.relation_type, e.megolm_session_id, e.decryption_error, \
     e.last_edit_rowid, e.unread_type";

pub(crate) fn millis_to_datetime(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

/// JSON columns are stored as text written by `serde_json::to_string`.
pub(crate) fn json_to_sql(value: &Value) -> String {
    value.to_string()
}

pub(crate) fn opt_json_to_sql(value: Option<&Value>) -> Option<String> {
    value.map(json_to_sql)
}

fn json_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<Value>> {
    let Some(raw) = row.get::<_, Option<String>>(idx)? else {
        return Ok(None);
    };
    serde_json::from_str(&raw).map(Some).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    })
}

pub(crate) fn room_from_row(row: &Row<'_>) -> rusqlite::Result<Room> {
    let summary = json_column(row, 5)?;
    Ok(Room {
        room_id: RoomId::from(row.get::<_, String>(0)?),
        name: row.get(1)?,
        avatar: row.get(2)?,
        topic: row.get(3)?,
        canonical_alias: row.get(4)?,
        // A summary we can't read is treated as unknown rather than failing the room.
        lazy_load_summary: summary.and_then(|v| serde_json::from_value::<LazyLoadSummary>(v).ok()),
        encryption_algorithm: row.get(6)?,
        has_member_list: row.get(7)?,
        preview_event_rowid: row.get::<_, Option<i64>>(8)?.map(EventRowId),
        sorting_timestamp: millis_to_datetime(row.get(9)?),
        unread_highlights: row.get(10)?,
        unread_notifications: row.get(11)?,
        unread_messages: row.get(12)?,
        prev_batch: PrevBatch::from_token(row.get(13)?),
    })
}

pub(crate) fn event_from_row(row: &Row<'_>) -> rusqlite::Result<Event> {
    Ok(Event {
        rowid: EventRowId(row.get(0)?),
        timeline_rowid: row.get::<_, Option<i64>>(1)?.map(TimelineRowId),
        room_id: RoomId::from(row.get::<_, String>(2)?),
        event_id: EventId::from(row.get::<_, String>(3)?),
        sender: UserId::from(row.get::<_, String>(4)?),
        event_type: row.get(5)?,
        state_key: row.get(6)?,
        timestamp: millis_to_datetime(row.get(7)?),
        content: json_column(row, 8)?.unwrap_or(Value::Null),
        decrypted: json_column(row, 9)?,
        decrypted_type: row.get(10)?,
        unsigned: json_column(row, 11)?,
        redacted_by: row.get::<_, Option<String>>(12)?.map(EventId::from),
        relates_to: row.get::<_, Option<String>>(13)?.map(EventId::from),
        relation_type: row.get(14)?,
        megolm_session_id: row.get::<_, Option<String>>(15)?.map(SessionId::from),
        decryption_error: row.get(16)?,
        reactions: None,
        last_edit_rowid: row.get::<_, Option<i64>>(17)?.map(EventRowId),
        unread_type: UnreadType(row.get(18)?),
    })
}
