use std::collections::BTreeMap;

use anyhow::Result;
use rusqlite::types::ToSql;
use rusqlite::{Connection, params};

use murmur_types::ids::{EventId, EventRowId, RoomId};
use murmur_types::models::{EVENT_TYPE_REACTION, Event, REL_TYPE_ANNOTATION, REL_TYPE_REPLACE};

use super::{OptionalExt, placeholders};
use crate::models::{EVENT_COLUMNS, event_from_row, json_to_sql, opt_json_to_sql};

/// Insert an event, or merge local decorations into an existing row with the
/// same event ID. Server content is never overwritten. Sets `evt.rowid` and
/// `evt.last_edit_rowid` from the stored row.
pub fn upsert(conn: &Connection, evt: &mut Event) -> Result<EventRowId> {
    let (rowid, last_edit): (i64, Option<i64>) = conn.query_row(
        "INSERT INTO events (room_id, event_id, sender, type, state_key, timestamp, content,
                             decrypted, decrypted_type, unsigned, redacted_by, relates_to,
                             relation_type, megolm_session_id, decryption_error, unread_type)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)
         ON CONFLICT (event_id) DO UPDATE SET
            decrypted = COALESCE(excluded.decrypted, events.decrypted),
            decrypted_type = COALESCE(excluded.decrypted_type, events.decrypted_type),
            decryption_error = CASE
                WHEN COALESCE(excluded.decrypted, events.decrypted) IS NULL THEN excluded.decryption_error
                ELSE NULL
            END,
            unsigned = COALESCE(excluded.unsigned, events.unsigned),
            redacted_by = COALESCE(excluded.redacted_by, events.redacted_by)
         RETURNING rowid, last_edit_rowid",
        params![
            evt.room_id.as_str(),
            evt.event_id.as_str(),
            evt.sender.as_str(),
            evt.event_type,
            evt.state_key,
            evt.timestamp.timestamp_millis(),
            json_to_sql(&evt.content),
            opt_json_to_sql(evt.decrypted.as_ref()),
            evt.decrypted_type,
            opt_json_to_sql(evt.unsigned.as_ref()),
            evt.redacted_by.as_ref().map(EventId::as_str),
            evt.relates_to.as_ref().map(EventId::as_str),
            evt.relation_type,
            evt.megolm_session_id.as_ref().map(|s| s.as_str()),
            evt.decryption_error,
            evt.unread_type.0,
        ],
        |row| Ok((row.get(0)?, row.get(1)?)),
    )?;
    evt.rowid = EventRowId(rowid);
    evt.last_edit_rowid = last_edit.map(EventRowId);
    Ok(evt.rowid)
}

pub fn get_by_id(conn: &Connection, event_id: &EventId) -> Result<Option<Event>> {
    let sql = format!(
        "SELECT {} FROM events e LEFT JOIN timeline t ON t.event_rowid = e.rowid WHERE e.event_id = ?1",
        EVENT_COLUMNS
    );
    conn.query_row(&sql, [event_id.as_str()], event_from_row).optional()
}

pub fn get_by_rowid(conn: &Connection, rowid: EventRowId) -> Result<Option<Event>> {
    let sql = format!(
        "SELECT {} FROM events e LEFT JOIN timeline t ON t.event_rowid = e.rowid WHERE e.rowid = ?1",
        EVENT_COLUMNS
    );
    conn.query_row(&sql, [rowid.0], event_from_row).optional()
}

/// Point `target` at `edit` when the edit comes from the target's sender and
/// is not older than the edit already recorded. Returns whether it moved.
pub fn set_last_edit(conn: &Connection, target: &EventId, edit: &Event) -> Result<bool> {
    let changed = conn.execute(
        "UPDATE events SET last_edit_rowid = ?2
         WHERE event_id = ?1 AND sender = ?3
           AND (last_edit_rowid IS NULL
                OR (SELECT prev.timestamp FROM events prev WHERE prev.rowid = events.last_edit_rowid) <= ?4)",
        params![
            target.as_str(),
            edit.rowid.0,
            edit.sender.as_str(),
            edit.timestamp.timestamp_millis()
        ],
    )?;
    Ok(changed > 0)
}

pub fn set_redacted_by(conn: &Connection, target: &EventId, redaction: &EventId) -> Result<()> {
    conn.execute(
        "UPDATE events SET redacted_by = ?2 WHERE event_id = ?1 AND redacted_by IS NULL",
        params![target.as_str(), redaction.as_str()],
    )?;
    Ok(())
}

/// Aggregate stored reactions onto `events`, keyed by annotation key.
pub fn fill_reaction_counts(conn: &Connection, room_id: &RoomId, events: &mut [Event]) -> Result<()> {
    if events.is_empty() {
        return Ok(());
    }
    let sql = format!(
        "SELECT relates_to, json_extract(content, '$.\"m.relates_to\".key') AS reaction_key, COUNT(*)
         FROM events
         WHERE room_id = ?1 AND type = ?2 AND relation_type = ?3 AND redacted_by IS NULL
           AND relates_to IN ({})
         GROUP BY relates_to, reaction_key",
        placeholders(4, events.len())
    );
    let room = room_id.as_str();
    let ids: Vec<&str> = events.iter().map(|e| e.event_id.as_str()).collect();
    let mut args: Vec<&dyn ToSql> = Vec::with_capacity(ids.len() + 3);
    args.push(&room);
    args.push(&EVENT_TYPE_REACTION);
    args.push(&REL_TYPE_ANNOTATION);
    args.extend(ids.iter().map(|id| id as &dyn ToSql));

    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(args.as_slice(), |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, Option<String>>(1)?,
                row.get::<_, u32>(2)?,
            ))
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    for (target, key, count) in rows {
        let Some(key) = key else { continue };
        if let Some(evt) = events.iter_mut().find(|e| e.event_id.as_str() == target) {
            evt.reactions.get_or_insert_with(BTreeMap::new).insert(key, count);
        }
    }
    Ok(())
}

/// Set `last_edit_rowid` on `events` from stored edits by the original sender.
pub fn fill_last_edit_rowids(conn: &Connection, room_id: &RoomId, events: &mut [Event]) -> Result<()> {
    if events.is_empty() {
        return Ok(());
    }
    let sql = format!(
        "SELECT relates_to, sender, rowid
         FROM events
         WHERE room_id = ?1 AND relation_type = ?2 AND redacted_by IS NULL
           AND relates_to IN ({})
         ORDER BY timestamp, rowid",
        placeholders(3, events.len())
    );
    let room = room_id.as_str();
    let ids: Vec<&str> = events.iter().map(|e| e.event_id.as_str()).collect();
    let mut args: Vec<&dyn ToSql> = Vec::with_capacity(ids.len() + 2);
    args.push(&room);
    args.push(&REL_TYPE_REPLACE);
    args.extend(ids.iter().map(|id| id as &dyn ToSql));

    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(args.as_slice(), |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?, row.get::<_, i64>(2)?))
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    for (target, sender, rowid) in rows {
        if let Some(evt) = events
            .iter_mut()
            .find(|e| e.event_id.as_str() == target && e.sender.as_str() == sender)
        {
            evt.last_edit_rowid = Some(EventRowId(rowid));
        }
    }
    Ok(())
}
