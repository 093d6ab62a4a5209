use anyhow::Result;
use rusqlite::{Connection, params};

use murmur_types::ids::{RoomId, UserId};
use murmur_types::models::{CurrentStateEntry, EVENT_TYPE_MEMBER, Event};

use super::OptionalExt;
use crate::models::{EVENT_COLUMNS, event_from_row};

/// Write current-state rows. With `replace`, the room's previous state is
/// dropped first so entries missing from `entries` disappear.
pub fn add_many(conn: &Connection, room_id: &RoomId, replace: bool, entries: &[CurrentStateEntry]) -> Result<()> {
    if replace {
        conn.execute("DELETE FROM current_state WHERE room_id = ?1", [room_id.as_str()])?;
    }
    let mut stmt = conn.prepare_cached(
        "INSERT INTO current_state (room_id, event_type, state_key, event_rowid, membership)
         VALUES (?1, ?2, ?3, ?4, ?5)
         ON CONFLICT (room_id, event_type, state_key) DO UPDATE SET
            event_rowid = excluded.event_rowid,
            membership = excluded.membership",
    )?;
    for entry in entries {
        stmt.execute(params![
            room_id.as_str(),
            entry.event_type,
            entry.state_key,
            entry.event_rowid.0,
            entry.membership,
        ])?;
    }
    Ok(())
}

/// Every current state event of the room, members optionally excluded.
pub fn get_all(conn: &Connection, room_id: &RoomId, include_members: bool) -> Result<Vec<Event>> {
    let filter = if include_members { "" } else { "AND cs.event_type <> ?2" };
    let sql = format!(
        "SELECT {} FROM current_state cs
         JOIN events e ON e.rowid = cs.event_rowid
         LEFT JOIN timeline t ON t.event_rowid = e.rowid AND t.room_id = cs.room_id
         WHERE cs.room_id = ?1 {}
         ORDER BY cs.event_type, cs.state_key",
        EVENT_COLUMNS, filter
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = if include_members {
        stmt.query_map([room_id.as_str()], event_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?
    } else {
        stmt.query_map(params![room_id.as_str(), EVENT_TYPE_MEMBER], event_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?
    };
    Ok(rows)
}

pub fn get(conn: &Connection, room_id: &RoomId, event_type: &str, state_key: &str) -> Result<Option<Event>> {
    let sql = format!(
        "SELECT {} FROM current_state cs
         JOIN events e ON e.rowid = cs.event_rowid
         LEFT JOIN timeline t ON t.event_rowid = e.rowid AND t.room_id = cs.room_id
         WHERE cs.room_id = ?1 AND cs.event_type = ?2 AND cs.state_key = ?3",
        EVENT_COLUMNS
    );
    conn.query_row(&sql, params![room_id.as_str(), event_type, state_key], event_from_row)
        .optional()
}

pub fn get_member(conn: &Connection, room_id: &RoomId, user_id: &UserId) -> Result<Option<Event>> {
    get(conn, room_id, EVENT_TYPE_MEMBER, user_id.as_str())
}

/// Number of current-state rows of the room.
pub fn count(conn: &Connection, room_id: &RoomId) -> Result<usize> {
    let n: i64 = conn.query_row(
        "SELECT COUNT(*) FROM current_state WHERE room_id = ?1",
        [room_id.as_str()],
        |r| r.get(0),
    )?;
    Ok(n as usize)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Database;
    use crate::queries::events::{self, tests::event};
    use crate::queries::rooms;
    use serde_json::json;

    fn state_event(db: &Database, id: &str, event_type: &str, key: &str) -> CurrentStateEntry {
        let mut evt = event("!r:x", id, 1);
        evt.event_type = event_type.into();
        evt.state_key = Some(key.into());
        let membership = (event_type == EVENT_TYPE_MEMBER).then(|| "join".to_string());
        if membership.is_some() {
            evt.content = json!({"membership": "join", "displayname": "Alice"});
        }
        let rowid = db
            .with_conn(|c| {
                rooms::get_or_create(c, &"!r:x".into())?;
                events::upsert(c, &mut evt)
            })
            .unwrap();
        CurrentStateEntry {
            event_type: event_type.into(),
            state_key: key.into(),
            event_rowid: rowid,
            membership,
        }
    }

    #[test]
    fn members_can_be_excluded() {
        let db = Database::open_in_memory().unwrap();
        let room: RoomId = "!r:x".into();
        let entries = vec![
            state_event(&db, "$name", "m.room.name", ""),
            state_event(&db, "$alice", EVENT_TYPE_MEMBER, "@alice:x"),
        ];
        db.with_conn(|c| add_many(c, &room, false, &entries)).unwrap();

        assert_eq!(db.with_conn(|c| get_all(c, &room, true)).unwrap().len(), 2);
        let without = db.with_conn(|c| get_all(c, &room, false)).unwrap();
        assert_eq!(without.len(), 1);
        assert_eq!(without[0].event_type, "m.room.name");

        let alice = db
            .with_conn(|c| get_member(c, &room, &"@alice:x".into()))
            .unwrap()
            .unwrap();
        assert_eq!(alice.content["displayname"], "Alice");
    }

    #[test]
    fn replace_drops_stale_entries() {
        let db = Database::open_in_memory().unwrap();
        let room: RoomId = "!r:x".into();
        let old = state_event(&db, "$old", "m.room.topic", "");
        db.with_conn(|c| add_many(c, &room, false, &[old])).unwrap();
        let fresh = state_event(&db, "$new", "m.room.name", "");
        db.with_conn(|c| add_many(c, &room, true, &[fresh])).unwrap();

        assert_eq!(db.with_conn(|c| count(c, &room)).unwrap(), 1);
        assert!(db.with_conn(|c| get(c, &room, "m.room.topic", "")).unwrap().is_none());
    }
}
