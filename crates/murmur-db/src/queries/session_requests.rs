use anyhow::Result;
use rusqlite::{Connection, params};

use murmur_types::ids::{RoomId, SessionId, UserId};
use murmur_types::models::SessionRequest;

use super::sql_limit;

/// Record that keys for a session are wanted. Repeated requests keep the
/// smallest message index seen.
pub fn put(conn: &Connection, req: &SessionRequest) -> Result<()> {
    conn.prepare_cached(
        "INSERT INTO session_request (session_id, room_id, sender, min_index)
         VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT (session_id) DO UPDATE SET
            min_index = MIN(session_request.min_index, excluded.min_index)",
    )?
    .execute(params![
        req.session_id.as_str(),
        req.room_id.as_str(),
        req.sender.as_str(),
        req.min_index,
    ])?;
    Ok(())
}

/// Pending requests, oldest first.
pub fn pending(conn: &Connection, limit: usize) -> Result<Vec<SessionRequest>> {
    let mut stmt = conn.prepare(
        "SELECT session_id, room_id, sender, min_index FROM session_request
         ORDER BY created_at, session_id
         LIMIT ?1",
    )?;
    let rows = stmt
        .query_map([sql_limit(limit)], |r| {
            Ok(SessionRequest {
                session_id: SessionId::from(r.get::<_, String>(0)?),
                room_id: RoomId::from(r.get::<_, String>(1)?),
                sender: UserId::from(r.get::<_, String>(2)?),
                min_index: r.get(3)?,
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn delete(conn: &Connection, session_id: &SessionId) -> Result<()> {
    conn.execute("DELETE FROM session_request WHERE session_id = ?1", [session_id.as_str()])?;
    Ok(())
}
