//! Sorted room summaries shown in the room list, patched incrementally from
//! sync deltas.

use serde_json::Value;

use murmur_db::Connection;
use murmur_db::queries::rooms::{self, SortCursor};
use murmur_db::queries::{events, state};
use murmur_types::events::SyncRoom;
use murmur_types::ids::RoomId;
use murmur_types::models::{Event, Room, RoomListEntry};

use crate::Client;
use crate::error::ClientError;

#[derive(Debug, Default)]
enum RoomListState {
    #[default]
    Uninitialized,
    Populated(Vec<RoomListEntry>),
}

/// Room list ordered ascending by `sorting_timestamp`. Starts uninitialized
/// and is populated once by the first sync after startup.
#[derive(Debug, Default)]
pub struct RoomList {
    state: RoomListState,
}

impl RoomList {
    pub fn is_populated(&self) -> bool {
        matches!(self.state, RoomListState::Populated(_))
    }

    pub fn entries(&self) -> &[RoomListEntry] {
        match &self.state {
            RoomListState::Uninitialized => &[],
            RoomListState::Populated(entries) => entries,
        }
    }

    /// Replace the list wholesale. Rooms with equal timestamps keep their
    /// relative order.
    pub fn populate(&mut self, mut entries: Vec<RoomListEntry>) {
        entries.sort_by_key(|entry| entry.sorting_timestamp);
        self.state = RoomListState::Populated(entries);
    }

    /// Apply one sync delta. Returns whether any entry changed.
    pub fn apply(&mut self, updates: Vec<RoomListEntry>, removed: &[RoomId]) -> bool {
        let RoomListState::Populated(entries) = &mut self.state else {
            return false;
        };
        let mut changed = false;
        for room_id in removed {
            if let Some(pos) = entries.iter().position(|e| e.room_id == *room_id) {
                entries.remove(pos);
                changed = true;
            }
        }
        for update in updates {
            match entries.iter().position(|e| e.room_id == update.room_id) {
                Some(pos) if !entries[pos].differs_from(&update) => continue,
                Some(pos) if entries[pos].sorting_timestamp == update.sorting_timestamp => {
                    entries[pos] = update;
                }
                Some(pos) => {
                    entries.remove(pos);
                    insert_sorted(entries, update);
                }
                None => insert_sorted(entries, update),
            }
            changed = true;
        }
        changed
    }
}

/// Insert after the last entry whose timestamp is less than or equal to the
/// new one. New activity usually lands at the tail, so that is checked
/// first, then the head, then a scan from the tail.
fn insert_sorted(entries: &mut Vec<RoomListEntry>, entry: RoomListEntry) {
    let ts = entry.sorting_timestamp;
    if entries.last().is_none_or(|last| last.sorting_timestamp <= ts) {
        entries.push(entry);
        return;
    }
    if entries.first().is_some_and(|first| ts < first.sorting_timestamp) {
        entries.insert(0, entry);
        return;
    }
    let idx = entries
        .iter()
        .rposition(|e| e.sorting_timestamp <= ts)
        .map_or(0, |i| i + 1);
    entries.insert(idx, entry);
}

fn display_name(member: &Event) -> Option<String> {
    member
        .content
        .get("displayname")
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(str::to_owned)
}

fn room_name(room: &Room) -> String {
    if let Some(name) = room.name.clone().or_else(|| room.canonical_alias.clone()) {
        return name;
    }
    match room.lazy_load_summary.as_ref().map(|s| &s.heroes) {
        Some(heroes) if !heroes.is_empty() => heroes
            .iter()
            .map(|h| h.as_str())
            .collect::<Vec<_>>()
            .join(", "),
        _ => room.room_id.to_string(),
    }
}

/// Body to show for the preview, taking the newest edit into account.
fn preview_body(conn: &Connection, preview: &Event) -> anyhow::Result<Option<String>> {
    if let Some(edit_rowid) = preview.last_edit_rowid {
        if let Some(edit) = events::get_by_rowid(conn, edit_rowid)? {
            let edited = edit
                .effective_content()
                .get("m.new_content")
                .and_then(|c| c.get("body"))
                .and_then(Value::as_str);
            if let Some(body) = edited {
                return Ok(Some(body.to_owned()));
            }
        }
    }
    Ok(preview.body().map(str::to_owned))
}

/// Render a stored room as a list entry. A missing preview event or sender
/// leaves the matching fields empty.
pub(crate) fn project(conn: &Connection, room: &Room) -> anyhow::Result<RoomListEntry> {
    let preview = match room.preview_event_rowid {
        Some(rowid) => events::get_by_rowid(conn, rowid)?,
        None => None,
    };
    let (preview_body, preview_sender, preview_sender_name) = match &preview {
        Some(evt) => {
            let member = state::get_member(conn, &room.room_id, &evt.sender)?;
            (
                preview_body(conn, evt)?,
                Some(evt.sender.clone()),
                member.as_ref().and_then(display_name),
            )
        }
        None => (None, None, None),
    };
    Ok(RoomListEntry {
        room_id: room.room_id.clone(),
        name: room_name(room),
        avatar: room.avatar.clone(),
        sorting_timestamp: room.sorting_timestamp,
        preview_event_rowid: room.preview_event_rowid,
        preview_body,
        preview_sender,
        preview_sender_name,
        unread_messages: room.unread_messages,
        unread_notifications: room.unread_notifications,
        unread_highlights: room.unread_highlights,
    })
}

pub(crate) fn project_all(conn: &Connection) -> anyhow::Result<Vec<RoomListEntry>> {
    rooms::get_all(conn)?
        .iter()
        .map(|room| project(conn, room))
        .collect()
}

impl Client {
    /// Current ordered room list; empty until the first sync populated it.
    pub fn room_list(&self) -> Vec<RoomListEntry> {
        self.inner.lock_room_list().entries().to_vec()
    }

    /// One batch of rooms for a new frontend, most recently active first,
    /// each with its preview event and that event's newest edit.
    pub async fn initial_room_batch(
        &self,
        after: Option<SortCursor>,
        limit: usize,
    ) -> Result<Vec<SyncRoom>, ClientError> {
        self.blocking(move |inner| {
            inner.db.with_conn(|conn| {
                let batch = rooms::get_by_sort_ts(conn, after.as_ref(), limit)?;
                let mut out = Vec::with_capacity(batch.len());
                for room in batch {
                    let mut preview_events = Vec::with_capacity(2);
                    if let Some(rowid) = room.preview_event_rowid {
                        if let Some(preview) = events::get_by_rowid(conn, rowid)? {
                            let mut pair = vec![preview];
                            events::fill_reaction_counts(conn, &room.room_id, &mut pair)?;
                            if let Some(edit_rowid) = pair[0].last_edit_rowid {
                                pair.extend(events::get_by_rowid(conn, edit_rowid)?);
                            }
                            preview_events = pair;
                        }
                    }
                    let mut sync_room = SyncRoom::meta_only(room);
                    sync_room.events = preview_events;
                    out.push(sync_room);
                }
                Ok(out)
            })
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::DateTime;
    use murmur_types::ids::EventRowId;

    fn entry(id: &str, ts: i64) -> RoomListEntry {
        RoomListEntry {
            room_id: id.into(),
            name: id.into(),
            avatar: None,
            sorting_timestamp: DateTime::from_timestamp_millis(ts).unwrap(),
            preview_event_rowid: None,
            preview_body: None,
            preview_sender: None,
            preview_sender_name: None,
            unread_messages: 0,
            unread_notifications: 0,
            unread_highlights: 0,
        }
    }

    fn ids(list: &RoomList) -> Vec<&str> {
        list.entries().iter().map(|e| e.room_id.as_str()).collect()
    }

    fn populated(entries: &[(&str, i64)]) -> RoomList {
        let mut list = RoomList::default();
        list.populate(entries.iter().map(|(id, ts)| entry(id, *ts)).collect());
        list
    }

    fn assert_sorted(list: &RoomList) {
        let ts: Vec<_> = list.entries().iter().map(|e| e.sorting_timestamp).collect();
        assert!(ts.windows(2).all(|w| w[0] <= w[1]), "not sorted: {:?}", ts);
    }

    #[test]
    fn populate_sorts_stably() {
        let list = populated(&[("!c", 5), ("!a", 1), ("!b", 5), ("!d", 3)]);
        assert_eq!(ids(&list), vec!["!a", "!d", "!c", "!b"]);
    }

    #[test]
    fn uninitialized_ignores_deltas() {
        let mut list = RoomList::default();
        assert!(!list.apply(vec![entry("!a", 1)], &[]));
        assert!(!list.is_populated());
        assert!(list.entries().is_empty());
    }

    #[test]
    fn noop_delta_reports_no_change() {
        let mut list = populated(&[("!a", 1), ("!b", 2)]);
        assert!(!list.apply(vec![entry("!a", 1), entry("!b", 2)], &[]));
        assert_eq!(ids(&list), vec!["!a", "!b"]);
    }

    #[test]
    fn unread_reset_replaces_in_place() {
        let mut start = entry("!r", 5);
        start.unread_messages = 2;
        let mut list = RoomList::default();
        list.populate(vec![entry("!a", 1), start, entry("!z", 9)]);

        let mut update = entry("!r", 5);
        update.unread_messages = 0;
        assert!(list.apply(vec![update], &[]));
        assert_eq!(ids(&list), vec!["!a", "!r", "!z"]);
        assert_eq!(list.entries()[1].unread_messages, 0);
    }

    #[test]
    fn new_activity_moves_to_tail() {
        let mut list = populated(&[("!a", 1), ("!b", 2), ("!c", 3)]);
        assert!(list.apply(vec![entry("!a", 10)], &[]));
        assert_eq!(ids(&list), vec!["!b", "!c", "!a"]);
    }

    #[test]
    fn older_timestamp_goes_to_head_and_ties_go_after_equals() {
        let mut list = populated(&[("!a", 5), ("!b", 7), ("!c", 9)]);
        list.apply(vec![entry("!new", 1)], &[]);
        assert_eq!(ids(&list), vec!["!new", "!a", "!b", "!c"]);

        list.apply(vec![entry("!tie", 7)], &[]);
        assert_eq!(ids(&list), vec!["!new", "!a", "!b", "!tie", "!c"]);

        list.apply(vec![entry("!mid", 6)], &[]);
        assert_eq!(ids(&list), vec!["!new", "!a", "!mid", "!b", "!tie", "!c"]);
        assert_sorted(&list);
    }

    #[test]
    fn removed_rooms_leave_the_list() {
        let mut list = populated(&[("!a", 1), ("!b", 2)]);
        assert!(list.apply(Vec::new(), &["!a".into()]));
        assert_eq!(ids(&list), vec!["!b"]);
        assert!(!list.apply(Vec::new(), &["!gone".into()]));
    }

    #[test]
    fn preview_change_counts_as_change() {
        let mut list = populated(&[("!a", 1)]);
        let mut update = entry("!a", 1);
        update.preview_event_rowid = Some(EventRowId(42));
        assert!(list.apply(vec![update], &[]));
        assert_eq!(list.entries()[0].preview_event_rowid, Some(EventRowId(42)));
    }
}
