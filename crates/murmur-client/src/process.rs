//! Turns raw server events into stored events. Shared by sync, pagination,
//! state refreshes and single-event lookups.

use std::collections::HashMap;

use anyhow::Result;
use chrono::DateTime;
use serde_json::Value;
use tracing::{trace, warn};

use murmur_db::Connection;
use murmur_db::queries::{events, media, session_requests};
use murmur_types::ids::{EventId, EventRowId, RoomId, SessionId, UserId};
use murmur_types::models::{
    CurrentStateEntry, EVENT_TYPE_AVATAR, EVENT_TYPE_CANONICAL_ALIAS, EVENT_TYPE_ENCRYPTED,
    EVENT_TYPE_ENCRYPTION, EVENT_TYPE_MEMBER, EVENT_TYPE_MESSAGE, EVENT_TYPE_NAME, EVENT_TYPE_STICKER,
    EVENT_TYPE_TOPIC, Event, LazyLoadSummary, MediaReference, REL_TYPE_REPLACE, Room, SessionRequest,
    UnreadType,
};

use crate::decrypt::{Decryption, Decryptor};
use crate::protocol::RawEvent;

const EVENT_TYPE_REDACTION: &str = "m.room.redaction";

/// Where an event came from. Only live timeline events are classified
/// for unread counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Source {
    Live,
    History,
    State,
    Lookup,
}

pub(crate) struct ProcessContext<'a> {
    pub own_user: &'a UserId,
    pub decryptor: &'a dyn Decryptor,
}

/// Session requests collected while processing a batch, persisted together
/// with the batch.
#[derive(Debug, Default)]
pub struct DecryptionQueue {
    requests: HashMap<SessionId, SessionRequest>,
}

impl DecryptionQueue {
    pub fn push(&mut self, req: SessionRequest) {
        self.requests
            .entry(req.session_id.clone())
            .and_modify(|existing| existing.min_index = existing.min_index.min(req.min_index))
            .or_insert(req);
    }

    pub fn len(&self) -> usize {
        self.requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }

    /// Store every queued request. Returns whether anything was queued, which
    /// tells the caller to signal the request consumer after commit.
    pub fn persist(&self, conn: &Connection) -> Result<bool> {
        for req in self.requests.values() {
            session_requests::put(conn, req)?;
        }
        Ok(!self.requests.is_empty())
    }
}

fn str_field<'a>(value: &'a Value, key: &str) -> Option<&'a str> {
    value.get(key).and_then(Value::as_str)
}

fn relation_of(content: &Value) -> (Option<EventId>, Option<String>) {
    let Some(rel) = content.get("m.relates_to") else {
        return (None, None);
    };
    (
        str_field(rel, "event_id").map(EventId::from),
        str_field(rel, "rel_type").map(str::to_owned),
    )
}

/// Map a raw event onto the storage model. Missing fields become defaults;
/// only an event without an ID is rejected, since nothing can key it.
pub(crate) fn to_event(raw: RawEvent, room_id: &RoomId) -> Option<Event> {
    let event_id = raw.event_id.filter(|id| !id.is_empty())?;
    let event_type = raw.event_type.unwrap_or_default();
    let (relates_to, relation_type) = relation_of(&raw.content);
    let megolm_session_id = (event_type == EVENT_TYPE_ENCRYPTED)
        .then(|| str_field(&raw.content, "session_id").map(SessionId::from))
        .flatten();
    let redacted_by = raw
        .unsigned
        .as_ref()
        .and_then(|u| u.get("redacted_because"))
        .and_then(|r| str_field(r, "event_id"))
        .map(EventId::from);

    Some(Event {
        rowid: EventRowId(0),
        timeline_rowid: None,
        room_id: room_id.clone(),
        event_id,
        sender: raw.sender.unwrap_or_default(),
        event_type,
        state_key: raw.state_key,
        timestamp: DateTime::from_timestamp_millis(raw.origin_server_ts.unwrap_or(0)).unwrap_or_default(),
        content: raw.content,
        decrypted: None,
        decrypted_type: None,
        unsigned: raw.unsigned,
        redacted_by,
        relates_to,
        relation_type,
        megolm_session_id,
        decryption_error: None,
        reactions: None,
        last_edit_rowid: None,
        unread_type: UnreadType::NONE,
    })
}

fn localpart(user_id: &UserId) -> &str {
    let id = user_id.as_str().trim_start_matches('@');
    id.split_once(':').map_or(id, |(local, _)| local)
}

pub(crate) fn classify_unread(evt: &Event, own_user: &UserId, summary: Option<&LazyLoadSummary>) -> UnreadType {
    if evt.sender == *own_user || !evt.can_be_preview() {
        return UnreadType::NONE;
    }
    let mut unread = UnreadType::MESSAGE;
    if summary.and_then(LazyLoadSummary::member_count).is_some_and(|n| n <= 2) {
        unread |= UnreadType::NOTIFY;
    }
    let own = localpart(own_user);
    if !own.is_empty()
        && evt
            .body()
            .is_some_and(|body| body.to_lowercase().contains(&own.to_lowercase()))
    {
        unread |= UnreadType::HIGHLIGHT | UnreadType::NOTIFY;
    }
    unread
}

/// `mxc://` URIs the event points at.
pub(crate) fn media_uris(evt: &Event) -> Vec<String> {
    let content = evt.effective_content();
    let candidates = match evt.effective_type() {
        EVENT_TYPE_MEMBER => vec![str_field(content, "avatar_url")],
        EVENT_TYPE_AVATAR => vec![str_field(content, "url")],
        EVENT_TYPE_MESSAGE | EVENT_TYPE_STICKER => vec![
            str_field(content, "url"),
            content.get("info").and_then(|info| str_field(info, "thumbnail_url")),
        ],
        _ => Vec::new(),
    };
    let mut uris: Vec<String> = candidates
        .into_iter()
        .flatten()
        .filter(|uri| uri.len() > "mxc://".len() && uri.starts_with("mxc://"))
        .map(str::to_owned)
        .collect();
    uris.dedup();
    uris
}

/// Current-state row for a state event.
pub(crate) fn state_entry(evt: &Event) -> Option<CurrentStateEntry> {
    let state_key = evt.state_key.clone()?;
    let membership = (evt.event_type == EVENT_TYPE_MEMBER)
        .then(|| str_field(&evt.content, "membership").map(str::to_owned))
        .flatten();
    Some(CurrentStateEntry {
        event_type: evt.event_type.clone(),
        state_key,
        event_rowid: evt.rowid,
        membership,
    })
}

/// Copy room metadata carried by important state events into `room`.
pub(crate) fn apply_important_state(room: &mut Room, evt: &Event) {
    if evt.state_key.as_deref() != Some("") {
        return;
    }
    let text = |key: &str| str_field(&evt.content, key).filter(|s| !s.is_empty()).map(str::to_owned);
    match evt.event_type.as_str() {
        EVENT_TYPE_NAME => room.name = text("name"),
        EVENT_TYPE_AVATAR => room.avatar = text("url"),
        EVENT_TYPE_TOPIC => room.topic = text("topic"),
        EVENT_TYPE_CANONICAL_ALIAS => room.canonical_alias = text("alias"),
        EVENT_TYPE_ENCRYPTION => room.encryption_algorithm = text("algorithm"),
        _ => {}
    }
}

/// Store one raw event and its side records. Returns `None` for events
/// that cannot be keyed.
pub(crate) fn process_event(
    conn: &Connection,
    raw: RawEvent,
    room_id: &RoomId,
    summary: Option<&LazyLoadSummary>,
    ctx: &ProcessContext<'_>,
    queue: &mut DecryptionQueue,
    source: Source,
) -> Result<Option<Event>> {
    let redacts = raw
        .redacts
        .clone()
        .or_else(|| str_field(&raw.content, "redacts").map(EventId::from));
    let Some(mut evt) = to_event(raw, room_id) else {
        warn!("Skipping event without an ID in {}", room_id);
        return Ok(None);
    };

    if evt.event_type == EVENT_TYPE_ENCRYPTED && !evt.is_state() {
        match ctx.decryptor.decrypt(&evt) {
            Decryption::Plaintext { event_type, content } => {
                if evt.relates_to.is_none() {
                    (evt.relates_to, evt.relation_type) = relation_of(&content);
                }
                evt.decrypted_type = Some(event_type);
                evt.decrypted = Some(content);
            }
            Decryption::Pending { error } => {
                trace!("Deferring decryption of {}: {}", evt.event_id, error);
                evt.decryption_error = Some(error);
                if let Some(session_id) = evt.megolm_session_id.clone() {
                    queue.push(SessionRequest {
                        session_id,
                        room_id: room_id.clone(),
                        sender: evt.sender.clone(),
                        min_index: 0,
                    });
                }
            }
        }
    }

    if source == Source::Live {
        evt.unread_type = classify_unread(&evt, ctx.own_user, summary);
    }

    events::upsert(conn, &mut evt)?;

    let uris = media_uris(&evt);
    if !uris.is_empty() {
        media::add_many(conn, &uris)?;
        let refs: Vec<MediaReference> = uris
            .into_iter()
            .map(|media_uri| MediaReference {
                event_rowid: evt.rowid,
                media_uri,
            })
            .collect();
        media::add_references(conn, &refs)?;
    }

    if evt.relation_type.as_deref() == Some(REL_TYPE_REPLACE) {
        if let Some(target) = evt.relates_to.clone() {
            events::set_last_edit(conn, &target, &evt)?;
        }
    }
    if evt.effective_type() == EVENT_TYPE_REDACTION {
        if let Some(target) = redacts {
            events::set_redacted_by(conn, &target, &evt.event_id)?;
        }
    }

    Ok(Some(evt))
}
