use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ids::{EventId, EventRowId, RoomId, SessionId, TimelineRowId, UserId};

/// Value stored in `rooms.prev_batch` once the server reported the start of
/// the room's history.
pub const PREV_BATCH_PAGINATION_COMPLETE: &str = "murmur.pagination_complete";

/// Backward pagination cursor of a room.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "Option<String>", into = "Option<String>")]
pub enum PrevBatch {
    /// No token known yet. The server paginates from the live end.
    #[default]
    Latest,
    Token(String),
    /// History is exhausted. Never contact the server again for this room.
    Complete,
}

impl PrevBatch {
    pub fn from_token(token: Option<String>) -> Self {
        match token {
            None => Self::Latest,
            Some(t) if t == PREV_BATCH_PAGINATION_COMPLETE => Self::Complete,
            Some(t) if t.is_empty() => Self::Latest,
            Some(t) => Self::Token(t),
        }
    }

    pub fn as_token(&self) -> Option<&str> {
        match self {
            Self::Latest => None,
            Self::Token(t) => Some(t),
            Self::Complete => Some(PREV_BATCH_PAGINATION_COMPLETE),
        }
    }

    pub fn is_complete(&self) -> bool {
        matches!(self, Self::Complete)
    }
}

impl From<Option<String>> for PrevBatch {
    fn from(value: Option<String>) -> Self {
        Self::from_token(value)
    }
}

impl From<PrevBatch> for Option<String> {
    fn from(value: PrevBatch) -> Self {
        value.as_token().map(str::to_owned)
    }
}

/// Server-provided membership summary used with lazy-loaded members.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LazyLoadSummary {
    #[serde(rename = "m.heroes", default, skip_serializing_if = "Vec::is_empty")]
    pub heroes: Vec<UserId>,
    #[serde(rename = "m.joined_member_count", default, skip_serializing_if = "Option::is_none")]
    pub joined_member_count: Option<u32>,
    #[serde(rename = "m.invited_member_count", default, skip_serializing_if = "Option::is_none")]
    pub invited_member_count: Option<u32>,
}

impl LazyLoadSummary {
    /// Joined plus invited members, if the server told us either.
    pub fn member_count(&self) -> Option<u32> {
        match (self.joined_member_count, self.invited_member_count) {
            (None, None) => None,
            (joined, invited) => Some(joined.unwrap_or(0).saturating_add(invited.unwrap_or(0))),
        }
    }

    /// Overlay the fields present in `delta`. Sync only sends what changed.
    pub fn merge(&mut self, delta: &LazyLoadSummary) {
        if !delta.heroes.is_empty() {
            self.heroes = delta.heroes.clone();
        }
        if delta.joined_member_count.is_some() {
            self.joined_member_count = delta.joined_member_count;
        }
        if delta.invited_member_count.is_some() {
            self.invited_member_count = delta.invited_member_count;
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Room {
    pub room_id: RoomId,
    pub name: Option<String>,
    pub avatar: Option<String>,
    pub topic: Option<String>,
    pub canonical_alias: Option<String>,
    pub lazy_load_summary: Option<LazyLoadSummary>,
    pub encryption_algorithm: Option<String>,
    pub has_member_list: bool,
    pub preview_event_rowid: Option<EventRowId>,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub sorting_timestamp: DateTime<Utc>,
    pub unread_highlights: u32,
    pub unread_notifications: u32,
    pub unread_messages: u32,
    pub prev_batch: PrevBatch,
}

impl Room {
    pub fn new(room_id: RoomId) -> Self {
        Self {
            room_id,
            ..Default::default()
        }
    }

    pub fn member_count(&self) -> Option<u32> {
        self.lazy_load_summary.as_ref().and_then(LazyLoadSummary::member_count)
    }
}

/// Local unread classification of a single event, stored as a bit set.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UnreadType(pub u8);

impl UnreadType {
    pub const NONE: UnreadType = UnreadType(0);
    pub const NOTIFY: UnreadType = UnreadType(0b001);
    pub const HIGHLIGHT: UnreadType = UnreadType(0b010);
    pub const MESSAGE: UnreadType = UnreadType(0b100);

    pub fn contains(self, other: UnreadType) -> bool {
        self.0 & other.0 == other.0 && other.0 != 0
    }

    pub fn is_message(self) -> bool {
        self.contains(Self::MESSAGE)
    }

    pub fn is_notify(self) -> bool {
        self.contains(Self::NOTIFY)
    }

    pub fn is_highlight(self) -> bool {
        self.contains(Self::HIGHLIGHT)
    }
}

impl std::ops::BitOr for UnreadType {
    type Output = UnreadType;

    fn bitor(self, rhs: Self) -> Self::Output {
        UnreadType(self.0 | rhs.0)
    }
}

impl std::ops::BitOrAssign for UnreadType {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

pub const EVENT_TYPE_MESSAGE: &str = "m.room.message";
pub const EVENT_TYPE_STICKER: &str = "m.sticker";
pub const EVENT_TYPE_ENCRYPTED: &str = "m.room.encrypted";
pub const EVENT_TYPE_REACTION: &str = "m.reaction";
pub const EVENT_TYPE_MEMBER: &str = "m.room.member";
pub const EVENT_TYPE_NAME: &str = "m.room.name";
pub const EVENT_TYPE_AVATAR: &str = "m.room.avatar";
pub const EVENT_TYPE_TOPIC: &str = "m.room.topic";
pub const EVENT_TYPE_ENCRYPTION: &str = "m.room.encryption";
pub const EVENT_TYPE_CANONICAL_ALIAS: &str = "m.room.canonical_alias";

pub const REL_TYPE_REPLACE: &str = "m.replace";
pub const REL_TYPE_ANNOTATION: &str = "m.annotation";

/// A stored event: the immutable server payload plus local decorations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub rowid: EventRowId,
    pub timeline_rowid: Option<TimelineRowId>,
    pub room_id: RoomId,
    pub event_id: EventId,
    pub sender: UserId,
    #[serde(rename = "type")]
    pub event_type: String,
    pub state_key: Option<String>,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub timestamp: DateTime<Utc>,
    pub content: Value,
    pub decrypted: Option<Value>,
    pub decrypted_type: Option<String>,
    pub unsigned: Option<Value>,
    pub redacted_by: Option<EventId>,
    pub relates_to: Option<EventId>,
    pub relation_type: Option<String>,
    pub megolm_session_id: Option<SessionId>,
    pub decryption_error: Option<String>,
    pub reactions: Option<BTreeMap<String, u32>>,
    pub last_edit_rowid: Option<EventRowId>,
    pub unread_type: UnreadType,
}

impl Event {
    /// Type after decryption, falling back to the wire type.
    pub fn effective_type(&self) -> &str {
        self.decrypted_type.as_deref().unwrap_or(&self.event_type)
    }

    pub fn effective_content(&self) -> &Value {
        self.decrypted.as_ref().unwrap_or(&self.content)
    }

    pub fn is_state(&self) -> bool {
        self.state_key.is_some()
    }

    /// Whether this event may serve as a room's one-line preview.
    pub fn can_be_preview(&self) -> bool {
        if self.is_state() || self.redacted_by.is_some() {
            return false;
        }
        if self.relation_type.as_deref() == Some(REL_TYPE_REPLACE) {
            return false;
        }
        matches!(
            self.effective_type(),
            EVENT_TYPE_MESSAGE | EVENT_TYPE_STICKER | EVENT_TYPE_ENCRYPTED
        )
    }

    /// `content.body` of the (decrypted) event, if it has one.
    pub fn body(&self) -> Option<&str> {
        self.effective_content().get("body").and_then(Value::as_str)
    }
}

/// One row of a room's current state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CurrentStateEntry {
    pub event_type: String,
    pub state_key: String,
    pub event_rowid: EventRowId,
    pub membership: Option<String>,
}

/// A media URI referenced by a stored event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaReference {
    pub event_rowid: EventRowId,
    pub media_uri: String,
}

/// Marks that at least one stored event needs keys for `session_id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRequest {
    pub session_id: SessionId,
    pub room_id: RoomId,
    pub sender: UserId,
    pub min_index: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimelineRowTuple {
    pub timeline_rowid: TimelineRowId,
    pub event_rowid: EventRowId,
}

/// Denormalized room summary rendered in the room list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomListEntry {
    pub room_id: RoomId,
    pub name: String,
    pub avatar: Option<String>,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub sorting_timestamp: DateTime<Utc>,
    pub preview_event_rowid: Option<EventRowId>,
    pub preview_body: Option<String>,
    pub preview_sender: Option<UserId>,
    pub preview_sender_name: Option<String>,
    pub unread_messages: u32,
    pub unread_notifications: u32,
    pub unread_highlights: u32,
}

impl RoomListEntry {
    /// True when the fields that drive ordering, counters or the preview differ.
    pub fn differs_from(&self, other: &RoomListEntry) -> bool {
        self.sorting_timestamp != other.sorting_timestamp
            || self.unread_messages != other.unread_messages
            || self.unread_notifications != other.unread_notifications
            || self.unread_highlights != other.unread_highlights
            || self.preview_event_rowid != other.preview_event_rowid
    }
}
