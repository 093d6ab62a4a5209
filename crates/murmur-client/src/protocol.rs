//! Remote protocol boundary: the subset of homeserver responses the engine
//! reads, and the trait the HTTP adapter (or a test fake) implements.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use murmur_types::ids::{EventId, RoomId, UserId};
use murmur_types::models::LazyLoadSummary;

#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("server returned {status}: {errcode}: {error}")]
    Status { status: u16, errcode: String, error: String },

    #[error("invalid homeserver url: {0}")]
    Url(String),
}

/// An event as received from the server. Every field is optional so a
/// malformed event still decodes and can be stored with defaults.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawEvent {
    #[serde(default)]
    pub event_id: Option<EventId>,
    #[serde(default, rename = "type")]
    pub event_type: Option<String>,
    #[serde(default)]
    pub sender: Option<UserId>,
    #[serde(default)]
    pub origin_server_ts: Option<i64>,
    #[serde(default)]
    pub content: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unsigned: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub redacts: Option<EventId>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct MessagesResponse {
    #[serde(default)]
    pub start: Option<String>,
    /// Absent once the start of the room is reached.
    #[serde(default)]
    pub end: Option<String>,
    #[serde(default)]
    pub chunk: Vec<RawEvent>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct EventList {
    #[serde(default)]
    pub events: Vec<RawEvent>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SyncTimeline {
    #[serde(default)]
    pub events: Vec<RawEvent>,
    #[serde(default)]
    pub limited: bool,
    #[serde(default)]
    pub prev_batch: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct UnreadNotificationCounts {
    #[serde(default)]
    pub highlight_count: u32,
    #[serde(default)]
    pub notification_count: u32,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct JoinedRoom {
    #[serde(default)]
    pub summary: LazyLoadSummary,
    #[serde(default)]
    pub state: EventList,
    #[serde(default)]
    pub timeline: SyncTimeline,
    #[serde(default)]
    pub ephemeral: EventList,
    #[serde(default)]
    pub unread_notifications: Option<UnreadNotificationCounts>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SyncRooms {
    #[serde(default)]
    pub join: BTreeMap<RoomId, JoinedRoom>,
    #[serde(default)]
    pub leave: BTreeMap<RoomId, Value>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SyncResponse {
    pub next_batch: String,
    #[serde(default)]
    pub rooms: SyncRooms,
}

#[async_trait]
pub trait ProtocolClient: Send + Sync {
    /// One page of history going backwards from `from` (the live end when `None`).
    async fn messages(&self, room_id: &RoomId, from: Option<&str>, limit: usize)
    -> Result<MessagesResponse, RemoteError>;

    /// Full current state of a room.
    async fn state(&self, room_id: &RoomId) -> Result<Vec<RawEvent>, RemoteError>;

    /// Member events of a room.
    async fn members(&self, room_id: &RoomId) -> Result<Vec<RawEvent>, RemoteError>;

    async fn event(&self, room_id: &RoomId, event_id: &EventId) -> Result<RawEvent, RemoteError>;

    async fn sync(&self, since: Option<&str>, timeout_ms: u64) -> Result<SyncResponse, RemoteError>;
}
