use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ids::{EventRowId, RoomId, UserId};
use crate::models::{Event, Room, RoomListEntry, TimelineRowTuple};

/// Envelope for every frame exchanged with a frontend.
///
/// Inbound commands carry `command`, `request_id` and `data`. Responses echo
/// the `request_id` and omit `command`. Unsolicited pushes use `request_id` 0.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonCommand {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(default)]
    pub request_id: i64,
    #[serde(default)]
    pub data: Value,
}

impl JsonCommand {
    pub fn push(command: &str, data: Value) -> Self {
        Self {
            command: Some(command.to_owned()),
            request_id: 0,
            data,
        }
    }

    pub fn response(request_id: i64, data: Value) -> Self {
        Self {
            command: None,
            request_id,
            data,
        }
    }

    pub fn error(request_id: i64, errcode: &str, message: impl Into<String>) -> Self {
        Self::response(
            request_id,
            serde_json::to_value(ErrorPayload {
                errcode: errcode.to_owned(),
                error: message.into(),
            })
            .unwrap_or(Value::Null),
        )
    }
}

/// `data` of a failed command response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub errcode: String,
    pub error: String,
}

/// Snapshot sent first on every new frontend connection.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientState {
    pub is_logged_in: bool,
    pub user_id: Option<UserId>,
    pub device_id: Option<String>,
    pub homeserver_url: Option<String>,
}

/// Per-room part of a `sync_complete` push.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncRoom {
    pub meta: Room,
    pub timeline: Vec<TimelineRowTuple>,
    pub state: HashMap<String, HashMap<String, EventRowId>>,
    pub events: Vec<Event>,
    pub reset: bool,
}

impl SyncRoom {
    pub fn meta_only(meta: Room) -> Self {
        Self {
            meta,
            timeline: Vec::new(),
            state: HashMap::new(),
            events: Vec::new(),
            reset: false,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncComplete {
    pub rooms: BTreeMap<RoomId, SyncRoom>,
    pub left_rooms: Vec<RoomId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatusKind {
    Ok,
    Waiting,
    Erroring,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncStatus {
    #[serde(rename = "type")]
    pub kind: SyncStatusKind,
    pub error_count: u32,
    pub last_error: Option<String>,
}

/// State changes pushed to every subscribed frontend.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    ClientState(ClientState),
    SyncComplete(SyncComplete),
    SyncStatus(SyncStatus),
    /// Full ordered room list after it changed.
    RoomList(Vec<RoomListEntry>),
}

impl ClientEvent {
    pub fn command_name(&self) -> &'static str {
        match self {
            Self::ClientState(_) => "client_state",
            Self::SyncComplete(_) => "sync_complete",
            Self::SyncStatus(_) => "sync_status",
            Self::RoomList(_) => "room_list",
        }
    }

    pub fn to_command(&self) -> serde_json::Result<JsonCommand> {
        let data = match self {
            Self::ClientState(state) => serde_json::to_value(state)?,
            Self::SyncComplete(sync) => serde_json::to_value(sync)?,
            Self::SyncStatus(status) => serde_json::to_value(status)?,
            Self::RoomList(entries) => serde_json::to_value(entries)?,
        };
        Ok(JsonCommand::push(self.command_name(), data))
    }
}
