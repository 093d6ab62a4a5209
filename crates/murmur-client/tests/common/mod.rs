#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::json;

use murmur_client::protocol::{
    EventList, JoinedRoom, MessagesResponse, ProtocolClient, RawEvent, RemoteError, SyncResponse, SyncTimeline,
};
use murmur_client::{Account, Client};
use murmur_db::Database;
use murmur_types::events::ClientEvent;
use murmur_types::ids::{EventId, RoomId};

pub const OWN_USER: &str = "@me:example.org";

/// Scripted homeserver. Each call pops the next queued response.
#[derive(Default)]
pub struct FakeProtocol {
    pub messages: Mutex<VecDeque<MessagesResponse>>,
    pub message_calls: Mutex<Vec<(RoomId, Option<String>)>>,
    pub state: Mutex<Vec<RawEvent>>,
    pub members: Mutex<Vec<RawEvent>>,
    pub state_calls: Mutex<usize>,
    pub member_calls: Mutex<usize>,
    pub events: Mutex<HashMap<EventId, RawEvent>>,
    pub syncs: Mutex<VecDeque<SyncResponse>>,
    /// Held by a test to stall `messages` until released.
    pub hold: tokio::sync::Mutex<()>,
}

#[async_trait]
impl ProtocolClient for FakeProtocol {
    async fn messages(&self, room_id: &RoomId, from: Option<&str>, _limit: usize) -> Result<MessagesResponse, RemoteError> {
        self.message_calls
            .lock()
            .unwrap()
            .push((room_id.clone(), from.map(str::to_owned)));
        let _held = self.hold.lock().await;
        Ok(self.messages.lock().unwrap().pop_front().unwrap_or_default())
    }

    async fn state(&self, _room_id: &RoomId) -> Result<Vec<RawEvent>, RemoteError> {
        *self.state_calls.lock().unwrap() += 1;
        Ok(self.state.lock().unwrap().clone())
    }

    async fn members(&self, _room_id: &RoomId) -> Result<Vec<RawEvent>, RemoteError> {
        *self.member_calls.lock().unwrap() += 1;
        Ok(self.members.lock().unwrap().clone())
    }

    async fn event(&self, _room_id: &RoomId, event_id: &EventId) -> Result<RawEvent, RemoteError> {
        self.events
            .lock()
            .unwrap()
            .get(event_id)
            .cloned()
            .ok_or_else(|| RemoteError::Status {
                status: 404,
                errcode: "M_NOT_FOUND".into(),
                error: "Event not found".into(),
            })
    }

    async fn sync(&self, _since: Option<&str>, _timeout_ms: u64) -> Result<SyncResponse, RemoteError> {
        let next = self.syncs.lock().unwrap().pop_front();
        match next {
            Some(resp) => Ok(resp),
            None => std::future::pending().await,
        }
    }
}

pub struct Harness {
    pub client: Client,
    pub fake: Arc<FakeProtocol>,
    pub pushed: Arc<Mutex<Vec<ClientEvent>>>,
}

impl Harness {
    pub fn new() -> Self {
        let fake = Arc::new(FakeProtocol::default());
        let pushed = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&pushed);
        let db = Arc::new(Database::open_in_memory().unwrap());
        let account = Account {
            user_id: OWN_USER.into(),
            device_id: Some("DEVICE".into()),
            homeserver_url: Some("https://example.org".into()),
        };
        let client = Client::builder(db, fake.clone(), account)
            .event_handler(Arc::new(move |evt| sink.lock().unwrap().push(evt)))
            .build();
        Self { client, fake, pushed }
    }

    pub fn take_pushed(&self) -> Vec<ClientEvent> {
        std::mem::take(&mut *self.pushed.lock().unwrap())
    }

    pub fn room_list_pushes(&self) -> usize {
        self.take_pushed()
            .iter()
            .filter(|evt| matches!(evt, ClientEvent::RoomList(_)))
            .count()
    }
}

pub fn message(id: &str, sender: &str, ts: i64, body: &str) -> RawEvent {
    RawEvent {
        event_id: Some(id.into()),
        event_type: Some("m.room.message".into()),
        sender: Some(sender.into()),
        origin_server_ts: Some(ts),
        content: json!({"msgtype": "m.text", "body": body}),
        ..Default::default()
    }
}

pub fn state_event(id: &str, event_type: &str, state_key: &str, content: serde_json::Value) -> RawEvent {
    RawEvent {
        event_id: Some(id.into()),
        event_type: Some(event_type.into()),
        sender: Some("@admin:example.org".into()),
        origin_server_ts: Some(1),
        content,
        state_key: Some(state_key.into()),
        ..Default::default()
    }
}

pub fn joined(events: Vec<RawEvent>, limited: bool, prev_batch: Option<&str>) -> JoinedRoom {
    JoinedRoom {
        timeline: SyncTimeline {
            events,
            limited,
            prev_batch: prev_batch.map(str::to_owned),
        },
        ..Default::default()
    }
}

pub fn with_state(mut room: JoinedRoom, state: Vec<RawEvent>) -> JoinedRoom {
    room.state = EventList { events: state };
    room
}

pub fn sync(next_batch: &str, rooms: Vec<(&str, JoinedRoom)>) -> SyncResponse {
    let mut resp = SyncResponse {
        next_batch: next_batch.into(),
        ..Default::default()
    };
    for (room_id, room) in rooms {
        resp.rooms.join.insert(room_id.into(), room);
    }
    resp
}
