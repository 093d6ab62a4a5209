use std::collections::VecDeque;
use std::convert::Infallible;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::extract::ws::Message;
use futures_util::{Sink, Stream};
use serde_json::json;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use murmur_client::SortCursor;
use murmur_client::commands::CommandContext;
use murmur_gateway::dispatcher::STATUS_EVENTS_STUCK;
use murmur_gateway::{Backend, ConnectionConfig, Dispatcher, serve};
use murmur_types::events::{ClientEvent, ClientState, JsonCommand, SyncRoom, SyncStatus, SyncStatusKind};
use murmur_types::models::Room;

#[derive(Default)]
struct FakeBackend {
    batches: Mutex<VecDeque<Vec<SyncRoom>>>,
    cursors: Mutex<Vec<Option<SortCursor>>>,
}

#[async_trait]
impl Backend for FakeBackend {
    fn client_state(&self) -> ClientState {
        ClientState {
            is_logged_in: true,
            user_id: Some("@me:x".into()),
            ..Default::default()
        }
    }

    async fn initial_room_batch(&self, after: Option<SortCursor>, _limit: usize) -> anyhow::Result<Vec<SyncRoom>> {
        self.cursors.lock().unwrap().push(after);
        Ok(self.batches.lock().unwrap().pop_front().unwrap_or_default())
    }

    async fn submit_json_command(&self, cmd: JsonCommand, ctx: &CommandContext<'_>) -> JsonCommand {
        match cmd.command.as_deref() {
            Some("ping") => JsonCommand::response(cmd.request_id, json!({})),
            Some("explode") => panic!("command exploded"),
            Some("wait") => {
                ctx.cancel.cancelled().await;
                JsonCommand::error(cmd.request_id, "CANCELLED", "cancelled")
            }
            other => JsonCommand::error(cmd.request_id, "UNKNOWN_COMMAND", format!("{:?}", other)),
        }
    }
}

type TestSink = Pin<Box<dyn Sink<Message, Error = String> + Send>>;
type TestStream = Pin<Box<dyn Stream<Item = Result<Message, Infallible>> + Send>>;

/// The test's end of one websocket.
struct Peer {
    to_server: mpsc::UnboundedSender<Message>,
    from_server: mpsc::Receiver<Message>,
    task: JoinHandle<()>,
}

impl Peer {
    fn send(&self, text: &str) {
        self.to_server.send(Message::Text(text.to_owned().into())).unwrap();
    }

    async fn next(&mut self) -> Message {
        tokio::time::timeout(Duration::from_secs(2), self.from_server.recv())
            .await
            .expect("timed out waiting for a frame")
            .expect("socket closed without a frame")
    }

    async fn next_command(&mut self) -> JsonCommand {
        match self.next().await {
            Message::Text(text) => serde_json::from_str(&text).unwrap(),
            other => panic!("expected a text frame, got {:?}", other),
        }
    }

    /// Skip text frames until the close frame and return its code.
    async fn close_code(&mut self) -> u16 {
        loop {
            match self.next().await {
                Message::Close(Some(frame)) => return frame.code,
                Message::Close(None) => panic!("close frame without a code"),
                _ => {}
            }
        }
    }

    async fn finished(self) {
        tokio::time::timeout(Duration::from_secs(2), self.task)
            .await
            .expect("connection did not shut down")
            .unwrap();
    }
}

fn connect(backend: Arc<dyn Backend>, dispatcher: &Dispatcher, config: ConnectionConfig, sink_capacity: usize) -> Peer {
    let (out_tx, from_server) = mpsc::channel::<Message>(sink_capacity);
    let sink: TestSink = Box::pin(futures_util::sink::unfold(out_tx, |tx, msg: Message| async move {
        tx.send(msg).await.map_err(|e| e.to_string())?;
        Ok::<_, String>(tx)
    }));

    let (to_server, in_rx) = mpsc::unbounded_channel::<Message>();
    let stream: TestStream = Box::pin(futures_util::stream::unfold(in_rx, |mut rx| async move {
        rx.recv().await.map(|msg| (Ok(msg), rx))
    }));

    let task = tokio::spawn(serve(sink, stream, backend, dispatcher.clone(), config));
    Peer {
        to_server,
        from_server,
        task,
    }
}

fn room(id: &str, ts: i64) -> SyncRoom {
    let mut meta = Room::new(id.into());
    meta.sorting_timestamp = chrono::DateTime::from_timestamp_millis(ts).unwrap();
    SyncRoom::meta_only(meta)
}

fn status() -> ClientEvent {
    ClientEvent::SyncStatus(SyncStatus {
        kind: SyncStatusKind::Ok,
        error_count: 0,
        last_error: None,
    })
}

#[tokio::test]
async fn state_then_initial_rooms_then_responses() {
    let backend = Arc::new(FakeBackend::default());
    backend
        .batches
        .lock()
        .unwrap()
        .extend([vec![room("!c:x", 30), room("!b:x", 20)], vec![room("!a:x", 10)]]);
    let dispatcher = Dispatcher::new();
    let config = ConnectionConfig {
        queue_size: 32,
        initial_room_batch: 2,
    };
    let mut peer = connect(backend.clone(), &dispatcher, config, 16);

    let state = peer.next_command().await;
    assert_eq!(state.command.as_deref(), Some("client_state"));
    assert_eq!(state.data["user_id"], "@me:x");

    let first = peer.next_command().await;
    assert_eq!(first.command.as_deref(), Some("sync_complete"));
    assert_eq!(first.data["rooms"].as_object().unwrap().len(), 2);
    let second = peer.next_command().await;
    assert_eq!(second.data["rooms"].as_object().unwrap().len(), 1);

    {
        let cursors = backend.cursors.lock().unwrap();
        assert_eq!(cursors.len(), 2);
        assert!(cursors[0].is_none());
        assert_eq!(cursors[1].as_ref().map(|c| c.room_id.as_str()), Some("!b:x"));
    }

    peer.send(r#"{"request_id": 7, "command": "ping", "data": null}"#);
    let pong = peer.next_command().await;
    assert_eq!(pong.request_id, 7);
    assert!(pong.command.is_none());

    dispatcher.publish(&status());
    let pushed = peer.next_command().await;
    assert_eq!(pushed.command.as_deref(), Some("sync_status"));
    assert_eq!(pushed.request_id, 0);

    peer.to_server.send(Message::Close(None)).unwrap();
    assert_eq!(peer.close_code().await, 1000);
    peer.finished().await;
    assert_eq!(dispatcher.connection_count(), 0);
}

#[tokio::test]
async fn overflowing_queue_closes_with_events_stuck() {
    let dispatcher = Dispatcher::new();
    let config = ConnectionConfig {
        queue_size: 1,
        initial_room_batch: 100,
    };
    // The test reads nothing until the overflow, so the socket backs up.
    let mut peer = connect(Arc::new(FakeBackend::default()), &dispatcher, config, 1);
    while dispatcher.connection_count() == 0 {
        tokio::task::yield_now().await;
    }

    for _ in 0..1_000 {
        if dispatcher.connection_count() == 0 {
            break;
        }
        dispatcher.publish(&status());
        tokio::task::yield_now().await;
    }
    assert_eq!(dispatcher.connection_count(), 0);

    assert_eq!(peer.next_command().await.command.as_deref(), Some("client_state"));
    assert_eq!(peer.close_code().await, STATUS_EVENTS_STUCK);
    peer.finished().await;
}

#[tokio::test]
async fn panicking_command_only_closes_its_connection() {
    let backend: Arc<dyn Backend> = Arc::new(FakeBackend::default());
    let dispatcher = Dispatcher::new();
    let mut bad = connect(backend.clone(), &dispatcher, ConnectionConfig::default(), 16);
    let mut good = connect(backend, &dispatcher, ConnectionConfig::default(), 16);
    bad.next_command().await;
    good.next_command().await;

    bad.send(r#"{"request_id": 1, "command": "explode"}"#);
    assert_eq!(bad.close_code().await, 1011);
    bad.finished().await;

    good.send(r#"{"request_id": 2, "command": "ping"}"#);
    assert_eq!(good.next_command().await.request_id, 2);
    assert_eq!(dispatcher.connection_count(), 1);
}

#[tokio::test]
async fn malformed_frame_closes_as_unsupported() {
    let dispatcher = Dispatcher::new();
    let mut peer = connect(Arc::new(FakeBackend::default()), &dispatcher, ConnectionConfig::default(), 16);
    peer.next_command().await;

    peer.send("this is not json");
    assert_eq!(peer.close_code().await, 1003);
    peer.finished().await;
}

#[tokio::test]
async fn shutdown_closes_everyone_and_cancels_commands() {
    let dispatcher = Dispatcher::new();
    let backend: Arc<dyn Backend> = Arc::new(FakeBackend::default());
    let mut a = connect(backend.clone(), &dispatcher, ConnectionConfig::default(), 16);
    let mut b = connect(backend, &dispatcher, ConnectionConfig::default(), 16);
    a.next_command().await;
    b.next_command().await;

    a.send(r#"{"request_id": 5, "command": "wait"}"#);
    tokio::time::sleep(Duration::from_millis(20)).await;

    dispatcher.close_all(1001, "server shutting down");
    assert_eq!(a.close_code().await, 1001);
    assert_eq!(b.close_code().await, 1001);
    a.finished().await;
    b.finished().await;
    assert_eq!(dispatcher.connection_count(), 0);
}
