use std::any::Any;
use std::fmt::Display;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use futures_util::{FutureExt, Sink, SinkExt, Stream, StreamExt};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

use murmur_client::commands::{CommandContext, RunningRequests};
use murmur_types::events::{ClientEvent, JsonCommand};

use crate::backend::Backend;
use crate::dispatcher::{Dispatcher, PushError, Subscriber};
use crate::initial::send_initial_data;

pub const CLOSE_NORMAL: u16 = 1000;
pub const CLOSE_GOING_AWAY: u16 = 1001;
pub const CLOSE_UNSUPPORTED: u16 = 1003;
pub const CLOSE_INTERNAL_ERROR: u16 = 1011;

#[derive(Debug, Clone, Copy)]
pub struct ConnectionConfig {
    /// Capacity of the outbound event queue.
    pub queue_size: usize,
    /// Rooms per `sync_complete` push of the initial data.
    pub initial_room_batch: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            queue_size: 32,
            initial_room_batch: 100,
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Per-connection state shared by its tasks and the dispatcher.
struct Shared {
    id: Uuid,
    cancel: CancellationToken,
    dispatcher: Dispatcher,
    events: Mutex<Option<mpsc::Sender<JsonCommand>>>,
    close_tx: Mutex<Option<oneshot::Sender<CloseFrame>>>,
    closed: AtomicBool,
}

impl Shared {
    /// Tear the connection down: cancel its work, leave the dispatcher, ask
    /// the writer to send a close frame, then drop the event queue. Only the
    /// first call does anything; returns whether this call did.
    fn teardown(&self, code: u16, reason: &str) -> bool {
        if self.closed.swap(true, Ordering::AcqRel) {
            return false;
        }
        debug!(conn = %self.id, code, "Closing connection: {}", reason);
        self.cancel.cancel();
        self.dispatcher.unsubscribe(self.id);
        if let Some(tx) = lock(&self.close_tx).take() {
            let _ = tx.send(CloseFrame {
                code,
                reason: reason.into(),
            });
        }
        lock(&self.events).take();
        true
    }
}

impl Subscriber for Shared {
    fn try_push(&self, cmd: &JsonCommand) -> Result<(), PushError> {
        let events = lock(&self.events);
        let Some(tx) = events.as_ref() else {
            return Err(PushError::Closed);
        };
        tx.try_send(cmd.clone()).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => PushError::Full,
            mpsc::error::TrySendError::Closed(_) => PushError::Closed,
        })
    }

    fn close(&self, code: u16, reason: &str) {
        self.teardown(code, reason);
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s
    } else {
        "unknown panic"
    }
}

/// Run one connection task; a panic closes this connection and nothing else.
async fn guarded<F>(name: &'static str, shared: Arc<Shared>, fut: F)
where
    F: Future<Output = ()>,
{
    if let Err(panic) = AssertUnwindSafe(fut).catch_unwind().await {
        error!(conn = %shared.id, "Panic in {} task: {}", name, panic_message(panic.as_ref()));
        shared.teardown(CLOSE_INTERNAL_ERROR, "internal error");
    }
}

/// Drain responses and events into the socket until a close frame is
/// requested. Responses go first.
async fn write_loop<S>(
    mut sink: S,
    mut responses: mpsc::Receiver<JsonCommand>,
    mut events: mpsc::Receiver<JsonCommand>,
    mut close_rx: oneshot::Receiver<CloseFrame>,
) -> anyhow::Result<()>
where
    S: Sink<Message> + Unpin,
    S::Error: Display + Send,
{
    loop {
        let cmd = tokio::select! {
            biased;
            frame = &mut close_rx => {
                sink.send(Message::Close(frame.ok()))
                    .await
                    .map_err(|e| anyhow::anyhow!("failed to send close frame: {}", e))?;
                let _ = sink.close().await;
                return Ok(());
            }
            Some(cmd) = responses.recv() => cmd,
            Some(cmd) = events.recv() => cmd,
            else => return Ok(()),
        };
        let text = serde_json::to_string(&cmd)?;
        trace!("Sending {} bytes", text.len());
        sink.send(Message::Text(text.into()))
            .await
            .map_err(|e| anyhow::anyhow!("websocket send failed: {}", e))?;
    }
}

async fn read_loop<R, E>(
    mut stream: R,
    shared: Arc<Shared>,
    backend: Arc<dyn Backend>,
    responses: mpsc::Sender<JsonCommand>,
) where
    R: Stream<Item = Result<Message, E>> + Unpin,
    E: Display + Send,
{
    let running = Arc::new(RunningRequests::default());
    loop {
        let msg = tokio::select! {
            _ = shared.cancel.cancelled() => return,
            msg = stream.next() => msg,
        };
        match msg {
            Some(Ok(Message::Text(text))) => match serde_json::from_str::<JsonCommand>(&text) {
                Ok(cmd) => spawn_command(cmd, &shared, &backend, &running, &responses),
                Err(e) => {
                    warn!(conn = %shared.id, "Invalid command: {}", e);
                    shared.teardown(CLOSE_UNSUPPORTED, "invalid command");
                    return;
                }
            },
            Some(Ok(Message::Binary(_))) => {
                warn!(conn = %shared.id, "Binary frames are not supported");
                shared.teardown(CLOSE_UNSUPPORTED, "binary frames are not supported");
                return;
            }
            Some(Ok(Message::Close(frame))) => {
                debug!(conn = %shared.id, "Peer closed: {:?}", frame);
                shared.teardown(CLOSE_NORMAL, "closed by peer");
                return;
            }
            Some(Ok(_)) => {}
            Some(Err(e)) => {
                debug!(conn = %shared.id, "Read failed: {}", e);
                shared.teardown(CLOSE_INTERNAL_ERROR, "read error");
                return;
            }
            None => {
                shared.teardown(CLOSE_NORMAL, "connection closed");
                return;
            }
        }
    }
}

fn spawn_command(
    cmd: JsonCommand,
    shared: &Arc<Shared>,
    backend: &Arc<dyn Backend>,
    running: &Arc<RunningRequests>,
    responses: &mpsc::Sender<JsonCommand>,
) {
    let request_id = cmd.request_id;
    trace!(conn = %shared.id, request_id, "Received {:?}", cmd.command);
    let token = running.register(request_id, &shared.cancel);
    let (backend, running, responses) = (Arc::clone(backend), Arc::clone(running), responses.clone());
    tokio::spawn(guarded("command", Arc::clone(shared), async move {
        let ctx = CommandContext {
            cancel: token,
            running: &running,
        };
        let resp = backend.submit_json_command(cmd, &ctx).await;
        running.finish(request_id);
        if responses.send(resp).await.is_err() {
            debug!(request_id, "Connection closed before response was sent");
        }
    }));
}

/// Serve one frontend over an already split socket.
pub async fn serve<S, R, E>(
    sink: S,
    stream: R,
    backend: Arc<dyn Backend>,
    dispatcher: Dispatcher,
    config: ConnectionConfig,
) where
    S: Sink<Message> + Unpin + Send + 'static,
    S::Error: Display + Send,
    R: Stream<Item = Result<Message, E>> + Unpin + Send + 'static,
    E: Display + Send,
{
    let id = Uuid::new_v4();
    let (event_tx, event_rx) = mpsc::channel(config.queue_size.max(1));
    let (resp_tx, resp_rx) = mpsc::channel(config.queue_size.max(1));
    let (close_tx, close_rx) = oneshot::channel();
    let shared = Arc::new(Shared {
        id,
        cancel: CancellationToken::new(),
        dispatcher: dispatcher.clone(),
        events: Mutex::new(Some(event_tx)),
        close_tx: Mutex::new(Some(close_tx)),
        closed: AtomicBool::new(false),
    });
    dispatcher.subscribe(id, shared.clone());
    info!(conn = %id, "Frontend connected");

    // Queued before the writer starts, so it is the first frame out.
    match ClientEvent::ClientState(backend.client_state()).to_command() {
        Ok(state) => {
            let _ = resp_tx.send(state).await;
        }
        Err(e) => error!("Failed to serialize client state: {}", e),
    }

    let writer = {
        let shared = Arc::clone(&shared);
        tokio::spawn(guarded("writer", Arc::clone(&shared), async move {
            if let Err(e) = write_loop(sink, resp_rx, event_rx, close_rx).await {
                debug!(conn = %shared.id, "Writer stopped: {}", e);
                shared.teardown(CLOSE_INTERNAL_ERROR, "write error");
            }
        }))
    };

    {
        let (shared, backend, out) = (Arc::clone(&shared), Arc::clone(&backend), resp_tx.clone());
        let batch = config.initial_room_batch.max(1);
        tokio::spawn(guarded("initial data", Arc::clone(&shared), async move {
            if let Err(e) = send_initial_data(backend.as_ref(), &out, batch, &shared.cancel).await {
                warn!(conn = %shared.id, "Failed to send initial data: {}", e);
            }
        }));
    }

    guarded("reader", Arc::clone(&shared), read_loop(stream, Arc::clone(&shared), backend, resp_tx)).await;
    shared.teardown(CLOSE_NORMAL, "reader stopped");
    let _ = writer.await;
    info!(conn = %id, "Frontend disconnected");
}

/// Serve one frontend over an upgraded websocket.
pub async fn handle_socket(socket: WebSocket, backend: Arc<dyn Backend>, dispatcher: Dispatcher, config: ConnectionConfig) {
    let (sink, stream) = socket.split();
    serve(sink, stream, backend, dispatcher, config).await;
}
