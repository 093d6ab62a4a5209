mod config;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    Router,
    extract::{State, WebSocketUpgrade},
    response::IntoResponse,
    routing::get,
};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use murmur_client::http::HttpProtocolClient;
use murmur_client::{Account, Client};
use murmur_gateway::connection::{self, CLOSE_GOING_AWAY, ConnectionConfig};
use murmur_gateway::{Backend, Dispatcher};
use murmur_types::events::ClientEvent;

use crate::config::Config;

#[derive(Clone)]
struct ServerState {
    backend: Arc<dyn Backend>,
    dispatcher: Dispatcher,
    connection: ConnectionConfig,
    max_message_size: usize,
    tracker: TaskTracker,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    // Init logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "murmur_server=debug,murmur_gateway=debug,murmur_client=debug,tower_http=debug".into()),
        )
        .init();

    let config = Config::from_env()?;

    let db = Arc::new(murmur_db::Database::open(&config.db_path)?);
    let protocol = Arc::new(HttpProtocolClient::new(&config.homeserver_url, config.access_token.clone())?);
    let account = Account {
        user_id: config.user_id.as_str().into(),
        device_id: config.device_id.clone(),
        homeserver_url: Some(config.homeserver_url.clone()),
    };

    let dispatcher = Dispatcher::new();
    let publisher = dispatcher.clone();
    let client = Client::builder(db, protocol, account)
        .event_handler(Arc::new(move |evt: ClientEvent| publisher.publish(&evt)))
        .build();

    let shutdown = CancellationToken::new();
    let sync_task = {
        let client = client.clone();
        let token = shutdown.child_token();
        let timeout = config.sync_timeout_ms;
        tokio::spawn(async move { client.run_sync_loop(timeout, token).await })
    };
    let requests_task = tokio::spawn(log_session_requests(client.clone(), shutdown.child_token()));

    let tracker = TaskTracker::new();
    let state = ServerState {
        backend: Arc::new(client),
        dispatcher: dispatcher.clone(),
        connection: ConnectionConfig {
            queue_size: config.event_queue_size,
            initial_room_batch: config.initial_room_batch,
        },
        max_message_size: config.max_message_size,
        tracker: tracker.clone(),
    };

    let app = Router::new()
        .route("/_murmur/websocket", get(ws_upgrade))
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http());

    let addr: SocketAddr = format!("{}:{}", config.host, config.port).parse()?;
    info!("murmur listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown.clone(), dispatcher))
        .await?;

    tracker.close();
    if tokio::time::timeout(Duration::from_secs(5), tracker.wait()).await.is_err() {
        warn!("{} connections did not close in time", tracker.len());
    }
    let _ = tokio::join!(sync_task, requests_task);
    info!("murmur stopped");
    Ok(())
}

async fn ws_upgrade(State(state): State<ServerState>, ws: WebSocketUpgrade) -> impl IntoResponse {
    let ServerState {
        backend,
        dispatcher,
        connection: config,
        max_message_size,
        tracker,
    } = state;
    ws.max_message_size(max_message_size)
        .on_upgrade(move |socket| tracker.track_future(connection::handle_socket(socket, backend, dispatcher, config)))
}

/// Resolves on Ctrl-C or SIGTERM after closing every frontend and stopping
/// background work.
async fn shutdown_signal(shutdown: CancellationToken, dispatcher: Dispatcher) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutting down");
    shutdown.cancel();
    dispatcher.close_all(CLOSE_GOING_AWAY, "server shutting down");
}

/// Stands in for the key-request worker: reports pending session requests
/// each time the client signals new ones.
async fn log_session_requests(client: Client, cancel: CancellationToken) {
    loop {
        let pending = tokio::select! {
            _ = cancel.cancelled() => return,
            pending = client.wait_for_session_requests(100) => pending,
        };
        match pending {
            Ok(requests) => {
                for req in requests {
                    info!(
                        room = %req.room_id,
                        session = %req.session_id,
                        "Waiting for keys from {} (min index {})",
                        req.sender,
                        req.min_index
                    );
                }
            }
            Err(e) => warn!("Failed to read session requests: {}", e),
        }
    }
}
