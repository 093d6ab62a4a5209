pub mod commands;
pub mod decrypt;
pub mod error;
pub mod http;
pub mod paginate;
pub mod process;
pub mod protocol;
pub mod room_list;
pub mod state;
pub mod sync;

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::Notify;
use tracing::trace;

use murmur_db::Database;
use murmur_db::queries::session_requests;
use murmur_types::events::{ClientEvent, ClientState};
use murmur_types::ids::UserId;
use murmur_types::models::SessionRequest;

pub use murmur_db::queries::rooms::SortCursor;

use crate::decrypt::{Decryptor, NoopDecryptor};
use crate::error::ClientError;
use crate::paginate::PaginationInterrupter;
use crate::process::ProcessContext;
use crate::protocol::ProtocolClient;
use crate::room_list::RoomList;

/// Receives every state change the client publishes.
pub type EventHandler = Arc<dyn Fn(ClientEvent) + Send + Sync>;

/// Who the client is logged in as.
#[derive(Debug, Clone, Default)]
pub struct Account {
    pub user_id: UserId,
    pub device_id: Option<String>,
    pub homeserver_url: Option<String>,
}

pub(crate) struct ClientInner {
    pub(crate) db: Arc<Database>,
    pub(crate) protocol: Arc<dyn ProtocolClient>,
    pub(crate) decryptor: Arc<dyn Decryptor>,
    pub(crate) account: Account,
    event_handler: Option<EventHandler>,
    pub(crate) interrupter: PaginationInterrupter,
    room_list: Mutex<RoomList>,
    pub(crate) sync_lock: tokio::sync::Mutex<()>,
    request_wakeup: Notify,
}

impl ClientInner {
    pub(crate) fn process_ctx(&self) -> ProcessContext<'_> {
        ProcessContext {
            own_user: &self.account.user_id,
            decryptor: self.decryptor.as_ref(),
        }
    }

    pub(crate) fn lock_room_list(&self) -> MutexGuard<'_, RoomList> {
        self.room_list.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

pub struct ClientBuilder {
    db: Arc<Database>,
    protocol: Arc<dyn ProtocolClient>,
    account: Account,
    decryptor: Option<Arc<dyn Decryptor>>,
    event_handler: Option<EventHandler>,
}

impl ClientBuilder {
    pub fn decryptor(mut self, decryptor: Arc<dyn Decryptor>) -> Self {
        self.decryptor = Some(decryptor);
        self
    }

    pub fn event_handler(mut self, handler: EventHandler) -> Self {
        self.event_handler = Some(handler);
        self
    }

    pub fn build(self) -> Client {
        Client {
            inner: Arc::new(ClientInner {
                db: self.db,
                protocol: self.protocol,
                decryptor: self.decryptor.unwrap_or_else(|| Arc::new(NoopDecryptor)),
                account: self.account,
                event_handler: self.event_handler,
                interrupter: PaginationInterrupter::default(),
                room_list: Mutex::new(RoomList::default()),
                sync_lock: tokio::sync::Mutex::new(()),
                request_wakeup: Notify::new(),
            }),
        }
    }
}

/// The sync engine: owns the local store and the link to the homeserver.
/// Cheap to clone; every clone shares the same state.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

impl Client {
    pub fn builder(db: Arc<Database>, protocol: Arc<dyn ProtocolClient>, account: Account) -> ClientBuilder {
        ClientBuilder {
            db,
            protocol,
            account,
            decryptor: None,
            event_handler: None,
        }
    }

    pub fn state(&self) -> ClientState {
        let account = &self.inner.account;
        ClientState {
            is_logged_in: !account.user_id.is_empty(),
            user_id: (!account.user_id.is_empty()).then(|| account.user_id.clone()),
            device_id: account.device_id.clone(),
            homeserver_url: account.homeserver_url.clone(),
        }
    }

    pub fn database(&self) -> &Arc<Database> {
        &self.inner.db
    }

    pub fn is_paginating(&self, room_id: &murmur_types::ids::RoomId) -> bool {
        self.inner.interrupter.is_paginating(room_id)
    }

    /// Signal the session request consumer. A signal sent while nobody waits
    /// is kept for the next waiter.
    pub(crate) fn wakeup_request_queue(&self) {
        trace!("Waking up session request queue");
        self.inner.request_wakeup.notify_one();
    }

    /// Wait for the next wakeup, then return up to `limit` pending requests.
    pub async fn wait_for_session_requests(&self, limit: usize) -> Result<Vec<SessionRequest>, ClientError> {
        self.inner.request_wakeup.notified().await;
        self.blocking(move |inner| inner.db.with_conn(|conn| session_requests::pending(conn, limit)))
            .await
    }

    pub(crate) fn dispatch(&self, event: ClientEvent) {
        if let Some(handler) = &self.inner.event_handler {
            handler(event);
        }
    }

    /// Run a storage closure on the blocking pool.
    pub(crate) async fn blocking<F, T>(&self, f: F) -> Result<T, ClientError>
    where
        F: FnOnce(&ClientInner) -> anyhow::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let inner = Arc::clone(&self.inner);
        let result = tokio::task::spawn_blocking(move || f(&inner)).await?;
        result.map_err(ClientError::from)
    }
}
