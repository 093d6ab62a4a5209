//! Request/response commands sent by frontends.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use murmur_types::api::{CancelParams, GetEventParams, GetRoomStateParams, PaginateParams, PaginateServerParams};
use murmur_types::events::JsonCommand;

use crate::Client;
use crate::error::ClientError;

/// Cancellation tokens of the commands a connection is still running,
/// keyed by request ID.
#[derive(Default)]
pub struct RunningRequests {
    tokens: Mutex<HashMap<i64, CancellationToken>>,
}

impl RunningRequests {
    fn lock(&self) -> MutexGuard<'_, HashMap<i64, CancellationToken>> {
        self.tokens.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Track a new request. Its token is a child of `parent`, so closing the
    /// connection cancels it too.
    pub fn register(&self, request_id: i64, parent: &CancellationToken) -> CancellationToken {
        let token = parent.child_token();
        self.lock().insert(request_id, token.clone());
        token
    }

    pub fn cancel(&self, request_id: i64) -> bool {
        match self.lock().get(&request_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn finish(&self, request_id: i64) {
        self.lock().remove(&request_id);
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

/// What a command needs from the connection that sent it.
pub struct CommandContext<'a> {
    pub cancel: CancellationToken,
    pub running: &'a RunningRequests,
}

fn params<T: DeserializeOwned>(data: Value) -> Result<T, ClientError> {
    serde_json::from_value(data).map_err(|e| ClientError::InvalidParams(e.to_string()))
}

fn to_data<T: Serialize>(value: T) -> Result<Value, ClientError> {
    serde_json::to_value(value).map_err(|e| ClientError::Storage(e.into()))
}

impl Client {
    /// Run one command and build its response frame. Failures become error
    /// responses carrying an `errcode`; this never fails itself.
    pub async fn submit_json_command(&self, cmd: JsonCommand, ctx: &CommandContext<'_>) -> JsonCommand {
        let request_id = cmd.request_id;
        let name = cmd.command.clone().unwrap_or_default();
        let result = tokio::select! {
            _ = ctx.cancel.cancelled() => Err(ClientError::Cancelled),
            result = self.run_command(&name, cmd.data, ctx) => result,
        };
        match result {
            Ok(data) => JsonCommand::response(request_id, data),
            Err(err) => {
                match &err {
                    ClientError::Cancelled => debug!("Command {} ({}) was cancelled", name, request_id),
                    _ => warn!("Command {} ({}) failed: {}", name, request_id, err),
                }
                JsonCommand::error(request_id, err.errcode(), err.to_string())
            }
        }
    }

    async fn run_command(&self, name: &str, data: Value, ctx: &CommandContext<'_>) -> Result<Value, ClientError> {
        match name {
            "ping" => Ok(json!({})),
            "get_state" => to_data(self.state()),
            "get_room_list" => to_data(self.room_list()),
            "cancel" => {
                let p: CancelParams = params(data)?;
                let found = ctx.running.cancel(p.request_id);
                debug!(
                    "Cancel of request {} ({}): {}",
                    p.request_id,
                    p.reason.as_deref().unwrap_or("no reason"),
                    if found { "cancelled" } else { "not running" }
                );
                Ok(json!(found))
            }
            "paginate" => {
                let p: PaginateParams = params(data)?;
                to_data(self.paginate(&p.room_id, p.max_timeline_id, p.limit, &ctx.cancel).await?)
            }
            "paginate_server" => {
                let p: PaginateServerParams = params(data)?;
                to_data(self.paginate_server(&p.room_id, p.limit, &ctx.cancel).await?)
            }
            "get_room_state" => {
                let p: GetRoomStateParams = params(data)?;
                let state = self
                    .get_room_state(&p.room_id, p.include_members, p.fetch_members, p.refetch, &ctx.cancel)
                    .await?;
                to_data(state)
            }
            "get_event" => {
                let p: GetEventParams = params(data)?;
                to_data(self.get_event(&p.room_id, &p.event_id, &ctx.cancel).await?)
            }
            other => Err(ClientError::UnknownCommand(other.to_owned())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn running_requests_cancel_by_id() {
        let running = RunningRequests::default();
        let conn = CancellationToken::new();
        let a = running.register(1, &conn);
        let b = running.register(2, &conn);

        assert!(running.cancel(1));
        assert!(a.is_cancelled());
        assert!(!b.is_cancelled());
        assert!(!running.cancel(3));

        running.finish(1);
        running.finish(2);
        assert!(running.is_empty());
    }

    #[test]
    fn closing_the_connection_cancels_everything() {
        let running = RunningRequests::default();
        let conn = CancellationToken::new();
        let a = running.register(1, &conn);
        conn.cancel();
        assert!(a.is_cancelled());
        assert_eq!(running.len(), 1);
    }

    #[test]
    fn bad_params_are_invalid_params() {
        let err = params::<PaginateParams>(json!({"limit": 5})).unwrap_err();
        assert_eq!(err.errcode(), "INVALID_PARAMS");
    }

    #[test]
    fn zero_page_limit_is_invalid_params() {
        let err = params::<PaginateServerParams>(json!({"room_id": "!r:x", "limit": 0})).unwrap_err();
        assert_eq!(err.errcode(), "INVALID_PARAMS");
        let capped = params::<PaginateParams>(json!({"room_id": "!r:x", "limit": 1_000_000})).unwrap();
        assert_eq!(capped.limit, murmur_types::api::MAX_PAGE_LIMIT);
    }
}
