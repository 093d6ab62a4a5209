use std::time::Duration;

use async_trait::async_trait;
use reqwest::{RequestBuilder, Url};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use tracing::{debug, trace};

use murmur_types::ids::{EventId, RoomId};

use crate::protocol::{MessagesResponse, ProtocolClient, RawEvent, RemoteError, SyncResponse};

const CLIENT_API_PREFIX: [&str; 3] = ["_matrix", "client", "v3"];

/// `ProtocolClient` speaking the client-server HTTP API with a fixed access token.
pub struct HttpProtocolClient {
    http: reqwest::Client,
    base_url: Url,
    access_token: String,
}

#[derive(Deserialize)]
struct ErrorBody {
    #[serde(default)]
    errcode: String,
    #[serde(default)]
    error: String,
}

#[derive(Deserialize)]
struct MembersResponse {
    #[serde(default)]
    chunk: Vec<RawEvent>,
}

impl HttpProtocolClient {
    pub fn new(homeserver_url: &str, access_token: String) -> Result<Self, RemoteError> {
        let base_url = Url::parse(homeserver_url).map_err(|e| RemoteError::Url(e.to_string()))?;
        if base_url.cannot_be_a_base() {
            return Err(RemoteError::Url(homeserver_url.to_owned()));
        }
        let http = reqwest::Client::builder()
            .user_agent(concat!("murmur/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            http,
            base_url,
            access_token,
        })
    }

    fn url(&self, segments: &[&str]) -> Result<Url, RemoteError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| RemoteError::Url(self.base_url.to_string()))?
            .pop_if_empty()
            .extend(CLIENT_API_PREFIX)
            .extend(segments);
        Ok(url)
    }

    async fn send<T: DeserializeOwned>(&self, req: RequestBuilder) -> Result<T, RemoteError> {
        let resp = req.bearer_auth(&self.access_token).send().await?;
        let status = resp.status();
        trace!("Homeserver responded with {}", status);
        if status.is_success() {
            return Ok(resp.json::<T>().await?);
        }
        // Error bodies are best-effort; fall back to the status line.
        let body = resp.json::<ErrorBody>().await.unwrap_or(ErrorBody {
            errcode: String::new(),
            error: status.canonical_reason().unwrap_or_default().to_owned(),
        });
        Err(RemoteError::Status {
            status: status.as_u16(),
            errcode: body.errcode,
            error: body.error,
        })
    }
}

#[async_trait]
impl ProtocolClient for HttpProtocolClient {
    async fn messages(
        &self,
        room_id: &RoomId,
        from: Option<&str>,
        limit: usize,
    ) -> Result<MessagesResponse, RemoteError> {
        let url = self.url(&["rooms", room_id.as_str(), "messages"])?;
        let mut query = vec![("dir", "b".to_owned()), ("limit", limit.to_string())];
        if let Some(from) = from {
            query.push(("from", from.to_owned()));
        }
        debug!("Fetching messages for {} from {:?}", room_id, from);
        self.send(self.http.get(url).query(&query)).await
    }

    async fn state(&self, room_id: &RoomId) -> Result<Vec<RawEvent>, RemoteError> {
        let url = self.url(&["rooms", room_id.as_str(), "state"])?;
        self.send(self.http.get(url)).await
    }

    async fn members(&self, room_id: &RoomId) -> Result<Vec<RawEvent>, RemoteError> {
        let url = self.url(&["rooms", room_id.as_str(), "members"])?;
        let resp: MembersResponse = self.send(self.http.get(url)).await?;
        Ok(resp.chunk)
    }

    async fn event(&self, room_id: &RoomId, event_id: &EventId) -> Result<RawEvent, RemoteError> {
        let url = self.url(&["rooms", room_id.as_str(), "event", event_id.as_str()])?;
        self.send(self.http.get(url)).await
    }

    async fn sync(&self, since: Option<&str>, timeout_ms: u64) -> Result<SyncResponse, RemoteError> {
        let url = self.url(&["sync"])?;
        let mut query = vec![("timeout", timeout_ms.to_string())];
        if let Some(since) = since {
            query.push(("since", since.to_owned()));
        }
        // Long poll: give the server room to hold the request open.
        let req = self
            .http
            .get(url)
            .query(&query)
            .timeout(Duration::from_millis(timeout_ms) + Duration::from_secs(30));
        self.send(req).await
    }
}
