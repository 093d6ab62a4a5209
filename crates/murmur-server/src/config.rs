use std::fmt::Display;
use std::path::PathBuf;
use std::str::FromStr;

use anyhow::{Context, Result, anyhow};

#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub db_path: PathBuf,
    pub homeserver_url: String,
    pub access_token: String,
    pub user_id: String,
    pub device_id: Option<String>,
    pub event_queue_size: usize,
    pub initial_room_batch: usize,
    pub max_message_size: usize,
    pub sync_timeout_ms: u64,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let required = |key: &str| {
            get(key)
                .filter(|v| !v.is_empty())
                .ok_or_else(|| anyhow!("{} must be set", key))
        };
        Ok(Self {
            host: get("MURMUR_HOST").unwrap_or_else(|| "127.0.0.1".into()),
            port: parsed(&get, "MURMUR_PORT", 29325)?,
            db_path: PathBuf::from(get("MURMUR_DB_PATH").unwrap_or_else(|| "murmur.db".into())),
            homeserver_url: required("MURMUR_HOMESERVER_URL")?,
            access_token: required("MURMUR_ACCESS_TOKEN")?,
            user_id: required("MURMUR_USER_ID")?,
            device_id: get("MURMUR_DEVICE_ID").filter(|v| !v.is_empty()),
            event_queue_size: parsed(&get, "MURMUR_EVENT_QUEUE_SIZE", 32)?,
            initial_room_batch: parsed(&get, "MURMUR_INITIAL_ROOM_BATCH", 100)?,
            max_message_size: parsed(&get, "MURMUR_MAX_MESSAGE_SIZE", 128 * 1024)?,
            sync_timeout_ms: parsed(&get, "MURMUR_SYNC_TIMEOUT_MS", 30_000)?,
        })
    }
}

fn parsed<T>(get: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: Display,
{
    match get(key) {
        Some(raw) => raw
            .parse()
            .map_err(|e| anyhow!("{}", e))
            .with_context(|| format!("invalid {}: {:?}", key, raw)),
        None => Ok(default),
    }
}
