use serde::{Deserialize, Deserializer, Serialize, de};

use crate::ids::{EventId, RoomId, TimelineRowId};
use crate::models::Event;

// -- Pagination --

#[derive(Debug, Clone, Deserialize)]
pub struct PaginateParams {
    pub room_id: RoomId,
    #[serde(default = "max_timeline_id")]
    pub max_timeline_id: TimelineRowId,
    #[serde(default = "default_limit", deserialize_with = "page_limit")]
    pub limit: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PaginateServerParams {
    pub room_id: RoomId,
    #[serde(default = "default_limit", deserialize_with = "page_limit")]
    pub limit: usize,
}

fn max_timeline_id() -> TimelineRowId {
    TimelineRowId::MAX
}

/// Largest page a frontend may ask for; bigger requests are capped.
pub const MAX_PAGE_LIMIT: usize = 1000;

fn default_limit() -> usize {
    50
}

fn page_limit<'de, D: Deserializer<'de>>(deserializer: D) -> Result<usize, D::Error> {
    let limit = usize::deserialize(deserializer)?;
    if limit == 0 {
        return Err(de::Error::custom("limit must be at least 1"));
    }
    Ok(limit.min(MAX_PAGE_LIMIT))
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaginationResponse {
    pub events: Vec<Event>,
    pub has_more: bool,
}

impl PaginationResponse {
    pub fn exhausted() -> Self {
        Self {
            events: Vec::new(),
            has_more: false,
        }
    }
}

// -- Room state --

#[derive(Debug, Clone, Deserialize)]
pub struct GetRoomStateParams {
    pub room_id: RoomId,
    #[serde(default)]
    pub include_members: bool,
    #[serde(default)]
    pub fetch_members: bool,
    #[serde(default)]
    pub refetch: bool,
}

// -- Events --

#[derive(Debug, Clone, Deserialize)]
pub struct GetEventParams {
    pub room_id: RoomId,
    pub event_id: EventId,
}

// -- Misc --

#[derive(Debug, Clone, Deserialize)]
pub struct CancelParams {
    pub request_id: i64,
    #[serde(default)]
    pub reason: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn page_limit_defaults_and_caps() {
        let p: PaginateParams = serde_json::from_value(json!({"room_id": "!r:x"})).unwrap();
        assert_eq!(p.limit, 50);
        assert_eq!(p.max_timeline_id, TimelineRowId::MAX);

        let p: PaginateServerParams = serde_json::from_value(json!({"room_id": "!r:x", "limit": u64::MAX})).unwrap();
        assert_eq!(p.limit, MAX_PAGE_LIMIT);
    }

    #[test]
    fn zero_page_limit_is_rejected() {
        let err = serde_json::from_value::<PaginateParams>(json!({"room_id": "!r:x", "limit": 0})).unwrap_err();
        assert!(err.to_string().contains("at least 1"));
        assert!(serde_json::from_value::<PaginateServerParams>(json!({"room_id": "!r:x", "limit": 0})).is_err());
    }
}
