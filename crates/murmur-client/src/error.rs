use thiserror::Error;

use murmur_types::ids::{EventId, RoomId};

use crate::protocol::RemoteError;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("pagination is already in progress")]
    PaginationInProgress,

    #[error("request was cancelled")]
    Cancelled,

    #[error("timeline was reset while paginating")]
    TimelineReset,

    #[error("unknown command {0:?}")]
    UnknownCommand(String),

    #[error("invalid parameters: {0}")]
    InvalidParams(String),

    #[error("room {0} not found")]
    RoomNotFound(RoomId),

    #[error("event {0} not found")]
    EventNotFound(EventId),

    #[error(transparent)]
    Remote(#[from] RemoteError),

    #[error("storage error: {0:#}")]
    Storage(anyhow::Error),

    #[error("background task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl ClientError {
    /// Stable code put in the `errcode` field of failed command responses.
    pub fn errcode(&self) -> &str {
        match self {
            Self::PaginationInProgress => "PAGINATION_IN_PROGRESS",
            Self::Cancelled => "CANCELLED",
            Self::TimelineReset => "TIMELINE_RESET",
            Self::UnknownCommand(_) => "UNKNOWN_COMMAND",
            Self::InvalidParams(_) => "INVALID_PARAMS",
            Self::RoomNotFound(_) | Self::EventNotFound(_) => "NOT_FOUND",
            Self::Remote(RemoteError::Status { errcode, .. }) if !errcode.is_empty() => errcode.as_str(),
            Self::Remote(_) => "REMOTE_ERROR",
            Self::Storage(_) => "STORAGE_ERROR",
            Self::Join(_) => "INTERNAL_ERROR",
        }
    }
}

/// Storage closures report interruptions as `ClientError` wrapped in
/// `anyhow`; unwrap those back so callers can tell them apart.
impl From<anyhow::Error> for ClientError {
    fn from(err: anyhow::Error) -> Self {
        match err.downcast::<ClientError>() {
            Ok(inner) => inner,
            Err(err) => Self::Storage(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interruption_survives_anyhow_roundtrip() {
        let wrapped: anyhow::Error = ClientError::TimelineReset.into();
        assert!(matches!(ClientError::from(wrapped), ClientError::TimelineReset));

        let storage = ClientError::from(anyhow::anyhow!("disk full"));
        assert_eq!(storage.errcode(), "STORAGE_ERROR");
    }

    #[test]
    fn remote_errcode_passes_through() {
        let err = ClientError::Remote(RemoteError::Status {
            status: 404,
            errcode: "M_NOT_FOUND".into(),
            error: "Event not found".into(),
        });
        assert_eq!(err.errcode(), "M_NOT_FOUND");
    }
}
