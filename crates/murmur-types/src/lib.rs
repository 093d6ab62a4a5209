pub mod api;
pub mod events;
pub mod ids;
pub mod models;

pub use ids::{EventId, EventRowId, RoomId, SessionId, TimelineRowId, UserId};
