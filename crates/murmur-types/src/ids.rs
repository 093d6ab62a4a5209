use std::fmt;

use serde::{Deserialize, Serialize};

/// Opaque string identifiers handed out by the remote server.
macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn as_str(&self) -> &str {
                &self.0
            }

            pub fn is_empty(&self) -> bool {
                self.0.is_empty()
            }

            pub fn into_string(self) -> String {
                self.0
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_owned())
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }
    };
}

/// Local integer identifiers assigned by the event store.
macro_rules! row_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub i64);

        impl From<i64> for $name {
            fn from(value: i64) -> Self {
                Self(value)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

string_id!(
    /// `!opaque:server` room identifier.
    RoomId
);
string_id!(
    /// `$opaque` event identifier.
    EventId
);
string_id!(
    /// `@localpart:server` user identifier.
    UserId
);
string_id!(
    /// Megolm session identifier of an encrypted event.
    SessionId
);

row_id!(
    /// Row of the `events` table. Monotonic, never reused.
    EventRowId
);
row_id!(
    /// Position in a room timeline. Prepended history gets ever smaller values,
    /// live appends ever larger ones.
    TimelineRowId
);

impl TimelineRowId {
    /// Upper bound used when paginating from the live end of a timeline.
    pub const MAX: TimelineRowId = TimelineRowId(i64::MAX);
}
