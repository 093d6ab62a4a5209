pub mod events;
pub mod media;
pub mod rooms;
pub mod session_requests;
pub mod state;
pub mod sync_token;
pub mod timeline;

use anyhow::Result;

/// `?n, ?n+1, ...` placeholders for an `IN (...)` list starting at `first`.
pub(crate) fn placeholders(first: usize, count: usize) -> String {
    (first..first + count)
        .map(|i| format!("?{}", i))
        .collect::<Vec<_>>()
        .join(", ")
}

/// `LIMIT` argument for a row count. SQLite treats a negative limit as
/// unbounded, so counts past `i64::MAX` clamp instead of wrapping.
pub(crate) fn sql_limit(limit: usize) -> i64 {
    i64::try_from(limit).unwrap_or(i64::MAX)
}

/// Extension trait for optional query results
pub(crate) trait OptionalExt<T> {
    fn optional(self) -> Result<Option<T>>;
}

impl<T> OptionalExt<T> for std::result::Result<T, rusqlite::Error> {
    fn optional(self) -> Result<Option<T>> {
        match self {
            Ok(val) => Ok(Some(val)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn oversized_limits_clamp() {
        assert_eq!(sql_limit(5), 5);
        assert_eq!(sql_limit(usize::MAX), i64::MAX);
    }
}
