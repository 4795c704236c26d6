//! Column codecs applied at the repository edge.
//!
//! List-valued fields are stored as JSON text; timestamps are RFC 3339 text
//! written by SQLite. Domain types only ever see the decoded forms.

use crate::error::Result;
use chrono::{DateTime, Utc};
use rusqlite::types::Type;

/// Encode an optional list for storage. `None` stays SQL `NULL`.
pub fn encode_list(list: Option<&[String]>) -> Result<Option<String>> {
    list.map(serde_json::to_string)
        .transpose()
        .map_err(Into::into)
}

/// Decode a stored list column.
pub fn decode_list(idx: usize, text: Option<String>) -> rusqlite::Result<Option<Vec<String>>> {
    text.map(|s| {
        serde_json::from_str(&s)
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
    })
    .transpose()
}

/// Decode a timestamp column.
pub fn decode_timestamp(idx: usize, text: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(text)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_none_is_null() {
        assert_eq!(encode_list(None).unwrap(), None);
    }

    #[test]
    fn test_list_survives_storage_form() {
        let paths = vec!["a.txt".to_string(), "dir/b \"quoted\".png".to_string()];
        let stored = encode_list(Some(paths.as_slice())).unwrap();
        assert_eq!(decode_list(0, stored).unwrap(), Some(paths));
    }

    #[test]
    fn test_empty_list_is_not_null() {
        let stored = encode_list(Some(&[][..])).unwrap();
        assert_eq!(stored.as_deref(), Some("[]"));
        assert_eq!(decode_list(0, stored).unwrap(), Some(vec![]));
    }

    #[test]
    fn test_decode_garbage_fails() {
        assert!(decode_list(3, Some("not json".to_string())).is_err());
    }

    #[test]
    fn test_decode_sqlite_timestamp() {
        let ts = decode_timestamp(0, "2025-07-02T10:00:00.123Z").unwrap();
        assert_eq!(ts.timestamp_millis() % 1000, 123);
    }
}
