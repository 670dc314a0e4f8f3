//! SQLite helper utilities for type conversion
//!
//! SQLite doesn't natively support arrays, so list columns (genres, actors) are
//! stored as JSON text. Timestamps are stored as epoch seconds.

use chrono::Utc;
use serde::{Serialize, de::DeserializeOwned};

// ============================================================================
// Array/Vec Helpers (stored as JSON strings in SQLite)
// ============================================================================

/// Serialize a Vec to a JSON string for SQLite storage
#[inline]
pub fn vec_to_json<T: Serialize>(v: &[T]) -> String {
    serde_json::to_string(v).unwrap_or_else(|_| "[]".to_string())
}

/// Deserialize a JSON string from SQLite to a Vec
#[inline]
pub fn json_to_vec<T: DeserializeOwned>(s: &str) -> Vec<T> {
    serde_json::from_str(s).unwrap_or_default()
}

// ============================================================================
// Timestamp Helpers (stored as INTEGER epoch seconds in SQLite)
// ============================================================================

/// Current UTC time as epoch seconds
#[inline]
pub fn now_unix() -> i64 {
    Utc::now().timestamp()
}

/// Parse an RFC 3339 timestamp (as sent by Jellyfin/Emby) into epoch seconds
pub fn rfc3339_to_unix(s: &str) -> Option<i64> {
    chrono::DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|dt| dt.timestamp())
}

// ============================================================================
// Full-text Helpers
// ============================================================================

/// Prepare a user query for FTS5: every term becomes a quoted prefix match.
///
/// Returns an empty string when nothing searchable remains.
pub fn prepare_fts_query(query: &str) -> String {
    let terms: Vec<String> = query
        .split_whitespace()
        .map(|s| s.replace(['"', '\'', '*', '(', ')', ':', '^'], ""))
        .map(|s| s.replace('-', " ").trim().to_string())
        .filter(|s| !s.is_empty())
        .map(|s| format!("\"{}\"*", s))
        .collect();

    terms.join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vec_json_round_trip() {
        let genres = vec!["Drama".to_string(), "Comedy".to_string()];
        let json = vec_to_json(&genres);
        assert_eq!(json, r#"["Drama","Comedy"]"#);
        assert_eq!(json_to_vec::<String>(&json), genres);
        assert!(json_to_vec::<String>("not json").is_empty());
    }

    #[test]
    fn test_rfc3339_to_unix() {
        assert_eq!(rfc3339_to_unix("1970-01-01T00:01:00Z"), Some(60));
        assert_eq!(
            rfc3339_to_unix("2023-05-01T12:00:00.0000000Z"),
            Some(1_682_942_400)
        );
        assert_eq!(rfc3339_to_unix("yesterday"), None);
    }

    #[test]
    fn test_prepare_fts_query() {
        assert_eq!(prepare_fts_query("matrix"), "\"matrix\"*");
        assert_eq!(prepare_fts_query("  the \"matrix\" "), "\"the\"* \"matrix\"*");
        assert_eq!(prepare_fts_query("spider-man"), "\"spider man\"*");
        assert_eq!(prepare_fts_query("*** "), "");
    }
}
