//! Core domain model shared across the CPM pipeline crates.

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const CRATE_NAME: &str = "cpm-core";

/// One raw product row as handed over by a source adapter.
///
/// `source_id` is only unique within its origin store; it is carried as an
/// opaque string because the upstream stores mix UUID and integer keys.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawProductRecord {
    /// Identifier of the origin table/endpoint this row came from.
    pub origin: String,
    pub source_id: String,
    pub raw_name: String,
    pub created_at: Option<DateTime<Utc>>,
}

/// One emitted row of the canonical master table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CanonicalParent {
    pub parent_id: Uuid,
    pub parent_name: String,
    /// Sorted, distinct source ids of every contributing record.
    pub child_ids: Vec<String>,
    /// Sorted, distinct raw spellings of every contributing record.
    pub child_names: Vec<String>,
    /// The authored alias list for this parent, independent of what was
    /// observed in this run's data. `[parent_name]` for unmapped parents.
    pub all_possible_aliases: Vec<String>,
    /// Earliest non-null timestamp among contributing records.
    pub created_at: Option<DateTime<Utc>>,
}

/// Parse a timestamp string from any of the upstream stores.
///
/// The SQL-proxy source stringifies its timestamps and the relational
/// sources have drifted between second and sub-second precision, so this
/// accepts RFC 3339 plus the common `YYYY-MM-DD[ HH:MM:SS[.frac]]` shapes.
/// Anything else is treated as absent rather than an error.
pub fn parse_flexible_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    for fmt in ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, fmt) {
            return Some(naive.and_utc());
        }
    }
    if let Ok(date) = NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
        return Some(date.and_hms_opt(0, 0, 0)?.and_utc());
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn parses_rfc3339_and_naive_forms() {
        let expected = Utc.with_ymd_and_hms(2024, 1, 1, 12, 30, 0).single().unwrap();
        assert_eq!(
            parse_flexible_timestamp("2024-01-01T12:30:00Z"),
            Some(expected)
        );
        assert_eq!(
            parse_flexible_timestamp("2024-01-01 12:30:00"),
            Some(expected)
        );
        assert_eq!(
            parse_flexible_timestamp("2024-01-01 12:30:00.000"),
            Some(expected)
        );
    }

    #[test]
    fn parses_bare_dates_as_midnight_utc() {
        let expected = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).single().unwrap();
        assert_eq!(parse_flexible_timestamp("2024-01-01"), Some(expected));
    }

    #[test]
    fn malformed_timestamps_are_none() {
        assert_eq!(parse_flexible_timestamp(""), None);
        assert_eq!(parse_flexible_timestamp("   "), None);
        assert_eq!(parse_flexible_timestamp("not a date"), None);
        assert_eq!(parse_flexible_timestamp("2024-13-45"), None);
    }
}
