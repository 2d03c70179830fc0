//! Timestamp normalization.
//!
//! The published files mix several renderings of the same instant:
//! - `2024-01-15T10:30:00.000Z` (ISO 8601 with fraction and zone marker)
//! - `2024-01-15T10:30:00` (no zone)
//! - `2024-01-15T10:30:00+01:00` (explicit offset)
//! - `2024-01-15` (date only)
//!
//! All of them map to the canonical `YYYY-MM-DD HH:MM:SS` text the storage
//! layer casts to `TIMESTAMP`. Anything unrecognizable maps to `None`.

use chrono::{DateTime, NaiveDate, NaiveDateTime};

/// Canonical output format.
pub const CANONICAL_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

const NAIVE_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%d %H:%M",
];

/// Normalizes a source timestamp to `YYYY-MM-DD HH:MM:SS`.
///
/// Total: never panics, returns `None` for empty or unparseable input.
/// Explicit offsets are converted to UTC; a bare trailing `Z` is treated
/// the same way. Sub-second fractions are truncated. Date-only values map
/// to midnight.
#[must_use]
pub fn normalize_timestamp(input: &str) -> Option<String> {
    let s = input.trim();
    if s.is_empty() {
        return None;
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.naive_utc().format(CANONICAL_FORMAT).to_string());
    }

    let cleaned = s.replacen('T', " ", 1);
    let cleaned = cleaned.trim_end_matches(['Z', 'z']);

    for format in NAIVE_FORMATS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(cleaned, format) {
            return Some(naive.format(CANONICAL_FORMAT).to_string());
        }
    }

    if let Ok(date) = NaiveDate::parse_from_str(cleaned, "%Y-%m-%d") {
        return date
            .and_hms_opt(0, 0, 0)
            .map(|dt| dt.format(CANONICAL_FORMAT).to_string());
    }

    None
}

/// [`normalize_timestamp`] over an optional input.
#[must_use]
pub fn normalize_opt(input: Option<&str>) -> Option<String> {
    input.and_then(normalize_timestamp)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_fraction_and_zone_marker() {
        assert_eq!(
            normalize_timestamp("2024-01-02T03:04:05.123Z").as_deref(),
            Some("2024-01-02 03:04:05")
        );
    }

    #[test]
    fn replaces_t_separator() {
        assert_eq!(
            normalize_timestamp("2024-01-02T03:04:05").as_deref(),
            Some("2024-01-02 03:04:05")
        );
    }

    #[test]
    fn keeps_canonical_input() {
        assert_eq!(
            normalize_timestamp("2024-01-02 03:04:05").as_deref(),
            Some("2024-01-02 03:04:05")
        );
    }

    #[test]
    fn fraction_without_zone() {
        assert_eq!(
            normalize_timestamp("2019-11-30T14:00:59.999").as_deref(),
            Some("2019-11-30 14:00:59")
        );
    }

    #[test]
    fn converts_explicit_offset_to_utc() {
        assert_eq!(
            normalize_timestamp("2024-06-01T10:00:00+01:00").as_deref(),
            Some("2024-06-01 09:00:00")
        );
    }

    #[test]
    fn date_only_maps_to_midnight() {
        assert_eq!(
            normalize_timestamp("2010-05-01").as_deref(),
            Some("2010-05-01 00:00:00")
        );
    }

    #[test]
    fn empty_and_garbage_map_to_none() {
        assert_eq!(normalize_timestamp(""), None);
        assert_eq!(normalize_timestamp("   "), None);
        assert_eq!(normalize_timestamp("not a date"), None);
        assert_eq!(normalize_timestamp("2024-13-45T99:99:99"), None);
        assert_eq!(normalize_opt(None), None);
    }
}
