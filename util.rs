use crate::error::{Error, Result};
use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};
use lazy_static::lazy_static;
use regex::Regex;

lazy_static! {
    // Word characters are letters, numbers and underscore; combining marks
    // are dropped.
    static ref DISALLOWED_TAG_CHARS: Regex = Regex::new(r"[^\p{L}\p{N}_\- ]").unwrap();
    static ref WHITESPACE_RUN: Regex = Regex::new(r"\s+").unwrap();
}

const NAIVE_FORMATS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%d %H:%M:%S%.f",
];

/// Canonical form of a raw tag line.
///
/// Lowercases and trims, drops surrounding quotes/commas, removes anything
/// that is not a word character, hyphen or space, then collapses whitespace.
/// An empty result means the line carried no tag.
pub fn clean_tag_name(raw: &str) -> String {
    let lowered = raw.trim().to_lowercase();
    let unquoted = lowered.trim_matches(|c| matches!(c, '"' | '\'' | ','));
    let stripped = DISALLOWED_TAG_CHARS.replace_all(unquoted, "");
    let collapsed = WHITESPACE_RUN.replace_all(&stripped, " ");
    collapsed.trim().to_string()
}

/// Current UTC time as `YYYY-MM-DDTHH:MM:SS+00:00`.
pub fn utc_now_iso() -> String {
    format_utc(Utc::now())
}

pub fn format_utc(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Secs, false)
}

/// Parses an ISO-8601 timestamp; naive values are taken as UTC, offset
/// values are converted to UTC.
pub fn parse_utc_timestamp(value: &str) -> Result<DateTime<Utc>> {
    let value = value.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(value) {
        return Ok(ts.with_timezone(&Utc));
    }
    NAIVE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(value, fmt).ok())
        .map(|naive| naive.and_utc())
        .ok_or_else(|| Error::Timestamp(value.to_string()))
}

/// Flag semantics shared by `FORCE_REBUILD` and the `force` query switch:
/// anything except `""`, `0`, `false`, `no`, `off` (any case) is on.
pub fn is_truthy(value: &str) -> bool {
    !matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "" | "0" | "false" | "no" | "off"
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn clean_tag_strips_noise() {
        assert_eq!(clean_tag_name("  \"Power Cable\", "), "power cable");
        assert_eq!(clean_tag_name("- USB-C  charger!!"), "- usb-c charger");
        assert_eq!(clean_tag_name("snake_case\tthing"), "snake_casething");
        assert_eq!(clean_tag_name("multiple    spaces   here"), "multiple spaces here");
        assert_eq!(clean_tag_name("```json"), "json");
    }

    #[test]
    fn clean_tag_drops_combining_marks() {
        // 'İ' lowercases to 'i' plus U+0307 COMBINING DOT ABOVE.
        assert_eq!(clean_tag_name("İstanbul"), "istanbul");
        assert_eq!(clean_tag_name("cafe\u{301} table"), "cafe table");
        assert_eq!(clean_tag_name("Ünïcödé ²"), "ünïcödé ²");
    }

    #[test]
    fn clean_tag_discards_symbol_only_lines() {
        assert_eq!(clean_tag_name(""), "");
        assert_eq!(clean_tag_name("   "), "");
        assert_eq!(clean_tag_name("[{}]"), "");
        assert_eq!(clean_tag_name("\",\""), "");
    }

    #[test]
    fn clean_tag_is_idempotent() {
        let samples = [
            "Cable",
            "  \"Power Strip\",",
            "{\"item\": \"Lamp\"}",
            "  Ünïcödé   Tàg  ",
            "a - b _ c",
            "İstanbul",
            "tab\there",
            "'quoted'",
            "100% cotton",
            "",
        ];
        for sample in samples {
            let once = clean_tag_name(sample);
            assert_eq!(clean_tag_name(&once), once, "not idempotent for {sample:?}");
        }
    }

    #[test]
    fn timestamps_normalize_to_utc() {
        let expected = Utc.with_ymd_and_hms(2025, 5, 6, 12, 0, 0).unwrap();
        assert_eq!(parse_utc_timestamp("2025-05-06T12:00:00+00:00").unwrap(), expected);
        assert_eq!(parse_utc_timestamp("2025-05-06T14:00:00+02:00").unwrap(), expected);
        assert_eq!(parse_utc_timestamp("2025-05-06T12:00:00").unwrap(), expected);
        assert_eq!(parse_utc_timestamp("2025-05-06 12:00:00").unwrap(), expected);
        assert!(parse_utc_timestamp("yesterday").is_err());
        assert_eq!(format_utc(expected), "2025-05-06T12:00:00+00:00");
    }

    #[test]
    fn truthy_flags() {
        for flag in ["", "0", "false", "no", "off", " OFF ", "False", "NO"] {
            assert!(!is_truthy(flag), "{flag:?} should be off");
        }
        for flag in ["1", "true", "yes", "on", "anything"] {
            assert!(is_truthy(flag), "{flag:?} should be on");
        }
    }
}
