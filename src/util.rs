/// Utility helpers shared by the monitor, the sink and the venue client.
///
/// IMPORTANT:
/// - No venue-specific business logic should live here.
/// - This module must remain lightweight and deterministic.
///

use chrono::{Local, SecondsFormat};

/// Turns a market slug into something safe to use in a file name.
///
/// Examples:
/// - "will-x-win"       -> "will-x-win"
/// - "sports/nba/final" -> "sports_nba_final"
/// - "a\\b"             -> "a_b"
///
pub fn safe_file_stem(slug: &str) -> String {
    slug.replace(['/', '\\'], "_")
}

/// Current local time as ISO-8601 (microsecond precision).
pub fn now_iso() -> String {
    Local::now().to_rfc3339_opts(SecondsFormat::Micros, false)
}

/// Current local date as `YYYY-MM-DD`, used for daily log rotation.
pub fn today() -> String {
    Local::now().format("%Y-%m-%d").to_string()
}
