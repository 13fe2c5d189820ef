//! Time utilities for slotkeeper
//!
//! Session timing is wall-clock based: a session start time is persisted and
//! survives restarts, so every derived value is computed from `now()`.
//!
//! # Mock Time for Development
//!
//! In debug builds, the `SLOTKEEPER_MOCK_TIME` environment variable can be set
//! to shift the system time for all time-sensitive operations. This is useful
//! for bench-testing overstay handling without waiting out a real session.
//!
//! Format: `YYYY-MM-DD HH:MM:SS` (e.g., `2025-12-25 14:30:00`)
//!
//! Example:
//! ```bash
//! SLOTKEEPER_MOCK_TIME="2025-12-25 14:30:00" slotkeeperd
//! ```

use chrono::{DateTime, Local, NaiveDateTime, TimeZone};
use std::sync::OnceLock;

/// Environment variable name for mock time (debug builds only)
pub const MOCK_TIME_ENV_VAR: &str = "SLOTKEEPER_MOCK_TIME";

/// Format accepted by `SLOTKEEPER_MOCK_TIME`
pub const MOCK_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Cached mock time offset from the real time when the process started.
/// This allows mock time to advance naturally.
static MOCK_TIME_OFFSET: OnceLock<Option<chrono::Duration>> = OnceLock::new();

#[allow(clippy::disallowed_methods)] // This is the internal implementation that wraps Local::now()
fn get_mock_time_offset() -> Option<chrono::Duration> {
    *MOCK_TIME_OFFSET.get_or_init(|| {
        #[cfg(debug_assertions)]
        {
            if let Ok(mock_time_str) = std::env::var(MOCK_TIME_ENV_VAR) {
                return parse_mock_offset(&mock_time_str, chrono::Local::now());
            }
            None
        }
        #[cfg(not(debug_assertions))]
        {
            None
        }
    })
}

/// Offset between the requested mock time and `real_now`, or `None` if the
/// string is not in [`MOCK_TIME_FORMAT`].
fn parse_mock_offset(mock_time_str: &str, real_now: DateTime<Local>) -> Option<chrono::Duration> {
    let naive_dt = match NaiveDateTime::parse_from_str(mock_time_str, MOCK_TIME_FORMAT) {
        Ok(dt) => dt,
        Err(_) => {
            tracing::warn!(
                mock_time = %mock_time_str,
                expected_format = MOCK_TIME_FORMAT,
                "Invalid mock time format"
            );
            return None;
        }
    };

    match Local.from_local_datetime(&naive_dt).single() {
        Some(mock_dt) => {
            let offset = mock_dt.signed_duration_since(real_now);
            tracing::info!(
                mock_time = %mock_time_str,
                offset_secs = offset.num_seconds(),
                "Mock time enabled"
            );
            Some(offset)
        }
        None => {
            tracing::warn!(
                mock_time = %mock_time_str,
                "Failed to convert mock time to local timezone"
            );
            None
        }
    }
}

/// Returns whether mock time is currently active.
pub fn is_mock_time_active() -> bool {
    get_mock_time_offset().is_some()
}

/// Get the current local time, respecting mock time settings in debug builds.
///
/// In release builds, this always returns the real system time.
#[allow(clippy::disallowed_methods)] // This is the wrapper that provides mock time support
pub fn now() -> DateTime<Local> {
    let real_now = chrono::Local::now();

    if let Some(offset) = get_mock_time_offset() {
        real_now + offset
    } else {
        real_now
    }
}

/// Format a DateTime for display with full date and time.
pub fn format_datetime_full(dt: &DateTime<Local>) -> String {
    dt.format("%Y-%m-%d %H:%M:%S").to_string()
}

/// Format a whole number of minutes in human-readable form
pub fn format_minutes(minutes: u32) -> String {
    let hours = minutes / 60;
    let rest = minutes % 60;

    if hours > 0 && rest > 0 {
        format!("{}h {}m", hours, rest)
    } else if hours > 0 {
        format!("{}h", hours)
    } else {
        format!("{}m", rest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Datelike;
    use std::time::Duration;

    #[test]
    fn test_format_minutes() {
        assert_eq!(format_minutes(0), "0m");
        assert_eq!(format_minutes(45), "45m");
        assert_eq!(format_minutes(60), "1h");
        assert_eq!(format_minutes(90), "1h 30m");
    }

    #[test]
    fn test_format_datetime_full() {
        let dt = Local.with_ymd_and_hms(2025, 12, 25, 14, 30, 45).unwrap();
        assert_eq!(format_datetime_full(&dt), "2025-12-25 14:30:45");
    }

    #[test]
    fn test_now_returns_time() {
        let t = now();
        assert!(t.year() >= 2020);
        assert!(t.year() <= 2100);
    }

    #[test]
    fn test_parse_mock_offset() {
        let real_now = Local.with_ymd_and_hms(2025, 12, 25, 12, 0, 0).unwrap();
        let offset = parse_mock_offset("2025-12-25 14:30:00", real_now).unwrap();
        assert_eq!(offset.num_minutes(), 150);
    }

    #[test]
    fn test_parse_mock_offset_invalid_formats() {
        let real_now = Local.with_ymd_and_hms(2025, 12, 25, 12, 0, 0).unwrap();
        let invalid_formats = [
            "2025-12-25",
            "14:30:00",
            "2025/12/25 14:30:00",
            "2025-12-25T14:30:00",
            "",
            "not a date",
        ];

        for format_str in &invalid_formats {
            assert!(
                parse_mock_offset(format_str, real_now).is_none(),
                "Expected '{}' to be rejected",
                format_str
            );
        }
    }

    #[test]
    #[cfg(debug_assertions)]
    fn test_is_mock_time_active_in_debug() {
        // The OnceLock is process-global, so only check that the lookup is safe
        let _ = is_mock_time_active();
    }

    #[test]
    fn test_now_advances() {
        let t1 = now();
        std::thread::sleep(Duration::from_millis(20));
        let t2 = now();
        assert!(t2 > t1, "Time should advance forward");
    }
}
