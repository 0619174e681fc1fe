//! Time arithmetic shared by the gate, the limiter and the retry path.

use chrono::{DateTime, Duration, NaiveTime, Utc};

use crate::defaults;
use crate::error::{Error, Result};

/// Parse an `HH:MM` time of day.
pub fn parse_time_of_day(value: &str) -> Result<NaiveTime> {
    NaiveTime::parse_from_str(value.trim(), "%H:%M")
        .map_err(|_| Error::InvalidInput(format!("expected HH:MM, got {value:?}")))
}

/// Whether `t` falls inside the quiet window `[start, end)`.
///
/// A window whose start is after its end wraps midnight. Equal bounds mean
/// no window at all.
pub fn in_quiet_window(start: NaiveTime, end: NaiveTime, t: NaiveTime) -> bool {
    if start == end {
        false
    } else if start < end {
        t >= start && t < end
    } else {
        t >= start || t < end
    }
}

/// Delay before attempt `attempt_number + 1` may be tried.
pub fn backoff_delay(attempt_number: i32) -> Duration {
    let exp = (attempt_number.max(1) - 1).min(20) as u32;
    Duration::minutes(defaults::RETRY_BASE_DELAY_MINUTES * 2_i64.pow(exp))
}

/// When a failed attempt becomes retry-eligible, `None` once the cap is hit.
pub fn retry_after(
    attempt_number: i32,
    max_retries: i32,
    failed_at: DateTime<Utc>,
) -> Option<DateTime<Utc>> {
    if attempt_number >= max_retries {
        None
    } else {
        Some(failed_at + backoff_delay(attempt_number))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).unwrap()
    }

    #[test]
    fn test_parse_time_of_day() {
        assert_eq!(parse_time_of_day("22:00").unwrap(), t(22, 0));
        assert_eq!(parse_time_of_day(" 07:30 ").unwrap(), t(7, 30));
        assert!(parse_time_of_day("25:00").is_err());
        assert!(parse_time_of_day("7pm").is_err());
    }

    #[test]
    fn test_quiet_window_wraps_midnight() {
        let (s, e) = (t(22, 0), t(7, 0));
        assert!(in_quiet_window(s, e, t(22, 0)));
        assert!(in_quiet_window(s, e, t(0, 30)));
        assert!(in_quiet_window(s, e, t(6, 59)));
        assert!(!in_quiet_window(s, e, t(7, 0)));
        assert!(!in_quiet_window(s, e, t(12, 0)));
    }

    #[test]
    fn test_quiet_window_same_day() {
        let (s, e) = (t(13, 0), t(14, 0));
        assert!(in_quiet_window(s, e, t(13, 30)));
        assert!(!in_quiet_window(s, e, t(14, 0)));
        assert!(!in_quiet_window(s, e, t(12, 59)));
    }

    #[test]
    fn test_quiet_window_empty() {
        assert!(!in_quiet_window(t(9, 0), t(9, 0), t(9, 0)));
    }

    #[test]
    fn test_backoff_doubles() {
        assert_eq!(backoff_delay(1), Duration::minutes(5));
        assert_eq!(backoff_delay(2), Duration::minutes(10));
        assert_eq!(backoff_delay(3), Duration::minutes(20));
    }

    #[test]
    fn test_retry_after_respects_cap() {
        let at = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        assert_eq!(retry_after(1, 3, at), Some(at + Duration::minutes(5)));
        assert_eq!(retry_after(2, 3, at), Some(at + Duration::minutes(10)));
        assert_eq!(retry_after(3, 3, at), None);
    }
}
