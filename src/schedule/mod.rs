//! Frequency-aligned rescheduling.
//!
//! Naive fixed-delay sleeping drifts: each cycle starts later by its own
//! execution time, and independently scheduled collectors end up with no
//! common phase. Instead every collector sleeps until the next exact
//! multiple of its frequency, so collectors whose frequencies divide a
//! common period produce timestamp-aligned rows.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use chrono::{DateTime, Utc};
use tracing::{debug, info};

/// Compute the next frequency-aligned wakeup, as Unix seconds.
///
/// The +1 bump keeps a wakeup that lands exactly on a multiple of
/// `frequency_secs` from double-firing or skipping a slot.
/// The result is always a multiple of `frequency_secs` and strictly
/// greater than `now_secs`.
pub fn next_aligned(now_secs: u64, frequency_secs: u64) -> u64 {
    let bumped = now_secs + 1;
    bumped - bumped % frequency_secs + frequency_secs
}

/// Sleep until the next multiple of `frequency_secs`, logging the wake time.
pub async fn sleep_until_next(name: &str, frequency_secs: u64) {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO);

    let next = next_aligned(now.as_secs(), frequency_secs);
    let sleep_for = Duration::from_secs(next).saturating_sub(now);

    info!(
        collector = name,
        wake_at = %format_unix(next),
        sleep = %human_readable_time(sleep_for),
        "scheduling next run",
    );

    tokio::time::sleep(sleep_for).await;

    debug!(collector = name, "waking up");
}

/// Current UTC time as an ISO-8601 `Z`-suffixed string, second resolution.
/// Every observation produced by one acquisition cycle shares one of these.
pub fn utc_timestamp() -> String {
    Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string()
}

/// Format a Unix-seconds instant the same way as [`utc_timestamp`].
fn format_unix(secs: u64) -> String {
    DateTime::<Utc>::from_timestamp(secs as i64, 0)
        .map(|dt| dt.format("%Y-%m-%dT%H:%M:%SZ").to_string())
        .unwrap_or_else(|| secs.to_string())
}

/// Render a duration as a short human-readable string for log lines.
fn human_readable_time(d: Duration) -> String {
    let secs = d.as_secs_f64();
    if d.as_millis() < 1000 {
        return format!("{}ms", d.as_millis());
    }
    if secs < 60.0 {
        return format!("{secs:.1}s");
    }
    let mins = secs / 60.0;
    if mins < 60.0 {
        return format!("{mins:.1}m");
    }
    format!("{:.1}h", mins / 60.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_next_aligned_is_multiple_and_greater() {
        for frequency in [1u64, 5, 60, 600, 86_400] {
            for now in [0u64, 1, 4, 5, 59, 60, 61, 299, 86_399, 1_700_000_000] {
                let next = next_aligned(now, frequency);
                assert_eq!(next % frequency, 0, "now={now} freq={frequency}");
                assert!(next > now, "now={now} freq={frequency} next={next}");
            }
        }
    }

    #[test]
    fn test_next_aligned_skips_the_boundary() {
        // Waking exactly on a boundary must schedule the slot after it.
        assert_eq!(next_aligned(60, 60), 120);
        assert_eq!(next_aligned(10, 5), 15);
    }

    #[test]
    fn test_next_aligned_mid_interval() {
        assert_eq!(next_aligned(14, 5), 20);
        assert_eq!(next_aligned(61, 60), 120);
        assert_eq!(next_aligned(0, 5), 5);
    }

    #[test]
    fn test_two_frequencies_phase_align() {
        // Collectors at 5s and 60s wake on common boundaries every 60s.
        let now = 1_700_000_123;
        let mut five = next_aligned(now, 5);
        let sixty = next_aligned(now, 60);
        while five < sixty {
            five = next_aligned(five, 5);
        }
        assert_eq!(five, sixty);
    }

    #[test]
    fn test_utc_timestamp_shape() {
        let ts = utc_timestamp();
        assert_eq!(ts.len(), 20);
        assert!(ts.ends_with('Z'));
        assert_eq!(&ts[4..5], "-");
        assert_eq!(&ts[10..11], "T");
    }

    #[test]
    fn test_format_unix() {
        assert_eq!(format_unix(0), "1970-01-01T00:00:00Z");
        assert_eq!(format_unix(1_700_000_000), "2023-11-14T22:13:20Z");
    }

    #[test]
    fn test_human_readable_time() {
        assert_eq!(human_readable_time(Duration::from_millis(42)), "42ms");
        assert_eq!(human_readable_time(Duration::from_secs(3)), "3.0s");
        assert_eq!(human_readable_time(Duration::from_secs(90)), "1.5m");
        assert_eq!(human_readable_time(Duration::from_secs(5400)), "1.5h");
    }
}
