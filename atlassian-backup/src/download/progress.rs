//! Throughput tracking for archive downloads.
//!
//! A line is reported every time the bytes on disk cross another multiple of
//! the log threshold, with the cumulative and the recent transfer speed.

use std::time::{Duration, Instant};

const MB: f64 = 1024.0 * 1024.0;

/// Snapshot emitted when a log threshold is crossed.
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressReport {
    /// Bytes on disk, including any prefix carried over from a resumed download
    pub bytes_on_disk: u64,

    /// Average speed over the whole download, in MB/s
    pub average_mbps: f64,

    /// Speed since the previous report of this attempt, in MB/s
    pub recent_mbps: f64,
}

impl ProgressReport {
    pub fn megabytes(&self) -> f64 {
        bytes_to_mb(self.bytes_on_disk)
    }
}

/// Progress tracker for one download attempt.
///
/// `started` is the beginning of the whole download so that the average speed
/// spans every retry; the recent-speed window restarts with each attempt.
pub struct ProgressTracker {
    started: Instant,
    last_report_time: Instant,
    last_report_bytes: u64,
    next_report_at: u64,
    log_threshold: u64,
}

impl ProgressTracker {
    pub fn new(started: Instant, bytes_on_disk: u64, log_threshold: u64) -> Self {
        let log_threshold = log_threshold.max(1);
        Self {
            started,
            last_report_time: Instant::now(),
            last_report_bytes: bytes_on_disk,
            next_report_at: next_multiple(bytes_on_disk, log_threshold),
            log_threshold,
        }
    }

    /// Record the new size on disk; returns a report when a threshold was crossed.
    pub fn update(&mut self, bytes_on_disk: u64) -> Option<ProgressReport> {
        if bytes_on_disk < self.next_report_at {
            return None;
        }

        let now = Instant::now();
        let report = ProgressReport {
            bytes_on_disk,
            average_mbps: rate(bytes_on_disk, now.duration_since(self.started)),
            recent_mbps: rate(
                bytes_on_disk.saturating_sub(self.last_report_bytes),
                now.duration_since(self.last_report_time),
            ),
        };

        self.last_report_time = now;
        self.last_report_bytes = bytes_on_disk;
        self.next_report_at = next_multiple(bytes_on_disk, self.log_threshold);
        Some(report)
    }

    /// Time since the whole download started
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }
}

/// Smallest multiple of `threshold` strictly greater than `bytes`.
fn next_multiple(bytes: u64, threshold: u64) -> u64 {
    (bytes / threshold + 1) * threshold
}

fn rate(bytes: u64, elapsed: Duration) -> f64 {
    let secs = elapsed.as_secs_f64();
    if secs > 0.0 {
        bytes_to_mb(bytes) / secs
    } else {
        0.0
    }
}

pub fn bytes_to_mb(bytes: u64) -> f64 {
    bytes as f64 / MB
}

/// Format bytes as human-readable string
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit_index = 0;

    while size >= 1024.0 && unit_index < UNITS.len() - 1 {
        size /= 1024.0;
        unit_index += 1;
    }

    format!("{:.2} {}", size, UNITS[unit_index])
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_no_report_below_threshold() {
        let mut tracker = ProgressTracker::new(Instant::now(), 0, 100);
        assert!(tracker.update(10).is_none());
        assert!(tracker.update(99).is_none());
    }

    #[test]
    fn test_report_on_each_crossed_multiple() {
        let mut tracker = ProgressTracker::new(Instant::now(), 0, 100);

        let first = tracker.update(120).unwrap();
        assert_eq!(first.bytes_on_disk, 120);
        assert!(tracker.update(150).is_none());
        assert!(tracker.update(200).is_some());
        // Jumping several thresholds at once still yields a single line
        assert!(tracker.update(550).is_some());
        assert!(tracker.update(599).is_none());
    }

    #[test]
    fn test_resumed_tracker_counts_from_existing_prefix() {
        let mut tracker = ProgressTracker::new(Instant::now(), 250, 100);
        assert!(tracker.update(280).is_none());
        assert!(tracker.update(300).is_some());
    }

    #[test]
    fn test_speeds_are_positive_after_delay() {
        let mut tracker = ProgressTracker::new(Instant::now(), 0, 1024);
        thread::sleep(Duration::from_millis(20));
        let report = tracker.update(4096).unwrap();
        assert!(report.average_mbps > 0.0);
        assert!(report.recent_mbps > 0.0);
    }

    #[test]
    fn test_zero_threshold_does_not_panic() {
        let mut tracker = ProgressTracker::new(Instant::now(), 0, 0);
        assert!(tracker.update(1).is_some());
    }

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(0), "0.00 B");
        assert_eq!(format_bytes(1023), "1023.00 B");
        assert_eq!(format_bytes(1024), "1.00 KB");
        assert_eq!(format_bytes(1024 * 1024), "1.00 MB");
        assert_eq!(format_bytes(1024 * 1024 * 1024), "1.00 GB");
    }

    #[test]
    fn test_bytes_to_mb() {
        assert!((bytes_to_mb(100 * 1024 * 1024) - 100.0).abs() < f64::EPSILON);
    }
}
