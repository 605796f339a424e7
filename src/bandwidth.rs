//! Sliding-window throughput tracking for the status line

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Cumulative byte count observed at a point in time
#[derive(Clone, Copy, Debug)]
struct Sample {
    at: Instant,
    total: u64,
}

#[derive(Debug)]
struct Window {
    samples: VecDeque<Sample>,
    /// Total carried by the newest sample that fell out of the window
    floor_total: u64,
    total: u64,
    started: Instant,
}

#[derive(Debug)]
pub struct BandwidthTracker {
    window: Duration,
    bucket: Duration,
    max_samples: usize,
    state: Mutex<Window>,
}

impl BandwidthTracker {
    /// `max_samples` buckets spread over `window`.
    pub fn new(max_samples: usize, window: Duration) -> Self {
        let max_samples = max_samples.max(1);
        BandwidthTracker {
            window,
            bucket: window / max_samples as u32,
            max_samples,
            state: Mutex::new(Window {
                samples: VecDeque::with_capacity(max_samples),
                floor_total: 0,
                total: 0,
                started: Instant::now(),
            }),
        }
    }

    pub fn add(&self, bytes: u64) {
        self.add_at(bytes, Instant::now());
    }

    fn add_at(&self, bytes: u64, now: Instant) {
        let mut w = self.state.lock();
        w.total += bytes;
        let total = w.total;

        // Coalesce into the current bucket
        match w.samples.back_mut() {
            Some(last) if now.saturating_duration_since(last.at) < self.bucket => {
                last.total = total;
            }
            _ => {
                if w.samples.len() >= self.max_samples {
                    if let Some(old) = w.samples.pop_front() {
                        w.floor_total = old.total;
                    }
                }
                w.samples.push_back(Sample { at: now, total });
            }
        }
    }

    pub fn total_bytes(&self) -> u64 {
        self.state.lock().total
    }

    pub fn bytes_per_second(&self) -> f64 {
        self.bytes_per_second_at(Instant::now())
    }

    fn bytes_per_second_at(&self, now: Instant) -> f64 {
        let mut w = self.state.lock();
        let cutoff = now.checked_sub(self.window);

        if let Some(cutoff) = cutoff {
            while w.samples.len() >= 2 && w.samples[1].at <= cutoff {
                if let Some(old) = w.samples.pop_front() {
                    w.floor_total = old.total;
                }
            }
        }

        let baseline = match (w.samples.front(), cutoff) {
            (Some(first), Some(cutoff)) if first.at <= cutoff => first.total,
            _ => w.floor_total,
        };

        let span = now.saturating_duration_since(w.started).min(self.window);
        if span.is_zero() {
            return 0.0;
        }
        (w.total - baseline) as f64 / span.as_secs_f64()
    }

    /// Human-readable current rate, e.g. `1.50 MB/s`
    pub fn describe(&self) -> String {
        format_rate(self.bytes_per_second())
    }
}

pub fn format_bytes(bytes: f64) -> String {
    const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];
    let mut value = bytes;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{value:.0} {}", UNITS[unit])
    } else {
        format!("{value:.2} {}", UNITS[unit])
    }
}

pub fn format_rate(bytes_per_second: f64) -> String {
    format!("{}/s", format_bytes(bytes_per_second))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_over_full_window() {
        let tracker = BandwidthTracker::new(100, Duration::from_secs(1));
        let start = tracker.state.lock().started;

        for i in 0..10 {
            tracker.add_at(1000, start + Duration::from_millis(100 * i + 50));
        }
        let rate = tracker.bytes_per_second_at(start + Duration::from_millis(1000));
        assert!((rate - 10_000.0).abs() < 1.0, "rate was {rate}");
    }

    #[test]
    fn rate_decays_when_traffic_stops() {
        let tracker = BandwidthTracker::new(100, Duration::from_secs(1));
        let start = tracker.state.lock().started;

        tracker.add_at(5000, start + Duration::from_millis(100));
        let later = tracker.bytes_per_second_at(start + Duration::from_secs(5));
        assert_eq!(later, 0.0);
        assert_eq!(tracker.total_bytes(), 5000);
    }

    #[test]
    fn sample_count_is_bounded() {
        let tracker = BandwidthTracker::new(4, Duration::from_secs(1));
        let start = tracker.state.lock().started;
        for i in 0..50 {
            tracker.add_at(1, start + Duration::from_millis(300 * i));
        }
        assert!(tracker.state.lock().samples.len() <= 4);
    }

    #[test]
    fn idle_tracker_describes_zero_rate() {
        let tracker = BandwidthTracker::new(10, Duration::from_secs(1));
        assert_eq!(tracker.describe(), "0 B/s");
    }

    #[test]
    fn formats_units() {
        assert_eq!(format_bytes(512.0), "512 B");
        assert_eq!(format_bytes(1536.0), "1.50 KB");
        assert_eq!(format_rate(3.0 * 1024.0 * 1024.0), "3.00 MB/s");
    }
}
