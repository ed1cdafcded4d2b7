//! Insert-rate bookkeeping: a rolling window printed from the block
//! handler, and the snapshot served by `--stats`.

use std::collections::HashSet;
use std::time::{Duration, Instant};

use btcidx_primitives::Hash256;
use serde::Serialize;

/// Rolling window over block inserts. `record` returns a report once per
/// window; the caller prints it and the window resets.
pub struct StatsWindow {
    window: Duration,
    print_at: Instant,
    inserted: HashSet<Hash256>,
    bytes: u64,
    duplicates: u64,
}

impl StatsWindow {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            print_at: Instant::now() + window,
            inserted: HashSet::with_capacity(8192),
            bytes: 0,
            duplicates: 0,
        }
    }

    pub fn record(&mut self, hash: Hash256, size: usize, now: Instant) -> Option<WindowReport> {
        if self.inserted.insert(hash) {
            self.bytes += size as u64;
        } else {
            self.duplicates += 1;
        }
        if now < self.print_at {
            return None;
        }
        let report = WindowReport {
            inserted: self.inserted.len(),
            bytes: self.bytes,
            duplicates: self.duplicates,
            elapsed: self.window + now.saturating_duration_since(self.print_at),
        };
        self.inserted.clear();
        self.bytes = 0;
        self.duplicates = 0;
        self.print_at = now + self.window;
        Some(report)
    }
}

#[derive(Clone, Copy, Debug)]
pub struct WindowReport {
    pub inserted: usize,
    pub bytes: u64,
    pub duplicates: u64,
    pub elapsed: Duration,
}

#[derive(Clone, Debug, Serialize)]
pub struct StatsSnapshot {
    pub network: String,
    pub best_header_height: i64,
    pub best_header_hash: Option<String>,
    pub missing_blocks: u64,
    pub pending_blocks: usize,
    pub connected_peers: usize,
    pub good_peers: usize,
    pub bad_peers: usize,
}

pub fn human_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{value:.1} {}", UNITS[unit])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn window_reports_once_per_interval() {
        let mut window = StatsWindow::new(Duration::from_secs(10));
        let start = Instant::now();

        assert!(window.record([1; 32], 100, start).is_none());
        assert!(window.record([1; 32], 100, start).is_none());
        assert!(window.record([2; 32], 50, start).is_none());

        let report = window
            .record([3; 32], 25, start + Duration::from_secs(11))
            .expect("window elapsed");
        assert_eq!(report.inserted, 3);
        assert_eq!(report.bytes, 175);
        assert_eq!(report.duplicates, 1);

        // Counters reset for the next window.
        let late = start + Duration::from_secs(12);
        assert!(window.record([4; 32], 10, late).is_none());
    }

    #[test]
    fn human_bytes_units() {
        assert_eq!(human_bytes(512), "512 B");
        assert_eq!(human_bytes(2048), "2.0 KiB");
        assert_eq!(human_bytes(5 * 1024 * 1024), "5.0 MiB");
    }
}
