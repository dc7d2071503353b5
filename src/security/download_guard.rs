//! Concurrency and slow-download protection for the download route.
//!
//! Download slots are far more expensive than plain connections, so an IP
//! that opens more than a handful at once is blocked outright. While a
//! download streams, its throughput is sampled at most once per interval;
//! slow samples are recorded but only the one-shot duration watchdog can
//! turn slowness into a block.

use dashmap::DashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::time::Instant;

use crate::config::DownloadGuardConfig;
use crate::security::clock::{retry_after_secs, Clock};
use crate::security::Blocked;

/// Per-IP download accounting.
#[derive(Debug, Clone)]
pub struct DownloadTracker {
    pub active_downloads: u32,
    pub slow_download_events: u32,
    pub total_bytes_transferred: u64,
    pub download_start_time: Instant,
    pub last_sample_time: Instant,
    pub current_rate: f64,
    pub last_activity: Instant,
    pub blocked: bool,
    pub blocked_until: Option<Instant>,
}

impl DownloadTracker {
    fn new(now: Instant) -> Self {
        Self {
            active_downloads: 0,
            slow_download_events: 0,
            total_bytes_transferred: 0,
            download_start_time: now,
            last_sample_time: now,
            current_rate: 0.0,
            last_activity: now,
            blocked: false,
            blocked_until: None,
        }
    }

    fn check_block(&mut self, now: Instant) -> Option<Instant> {
        if !self.blocked {
            return None;
        }
        match self.blocked_until {
            Some(until) if now < until => Some(until),
            _ => {
                self.blocked = false;
                self.blocked_until = None;
                None
            }
        }
    }
}

#[derive(Debug)]
pub struct DownloadGuard {
    trackers: DashMap<IpAddr, DownloadTracker>,
    config: DownloadGuardConfig,
    clock: Arc<dyn Clock>,
}

impl DownloadGuard {
    pub fn new(config: DownloadGuardConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            trackers: DashMap::new(),
            config,
            clock,
        }
    }

    pub fn config(&self) -> &DownloadGuardConfig {
        &self.config
    }

    /// Start a download for `ip`.
    ///
    /// Exceeding the concurrency cap blocks the IP immediately.
    pub fn begin(self: &Arc<Self>, ip: IpAddr) -> Result<DownloadTicket, Blocked> {
        let now = self.clock.now();
        let mut tracker = self
            .trackers
            .entry(ip)
            .or_insert_with(|| DownloadTracker::new(now));

        if let Some(until) = tracker.check_block(now) {
            return Err(Blocked {
                retry_after_secs: retry_after_secs(now, until),
            });
        }

        if tracker.active_downloads == 0 {
            tracker.download_start_time = now;
            tracker.last_sample_time = now;
            tracker.total_bytes_transferred = 0;
            tracker.current_rate = 0.0;
        }
        tracker.active_downloads += 1;
        tracker.last_activity = now;

        if tracker.active_downloads > self.config.max_concurrent {
            tracker.active_downloads -= 1;
            let until = now + self.config.block_duration();
            tracker.blocked = true;
            tracker.blocked_until = Some(until);
            tracing::warn!(
                ip = %ip,
                max_concurrent = self.config.max_concurrent,
                "Blocking IP: too many concurrent downloads"
            );
            return Err(Blocked {
                retry_after_secs: retry_after_secs(now, until),
            });
        }

        Ok(DownloadTicket {
            guard: Arc::clone(self),
            ip,
            started: now,
            bytes: Arc::new(AtomicU64::new(0)),
        })
    }

    fn record_bytes(&self, ip: IpAddr, len: u64) {
        let now = self.clock.now();
        let Some(mut tracker) = self.trackers.get_mut(&ip) else {
            return;
        };

        tracker.total_bytes_transferred += len;
        tracker.last_activity = now;

        if now.saturating_duration_since(tracker.last_sample_time) < self.config.sample_interval() {
            return;
        }

        let elapsed = now
            .saturating_duration_since(tracker.download_start_time)
            .as_secs_f64();
        if elapsed <= 0.0 {
            return;
        }
        let rate = tracker.total_bytes_transferred as f64 / elapsed;
        tracker.current_rate = rate;
        tracker.last_sample_time = now;

        if rate < self.config.slow_rate_bytes_per_sec as f64 {
            tracker.slow_download_events += 1;
            tracing::debug!(
                ip = %ip,
                rate_bps = rate,
                events = tracker.slow_download_events,
                "Slow download sample"
            );
        }
    }

    fn expire(&self, ip: IpAddr, started: Instant, bytes: u64) -> bool {
        let now = self.clock.now();
        let elapsed = now.saturating_duration_since(started).as_secs_f64();
        let rate = if elapsed > 0.0 { bytes as f64 / elapsed } else { 0.0 };
        if rate >= self.config.min_rate_bytes_per_sec as f64 {
            return false;
        }

        let mut tracker = self
            .trackers
            .entry(ip)
            .or_insert_with(|| DownloadTracker::new(now));
        tracker.blocked = true;
        tracker.blocked_until = Some(now + self.config.block_duration());
        tracing::warn!(
            ip = %ip,
            rate_bps = rate,
            elapsed_secs = elapsed,
            "Blocking IP: download exceeded duration limit at low throughput"
        );
        true
    }

    fn finish(&self, ip: IpAddr) {
        let now = self.clock.now();
        if let Some(mut tracker) = self.trackers.get_mut(&ip) {
            tracker.active_downloads = tracker.active_downloads.saturating_sub(1);
            tracker.last_activity = now;
        }
    }

    /// Purge idle, unblocked trackers with no download in flight, and clear
    /// expired blocks.
    pub fn sweep(&self) -> usize {
        let now = self.clock.now();
        let idle = self.config.idle_expiry();
        let before = self.trackers.len();

        self.trackers.retain(|_, tracker| {
            if tracker.check_block(now).is_some() || tracker.active_downloads > 0 {
                return true;
            }
            now.saturating_duration_since(tracker.last_activity) <= idle
        });

        before.saturating_sub(self.trackers.len())
    }

    pub fn snapshot(&self, ip: IpAddr) -> Option<DownloadTracker> {
        self.trackers.get(&ip).map(|t| t.clone())
    }

    pub fn tracked_ips(&self) -> usize {
        self.trackers.len()
    }

    pub fn active_downloads(&self) -> u64 {
        self.trackers
            .iter()
            .map(|t| u64::from(t.active_downloads))
            .sum()
    }

    pub fn reset(&self) {
        self.trackers.clear();
    }
}

/// A running download. Dropping it frees the download slot.
#[derive(Debug)]
pub struct DownloadTicket {
    guard: Arc<DownloadGuard>,
    ip: IpAddr,
    started: Instant,
    bytes: Arc<AtomicU64>,
}

impl DownloadTicket {
    pub fn ip(&self) -> IpAddr {
        self.ip
    }

    /// Account an emitted chunk.
    pub fn record_chunk(&self, len: usize) {
        self.bytes.fetch_add(len as u64, Ordering::Relaxed);
        self.guard.record_bytes(self.ip, len as u64);
    }

    pub fn bytes_sent(&self) -> u64 {
        self.bytes.load(Ordering::Relaxed)
    }

    /// A handle the duration watchdog uses to judge this download.
    pub fn probe(&self) -> DownloadProbe {
        DownloadProbe {
            guard: Arc::clone(&self.guard),
            ip: self.ip,
            started: self.started,
            bytes: Arc::clone(&self.bytes),
        }
    }
}

impl Drop for DownloadTicket {
    fn drop(&mut self) {
        self.guard.finish(self.ip);
    }
}

/// Read-only view of a download for the duration watchdog.
#[derive(Debug, Clone)]
pub struct DownloadProbe {
    guard: Arc<DownloadGuard>,
    ip: IpAddr,
    started: Instant,
    bytes: Arc<AtomicU64>,
}

impl DownloadProbe {
    pub fn ip(&self) -> IpAddr {
        self.ip
    }

    /// Judge the download once its duration limit is reached.
    ///
    /// Returns true (and blocks the IP) when its average rate is too low.
    pub fn expire(&self) -> bool {
        self.guard
            .expire(self.ip, self.started, self.bytes.load(Ordering::Relaxed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::security::clock::ManualClock;
    use std::time::Duration;

    fn guard() -> (Arc<DownloadGuard>, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new());
        let guard = Arc::new(DownloadGuard::new(
            DownloadGuardConfig::default(),
            clock.clone(),
        ));
        (guard, clock)
    }

    fn ip() -> IpAddr {
        "192.0.2.44".parse().unwrap()
    }

    #[test]
    fn sixth_concurrent_download_blocks() {
        let (guard, clock) = guard();
        let held: Vec<_> = (0..5).map(|_| guard.begin(ip()).unwrap()).collect();

        let blocked = guard.begin(ip()).unwrap_err();
        assert_eq!(blocked.retry_after_secs, 300);
        assert_eq!(guard.snapshot(ip()).unwrap().active_downloads, 5);

        drop(held);
        assert!(guard.begin(ip()).is_err());

        clock.advance(Duration::from_secs(300));
        assert!(guard.begin(ip()).is_ok());
    }

    #[test]
    fn samples_rate_at_most_once_per_interval() {
        let (guard, clock) = guard();
        let ticket = guard.begin(ip()).unwrap();

        clock.advance(Duration::from_secs(2));
        ticket.record_chunk(100);
        let tracker = guard.snapshot(ip()).unwrap();
        assert_eq!(tracker.current_rate, 50.0);
        assert_eq!(tracker.slow_download_events, 1);

        clock.advance(Duration::from_millis(500));
        ticket.record_chunk(10_000);
        let tracker = guard.snapshot(ip()).unwrap();
        assert_eq!(tracker.current_rate, 50.0);
        assert_eq!(tracker.total_bytes_transferred, 10_100);
        assert_eq!(ticket.bytes_sent(), 10_100);
    }

    #[test]
    fn slow_samples_alone_do_not_block() {
        let (guard, clock) = guard();
        let ticket = guard.begin(ip()).unwrap();
        for _ in 0..10 {
            clock.advance(Duration::from_secs(2));
            ticket.record_chunk(1);
        }
        assert_eq!(guard.snapshot(ip()).unwrap().slow_download_events, 10);
        drop(ticket);
        assert!(guard.begin(ip()).is_ok());
    }

    #[test]
    fn watchdog_blocks_slow_downloads_only() {
        let (guard, clock) = guard();
        let fast = guard.begin(ip()).unwrap();
        let slow_ip: IpAddr = "192.0.2.45".parse().unwrap();
        let slow = guard.begin(slow_ip).unwrap();

        clock.advance(Duration::from_secs(3600));
        fast.record_chunk(3600 * 1024);
        slow.record_chunk(3600 * 100);

        assert!(!fast.probe().expire());
        assert!(slow.probe().expire());
        drop(slow);
        assert_eq!(guard.begin(slow_ip).unwrap_err().retry_after_secs, 300);
    }

    #[test]
    fn sweep_uses_longer_idle_window() {
        let (guard, clock) = guard();
        drop(guard.begin(ip()).unwrap());

        clock.advance(Duration::from_secs(20 * 60));
        assert_eq!(guard.sweep(), 0);

        clock.advance(Duration::from_secs(11 * 60));
        assert_eq!(guard.sweep(), 1);
        assert_eq!(guard.tracked_ips(), 0);
    }

    #[test]
    fn sweep_keeps_stalled_download_for_the_watchdog() {
        let (guard, clock) = guard();
        let stalled = guard.begin(ip()).unwrap();

        clock.advance(Duration::from_secs(40 * 60));
        assert_eq!(guard.sweep(), 0);
        assert_eq!(guard.snapshot(ip()).unwrap().active_downloads, 1);

        clock.advance(Duration::from_secs(20 * 60));
        assert!(stalled.probe().expire());
        assert!(guard.snapshot(ip()).unwrap().blocked);
    }
}
