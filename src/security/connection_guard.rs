//! Adaptive slow-loris protection for ordinary requests.
//!
//! # State Machine
//! ```text
//! Unblocked → Blocked: over adaptive threshold after grace period
//!                      and (timeout ratio > 0.5 or connections > 50)
//! Unblocked → Blocked: timeout ratio > 0.7 and more than 10 timeouts
//! Blocked → Unblocked: lazily, on the first check after the block expires
//! ```
//!
//! # Design Decisions
//! - One tracker per client IP, held in a `DashMap` so mutation is per-key exclusive
//! - New IPs get a small allowance that grows with session age, up to a hard cap
//! - The two block triggers are independent heuristics and both stay

use dashmap::DashMap;
use std::net::IpAddr;
use std::sync::Arc;
use tokio::time::Instant;

use crate::config::GuardConfig;
use crate::security::clock::{retry_after_secs, Clock};
use crate::security::Blocked;

/// Per-IP connection accounting.
#[derive(Debug, Clone)]
pub struct ConnectionTracker {
    pub active_connections: u32,
    pub slow_connections: u32,
    pub first_seen: Instant,
    pub last_activity: Instant,
    pub request_count: u64,
    pub timeout_count: u64,
    pub blocked: bool,
    pub blocked_until: Option<Instant>,
}

impl ConnectionTracker {
    fn new(now: Instant) -> Self {
        Self {
            active_connections: 0,
            slow_connections: 0,
            first_seen: now,
            last_activity: now,
            request_count: 0,
            timeout_count: 0,
            blocked: false,
            blocked_until: None,
        }
    }

    fn timeout_ratio(&self) -> f64 {
        self.timeout_count as f64 / self.request_count.max(1) as f64
    }

    fn block(&mut self, until: Instant) {
        self.blocked = true;
        self.blocked_until = Some(until);
    }

    /// Clears an expired block. Returns the remaining block if still active.
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

/// Tracks every client IP that has issued a request recently.
#[derive(Debug)]
pub struct ConnectionGuard {
    trackers: DashMap<IpAddr, ConnectionTracker>,
    config: GuardConfig,
    clock: Arc<dyn Clock>,
}

impl ConnectionGuard {
    pub fn new(config: GuardConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            trackers: DashMap::new(),
            config,
            clock,
        }
    }

    pub fn config(&self) -> &GuardConfig {
        &self.config
    }

    /// Connection allowance for a session of the given age.
    pub fn adaptive_threshold(&self, session_age_secs: u64) -> u32 {
        let grown = session_age_secs / self.config.threshold_growth_secs.max(1);
        let grown = u32::try_from(grown).unwrap_or(u32::MAX);
        grown.clamp(self.config.min_threshold, self.config.max_concurrent)
    }

    /// Admit a request from `ip`, or refuse it when the IP is blocked.
    ///
    /// The returned ticket releases the connection slot when dropped.
    pub fn admit(self: &Arc<Self>, ip: IpAddr) -> Result<ConnectionTicket, Blocked> {
        let now = self.clock.now();
        let mut tracker = self
            .trackers
            .entry(ip)
            .or_insert_with(|| ConnectionTracker::new(now));

        if let Some(until) = tracker.check_block(now) {
            return Err(Blocked {
                retry_after_secs: retry_after_secs(now, until),
            });
        }

        tracker.active_connections += 1;
        tracker.request_count += 1;
        tracker.last_activity = now;

        let elapsed = now.saturating_duration_since(tracker.first_seen);
        let threshold = self.adaptive_threshold(elapsed.as_secs());
        let ratio = tracker.timeout_ratio();

        if tracker.active_connections > threshold
            && elapsed > self.config.grace_period()
            && (ratio > self.config.timeout_ratio
                || tracker.active_connections > self.config.absolute_connection_limit)
        {
            let until = now + self.config.block_duration();
            tracker.block(until);
            tracker.active_connections -= 1;
            tracing::warn!(
                ip = %ip,
                active = tracker.active_connections + 1,
                threshold,
                timeout_ratio = ratio,
                "Blocking IP: too many concurrent connections"
            );
            return Err(Blocked {
                retry_after_secs: retry_after_secs(now, until),
            });
        }

        Ok(ConnectionTicket {
            guard: Arc::clone(self),
            ip,
        })
    }

    /// Account a receive, send or connection timeout against `ip`.
    ///
    /// Returns true when this timeout caused the IP to be blocked.
    pub fn record_timeout(&self, ip: IpAddr) -> bool {
        let now = self.clock.now();
        let Some(mut tracker) = self.trackers.get_mut(&ip) else {
            return false;
        };

        tracker.timeout_count += 1;
        tracker.slow_connections += 1;
        tracker.last_activity = now;

        let ratio = tracker.timeout_ratio();
        if !tracker.blocked
            && ratio > self.config.timeout_block_ratio
            && tracker.timeout_count > u64::from(self.config.timeout_block_min_count)
        {
            tracker.block(now + self.config.block_duration());
            tracing::warn!(
                ip = %ip,
                timeouts = tracker.timeout_count,
                requests = tracker.request_count,
                timeout_ratio = ratio,
                "Blocking IP: slow connection pattern"
            );
            return true;
        }
        false
    }

    fn release(&self, ip: IpAddr) {
        let now = self.clock.now();
        if let Some(mut tracker) = self.trackers.get_mut(&ip) {
            tracker.active_connections = tracker.active_connections.saturating_sub(1);
            tracker.last_activity = now;
        }
    }

    /// Purge idle, unblocked trackers and clear expired blocks.
    ///
    /// Trackers with live connections are kept regardless of idle time, so
    /// a long download keeps its session age and its slot accounting.
    ///
    /// Returns the number of trackers removed.
    pub fn sweep(&self) -> usize {
        let now = self.clock.now();
        let idle = self.config.idle_expiry();
        let before = self.trackers.len();

        self.trackers.retain(|_, tracker| {
            if tracker.check_block(now).is_some() || tracker.active_connections > 0 {
                return true;
            }
            now.saturating_duration_since(tracker.last_activity) <= idle
        });

        before.saturating_sub(self.trackers.len())
    }

    /// Copy of the tracker for `ip`, if one exists.
    pub fn snapshot(&self, ip: IpAddr) -> Option<ConnectionTracker> {
        self.trackers.get(&ip).map(|t| t.clone())
    }

    pub fn tracked_ips(&self) -> usize {
        self.trackers.len()
    }

    /// Forget every tracked IP.
    pub fn reset(&self) {
        self.trackers.clear();
    }
}

/// An admitted request. Dropping it releases the connection slot.
#[derive(Debug)]
pub struct ConnectionTicket {
    guard: Arc<ConnectionGuard>,
    ip: IpAddr,
}

impl ConnectionTicket {
    pub fn ip(&self) -> IpAddr {
        self.ip
    }

    /// Account a timeout on this request's IP.
    pub fn record_timeout(&self) -> bool {
        self.guard.record_timeout(self.ip)
    }

    /// A handle for timers that outlive a borrow of the ticket.
    pub fn timeout_reporter(&self) -> TimeoutReporter {
        TimeoutReporter {
            guard: Arc::clone(&self.guard),
            ip: self.ip,
        }
    }
}

/// Records timeouts against an IP without holding its connection slot.
#[derive(Debug, Clone)]
pub struct TimeoutReporter {
    guard: Arc<ConnectionGuard>,
    ip: IpAddr,
}

impl TimeoutReporter {
    pub fn ip(&self) -> IpAddr {
        self.ip
    }

    pub fn record(&self) -> bool {
        self.guard.record_timeout(self.ip)
    }
}

impl Drop for ConnectionTicket {
    fn drop(&mut self) {
        self.guard.release(self.ip);
    }
}
