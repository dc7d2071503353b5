//! Fixed-window rate limiting.
//!
//! Two independent budgets are kept per client IP:
//! - general: every request except downloads
//! - downloads: download attempts, where attempts that stream to completion
//!   hand their slot back

use axum::{
    body::Body,
    extract::{Request, State},
    middleware::Next,
    response::{IntoResponse, Response},
};
use dashmap::DashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use crate::config::RateLimitConfig;
use crate::http::request::{is_download_request, ClientIp};
use crate::http::response::ApiError;
use crate::observability::metrics;
use crate::security::clock::{retry_after_secs, Clock};

/// Rejection issued when a window is exhausted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimited {
    /// Seconds until the current window closes, rounded up.
    pub retry_after_secs: u64,
}

#[derive(Debug, Clone, Copy)]
struct Window {
    started: Instant,
    count: u32,
}

/// Identifies the window an admitted request was counted in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowSlot {
    started: Instant,
}

/// A per-IP fixed-window counter.
#[derive(Debug)]
pub struct FixedWindowLimiter {
    name: &'static str,
    windows: DashMap<IpAddr, Window>,
    max_requests: u32,
    window: Duration,
    clock: Arc<dyn Clock>,
}

impl FixedWindowLimiter {
    pub fn new(
        name: &'static str,
        max_requests: u32,
        window: Duration,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            name,
            windows: DashMap::new(),
            max_requests,
            window,
            clock,
        }
    }

    /// Count a request against `ip`'s current window.
    pub fn check(&self, ip: IpAddr) -> Result<WindowSlot, RateLimited> {
        let now = self.clock.now();
        let mut entry = self.windows.entry(ip).or_insert(Window {
            started: now,
            count: 0,
        });

        if now.saturating_duration_since(entry.started) >= self.window {
            entry.started = now;
            entry.count = 0;
        }

        entry.count = entry.count.saturating_add(1);
        if entry.count > self.max_requests {
            return Err(RateLimited {
                retry_after_secs: retry_after_secs(now, entry.started + self.window),
            });
        }

        Ok(WindowSlot {
            started: entry.started,
        })
    }

    /// Hand a slot back, provided its window is still the current one.
    pub fn refund(&self, ip: IpAddr, slot: WindowSlot) {
        if let Some(mut entry) = self.windows.get_mut(&ip) {
            if entry.started == slot.started {
                entry.count = entry.count.saturating_sub(1);
            }
        }
    }

    /// Drop windows that have already closed.
    pub fn sweep(&self) -> usize {
        let now = self.clock.now();
        let before = self.windows.len();
        self.windows
            .retain(|_, w| now.saturating_duration_since(w.started) < self.window);
        before.saturating_sub(self.windows.len())
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn tracked_ips(&self) -> usize {
        self.windows.len()
    }

    pub fn reset(&self) {
        self.windows.clear();
    }
}

/// The general and download budgets together.
#[derive(Debug)]
pub struct RateLimiter {
    general: FixedWindowLimiter,
    downloads: FixedWindowLimiter,
}

impl RateLimiter {
    pub fn new(config: &RateLimitConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            general: FixedWindowLimiter::new(
                "general",
                config.general_max_requests,
                config.window(),
                Arc::clone(&clock),
            ),
            downloads: FixedWindowLimiter::new(
                "download",
                config.download_max_attempts,
                config.window(),
                clock,
            ),
        }
    }

    pub fn check_general(&self, ip: IpAddr) -> Result<(), RateLimited> {
        self.general.check(ip).map(|_| ())
    }

    /// Count a download attempt. Call [`DownloadAttempt::succeed`] once the
    /// file has been sent in full so the attempt does not consume quota.
    pub fn begin_download(self: &Arc<Self>, ip: IpAddr) -> Result<DownloadAttempt, RateLimited> {
        let slot = self.downloads.check(ip)?;
        Ok(DownloadAttempt {
            limiter: Arc::clone(self),
            ip,
            slot,
        })
    }

    pub fn sweep(&self) -> usize {
        self.general.sweep() + self.downloads.sweep()
    }

    pub fn general(&self) -> &FixedWindowLimiter {
        &self.general
    }

    pub fn downloads(&self) -> &FixedWindowLimiter {
        &self.downloads
    }

    pub fn reset(&self) {
        self.general.reset();
        self.downloads.reset();
    }
}

/// A counted download attempt.
#[derive(Debug)]
pub struct DownloadAttempt {
    limiter: Arc<RateLimiter>,
    ip: IpAddr,
    slot: WindowSlot,
}

impl DownloadAttempt {
    /// The download completed; return its slot.
    pub fn succeed(self) {
        self.limiter.downloads.refund(self.ip, self.slot);
    }
}

/// Middleware applying the general budget to every request but downloads,
/// which are governed by the download budget alone.
pub async fn rate_limit_middleware(
    State(limiter): State<Arc<RateLimiter>>,
    request: Request<Body>,
    next: Next,
) -> Response {
    if is_download_request(request.method(), request.uri().path()) {
        return next.run(request).await;
    }

    let ip = ClientIp::from_request(&request);
    match limiter.check_general(ip) {
        Ok(()) => next.run(request).await,
        Err(limited) => {
            tracing::warn!(
                ip = %ip,
                path = %request.uri().path(),
                retry_after = limited.retry_after_secs,
                "Rate limit exceeded"
            );
            metrics::record_rejection("general_rate_limit");
            ApiError::rate_limited(limited.retry_after_secs).into_response()
        }
    }
}
