//! Security subsystem.
//!
//! # Data Flow
//! ```text
//! Incoming request:
//!     → connection_guard.rs (per-IP slow-loris tracking, blocks)
//!     → rate_limit.rs (general and download windows)
//!     → download_guard.rs (download route only: concurrency, throughput)
//!     → validator.rs (filename, extension, MIME, path containment)
//!     → headers.rs (download response headers)
//! ```
//!
//! # Design Decisions
//! - Defense in depth: multiple layers of protection
//! - Fail closed: reject on any security check failure
//! - No trust in client input
//! - Guard state heals itself: every block carries an expiry

pub mod clock;
pub mod connection_guard;
pub mod download_guard;
pub mod headers;
pub mod rate_limit;
pub mod validator;

pub use clock::{Clock, ManualClock, SystemClock};
pub use connection_guard::{ConnectionGuard, ConnectionTicket, ConnectionTracker, TimeoutReporter};
pub use download_guard::{DownloadGuard, DownloadProbe, DownloadTicket, DownloadTracker};
pub use rate_limit::{DownloadAttempt, FixedWindowLimiter, RateLimited, RateLimiter};

/// Rejection issued while an IP sits in a block window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Blocked {
    /// Seconds until the block expires, rounded up.
    pub retry_after_secs: u64,
}
