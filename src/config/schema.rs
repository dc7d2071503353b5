//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the snapshot server.
//! All types derive Serde traits for deserialization from config files, and every
//! section falls back to the production thresholds when omitted.

use serde::{Deserialize, Serialize};
use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

/// Root configuration for the snapshot server.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct ServerConfig {
    /// Listener configuration (public host, port, connection cap).
    pub listener: ListenerConfig,

    /// Where snapshot archives live.
    pub storage: StorageConfig,

    /// Download throughput settings.
    pub streaming: StreamingConfig,

    /// Slow-loris protection for ordinary requests.
    pub guard: GuardConfig,

    /// Concurrency and slow-download protection for the download route.
    pub downloads: DownloadGuardConfig,

    /// Fixed-window rate limiting.
    pub rate_limit: RateLimitConfig,

    /// Pre-routing request limits.
    pub limits: RequestLimits,

    /// Observability settings.
    pub observability: ObservabilityConfig,

    /// Deployment environment; controls error message exposure.
    pub environment: Environment,
}

/// Deployment environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    #[default]
    Development,
    Production,
}

impl Environment {
    pub fn is_production(&self) -> bool {
        matches!(self, Environment::Production)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Environment::Development => "development",
            Environment::Production => "production",
        }
    }
}

/// Listener configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Public host name used when building download URLs.
    pub host: String,

    /// Port to listen on (all interfaces).
    pub port: u16,

    /// Maximum concurrent connections (backpressure).
    pub max_connections: usize,
}

impl ListenerConfig {
    /// The socket address the server binds to. Always all interfaces.
    pub fn bind_address(&self) -> SocketAddr {
        SocketAddr::from((Ipv4Addr::UNSPECIFIED, self.port))
    }
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 3000,
            max_connections: 10_000,
        }
    }
}

/// Snapshot storage configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Directory scanned for snapshot archives.
    pub backup_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backup_dir: PathBuf::from("./backups"),
        }
    }
}

/// Download throughput configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct StreamingConfig {
    /// Byte-rate ceiling applied to every download stream.
    pub max_bytes_per_sec: u64,

    /// Upper bound on the size of a single emitted chunk.
    pub chunk_size: usize,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            max_bytes_per_sec: 10 * 1024 * 1024,
            chunk_size: 64 * 1024,
        }
    }
}

/// Thresholds for the per-IP slow-loris tracker.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct GuardConfig {
    /// Hard ceiling on the adaptive connection threshold.
    pub max_concurrent: u32,

    /// Allowance granted to a newly seen IP.
    pub min_threshold: u32,

    /// The adaptive threshold grows by one per this many seconds of session age.
    pub threshold_growth_secs: u64,

    /// No connection-count block is applied before this session age.
    pub grace_period_secs: u64,

    /// Timeout ratio above which an over-threshold IP is blocked.
    pub timeout_ratio: f64,

    /// Connection count above which an over-threshold IP is blocked regardless of ratio.
    pub absolute_connection_limit: u32,

    /// Timeout ratio for the timeout-driven block trigger.
    pub timeout_block_ratio: f64,

    /// Minimum timeout count for the timeout-driven block trigger.
    pub timeout_block_min_count: u32,

    /// How long a blocked IP stays blocked.
    pub block_duration_secs: u64,

    /// Request receive timeout.
    pub receive_timeout_secs: u64,

    /// Response send (idle) timeout.
    pub send_timeout_secs: u64,

    /// Hard connection idle timeout.
    pub connection_timeout_secs: u64,

    /// Trackers idle for this long are purged by the sweep.
    pub idle_expiry_secs: u64,

    /// Interval between sweeps.
    pub sweep_interval_secs: u64,
}

impl GuardConfig {
    pub fn block_duration(&self) -> Duration {
        Duration::from_secs(self.block_duration_secs)
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_secs(self.grace_period_secs)
    }

    pub fn receive_timeout(&self) -> Duration {
        Duration::from_secs(self.receive_timeout_secs)
    }

    pub fn send_timeout(&self) -> Duration {
        Duration::from_secs(self.send_timeout_secs)
    }

    pub fn connection_timeout(&self) -> Duration {
        Duration::from_secs(self.connection_timeout_secs)
    }

    pub fn idle_expiry(&self) -> Duration {
        Duration::from_secs(self.idle_expiry_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 100,
            min_threshold: 20,
            threshold_growth_secs: 5,
            grace_period_secs: 30,
            timeout_ratio: 0.5,
            absolute_connection_limit: 50,
            timeout_block_ratio: 0.7,
            timeout_block_min_count: 10,
            block_duration_secs: 10 * 60,
            receive_timeout_secs: 60,
            send_timeout_secs: 120,
            connection_timeout_secs: 300,
            idle_expiry_secs: 10 * 60,
            sweep_interval_secs: 30,
        }
    }
}

/// Thresholds for the per-IP download tracker.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct DownloadGuardConfig {
    /// Concurrent downloads per IP before the IP is blocked.
    pub max_concurrent: u32,

    /// How long a blocked IP stays blocked.
    pub block_duration_secs: u64,

    /// Sampled rates below this are recorded as slow-download events.
    pub slow_rate_bytes_per_sec: u64,

    /// Rate the duration watchdog requires once it fires.
    pub min_rate_bytes_per_sec: u64,

    /// When the one-shot duration watchdog fires.
    pub max_duration_secs: u64,

    /// Minimum spacing between rate samples.
    pub sample_interval_millis: u64,

    /// Trackers idle for this long are purged by the sweep.
    pub idle_expiry_secs: u64,
}

impl DownloadGuardConfig {
    pub fn block_duration(&self) -> Duration {
        Duration::from_secs(self.block_duration_secs)
    }

    pub fn max_duration(&self) -> Duration {
        Duration::from_secs(self.max_duration_secs)
    }

    pub fn sample_interval(&self) -> Duration {
        Duration::from_millis(self.sample_interval_millis)
    }

    pub fn idle_expiry(&self) -> Duration {
        Duration::from_secs(self.idle_expiry_secs)
    }
}

impl Default for DownloadGuardConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 5,
            block_duration_secs: 5 * 60,
            slow_rate_bytes_per_sec: 128,
            min_rate_bytes_per_sec: 256,
            max_duration_secs: 60 * 60,
            sample_interval_millis: 1000,
            idle_expiry_secs: 30 * 60,
        }
    }
}

/// Fixed-window rate limiting configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Window length shared by both limiters.
    pub window_secs: u64,

    /// General API requests allowed per window.
    pub general_max_requests: u32,

    /// Unsuccessful download attempts allowed per window.
    pub download_max_attempts: u32,
}

impl RateLimitConfig {
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            window_secs: 60,
            general_max_requests: 200,
            download_max_attempts: 10,
        }
    }
}

/// Limits checked before routing.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RequestLimits {
    pub max_user_agent_len: usize,
    pub max_accept_len: usize,
    pub max_path_len: usize,
}

impl Default for RequestLimits {
    fn default() -> Self {
        Self {
            max_user_agent_len: 500,
            max_accept_len: 1000,
            max_path_len: 2048,
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Human-readable or JSON log lines.
    pub log_format: LogFormat,

    /// Enable metrics endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: LogFormat::Pretty,
            metrics_enabled: false,
            metrics_address: "0.0.0.0:9090".to_string(),
        }
    }
}
