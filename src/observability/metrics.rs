//! Metrics collection and exposition.
//!
//! # Metrics
//! - `snapshot_requests_total` (counter): requests by route, status
//! - `snapshot_rejections_total` (counter): guard and validation refusals by reason
//! - `snapshot_bytes_streamed_total` (counter): download payload bytes sent
//! - `snapshot_active_downloads` (gauge): download bodies currently streaming
//! - `snapshot_tracked_ips` (gauge): tracker entries per guard, updated by the sweep
//!
//! Without an installed recorder every call here is a no-op.

use metrics::{counter, gauge};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;

#[derive(Debug, thiserror::Error)]
#[error("failed to start metrics exporter on {addr}: {message}")]
pub struct MetricsError {
    pub addr: SocketAddr,
    pub message: String,
}

/// Start the Prometheus scrape endpoint on `addr`.
pub fn init_metrics(addr: SocketAddr) -> Result<(), MetricsError> {
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| MetricsError {
            addr,
            message: e.to_string(),
        })?;
    tracing::info!(address = %addr, "Metrics exporter listening");
    Ok(())
}

pub fn record_request(route: &str, status: u16) {
    counter!(
        "snapshot_requests_total",
        "route" => route.to_owned(),
        "status" => status.to_string()
    )
    .increment(1);
}

pub fn record_rejection(reason: &'static str) {
    counter!("snapshot_rejections_total", "reason" => reason).increment(1);
}

pub fn record_bytes_streamed(bytes: u64) {
    counter!("snapshot_bytes_streamed_total").increment(bytes);
}

pub fn download_started() {
    gauge!("snapshot_active_downloads").increment(1.0);
}

pub fn download_finished() {
    gauge!("snapshot_active_downloads").decrement(1.0);
}

pub fn record_tracked_ips(guard: &'static str, count: usize) {
    gauge!("snapshot_tracked_ips", "guard" => guard).set(count as f64);
}
