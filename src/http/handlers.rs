//! Route handlers.
//!
//! # Routes
//! - `GET /health`: liveness only, never touches the filesystem
//! - `GET /snapshots`: the catalog, newest block first
//! - `GET /snapshots/{name}.header.json`: JSON metadata for one archive
//! - `GET /snapshots/{name}`: throttled archive download
//!
//! # Design Decisions
//! - Names are validated before any filesystem access
//! - Download admission (guard, then limiter) happens before validation, so
//!   malformed attempts still count against the download window
//! - The file is opened and measured before the response starts; after that
//!   point a failure can only cut the stream short

use axum::{
    body::Body,
    extract::{Path, State},
    response::{IntoResponse, Response},
    Json,
};
use chrono::{SecondsFormat, Utc};
use serde::Serialize;
use std::net::IpAddr;
use tokio::fs::File;

use crate::http::request::{ClientIp, ConnectionClose};
use crate::http::response::ApiError;
use crate::http::server::AppState;
use crate::observability::metrics;
use crate::security::headers::download_headers;
use crate::security::validator::{
    mime_type_for, resolve_path, validate_extension, validate_filename, validate_mime,
    validate_not_empty, FileRejection, METADATA_SUFFIX,
};
use crate::storage::{SnapshotEntry, SnapshotListing};
use crate::streaming::{throttled, DownloadStream};

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub timestamp: String,
    pub uptime: f64,
    pub version: &'static str,
    pub environment: &'static str,
}

/// `GET /health`
pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
        uptime: state.started_at.elapsed().as_secs_f64(),
        version: env!("CARGO_PKG_VERSION"),
        environment: state.config.environment.as_str(),
    })
}

/// `GET /snapshots`
pub async fn list_snapshots(State(state): State<AppState>) -> Result<Json<SnapshotListing>, ApiError> {
    let listing = state.catalog.list().await.map_err(|e| {
        tracing::error!(error = %e, "Failed to list snapshots");
        ApiError::internal(e, state.config.environment)
    })?;
    Ok(Json(listing))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotMetadata {
    #[serde(flatten)]
    pub entry: SnapshotEntry,
    pub mime_type: &'static str,
}

/// `GET /snapshots/{name}`, dispatching metadata lookups by suffix.
pub async fn snapshot_file(
    State(state): State<AppState>,
    ClientIp(ip): ClientIp,
    ConnectionClose(close): ConnectionClose,
    Path(name): Path<String>,
) -> Result<Response, ApiError> {
    match name.strip_suffix(METADATA_SUFFIX) {
        Some(archive) => metadata(&state, ip, archive).await,
        None => download(&state, ip, &name, close).await,
    }
}

fn refuse(state: &AppState, ip: IpAddr, name: &str, rejection: FileRejection) -> ApiError {
    let label: String = name.chars().take(256).collect();
    if rejection.is_not_found() {
        tracing::debug!(ip = %ip, file = %label, reason = %rejection, "Snapshot not found");
    } else {
        tracing::warn!(ip = %ip, file = %label, reason = %rejection, "Rejected snapshot request");
        metrics::record_rejection("invalid_file");
    }
    ApiError::from_rejection(rejection, state.config.environment)
}

async fn metadata(state: &AppState, ip: IpAddr, archive: &str) -> Result<Response, ApiError> {
    validate_filename(archive)
        .and_then(|()| validate_extension(archive))
        .map_err(|e| refuse(state, ip, archive, e))?;

    let path = resolve_path(archive, &state.catalog.backup_dir())
        .await
        .map_err(|e| refuse(state, ip, archive, e))?;
    let stat = validate_not_empty(&path)
        .await
        .map_err(|e| refuse(state, ip, archive, e))?;

    Ok(Json(SnapshotMetadata {
        entry: state.catalog.entry(archive, &stat),
        mime_type: mime_type_for(archive),
    })
    .into_response())
}

async fn download(
    state: &AppState,
    ip: IpAddr,
    name: &str,
    close: tokio_util::sync::CancellationToken,
) -> Result<Response, ApiError> {
    let ticket = state.download_guard.begin(ip).map_err(|blocked| {
        tracing::warn!(
            ip = %ip,
            retry_after = blocked.retry_after_secs,
            "Download refused: IP blocked by download guard"
        );
        metrics::record_rejection("download_guard");
        ApiError::rate_limited(blocked.retry_after_secs)
    })?;

    let attempt = state.rate_limiter.begin_download(ip).map_err(|limited| {
        tracing::warn!(
            ip = %ip,
            retry_after = limited.retry_after_secs,
            "Download rate limit exceeded"
        );
        metrics::record_rejection("download_rate_limit");
        ApiError::rate_limited(limited.retry_after_secs)
    })?;

    let mime = validate_filename(name)
        .and_then(|()| validate_extension(name))
        .and_then(|()| validate_mime(name))
        .map_err(|e| refuse(state, ip, name, e))?;

    let path = resolve_path(name, &state.catalog.backup_dir())
        .await
        .map_err(|e| refuse(state, ip, name, e))?;
    validate_not_empty(&path)
        .await
        .map_err(|e| refuse(state, ip, name, e))?;

    let file = File::open(&path).await.map_err(|e| {
        let rejection = if e.kind() == std::io::ErrorKind::NotFound {
            FileRejection::NotFound
        } else {
            FileRejection::Io(e)
        };
        refuse(state, ip, name, rejection)
    })?;
    // Measure the handle we stream from, not the path we validated.
    let size = file
        .metadata()
        .await
        .map_err(|e| refuse(state, ip, name, FileRejection::Io(e)))?
        .len();
    if size == 0 {
        return Err(refuse(state, ip, name, FileRejection::EmptyFile));
    }

    let headers = download_headers(mime, name, size)
        .map_err(|e| ApiError::internal(e, state.config.environment))?;

    let streaming = &state.config.streaming;
    let body = DownloadStream::new(
        throttled(file, streaming.max_bytes_per_sec, streaming.chunk_size),
        size,
        ticket,
        attempt,
        state.download_guard.config().max_duration(),
        close,
    );

    tracing::info!(ip = %ip, file = %name, size, "Download started");
    Ok((headers, Body::from_stream(body)).into_response())
}
