//! Pre-routing request gate.
//!
//! Oversized `User-Agent` or `Accept` headers and overlong request targets are
//! refused before any routing or guard accounting takes place.

use axum::{
    body::Body,
    extract::{Request, State},
    http::header,
    middleware::Next,
    response::{IntoResponse, Response},
};

use crate::config::RequestLimits;
use crate::http::request::ClientIp;
use crate::http::response::ApiError;
use crate::observability::metrics;

/// Name of the first limit `request` violates, if any.
pub fn violation(request: &Request<Body>, limits: &RequestLimits) -> Option<&'static str> {
    let header_len = |name| {
        request
            .headers()
            .get(name)
            .map(|v| v.as_bytes().len())
            .unwrap_or(0)
    };
    let target_len = request
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str().len())
        .unwrap_or(0);

    if header_len(header::USER_AGENT) > limits.max_user_agent_len {
        Some("user-agent")
    } else if header_len(header::ACCEPT) > limits.max_accept_len {
        Some("accept")
    } else if target_len > limits.max_path_len {
        Some("path")
    } else {
        None
    }
}

pub async fn request_gate_middleware(
    State(limits): State<RequestLimits>,
    request: Request<Body>,
    next: Next,
) -> Response {
    if let Some(limit) = violation(&request, &limits) {
        let ip = ClientIp::from_request(&request);
        let path: String = request.uri().path().chars().take(256).collect();
        tracing::warn!(ip = %ip, path = %path, limit, "Rejected malformed request");
        metrics::record_rejection("invalid_request");
        return ApiError::InvalidRequest.into_response();
    }
    next.run(request).await
}
