//! Connection guard middleware.
//!
//! Admits each request through the per-IP connection guard, arms the request
//! timers and records request metrics. The admission ticket travels with the
//! response body so the slot stays taken until the body is done.

use axum::{
    body::Body,
    extract::{Request, State},
    middleware::Next,
    response::{IntoResponse, Response},
};

use crate::http::request::{route_label, ClientIp, ConnectionClose};
use crate::http::response::ApiError;
use crate::http::server::AppState;
use crate::http::timers::{watch_body, RequestTimers};
use crate::observability::metrics;

pub async fn connection_guard_middleware(
    State(state): State<AppState>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let ip = ClientIp::from_request(&request);
    let route = route_label(request.uri().path());
    let close = ConnectionClose::from_extensions(request.extensions());

    let ticket = match state.connection_guard.admit(ip) {
        Ok(ticket) => ticket,
        Err(blocked) => {
            tracing::warn!(
                ip = %ip,
                path = %request.uri().path(),
                retry_after = blocked.retry_after_secs,
                "Rejected request from blocked IP"
            );
            metrics::record_rejection("connection_guard");
            metrics::record_request(route, 429);
            return ApiError::rate_limited(blocked.retry_after_secs).into_response();
        }
    };

    let timers = RequestTimers::from_config(state.connection_guard.config());
    let response = match tokio::time::timeout(timers.header_deadline(), next.run(request)).await
    {
        Ok(response) => response,
        Err(_) => {
            let blocked = ticket.record_timeout();
            tracing::warn!(ip = %ip, route, blocked, "Receive timeout");
            metrics::record_rejection("receive_timeout");
            metrics::record_request(route, 408);
            return ApiError::RequestTimeout.into_response();
        }
    };

    metrics::record_request(route, response.status().as_u16());
    watch_body(response, ticket, close, timers.idle_limit())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;
    use crate::security::SystemClock;
    use crate::storage::StaticDir;
    use axum::{extract::ConnectInfo, http::StatusCode, middleware, routing::get, Router};
    use std::net::SocketAddr;
    use std::sync::Arc;
    use std::time::Duration;
    use tower::ServiceExt;

    fn state() -> AppState {
        AppState::new(
            ServerConfig::default(),
            Arc::new(StaticDir::new(std::env::temp_dir())),
            Arc::new(SystemClock),
        )
    }

    fn request(peer: SocketAddr) -> Request<Body> {
        let mut request = Request::builder().uri("/stall").body(Body::empty()).unwrap();
        request.extensions_mut().insert(ConnectInfo(peer));
        request
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_handler_gets_request_timeout() {
        let state = state();
        let router = Router::new()
            .route(
                "/stall",
                get(|| async {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    "late"
                }),
            )
            .layer(middleware::from_fn_with_state(
                state.clone(),
                connection_guard_middleware,
            ));
        let peer: SocketAddr = "203.0.113.9:5000".parse().unwrap();

        let started = tokio::time::Instant::now();
        let response = router.oneshot(request(peer)).await.unwrap();

        assert_eq!(response.status(), StatusCode::REQUEST_TIMEOUT);
        assert!(started.elapsed() >= Duration::from_secs(60));
        assert!(started.elapsed() < Duration::from_secs(3600));

        let tracker = state.connection_guard.snapshot(peer.ip()).unwrap();
        assert_eq!(tracker.timeout_count, 1);
        assert_eq!(tracker.slow_connections, 1);
        assert_eq!(tracker.active_connections, 0);
    }
}
