//! HTTP server setup.
//!
//! # Responsibilities
//! - Compose guards, limiter and catalog into shared [`AppState`]
//! - Build the Axum router and its middleware stack
//! - Run the accept loop, one hyper connection task per socket
//! - Sweep guard state periodically
//! - Drain connections on shutdown, within a deadline
//!
//! # Design Decisions
//! - The accept loop is our own rather than `axum::serve`, so each request
//!   can carry a [`ConnectionContext`] whose close token lets guard watchdogs
//!   drop a connection once response headers are already out
//! - Header reads are bounded by hyper's `header_read_timeout`; expiry counts
//!   as a receive timeout for the peer

use axum::{
    body::Body,
    extract::ConnectInfo,
    http::Request,
    middleware,
    routing::get,
    Router,
};
use hyper::body::Incoming;
use hyper_util::{
    rt::{TokioExecutor, TokioIo, TokioTimer},
    server::conn::auto,
};
use std::any::Any;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tower::{ServiceBuilder, ServiceExt};
use tower_http::{
    catch_panic::CatchPanicLayer,
    request_id::{PropagateRequestIdLayer, SetRequestIdLayer},
    trace::TraceLayer,
};

use crate::config::ServerConfig;
use crate::http::handlers;
use crate::http::middleware::{connection_guard_middleware, request_gate_middleware};
use crate::http::request::{RequestUuid, X_REQUEST_ID};
use crate::http::response::{panic_response, route_not_found};
use crate::lifecycle::shutdown::SHUTDOWN_GRACE;
use crate::lifecycle::tasks::spawn_every;
use crate::net::{
    ConnectionContext, ConnectionHandle, ConnectionPermit, Listener, ListenerError,
    LiveConnections,
};
use crate::observability::metrics;
use crate::security::rate_limit::rate_limit_middleware;
use crate::security::{Clock, ConnectionGuard, DownloadGuard, RateLimiter, SystemClock};
use crate::storage::{BackupDirResolver, SnapshotCatalog, StaticDir, UrlBuilder};

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error(transparent)]
    Listener(#[from] ListenerError),

    #[error("{0} connections still open after the shutdown deadline")]
    ShutdownTimedOut(u64),
}

/// State shared by every handler and middleware.
#[derive(Debug, Clone)]
pub struct AppState {
    pub config: Arc<ServerConfig>,
    pub connection_guard: Arc<ConnectionGuard>,
    pub download_guard: Arc<DownloadGuard>,
    pub rate_limiter: Arc<RateLimiter>,
    pub catalog: Arc<SnapshotCatalog>,
    pub started_at: Instant,
}

impl AppState {
    pub fn new(
        config: ServerConfig,
        resolver: Arc<dyn BackupDirResolver>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let urls = UrlBuilder::new(config.listener.host.clone(), config.listener.port);
        Self {
            connection_guard: Arc::new(ConnectionGuard::new(
                config.guard.clone(),
                Arc::clone(&clock),
            )),
            download_guard: Arc::new(DownloadGuard::new(
                config.downloads.clone(),
                Arc::clone(&clock),
            )),
            rate_limiter: Arc::new(RateLimiter::new(&config.rate_limit, clock)),
            catalog: Arc::new(SnapshotCatalog::new(resolver, urls)),
            config: Arc::new(config),
            started_at: Instant::now(),
        }
    }

    /// Purge idle trackers and closed windows; refresh the tracking gauges.
    pub fn sweep(&self) {
        let connections = self.connection_guard.sweep();
        let downloads = self.download_guard.sweep();
        let windows = self.rate_limiter.sweep();

        metrics::record_tracked_ips("connection", self.connection_guard.tracked_ips());
        metrics::record_tracked_ips("download", self.download_guard.tracked_ips());
        metrics::record_tracked_ips("rate_limit", self.rate_limiter.general().tracked_ips());

        if connections + downloads + windows > 0 {
            tracing::debug!(connections, downloads, windows, "Swept idle guard state");
        }
    }

    /// Forget all guard and limiter state.
    pub fn reset(&self) {
        self.connection_guard.reset();
        self.download_guard.reset();
        self.rate_limiter.reset();
    }
}

/// The snapshot distribution server.
pub struct BackupServer {
    state: AppState,
    router: Router,
}

impl BackupServer {
    /// Server over the configured backup directory on the system clock.
    pub fn new(config: ServerConfig) -> Self {
        let resolver = Arc::new(StaticDir::new(&config.storage.backup_dir));
        Self::with_parts(config, resolver, Arc::new(SystemClock))
    }

    pub fn with_parts(
        config: ServerConfig,
        resolver: Arc<dyn BackupDirResolver>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let state = AppState::new(config, resolver, clock);
        let router = Self::build_router(state.clone());
        Self { state, router }
    }

    pub fn state(&self) -> &AppState {
        &self.state
    }

    pub fn config(&self) -> &ServerConfig {
        &self.state.config
    }

    pub fn router(&self) -> Router {
        self.router.clone()
    }

    fn build_router(state: AppState) -> Router {
        let environment = state.config.environment;

        Router::new()
            .route("/health", get(handlers::health).head(route_not_found))
            .route("/snapshots", get(handlers::list_snapshots).head(route_not_found))
            .route(
                "/snapshots/{name}",
                get(handlers::snapshot_file).head(route_not_found),
            )
            .fallback(route_not_found)
            .method_not_allowed_fallback(route_not_found)
            .layer(middleware::from_fn_with_state(
                Arc::clone(&state.rate_limiter),
                rate_limit_middleware,
            ))
            .layer(middleware::from_fn_with_state(
                state.clone(),
                connection_guard_middleware,
            ))
            .layer(middleware::from_fn_with_state(
                state.config.limits.clone(),
                request_gate_middleware,
            ))
            .layer(
                ServiceBuilder::new()
                    .layer(SetRequestIdLayer::x_request_id(RequestUuid))
                    .layer(TraceLayer::new_for_http().make_span_with(request_span))
                    .layer(PropagateRequestIdLayer::x_request_id())
                    .layer(CatchPanicLayer::custom(
                        move |panic: Box<dyn Any + Send + 'static>| {
                            panic_response(panic, environment)
                        },
                    )),
            )
            .with_state(state)
    }

    /// Serve `listener` until `shutdown` fires, then drain.
    pub async fn run(
        self,
        listener: Listener,
        mut shutdown: broadcast::Receiver<()>,
    ) -> Result<(), ServerError> {
        let config = Arc::clone(&self.state.config);
        if let Ok(addr) = listener.local_addr() {
            tracing::info!(
                address = %addr,
                backup_dir = %self.state.catalog.backup_dir().display(),
                max_bytes_per_sec = config.streaming.max_bytes_per_sec,
                environment = config.environment.as_str(),
                "Snapshot server listening"
            );
        }

        let sweeper = {
            let state = self.state.clone();
            spawn_every(
                "guard-sweep",
                config.guard.sweep_interval(),
                shutdown.resubscribe(),
                move || state.sweep(),
            )
        };

        let live = LiveConnections::new();
        let draining = CancellationToken::new();

        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer, permit)) => {
                        let context = ConnectionContext::new(peer);
                        let handle = live.track(&context);
                        tokio::spawn(serve_connection(
                            stream,
                            context,
                            self.router.clone(),
                            Arc::clone(&self.state.connection_guard),
                            config.guard.receive_timeout(),
                            draining.clone(),
                            handle,
                            permit,
                        ));
                    }
                    Err(ListenerError::Closed) => break,
                    Err(e) => {
                        tracing::warn!(error = %e, "Accept failed");
                        tokio::time::sleep(Duration::from_millis(50)).await;
                    }
                },
                _ = shutdown.recv() => break,
            }
        }

        drop(listener);
        draining.cancel();
        tracing::info!(connections = live.active_count(), "Stopped accepting, draining connections");

        if let Err(e) = sweeper.await {
            tracing::error!(error = %e, "Guard sweep task failed");
        }
        if !live.drain(SHUTDOWN_GRACE).await {
            let remaining = live.active_count();
            tracing::warn!(connections = remaining, "Shutdown deadline reached");
            return Err(ServerError::ShutdownTimedOut(remaining));
        }

        tracing::info!("HTTP server stopped");
        Ok(())
    }
}

fn request_span(request: &Request<Body>) -> tracing::Span {
    let request_id = request
        .headers()
        .get(X_REQUEST_ID)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("-");
    tracing::info_span!(
        "request",
        method = %request.method(),
        path = %request.uri().path(),
        request_id = %request_id,
    )
}

#[allow(clippy::too_many_arguments)]
async fn serve_connection(
    stream: TcpStream,
    context: ConnectionContext,
    router: Router,
    guard: Arc<ConnectionGuard>,
    header_read_timeout: Duration,
    draining: CancellationToken,
    _handle: ConnectionHandle,
    _permit: ConnectionPermit,
) {
    let peer = context.peer;
    let close = context.close.clone();

    let service = hyper::service::service_fn(move |mut request: Request<Incoming>| {
        request.extensions_mut().insert(ConnectInfo(peer));
        request.extensions_mut().insert(context.clone());
        router.clone().oneshot(request)
    });

    let mut builder = auto::Builder::new(TokioExecutor::new());
    builder
        .http1()
        .timer(TokioTimer::new())
        .header_read_timeout(header_read_timeout);
    builder.http2().timer(TokioTimer::new());

    let connection = builder.serve_connection(TokioIo::new(stream), service);
    tokio::pin!(connection);

    let result = tokio::select! {
        result = connection.as_mut() => result,
        _ = close.cancelled() => {
            tracing::debug!(peer = %peer, "Connection closed by guard");
            return;
        }
        _ = draining.cancelled() => {
            connection.as_mut().graceful_shutdown();
            tokio::select! {
                result = connection.as_mut() => result,
                _ = close.cancelled() => return,
            }
        }
    };

    if let Err(e) = result {
        let timed_out = e
            .downcast_ref::<hyper::Error>()
            .is_some_and(hyper::Error::is_timeout);
        if timed_out {
            let blocked = guard.record_timeout(peer.ip());
            tracing::warn!(peer = %peer, blocked, "Timed out reading request headers");
            metrics::record_rejection("header_timeout");
        } else {
            tracing::debug!(peer = %peer, error = %e, "Connection error");
        }
    }
}
