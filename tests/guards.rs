//! Router-level tests for the connection guard and general rate limit,
//! driven by a manual clock.

use axum::http::StatusCode;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt;

use snapshot_server::security::ManualClock;
use snapshot_server::storage::StaticDir;
use snapshot_server::{BackupServer, ServerConfig};

mod common;
use common::{json_body, request_from};

const PEER: &str = "203.0.113.50:40000";

fn server() -> (BackupServer, Arc<ManualClock>, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let clock = Arc::new(ManualClock::new());
    let server = BackupServer::with_parts(
        ServerConfig::default(),
        Arc::new(StaticDir::new(dir.path())),
        clock.clone(),
    );
    (server, clock, dir)
}

fn peer_ip() -> IpAddr {
    PEER.parse::<std::net::SocketAddr>().unwrap().ip()
}

#[tokio::test]
async fn slow_peer_is_blocked_until_expiry() {
    let (server, clock, _dir) = server();
    let router = server.router();

    let res = router.clone().oneshot(request_from(PEER, "/health")).await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    drop(res);

    let guard = &server.state().connection_guard;
    let mut blocked = false;
    for _ in 0..11 {
        blocked = guard.record_timeout(peer_ip());
    }
    assert!(blocked);

    let res = router.clone().oneshot(request_from(PEER, "/health")).await.unwrap();
    assert_eq!(res.status(), StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(res.headers()["retry-after"], "600");
    let body = json_body(res).await;
    assert_eq!(body["retryAfter"], 600);

    // Other clients are unaffected.
    let res = router
        .clone()
        .oneshot(request_from("198.51.100.2:1234", "/health"))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);

    clock.advance(Duration::from_secs(600));
    let res = router.oneshot(request_from(PEER, "/health")).await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);
}

#[tokio::test]
async fn general_window_caps_non_download_traffic() {
    let (server, clock, _dir) = server();
    let router = server.router();

    for _ in 0..200 {
        let res = router.clone().oneshot(request_from(PEER, "/health")).await.unwrap();
        assert_eq!(res.status(), StatusCode::OK);
    }

    let res = router.clone().oneshot(request_from(PEER, "/snapshots")).await.unwrap();
    assert_eq!(res.status(), StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(res.headers()["retry-after"], "60");

    // Downloads are governed by their own window only.
    let res = router
        .clone()
        .oneshot(request_from(
            PEER,
            "/snapshots/snapshot_1_2025-01-06_12-30-45.gz",
        ))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::NOT_FOUND);

    // Metadata lookups are not downloads.
    let res = router
        .clone()
        .oneshot(request_from(
            PEER,
            "/snapshots/snapshot_1_2025-01-06_12-30-45.gz.header.json",
        ))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::TOO_MANY_REQUESTS);

    clock.advance(Duration::from_secs(60));
    let res = router.oneshot(request_from(PEER, "/health")).await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);
}

#[tokio::test]
async fn reset_forgets_all_guard_state() {
    let (server, _clock, _dir) = server();
    let router = server.router();

    let res = router.clone().oneshot(request_from(PEER, "/health")).await.unwrap();
    drop(res);
    for _ in 0..11 {
        server.state().connection_guard.record_timeout(peer_ip());
    }

    server.state().reset();
    assert_eq!(server.state().connection_guard.tracked_ips(), 0);

    let res = router.oneshot(request_from(PEER, "/health")).await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);
}

#[tokio::test]
async fn sweep_purges_idle_trackers() {
    let (server, clock, _dir) = server();
    let router = server.router();

    let res = router.oneshot(request_from(PEER, "/health")).await.unwrap();
    drop(res);
    assert_eq!(server.state().connection_guard.tracked_ips(), 1);

    clock.advance(Duration::from_secs(601));
    server.state().sweep();
    assert_eq!(server.state().connection_guard.tracked_ips(), 0);
    assert_eq!(server.state().rate_limiter.general().tracked_ips(), 0);
}
