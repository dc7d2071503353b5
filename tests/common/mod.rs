//! Shared utilities for integration tests.

#![allow(dead_code)]

use axum::body::Body;
use axum::extract::ConnectInfo;
use axum::http::Request;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;
use tokio::task::JoinHandle;

use snapshot_server::http::{AppState, BackupServer, ServerError};
use snapshot_server::net::Listener;
use snapshot_server::security::SystemClock;
use snapshot_server::storage::StaticDir;
use snapshot_server::{ServerConfig, Shutdown};

/// A server bound to an ephemeral localhost port over a temporary backup dir.
pub struct TestServer {
    pub addr: SocketAddr,
    pub state: AppState,
    pub dir: TempDir,
    shutdown: Shutdown,
    handle: JoinHandle<Result<(), ServerError>>,
}

impl TestServer {
    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    pub fn backup_dir(&self) -> &Path {
        self.dir.path()
    }

    pub async fn stop(self) -> Result<(), ServerError> {
        self.shutdown.trigger();
        self.handle.await.expect("server task panicked")
    }
}

/// Defaults tuned for fast tests: a generous bandwidth ceiling.
pub fn test_config() -> ServerConfig {
    let mut config = ServerConfig::default();
    config.streaming.max_bytes_per_sec = 64 * 1024 * 1024;
    config
}

pub async fn start_server(config: ServerConfig) -> TestServer {
    let dir = tempfile::tempdir().unwrap();
    let server = BackupServer::with_parts(
        config,
        Arc::new(StaticDir::new(dir.path())),
        Arc::new(SystemClock),
    );
    let state = server.state().clone();

    let listener = Listener::bind("127.0.0.1:0".parse().unwrap(), 1024)
        .await
        .unwrap();
    let addr = listener.local_addr().unwrap();

    let shutdown = Shutdown::new();
    let signal = shutdown.subscribe();
    let handle = tokio::spawn(server.run(listener, signal));

    TestServer {
        addr,
        state,
        dir,
        shutdown,
        handle,
    }
}

pub fn client() -> reqwest::Client {
    reqwest::Client::builder()
        .pool_max_idle_per_host(0)
        .no_proxy()
        .build()
        .unwrap()
}

pub fn snapshot_name(block: u64, ext: &str) -> String {
    format!("snapshot_{block}_2025-01-06_12-30-45.{ext}")
}

pub fn write_file(dir: &Path, name: &str, contents: &[u8]) {
    std::fs::write(dir.join(name), contents).unwrap();
}

/// Deterministic, non-repeating-looking payload.
pub fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 31 % 251) as u8).collect()
}

/// A router-level request as if it arrived from `peer`.
pub fn request_from(peer: &str, path: &str) -> Request<Body> {
    let addr: SocketAddr = peer.parse().unwrap();
    let mut request = Request::builder().uri(path).body(Body::empty()).unwrap();
    request.extensions_mut().insert(ConnectInfo(addr));
    request
}

pub async fn json_body(response: axum::response::Response) -> serde_json::Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}
