//! Snapshot distribution server.
//!
//! Serves blockchain snapshot archives from a backup directory over HTTP,
//! behind per-IP slow-loris guards, download concurrency limits, fixed-window
//! rate limits and a global bandwidth ceiling.

pub mod config;
pub mod http;
pub mod lifecycle;
pub mod net;
pub mod observability;
pub mod security;
pub mod storage;
pub mod streaming;

pub use config::ServerConfig;
pub use http::BackupServer;
pub use lifecycle::Shutdown;
