//! HTTP protocol handling subsystem.
//!
//! # Data Flow
//! ```text
//! TCP connection (net)
//!     → server.rs (accept loop, hyper connection, connection context)
//!     → request id, trace span, panic guard
//!     → middleware/gate.rs (header and path length limits)
//!     → middleware/guard.rs (per-IP connection guard, request timers)
//!     → security::rate_limit (general window; downloads exempt)
//!     → handlers.rs (health, catalog, metadata, download)
//!     → response.rs (error taxonomy → JSON)
//! ```

pub mod handlers;
pub mod middleware;
pub mod request;
pub mod response;
pub mod server;
pub mod timers;

pub use request::{ClientIp, RequestUuid, X_REQUEST_ID};
pub use response::ApiError;
pub use server::{AppState, BackupServer, ServerError};
