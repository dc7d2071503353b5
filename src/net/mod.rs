//! Network layer subsystem.
//!
//! # Data Flow
//! ```text
//! Incoming TCP connection
//!     → listener.rs (accept, connection limit)
//!     → connection.rs (id, live count, close token)
//!     → hand off to the HTTP layer
//! ```
//!
//! # Design Decisions
//! - Bounded accept prevents resource exhaustion
//! - Each connection is counted so shutdown can drain
//! - TLS is terminated upstream; the server speaks plain HTTP

pub mod connection;
pub mod listener;

pub use connection::{ConnectionContext, ConnectionHandle, ConnectionId, LiveConnections};
pub use listener::{ConnectionPermit, Listener, ListenerError};
