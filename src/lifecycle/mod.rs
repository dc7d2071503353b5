//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Signals (signals.rs):
//!     SIGTERM/SIGINT → Shutdown::trigger
//!     second signal  → immediate exit
//!
//! Shutdown (shutdown.rs):
//!     trigger → stop accepting → stop sweeps → drain (5s) → exit
//!
//! Tasks (tasks.rs):
//!     periodic sweeps, one-shot watchdogs
//! ```
//!
//! # Design Decisions
//! - Ordered shutdown: stop accept, drain, close
//! - Shutdown has a deadline; the process exits even if clients hang on

pub mod shutdown;
pub mod signals;
pub mod tasks;

pub use shutdown::{Shutdown, SHUTDOWN_GRACE};
pub use tasks::{spawn_after, spawn_every, spawn_scoped, ScheduledTask};
