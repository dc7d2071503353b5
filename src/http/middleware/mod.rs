//! Middleware applied to every route, outermost first:
//! request gate → connection guard → general rate limit.

pub mod gate;
pub mod guard;

pub use gate::request_gate_middleware;
pub use guard::connection_guard_middleware;
