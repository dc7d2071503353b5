//! Connection identity and lifecycle tracking.
//!
//! # Responsibilities
//! - Generate unique connection IDs for tracing
//! - Count live connections so shutdown can drain them
//! - Hand each request a [`ConnectionContext`] through which guard
//!   watchdogs can close the underlying connection

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

static CONNECTION_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub fn new() -> Self {
        Self(CONNECTION_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Per-connection data attached to every request served on it.
#[derive(Debug, Clone)]
pub struct ConnectionContext {
    pub id: ConnectionId,
    pub peer: SocketAddr,
    /// Cancelling this closes the connection without a response.
    pub close: CancellationToken,
}

impl ConnectionContext {
    pub fn new(peer: SocketAddr) -> Self {
        Self {
            id: ConnectionId::new(),
            peer,
            close: CancellationToken::new(),
        }
    }
}

#[derive(Debug, Default)]
struct Live {
    count: AtomicU64,
    idle: Notify,
}

/// Counts live connections for draining.
#[derive(Debug, Clone, Default)]
pub struct LiveConnections {
    inner: Arc<Live>,
}

impl LiveConnections {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a new connection. The handle decrements the count on drop.
    pub fn track(&self, context: &ConnectionContext) -> ConnectionHandle {
        self.inner.count.fetch_add(1, Ordering::SeqCst);
        ConnectionHandle {
            live: Arc::clone(&self.inner),
            id: context.id,
        }
    }

    pub fn active_count(&self) -> u64 {
        self.inner.count.load(Ordering::SeqCst)
    }

    /// Wait until no connection is live, up to `deadline`.
    ///
    /// Returns false when connections remain after the deadline.
    pub async fn drain(&self, deadline: Duration) -> bool {
        let wait = async {
            loop {
                let idle = self.inner.idle.notified();
                if self.active_count() == 0 {
                    return;
                }
                idle.await;
            }
        };
        tokio::time::timeout(deadline, wait).await.is_ok()
    }
}

#[derive(Debug)]
pub struct ConnectionHandle {
    live: Arc<Live>,
    id: ConnectionId,
}

impl ConnectionHandle {
    pub fn id(&self) -> ConnectionId {
        self.id
    }
}

impl Drop for ConnectionHandle {
    fn drop(&mut self) {
        if self.live.count.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.live.idle.notify_waiters();
        }
        tracing::trace!(connection_id = %self.id, "Connection closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context() -> ConnectionContext {
        ConnectionContext::new("127.0.0.1:4000".parse().unwrap())
    }

    #[test]
    fn connection_ids_are_unique() {
        assert_ne!(ConnectionId::new(), ConnectionId::new());
        assert!(ConnectionId::new().to_string().starts_with("conn-"));
    }

    #[test]
    fn counts_live_connections() {
        let live = LiveConnections::new();
        let a = live.track(&context());
        let b = live.track(&context());
        assert_eq!(live.active_count(), 2);
        drop(a);
        assert_eq!(live.active_count(), 1);
        drop(b);
        assert_eq!(live.active_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn drain_completes_when_last_connection_closes() {
        let live = LiveConnections::new();
        let handle = live.track(&context());

        let closer = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            drop(handle);
        });

        assert!(live.drain(Duration::from_secs(5)).await);
        closer.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn drain_gives_up_at_deadline() {
        let live = LiveConnections::new();
        let _handle = live.track(&context());
        assert!(!live.drain(Duration::from_secs(5)).await);
    }
}
