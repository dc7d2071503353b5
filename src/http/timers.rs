//! Per-request timeout enforcement.
//!
//! Three limits apply to every admitted request:
//! - receive: the handler must produce response headers within this time
//! - send: once headers are out, the body may not sit idle longer than this
//! - connection: an idle ceiling across both phases
//!
//! A timeout before headers becomes a 408. After headers the only recourse is
//! to close the connection, which is done through its close token. Either way
//! the timeout is accounted against the client's connection tracker.

use axum::{
    body::{Body, Bytes},
    response::Response,
};
use hyper::body::{Body as HttpBody, Frame, SizeHint};
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::GuardConfig;
use crate::lifecycle::tasks::{spawn_scoped, ScheduledTask};
use crate::observability::metrics;
use crate::security::{ConnectionTicket, TimeoutReporter};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestTimers {
    pub receive: Duration,
    pub send: Duration,
    pub connection: Duration,
}

impl RequestTimers {
    pub fn from_config(config: &GuardConfig) -> Self {
        Self {
            receive: config.receive_timeout(),
            send: config.send_timeout(),
            connection: config.connection_timeout(),
        }
    }

    /// Time allowed until response headers exist.
    pub fn header_deadline(&self) -> Duration {
        self.receive.min(self.connection)
    }

    /// Longest allowed pause while the body streams.
    pub fn idle_limit(&self) -> Duration {
        self.send.min(self.connection)
    }
}

#[derive(Debug)]
struct Activity {
    origin: Instant,
    last_millis: AtomicU64,
}

impl Activity {
    fn new() -> Self {
        Self {
            origin: Instant::now(),
            last_millis: AtomicU64::new(0),
        }
    }

    fn elapsed_millis(&self) -> u64 {
        u64::try_from(self.origin.elapsed().as_millis()).unwrap_or(u64::MAX)
    }

    fn touch(&self) {
        self.last_millis
            .store(self.elapsed_millis(), Ordering::Relaxed);
    }

    fn idle(&self) -> Duration {
        let last = self.last_millis.load(Ordering::Relaxed);
        Duration::from_millis(self.elapsed_millis().saturating_sub(last))
    }
}

/// Response body that keeps the connection slot until it is dropped and
/// feeds the send watchdog.
pub struct TimedBody {
    inner: Body,
    activity: Arc<Activity>,
    close: CancellationToken,
    _ticket: ConnectionTicket,
    _watchdog: ScheduledTask,
}

impl HttpBody for TimedBody {
    type Data = Bytes;
    type Error = axum::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.get_mut();
        if this.close.is_cancelled() {
            return Poll::Ready(Some(Err(axum::Error::new(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "connection closed by timeout",
            )))));
        }

        let polled = Pin::new(&mut this.inner).poll_frame(cx);
        if let Poll::Ready(Some(Ok(_))) = &polled {
            this.activity.touch();
        }
        polled
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

/// Wrap `response` so the send and connection limits govern its body.
pub fn watch_body(
    response: Response,
    ticket: ConnectionTicket,
    close: CancellationToken,
    idle_limit: Duration,
) -> Response {
    let activity = Arc::new(Activity::new());
    let watchdog = spawn_idle_watchdog(
        Arc::clone(&activity),
        ticket.timeout_reporter(),
        close.clone(),
        idle_limit,
    );

    let (parts, body) = response.into_parts();
    Response::from_parts(
        parts,
        Body::new(TimedBody {
            inner: body,
            activity,
            close,
            _ticket: ticket,
            _watchdog: watchdog,
        }),
    )
}

fn spawn_idle_watchdog(
    activity: Arc<Activity>,
    reporter: TimeoutReporter,
    close: CancellationToken,
    limit: Duration,
) -> ScheduledTask {
    spawn_scoped(async move {
        loop {
            let idle = activity.idle();
            if idle >= limit {
                let blocked = reporter.record();
                tracing::warn!(
                    ip = %reporter.ip(),
                    idle_secs = idle.as_secs(),
                    blocked,
                    "Send timeout, closing connection"
                );
                metrics::record_rejection("send_timeout");
                close.cancel();
                return;
            }
            tokio::time::sleep(limit - idle).await;
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::security::{ConnectionGuard, SystemClock};
    use futures_util::{stream, StreamExt};
    use std::net::IpAddr;

    fn ip() -> IpAddr {
        "192.0.2.77".parse().unwrap()
    }

    fn guard() -> Arc<ConnectionGuard> {
        Arc::new(ConnectionGuard::new(GuardConfig::default(), Arc::new(SystemClock)))
    }

    #[test]
    fn limits_follow_config() {
        let timers = RequestTimers::from_config(&GuardConfig::default());
        assert_eq!(timers.header_deadline(), Duration::from_secs(60));
        assert_eq!(timers.idle_limit(), Duration::from_secs(120));
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_body_is_closed_and_counted() {
        let guard = guard();
        let close = CancellationToken::new();
        let chunks = stream::iter([Ok::<_, std::io::Error>(Bytes::from_static(b"x"))])
            .chain(stream::pending());
        let response = Response::new(Body::from_stream(chunks));

        let wrapped = watch_body(
            response,
            guard.admit(ip()).unwrap(),
            close.clone(),
            Duration::from_secs(120),
        );
        let mut data = wrapped.into_body().into_data_stream();
        assert_eq!(data.next().await.unwrap().unwrap(), Bytes::from_static(b"x"));

        tokio::time::sleep(Duration::from_secs(119)).await;
        assert!(!close.is_cancelled());
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(close.is_cancelled());

        assert!(data.next().await.unwrap().is_err());
        assert_eq!(guard.snapshot(ip()).unwrap().timeout_count, 1);

        drop(data);
        assert_eq!(guard.snapshot(ip()).unwrap().active_connections, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn finished_body_releases_the_slot() {
        let guard = guard();
        let wrapped = watch_body(
            Response::new(Body::from("done")),
            guard.admit(ip()).unwrap(),
            CancellationToken::new(),
            Duration::from_secs(120),
        );
        assert_eq!(guard.snapshot(ip()).unwrap().active_connections, 1);

        let bytes = axum::body::to_bytes(wrapped.into_body(), usize::MAX)
            .await
            .unwrap();
        assert_eq!(&bytes[..], b"done");
        assert_eq!(guard.snapshot(ip()).unwrap().active_connections, 0);

        tokio::time::sleep(Duration::from_secs(300)).await;
        assert_eq!(guard.snapshot(ip()).unwrap().timeout_count, 0);
    }
}
