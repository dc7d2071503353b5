//! A download body that reports to the download guard.
//!
//! # Responsibilities
//! - Account every emitted chunk against the client's download tracker
//! - Run the one-shot duration watchdog for the lifetime of the body
//! - Refund the download attempt once the declared length has been produced
//! - Stop promptly once the watchdog or a connection guard closes the exchange

use bytes::Bytes;
use futures_util::Stream;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::lifecycle::tasks::{spawn_after, ScheduledTask};
use crate::observability::metrics;
use crate::security::{DownloadAttempt, DownloadTicket};

type ByteStream = Pin<Box<dyn Stream<Item = io::Result<Bytes>> + Send>>;

pub struct DownloadStream {
    inner: ByteStream,
    expected_len: u64,
    ticket: DownloadTicket,
    attempt: Option<DownloadAttempt>,
    close: CancellationToken,
    _watchdog: ScheduledTask,
    finished: bool,
}

impl DownloadStream {
    /// Wrap `inner`, which should yield exactly `expected_len` bytes.
    ///
    /// The download counts as complete as soon as that many bytes have been
    /// emitted; the HTTP layer stops polling once the declared length is out.
    /// `close` is cancelled by the watchdog when the download runs past
    /// `max_duration` below the minimum rate.
    pub fn new<S>(
        inner: S,
        expected_len: u64,
        ticket: DownloadTicket,
        attempt: DownloadAttempt,
        max_duration: Duration,
        close: CancellationToken,
    ) -> Self
    where
        S: Stream<Item = io::Result<Bytes>> + Send + 'static,
    {
        let probe = ticket.probe();
        let watchdog_close = close.clone();
        let watchdog = spawn_after(max_duration, async move {
            if probe.expire() {
                metrics::record_rejection("slow_download");
                watchdog_close.cancel();
            }
        });
        metrics::download_started();

        Self {
            inner: Box::pin(inner),
            expected_len,
            ticket,
            attempt: Some(attempt),
            close,
            _watchdog: watchdog,
            finished: false,
        }
    }

    fn complete(&mut self) {
        if let Some(attempt) = self.attempt.take() {
            attempt.succeed();
            tracing::info!(
                ip = %self.ticket.ip(),
                bytes = self.ticket.bytes_sent(),
                "Download complete"
            );
        }
    }
}

impl Stream for DownloadStream {
    type Item = io::Result<Bytes>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.finished {
            return Poll::Ready(None);
        }
        if this.close.is_cancelled() {
            this.finished = true;
            tracing::warn!(ip = %this.ticket.ip(), "Download terminated by guard");
            return Poll::Ready(Some(Err(io::Error::new(
                io::ErrorKind::TimedOut,
                "download terminated",
            ))));
        }

        match this.inner.as_mut().poll_next(cx) {
            Poll::Ready(Some(Ok(chunk))) => {
                this.ticket.record_chunk(chunk.len());
                metrics::record_bytes_streamed(chunk.len() as u64);
                if this.ticket.bytes_sent() >= this.expected_len {
                    this.complete();
                }
                Poll::Ready(Some(Ok(chunk)))
            }
            Poll::Ready(Some(Err(e))) => {
                this.finished = true;
                tracing::error!(ip = %this.ticket.ip(), error = %e, "Read error mid-download");
                Poll::Ready(Some(Err(e)))
            }
            Poll::Ready(None) => {
                this.finished = true;
                if this.ticket.bytes_sent() >= this.expected_len {
                    this.complete();
                } else {
                    tracing::warn!(
                        ip = %this.ticket.ip(),
                        bytes = this.ticket.bytes_sent(),
                        expected = this.expected_len,
                        "File ended before its declared length"
                    );
                }
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for DownloadStream {
    fn drop(&mut self) {
        metrics::download_finished();
        if self.attempt.is_some() {
            tracing::debug!(
                ip = %self.ticket.ip(),
                bytes = self.ticket.bytes_sent(),
                "Download aborted by client"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DownloadGuardConfig, RateLimitConfig};
    use crate::security::{DownloadGuard, RateLimiter, SystemClock};
    use futures_util::{stream, StreamExt};
    use std::net::IpAddr;
    use std::sync::Arc;

    fn ip() -> IpAddr {
        "192.0.2.10".parse().unwrap()
    }

    fn parts() -> (Arc<DownloadGuard>, Arc<RateLimiter>) {
        let clock = Arc::new(SystemClock);
        (
            Arc::new(DownloadGuard::new(DownloadGuardConfig::default(), clock.clone())),
            Arc::new(RateLimiter::new(&RateLimitConfig::default(), clock)),
        )
    }

    fn chunks(n: usize) -> impl Stream<Item = io::Result<Bytes>> + Send {
        stream::iter((0..n).map(|_| Ok(Bytes::from_static(b"abcd"))))
    }

    #[tokio::test]
    async fn completed_download_refunds_attempt_and_frees_slot() {
        let (guard, limiter) = parts();
        for _ in 0..9 {
            drop(limiter.begin_download(ip()).unwrap());
        }

        let body = DownloadStream::new(
            chunks(3),
            12,
            guard.begin(ip()).unwrap(),
            limiter.begin_download(ip()).unwrap(),
            Duration::from_secs(3600),
            CancellationToken::new(),
        );
        let collected: Vec<_> = body.collect().await;
        assert_eq!(collected.len(), 3);

        assert_eq!(guard.snapshot(ip()).unwrap().active_downloads, 0);
        assert_eq!(guard.snapshot(ip()).unwrap().total_bytes_transferred, 12);
        // The refunded slot is available again.
        assert!(limiter.begin_download(ip()).is_ok());
    }

    #[tokio::test]
    async fn aborted_download_keeps_attempt_counted() {
        let (guard, limiter) = parts();
        for _ in 0..9 {
            drop(limiter.begin_download(ip()).unwrap());
        }

        let mut body = DownloadStream::new(
            chunks(3),
            12,
            guard.begin(ip()).unwrap(),
            limiter.begin_download(ip()).unwrap(),
            Duration::from_secs(3600),
            CancellationToken::new(),
        );
        assert!(body.next().await.is_some());
        drop(body);

        assert_eq!(guard.snapshot(ip()).unwrap().active_downloads, 0);
        assert!(limiter.begin_download(ip()).is_err());
    }

    #[tokio::test]
    async fn reaching_declared_length_counts_as_success() {
        let (guard, limiter) = parts();
        for _ in 0..9 {
            drop(limiter.begin_download(ip()).unwrap());
        }

        let mut body = DownloadStream::new(
            chunks(2).chain(stream::pending()),
            8,
            guard.begin(ip()).unwrap(),
            limiter.begin_download(ip()).unwrap(),
            Duration::from_secs(3600),
            CancellationToken::new(),
        );
        assert!(body.next().await.is_some());
        assert!(body.next().await.is_some());
        drop(body);

        assert!(limiter.begin_download(ip()).is_ok());
    }

    #[tokio::test]
    async fn short_file_is_not_a_success() {
        let (guard, limiter) = parts();
        for _ in 0..9 {
            drop(limiter.begin_download(ip()).unwrap());
        }

        let body = DownloadStream::new(
            chunks(1),
            100,
            guard.begin(ip()).unwrap(),
            limiter.begin_download(ip()).unwrap(),
            Duration::from_secs(3600),
            CancellationToken::new(),
        );
        let collected: Vec<_> = body.collect().await;
        assert_eq!(collected.len(), 1);
        assert!(limiter.begin_download(ip()).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn watchdog_terminates_slow_download() {
        let (guard, limiter) = parts();
        let close = CancellationToken::new();
        let pending = stream::pending::<io::Result<Bytes>>();

        let mut body = DownloadStream::new(
            pending,
            1024,
            guard.begin(ip()).unwrap(),
            limiter.begin_download(ip()).unwrap(),
            Duration::from_secs(3600),
            close.clone(),
        );

        tokio::time::sleep(Duration::from_secs(3601)).await;
        assert!(close.is_cancelled());

        let next = body.next().await.unwrap();
        assert_eq!(next.unwrap_err().kind(), io::ErrorKind::TimedOut);
        assert!(body.next().await.is_none());
        assert!(guard.snapshot(ip()).unwrap().blocked);
    }
}
