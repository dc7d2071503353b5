//! Bandwidth-capped file streaming.
//!
//! A byte token bucket sits between the file reader and the response body.
//! Chunks are only read when the body is polled, and only released once the
//! bucket holds enough tokens, so throughput is smoothed to the ceiling and
//! a slow reader never causes the file to be buffered.

use bytes::Bytes;
use futures_util::{stream, Stream, StreamExt};
use std::time::Duration;
use tokio::io::AsyncRead;
use tokio::time::Instant;
use tokio_util::io::ReaderStream;

/// A token bucket measured in bytes.
#[derive(Debug)]
pub struct ByteBucket {
    tokens: f64,
    capacity: f64,
    refill_per_sec: f64,
    last_update: Instant,
}

impl ByteBucket {
    /// A bucket that starts empty, so even the first burst is paced.
    pub fn new(bytes_per_sec: u64, capacity: usize) -> Self {
        Self {
            tokens: 0.0,
            capacity: capacity.max(1) as f64,
            refill_per_sec: bytes_per_sec.max(1) as f64,
            last_update: Instant::now(),
        }
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_update).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        self.last_update = now;
    }

    /// Take `n` bytes worth of tokens, or report how long until they exist.
    ///
    /// Requests larger than the capacity wait for a full bucket and leave it
    /// in debt, which keeps the long-run average at the ceiling.
    pub fn try_take(&mut self, n: usize, now: Instant) -> Result<(), Duration> {
        self.refill(now);
        let needed = (n as f64).min(self.capacity);
        if self.tokens >= needed {
            self.tokens -= n as f64;
            Ok(())
        } else {
            let deficit = needed - self.tokens;
            Err(Duration::from_secs_f64(deficit / self.refill_per_sec))
        }
    }

    /// Wait until `n` bytes may pass.
    pub async fn acquire(&mut self, n: usize) {
        while let Err(wait) = self.try_take(n, Instant::now()) {
            tokio::time::sleep(wait).await;
        }
    }
}

/// Effective chunk size: never larger than one second of budget.
pub fn chunk_size_for(bytes_per_sec: u64, max_chunk: usize) -> usize {
    let per_sec = usize::try_from(bytes_per_sec).unwrap_or(usize::MAX);
    max_chunk.min(per_sec).max(1)
}

/// Stream `reader` no faster than `bytes_per_sec`.
pub fn throttled<R>(
    reader: R,
    bytes_per_sec: u64,
    max_chunk: usize,
) -> impl Stream<Item = std::io::Result<Bytes>> + Send
where
    R: AsyncRead + Send + Unpin + 'static,
{
    let chunk = chunk_size_for(bytes_per_sec, max_chunk);
    let source = ReaderStream::with_capacity(reader, chunk);
    let bucket = ByteBucket::new(bytes_per_sec, chunk);

    stream::unfold((source, bucket), |(mut source, mut bucket)| async move {
        let item = source.next().await?;
        if let Ok(bytes) = &item {
            bucket.acquire(bytes.len()).await;
        }
        Some((item, (source, bucket)))
    })
}
