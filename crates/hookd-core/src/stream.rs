//! Byte-counting request wrapper and the buffered response.
//!
//! The response side is the subtle part: the executor must be able to turn a
//! late failure (child exited non-zero after writing some stdout) into a 5xx
//! status, which is only possible while the response head has not been
//! committed upstream. [`BufferedResponse`] therefore coalesces body bytes up
//! to a soft limit and defers the head until `flush` or overflow, after which
//! it degrades to a transparent passthrough.

use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll};
use std::time::Instant;

use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use bytes::Bytes;
use futures::future::BoxFuture;
use tokio::io::{AsyncRead, ReadBuf};
use tokio::sync::{mpsc, oneshot};

/// Transparent [`AsyncRead`] wrapper counting the bytes pulled through it.
///
/// The counter is shared so the total stays observable after the reader has
/// moved into the executor.
pub struct MeteredReader<R> {
    inner: R,
    count: Arc<AtomicU64>,
}

impl<R> MeteredReader<R> {
    /// Wraps `inner` with a fresh counter.
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            count: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Handle to the shared byte counter.
    #[must_use]
    pub fn counter(&self) -> Arc<AtomicU64> {
        Arc::clone(&self.count)
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for MeteredReader<R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let before = buf.filled().len();
        match Pin::new(&mut this.inner).poll_read(cx, buf) {
            Poll::Ready(Ok(())) => {
                let read = buf.filled().len() - before;
                this.count.fetch_add(read as u64, Ordering::Relaxed);
                Poll::Ready(Ok(()))
            }
            other => other,
        }
    }
}

/// Response status line and headers, emitted exactly once per response.
#[derive(Debug)]
pub struct ResponseHead {
    /// Committed status code.
    pub status: StatusCode,
    /// Headers recorded before the commit.
    pub headers: HeaderMap,
}

/// Where a [`BufferedResponse`] delivers its output.
pub enum ResponseSink {
    /// Live HTTP path: the head goes through a oneshot consumed by the
    /// gateway handler, body chunks through a channel feeding the response
    /// body stream.
    Channel {
        /// Taken on the first (only) head write.
        head: Option<oneshot::Sender<ResponseHead>>,
        /// Body chunk channel.
        body: mpsc::Sender<io::Result<Bytes>>,
    },
    /// Async replay path: headers and body are dropped; only the recorded
    /// status matters to the worker.
    Discard,
}

impl ResponseSink {
    /// Creates a channel sink plus the receiving halves for the HTTP layer.
    #[must_use]
    pub fn channel() -> (
        Self,
        oneshot::Receiver<ResponseHead>,
        mpsc::Receiver<io::Result<Bytes>>,
    ) {
        let (head_tx, head_rx) = oneshot::channel();
        let (body_tx, body_rx) = mpsc::channel(16);
        (
            Self::Channel {
                head: Some(head_tx),
                body: body_tx,
            },
            head_rx,
            body_rx,
        )
    }

    /// Creates a sink that swallows everything.
    #[must_use]
    pub const fn discard() -> Self {
        Self::Discard
    }

    fn send_head(&mut self, head: ResponseHead) -> io::Result<()> {
        match self {
            Self::Channel { head: slot, .. } => slot
                .take()
                .ok_or_else(|| io::Error::other("response head already sent"))?
                .send(head)
                .map_err(|_| io::Error::from(io::ErrorKind::BrokenPipe)),
            Self::Discard => Ok(()),
        }
    }

    async fn send_data(&mut self, data: Bytes) -> io::Result<()> {
        match self {
            Self::Channel { body, .. } => body
                .send(Ok(data))
                .await
                .map_err(|_| io::Error::from(io::ErrorKind::BrokenPipe)),
            Self::Discard => Ok(()),
        }
    }

    /// A future resolving when the downstream consumer has gone away.
    ///
    /// For the discard sink there is no consumer, so the future never
    /// resolves.
    #[must_use]
    pub fn closed(&self) -> BoxFuture<'static, ()> {
        match self {
            Self::Channel { body, .. } => {
                let body = body.clone();
                Box::pin(async move { body.closed().await })
            }
            Self::Discard => Box::pin(std::future::pending()),
        }
    }
}

/// Write-side response wrapper that delays the head until a soft threshold
/// or an explicit flush.
///
/// State machine: `Buffering` until `flush()` is called or the buffered
/// bytes reach the soft limit, then `Passthrough` for the rest of the
/// response. A soft limit of zero disables buffering entirely (the first
/// write flushes).
pub struct BufferedResponse {
    sink: ResponseSink,
    soft_limit: usize,
    status: Option<StatusCode>,
    headers: HeaderMap,
    buffer: Vec<u8>,
    headers_sent: bool,
    sent: u64,
    created: Instant,
}

impl BufferedResponse {
    /// Creates a response writing into `sink`, buffering up to `soft_limit`
    /// bytes.
    #[must_use]
    pub fn new(sink: ResponseSink, soft_limit: usize) -> Self {
        Self {
            sink,
            soft_limit,
            status: None,
            headers: HeaderMap::new(),
            buffer: Vec::new(),
            headers_sent: false,
            sent: 0,
            created: Instant::now(),
        }
    }

    /// Records the status code. Only the value in effect at flush time is
    /// emitted; later calls after the head went out are ignored.
    pub fn set_status(&mut self, status: StatusCode) {
        if !self.headers_sent {
            self.status = Some(status);
        }
    }

    /// Records a header. Ignored once the head has been sent.
    pub fn set_header(&mut self, name: HeaderName, value: HeaderValue) {
        if !self.headers_sent {
            self.headers.insert(name, value);
        }
    }

    /// Writes body bytes, buffering until the soft limit is reached.
    ///
    /// # Errors
    ///
    /// Propagates sink errors, e.g. when the client disconnected.
    pub async fn write(&mut self, data: &[u8]) -> io::Result<()> {
        if self.headers_sent || self.soft_limit == 0 {
            self.flush().await?;
            self.sink.send_data(Bytes::copy_from_slice(data)).await?;
            self.sent += data.len() as u64;
            return Ok(());
        }

        self.buffer.extend_from_slice(data);
        if self.buffer.len() >= self.soft_limit {
            self.flush().await?;
        }
        Ok(())
    }

    /// Commits the head (200 OK when no status was recorded) and emits any
    /// buffered bytes in a single write, releasing the buffer memory.
    /// Idempotent.
    ///
    /// # Errors
    ///
    /// Propagates sink errors.
    pub async fn flush(&mut self) -> io::Result<()> {
        if self.headers_sent {
            return Ok(());
        }
        let status = self.status.unwrap_or(StatusCode::OK);
        self.status = Some(status);
        self.headers_sent = true;
        self.sink.send_head(ResponseHead {
            status,
            headers: std::mem::take(&mut self.headers),
        })?;

        if self.buffer.is_empty() {
            return Ok(());
        }
        let body = std::mem::take(&mut self.buffer);
        self.sent += body.len() as u64;
        self.sink.send_data(Bytes::from(body)).await
    }

    /// The recorded status code, if any was set or committed.
    #[must_use]
    pub const fn status(&self) -> Option<StatusCode> {
        self.status
    }

    /// Total body bytes emitted upstream (excludes still-buffered bytes).
    #[must_use]
    pub const fn bytes_sent(&self) -> u64 {
        self.sent
    }

    /// Whether the head has been committed upstream.
    #[must_use]
    pub const fn headers_sent(&self) -> bool {
        self.headers_sent
    }

    /// When this response wrapper was created.
    #[must_use]
    pub const fn created_at(&self) -> Instant {
        self.created
    }

    /// Time elapsed since this response was created.
    #[must_use]
    pub fn elapsed(&self) -> std::time::Duration {
        self.created.elapsed()
    }

    /// See [`ResponseSink::closed`].
    #[must_use]
    pub fn disconnect_signal(&self) -> BoxFuture<'static, ()> {
        self.sink.closed()
    }
}
