//! The HTTP-facing gateway.
//!
//! [`Engine`] is the handler the outside world sees: it resolves the request
//! to a manifest, picks the sync or async path, enforces the sync-worker
//! semaphore, and makes sure every path flushes the buffered response and
//! records metrics. The execution core ([`Engine::run_attempt`]) is shared
//! with the async workers, so a replayed request takes exactly the same path
//! as a live one.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use axum::body::Body;
use axum::extract::{ConnectInfo, Request, State};
use axum::http::{HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{Config, ConfigError};
use crate::executor;
use crate::manifest::Manifest;
use crate::metrics::Metrics;
use crate::queue::{Queue, QueuedItem};
use crate::request::{InboundRequest, RequestMeta, body_reader};
use crate::runner::Runner;
use crate::spool;
use crate::stream::{BufferedResponse, ResponseSink};

/// Status returned for accepted async requests.
///
/// The alternative 204 No Content ack was rejected: 202 states explicitly
/// that processing has not happened yet.
pub const ASYNC_ACK: StatusCode = StatusCode::ACCEPTED;

/// The webhook execution engine shared by the HTTP handler and the async
/// workers.
pub struct Engine {
    config: Config,
    runner: Runner,
    metrics: Metrics,
    sync_workers: Arc<Semaphore>,
    queue: Arc<Queue>,
    shutdown: CancellationToken,
}

/// Shared handle to the engine.
pub type SharedEngine = Arc<Engine>;

impl Engine {
    /// Builds an engine, validating the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error when the configuration is invalid for this platform.
    pub fn new(
        config: Config,
        runner: Runner,
        queue: Arc<Queue>,
        metrics: Metrics,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let sync_workers = Arc::new(Semaphore::new(config.sync_workers()));
        Ok(Self {
            config,
            runner,
            metrics,
            sync_workers,
            queue,
            shutdown: CancellationToken::new(),
        })
    }

    /// An axum router with this engine handling every path.
    ///
    /// The router expects `ConnectInfo<SocketAddr>` to be available, i.e. it
    /// must be served via `into_make_service_with_connect_info`.
    #[must_use]
    pub fn router(self: &Arc<Self>) -> Router {
        Router::new()
            .fallback(handle)
            .with_state(Arc::clone(self))
    }

    /// The engine configuration.
    #[must_use]
    pub const fn config(&self) -> &Config {
        &self.config
    }

    /// The shared async queue.
    #[must_use]
    pub fn queue(&self) -> &Arc<Queue> {
        &self.queue
    }

    /// The metrics handle.
    #[must_use]
    pub const fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    /// Token cancelled when [`Engine::shutdown`] is called; workers and
    /// pending queue operations observe it.
    #[must_use]
    pub fn cancellation_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Signals process-wide shutdown to workers and queue waiters.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Runs one execution attempt and finalizes the response: maps failures
    /// to statuses, always flushes, and records metrics. Shared between the
    /// sync path and async replays.
    pub(crate) async fn run_attempt(
        &self,
        manifest: &Manifest,
        request: InboundRequest,
        response: &mut BufferedResponse,
        is_async: bool,
    ) {
        let path = request.meta.path.clone();
        let input_bytes = request.bytes_read();

        if let Err(err) = executor::execute(&self.config, manifest, request, response).await {
            warn!(path = %path, error = %err, "webhook execution failed");
            if response.headers_sent() {
                debug!(path = %path, "response already committed, error not reported to client");
            } else {
                response.set_header(HeaderName::from_static("x-error"), error_header(&err));
                response.set_status(err.status_code());
            }
        }

        if let Err(err) = response.flush().await {
            debug!(path = %path, error = %err, "failed to flush response");
        }

        self.metrics.record_result(
            &path,
            response.status().map_or(0, |s| s.as_u16()),
            is_async,
            response.elapsed(),
            input_bytes.load(std::sync::atomic::Ordering::Relaxed),
            response.bytes_sent(),
        );
    }

    /// Spools an async request and enqueues it.
    async fn spool_async(&self, meta: RequestMeta, body: Body, manifest: Manifest) -> Response {
        let path = meta.path.clone();
        match self.spool_and_enqueue(meta, body, manifest).await {
            Ok(()) => {
                self.metrics.record_async_request(&path, false);
                ASYNC_ACK.into_response()
            }
            Err(err) => {
                warn!(path = %path, error = %err, "failed to spool async request");
                self.metrics.record_async_request(&path, true);
                (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()).into_response()
            }
        }
    }

    async fn spool_and_enqueue(
        &self,
        meta: RequestMeta,
        body: Body,
        manifest: Manifest,
    ) -> Result<(), SpoolAsyncError> {
        let tmp = spool::write_request(&meta, body_reader(body)).await?;

        let item = QueuedItem {
            path: tmp.path().to_path_buf(),
            manifest,
        };
        // A full bounded queue exerts backpressure here; process shutdown
        // aborts the wait. Failure drops `tmp`, which removes the file.
        self.queue.push(item, &self.shutdown).await?;
        self.metrics.add_queued(1);

        // The worker owns the file from here on.
        let (file, path) = tmp.keep().map_err(|err| SpoolAsyncError::Persist(err.error))?;
        drop(file);
        debug!(spool = %path.display(), "async request queued");
        Ok(())
    }
}

/// Spool-path failures, all reported as 500 to the client.
#[derive(Debug, thiserror::Error)]
enum SpoolAsyncError {
    #[error(transparent)]
    Spool(#[from] spool::SpoolError),

    #[error("enqueue spooled request: {0}")]
    Queue(#[from] crate::queue::QueueError),

    #[error("persist spool file: {0}")]
    Persist(#[source] std::io::Error),
}

/// The axum handler for every inbound request.
async fn handle(
    State(engine): State<SharedEngine>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    request: Request,
) -> Response {
    let (parts, body) = request.into_parts();
    let meta = RequestMeta::from_http(&parts, peer.to_string());

    let Some(manifest) = engine.runner.resolve(&meta, &engine.config.default_manifest()) else {
        engine
            .metrics
            .record_result(&meta.path, 404, false, std::time::Duration::ZERO, 0, 0);
        return StatusCode::NOT_FOUND.into_response();
    };

    if manifest.is_async(&meta.query) {
        return engine.spool_async(meta, body, manifest).await;
    }

    let permit = match Arc::clone(&engine.sync_workers).acquire_owned().await {
        Ok(permit) => permit,
        Err(err) => {
            warn!(error = %err, "failed to get an available worker");
            return (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()).into_response();
        }
    };
    engine.metrics.add_busy_workers(1);

    let (sink, head_rx, body_rx) = ResponseSink::channel();
    let inbound = InboundRequest::from_live(meta, body);
    let soft_limit = engine.config.response_buffer_soft_limit;

    // The task owns the permit, the child and the work dir; it survives the
    // handler when the response streams past the buffer.
    let task_engine = Arc::clone(&engine);
    tokio::spawn(async move {
        let mut response = BufferedResponse::new(sink, soft_limit);
        task_engine
            .run_attempt(&manifest, inbound, &mut response, false)
            .await;
        task_engine.metrics.add_busy_workers(-1);
        drop(permit);
    });

    match head_rx.await {
        Ok(head) => {
            let stream = futures::stream::unfold(body_rx, |mut rx| async move {
                rx.recv().await.map(|chunk| (chunk, rx))
            });
            let mut response = Response::new(Body::from_stream(stream));
            *response.status_mut() = head.status;
            *response.headers_mut() = head.headers;
            response
        }
        Err(_) => {
            info!("execution task ended without committing a response");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

/// Renders an error as a single-line header value.
fn error_header(err: &executor::ExecError) -> HeaderValue {
    let text = err.to_string().replace(['\r', '\n'], " ");
    HeaderValue::from_str(&text)
        .unwrap_or_else(|_| HeaderValue::from_static("execution failed"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::AsyncMode;

    fn engine_with(runner: Runner) -> SharedEngine {
        Arc::new(
            Engine::new(
                Config::default(),
                runner,
                Arc::new(Queue::unbounded()),
                Metrics::disabled(),
            )
            .unwrap(),
        )
    }

    #[test]
    fn test_router_creation() {
        let engine = engine_with(Runner::static_command(["/bin/true"]));
        let _router = engine.router();
    }

    #[tokio::test]
    async fn test_run_attempt_reports_failure_via_headers() {
        let engine = engine_with(Runner::static_command(["/no/such/bin"]));
        let manifest = Manifest {
            command: vec!["/no/such/bin".to_string()],
            async_mode: AsyncMode::Disabled,
            timeout: std::time::Duration::ZERO,
            retries: 0,
            delay: std::time::Duration::from_secs(1),
        };
        let meta = RequestMeta::from_wire(
            "POST".to_string(),
            "/missing".to_string(),
            String::new(),
            axum::http::HeaderMap::new(),
            String::new(),
        );
        let request = InboundRequest::new(meta, Box::pin(std::io::Cursor::new(Vec::new())));

        let (sink, head_rx, _body_rx) = ResponseSink::channel();
        let mut response = BufferedResponse::new(sink, 1024);
        engine
            .run_attempt(&manifest, request, &mut response, false)
            .await;

        let head = head_rx.await.unwrap();
        assert_eq!(head.status, StatusCode::NOT_FOUND);
        assert!(head.headers.contains_key("x-error"));
    }

    #[tokio::test]
    async fn test_spool_and_enqueue_hands_file_to_queue() {
        let engine = engine_with(Runner::static_command(["/bin/true"]));
        let meta = RequestMeta::from_wire(
            "POST".to_string(),
            "/job".to_string(),
            String::new(),
            axum::http::HeaderMap::new(),
            String::new(),
        );
        let manifest = engine.config().default_manifest();

        engine
            .spool_and_enqueue(meta, Body::from("payload"), manifest)
            .await
            .unwrap();

        let item = engine
            .queue()
            .pop(&CancellationToken::new())
            .await
            .unwrap();
        assert!(item.path.exists());
        tokio::fs::remove_file(&item.path).await.unwrap();
    }
}
