//! Background workers replaying spooled requests.
//!
//! Each worker loops: pop an item, open its spool file, run up to
//! `1 + retries` attempts through the shared execution path, and delete the
//! file whatever happens. Errors never escape the loop; a worker only stops
//! when the engine's cancellation token fires.

use std::path::PathBuf;

use axum::http::{HeaderName, HeaderValue};
use tokio::fs::File;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::gateway::SharedEngine;
use crate::queue::QueuedItem;
use crate::spool;
use crate::stream::{BufferedResponse, ResponseSink};

/// Deletes the spooled file when dropped, covering every exit path.
struct SpoolGuard(PathBuf);

impl Drop for SpoolGuard {
    fn drop(&mut self) {
        match std::fs::remove_file(&self.0) {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => warn!(spool = %self.0.display(), %err, "failed to remove spool file"),
        }
    }
}

/// A background worker bound to an engine's queue.
///
/// Several workers may share one engine; each processes one item at a time.
pub struct AsyncWorker {
    engine: SharedEngine,
}

impl AsyncWorker {
    /// Creates a worker for the given engine.
    #[must_use]
    pub fn new(engine: SharedEngine) -> Self {
        Self { engine }
    }

    /// Runs the worker loop until `cancel` fires.
    ///
    /// An already-popped item is always cleaned up before returning: its
    /// spool file is deleted even when shutdown interrupts the attempts.
    pub async fn run(&self, cancel: CancellationToken) {
        let metrics = self.engine.metrics();
        metrics.add_async_workers(1);

        loop {
            let Ok(item) = self.engine.queue().pop(&cancel).await else {
                break;
            };
            metrics.add_queued(-1);
            let guard = SpoolGuard(item.path.clone());

            match self.open_spool(&item, &cancel).await {
                Some(file) => {
                    // The handle itself is not read from again; each attempt
                    // opens its own descriptor so replays never share a file
                    // offset. Holding it just keeps the inode alive.
                    let _spool = file;
                    self.process_item(&item, &cancel).await;
                }
                None => warn!(spool = %item.path.display(), "spooled request unprocessable"),
            }
            drop(guard);

            if cancel.is_cancelled() {
                break;
            }
        }

        metrics.add_async_workers(-1);
        debug!("async worker stopped");
    }

    /// Opens the spool file, retrying with the manifest's delay.
    async fn open_spool(&self, item: &QueuedItem, cancel: &CancellationToken) -> Option<File> {
        let attempts = item.manifest.retries + 1;
        for attempt in 1..=attempts {
            match File::open(&item.path).await {
                Ok(file) => return Some(file),
                Err(err) => {
                    warn!(
                        spool = %item.path.display(),
                        attempt,
                        attempts,
                        %err,
                        "failed to open spooled request",
                    );
                }
            }
            if attempt < attempts && !self.wait_delay(item.manifest.delay, cancel).await {
                return None;
            }
        }
        None
    }

    /// Runs the attempt loop for one item.
    async fn process_item(&self, item: &QueuedItem, cancel: &CancellationToken) {
        let metrics = self.engine.metrics();
        metrics.add_processing(1);

        let attempts = item.manifest.retries + 1;
        for attempt in 1..=attempts {
            match self.run_replay(item, attempt).await {
                Ok(()) => {
                    info!(
                        spool = %item.path.display(),
                        attempt,
                        attempts,
                        "async request processed",
                    );
                    metrics.add_processing(-1);
                    return;
                }
                Err(err) => {
                    warn!(
                        spool = %item.path.display(),
                        attempt,
                        attempts,
                        %err,
                        "async attempt failed",
                    );
                }
            }

            if attempt < attempts {
                metrics.add_waiting(1);
                let proceed = self.wait_delay(item.manifest.delay, cancel).await;
                metrics.add_waiting(-1);
                if !proceed {
                    metrics.add_processing(-1);
                    return;
                }
            }
        }

        error!(spool = %item.path.display(), "async processing failed after all attempts");
        metrics.add_processing(-1);
    }

    /// Replays the spooled request once through the shared execution path.
    async fn run_replay(&self, item: &QueuedItem, attempt: u32) -> Result<(), ReplayError> {
        let handle = File::open(&item.path)
            .await
            .map_err(ReplayError::Reopen)?;
        let mut request = spool::read_request(handle).await?;
        request.meta.headers.insert(
            HeaderName::from_static("x-attempt"),
            HeaderValue::from_str(&attempt.to_string())
                .expect("attempt counter is a valid header value"),
        );

        let mut response = BufferedResponse::new(
            ResponseSink::discard(),
            self.engine.config().response_buffer_soft_limit,
        );
        self.engine
            .run_attempt(&item.manifest, request, &mut response, true)
            .await;

        match response.status() {
            None => Ok(()),
            Some(status) if status.is_success() => Ok(()),
            Some(status) => Err(ReplayError::Status(status.as_u16())),
        }
    }

    /// Sleeps for the retry delay; returns `false` when cancelled.
    async fn wait_delay(&self, delay: std::time::Duration, cancel: &CancellationToken) -> bool {
        tokio::select! {
            () = tokio::time::sleep(delay) => true,
            () = cancel.cancelled() => false,
        }
    }
}

/// One failed replay attempt.
#[derive(Debug, thiserror::Error)]
enum ReplayError {
    /// The spool file could not be reopened for this attempt.
    #[error("reopen spooled request: {0}")]
    Reopen(#[source] std::io::Error),

    /// The stored request no longer parses.
    #[error(transparent)]
    Spool(#[from] spool::SpoolError),

    /// The executor reported a non-2xx status.
    #[error("attempt failed - non 2xx code returned ({0})")]
    Status(u16),
}
