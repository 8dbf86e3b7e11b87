//! Prometheus metrics for the webhook engine.
//!
//! All families live under the `webhooks_` namespace and are registered with
//! a single [`MetricsRegistry`]. Recording goes through the cheap [`Metrics`]
//! handle, which may be empty: every method silently no-ops then, so call
//! sites never need to care whether metrics are enabled.
//!
//! | Metric | Type | Labels |
//! |--------|------|--------|
//! | `webhooks_requests` | counter | `path`, `async` |
//! | `webhooks_statuses` | counter | `path`, `status` |
//! | `webhooks_time` | histogram | `path`, `status`, `async` |
//! | `webhooks_execution_seconds` | counter | `path` |
//! | `webhooks_input_bytes` / `webhooks_output_bytes` | counter | `path` |
//! | `webhooks_payload_bytes` / `webhooks_response_bytes` | histogram | `path` |
//! | `webhooks_busy_workers` | gauge | |
//! | `webhooks_forbidden` | counter | `path` |
//! | `webhooks_async_requests` | counter | `path`, `dropped` |
//! | `webhooks_async_queue` / `_processing` / `_waiting` / `_workers` | gauge | |

use std::sync::Arc;
use std::time::Duration;

use prometheus::{
    CounterVec, Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};
use thiserror::Error;

/// Histogram buckets for payload and response sizes in bytes.
const SIZE_BUCKETS: &[f64] = &[
    128.0, 256.0, 512.0, 1024.0, 2048.0, 4096.0, 8192.0, 16384.0, 32768.0, 65536.0,
];

/// Errors that can occur during metrics operations.
#[derive(Debug, Error)]
pub enum MetricsError {
    /// Failed to register a metric with Prometheus.
    #[error("failed to register metric: {0}")]
    RegistrationFailed(#[from] prometheus::Error),

    /// Failed to encode metrics output.
    #[error("failed to encode metrics: {0}")]
    EncodingFailed(String),
}

struct Families {
    requests: IntCounterVec,
    statuses: IntCounterVec,
    time: HistogramVec,
    execution_seconds: CounterVec,
    input_bytes: IntCounterVec,
    output_bytes: IntCounterVec,
    payload_bytes: HistogramVec,
    response_bytes: HistogramVec,
    busy_workers: IntGauge,
    forbidden: IntCounterVec,
    async_requests: IntCounterVec,
    async_queue: IntGauge,
    async_processing: IntGauge,
    async_waiting: IntGauge,
    async_workers: IntGauge,
}

impl Families {
    fn new(registry: &Registry) -> Result<Self, MetricsError> {
        let requests = IntCounterVec::new(
            Opts::new("requests", "total requests number").namespace("webhooks"),
            &["path", "async"],
        )?;
        registry.register(Box::new(requests.clone()))?;

        let statuses = IntCounterVec::new(
            Opts::new("statuses", "response status codes").namespace("webhooks"),
            &["path", "status"],
        )?;
        registry.register(Box::new(statuses.clone()))?;

        let time = HistogramVec::new(
            HistogramOpts::new("time", "execution time distribution in seconds")
                .namespace("webhooks"),
            &["path", "status", "async"],
        )?;
        registry.register(Box::new(time.clone()))?;

        let execution_seconds = CounterVec::new(
            Opts::new("execution_seconds", "total seconds spent for processing")
                .namespace("webhooks"),
            &["path"],
        )?;
        registry.register(Box::new(execution_seconds.clone()))?;

        let input_bytes = IntCounterVec::new(
            Opts::new("input_bytes", "total payload bytes in, excluding headers")
                .namespace("webhooks"),
            &["path"],
        )?;
        registry.register(Box::new(input_bytes.clone()))?;

        let output_bytes = IntCounterVec::new(
            Opts::new("output_bytes", "total response bytes out, excluding headers")
                .namespace("webhooks"),
            &["path"],
        )?;
        registry.register(Box::new(output_bytes.clone()))?;

        let payload_bytes = HistogramVec::new(
            HistogramOpts::new("payload_bytes", "request payload distribution")
                .namespace("webhooks")
                .buckets(SIZE_BUCKETS.to_vec()),
            &["path"],
        )?;
        registry.register(Box::new(payload_bytes.clone()))?;

        let response_bytes = HistogramVec::new(
            HistogramOpts::new("response_bytes", "response payload distribution")
                .namespace("webhooks")
                .buckets(SIZE_BUCKETS.to_vec()),
            &["path"],
        )?;
        registry.register(Box::new(response_bytes.clone()))?;

        let busy_workers = IntGauge::with_opts(
            Opts::new("busy_workers", "number of busy sync workers").namespace("webhooks"),
        )?;
        registry.register(Box::new(busy_workers.clone()))?;

        let forbidden = IntCounterVec::new(
            Opts::new("forbidden", "requests rejected by authorization").namespace("webhooks"),
            &["path"],
        )?;
        registry.register(Box::new(forbidden.clone()))?;

        let async_requests = IntCounterVec::new(
            Opts::new("requests", "total number of arrived async requests")
                .namespace("webhooks")
                .subsystem("async"),
            &["path", "dropped"],
        )?;
        registry.register(Box::new(async_requests.clone()))?;

        let async_queue = IntGauge::with_opts(
            Opts::new("queue", "queue size")
                .namespace("webhooks")
                .subsystem("async"),
        )?;
        registry.register(Box::new(async_queue.clone()))?;

        let async_processing = IntGauge::with_opts(
            Opts::new("processing", "number of items in processing state")
                .namespace("webhooks")
                .subsystem("async"),
        )?;
        registry.register(Box::new(async_processing.clone()))?;

        let async_waiting = IntGauge::with_opts(
            Opts::new("waiting", "number of items waiting for retry")
                .namespace("webhooks")
                .subsystem("async"),
        )?;
        registry.register(Box::new(async_waiting.clone()))?;

        let async_workers = IntGauge::with_opts(
            Opts::new("workers", "current number of async workers")
                .namespace("webhooks")
                .subsystem("async"),
        )?;
        registry.register(Box::new(async_workers.clone()))?;

        Ok(Self {
            requests,
            statuses,
            time,
            execution_seconds,
            input_bytes,
            output_bytes,
            payload_bytes,
            response_bytes,
            busy_workers,
            forbidden,
            async_requests,
            async_queue,
            async_processing,
            async_waiting,
            async_workers,
        })
    }
}

/// Owns the Prometheus registry and all engine metric families.
pub struct MetricsRegistry {
    registry: Registry,
    families: Arc<Families>,
}

impl MetricsRegistry {
    /// Creates a registry with every family registered.
    ///
    /// # Errors
    ///
    /// Returns an error if metric registration fails.
    pub fn new() -> Result<Self, MetricsError> {
        let registry = Registry::new();
        let families = Arc::new(Families::new(&registry)?);
        Ok(Self { registry, families })
    }

    /// A recording handle backed by this registry.
    #[must_use]
    pub fn handle(&self) -> Metrics {
        Metrics(Some(Arc::clone(&self.families)))
    }

    /// Encodes all metrics in Prometheus text format for scraping.
    ///
    /// # Errors
    ///
    /// Returns an error if encoding fails.
    pub fn encode_text(&self) -> Result<String, MetricsError> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder
            .encode(&self.registry.gather(), &mut buffer)
            .map_err(|e| MetricsError::EncodingFailed(e.to_string()))?;
        String::from_utf8(buffer).map_err(|e| MetricsError::EncodingFailed(e.to_string()))
    }

    /// The underlying Prometheus registry, for registering extra collectors.
    #[must_use]
    pub const fn prometheus_registry(&self) -> &Registry {
        &self.registry
    }
}

/// Recording handle; cheap to clone and safe to share.
///
/// An empty handle ([`Metrics::disabled`]) turns every recording call into a
/// no-op.
#[derive(Clone)]
pub struct Metrics(Option<Arc<Families>>);

impl Metrics {
    /// A handle that records nothing.
    #[must_use]
    pub const fn disabled() -> Self {
        Self(None)
    }

    /// Records the outcome of one executed (or refused) request.
    pub fn record_result(
        &self,
        path: &str,
        status: u16,
        is_async: bool,
        duration: Duration,
        input_bytes: u64,
        output_bytes: u64,
    ) {
        let Some(m) = &self.0 else { return };
        let status = status.to_string();
        let is_async = if is_async { "true" } else { "false" };
        let seconds = duration.as_secs_f64();

        m.requests.with_label_values(&[path, is_async]).inc();
        m.statuses.with_label_values(&[path, &status]).inc();
        m.time
            .with_label_values(&[path, &status, is_async])
            .observe(seconds);
        m.execution_seconds.with_label_values(&[path]).inc_by(seconds);
        m.input_bytes.with_label_values(&[path]).inc_by(input_bytes);
        m.output_bytes.with_label_values(&[path]).inc_by(output_bytes);
        #[allow(clippy::cast_precision_loss)]
        {
            m.payload_bytes
                .with_label_values(&[path])
                .observe(input_bytes as f64);
            m.response_bytes
                .with_label_values(&[path])
                .observe(output_bytes as f64);
        }
    }

    /// Adjusts the busy sync-worker gauge.
    pub fn add_busy_workers(&self, delta: i64) {
        let Some(m) = &self.0 else { return };
        m.busy_workers.add(delta);
    }

    /// Counts a request rejected by an authorization collaborator.
    pub fn record_forbidden(&self, path: &str) {
        let Some(m) = &self.0 else { return };
        m.forbidden.with_label_values(&[path]).inc();
        m.statuses.with_label_values(&[path, "403"]).inc();
    }

    /// Counts an arrived async request; `dropped` marks spool failures.
    pub fn record_async_request(&self, path: &str, dropped: bool) {
        let Some(m) = &self.0 else { return };
        let dropped = if dropped { "true" } else { "false" };
        m.async_requests.with_label_values(&[path, dropped]).inc();
    }

    /// Adjusts the queue-depth gauge.
    pub fn add_queued(&self, delta: i64) {
        let Some(m) = &self.0 else { return };
        m.async_queue.add(delta);
    }

    /// Adjusts the items-in-processing gauge.
    pub fn add_processing(&self, delta: i64) {
        let Some(m) = &self.0 else { return };
        m.async_processing.add(delta);
    }

    /// Adjusts the waiting-for-retry gauge.
    pub fn add_waiting(&self, delta: i64) {
        let Some(m) = &self.0 else { return };
        m.async_waiting.add(delta);
    }

    /// Adjusts the running async-workers gauge.
    pub fn add_async_workers(&self, delta: i64) {
        let Some(m) = &self.0 else { return };
        m.async_workers.add(delta);
    }
}
