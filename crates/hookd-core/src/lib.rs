//! # hookd-core
//!
//! Core library for hookd - an HTTP-fronted script-execution daemon.
//!
//! Inbound HTTP requests are mapped to executables on disk, the executable is
//! invoked with request metadata as environment variables and the request
//! body on standard input (or cached alternatives), and its standard output
//! is streamed back as the response body.
//!
//! ## Features
//!
//! - **Routing**: static command or directory-backed script lookup with
//!   traversal protection and per-file attribute overrides
//! - **Execution**: streaming stdio wiring, timeouts, per-request work
//!   directories, optional POSIX credential drop
//! - **Async pipeline**: requests spooled to disk, queued, and replayed by
//!   background workers with bounded retries
//! - **Observability**: Prometheus metrics for every stage
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use hookd_core::config::Config;
//! use hookd_core::gateway::Engine;
//! use hookd_core::metrics::Metrics;
//! use hookd_core::queue::Queue;
//! use hookd_core::runner::Runner;
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let engine = Arc::new(Engine::new(
//!     Config::default(),
//!     Runner::static_command(["/usr/bin/env"]),
//!     Arc::new(Queue::unbounded()),
//!     Metrics::disabled(),
//! )?);
//! let app = engine.router();
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod attrs;
pub mod config;
pub mod creds;
pub mod executor;
pub mod gateway;
pub mod manifest;
pub mod metrics;
pub mod queue;
pub mod request;
pub mod runner;
pub mod spool;
pub mod stream;
pub mod worker;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::config::{Config, PayloadPassing};
    pub use crate::gateway::{Engine, SharedEngine};
    pub use crate::manifest::{AsyncMode, Manifest};
    pub use crate::metrics::{Metrics, MetricsRegistry};
    pub use crate::queue::Queue;
    pub use crate::runner::Runner;
    pub use crate::worker::AsyncWorker;
}

/// Re-export commonly used types at the crate root.
pub use config::Config;
pub use gateway::Engine;
pub use manifest::{AsyncMode, Manifest};
pub use metrics::Metrics;
pub use queue::Queue;
pub use runner::Runner;
pub use worker::AsyncWorker;
