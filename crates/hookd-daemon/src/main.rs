//! hookd - webhook daemon.
//!
//! Maps inbound HTTP requests to script executions: the request path selects
//! a script, request metadata becomes environment variables, the body is
//! piped to stdin, and stdout streams back as the response. Requests marked
//! async are spooled to disk, acknowledged immediately, and replayed by
//! background workers with bounded retries.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use clap::{Args, Parser, Subcommand, ValueEnum};
use hookd_core::config::{Config, PayloadPassing};
use hookd_core::gateway::{Engine, SharedEngine};
use hookd_core::manifest::AsyncMode;
use hookd_core::metrics::{Metrics, MetricsRegistry};
use hookd_core::queue::Queue;
use hookd_core::runner::Runner;
use hookd_core::worker::AsyncWorker;
use tokio::signal::unix::{SignalKind, signal};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// hookd - run scripts in response to HTTP requests
#[derive(Parser, Debug)]
#[command(name = "hookd")]
#[command(version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    #[command(flatten)]
    common: CommonArgs,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Serve scripts from a directory; the URL path selects the script
    Serve(ServeArgs),
    /// Serve a single fixed command for every request
    Run(RunArgs),
}

#[derive(Args, Debug)]
struct CommonArgs {
    /// Binding address
    #[arg(short, long, env = "BIND", default_value = "127.0.0.1:8080")]
    bind: SocketAddr,

    /// Maximum execution time; zero disables the limit
    #[arg(short, long, env = "TIMEOUT", default_value = "120s", value_parser = humantime::parse_duration)]
    timeout: Duration,

    /// Soft response buffer size in bytes; zero disables buffering
    #[arg(short = 'B', long, env = "BUFFER", default_value_t = 8192)]
    buffer: usize,

    /// Async mode: auto relies on the async query parameter
    #[arg(short = 'a', long, env = "ASYNC", default_value = "auto")]
    async_mode: AsyncModeArg,

    /// Number of additional retries after the first attempt (async only)
    #[arg(short, long, env = "RETRIES", default_value_t = 3)]
    retries: u32,

    /// Delay between attempts (async only)
    #[arg(short, long, env = "DELAY", default_value = "3s", value_parser = humantime::parse_duration)]
    delay: Duration,

    /// Maximum number of parallel sync executions; zero means 2 x CPU
    #[arg(short = 'W', long, env = "WORKERS", default_value_t = 0)]
    workers: usize,

    /// Number of background workers processing async requests
    #[arg(short = 'A', long, env = "ASYNC_WORKERS", default_value_t = 2)]
    async_workers: usize,

    /// Queue capacity for async requests; zero means unbounded
    #[arg(short, long, env = "QUEUE", default_value_t = 8192)]
    queue: usize,

    /// How the request body reaches the script
    #[arg(short, long, env = "PAYLOAD", default_value = "stdin")]
    payload: PayloadArg,

    /// Disable the Prometheus /metrics endpoint
    #[arg(short = 'M', long, env = "DISABLE_METRICS")]
    disable_metrics: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,
}

#[derive(Args, Debug)]
struct ServeArgs {
    /// Scripts directory
    #[arg(env = "SCRIPTS")]
    scripts: PathBuf,

    /// Working directory for scripts; parent of per-request dirs when
    /// isolation is on
    #[arg(short = 'w', long, env = "WORK_DIR")]
    work_dir: Option<PathBuf>,

    /// Disable per-request isolated work dirs
    #[arg(short = 'I', long, env = "DISABLE_ISOLATION")]
    disable_isolation: bool,

    /// Allow scripts in dot files and dot directories
    #[arg(short = 'D', long, env = "ENABLE_DOT_FILES")]
    enable_dot_files: bool,

    /// Run each script with the uid/gid of its file owner; requires root
    #[arg(short = 'R', long, env = "RUN_AS_SCRIPT_OWNER")]
    run_as_script_owner: bool,
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Binary to run
    binary: String,

    /// Arguments passed to the binary
    args: Vec<String>,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum AsyncModeArg {
    Auto,
    Forced,
    Disabled,
}

impl From<AsyncModeArg> for AsyncMode {
    fn from(value: AsyncModeArg) -> Self {
        match value {
            AsyncModeArg::Auto => Self::Auto,
            AsyncModeArg::Forced => Self::Forced,
            AsyncModeArg::Disabled => Self::Disabled,
        }
    }
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum PayloadArg {
    /// Stream the body to the script's stdin
    Stdin,
    /// Buffer the body and append it as the last argument
    LastArgument,
    /// Buffer the body into the REQUEST_BODY environment variable
    Env,
}

impl From<PayloadArg> for PayloadPassing {
    fn from(value: PayloadArg) -> Self {
        match value {
            PayloadArg::Stdin => Self::Stdin,
            PayloadArg::LastArgument => Self::LastArgument,
            PayloadArg::Env => Self::EnvVar,
        }
    }
}

impl CommonArgs {
    fn engine_config(&self) -> Config {
        Config {
            payload_passing: self.payload.into(),
            response_buffer_soft_limit: self.buffer,
            default_timeout: self.timeout,
            default_async_mode: self.async_mode.into(),
            default_retries: self.retries,
            default_delay: self.delay,
            sync_worker_limit: self.workers,
            ..Config::default()
        }
    }

    fn queue(&self) -> Queue {
        if self.queue > 0 {
            Queue::bounded(self.queue)
        } else {
            Queue::unbounded()
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter =
        EnvFilter::try_new(&cli.common.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    let mut config = cli.common.engine_config();
    let runner = match &cli.command {
        Command::Serve(serve) => {
            let scripts_root = std::fs::canonicalize(&serve.scripts)
                .with_context(|| format!("resolve scripts directory {:?}", serve.scripts))?;
            config.isolated_workdir = !serve.disable_isolation;
            config.workdir_root = serve.work_dir.clone().unwrap_or_default();
            config.run_as_file_owner = serve.run_as_script_owner;
            Runner::directory(scripts_root, serve.enable_dot_files)
        }
        Command::Run(run) => {
            config.isolated_workdir = false;
            config.workdir_root = PathBuf::from(".");
            let mut command = vec![run.binary.clone()];
            command.extend(run.args.iter().cloned());
            Runner::static_command(command)
        }
    };

    let metrics_registry = if cli.common.disable_metrics {
        None
    } else {
        Some(Arc::new(
            MetricsRegistry::new().context("failed to initialize metrics registry")?,
        ))
    };
    let metrics = metrics_registry
        .as_ref()
        .map_or_else(Metrics::disabled, |registry| registry.handle());

    let engine: SharedEngine = Arc::new(
        Engine::new(config, runner, Arc::new(cli.common.queue()), metrics)
            .context("invalid configuration")?,
    );

    let mut app = engine.router();
    if let Some(registry) = &metrics_registry {
        let registry = Arc::clone(registry);
        app = app.route(
            "/metrics",
            get(move || {
                let registry = Arc::clone(&registry);
                async move {
                    match registry.encode_text() {
                        Ok(body) => (
                            StatusCode::OK,
                            [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
                            body,
                        )
                            .into_response(),
                        Err(err) => {
                            error!("failed to encode metrics: {err}");
                            (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()).into_response()
                        }
                    }
                }
            }),
        );
    }

    let workers = spawn_workers(&engine, cli.common.async_workers);

    let listener = tokio::net::TcpListener::bind(cli.common.bind)
        .await
        .with_context(|| format!("bind {}", cli.common.bind))?;
    info!(addr = %cli.common.bind, "hookd started");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    .context("server error")?;

    info!("shutting down, draining async workers");
    engine.shutdown();
    for worker in workers {
        let _ = worker.await;
    }
    info!("shutdown complete");
    Ok(())
}

/// Spawns the background workers sharing the engine's queue.
fn spawn_workers(engine: &SharedEngine, count: usize) -> Vec<tokio::task::JoinHandle<()>> {
    (0..count)
        .map(|index| {
            let worker = AsyncWorker::new(Arc::clone(engine));
            let cancel = engine.cancellation_token();
            tokio::spawn(async move {
                info!(worker = index, "async worker started");
                worker.run(cancel).await;
            })
        })
        .collect()
}

/// Resolves when SIGINT or SIGTERM arrives.
async fn shutdown_signal() {
    let mut sigterm = signal(SignalKind::terminate()).expect("failed to register SIGTERM");
    let mut sigint = signal(SignalKind::interrupt()).expect("failed to register SIGINT");

    tokio::select! {
        _ = sigterm.recv() => info!("received SIGTERM"),
        _ = sigint.recv() => info!("received SIGINT"),
    }
}
