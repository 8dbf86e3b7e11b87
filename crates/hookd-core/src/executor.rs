//! Script execution.
//!
//! Given a resolved [`Manifest`] and a live request, the executor prepares
//! the work directory, wires request metadata into the child environment,
//! plumbs the payload, spawns the process, enforces the timeout, and streams
//! stdout into the buffered response. Failures are mapped to HTTP statuses
//! by [`ExecError::status_code`]; the caller decides what to do with them.

use std::io;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};

use axum::http::StatusCode;
use tempfile::TempDir;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};

use crate::config::{Config, PayloadPassing};
use crate::creds::{self, CredsError};
use crate::manifest::Manifest;
use crate::request::{InboundRequest, RequestMeta};
use crate::stream::BufferedResponse;

/// Execution failures, each mapping to an HTTP status.
#[derive(Debug, Error)]
pub enum ExecError {
    /// The executable does not exist (or disappeared mid-flight).
    #[error("executable not found")]
    NotFound,

    /// The execution deadline fired before the child exited.
    #[error("execution timed out")]
    Timeout,

    /// The client went away while the child was still running.
    #[error("client disconnected")]
    Disconnected,

    /// The request payload could not be read (cache modes only).
    #[error("read request payload: {0}")]
    Payload(#[source] io::Error),

    /// The per-request work directory could not be created.
    #[error("create work directory: {0}")]
    Workdir(#[source] io::Error),

    /// Credential drop or work-dir chown failed.
    #[error(transparent)]
    Credentials(CredsError),

    /// The child process could not be spawned.
    #[error("spawn {binary}: {source}")]
    Spawn {
        /// The executable we tried to run.
        binary: String,
        /// Underlying error.
        source: io::Error,
    },

    /// The child exited with a non-zero status.
    #[error("script failed: {0}")]
    Exit(ExitStatus),

    /// I/O failed while streaming stdio.
    #[error("stream child i/o: {0}")]
    Io(#[source] io::Error),
}

impl ExecError {
    /// The HTTP status this failure is reported as.
    ///
    /// - missing executable: 404
    /// - deadline exceeded: 504
    /// - payload read failure: 400
    /// - setup failures (work dir, credentials): 500
    /// - everything else (spawn, non-zero exit, stream errors): 502
    #[must_use]
    pub const fn status_code(&self) -> StatusCode {
        match self {
            Self::NotFound => StatusCode::NOT_FOUND,
            Self::Timeout => StatusCode::GATEWAY_TIMEOUT,
            Self::Payload(_) => StatusCode::BAD_REQUEST,
            Self::Workdir(_) | Self::Credentials(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Disconnected | Self::Spawn { .. } | Self::Exit(_) | Self::Io(_) => {
                StatusCode::BAD_GATEWAY
            }
        }
    }
}

/// The child's working directory for one request.
///
/// The ephemeral variant owns a [`TempDir`], so the directory is removed on
/// every exit path, including panics and cancellation.
enum WorkDir {
    Inherit,
    Fixed(PathBuf),
    Ephemeral(TempDir),
}

impl WorkDir {
    fn path(&self) -> Option<&Path> {
        match self {
            Self::Inherit => None,
            Self::Fixed(path) => Some(path),
            Self::Ephemeral(dir) => Some(dir.path()),
        }
    }
}

fn prepare_workdir(config: &Config, script: &str) -> Result<WorkDir, ExecError> {
    if !config.isolated_workdir {
        if config.workdir_root.as_os_str().is_empty() {
            return Ok(WorkDir::Inherit);
        }
        return Ok(WorkDir::Fixed(config.workdir_root.clone()));
    }

    let dir = if config.workdir_root.as_os_str().is_empty() {
        TempDir::new()
    } else {
        TempDir::new_in(&config.workdir_root)
    }
    .map_err(ExecError::Workdir)?;

    if config.run_as_file_owner {
        // On failure the TempDir drop removes the directory again.
        creds::chown_as_file(dir.path(), Path::new(script)).map_err(|err| {
            if err.is_not_found() {
                ExecError::NotFound
            } else {
                ExecError::Credentials(err)
            }
        })?;
    }

    Ok(WorkDir::Ephemeral(dir))
}

/// Converts a header or query key to its environment form: uppercased with
/// `-` replaced by `_`.
pub(crate) fn env_name(name: &str) -> String {
    name.to_uppercase().replace('-', "_")
}

/// Builds the `HEADER_*`, `QUERY_*` and fixed request variables.
fn request_env(meta: &RequestMeta) -> Vec<(String, String)> {
    let mut env = Vec::new();

    for key in meta.headers.keys() {
        let joined = meta
            .headers
            .get_all(key)
            .iter()
            .map(|value| String::from_utf8_lossy(value.as_bytes()).into_owned())
            .collect::<Vec<_>>()
            .join(",");
        env.push((format!("HEADER_{}", env_name(key.as_str())), joined));
    }

    let mut grouped: Vec<(&String, Vec<&str>)> = Vec::new();
    for (key, value) in &meta.query {
        match grouped.iter_mut().find(|(name, _)| *name == key) {
            Some((_, values)) => values.push(value),
            None => grouped.push((key, vec![value])),
        }
    }
    for (key, values) in grouped {
        env.push((format!("QUERY_{}", env_name(key)), values.join(",")));
    }

    env.push(("REQUEST_PATH".to_string(), meta.path.clone()));
    env.push(("REQUEST_METHOD".to_string(), meta.method.clone()));
    env.push(("CLIENT_ADDR".to_string(), meta.client_addr.clone()));
    env
}

async fn read_payload(body: &mut (impl AsyncRead + Unpin)) -> Result<Vec<u8>, ExecError> {
    let mut buf = Vec::new();
    body.read_to_end(&mut buf).await.map_err(ExecError::Payload)?;
    Ok(buf)
}

async fn reap(child: &mut Child) {
    let _ = child.start_kill();
    let _ = child.wait().await;
}

/// Runs the manifest for one request, streaming stdout into `response`.
///
/// The parent environment is inherited. The function returns once the child
/// has exited (or was killed); the caller is responsible for mapping the
/// error into the response and flushing it.
///
/// # Errors
///
/// See [`ExecError`] for the failure classes and their status mapping.
#[allow(clippy::too_many_lines)]
pub async fn execute(
    config: &Config,
    manifest: &Manifest,
    request: InboundRequest,
    response: &mut BufferedResponse,
) -> Result<(), ExecError> {
    let (meta, mut body) = request.into_parts();

    let workdir = prepare_workdir(config, manifest.binary())?;

    let mut cmd = Command::new(manifest.binary());
    cmd.args(manifest.args());
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::null());
    cmd.kill_on_drop(true);
    if let Some(dir) = workdir.path() {
        cmd.current_dir(dir);
    }
    for (key, value) in request_env(&meta) {
        cmd.env(key, value);
    }

    let mut stream_stdin = false;
    match config.payload_passing {
        PayloadPassing::Stdin => {
            cmd.stdin(Stdio::piped());
            stream_stdin = true;
        }
        PayloadPassing::LastArgument => {
            let payload = read_payload(&mut body).await?;
            cmd.arg(String::from_utf8_lossy(&payload).into_owned());
            cmd.stdin(Stdio::null());
        }
        PayloadPassing::EnvVar => {
            let payload = read_payload(&mut body).await?;
            cmd.env("REQUEST_BODY", String::from_utf8_lossy(&payload).into_owned());
            cmd.stdin(Stdio::null());
        }
    }

    if config.run_as_file_owner {
        creds::set_run_credentials(&mut cmd, Path::new(manifest.binary())).map_err(|err| {
            if err.is_not_found() {
                ExecError::NotFound
            } else {
                ExecError::Credentials(err)
            }
        })?;
    }

    let mut child = cmd.spawn().map_err(|err| {
        if err.kind() == io::ErrorKind::NotFound {
            ExecError::NotFound
        } else {
            ExecError::Spawn {
                binary: manifest.binary().to_string(),
                source: err,
            }
        }
    })?;

    let pump = if stream_stdin {
        let mut stdin = child.stdin.take().expect("stdin was piped");
        Some(tokio::spawn(async move {
            // A broken pipe only means the child stopped reading early.
            let _ = tokio::io::copy(&mut body, &mut stdin).await;
            drop(stdin);
        }))
    } else {
        None
    };

    let mut stdout = child.stdout.take().expect("stdout was piped");
    let mut disconnected = response.disconnect_signal();

    enum Outcome {
        Done(io::Result<ExitStatus>),
        TimedOut,
        Disconnected,
    }

    let outcome = {
        let drive = async {
            let mut buf = [0u8; 8192];
            loop {
                let n = stdout.read(&mut buf).await?;
                if n == 0 {
                    break;
                }
                response.write(&buf[..n]).await?;
            }
            child.wait().await
        };
        tokio::pin!(drive);

        let deadline = async {
            if manifest.timeout.is_zero() {
                std::future::pending::<()>().await;
            } else {
                tokio::time::sleep(manifest.timeout).await;
            }
        };
        tokio::pin!(deadline);

        tokio::select! {
            result = &mut drive => Outcome::Done(result),
            () = &mut deadline => Outcome::TimedOut,
            () = &mut disconnected => Outcome::Disconnected,
        }
    };

    // The child is done (or about to be killed); the pump must not keep the
    // body reader alive, e.g. a spool handle whose offset the next replay
    // attempt will rewind.
    if let Some(task) = pump {
        task.abort();
    }

    match outcome {
        Outcome::Done(Ok(status)) if status.success() => Ok(()),
        Outcome::Done(Ok(status)) => Err(ExecError::Exit(status)),
        Outcome::Done(Err(err)) => {
            reap(&mut child).await;
            Err(ExecError::Io(err))
        }
        Outcome::TimedOut => {
            reap(&mut child).await;
            Err(ExecError::Timeout)
        }
        Outcome::Disconnected => {
            reap(&mut child).await;
            Err(ExecError::Disconnected)
        }
    }
}
