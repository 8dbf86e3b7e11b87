//! Engine configuration.
//!
//! The [`Config`] is built once at startup (CLI flags and environment in the
//! daemon binary) and is immutable afterwards. Validation happens in
//! [`Config::validate`] so misconfiguration is rejected before the server
//! binds.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::manifest::{AsyncMode, Manifest};

/// How the request body reaches the child process.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum PayloadPassing {
    /// Stream the body to the child's standard input. Never buffered in
    /// memory beyond OS pipes.
    #[default]
    Stdin,
    /// Read the whole body into memory and append it as the last command
    /// argument.
    LastArgument,
    /// Read the whole body into memory and expose it as the `REQUEST_BODY`
    /// environment variable.
    EnvVar,
}

/// Process-wide engine configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// How request bodies are handed to child processes.
    pub payload_passing: PayloadPassing,

    /// Run each script with the uid/gid of the script file's owner
    /// (Unix only, requires root).
    pub run_as_file_owner: bool,

    /// Create a fresh per-request work directory under [`Self::workdir_root`]
    /// and delete it after the child exits.
    pub isolated_workdir: bool,

    /// Parent directory for work dirs. Empty means the system temp dir when
    /// isolation is on, or "inherit the daemon's cwd" when it is off.
    pub workdir_root: PathBuf,

    /// Soft limit in bytes for response buffering. Zero disables buffering,
    /// which commits the status on the first body write.
    pub response_buffer_soft_limit: usize,

    /// Default execution timeout; zero means no limit.
    pub default_timeout: Duration,

    /// Default async mode, overridable per script via file attributes.
    pub default_async_mode: AsyncMode,

    /// Default number of additional async attempts.
    pub default_retries: u32,

    /// Default delay between async attempts.
    pub default_delay: Duration,

    /// Number of concurrent synchronous executions. Zero means 2 x CPU.
    pub sync_worker_limit: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            payload_passing: PayloadPassing::Stdin,
            run_as_file_owner: false,
            isolated_workdir: false,
            workdir_root: PathBuf::new(),
            response_buffer_soft_limit: 8192,
            default_timeout: Duration::ZERO,
            default_async_mode: AsyncMode::Auto,
            default_retries: 0,
            default_delay: Duration::ZERO,
            sync_worker_limit: 0,
        }
    }
}

impl Config {
    /// Checks platform and privilege constraints.
    ///
    /// # Errors
    ///
    /// Returns an error if `run_as_file_owner` is requested on a non-Unix
    /// platform, or on Unix without the privilege to change credentials.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.run_as_file_owner {
            #[cfg(not(unix))]
            return Err(ConfigError::CredentialDropUnsupported);

            #[cfg(unix)]
            if !nix::unistd::geteuid().is_root() {
                return Err(ConfigError::CredentialDropRequiresRoot);
            }
        }
        Ok(())
    }

    /// The base manifest every runner starts from, already normalized.
    #[must_use]
    pub fn default_manifest(&self) -> Manifest {
        Manifest {
            command: Vec::new(),
            async_mode: self.default_async_mode,
            timeout: self.default_timeout,
            retries: self.default_retries,
            delay: self.default_delay,
        }
        .normalized()
    }

    /// Resolved sync-worker permit count (2 x CPU when unset).
    #[must_use]
    pub fn sync_workers(&self) -> usize {
        if self.sync_worker_limit > 0 {
            return self.sync_worker_limit;
        }
        2 * std::thread::available_parallelism().map_or(1, std::num::NonZeroUsize::get)
    }
}

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Credential drop was requested on a platform without uid/gid.
    #[error("run-as-file-owner is only supported on Unix platforms")]
    CredentialDropUnsupported,

    /// Credential drop was requested without the privilege to use it.
    #[error("run-as-file-owner requires running as root")]
    CredentialDropRequiresRoot,
}
