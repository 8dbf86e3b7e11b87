//! POSIX credential hooks for running scripts as their file owner.
//!
//! When `run_as_file_owner` is enabled, the child process runs with the
//! uid/gid of the script file, gets `USER`/`HOME` from the passwd entry when
//! one exists, and any isolated work dir is chowned to the same owner before
//! spawn. Config validation guarantees these functions are only reached on
//! Unix with the privilege to change credentials.

#[cfg(not(unix))]
use std::path::Path;

use thiserror::Error;

/// Credential hook errors.
#[derive(Debug, Error)]
pub enum CredsError {
    /// The script file could not be stat'ed.
    #[error("stat {path}: {source}")]
    Stat {
        /// Script path.
        path: String,
        /// Underlying errno.
        source: std::io::Error,
    },

    /// The work directory could not be chowned to the script owner.
    #[error("chown {path}: {source}")]
    Chown {
        /// Work directory path.
        path: String,
        /// Underlying errno.
        source: std::io::Error,
    },
}

impl CredsError {
    /// Whether the failure was a missing script file.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::Stat { source, .. }
            if source.kind() == std::io::ErrorKind::NotFound)
    }
}

#[cfg(unix)]
pub use unix::{chown_as_file, set_run_credentials};

#[cfg(unix)]
mod unix {
    use std::path::Path;

    use nix::sys::stat::stat;
    use nix::unistd::{Gid, Uid, User, chown};
    use tokio::process::Command;

    use super::CredsError;

    fn stat_owner(script: &Path) -> Result<(u32, u32), CredsError> {
        let st = stat(script).map_err(|errno| CredsError::Stat {
            path: script.display().to_string(),
            source: std::io::Error::from(errno),
        })?;
        Ok((st.st_uid, st.st_gid))
    }

    /// Configures `cmd` to run with the uid/gid owning `script`, injecting
    /// `USER` and `HOME` when the passwd entry resolves.
    ///
    /// # Errors
    ///
    /// Returns an error when the script cannot be stat'ed.
    pub fn set_run_credentials(cmd: &mut Command, script: &Path) -> Result<(), CredsError> {
        let (uid, gid) = stat_owner(script)?;
        cmd.uid(uid);
        cmd.gid(gid);

        if let Ok(Some(user)) = User::from_uid(Uid::from_raw(uid)) {
            cmd.env("USER", &user.name);
            cmd.env("HOME", &user.dir);
        }
        Ok(())
    }

    /// Changes the owner of `dir` to the uid/gid owning `script`.
    ///
    /// # Errors
    ///
    /// Returns an error when the script cannot be stat'ed or the chown fails.
    pub fn chown_as_file(dir: &Path, script: &Path) -> Result<(), CredsError> {
        let (uid, gid) = stat_owner(script)?;
        chown(dir, Some(Uid::from_raw(uid)), Some(Gid::from_raw(gid))).map_err(|errno| {
            CredsError::Chown {
                path: dir.display().to_string(),
                source: std::io::Error::from(errno),
            }
        })
    }
}

/// Credential drop is rejected at configuration time off Unix; this stub
/// keeps call sites compiling.
#[cfg(not(unix))]
pub fn set_run_credentials(
    _cmd: &mut tokio::process::Command,
    _script: &Path,
) -> Result<(), CredsError> {
    unreachable!("credential drop is rejected by Config::validate off Unix")
}

/// See [`set_run_credentials`].
#[cfg(not(unix))]
pub fn chown_as_file(_dir: &Path, _script: &Path) -> Result<(), CredsError> {
    unreachable!("credential drop is rejected by Config::validate off Unix")
}
