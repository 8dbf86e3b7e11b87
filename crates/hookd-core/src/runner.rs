//! Request-to-manifest resolution.
//!
//! A [`Runner`] turns an inbound request into a [`Manifest`] or refuses with
//! `None` (which the gateway reports as 404). Two variants exist:
//!
//! - [`Runner::Static`]: every request runs the same fixed command line.
//! - [`Runner::Directory`]: the URL path selects a script under a root
//!   directory, with containment and dot-file rules, and per-file attribute
//!   overrides merged onto the default manifest.

use std::path::{Component, Path, PathBuf};

use tracing::warn;

use crate::attrs::{apply_overrides, read_attrs};
use crate::manifest::Manifest;
use crate::request::RequestMeta;

/// Maps requests to execution manifests.
#[derive(Debug, Clone)]
pub enum Runner {
    /// Fixed command line for every request.
    Static {
        /// Executable path followed by its arguments.
        command: Vec<String>,
    },
    /// Path-based lookup in a scripts directory.
    Directory {
        /// Absolute root of the scripts tree.
        scripts_root: PathBuf,
        /// Allow path components starting with a dot.
        allow_dot_files: bool,
    },
}

impl Runner {
    /// Convenience constructor for the static variant.
    pub fn static_command<I, S>(command: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::Static {
            command: command.into_iter().map(Into::into).collect(),
        }
    }

    /// Convenience constructor for the directory variant.
    pub fn directory(scripts_root: impl Into<PathBuf>, allow_dot_files: bool) -> Self {
        Self::Directory {
            scripts_root: scripts_root.into(),
            allow_dot_files,
        }
    }

    /// Resolves a request into a manifest, or `None` when the request maps
    /// to nothing runnable.
    #[must_use]
    pub fn resolve(&self, meta: &RequestMeta, base: &Manifest) -> Option<Manifest> {
        match self {
            Self::Static { command } => {
                let mut manifest = base.clone();
                manifest.command.clone_from(command);
                Some(manifest)
            }
            Self::Directory {
                scripts_root,
                allow_dot_files,
            } => resolve_script(scripts_root, *allow_dot_files, meta, base),
        }
    }
}

fn resolve_script(
    scripts_root: &Path,
    allow_dot_files: bool,
    meta: &RequestMeta,
    base: &Manifest,
) -> Option<Manifest> {
    let script = clean_join(scripts_root, meta.path.trim_start_matches('/'));

    // The resolved path must stay strictly inside the scripts root.
    let relative = match script.strip_prefix(scripts_root) {
        Ok(rel) if !rel.as_os_str().is_empty() => rel,
        _ => {
            warn!(path = %meta.path, "request escapes the scripts directory");
            return None;
        }
    };

    if !allow_dot_files && has_dot_component(relative) {
        warn!(path = %meta.path, "request targets a dot file");
        return None;
    }

    let mut manifest = base.clone();
    manifest.command = vec![script.to_string_lossy().into_owned()];

    match read_attrs(&script) {
        Ok(attrs) => manifest = apply_overrides(manifest, &attrs),
        Err(err) => warn!(script = %script.display(), %err, "failed to read file attributes"),
    }

    Some(manifest)
}

/// Joins and lexically normalizes, resolving `.` and `..` components without
/// touching the filesystem.
fn clean_join(root: &Path, relative: &str) -> PathBuf {
    let mut out = root.to_path_buf();
    for component in Path::new(relative).components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            Component::Normal(part) => out.push(part),
            // A rooted or prefixed component restarts the path.
            Component::RootDir | Component::Prefix(_) => out = PathBuf::from("/"),
        }
    }
    out
}

fn has_dot_component(relative: &Path) -> bool {
    relative.components().any(|component| {
        matches!(component, Component::Normal(part)
            if part.to_string_lossy().starts_with('.'))
    })
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use axum::http::HeaderMap;

    use super::*;
    use crate::manifest::AsyncMode;

    fn base() -> Manifest {
        Manifest {
            command: Vec::new(),
            async_mode: AsyncMode::Auto,
            timeout: Duration::from_secs(120),
            retries: 0,
            delay: Duration::from_secs(3),
        }
    }

    fn meta(path: &str) -> RequestMeta {
        RequestMeta::from_wire(
            "POST".to_string(),
            path.to_string(),
            String::new(),
            HeaderMap::new(),
            String::new(),
        )
    }

    #[test]
    fn test_static_runner_keeps_defaults() {
        let runner = Runner::static_command(["/bin/echo", "-n", "123"]);
        let manifest = runner.resolve(&meta("/anything"), &base()).unwrap();
        assert_eq!(manifest.command, vec!["/bin/echo", "-n", "123"]);
        assert_eq!(manifest.timeout, Duration::from_secs(120));
    }

    #[test]
    fn test_directory_runner_resolves_inside_root() {
        let runner = Runner::directory("/srv/scripts", false);
        let manifest = runner.resolve(&meta("/deploy/run.sh"), &base()).unwrap();
        assert_eq!(manifest.command, vec!["/srv/scripts/deploy/run.sh"]);
    }

    #[test]
    fn test_traversal_is_rejected() {
        let runner = Runner::directory("/srv/scripts", false);
        assert!(runner.resolve(&meta("/../etc/passwd"), &base()).is_none());
        assert!(
            runner
                .resolve(&meta("/a/../../etc/passwd"), &base())
                .is_none()
        );
        assert!(runner.resolve(&meta("/%2e%2e/etc/passwd"), &base()).is_none());
    }

    #[test]
    fn test_root_itself_is_not_runnable() {
        let runner = Runner::directory("/srv/scripts", false);
        assert!(runner.resolve(&meta("/"), &base()).is_none());
        assert!(runner.resolve(&meta("/a/.."), &base()).is_none());
    }

    #[test]
    fn test_dot_files_rejected_unless_allowed() {
        let runner = Runner::directory("/srv/scripts", false);
        assert!(runner.resolve(&meta("/.hidden/run.sh"), &base()).is_none());
        assert!(runner.resolve(&meta("/jobs/.secret.sh"), &base()).is_none());

        let permissive = Runner::directory("/srv/scripts", true);
        assert!(
            permissive
                .resolve(&meta("/jobs/.secret.sh"), &base())
                .is_some()
        );
    }

    #[test]
    fn test_inner_parent_components_resolve_lexically() {
        let runner = Runner::directory("/srv/scripts", false);
        let manifest = runner.resolve(&meta("/a/b/../run.sh"), &base()).unwrap();
        assert_eq!(manifest.command, vec!["/srv/scripts/a/run.sh"]);
    }
}
