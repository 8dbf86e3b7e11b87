//! Execution manifests.
//!
//! A [`Manifest`] is the resolved execution plan for a single request: the
//! command line to run plus the per-request async/timeout/retry knobs. It is
//! produced by a [`crate::runner::Runner`], never mutated afterwards, and
//! consumed by the executor (sync path) or carried inside a queue entry
//! (async path).

use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

/// Default delay between async attempts when none (or a non-positive one)
/// is configured.
pub const DEFAULT_DELAY: Duration = Duration::from_secs(3);

/// Controls when a request is processed asynchronously.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum AsyncMode {
    /// Async processing when the request carries `async=(t|1|on|ok|true|yes)`
    /// in its query string.
    #[default]
    Auto,
    /// Always async, regardless of the request.
    Forced,
    /// Never async.
    Disabled,
}

impl FromStr for AsyncMode {
    type Err = ParseAsyncModeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "auto" => Ok(Self::Auto),
            "forced" => Ok(Self::Forced),
            "disabled" => Ok(Self::Disabled),
            other => Err(ParseAsyncModeError(other.to_string())),
        }
    }
}

impl std::fmt::Display for AsyncMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Auto => write!(f, "auto"),
            Self::Forced => write!(f, "forced"),
            Self::Disabled => write!(f, "disabled"),
        }
    }
}

/// Error returned when an async-mode literal is not recognized.
#[derive(Debug, Error)]
#[error("unknown async mode {0:?} (expected auto, forced or disabled)")]
pub struct ParseAsyncModeError(String);

/// The effective execution plan for one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Manifest {
    /// Command line: executable path followed by its arguments. Non-empty
    /// once resolved; the directory runner always produces an absolute path.
    pub command: Vec<String>,

    /// When to take the async path for this request.
    pub async_mode: AsyncMode,

    /// Execution timeout. Zero means no time limit.
    pub timeout: Duration,

    /// Number of *additional* attempts beyond the first (async only).
    pub retries: u32,

    /// Delay between async attempts.
    pub delay: Duration,
}

impl Manifest {
    /// The executable path.
    ///
    /// # Panics
    ///
    /// Panics if the command line is empty; runners never hand out an empty
    /// command.
    #[must_use]
    pub fn binary(&self) -> &str {
        &self.command[0]
    }

    /// The arguments after the executable path.
    #[must_use]
    pub fn args(&self) -> &[String] {
        &self.command[1..]
    }

    /// Substitutes [`DEFAULT_DELAY`] for a zero retry delay.
    ///
    /// A zero delay combined with retries would hammer a failing script in a
    /// tight loop, so the default is applied once here and every consumer
    /// (attempt sleeps, spool-open retries) sees the same value.
    #[must_use]
    pub fn normalized(mut self) -> Self {
        if self.delay.is_zero() {
            self.delay = DEFAULT_DELAY;
        }
        self
    }

    /// Resolves the async flag for a request with the given query parameters.
    #[must_use]
    pub fn is_async(&self, query: &[(String, String)]) -> bool {
        match self.async_mode {
            AsyncMode::Disabled => false,
            AsyncMode::Forced => true,
            AsyncMode::Auto => query
                .iter()
                .find(|(k, _)| k == "async")
                .is_some_and(|(_, v)| parse_flag(v)),
        }
    }
}

/// Parses the truthy query-flag values accepted by the `async` parameter.
#[must_use]
pub fn parse_flag(value: &str) -> bool {
    matches!(
        value.to_ascii_lowercase().as_str(),
        "t" | "1" | "on" | "ok" | "true" | "yes"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manifest(mode: AsyncMode) -> Manifest {
        Manifest {
            command: vec!["/bin/true".to_string()],
            async_mode: mode,
            timeout: Duration::ZERO,
            retries: 0,
            delay: Duration::from_secs(1),
        }
    }

    fn query(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect()
    }

    #[test]
    fn test_async_mode_from_str() {
        assert_eq!("auto".parse::<AsyncMode>().unwrap(), AsyncMode::Auto);
        assert_eq!("FORCED".parse::<AsyncMode>().unwrap(), AsyncMode::Forced);
        assert_eq!(
            " disabled ".parse::<AsyncMode>().unwrap(),
            AsyncMode::Disabled
        );
        assert!("sometimes".parse::<AsyncMode>().is_err());
    }

    #[test]
    fn test_parse_flag_accepts_truthy_spellings() {
        for v in ["t", "1", "on", "ok", "true", "yes", "TRUE", "Yes"] {
            assert!(parse_flag(v), "{v} should be truthy");
        }
        for v in ["", "0", "no", "false", "y"] {
            assert!(!parse_flag(v), "{v} should be falsy");
        }
    }

    #[test]
    fn test_is_async_resolution() {
        assert!(manifest(AsyncMode::Forced).is_async(&[]));
        assert!(!manifest(AsyncMode::Disabled).is_async(&query(&[("async", "1")])));
        assert!(manifest(AsyncMode::Auto).is_async(&query(&[("async", "yes")])));
        assert!(!manifest(AsyncMode::Auto).is_async(&query(&[("async", "no")])));
        assert!(!manifest(AsyncMode::Auto).is_async(&[]));
    }

    #[test]
    fn test_normalized_substitutes_default_delay() {
        let m = Manifest {
            delay: Duration::ZERO,
            ..manifest(AsyncMode::Auto)
        };
        assert_eq!(m.normalized().delay, DEFAULT_DELAY);

        let m = Manifest {
            delay: Duration::from_millis(10),
            ..manifest(AsyncMode::Auto)
        };
        assert_eq!(m.normalized().delay, Duration::from_millis(10));
    }

    #[test]
    fn test_binary_and_args() {
        let m = Manifest {
            command: vec!["/bin/sh".into(), "-c".into(), "true".into()],
            ..manifest(AsyncMode::Auto)
        };
        assert_eq!(m.binary(), "/bin/sh");
        assert_eq!(m.args(), &["-c".to_string(), "true".to_string()]);
    }
}
