//! Per-script manifest overrides from extended file attributes.
//!
//! A script file may carry attributes in the `user.webhook.*` namespace that
//! adjust the manifest resolved for it. Reading the attributes is a thin
//! platform collaborator returning a plain map; the merge itself is the pure
//! function [`apply_overrides`], so override semantics are testable without a
//! filesystem.
//!
//! Attribute parse failures are never fatal: the bad value is logged and
//! skipped, the request still runs.

use std::collections::HashMap;
use std::path::Path;

use tracing::warn;

use crate::manifest::Manifest;

/// Forces an async mode for the script (`auto`, `forced` or `disabled`).
pub const ATTR_ASYNC: &str = "user.webhook.async";
/// Maximum execution time, as a duration literal such as `30s`.
pub const ATTR_TIMEOUT: &str = "user.webhook.timeout";
/// Interval between async attempts, as a duration literal.
pub const ATTR_DELAY: &str = "user.webhook.delay";
/// Number of additional async attempts, as an unsigned integer.
pub const ATTR_RETRIES: &str = "user.webhook.retries";

const KNOWN_ATTRS: [&str; 4] = [ATTR_ASYNC, ATTR_TIMEOUT, ATTR_DELAY, ATTR_RETRIES];

/// Attribute name to raw value, restricted to the `user.webhook.*` names.
pub type AttrMap = HashMap<String, String>;

/// Reads the recognized override attributes of `path`.
///
/// # Errors
///
/// Returns an error when the attribute list cannot be read at all; missing
/// individual attributes are simply absent from the map.
#[cfg(unix)]
pub fn read_attrs(path: &Path) -> std::io::Result<AttrMap> {
    let mut map = AttrMap::new();
    for name in xattr::list(path)? {
        let Some(name) = name.to_str() else { continue };
        if !KNOWN_ATTRS.contains(&name) {
            continue;
        }
        if let Some(value) = xattr::get(path, name)? {
            map.insert(name.to_string(), String::from_utf8_lossy(&value).into_owned());
        }
    }
    Ok(map)
}

/// Extended attributes are unavailable on this platform.
#[cfg(not(unix))]
pub fn read_attrs(_path: &Path) -> std::io::Result<AttrMap> {
    Ok(AttrMap::new())
}

/// Merges override attributes onto a base manifest.
///
/// Unparseable values are logged and skipped; they never fail the request.
#[must_use]
pub fn apply_overrides(mut manifest: Manifest, attrs: &AttrMap) -> Manifest {
    if let Some(value) = attrs.get(ATTR_ASYNC) {
        match value.parse() {
            Ok(mode) => manifest.async_mode = mode,
            Err(err) => warn!(attr = ATTR_ASYNC, value, %err, "skipping attribute"),
        }
    }
    if let Some(value) = attrs.get(ATTR_TIMEOUT) {
        match humantime::parse_duration(value) {
            Ok(timeout) => manifest.timeout = timeout,
            Err(err) => warn!(attr = ATTR_TIMEOUT, value, %err, "skipping attribute"),
        }
    }
    if let Some(value) = attrs.get(ATTR_DELAY) {
        match humantime::parse_duration(value) {
            Ok(delay) => manifest.delay = delay,
            Err(err) => warn!(attr = ATTR_DELAY, value, %err, "skipping attribute"),
        }
    }
    if let Some(value) = attrs.get(ATTR_RETRIES) {
        match value.parse::<u32>() {
            Ok(retries) => manifest.retries = retries,
            Err(err) => warn!(attr = ATTR_RETRIES, value, %err, "skipping attribute"),
        }
    }
    manifest.normalized()
}
