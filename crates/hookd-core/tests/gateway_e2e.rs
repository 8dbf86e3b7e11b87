//! End-to-end tests for the synchronous execution path, driven over a real
//! loopback socket so status framing, header propagation and body streaming
//! are exercised exactly as a client would see them.

mod common;

use std::time::Duration;

use common::{engine, send, spawn_server, write_script};
use hookd_core::config::Config;
use hookd_core::runner::Runner;

#[tokio::test]
async fn test_static_runner_echoes_body() {
    let engine = engine(Config::default(), Runner::static_command(["/bin/cat"]));
    let addr = spawn_server(&engine).await;

    let response = send(addr, "POST", "/", &[], b"hello").await;
    assert_eq!(response.status, 200);
    assert_eq!(response.body, b"hello");
}

#[tokio::test]
async fn test_content_length_header_reaches_child() {
    let scripts = tempfile::tempdir().unwrap();
    write_script(
        scripts.path(),
        "len.sh",
        "printf '%s' \"$HEADER_CONTENT_LENGTH\"",
    );
    let engine = engine(
        Config::default(),
        Runner::directory(scripts.path(), false),
    );
    let addr = spawn_server(&engine).await;

    let response = send(addr, "POST", "/len.sh", &[], b"hello").await;
    assert_eq!(response.status, 200);
    assert_eq!(response.body, b"5");
}

#[tokio::test]
async fn test_directory_runner_success() {
    let scripts = tempfile::tempdir().unwrap();
    write_script(scripts.path(), "echo.sh", "printf 123");
    let engine = engine(
        Config::default(),
        Runner::directory(scripts.path(), false),
    );
    let addr = spawn_server(&engine).await;

    let response = send(addr, "POST", "/echo.sh", &[], b"").await;
    assert_eq!(response.status, 200);
    assert_eq!(response.body, b"123");
}

#[tokio::test]
async fn test_traversal_is_blocked() {
    let scripts = tempfile::tempdir().unwrap();
    let engine = engine(
        Config::default(),
        Runner::directory(scripts.path(), false),
    );
    let addr = spawn_server(&engine).await;

    let response = send(addr, "POST", "/../etc/passwd", &[], b"").await;
    assert_eq!(response.status, 404);
}

#[tokio::test]
async fn test_unknown_script_is_404() {
    let scripts = tempfile::tempdir().unwrap();
    let engine = engine(
        Config::default(),
        Runner::directory(scripts.path(), false),
    );
    let addr = spawn_server(&engine).await;

    let response = send(addr, "POST", "/missing.sh", &[], b"").await;
    assert_eq!(response.status, 404);
}

#[tokio::test]
async fn test_script_failure_maps_to_502_with_x_error() {
    let scripts = tempfile::tempdir().unwrap();
    write_script(scripts.path(), "fail.sh", "exit 7");
    let engine = engine(
        Config::default(),
        Runner::directory(scripts.path(), false),
    );
    let addr = spawn_server(&engine).await;

    let response = send(addr, "POST", "/fail.sh", &[], b"").await;
    assert_eq!(response.status, 502);
    assert!(response.headers.contains_key("x-error"));
}

#[tokio::test]
async fn test_timeout_maps_to_504() {
    let scripts = tempfile::tempdir().unwrap();
    write_script(scripts.path(), "slow.sh", "sleep 5");
    let config = Config {
        default_timeout: Duration::from_millis(100),
        ..Config::default()
    };
    let engine = engine(config, Runner::directory(scripts.path(), false));
    let addr = spawn_server(&engine).await;

    let started = std::time::Instant::now();
    let response = send(addr, "POST", "/slow.sh", &[], b"").await;
    assert_eq!(response.status, 504);
    assert!(response.headers.contains_key("x-error"));
    assert!(started.elapsed() < Duration::from_secs(3));
}

#[tokio::test]
async fn test_zero_timeout_disables_deadline() {
    let scripts = tempfile::tempdir().unwrap();
    write_script(scripts.path(), "slowish.sh", "sleep 1; printf done");
    let config = Config {
        default_timeout: Duration::ZERO,
        ..Config::default()
    };
    let engine = engine(config, Runner::directory(scripts.path(), false));
    let addr = spawn_server(&engine).await;

    let response = send(addr, "POST", "/slowish.sh", &[], b"").await;
    assert_eq!(response.status, 200);
    assert_eq!(response.body, b"done");
}

#[tokio::test]
async fn test_failure_after_buffer_overflow_keeps_committed_status() {
    let scripts = tempfile::tempdir().unwrap();
    // Writes well past the soft limit, then fails: the 200 head is already
    // committed, so the client sees the output and never the failure.
    write_script(
        scripts.path(),
        "late_fail.sh",
        "i=0; while [ $i -lt 64 ]; do printf x; i=$((i+1)); done; exit 1",
    );
    let config = Config {
        response_buffer_soft_limit: 16,
        ..Config::default()
    };
    let engine = engine(config, Runner::directory(scripts.path(), false));
    let addr = spawn_server(&engine).await;

    let response = send(addr, "POST", "/late_fail.sh", &[], b"").await;
    assert_eq!(response.status, 200);
    assert_eq!(response.body.len(), 64);
    assert!(!response.headers.contains_key("x-error"));
}

#[tokio::test]
async fn test_subject_header_is_forwarded_to_child() {
    let scripts = tempfile::tempdir().unwrap();
    write_script(
        scripts.path(),
        "whoami.sh",
        "printf '%s' \"$HEADER_X_SUBJECT\"",
    );
    let engine = engine(
        Config::default(),
        Runner::directory(scripts.path(), false),
    );
    let addr = spawn_server(&engine).await;

    let response = send(addr, "POST", "/whoami.sh", &[("x-subject", "alice")], b"").await;
    assert_eq!(response.status, 200);
    assert_eq!(response.body, b"alice");
}

#[tokio::test]
async fn test_query_parameters_become_env() {
    let scripts = tempfile::tempdir().unwrap();
    write_script(
        scripts.path(),
        "page.sh",
        "printf '%s/%s' \"$QUERY_PAGE\" \"$REQUEST_PATH\"",
    );
    let engine = engine(
        Config::default(),
        Runner::directory(scripts.path(), false),
    );
    let addr = spawn_server(&engine).await;

    let response = send(addr, "GET", "/page.sh?page=42", &[], b"").await;
    assert_eq!(response.status, 200);
    assert_eq!(response.body, b"42//page.sh");
}
