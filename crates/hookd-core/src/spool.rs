//! On-disk spooling of HTTP requests for async processing.
//!
//! A spooled request is the plain HTTP/1.x wire form of the inbound request:
//! request line, headers, then the raw body bytes. The file is written once
//! by the gateway and re-parsed (possibly several times, seeking back to
//! zero between attempts) by an async worker. The body is everything after
//! the header block up to EOF; `Content-Length` is informational only, which
//! keeps the round trip byte-exact.
//!
//! Parsing uses `httparse`, the same parser hyper runs on the live path.

use std::io::{self, SeekFrom};

use axum::http::{HeaderMap, HeaderName, HeaderValue};
use tempfile::NamedTempFile;
use thiserror::Error;
use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

use crate::request::{BodyReader, InboundRequest, RequestMeta};

/// Upper bound for the request line plus headers of a spooled request.
pub const MAX_HEAD_BYTES: usize = 64 * 1024;

/// Header slots for the parser; more headers than this fail the parse.
const MAX_HEADERS: usize = 100;

/// Spool I/O and parse errors.
#[derive(Debug, Error)]
pub enum SpoolError {
    /// Creating the temp file failed.
    #[error("create spool file: {0}")]
    Create(#[source] io::Error),

    /// Writing the serialized request failed.
    #[error("write spool file: {0}")]
    Write(#[source] io::Error),

    /// Reading the spooled request back failed.
    #[error("read spool file: {0}")]
    Read(#[source] io::Error),

    /// The stored bytes do not parse as an HTTP request.
    #[error("malformed spooled request: {0}")]
    Parse(String),

    /// The stored head exceeds [`MAX_HEAD_BYTES`].
    #[error("request head exceeds {MAX_HEAD_BYTES} bytes")]
    HeadTooLarge,
}

/// Serializes a request into a fresh spool temp file (mode 0600 on Unix).
///
/// The returned [`NamedTempFile`] still owns the path: dropping it removes
/// the file, so the caller only persists it once the queue has accepted the
/// item.
///
/// # Errors
///
/// Returns an error when the file cannot be created or written; the temp
/// file is cleaned up by its own drop in that case.
pub async fn write_request(
    meta: &RequestMeta,
    mut body: impl AsyncRead + Unpin,
) -> Result<NamedTempFile, SpoolError> {
    let tmp = tempfile::Builder::new()
        .prefix("hookd-spool-")
        .tempfile()
        .map_err(SpoolError::Create)?;
    let handle = tmp.as_file().try_clone().map_err(SpoolError::Create)?;
    let mut file = File::from_std(handle);

    let mut head = format!("{} {} HTTP/1.1\r\n", meta.method, meta.request_target());
    for (name, value) in &meta.headers {
        head.push_str(name.as_str());
        head.push_str(": ");
        head.push_str(&String::from_utf8_lossy(value.as_bytes()));
        head.push_str("\r\n");
    }
    head.push_str("\r\n");

    file.write_all(head.as_bytes())
        .await
        .map_err(SpoolError::Write)?;
    tokio::io::copy(&mut body, &mut file)
        .await
        .map_err(SpoolError::Write)?;
    file.flush().await.map_err(SpoolError::Write)?;

    Ok(tmp)
}

/// Parses a spooled request back from `file`.
///
/// Seeks to the start first, so one open file handle can be replayed for
/// every attempt. The returned request's body is the remainder of the file;
/// its `client_addr` is empty (the original peer is gone).
///
/// # Errors
///
/// Returns an error on I/O failure or when the stored bytes are not a
/// complete HTTP request.
pub async fn read_request(mut file: File) -> Result<InboundRequest, SpoolError> {
    file.seek(SeekFrom::Start(0))
        .await
        .map_err(SpoolError::Read)?;

    let mut buf: Vec<u8> = Vec::with_capacity(8192);
    let mut chunk = [0u8; 8192];
    let (method, target, headers, offset) = loop {
        let n = file.read(&mut chunk).await.map_err(SpoolError::Read)?;
        if n == 0 {
            return Err(SpoolError::Parse("truncated request head".to_string()));
        }
        buf.extend_from_slice(&chunk[..n]);

        let mut header_slots = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut parsed = httparse::Request::new(&mut header_slots);
        match parsed.parse(&buf) {
            Ok(httparse::Status::Complete(offset)) => {
                let method = parsed
                    .method
                    .ok_or_else(|| SpoolError::Parse("missing method".to_string()))?
                    .to_string();
                let target = parsed
                    .path
                    .ok_or_else(|| SpoolError::Parse("missing request target".to_string()))?
                    .to_string();

                let mut headers = HeaderMap::new();
                for header in parsed.headers.iter() {
                    let name = HeaderName::from_bytes(header.name.as_bytes())
                        .map_err(|err| SpoolError::Parse(err.to_string()))?;
                    let value = HeaderValue::from_bytes(header.value)
                        .map_err(|err| SpoolError::Parse(err.to_string()))?;
                    headers.append(name, value);
                }
                break (method, target, headers, offset);
            }
            Ok(httparse::Status::Partial) => {
                if buf.len() > MAX_HEAD_BYTES {
                    return Err(SpoolError::HeadTooLarge);
                }
            }
            Err(err) => return Err(SpoolError::Parse(err.to_string())),
        }
    };

    let (raw_path, raw_query) = match target.split_once('?') {
        Some((path, query)) => (path.to_string(), query.to_string()),
        None => (target, String::new()),
    };
    let meta = RequestMeta::from_wire(method, raw_path, raw_query, headers, String::new());

    let leftover = buf.split_off(offset);
    drop(buf);
    let body: BodyReader = Box::pin(io::Cursor::new(leftover).chain(file));
    Ok(InboundRequest::new(meta, body))
}
