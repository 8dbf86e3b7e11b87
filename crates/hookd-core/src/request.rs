//! Engine-internal request model.
//!
//! The executor and spooler never touch transport types directly; both the
//! live axum path and the spool-replay path build an [`InboundRequest`] and
//! hand it over. This keeps the engine testable without an HTTP server and
//! lets a replayed request flow through exactly the same code as a live one.

use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::AtomicU64;

use axum::body::Body;
use axum::http::HeaderMap;
use axum::http::request::Parts;
use futures::TryStreamExt;
use percent_encoding::percent_decode_str;
use tokio::io::AsyncRead;
use tokio_util::io::StreamReader;

use crate::stream::MeteredReader;

/// Boxed request-body reader.
pub type BodyReader = Pin<Box<dyn AsyncRead + Send>>;

/// Request metadata shared by routing, env wiring, spooling and metrics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestMeta {
    /// HTTP method, e.g. `POST`.
    pub method: String,

    /// Percent-decoded URL path; used for routing and `REQUEST_PATH`.
    pub path: String,

    /// The path exactly as it appeared on the request line, still encoded;
    /// preserved so spooled requests round-trip byte-exactly.
    pub raw_path: String,

    /// Raw query string without the leading `?`, possibly empty.
    pub raw_query: String,

    /// Decoded query pairs in request order.
    pub query: Vec<(String, String)>,

    /// Request headers.
    pub headers: HeaderMap,

    /// Remote peer address, verbatim. Empty for replayed requests: the peer
    /// is gone, and it is never derived from forwarding headers.
    pub client_addr: String,
}

impl RequestMeta {
    /// Builds metadata from parsed axum request parts.
    #[must_use]
    pub fn from_http(parts: &Parts, client_addr: String) -> Self {
        let raw_path = parts.uri.path().to_string();
        let raw_query = parts.uri.query().unwrap_or_default().to_string();
        Self::from_wire(
            parts.method.as_str().to_string(),
            raw_path,
            raw_query,
            parts.headers.clone(),
            client_addr,
        )
    }

    /// Builds metadata from wire-level components (also the spool-replay
    /// entry point).
    #[must_use]
    pub fn from_wire(
        method: String,
        raw_path: String,
        raw_query: String,
        headers: HeaderMap,
        client_addr: String,
    ) -> Self {
        let path = percent_decode_str(&raw_path)
            .decode_utf8_lossy()
            .into_owned();
        let query = form_urlencoded::parse(raw_query.as_bytes())
            .into_owned()
            .collect();
        Self {
            method,
            path,
            raw_path,
            raw_query,
            query,
            headers,
            client_addr,
        }
    }

    /// The request target for the wire request line: encoded path plus query.
    #[must_use]
    pub fn request_target(&self) -> String {
        if self.raw_query.is_empty() {
            self.raw_path.clone()
        } else {
            format!("{}?{}", self.raw_path, self.raw_query)
        }
    }
}

/// A request ready for execution: metadata plus a byte-counted body reader.
pub struct InboundRequest {
    /// Request metadata.
    pub meta: RequestMeta,
    body: MeteredReader<BodyReader>,
}

impl std::fmt::Debug for InboundRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InboundRequest")
            .field("meta", &self.meta)
            .finish_non_exhaustive()
    }
}

impl InboundRequest {
    /// Wraps any body reader with byte metering.
    #[must_use]
    pub fn new(meta: RequestMeta, body: BodyReader) -> Self {
        Self {
            meta,
            body: MeteredReader::new(body),
        }
    }

    /// Builds a request from a live axum body.
    #[must_use]
    pub fn from_live(meta: RequestMeta, body: Body) -> Self {
        Self::new(meta, body_reader(body))
    }

    /// Handle to the body byte counter; stays valid after the body has moved
    /// into the executor.
    #[must_use]
    pub fn bytes_read(&self) -> Arc<AtomicU64> {
        self.body.counter()
    }

    /// Splits into metadata and body reader.
    #[must_use]
    pub fn into_parts(self) -> (RequestMeta, MeteredReader<BodyReader>) {
        (self.meta, self.body)
    }
}

/// Converts an axum [`Body`] into an [`AsyncRead`].
#[must_use]
pub fn body_reader(body: Body) -> BodyReader {
    let stream = body.into_data_stream().map_err(io::Error::other);
    Box::pin(StreamReader::new(Box::pin(stream)))
}
