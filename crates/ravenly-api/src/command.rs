// Command abstraction.
//
// A command describes one HTTP call without reference to a specific
// node: the executor asks it to build a request for whichever node it
// picked, and may ask again for a different node on failover. Optional
// capabilities (idempotency key, not-found/not-modified handling) are
// default methods rather than separate marker traits.

use std::marker::PhantomData;

use bytes::Bytes;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::{Method, StatusCode};
use serde::Serialize;
use serde::de::DeserializeOwned;
use url::Url;

use crate::error::Error;
use crate::node::ServerNode;

// ── Protocol header names ────────────────────────────────────────────

pub const ETAG_HEADER: &str = "ETag";
pub const IF_NONE_MATCH_HEADER: &str = "If-None-Match";
pub const REFRESH_TOPOLOGY_HEADER: &str = "Refresh-Topology";
pub const SERVER_VERSION_HEADER: &str = "Raven-Server-Version";
pub const DATABASE_MISSING_HEADER: &str = "Database-Missing";
pub const RESPONSIBLE_NODE_HEADER: &str = "Raven-Responsible-Node";

/// Query parameter carrying a command's idempotency key.
pub const RAFT_REQUEST_ID_PARAM: &str = "raft-request-id";

// ── Raw request / response ───────────────────────────────────────────

/// A fully resolved HTTP request, ready for an [`HttpTransport`](crate::HttpTransport).
#[derive(Debug, Clone)]
pub struct RawRequest {
    pub method: Method,
    pub url: Url,
    pub headers: HeaderMap,
    pub body: Option<Bytes>,
}

impl RawRequest {
    pub fn new(method: Method, url: Url) -> Self {
        Self {
            method,
            url,
            headers: HeaderMap::new(),
            body: None,
        }
    }

    pub fn get(url: Url) -> Self {
        Self::new(Method::GET, url)
    }

    pub fn put(url: Url) -> Self {
        Self::new(Method::PUT, url)
    }

    pub fn post(url: Url) -> Self {
        Self::new(Method::POST, url)
    }

    pub fn delete(url: Url) -> Self {
        Self::new(Method::DELETE, url)
    }

    /// Serialize `body` as the JSON payload.
    pub fn with_json(mut self, body: &impl Serialize) -> Result<Self, Error> {
        let bytes = serde_json::to_vec(body)
            .map_err(|e| Error::InvalidCommand(format!("cannot serialize body: {e}")))?;
        self.headers.insert(
            reqwest::header::CONTENT_TYPE,
            HeaderValue::from_static("application/json"),
        );
        self.body = Some(Bytes::from(bytes));
        Ok(self)
    }

    /// Set a header, rejecting values that are not valid header text.
    pub fn with_header(mut self, name: &str, value: &str) -> Result<Self, Error> {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| Error::InvalidCommand(format!("invalid header name {name}: {e}")))?;
        let value = HeaderValue::from_str(value)
            .map_err(|e| Error::InvalidCommand(format!("invalid header value: {e}")))?;
        self.headers.insert(name, value);
        Ok(self)
    }

    /// Key under which a response to this request is cached: path and
    /// query only, so every node of a database shares one entry.
    pub fn cache_key(&self) -> String {
        self.url[url::Position::BeforePath..].to_owned()
    }
}

/// Status, headers and body of a completed HTTP exchange.
#[derive(Debug, Clone)]
pub struct RawResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl RawResponse {
    pub fn header_str(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// The `ETag` header with surrounding quotes removed.
    pub fn etag(&self) -> Option<&str> {
        self.header_str(ETAG_HEADER).map(|v| v.trim_matches('"'))
    }

    /// Best-effort error message: the body's `Message`/`Error` field, or
    /// the raw body text.
    pub fn error_message(&self) -> String {
        #[derive(serde::Deserialize)]
        struct ErrorBody {
            #[serde(alias = "Message", alias = "Error")]
            message: Option<String>,
        }

        serde_json::from_slice::<ErrorBody>(&self.body)
            .ok()
            .and_then(|b| b.message)
            .unwrap_or_else(|| String::from_utf8_lossy(&self.body).into_owned())
    }
}

// ── Command trait ────────────────────────────────────────────────────

/// A typed, re-buildable unit of request/response work.
pub trait Command: Send + Sync {
    type Output: Send;

    /// Build the request for `node`. Called once per attempt.
    fn create_request(&self, node: &ServerNode) -> Result<RawRequest, Error>;

    /// Reads are eligible for the response cache and for failover.
    fn is_read_request(&self) -> bool;

    /// Decode a 2xx (or cached) body.
    fn parse_response(&self, body: &Bytes, from_cache: bool) -> Result<Self::Output, Error>;

    /// Result for a plain 404. `None` surfaces the 404 as an error.
    fn parse_not_found(&self) -> Option<Self::Output> {
        None
    }

    /// Result for a 304 on a request that bypasses the cache.
    fn parse_not_modified(&self) -> Option<Self::Output> {
        None
    }

    /// Idempotency key for commands that need cluster consensus. When
    /// present the executor adds it as `raft-request-id` and requires a
    /// server that supports atomic cluster writes.
    fn raft_id(&self) -> Option<&str> {
        None
    }

    /// Whether a failed attempt may be replayed on another node.
    fn is_idempotent(&self) -> bool {
        self.is_read_request() || self.raft_id().is_some()
    }

    fn name(&self) -> &'static str {
        std::any::type_name::<Self>()
    }
}

// ── Generic JSON command ─────────────────────────────────────────────

/// A data-only command against `/databases/<db>/<resource>` that decodes
/// the response body as `T`.
///
/// Useful for one-off endpoints that don't warrant a dedicated type.
#[derive(Debug, Clone)]
pub struct JsonCommand<T> {
    method: Method,
    resource: String,
    query: Vec<(String, String)>,
    body: Option<serde_json::Value>,
    read: bool,
    idempotency_key: Option<String>,
    _output: PhantomData<fn() -> T>,
}

impl<T> JsonCommand<T> {
    fn new(method: Method, resource: &str, read: bool) -> Self {
        Self {
            method,
            resource: resource.trim_start_matches('/').to_owned(),
            query: Vec::new(),
            body: None,
            read,
            idempotency_key: None,
            _output: PhantomData,
        }
    }

    /// A cacheable GET.
    pub fn get(resource: &str) -> Self {
        Self::new(Method::GET, resource, true)
    }

    pub fn put(resource: &str, body: serde_json::Value) -> Self {
        let mut cmd = Self::new(Method::PUT, resource, false);
        cmd.body = Some(body);
        cmd
    }

    pub fn post(resource: &str, body: serde_json::Value) -> Self {
        let mut cmd = Self::new(Method::POST, resource, false);
        cmd.body = Some(body);
        cmd
    }

    pub fn delete(resource: &str) -> Self {
        Self::new(Method::DELETE, resource, false)
    }

    pub fn query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((key.into(), value.into()));
        self
    }

    pub fn idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }
}

impl<T: DeserializeOwned + Send> Command for JsonCommand<T> {
    type Output = T;

    fn create_request(&self, node: &ServerNode) -> Result<RawRequest, Error> {
        let mut url = node.database_url(&self.resource)?;
        if !self.query.is_empty() {
            let mut pairs = url.query_pairs_mut();
            for (k, v) in &self.query {
                pairs.append_pair(k, v);
            }
        }

        let request = RawRequest::new(self.method.clone(), url);
        match self.body {
            Some(ref body) => request.with_json(body),
            None => Ok(request),
        }
    }

    fn is_read_request(&self) -> bool {
        self.read
    }

    fn parse_response(&self, body: &Bytes, _from_cache: bool) -> Result<T, Error> {
        serde_json::from_slice(body).map_err(|e| Error::deserialization(&e, body))
    }

    fn raft_id(&self) -> Option<&str> {
        self.idempotency_key.as_deref()
    }
}
