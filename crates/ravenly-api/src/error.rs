use thiserror::Error;

/// Top-level error type for the `ravenly-api` crate.
///
/// Covers every failure mode of the transport layer: HTTP, TLS material,
/// server status responses, the WebSocket change feed, and payload decoding.
/// `ravenly-core` maps these into its user-facing taxonomy.
#[derive(Debug, Error)]
pub enum Error {
    // ── Transport ───────────────────────────────────────────────────
    /// HTTP transport error (connection refused, DNS failure, etc.)
    #[error("HTTP transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// URL parsing error.
    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    /// Request timed out.
    #[error("Request timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    /// TLS handshake or certificate error.
    #[error("TLS error: {0}")]
    Tls(String),

    // ── Server responses ────────────────────────────────────────────
    /// Non-success status the command did not know how to interpret.
    #[error("Server returned HTTP {status}: {message}")]
    Http { status: u16, message: String },

    /// The node answered that the database is not hosted anywhere.
    #[error("Database '{database}' does not exist")]
    DatabaseDoesNotExist { database: String },

    // ── WebSocket ───────────────────────────────────────────────────
    /// WebSocket connection failed.
    #[error("WebSocket connection failed: {0}")]
    WebSocketConnect(String),

    /// WebSocket closed by the peer.
    #[error("WebSocket closed (code {code}): {reason}")]
    WebSocketClosed { code: u16, reason: String },

    // ── Data ────────────────────────────────────────────────────────
    /// JSON deserialization failed, with the raw body for debugging.
    #[error("Deserialization error: {message}")]
    Deserialization { message: String, body: String },

    /// A command could not build its request (bad argument, bad URL).
    #[error("Invalid command: {0}")]
    InvalidCommand(String),
}

impl Error {
    /// Build a [`Deserialization`](Self::Deserialization) error from a
    /// serde failure and the raw payload it choked on.
    pub fn deserialization(err: &serde_json::Error, body: &[u8]) -> Self {
        Self::Deserialization {
            message: err.to_string(),
            body: String::from_utf8_lossy(body).into_owned(),
        }
    }

    /// Returns `true` if this is a transient error worth retrying on
    /// another node.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Transport(e) => e.is_timeout() || e.is_connect() || e.is_request(),
            Self::Timeout { .. } | Self::WebSocketConnect(_) | Self::WebSocketClosed { .. } => true,
            Self::Http { status, .. } => *status >= 500,
            _ => false,
        }
    }

    /// Returns `true` when the request provably never reached the server,
    /// so replaying it elsewhere cannot duplicate an effect.
    pub fn is_connect_failure(&self) -> bool {
        matches!(self, Self::Transport(e) if e.is_connect())
    }

    /// Returns `true` if this is a "not found" error.
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::Transport(e) => e.status() == Some(reqwest::StatusCode::NOT_FOUND),
            Self::Http { status: 404, .. } => true,
            _ => false,
        }
    }
}
