// ── Core error types ──
//
// User-facing errors from ravenly-core. Callers get exactly one of these
// per failed call; the retries and failovers that preceded it are only
// visible through executor events and stats. The `From<ravenly_api::Error>`
// impl translates transport-layer errors into this taxonomy.

use thiserror::Error;

/// Unified error type for the core crate.
#[derive(Debug, Error)]
pub enum CoreError {
    // ── Configuration ────────────────────────────────────────────────
    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Invalid argument: {message}")]
    InvalidArgument { message: String },

    // ── Request execution ────────────────────────────────────────────
    #[error("All {attempted} node(s) of database '{database}' are unreachable: {last_error}")]
    AllNodesUnreachable {
        database: String,
        attempted: usize,
        last_error: String,
    },

    #[error("Operation timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("Request rejected with HTTP {status}: {message}")]
    ClientError { status: u16, message: String },

    #[error("Authentication failed: {message}")]
    Authentication { message: String },

    #[error("Database '{database}' does not exist")]
    DatabaseDoesNotExist { database: String },

    #[error("Cluster write not visible on node {node_tag} after {attempts} attempt(s)")]
    ClusterWriteNotVisible { node_tag: String, attempts: u32 },

    #[error("Node {node} runs server version {server_version}, {required} or newer is required")]
    ClientVersionMismatch {
        node: String,
        server_version: String,
        required: String,
    },

    #[error("Requested node '{tag}' is not part of the topology")]
    RequestedNodeUnavailable { tag: String },

    // ── Change feed ──────────────────────────────────────────────────
    #[error("Did not get a confirmation for command #{command_id} ({command}) within {timeout_ms}ms")]
    ConfirmationTimeout {
        command_id: u64,
        command: String,
        timeout_ms: u64,
    },

    #[error("Change feed disconnected: {message}")]
    ChangesDisconnected { message: String },

    #[error("Change feed is closed")]
    ChangesClosed,

    #[error("Change feed error: {message}")]
    ChangeProcessing { message: String },

    // ── API errors (wrapped, not exposed raw) ────────────────────────
    #[error("API error: {message}")]
    Api {
        message: String,
        /// HTTP status code (if the server answered at all).
        status: Option<u16>,
    },

    // ── Internal errors ──────────────────────────────────────────────
    #[error("Internal error: {0}")]
    Internal(String),
}

impl CoreError {
    /// Errors that justify trying another node.
    pub fn is_failover(&self) -> bool {
        match self {
            Self::Timeout { .. } | Self::ChangesDisconnected { .. } => true,
            Self::Api { status, .. } => status.is_none_or(|s| s >= 500),
            _ => false,
        }
    }

    /// Errors that no amount of retrying will fix.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Config { .. }
                | Self::Authentication { .. }
                | Self::DatabaseDoesNotExist { .. }
                | Self::ClientVersionMismatch { .. }
                | Self::ChangesClosed
        )
    }

    pub(crate) fn timeout(timeout: std::time::Duration) -> Self {
        Self::Timeout {
            timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
        }
    }
}

// ── Conversion from transport-layer errors ───────────────────────────

impl From<ravenly_api::Error> for CoreError {
    fn from(err: ravenly_api::Error) -> Self {
        match err {
            ravenly_api::Error::Transport(ref e) => {
                if e.is_timeout() {
                    CoreError::Timeout { timeout_ms: 0 }
                } else {
                    CoreError::Api {
                        message: e.to_string(),
                        status: e.status().map(|s| s.as_u16()),
                    }
                }
            }
            ravenly_api::Error::InvalidUrl(e) => CoreError::Config {
                message: format!("Invalid URL: {e}"),
            },
            ravenly_api::Error::Timeout { timeout_ms } => CoreError::Timeout { timeout_ms },
            ravenly_api::Error::Tls(message) => CoreError::Config {
                message: format!("TLS error: {message}"),
            },
            ravenly_api::Error::Http { status, message } => match status {
                401 | 403 => CoreError::Authentication { message },
                400..=499 => CoreError::ClientError { status, message },
                _ => CoreError::Api {
                    message,
                    status: Some(status),
                },
            },
            ravenly_api::Error::DatabaseDoesNotExist { database } => {
                CoreError::DatabaseDoesNotExist { database }
            }
            ravenly_api::Error::WebSocketConnect(reason) => {
                CoreError::ChangesDisconnected { message: reason }
            }
            ravenly_api::Error::WebSocketClosed { code, reason } => CoreError::ChangesDisconnected {
                message: format!("closed by server (code {code}): {reason}"),
            },
            ravenly_api::Error::Deserialization { message, body: _ } => {
                CoreError::Internal(format!("Deserialization error: {message}"))
            }
            ravenly_api::Error::InvalidCommand(message) => CoreError::InvalidArgument { message },
        }
    }
}
