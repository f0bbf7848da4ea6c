// Shared transport configuration and the HTTP seam used by the executor.
//
// The executor never touches reqwest directly: it hands a `RawRequest`
// to an `HttpTransport` and gets a `RawResponse` back, whatever the
// status code. That keeps status interpretation in one place (the
// executor) and lets tests substitute an in-memory transport.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;

use crate::command::{RawRequest, RawResponse};
use crate::error::Error;

const USER_AGENT: &str = concat!("ravenly/", env!("CARGO_PKG_VERSION"));

/// TLS verification mode.
#[derive(Debug, Clone, Default)]
pub enum TlsMode {
    /// Use the bundled WebPKI roots.
    #[default]
    System,
    /// Trust only the CA certificate(s) in the given PEM file.
    CustomCa(PathBuf),
    /// Accept any certificate (development clusters with self-signed certs).
    DangerAcceptInvalid,
}

/// PEM-encoded client certificate and private key for mutual TLS.
#[derive(Debug, Clone)]
pub struct ClientIdentity {
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
}

/// Shared transport configuration for HTTP and WebSocket clients.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub tls: TlsMode,
    /// Default per-request timeout.
    pub timeout: Duration,
    pub client_identity: Option<ClientIdentity>,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            tls: TlsMode::System,
            timeout: Duration::from_secs(30),
            client_identity: None,
        }
    }
}

impl TransportConfig {
    /// Build a `reqwest::Client` from this config.
    pub fn build_client(&self) -> Result<reqwest::Client, Error> {
        let mut builder = reqwest::Client::builder()
            .timeout(self.timeout)
            .user_agent(USER_AGENT);

        match &self.tls {
            TlsMode::System => {}
            TlsMode::CustomCa(path) => {
                let cert_pem = std::fs::read(path)
                    .map_err(|e| Error::Tls(format!("failed to read CA cert: {e}")))?;
                let cert = reqwest::Certificate::from_pem(&cert_pem)
                    .map_err(|e| Error::Tls(format!("invalid CA cert: {e}")))?;
                builder = builder
                    .tls_built_in_root_certs(false)
                    .add_root_certificate(cert);
            }
            TlsMode::DangerAcceptInvalid => {
                builder = builder.danger_accept_invalid_certs(true);
            }
        }

        if let Some(ref identity) = self.client_identity {
            builder = builder.identity(identity.load_reqwest()?);
        }

        builder
            .build()
            .map_err(|e| Error::Tls(format!("failed to build HTTP client: {e}")))
    }
}

impl ClientIdentity {
    fn read_pem(&self) -> Result<(Vec<u8>, Vec<u8>), Error> {
        let cert = std::fs::read(&self.cert_path)
            .map_err(|e| Error::Tls(format!("failed to read client cert: {e}")))?;
        let key = std::fs::read(&self.key_path)
            .map_err(|e| Error::Tls(format!("failed to read client key: {e}")))?;
        Ok((cert, key))
    }

    /// reqwest's rustls backend wants certificate chain and key in one PEM.
    fn load_reqwest(&self) -> Result<reqwest::Identity, Error> {
        let (mut pem, key) = self.read_pem()?;
        if !pem.ends_with(b"\n") {
            pem.push(b'\n');
        }
        pem.extend_from_slice(&key);
        reqwest::Identity::from_pem(&pem)
            .map_err(|e| Error::Tls(format!("invalid client certificate: {e}")))
    }
}

// ── HttpTransport ────────────────────────────────────────────────────

/// Sends one fully built request and returns the raw response.
///
/// Implementations must not interpret status codes: a 404 or 503 is a
/// successful exchange from the transport's point of view.
#[async_trait]
pub trait HttpTransport: Send + Sync {
    async fn send(
        &self,
        request: RawRequest,
        timeout: Option<Duration>,
    ) -> Result<RawResponse, Error>;
}

/// Production transport backed by a shared `reqwest::Client`.
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    http: reqwest::Client,
    default_timeout: Duration,
}

impl ReqwestTransport {
    pub fn new(config: &TransportConfig) -> Result<Self, Error> {
        Ok(Self {
            http: config.build_client()?,
            default_timeout: config.timeout,
        })
    }

    /// Wrap an existing client (used by tests against a mock server).
    pub fn with_client(http: reqwest::Client, default_timeout: Duration) -> Self {
        Self {
            http,
            default_timeout,
        }
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn send(
        &self,
        request: RawRequest,
        timeout: Option<Duration>,
    ) -> Result<RawResponse, Error> {
        let timeout = timeout.unwrap_or(self.default_timeout);
        tracing::trace!(method = %request.method, url = %request.url, "sending request");

        let mut builder = self
            .http
            .request(request.method, request.url)
            .headers(request.headers)
            .timeout(timeout);
        if let Some(body) = request.body {
            builder = builder.body(body);
        }

        let response = builder.send().await.map_err(|e| map_send_error(e, timeout))?;
        let status = response.status();
        let headers = response.headers().clone();
        let body = response
            .bytes()
            .await
            .map_err(|e| map_send_error(e, timeout))?;

        Ok(RawResponse {
            status,
            headers,
            body,
        })
    }
}

fn map_send_error(err: reqwest::Error, timeout: Duration) -> Error {
    if err.is_timeout() {
        Error::Timeout {
            timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
        }
    } else {
        Error::Transport(err)
    }
}
