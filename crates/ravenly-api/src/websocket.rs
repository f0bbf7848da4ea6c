//! Pluggable WebSocket transport for the change feed.
//!
//! The change-feed client only needs four operations: connect, send a
//! text frame, receive a text frame, close. They are expressed as the
//! [`WebSocketConnector`] / [`WebSocketSink`] / [`WebSocketSource`]
//! traits so the feed state machine can run against an in-memory socket
//! in tests. [`TungsteniteConnector`] is the production implementation,
//! honoring the same [`TransportConfig`] TLS settings as the HTTP client.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use rustls::ClientConfig;
use rustls::crypto::CryptoProvider;
use rustls_pki_types::pem::PemObject;
use rustls_pki_types::{CertificateDer, PrivateKeyDer};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{Connector, MaybeTlsStream, WebSocketStream};
use url::Url;

use crate::command::DATABASE_MISSING_HEADER;
use crate::error::Error;
use crate::node::normalize_url;
use crate::transport::{TlsMode, TransportConfig};

// ── Traits ───────────────────────────────────────────────────────────

/// Opens WebSocket sessions.
#[async_trait]
pub trait WebSocketConnector: Send + Sync {
    async fn connect(&self, url: &Url) -> Result<WebSocketSession, Error>;
}

/// Write half of a WebSocket session.
#[async_trait]
pub trait WebSocketSink: Send {
    async fn send_text(&mut self, text: String) -> Result<(), Error>;
    async fn close(&mut self) -> Result<(), Error>;
}

/// Read half of a WebSocket session.
#[async_trait]
pub trait WebSocketSource: Send {
    /// Next text frame. `None` means the peer closed the connection.
    async fn next_text(&mut self) -> Option<Result<String, Error>>;
}

/// An open connection, already split into its two halves.
pub struct WebSocketSession {
    pub sink: Box<dyn WebSocketSink>,
    pub source: Box<dyn WebSocketSource>,
}

impl std::fmt::Debug for WebSocketSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebSocketSession").finish_non_exhaustive()
    }
}

/// `<node>/databases/<db>/changes` with the scheme upgraded to ws/wss.
pub fn changes_url(node_url: &str, database: &str) -> Result<Url, Error> {
    let base = normalize_url(node_url);
    let upgraded = if let Some(rest) = base.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = base.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        return Err(Error::WebSocketConnect(format!(
            "unsupported node URL scheme: {node_url}"
        )));
    };
    Ok(Url::parse(&format!("{upgraded}/databases/{database}/changes"))?)
}

// ── Tungstenite implementation ───────────────────────────────────────

type TungsteniteStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Production connector backed by `tokio-tungstenite` over rustls.
#[derive(Clone)]
pub struct TungsteniteConnector {
    tls: Option<Arc<ClientConfig>>,
    connect_timeout: Duration,
}

impl std::fmt::Debug for TungsteniteConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TungsteniteConnector")
            .field("custom_tls", &self.tls.is_some())
            .field("connect_timeout", &self.connect_timeout)
            .finish()
    }
}

impl TungsteniteConnector {
    /// Build a connector. Certificate material is loaded eagerly so a bad
    /// path fails here rather than on the first reconnect.
    pub fn new(config: &TransportConfig, connect_timeout: Duration) -> Result<Self, Error> {
        Ok(Self {
            tls: build_rustls_config(config)?,
            connect_timeout,
        })
    }
}

#[async_trait]
impl WebSocketConnector for TungsteniteConnector {
    async fn connect(&self, url: &Url) -> Result<WebSocketSession, Error> {
        tracing::debug!(url = %url, "Connecting to change feed");

        let connector = self.tls.as_ref().map(|c| Connector::Rustls(Arc::clone(c)));
        let handshake =
            tokio_tungstenite::connect_async_tls_with_config(url.as_str(), None, false, connector);

        let (stream, _response) = tokio::time::timeout(self.connect_timeout, handshake)
            .await
            .map_err(|_| Error::Timeout {
                timeout_ms: u64::try_from(self.connect_timeout.as_millis()).unwrap_or(u64::MAX),
            })?
            .map_err(classify_handshake_error)?;

        tracing::debug!(url = %url, "Change feed connected");

        let (write, read) = stream.split();
        Ok(WebSocketSession {
            sink: Box::new(TungsteniteSink { inner: write }),
            source: Box::new(TungsteniteSource { inner: read }),
        })
    }
}

/// Map a failed upgrade into the crate error, recognizing the server's
/// "database does not exist" answer.
fn classify_handshake_error(err: tungstenite::Error) -> Error {
    if let tungstenite::Error::Http(ref response) = err {
        if response.status().as_u16() == 503 {
            if let Some(db) = response
                .headers()
                .get(DATABASE_MISSING_HEADER)
                .and_then(|v| v.to_str().ok())
            {
                return Error::DatabaseDoesNotExist {
                    database: db.to_owned(),
                };
            }
        }
        return Error::WebSocketConnect(format!(
            "server rejected upgrade with HTTP {}",
            response.status()
        ));
    }
    Error::WebSocketConnect(err.to_string())
}

struct TungsteniteSink {
    inner: SplitSink<TungsteniteStream, Message>,
}

#[async_trait]
impl WebSocketSink for TungsteniteSink {
    async fn send_text(&mut self, text: String) -> Result<(), Error> {
        self.inner
            .send(Message::text(text))
            .await
            .map_err(|e| Error::WebSocketConnect(e.to_string()))
    }

    async fn close(&mut self) -> Result<(), Error> {
        self.inner
            .close()
            .await
            .map_err(|e| Error::WebSocketConnect(e.to_string()))
    }
}

struct TungsteniteSource {
    inner: SplitStream<TungsteniteStream>,
}

#[async_trait]
impl WebSocketSource for TungsteniteSource {
    async fn next_text(&mut self) -> Option<Result<String, Error>> {
        loop {
            match self.inner.next().await? {
                Ok(Message::Text(text)) => return Some(Ok(text.as_str().to_owned())),
                Ok(Message::Ping(_)) => {
                    // tungstenite answers pings on the next write/flush
                    tracing::trace!("WebSocket ping");
                }
                Ok(Message::Close(frame)) => {
                    return match frame {
                        Some(cf) => {
                            tracing::info!(
                                code = %cf.code,
                                reason = %cf.reason,
                                "WebSocket close frame received"
                            );
                            Some(Err(Error::WebSocketClosed {
                                code: u16::from(cf.code),
                                reason: cf.reason.as_str().to_owned(),
                            }))
                        }
                        None => {
                            tracing::info!("WebSocket close frame received (no payload)");
                            None
                        }
                    };
                }
                Ok(_) => {
                    // Binary, Pong, Frame -- ignore
                }
                Err(e) => return Some(Err(Error::WebSocketConnect(e.to_string()))),
            }
        }
    }
}

// ── TLS ──────────────────────────────────────────────────────────────

/// `None` means tungstenite's default connector (WebPKI roots, no client
/// certificate) is sufficient.
fn build_rustls_config(config: &TransportConfig) -> Result<Option<Arc<ClientConfig>>, Error> {
    if matches!(config.tls, TlsMode::System) && config.client_identity.is_none() {
        return Ok(None);
    }

    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let builder = ClientConfig::builder_with_provider(Arc::clone(&provider))
        .with_safe_default_protocol_versions()
        .map_err(|e| Error::Tls(format!("unsupported protocol versions: {e}")))?;

    let builder = match &config.tls {
        TlsMode::System => builder.with_root_certificates(webpki_roots()),
        TlsMode::CustomCa(path) => {
            let mut roots = rustls::RootCertStore::empty();
            for cert in load_certificates(path)? {
                roots
                    .add(cert)
                    .map_err(|e| Error::Tls(format!("invalid CA cert: {e}")))?;
            }
            builder.with_root_certificates(roots)
        }
        TlsMode::DangerAcceptInvalid => builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(AcceptAnyCertificate(provider))),
    };

    let client_config = match config.client_identity {
        Some(ref identity) => {
            let certs = load_certificates(&identity.cert_path)?;
            let key = PrivateKeyDer::from_pem_file(&identity.key_path)
                .map_err(|e| Error::Tls(format!("failed to read client key: {e}")))?;
            builder
                .with_client_auth_cert(certs, key)
                .map_err(|e| Error::Tls(format!("invalid client cert/key: {e}")))?
        }
        None => builder.with_no_client_auth(),
    };

    Ok(Some(Arc::new(client_config)))
}

fn webpki_roots() -> rustls::RootCertStore {
    webpki_roots::TLS_SERVER_ROOTS.iter().cloned().collect()
}

fn load_certificates(path: &std::path::Path) -> Result<Vec<CertificateDer<'static>>, Error> {
    let certs = CertificateDer::pem_file_iter(path)
        .map_err(|e| Error::Tls(format!("failed to read {}: {e}", path.display())))?
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| Error::Tls(format!("invalid PEM in {}: {e}", path.display())))?;
    if certs.is_empty() {
        return Err(Error::Tls(format!("no certificates found in {}", path.display())));
    }
    Ok(certs)
}

/// Verifier for [`TlsMode::DangerAcceptInvalid`]: trusts any server
/// certificate but still checks handshake signatures.
#[derive(Debug)]
struct AcceptAnyCertificate(Arc<CryptoProvider>);

impl rustls::client::danger::ServerCertVerifier for AcceptAnyCertificate {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &rustls_pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls_pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}

// ── Tests ────────────────────────────────────────────────────────────

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::path::PathBuf;

    use super::*;

    #[test]
    fn changes_url_upgrades_scheme() {
        let url = changes_url("http://a:8080/", "orders").unwrap();
        assert_eq!(url.as_str(), "ws://a:8080/databases/orders/changes");

        let url = changes_url("https://secure.example.com", "orders").unwrap();
        assert_eq!(url.as_str(), "wss://secure.example.com/databases/orders/changes");
    }

    #[test]
    fn changes_url_rejects_other_schemes() {
        assert!(matches!(
            changes_url("ftp://a", "db"),
            Err(Error::WebSocketConnect(_))
        ));
    }

    #[test]
    fn system_tls_uses_default_connector() {
        let connector =
            TungsteniteConnector::new(&TransportConfig::default(), Duration::from_secs(5)).unwrap();
        assert!(connector.tls.is_none());
    }

    #[test]
    fn accept_invalid_builds_custom_config() {
        let config = TransportConfig {
            tls: TlsMode::DangerAcceptInvalid,
            ..TransportConfig::default()
        };
        let connector = TungsteniteConnector::new(&config, Duration::from_secs(5)).unwrap();
        assert!(connector.tls.is_some());
    }

    #[test]
    fn missing_ca_fails_eagerly() {
        let config = TransportConfig {
            tls: TlsMode::CustomCa(PathBuf::from("/nonexistent/ca.pem")),
            ..TransportConfig::default()
        };
        let err = TungsteniteConnector::new(&config, Duration::from_secs(5)).unwrap_err();
        assert!(matches!(err, Error::Tls(_)));
    }

    #[test]
    fn handshake_503_with_marker_is_missing_database() {
        let response = tungstenite::http::Response::builder()
            .status(503)
            .header(DATABASE_MISSING_HEADER, "orders")
            .body(None)
            .unwrap();
        let err = classify_handshake_error(tungstenite::Error::Http(response));
        assert!(matches!(err, Error::DatabaseDoesNotExist { ref database } if database == "orders"));
    }

    #[test]
    fn handshake_503_without_marker_is_connect_error() {
        let response = tungstenite::http::Response::builder()
            .status(503)
            .body(None)
            .unwrap();
        let err = classify_handshake_error(tungstenite::Error::Http(response));
        assert!(matches!(err, Error::WebSocketConnect(_)));
    }
}
