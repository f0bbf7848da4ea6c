// ── Runtime store configuration ──
//
// These types describe *how* to talk to a cluster: seed URLs, TLS
// material and tuning for the executor and change feed. They never
// touch disk; ravenly-config (or the caller) builds a `StoreConfig`
// and hands it in.

use std::path::PathBuf;
use std::time::Duration;

use url::Url;

use ravenly_api::transport::{ClientIdentity, TlsMode, TransportConfig};

use crate::error::CoreError;

/// TLS verification strategy.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum TlsVerification {
    /// Bundled WebPKI roots (strict).
    #[default]
    SystemDefaults,
    /// Custom CA certificate file.
    CustomCa(PathBuf),
    /// Skip verification (self-signed development clusters).
    DangerAcceptInvalid,
}

/// Client certificate used for mutual TLS against secured clusters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientCertificate {
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
}

/// How reads pick a node.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, strum::Display, strum::EnumString,
)]
#[strum(serialize_all = "snake_case", ascii_case_insensitive)]
pub enum ReadBalanceBehavior {
    /// Stick to the preferred node until it fails.
    #[default]
    None,
    /// Rotate reads across available nodes.
    RoundRobin,
}

/// Speculative backoff applied to a node after a failure.
///
/// `delay = min(initial * 2^(failures - 1), max)`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackoffConfig {
    pub initial: Duration,
    pub max: Duration,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(1),
            max: Duration::from_secs(60),
        }
    }
}

/// Bounds of the HTTP response cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheConfig {
    pub max_entries: usize,
    pub max_bytes: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_entries: 8192,
            max_bytes: 512 * 1024 * 1024,
        }
    }
}

/// Request executor tuning.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Per-attempt HTTP timeout.
    pub request_timeout: Duration,
    pub read_balance: ReadBalanceBehavior,
    /// Period of the background topology refresh. Zero disables the timer.
    pub topology_refresh_interval: Duration,
    /// Never ask the cluster for its topology; use the seed URLs as-is.
    pub disable_topology_updates: bool,
    pub node_backoff: BackoffConfig,
    /// How many times a not-yet-visible cluster write is re-polled on the
    /// responsible node before giving up.
    pub max_cluster_write_redirects: u32,
    pub cluster_write_poll_delay: Duration,
    pub cache: CacheConfig,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(30),
            read_balance: ReadBalanceBehavior::None,
            topology_refresh_interval: Duration::from_secs(60),
            disable_topology_updates: false,
            node_backoff: BackoffConfig::default(),
            max_cluster_write_redirects: 5,
            cluster_write_poll_delay: Duration::from_millis(100),
            cache: CacheConfig::default(),
        }
    }
}

/// Backoff between change-feed reconnection attempts.
///
/// Defaults to a fixed one-second delay; raise `max_delay` above
/// `initial_delay` to get exponential escalation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectConfig {
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(1),
        }
    }
}

/// Change-feed tuning.
#[derive(Debug, Clone)]
pub struct ChangesConfig {
    /// How long `send` waits for the server's `Confirm`.
    pub confirmation_timeout: Duration,
    pub connect_timeout: Duration,
    pub reconnect: ReconnectConfig,
}

impl Default for ChangesConfig {
    fn default() -> Self {
        Self {
            confirmation_timeout: Duration::from_secs(15),
            connect_timeout: Duration::from_secs(10),
            reconnect: ReconnectConfig::default(),
        }
    }
}

/// Everything a [`DocumentStore`](crate::DocumentStore) needs.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Seed URLs, tried in order until one returns a topology.
    pub urls: Vec<Url>,
    /// Database used when a call doesn't name one.
    pub database: Option<String>,
    pub tls: TlsVerification,
    pub client_certificate: Option<ClientCertificate>,
    pub executor: ExecutorConfig,
    pub changes: ChangesConfig,
}

impl StoreConfig {
    pub fn new(urls: Vec<Url>, database: impl Into<String>) -> Self {
        Self {
            urls,
            database: Some(database.into()),
            tls: TlsVerification::default(),
            client_certificate: None,
            executor: ExecutorConfig::default(),
            changes: ChangesConfig::default(),
        }
    }

    /// Reject configurations that can never work, before any I/O.
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.urls.is_empty() {
            return Err(CoreError::Config {
                message: "at least one seed URL is required".into(),
            });
        }
        for url in &self.urls {
            if !matches!(url.scheme(), "http" | "https") {
                return Err(CoreError::Config {
                    message: format!("unsupported URL scheme in {url}"),
                });
            }
            if url.host_str().is_none() {
                return Err(CoreError::Config {
                    message: format!("URL has no host: {url}"),
                });
            }
        }
        let secure = self.urls.iter().filter(|u| u.scheme() == "https").count();
        if secure != 0 && secure != self.urls.len() {
            return Err(CoreError::Config {
                message: "seed URLs mix http and https".into(),
            });
        }
        if self.client_certificate.is_some() && secure == 0 {
            return Err(CoreError::Config {
                message: "a client certificate requires https URLs".into(),
            });
        }
        if let Some(ref db) = self.database {
            validate_database_name(db)?;
        }
        Ok(())
    }

    /// Translate into the api-level transport configuration.
    pub fn transport_config(&self) -> TransportConfig {
        let tls = match &self.tls {
            TlsVerification::SystemDefaults => TlsMode::System,
            TlsVerification::CustomCa(path) => TlsMode::CustomCa(path.clone()),
            TlsVerification::DangerAcceptInvalid => TlsMode::DangerAcceptInvalid,
        };
        TransportConfig {
            tls,
            timeout: self.executor.request_timeout,
            client_identity: self.client_certificate.as_ref().map(|c| ClientIdentity {
                cert_path: c.cert_path.clone(),
                key_path: c.key_path.clone(),
            }),
        }
    }
}

pub(crate) fn validate_database_name(name: &str) -> Result<(), CoreError> {
    if name.trim().is_empty() {
        return Err(CoreError::Config {
            message: "database name cannot be blank".into(),
        });
    }
    if name.contains(['/', '\\', '?', '#']) {
        return Err(CoreError::Config {
            message: format!("database name '{name}' contains reserved characters"),
        });
    }
    Ok(())
}
