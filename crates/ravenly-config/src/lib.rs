//! Profile configuration for ravenly clients.
//!
//! TOML profiles (file + `RAVENLY_` environment overrides) and their
//! translation into `ravenly_core::StoreConfig`. The core crate never
//! reads files; applications that want a config file go through here.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::ProjectDirs;
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use ravenly_core::{
    CacheConfig, ClientCertificate, CoreError, ReadBalanceBehavior, StoreConfig, TlsVerification,
};

// ── Error ───────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid {field}: {reason}")]
    Validation { field: String, reason: String },

    #[error("profile '{profile}' is not defined")]
    UnknownProfile { profile: String },

    #[error("invalid store configuration: {0}")]
    Store(#[from] CoreError),

    #[error("failed to serialize config: {0}")]
    Serialization(#[from] toml::ser::Error),

    #[error("config loading failed: {0}")]
    Figment(Box<figment::Error>),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<figment::Error> for ConfigError {
    fn from(err: figment::Error) -> Self {
        Self::Figment(Box::new(err))
    }
}

// ── TOML config structs ─────────────────────────────────────────────

/// Top-level TOML configuration.
#[derive(Debug, Deserialize, Serialize)]
pub struct Config {
    /// Profile used when none is named.
    pub default_profile: Option<String>,

    #[serde(default)]
    pub defaults: Defaults,

    /// Named cluster profiles.
    #[serde(default)]
    pub profiles: HashMap<String, Profile>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            default_profile: Some("default".into()),
            defaults: Defaults::default(),
            profiles: HashMap::new(),
        }
    }
}

/// Values a profile inherits unless it overrides them.
#[derive(Debug, Deserialize, Serialize)]
pub struct Defaults {
    #[serde(default)]
    pub insecure: bool,

    /// Per-request timeout in seconds.
    #[serde(default = "default_timeout")]
    pub timeout: u64,

    #[serde(default = "default_read_balance")]
    pub read_balance: String,
}

impl Default for Defaults {
    fn default() -> Self {
        Self {
            insecure: false,
            timeout: default_timeout(),
            read_balance: default_read_balance(),
        }
    }
}

fn default_timeout() -> u64 {
    30
}
fn default_read_balance() -> String {
    "none".into()
}

/// A named cluster profile.
#[derive(Debug, Default, Deserialize, Serialize)]
pub struct Profile {
    /// Seed node URLs (e.g., "https://a.db.local:8080").
    pub urls: Vec<String>,

    /// Default database for this profile.
    pub database: Option<String>,

    /// Path to a custom CA certificate (PEM).
    pub ca_cert: Option<PathBuf>,

    /// Client certificate and key (PEM) for mutual TLS.
    pub client_cert: Option<PathBuf>,
    pub client_key: Option<PathBuf>,

    /// Override insecure TLS setting.
    pub insecure: Option<bool>,

    /// Override timeout (seconds).
    pub timeout: Option<u64>,

    /// "none" or "round_robin".
    pub read_balance: Option<String>,

    /// Background topology refresh period; 0 disables it.
    pub topology_refresh_secs: Option<u64>,

    pub disable_topology_updates: Option<bool>,

    pub confirmation_timeout_secs: Option<u64>,

    /// Delay between change-feed reconnection attempts.
    pub reconnect_delay_ms: Option<u64>,

    /// Response cache bounds.
    pub max_entries: Option<usize>,
    pub max_bytes: Option<usize>,
}

// ── Config file path ────────────────────────────────────────────────

/// Resolve the config file path via XDG / platform conventions.
pub fn config_path() -> PathBuf {
    ProjectDirs::from("com", "ravenly", "ravenly").map_or_else(
        || {
            let mut p = dirs_fallback();
            p.push("config.toml");
            p
        },
        |dirs| dirs.config_dir().join("config.toml"),
    )
}

fn dirs_fallback() -> PathBuf {
    let mut p = PathBuf::from(std::env::var("HOME").unwrap_or_else(|_| ".".into()));
    p.push(".config");
    p.push("ravenly");
    p
}

// ── Config loading ──────────────────────────────────────────────────

/// Load the full Config from the canonical file + environment.
pub fn load_config() -> Result<Config, ConfigError> {
    load_config_from(&config_path())
}

/// Load from an explicit file. `RAVENLY_` variables override file
/// values; nested keys use `__` (`RAVENLY_DEFAULTS__TIMEOUT=5`).
pub fn load_config_from(path: &Path) -> Result<Config, ConfigError> {
    let figment = Figment::new()
        .merge(Serialized::defaults(Config::default()))
        .merge(Toml::file(path))
        .merge(Env::prefixed("RAVENLY_").split("__"));

    let config: Config = figment.extract()?;
    Ok(config)
}

/// Load config, returning a default if the file doesn't exist.
pub fn load_config_or_default() -> Config {
    load_config().unwrap_or_default()
}

// ── Config saving ───────────────────────────────────────────────────

/// Serialize config to TOML and write it to `path`.
pub fn save_config_to(cfg: &Config, path: &Path) -> Result<(), ConfigError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let toml_str = toml::to_string_pretty(cfg)?;
    std::fs::write(path, toml_str)?;
    Ok(())
}

pub fn save_config(cfg: &Config) -> Result<(), ConfigError> {
    save_config_to(cfg, &config_path())
}

// ── Profile resolution ──────────────────────────────────────────────

/// Pick the named profile, or the config's default one.
pub fn resolve_profile<'a>(
    config: &'a Config,
    name: Option<&'a str>,
) -> Result<(&'a str, &'a Profile), ConfigError> {
    let name = name
        .or(config.default_profile.as_deref())
        .unwrap_or("default");
    config
        .profiles
        .get_key_value(name)
        .map(|(k, p)| (k.as_str(), p))
        .ok_or_else(|| ConfigError::UnknownProfile {
            profile: name.into(),
        })
}

/// Build a validated `StoreConfig` from a profile and the global defaults.
///
/// URLs and certificate settings are checked here so a bad profile fails
/// before any connection is attempted.
pub fn profile_to_store_config(
    profile: &Profile,
    defaults: &Defaults,
) -> Result<StoreConfig, ConfigError> {
    if profile.urls.is_empty() {
        return Err(ConfigError::Validation {
            field: "urls".into(),
            reason: "at least one seed URL is required".into(),
        });
    }
    let urls = profile
        .urls
        .iter()
        .map(|raw| {
            raw.parse::<url::Url>().map_err(|_| ConfigError::Validation {
                field: "urls".into(),
                reason: format!("invalid URL: {raw}"),
            })
        })
        .collect::<Result<Vec<_>, _>>()?;

    let tls = if profile.insecure.unwrap_or(defaults.insecure) {
        TlsVerification::DangerAcceptInvalid
    } else if let Some(ref ca_path) = profile.ca_cert {
        TlsVerification::CustomCa(ca_path.clone())
    } else {
        TlsVerification::SystemDefaults
    };

    let client_certificate = match (&profile.client_cert, &profile.client_key) {
        (Some(cert), Some(key)) => Some(ClientCertificate {
            cert_path: cert.clone(),
            key_path: key.clone(),
        }),
        (None, None) => None,
        _ => {
            return Err(ConfigError::Validation {
                field: "client_cert".into(),
                reason: "client_cert and client_key must be set together".into(),
            });
        }
    };

    let read_balance_raw = profile
        .read_balance
        .as_deref()
        .unwrap_or(&defaults.read_balance);
    let read_balance: ReadBalanceBehavior =
        read_balance_raw
            .parse()
            .map_err(|_| ConfigError::Validation {
                field: "read_balance".into(),
                reason: format!("expected 'none' or 'round_robin', got '{read_balance_raw}'"),
            })?;

    let mut store = StoreConfig {
        urls,
        database: profile.database.clone(),
        tls,
        client_certificate,
        executor: ravenly_core::ExecutorConfig::default(),
        changes: ravenly_core::ChangesConfig::default(),
    };

    store.executor.request_timeout = Duration::from_secs(profile.timeout.unwrap_or(defaults.timeout));
    store.executor.read_balance = read_balance;
    if let Some(secs) = profile.topology_refresh_secs {
        store.executor.topology_refresh_interval = Duration::from_secs(secs);
    }
    if let Some(disabled) = profile.disable_topology_updates {
        store.executor.disable_topology_updates = disabled;
    }
    let cache_defaults = CacheConfig::default();
    store.executor.cache = CacheConfig {
        max_entries: profile.max_entries.unwrap_or(cache_defaults.max_entries),
        max_bytes: profile.max_bytes.unwrap_or(cache_defaults.max_bytes),
    };

    if let Some(secs) = profile.confirmation_timeout_secs {
        store.changes.confirmation_timeout = Duration::from_secs(secs);
    }
    if let Some(ms) = profile.reconnect_delay_ms {
        let delay = Duration::from_millis(ms);
        store.changes.reconnect.initial_delay = delay;
        store.changes.reconnect.max_delay = delay;
    }

    store.validate()?;
    Ok(store)
}
