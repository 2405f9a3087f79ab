use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level service config, loaded from TOML. Every key is optional.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Address for the HTTP/WebSocket API.
    pub bind: SocketAddr,
    /// Root under which each session gets its own credential directory.
    pub temp_dir: PathBuf,
    /// Upper bound on concurrently live sessions.
    pub max_sessions: usize,
    /// Per-IP requests per second on session-creation routes.
    pub rate_limit: Option<u32>,
    /// Browser origins allowed to call the API cross-origin.
    pub cors_origins: Vec<String>,
    pub timings: Timings,
    pub protocol: ProtocolConfig,
    pub storage: StorageConfig,
    pub branding: Branding,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([127, 0, 0, 1], 8000)),
            temp_dir: std::env::temp_dir().join("pairlink"),
            max_sessions: 256,
            rate_limit: None,
            cors_origins: Vec::new(),
            timings: Timings::default(),
            protocol: ProtocolConfig::default(),
            storage: StorageConfig::default(),
            branding: Branding::default(),
        }
    }
}

/// Fixed delays driving the session lifecycle, in milliseconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Timings {
    pub settle_ms: u64,
    pub reconnect_delay_ms: u64,
    pub cleanup_grace_ms: u64,
    pub pairing_code_delay_ms: u64,
    pub reaper_interval_ms: u64,
    pub max_session_age_ms: u64,
}

impl Default for Timings {
    fn default() -> Self {
        Self {
            settle_ms: 2_000,
            reconnect_delay_ms: 5_000,
            cleanup_grace_ms: 5_000,
            pairing_code_delay_ms: 1_000,
            reaper_interval_ms: 5 * 60 * 1_000,
            max_session_age_ms: 10 * 60 * 1_000,
        }
    }
}

impl Timings {
    pub fn settle(&self) -> Duration {
        Duration::from_millis(self.settle_ms)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    pub fn cleanup_grace(&self) -> Duration {
        Duration::from_millis(self.cleanup_grace_ms)
    }

    pub fn pairing_code_delay(&self) -> Duration {
        Duration::from_millis(self.pairing_code_delay_ms)
    }

    pub fn reaper_interval(&self) -> Duration {
        Duration::from_millis(self.reaper_interval_ms)
    }

    pub fn max_session_age(&self) -> Duration {
        Duration::from_millis(self.max_session_age_ms)
    }
}

/// Where to reach the messaging-protocol bridge.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProtocolConfig {
    pub bridge_url: String,
    pub browser: Vec<String>,
    pub query_timeout_ms: u64,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            bridge_url: "ws://127.0.0.1:9300/session".into(),
            browser: vec!["Pairlink".into(), "Chrome".into(), "10.0.0".into()],
            query_timeout_ms: 60_000,
        }
    }
}

/// Remote object storage for credential artifacts.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub endpoint: Option<String>,
    pub token: Option<String>,
    /// Prefix of artifact names and reference codes.
    pub reference_prefix: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            token: None,
            reference_prefix: "pairlink".into(),
        }
    }
}

/// Text and links used in the messages sent to a freshly paired account.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Branding {
    /// Community invite to join after pairing. Skipped when unset.
    pub community_invite: Option<String>,
    pub bot_name: String,
    pub channel_url: Option<String>,
    pub thumbnail_url: Option<String>,
}

impl Default for Branding {
    fn default() -> Self {
        Self {
            community_invite: None,
            bot_name: "PAIRLINK".into(),
            channel_url: None,
            thumbnail_url: None,
        }
    }
}

impl Config {
    /// Load config from a TOML file path. Returns None if file doesn't exist.
    pub fn load(path: &Path) -> Result<Option<Self>, ConfigError> {
        if !path.exists() {
            return Ok(None);
        }

        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = toml::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        if config.storage.token.is_some() {
            warn_if_token_exposed(path);
        }
        Ok(Some(config))
    }

    /// Reject values the service cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_sessions == 0 {
            return Err(ConfigError::Invalid("max_sessions must be at least 1".into()));
        }
        let url = &self.protocol.bridge_url;
        if !(url.starts_with("ws://") || url.starts_with("wss://")) {
            return Err(ConfigError::Invalid(format!(
                "protocol.bridge_url must be a ws:// or wss:// URL, got {url:?}"
            )));
        }
        if self.timings.reaper_interval_ms == 0 {
            return Err(ConfigError::Invalid("timings.reaper_interval_ms must be non-zero".into()));
        }
        Ok(())
    }

    /// Default location: `<config dir>/pairlink/config.toml`.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("pairlink").join("config.toml"))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read config {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid TOML in {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// The storage token grants write access to every archived credential, so
/// anyone but the owner being able to read the file is worth a warning.
#[cfg(unix)]
fn warn_if_token_exposed(path: &Path) {
    use std::os::unix::fs::PermissionsExt;

    if let Ok(metadata) = std::fs::metadata(path) {
        let mode = metadata.permissions().mode();
        if readable_by_others(mode) {
            tracing::warn!(
                path = %path.display(),
                mode = format_args!("{:o}", mode & 0o777),
                "config holds a storage token but is readable by group or others; chmod 600 it",
            );
        }
    }
}

#[cfg(not(unix))]
fn warn_if_token_exposed(_path: &Path) {}

fn readable_by_others(mode: u32) -> bool {
    mode & 0o044 != 0
}
