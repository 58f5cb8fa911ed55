// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

// Node Configuration Types
//
// Defines the YAML configuration for both node roles:
// - `server`: data directory, listen address, TLS identity, event bus sizing
// - `client`: backing directory, mount point, remote endpoint, CA trust, mirror queue
//
// Either section may be absent; CLI flags and environment variables fill gaps.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;

pub const DEFAULT_PORT: u16 = 1054;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_yaml::Error,
    },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Top-level configuration file
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server: Option<ServerConfig>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client: Option<ClientConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Directory holding `<org>/<dept>` user roots
    pub data_dir: PathBuf,

    /// Optional mount point exposing `data_dir` locally
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mount_point: Option<PathBuf>,

    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls: Option<ServerTlsConfig>,

    /// HMAC/JWT secret; usually supplied through `MIRRORFS_SECRET_KEY`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_key: Option<String>,

    /// Token lifetime (default: 72h)
    #[serde(default = "default_token_ttl_secs")]
    pub token_ttl_secs: u64,

    #[serde(default)]
    pub event_bus: EventBusConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerTlsConfig {
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventBusConfig {
    /// Bounded broadcast queue consumed by the dispatcher
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// Per-subscriber buffer; events are dropped for that subscriber when full
    #[serde(default = "default_subscriber_buffer")]
    pub subscriber_buffer: usize,
}

impl Default for EventBusConfig {
    fn default() -> Self {
        Self {
            queue_capacity: default_queue_capacity(),
            subscriber_buffer: default_subscriber_buffer(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Local directory mirrored through the mount
    pub backing_dir: PathBuf,

    pub mount_point: PathBuf,

    /// e.g. `https://files.example.com:1054`
    pub remote_url: String,

    /// CA certificate trusted for the remote; plaintext transport when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ca_cert_path: Option<PathBuf>,

    /// TLS server name override
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls_domain: Option<String>,

    /// Where `login` stores the bearer token
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_path: Option<PathBuf>,

    #[serde(default)]
    pub mirror: MirrorQueueConfig,

    /// Upper bound for the synchronous pre-read staleness check
    #[serde(default = "default_stale_check_timeout_ms")]
    pub stale_check_timeout_ms: u64,

    /// Pull the remote tree in the background right after mounting
    #[serde(default = "default_true")]
    pub initial_pull: bool,
}

impl ClientConfig {
    pub fn stale_check_timeout(&self) -> Duration {
        Duration::from_millis(self.stale_check_timeout_ms)
    }

    pub fn token_path(&self) -> PathBuf {
        self.token_path.clone().unwrap_or_else(default_token_path)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MirrorQueueConfig {
    #[serde(default = "default_mirror_capacity")]
    pub capacity: usize,

    /// Mirror calls are replayed in submission order only with a single worker
    #[serde(default = "default_mirror_workers")]
    pub workers: usize,

    /// A mirror call still running after this long is abandoned
    #[serde(default = "default_mirror_call_timeout_secs")]
    pub call_timeout_secs: u64,
}

impl MirrorQueueConfig {
    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }
}

impl Default for MirrorQueueConfig {
    fn default() -> Self {
        Self {
            capacity: default_mirror_capacity(),
            workers: default_mirror_workers(),
            call_timeout_secs: default_mirror_call_timeout_secs(),
        }
    }
}

fn default_listen_addr() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], DEFAULT_PORT))
}

fn default_token_ttl_secs() -> u64 {
    72 * 60 * 60
}

fn default_queue_capacity() -> usize {
    100
}

fn default_subscriber_buffer() -> usize {
    64
}

fn default_mirror_capacity() -> usize {
    256
}

fn default_mirror_workers() -> usize {
    1
}

fn default_mirror_call_timeout_secs() -> u64 {
    30
}

fn default_stale_check_timeout_ms() -> u64 {
    2_000
}

fn default_true() -> bool {
    true
}

/// `~/.mirrorfs`
pub fn state_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".mirrorfs")
}

pub fn default_token_path() -> PathBuf {
    state_dir().join("token")
}

impl NodeConfig {
    pub fn from_yaml_str(yaml: &str) -> Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(yaml)
    }

    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn to_yaml(&self) -> Result<String, serde_yaml::Error> {
        serde_yaml::to_string(self)
    }

    /// Discover configuration file using precedence order
    /// 1. MIRRORFS_CONFIG_PATH environment variable
    /// 2. ./mirrorfs.yaml (working directory)
    /// 3. ~/.mirrorfs/config.yaml (user home)
    pub fn discover_config() -> Option<PathBuf> {
        if let Ok(path) = std::env::var("MIRRORFS_CONFIG_PATH") {
            let path = PathBuf::from(path);
            if path.exists() {
                return Some(path);
            }
        }

        let cwd = PathBuf::from("./mirrorfs.yaml");
        if cwd.exists() {
            return Some(cwd);
        }

        let user_config = state_dir().join("config.yaml");
        if user_config.exists() {
            return Some(user_config);
        }

        None
    }

    /// Load configuration with discovery, fallback to default
    pub fn load_or_default(cli_path: Option<PathBuf>) -> Result<Self, ConfigError> {
        let mut config = if let Some(path) = cli_path {
            tracing::info!("Loading configuration from explicit path: {:?}", path);
            Self::from_yaml_file(&path)?
        } else if let Some(path) = Self::discover_config() {
            tracing::info!("Loading configuration from discovered path: {:?}", path);
            Self::from_yaml_file(path)?
        } else {
            tracing::debug!("No configuration file found; using defaults");
            Self::default()
        };
        config.apply_env_overrides();
        Ok(config)
    }

    /// Apply environment variable overrides to configuration
    pub fn apply_env_overrides(&mut self) {
        if let Ok(secret) = std::env::var("MIRRORFS_SECRET_KEY") {
            if let Some(server) = self.server.as_mut() {
                tracing::debug!("Environment override: MIRRORFS_SECRET_KEY");
                server.secret_key = Some(secret);
            }
        }

        if let Ok(url) = std::env::var("MIRRORFS_REMOTE_URL") {
            if let Some(client) = self.client.as_mut() {
                tracing::info!("Environment override: MIRRORFS_REMOTE_URL={}", url);
                client.remote_url = url;
            }
        }
    }
}

impl ServerConfig {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            mount_point: None,
            listen_addr: default_listen_addr(),
            tls: None,
            secret_key: None,
            token_ttl_secs: default_token_ttl_secs(),
            event_bus: EventBusConfig::default(),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.secret_key.as_deref().is_none_or(str::is_empty) {
            return Err(ConfigError::Invalid(
                "secret key missing: set MIRRORFS_SECRET_KEY".to_string(),
            ));
        }
        if self.event_bus.queue_capacity == 0 || self.event_bus.subscriber_buffer == 0 {
            return Err(ConfigError::Invalid(
                "event bus capacities must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

impl ClientConfig {
    pub fn new(
        backing_dir: impl Into<PathBuf>,
        mount_point: impl Into<PathBuf>,
        remote_url: impl Into<String>,
    ) -> Self {
        Self {
            backing_dir: backing_dir.into(),
            mount_point: mount_point.into(),
            remote_url: remote_url.into(),
            ca_cert_path: None,
            tls_domain: None,
            token_path: None,
            mirror: MirrorQueueConfig::default(),
            stale_check_timeout_ms: default_stale_check_timeout_ms(),
            initial_pull: true,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.backing_dir == self.mount_point {
            return Err(ConfigError::Invalid(
                "backing directory and mount point must differ".to_string(),
            ));
        }
        if self.mirror.capacity == 0 || self.mirror.workers == 0 {
            return Err(ConfigError::Invalid(
                "mirror queue capacity and workers must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_minimal_server_config() {
        let yaml = r#"
server:
  data_dir: /srv/mirrorfs
"#;
        let config = NodeConfig::from_yaml_str(yaml).unwrap();
        let server = config.server.unwrap();
        assert_eq!(server.listen_addr.port(), DEFAULT_PORT);
        assert_eq!(server.token_ttl_secs, 72 * 3600);
        assert_eq!(server.event_bus.queue_capacity, 100);
        assert!(config.client.is_none());
    }

    #[test]
    fn test_parse_client_config() {
        let yaml = r#"
client:
  backing_dir: /home/alice/.mirrorfs/data
  mount_point: /home/alice/Shared
  remote_url: https://files.example.com:1054
  ca_cert_path: /etc/mirrorfs/ca.crt
  mirror:
    workers: 2
"#;
        let config = NodeConfig::from_yaml_str(yaml).unwrap();
        let client = config.client.unwrap();
        assert_eq!(client.mirror.workers, 2);
        assert_eq!(client.mirror.capacity, 256);
        assert!(client.initial_pull);
        assert!(client.validate().is_ok());
    }

    #[test]
    fn test_server_requires_secret() {
        let mut server = ServerConfig::new("/srv/mirrorfs");
        assert!(server.validate().is_err());
        server.secret_key = Some("s3cret".into());
        assert!(server.validate().is_ok());
    }

    #[test]
    fn test_client_rejects_mount_over_backing_dir() {
        let client = ClientConfig::new("/data", "/data", "http://127.0.0.1:1054");
        assert!(client.validate().is_err());
    }
}
