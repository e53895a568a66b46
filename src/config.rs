//! Configuration types for nzb-dl
//!
//! Loaded from a YAML file (default `./config.yaml`, container fallback
//! `/config/config.yaml`) with environment overrides under the `NZBDL_`
//! prefix, dot→underscore mapped (`NZBDL_DOWNLOAD_OUT_DIR`, ...).

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Main configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Config {
    /// NNTP server configurations (at least one required)
    #[serde(default)]
    pub servers: Vec<ServerConfig>,

    /// Download behavior settings
    #[serde(default)]
    pub download: DownloadConfig,

    /// Logging settings
    #[serde(default)]
    pub log: LogConfig,

    /// Metadata store settings
    #[serde(default)]
    pub store: StoreConfig,
}

/// NNTP server configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Unique identifier for this server (used in failover bookkeeping)
    pub id: String,

    /// Server hostname
    pub host: String,

    /// Server port (typically 119 for plaintext, 563 for TLS)
    pub port: u16,

    /// Username for authentication (no AUTHINFO is sent when absent)
    #[serde(default)]
    pub username: Option<String>,

    /// Password for authentication
    #[serde(default)]
    pub password: Option<String>,

    /// Use implicit TLS (socket wrapped before the greeting)
    #[serde(default)]
    pub tls: bool,

    /// Maximum concurrent connections to this server
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    /// Priority — lower is tried first (backup servers get higher values)
    #[serde(default)]
    pub priority: i32,
}

/// Download behavior configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DownloadConfig {
    /// Directory where `.part` and final files are written
    #[serde(default = "default_out_dir")]
    pub out_dir: PathBuf,

    /// Directory completed jobs are moved to (unused when empty)
    #[serde(default)]
    pub completed_dir: Option<PathBuf>,

    /// File extensions deleted from the output directory after a job
    /// completes successfully (e.g. `par2`, `sfv`, `nfo`)
    #[serde(default = "default_cleanup_extensions")]
    pub cleanup_extensions: Vec<String>,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            out_dir: default_out_dir(),
            completed_dir: None,
            cleanup_extensions: default_cleanup_extensions(),
        }
    }
}

/// Logging configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LogConfig {
    /// Log file path
    #[serde(default = "default_log_path")]
    pub path: PathBuf,

    /// Log level: debug | info | warn | error
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Also emit log records to stdout
    #[serde(default = "default_true")]
    pub include_stdout: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            path: default_log_path(),
            level: default_log_level(),
            include_stdout: true,
        }
    }
}

/// Metadata store configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StoreConfig {
    /// SQLite database path
    #[serde(default = "default_sqlite_path")]
    pub sqlite_path: PathBuf,

    /// Directory for cached NZB blobs (`<releaseID>.nzb`)
    #[serde(default = "default_blob_dir")]
    pub blob_dir: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            sqlite_path: default_sqlite_path(),
            blob_dir: default_blob_dir(),
        }
    }
}

fn default_max_connections() -> usize {
    10
}

fn default_out_dir() -> PathBuf {
    PathBuf::from("./downloads")
}

fn default_cleanup_extensions() -> Vec<String> {
    ["nzb", "par2", "sfv", "nfo"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_log_path() -> PathBuf {
    PathBuf::from("nzbdl.log")
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_sqlite_path() -> PathBuf {
    PathBuf::from("./data/nzbdl.db")
}

fn default_blob_dir() -> PathBuf {
    PathBuf::from("./data/blobs")
}

fn default_true() -> bool {
    true
}

/// Container fallback location checked when the default path is missing
const CONTAINER_CONFIG_PATH: &str = "/config/config.yaml";

impl Config {
    /// Load configuration from a YAML file, apply environment overrides,
    /// and validate.
    ///
    /// An empty `path` means the default `./config.yaml`; when that file
    /// does not exist, `/config/config.yaml` is tried so containerized
    /// deployments work without a flag.
    pub fn load(path: &str) -> Result<Self> {
        let mut candidate = if path.is_empty() { "config.yaml" } else { path };

        if !Path::new(candidate).exists() {
            if candidate == "config.yaml" && Path::new(CONTAINER_CONFIG_PATH).exists() {
                candidate = CONTAINER_CONFIG_PATH;
            } else {
                return Err(Error::Config {
                    message: format!("config file not found: {candidate}"),
                    key: None,
                });
            }
        }

        let raw = std::fs::read_to_string(candidate).map_err(|e| Error::Config {
            message: format!("error reading config file {candidate}: {e}"),
            key: None,
        })?;

        let mut config: Config = serde_yaml::from_str(&raw).map_err(|e| Error::Config {
            message: format!("error parsing config file {candidate}: {e}"),
            key: None,
        })?;

        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Apply `NZBDL_*` environment variable overrides to the scalar keys.
    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("NZBDL_DOWNLOAD_OUT_DIR") {
            self.download.out_dir = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("NZBDL_DOWNLOAD_COMPLETED_DIR") {
            self.download.completed_dir = Some(PathBuf::from(v));
        }
        if let Ok(v) = std::env::var("NZBDL_LOG_PATH") {
            self.log.path = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("NZBDL_LOG_LEVEL") {
            self.log.level = v;
        }
        if let Ok(v) = std::env::var("NZBDL_LOG_INCLUDE_STDOUT") {
            self.log.include_stdout = matches!(v.as_str(), "1" | "true" | "yes");
        }
        if let Ok(v) = std::env::var("NZBDL_STORE_SQLITE_PATH") {
            self.store.sqlite_path = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("NZBDL_STORE_BLOB_DIR") {
            self.store.blob_dir = PathBuf::from(v);
        }
    }

    /// Validate required fields and normalize out-of-range values.
    ///
    /// `max_connections <= 0` becomes 10 and `priority == 0` becomes 1,
    /// matching the documented configuration semantics.
    pub fn validate(&mut self) -> Result<()> {
        if self.servers.is_empty() {
            return Err(Error::Config {
                message: "at least one server must be configured".into(),
                key: Some("servers".into()),
            });
        }

        let mut seen_ids = std::collections::HashSet::new();
        for (i, server) in self.servers.iter_mut().enumerate() {
            if server.id.is_empty() {
                return Err(Error::Config {
                    message: format!("servers[{i}] requires a unique id"),
                    key: Some(format!("servers[{i}].id")),
                });
            }
            if !seen_ids.insert(server.id.clone()) {
                return Err(Error::Config {
                    message: format!("duplicate server id: {}", server.id),
                    key: Some(format!("servers[{i}].id")),
                });
            }
            if server.host.is_empty() {
                return Err(Error::Config {
                    message: format!("server {}: host is required", server.id),
                    key: Some(format!("servers[{i}].host")),
                });
            }
            if server.port == 0 {
                return Err(Error::Config {
                    message: format!("server {}: port is required", server.id),
                    key: Some(format!("servers[{i}].port")),
                });
            }
            if server.tls && server.port == 119 {
                tracing::warn!(
                    server = %server.id,
                    "TLS is enabled but port is 119 (standard plaintext port)"
                );
            }
            if server.max_connections == 0 {
                server.max_connections = default_max_connections();
            }
            if server.priority == 0 {
                server.priority = 1;
            }
        }

        if self.download.out_dir.as_os_str().is_empty() {
            self.download.out_dir = default_out_dir();
        }

        Ok(())
    }
}
