//! Configuration management for Syndicast

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::error::{ConfigError, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub database: DatabaseConfig,
    pub storage: StorageConfig,
    #[serde(default)]
    pub worker: WorkerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub path: String,
}

/// Durable media storage settings
///
/// `base_url` is the root of the storage service's resumable upload API;
/// uploaded objects become addressable at `<public_url>/<key>`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    pub base_url: String,
    pub public_url: String,
    #[serde(default = "default_chunk_size")]
    pub chunk_size_bytes: u64,
}

fn default_chunk_size() -> u64 {
    8 * 1024 * 1024
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Seconds between queue polls in the daemon
    #[serde(default = "default_poll_interval")]
    pub poll_interval: u64,
}

fn default_poll_interval() -> u64 {
    15
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval: default_poll_interval(),
        }
    }
}

impl Config {
    /// Load configuration from the default location
    pub fn load() -> Result<Self> {
        let config_path = resolve_config_path()?;
        Self::load_from_path(&config_path)
    }

    /// Load configuration from a specific path
    pub fn load_from_path(path: &PathBuf) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(ConfigError::ReadError)?;
        let config: Config = toml::from_str(&content).map_err(ConfigError::ParseError)?;
        Ok(config)
    }

    /// Create a default configuration
    pub fn default_config() -> Self {
        Self {
            database: DatabaseConfig {
                path: "~/.local/share/syndicast/syndicast.db".to_string(),
            },
            storage: StorageConfig {
                base_url: "https://storage.example.com/upload".to_string(),
                public_url: "https://media.example.com".to_string(),
                chunk_size_bytes: default_chunk_size(),
            },
            worker: WorkerConfig::default(),
        }
    }
}

/// Resolve the configuration file path following XDG Base Directory spec
pub fn resolve_config_path() -> Result<PathBuf> {
    if let Ok(path) = std::env::var("SYNDICAST_CONFIG") {
        return Ok(PathBuf::from(shellexpand::tilde(&path).to_string()));
    }

    let config_dir = dirs::config_dir()
        .ok_or_else(|| ConfigError::MissingField("config directory".to_string()))?;

    Ok(config_dir.join("syndicast").join("config.toml"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default_config();
        assert!(config.database.path.ends_with("syndicast.db"));
        assert_eq!(config.storage.chunk_size_bytes, 8 * 1024 * 1024);
        assert_eq!(config.worker.poll_interval, 15);
    }

    #[test]
    fn test_parse_minimal_config() {
        let toml_str = r#"
            [database]
            path = ":memory:"

            [storage]
            base_url = "https://storage.test/upload"
            public_url = "https://media.test"
        "#;

        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.database.path, ":memory:");
        assert_eq!(config.storage.chunk_size_bytes, 8 * 1024 * 1024);
        assert_eq!(config.worker.poll_interval, 15);
    }

    #[test]
    fn test_parse_full_config() {
        let toml_str = r#"
            [database]
            path = "/tmp/syndicast.db"

            [storage]
            base_url = "https://storage.test/upload"
            public_url = "https://media.test"
            chunk_size_bytes = 1048576

            [worker]
            poll_interval = 60
        "#;

        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.storage.chunk_size_bytes, 1_048_576);
        assert_eq!(config.worker.poll_interval, 60);
    }

    #[test]
    fn test_load_from_missing_path() {
        let result = Config::load_from_path(&PathBuf::from("/nonexistent/config.toml"));
        assert!(result.is_err());
    }
}
