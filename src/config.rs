//! Application Configuration
//!
//! This module provides configuration management for the application,
//! supporting YAML configuration files with sensible defaults.

use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::error::Result;
use crate::scheduler::SchedulerConfig;
use crate::storage::config::StorageConfig;

/// Main application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Server configuration
    pub server: ServerConfig,
    /// Package, symbol and source storage
    pub storage: StorageConfig,
    /// Message scheduling between the HTTP surface and the processor
    pub scheduler: SchedulerConfig,
    /// Logging configuration
    pub logging: LoggingConfig,
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Server host
    pub host: String,
    /// Server port
    pub port: u16,
    /// Number of worker threads
    pub workers: usize,
    /// Maximum payload size in bytes
    pub max_payload_size: usize,
    /// Base URL debuggers use to fetch sources, written into stored symbols
    pub public_url: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 9710,
            workers: 4,
            max_payload_size: 1073741824, // 1GB
            public_url: "http://localhost:9710".to_string(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Path to log configuration file
    pub config_file: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            config_file: "server_log.yaml".to_string(),
        }
    }
}

impl AppConfig {
    /// Load `config.yaml`, use defaults if not found
    pub fn load() -> Result<Self> {
        Self::load_from("config.yaml")
    }

    /// Load configuration from `config_path` and apply environment overrides
    pub fn load_from(config_path: impl AsRef<Path>) -> Result<Self> {
        let config_path = config_path.as_ref();
        let mut config = if config_path.exists() {
            let content = fs::read_to_string(config_path)?;
            let config: AppConfig = serde_yaml::from_str(&content)?;
            info!("Loaded configuration from {}", config_path.display());
            config
        } else {
            warn!("Config file {} not found, using defaults", config_path.display());
            Self::default()
        };

        config.storage.apply_env();
        config.scheduler.apply_env();
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::SchedulerBackend;
    use crate::storage::config::{StorageBackend, TableBackend};
    use serial_test::serial;
    use tempfile::TempDir;

    #[test]
    #[serial]
    fn test_missing_file_uses_defaults() {
        let dir = TempDir::new().unwrap();
        let config = AppConfig::load_from(dir.path().join("absent.yaml")).unwrap();
        assert_eq!(config.server.port, 9710);
        assert_eq!(config.storage.backend, StorageBackend::Local);
        assert_eq!(config.scheduler.backend, SchedulerBackend::File);
        assert_eq!(config.logging.config_file, "server_log.yaml");
    }

    #[test]
    #[serial]
    fn test_partial_yaml_keeps_other_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.yaml");
        fs::write(
            &path,
            "server:\n  port: 8080\n  public_url: https://symbols.example.org\n\
             storage:\n  backend: remote\n  remote:\n    table: memory\n\
             scheduler:\n  backend: memory\n",
        )
        .unwrap();

        let config = AppConfig::load_from(&path).unwrap();
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.server.public_url, "https://symbols.example.org");
        assert_eq!(config.storage.backend, StorageBackend::Remote);
        assert_eq!(config.storage.remote.table, TableBackend::Memory);
        assert_eq!(config.storage.remote.copy_timeout_secs, 120);
        assert_eq!(config.scheduler.backend, SchedulerBackend::Memory);
    }

    #[test]
    #[serial]
    fn test_invalid_yaml_is_an_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.yaml");
        fs::write(&path, "server: [not, a, map]").unwrap();
        assert!(AppConfig::load_from(&path).is_err());
    }
}
