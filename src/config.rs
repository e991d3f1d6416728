//! Configuration management for PointLedger

use serde::Deserialize;
use std::fs;
use std::path::Path;

use crate::error::{LedgerError, Result};

pub const DEFAULT_CONFIG_PATH: &str = "pointledger.toml";
pub const CONFIG_PATH_ENV: &str = "POINTLEDGER_CONFIG";

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub ledger: LedgerConfig,
    #[serde(default)]
    pub api: ApiConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

/// Tunables for the ledger core.
#[derive(Debug, Clone, Deserialize)]
pub struct LedgerConfig {
    /// Attempts an append makes before giving up with `Contention`.
    #[serde(default = "default_max_append_retries")]
    pub max_append_retries: u32,
    /// Back-off between attempts, multiplied by the attempt number.
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
    /// Page size for verification and repair walks.
    #[serde(default = "default_verify_batch_size")]
    pub verify_batch_size: usize,
    /// Number of most recent blocks covered by a Merkle root.
    #[serde(default = "default_merkle_window")]
    pub merkle_window: usize,
    #[serde(default = "default_system_user_id")]
    pub system_user_id: String,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            max_append_retries: default_max_append_retries(),
            retry_backoff_ms: default_retry_backoff_ms(),
            verify_batch_size: default_verify_batch_size(),
            merkle_window: default_merkle_window(),
            system_user_id: default_system_user_id(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_api_port")]
    pub port: u16,
    /// Admin endpoints are disabled when unset.
    #[serde(default)]
    pub admin_token: Option<String>,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            port: default_api_port(),
            admin_token: None,
        }
    }
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        if self.database.path.is_empty() {
            return Err(LedgerError::Config(
                "database.path must not be empty".to_string(),
            ));
        }
        if self.ledger.max_append_retries == 0 {
            return Err(LedgerError::Config(
                "ledger.max_append_retries must be at least 1".to_string(),
            ));
        }
        if self.ledger.verify_batch_size == 0 {
            return Err(LedgerError::Config(
                "ledger.verify_batch_size must be at least 1".to_string(),
            ));
        }
        if self.ledger.merkle_window == 0 {
            return Err(LedgerError::Config(
                "ledger.merkle_window must be at least 1".to_string(),
            ));
        }
        if self.ledger.system_user_id.trim().is_empty() {
            return Err(LedgerError::Config(
                "ledger.system_user_id must not be empty".to_string(),
            ));
        }
        if matches!(&self.api.admin_token, Some(token) if token.is_empty()) {
            return Err(LedgerError::Config(
                "api.admin_token must not be empty when set".to_string(),
            ));
        }
        Ok(())
    }
}

/// Loads the config from `$POINTLEDGER_CONFIG` or `pointledger.toml`,
/// falling back to defaults when the file is absent.
pub fn load_config() -> Result<Config> {
    let path = std::env::var(CONFIG_PATH_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
    load_config_from(Path::new(&path))
}

pub fn load_config_from(path: &Path) -> Result<Config> {
    let config = if path.exists() {
        let raw = fs::read_to_string(path)?;
        parse_config(&raw)?
    } else {
        Config::default()
    };
    config.validate()?;
    Ok(config)
}

pub fn parse_config(raw: &str) -> Result<Config> {
    toml::from_str(raw).map_err(|e| LedgerError::Config(format!("Invalid config: {}", e)))
}

fn default_db_path() -> String {
    "./data/pointledger.db".to_string()
}

fn default_max_append_retries() -> u32 {
    5
}

fn default_retry_backoff_ms() -> u64 {
    10
}

fn default_verify_batch_size() -> usize {
    1000
}

fn default_merkle_window() -> usize {
    100
}

fn default_system_user_id() -> String {
    "SYSTEM".to_string()
}

fn default_api_port() -> u16 {
    3000
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = parse_config("").unwrap();
        assert_eq!(config.ledger.verify_batch_size, 1000);
        assert_eq!(config.ledger.merkle_window, 100);
        assert_eq!(config.ledger.system_user_id, "SYSTEM");
        assert!(config.api.admin_token.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_config_overrides() {
        let config = parse_config(
            r#"
            [ledger]
            max_append_retries = 12
            merkle_window = 16

            [api]
            port = 8088
            admin_token = "s3cret"
            "#,
        )
        .unwrap();
        assert_eq!(config.ledger.max_append_retries, 12);
        assert_eq!(config.ledger.merkle_window, 16);
        assert_eq!(config.ledger.verify_batch_size, 1000);
        assert_eq!(config.api.port, 8088);
        assert_eq!(config.api.admin_token.as_deref(), Some("s3cret"));
    }

    #[test]
    fn test_zero_window_rejected() {
        let config = parse_config("[ledger]\nmerkle_window = 0\n").unwrap();
        assert!(matches!(config.validate(), Err(LedgerError::Config(_))));
    }

    #[test]
    fn test_missing_file_falls_back_to_defaults() {
        let config = load_config_from(Path::new("/nonexistent/pointledger.toml")).unwrap();
        assert_eq!(config.api.port, 3000);
    }
}
