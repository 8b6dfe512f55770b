use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::CrmError;

/// Env override for `Config::api_url`.
pub const API_URL_ENV: &str = "MEDREP_API_URL";
/// Env override for `Config::api_key`.
pub const API_KEY_ENV: &str = "MEDREP_API_KEY";

/// Configuration stored in ~/.medrep/config.json
///
/// Every field has a default, so a missing file or a partial file is fine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// Base URL of the remote data service (e.g. https://xyz.example.co).
    #[serde(default)]
    pub api_url: String,
    /// Publishable key sent with every request.
    #[serde(default)]
    pub api_key: String,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    /// Network timeout handed to the HTTP client. The only timeout layer.
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
    /// Override for the preference file location.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preferences_path: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_url: String::new(),
            api_key: String::new(),
            session: SessionConfig::default(),
            retry: RetryConfig::default(),
            request_timeout_secs: default_request_timeout(),
            preferences_path: None,
        }
    }
}

fn default_request_timeout() -> u64 {
    30
}

/// Session keeper timing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionConfig {
    #[serde(default = "default_throttle")]
    pub throttle_secs: u64,
    #[serde(default = "default_refresh_threshold")]
    pub refresh_threshold_secs: u64,
    #[serde(default = "default_check_interval")]
    pub check_interval_secs: u64,
    #[serde(default = "default_throttle")]
    pub visibility_throttle_secs: u64,
}

fn default_throttle() -> u64 {
    30
}

fn default_refresh_threshold() -> u64 {
    300
}

fn default_check_interval() -> u64 {
    600
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            throttle_secs: default_throttle(),
            refresh_threshold_secs: default_refresh_threshold(),
            check_interval_secs: default_check_interval(),
            visibility_throttle_secs: default_throttle(),
        }
    }
}

/// Auth-retry budget for remote calls.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryConfig {
    /// Extra attempts after an auth failure. Clamped to 1..=2.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: u64,
}

fn default_max_retries() -> u32 {
    1
}

fn default_backoff_ms() -> u64 {
    500
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            backoff_ms: default_backoff_ms(),
        }
    }
}

impl Config {
    /// Validate the parts needed to talk to the backend.
    pub fn validate_remote(&self) -> Result<(), CrmError> {
        if self.api_url.trim().is_empty() {
            return Err(CrmError::Config(format!(
                "apiUrl is not set (config file or {})",
                API_URL_ENV
            )));
        }
        url::Url::parse(&self.api_url)
            .map_err(|e| CrmError::Config(format!("Invalid apiUrl '{}': {}", self.api_url, e)))?;
        if self.api_key.trim().is_empty() {
            return Err(CrmError::Config(format!(
                "apiKey is not set (config file or {})",
                API_KEY_ENV
            )));
        }
        Ok(())
    }

    pub fn preferences_path(&self) -> Result<PathBuf, CrmError> {
        match &self.preferences_path {
            Some(path) if !path.trim().is_empty() => Ok(PathBuf::from(path)),
            _ => crate::preferences::PreferenceStore::default_path(),
        }
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(url) = std::env::var(API_URL_ENV) {
            if !url.trim().is_empty() {
                self.api_url = url;
            }
        }
        if let Ok(key) = std::env::var(API_KEY_ENV) {
            if !key.trim().is_empty() {
                self.api_key = key;
            }
        }
    }
}

/// Get the canonical config file path (~/.medrep/config.json)
pub fn config_path() -> Result<PathBuf, CrmError> {
    Ok(crate::util::medrep_dir()?.join("config.json"))
}

/// Load config from the canonical path, then apply env overrides.
pub fn load_config() -> Result<Config, CrmError> {
    let mut config = load_config_from(&config_path()?)?;
    config.apply_env_overrides();
    Ok(config)
}

/// Load config from `path`. A missing file yields defaults.
pub fn load_config_from(path: &Path) -> Result<Config, CrmError> {
    if !path.exists() {
        log::info!("No config at {}, using defaults", path.display());
        return Ok(Config::default());
    }

    let content = fs::read_to_string(path)
        .map_err(|e| CrmError::Config(format!("Failed to read config: {}", e)))?;
    serde_json::from_str(&content)
        .map_err(|e| CrmError::Config(format!("Failed to parse config: {}", e)))
}
