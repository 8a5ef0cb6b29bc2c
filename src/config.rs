use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::guard::DEFAULT_REFRESH_WINDOW_SECS;

/// A validation error in the configuration
#[derive(Debug, Clone)]
pub struct ValidationError {
    pub field: String,
    pub message: String,
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}]: {}", self.field, self.message)
    }
}

/// Longest refresh window accepted, one day
pub const MAX_REFRESH_WINDOW_SECS: u64 = 24 * 60 * 60;

fn default_check_interval_secs() -> u64 {
    30
}

fn default_request_timeout_ms() -> u64 {
    2_000 // login requests give up after 2 seconds
}

/// Session timing. Unset fields fall back to defaults.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct SessionConfig {
    /// How long before expiry the token is refreshed
    #[serde(default)]
    pub refresh_window_secs: Option<u64>,
    /// How often the session is rechecked when nothing else happens
    #[serde(default)]
    pub check_interval_secs: Option<u64>,
    #[serde(default)]
    pub request_timeout_ms: Option<u64>,
}

impl SessionConfig {
    pub fn refresh_window(&self) -> Duration {
        Duration::from_secs(
            self.refresh_window_secs
                .unwrap_or(DEFAULT_REFRESH_WINDOW_SECS),
        )
    }

    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(
            self.check_interval_secs
                .unwrap_or_else(default_check_interval_secs),
        )
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(
            self.request_timeout_ms
                .unwrap_or_else(default_request_timeout_ms),
        )
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct Config {
    /// Base URL of the hospital backend API
    #[serde(default)]
    pub api_host: Option<String>,
    #[serde(default)]
    pub session: SessionConfig,
    /// Where the session is persisted between runs
    #[serde(default)]
    pub storage_path: Option<PathBuf>,
}

impl Config {
    /// Load configuration from default paths
    /// Priority: local (.medadmin/config.local.toml) > project (.medadmin/config.toml) > user (~/.medadmin/config.toml)
    pub fn load() -> Result<Self> {
        let mut layers = Vec::new();
        if let Some(home) = dirs::home_dir() {
            layers.push(home.join(".medadmin").join("config.toml"));
        }
        layers.push(Path::new(".medadmin").join("config.toml"));
        layers.push(Path::new(".medadmin").join("config.local.toml"));
        Self::load_layers(&layers)
    }

    /// Merge every existing file in order, later files winning
    pub fn load_layers(paths: &[PathBuf]) -> Result<Self> {
        let mut config = Self::default();
        for path in paths {
            if path.exists() {
                let layer = Self::load_from(path)?;
                config.merge(layer);
            }
        }
        Ok(config)
    }

    /// Load configuration from a specific path
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    /// Merge another config into this one (other takes priority for every
    /// field it sets)
    pub fn merge(&mut self, other: Config) {
        if other.api_host.is_some() {
            self.api_host = other.api_host;
        }
        if other.storage_path.is_some() {
            self.storage_path = other.storage_path;
        }

        if other.session.refresh_window_secs.is_some() {
            self.session.refresh_window_secs = other.session.refresh_window_secs;
        }
        if other.session.check_interval_secs.is_some() {
            self.session.check_interval_secs = other.session.check_interval_secs;
        }
        if other.session.request_timeout_ms.is_some() {
            self.session.request_timeout_ms = other.session.request_timeout_ms;
        }
    }

    /// Session file location: configured path, else the platform data dir
    pub fn storage_path(&self) -> PathBuf {
        if let Some(path) = &self.storage_path {
            return path.clone();
        }
        dirs::data_dir()
            .map(|dir| dir.join("medadmin"))
            .unwrap_or_else(|| PathBuf::from(".medadmin"))
            .join("session.json")
    }

    /// Validate configuration and return any errors found
    pub fn validate(&self) -> Result<(), Vec<ValidationError>> {
        let mut errors = Vec::new();

        match self.api_host.as_deref() {
            None | Some("") => errors.push(ValidationError {
                field: "api_host".to_string(),
                message: "Not set. Use --api-host, MEDADMIN_HOST, or api_host in config"
                    .to_string(),
            }),
            Some(host) if !(host.starts_with("http://") || host.starts_with("https://")) => {
                errors.push(ValidationError {
                    field: "api_host".to_string(),
                    message: format!("Expected an http(s) URL, got '{}'", host),
                })
            }
            Some(_) => {}
        }

        match self.session.refresh_window_secs {
            Some(0) => errors.push(ValidationError {
                field: "session.refresh_window_secs".to_string(),
                message: "Must be greater than 0".to_string(),
            }),
            Some(secs) if secs > MAX_REFRESH_WINDOW_SECS => errors.push(ValidationError {
                field: "session.refresh_window_secs".to_string(),
                message: format!("Must be at most {} (one day)", MAX_REFRESH_WINDOW_SECS),
            }),
            _ => {}
        }
        if self.session.check_interval_secs == Some(0) {
            errors.push(ValidationError {
                field: "session.check_interval_secs".to_string(),
                message: "Must be greater than 0".to_string(),
            });
        }
        if self.session.request_timeout_ms == Some(0) {
            errors.push(ValidationError {
                field: "session.request_timeout_ms".to_string(),
                message: "Must be greater than 0".to_string(),
            });
        }

        // Periodic checks must be able to land inside the refresh window.
        if self.session.check_interval() >= self.session.refresh_window() {
            errors.push(ValidationError {
                field: "session.check_interval_secs".to_string(),
                message: format!(
                    "Must be shorter than the refresh window ({}s)",
                    self.session.refresh_window().as_secs()
                ),
            });
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}
