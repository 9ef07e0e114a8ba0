// crates/client/src/config.rs
//! Client configuration: built-in defaults, environment overrides and an
//! optional TOML file.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::ConfigError;

/// Default API server when neither env nor config file name one.
pub const DEFAULT_API_SERVER: &str = "http://localhost:7777";

/// Default interval between two progress polls of the same job.
pub const DEFAULT_PROGRESS_INTERVAL: Duration = Duration::from_millis(300);

/// Sent with every login / validate-key call so the server can log and gate
/// client versions.
pub fn client_version_string() -> String {
    format!("Rust ModelAPI Client {}", env!("CARGO_PKG_VERSION"))
}

/// Configuration for a [`crate::ApiClient`].
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Base URL of the API server, without trailing slash.
    pub api_server: String,
    /// Default user for logins (MODELAPI_USER).
    pub user: Option<String>,
    /// Default API key for logins (MODELAPI_KEY).
    pub api_key: Option<String>,
    pub progress_interval: Duration,
    pub client_version: String,
    /// Connect timeout for the shared HTTP client. Request timeouts are left
    /// to callers.
    pub connect_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            api_server: std::env::var("MODELAPI_SERVER")
                .unwrap_or_else(|_| DEFAULT_API_SERVER.to_string()),
            user: std::env::var("MODELAPI_USER").ok(),
            api_key: std::env::var("MODELAPI_KEY").ok(),
            progress_interval: std::env::var("MODELAPI_PROGRESS_INTERVAL_MS")
                .ok()
                .and_then(|ms| ms.parse().ok())
                .map(Duration::from_millis)
                .unwrap_or(DEFAULT_PROGRESS_INTERVAL),
            client_version: client_version_string(),
            connect_timeout: Duration::from_secs(10),
        }
    }
}

/// On-disk shape of the config file. Every field is optional and overrides
/// the defaults.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    api_server: Option<String>,
    user: Option<String>,
    api_key: Option<String>,
    progress_interval_ms: Option<u64>,
    connect_timeout_secs: Option<u64>,
}

impl ClientConfig {
    /// Default config file location: `<config dir>/modelapi/config.toml`.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("modelapi").join("config.toml"))
    }

    /// Defaults, overridden by the file at `path`.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let file: FileConfig = toml::from_str(&text).map_err(|e| ConfigError::Malformed {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        let config = Self::default().merge(file);
        config.validate()?;
        Ok(config)
    }

    /// Load from `path` if given, otherwise from the default location when a
    /// file exists there, otherwise fall back to defaults.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        if let Some(path) = path {
            return Self::from_file(path);
        }
        match Self::default_path() {
            Some(path) if path.exists() => {
                tracing::debug!(path = %path.display(), "loading client config");
                Self::from_file(&path)
            }
            _ => {
                let config = Self::default();
                config.validate()?;
                Ok(config)
            }
        }
    }

    pub fn with_api_server(mut self, server: impl Into<String>) -> Self {
        self.api_server = server.into();
        self
    }

    pub fn with_progress_interval(mut self, interval: Duration) -> Self {
        self.progress_interval = interval;
        self
    }

    /// Check that `api_server` is an absolute http(s) URL.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let url = reqwest::Url::parse(&self.api_server).map_err(|e| {
            ConfigError::InvalidServerUrl {
                url: self.api_server.clone(),
                message: e.to_string(),
            }
        })?;
        match url.scheme() {
            "http" | "https" => Ok(()),
            other => Err(ConfigError::InvalidServerUrl {
                url: self.api_server.clone(),
                message: format!("unsupported scheme `{other}`"),
            }),
        }
    }

    fn merge(mut self, file: FileConfig) -> Self {
        if let Some(server) = file.api_server {
            self.api_server = server;
        }
        if file.user.is_some() {
            self.user = file.user;
        }
        if file.api_key.is_some() {
            self.api_key = file.api_key;
        }
        if let Some(ms) = file.progress_interval_ms {
            self.progress_interval = Duration::from_millis(ms);
        }
        if let Some(secs) = file.connect_timeout_secs {
            self.connect_timeout = Duration::from_secs(secs);
        }
        self
    }
}
