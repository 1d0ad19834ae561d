//! Server configuration.
//!
//! Supports loading from YAML files with environment variable overrides.

use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;

/// Server configuration loaded from YAML with environment overrides.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address to bind the HTTP/WS server to.
    /// Override: `MATINEE_HOST`
    pub host: String,

    /// Port to bind the HTTP/WS server to.
    /// Override: `MATINEE_PORT`
    pub port: u16,

    /// Opaque secret for the HTML surface (sessions/CSRF); never read by
    /// the sync engine.
    /// Override: `MATINEE_SECRET_KEY`
    pub secret_key: String,

    /// Whether the media reverse proxy is advertised to clients.
    pub proxy_enabled: bool,

    /// Base URL of the media reverse proxy.
    /// Override: `MATINEE_PROXY_URL`
    pub proxy_url: String,

    /// WebSocket base URL advertised to clients (empty = same origin).
    /// Override: `MATINEE_WS_URL`
    pub ws_url: String,

    /// Production mode flag passed through to clients.
    pub production: bool,

    /// Probe stream URLs for reachability on video changes.
    pub availability_check: bool,

    /// Barrier timeout for seek/resume coordination (seconds).
    pub barrier_timeout_secs: f64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        let core = matinee_core::Config::default();
        Self {
            host: core.host,
            port: core.port,
            secret_key: core.secret_key,
            proxy_enabled: core.proxy_enabled,
            proxy_url: core.proxy_url,
            ws_url: core.ws_url,
            production: core.production,
            availability_check: core.availability_check,
            barrier_timeout_secs: core.barrier_timeout_secs,
        }
    }
}

impl ServerConfig {
    /// Loads configuration from a YAML file, then applies environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = if let Some(path) = path {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {}", path.display()))?;
            serde_yaml::from_str(&content)
                .with_context(|| format!("Failed to parse config file: {}", path.display()))?
        } else {
            Self::default()
        };

        config.apply_env_overrides();
        Ok(config)
    }

    /// Applies environment variable overrides to the configuration.
    fn apply_env_overrides(&mut self) {
        if let Ok(val) = std::env::var("MATINEE_HOST") {
            if !val.is_empty() {
                self.host = val;
            }
        }

        if let Ok(val) = std::env::var("MATINEE_PORT") {
            if let Ok(port) = val.parse() {
                self.port = port;
            }
        }

        if let Ok(val) = std::env::var("MATINEE_SECRET_KEY") {
            if !val.is_empty() {
                self.secret_key = val;
            }
        }

        if let Ok(val) = std::env::var("MATINEE_PROXY_URL") {
            if !val.is_empty() {
                self.proxy_url = val;
            }
        }

        if let Ok(val) = std::env::var("MATINEE_WS_URL") {
            if !val.is_empty() {
                self.ws_url = val;
            }
        }
    }

    /// Converts to matinee-core's Config type.
    pub fn to_core_config(&self) -> matinee_core::Config {
        matinee_core::Config {
            host: self.host.clone(),
            port: self.port,
            secret_key: self.secret_key.clone(),
            proxy_enabled: self.proxy_enabled,
            proxy_url: self.proxy_url.clone(),
            ws_url: self.ws_url.clone(),
            production: self.production,
            availability_check: self.availability_check,
            barrier_timeout_secs: self.barrier_timeout_secs,
        }
    }
}
