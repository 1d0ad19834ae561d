//! Core application configuration.
//!
//! None of these options alter synchronization semantics; they are passed
//! through to clients (`proxy_url`, `ws_url`, ...) or consumed by the HTTP
//! layer (`host`, `port`). The engine's own thresholds live in
//! [`crate::protocol_constants`].

use serde::{Deserialize, Serialize};

/// Configuration for the Matinee application.
///
/// All fields have sensible defaults.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Config {
    // Server
    /// Address the HTTP/WS server binds to.
    pub host: String,

    /// Port the HTTP/WS server binds to.
    pub port: u16,

    // Client passthrough
    /// Opaque secret used for CSRF/session material on the HTML surface.
    /// Never interpreted by the sync engine.
    pub secret_key: String,

    /// Whether the media reverse proxy is enabled for clients.
    pub proxy_enabled: bool,

    /// Base URL of the media reverse proxy, forwarded in room snapshots so
    /// clients can compose proxied stream URLs.
    pub proxy_url: String,

    /// WebSocket base URL advertised to clients.
    pub ws_url: String,

    /// Production mode flag (affects client behavior only).
    pub production: bool,

    /// Probe stream URLs for reachability on video changes.
    pub availability_check: bool,

    // Engine
    /// Barrier timeout for seek/resume coordination (seconds).
    pub barrier_timeout_secs: f64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3310,
            secret_key: String::new(),
            proxy_enabled: true,
            proxy_url: "/proxy".to_string(),
            ws_url: String::new(),
            production: false,
            availability_check: false,
            barrier_timeout_secs: crate::protocol_constants::BARRIER_TIMEOUT_SECS,
        }
    }
}

impl Config {
    /// Validates the configuration values.
    pub fn validate(&self) -> Result<(), String> {
        if self.host.is_empty() {
            return Err("host must not be empty".to_string());
        }
        if self.barrier_timeout_secs <= 0.0 {
            return Err("barrier_timeout_secs must be > 0".to_string());
        }
        if self.proxy_enabled && self.proxy_url.is_empty() {
            return Err("proxy_url must be set when proxy_enabled is true".to_string());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_default_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn config_rejects_zero_barrier_timeout() {
        let config = Config {
            barrier_timeout_secs: 0.0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn config_rejects_proxy_without_url() {
        let config = Config {
            proxy_enabled: true,
            proxy_url: String::new(),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
