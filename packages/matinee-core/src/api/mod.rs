//! HTTP/WebSocket API layer.
//!
//! This module contains thin handlers that delegate to the party engine.
//! It provides router construction and server startup.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use reqwest::Client;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::media::{MediaResolver, YtDlpResolver};
use crate::party::PartyEngine;
use crate::protocol_constants::AVAILABILITY_PROBE_TIMEOUT_SECS;
use crate::state::Config;

pub mod http;
pub mod ws;
pub mod ws_connection;

pub use ws_connection::WsConnectionManager;

/// Errors that can occur when starting or running the server.
#[derive(Debug, Error)]
pub enum ServerError {
    /// Failed to bind the listen address.
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    /// Listener or connection-level I/O failure.
    #[error("Server I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Shared application state for the API layer.
///
/// A thin bundle of handles; all synchronization logic lives in the engine.
#[derive(Clone)]
pub struct AppState {
    /// The room synchronization engine.
    pub engine: Arc<PartyEngine>,
    /// External media metadata resolver.
    pub resolver: Arc<dyn MediaResolver>,
    /// WebSocket connection tracker.
    pub ws_manager: Arc<WsConnectionManager>,
    /// Application configuration.
    pub config: Arc<RwLock<Config>>,
    /// Shared HTTP client (availability probes).
    pub http_client: Client,
    /// Cancellation token for graceful shutdown of background tasks.
    pub cancel_token: CancellationToken,
}

impl AppState {
    /// Wires the default production state from a configuration.
    #[must_use]
    pub fn new(config: Config) -> Self {
        let engine = Arc::new(PartyEngine::with_barrier_timeout(
            config.barrier_timeout_secs,
        ));
        Self::with_resolver(config, engine, Arc::new(YtDlpResolver::new()))
    }

    /// Wires state around an existing engine and resolver (tests, embedders).
    #[must_use]
    pub fn with_resolver(
        config: Config,
        engine: Arc<PartyEngine>,
        resolver: Arc<dyn MediaResolver>,
    ) -> Self {
        let http_client = Client::builder()
            .timeout(Duration::from_secs(AVAILABILITY_PROBE_TIMEOUT_SECS))
            .build()
            .expect("Failed to create HTTP client");

        Self {
            engine,
            resolver,
            ws_manager: Arc::new(WsConnectionManager::new()),
            config: Arc::new(RwLock::new(config)),
            http_client,
            cancel_token: CancellationToken::new(),
        }
    }

    /// The proxy base URL clients should compose stream URLs with, or empty
    /// when the proxy is disabled.
    #[must_use]
    pub fn client_proxy_url(&self) -> String {
        let config = self.config.read();
        if config.proxy_enabled {
            config.proxy_url.clone()
        } else {
            String::new()
        }
    }

    /// Initiates graceful shutdown: stops background tasks and force-closes
    /// every WebSocket connection.
    pub fn shutdown(&self) {
        log::info!("[Server] Beginning graceful shutdown...");
        self.cancel_token.cancel();
        let closed = self.ws_manager.close_all();
        log::info!("[Server] Shutdown signalled ({} connection(s) closed)", closed);
    }
}

/// Starts the HTTP server on the configured address and runs until the
/// listener fails or the process exits.
pub async fn start_server(state: AppState) -> Result<(), ServerError> {
    let (host, port) = {
        let config = state.config.read();
        (config.host.clone(), config.port)
    };
    let addr = format!("{}:{}", host, port);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|source| ServerError::Bind {
            addr: addr.clone(),
            source,
        })?;

    // Background reaper lives for the lifetime of the server.
    state.engine.spawn_reaper(state.cancel_token.child_token());

    log::info!("Server listening on http://{}", addr);
    let app = http::create_router(state);
    axum::serve(listener, app).await?;
    Ok(())
}
