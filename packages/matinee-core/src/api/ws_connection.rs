//! WebSocket connection tracking.
//!
//! Tracks every live socket with the room it is attached to, and provides
//! force-close for shutdown:
//!
//! - `WsConnectionManager`: registry of active connections
//! - `ConnectionGuard`: RAII guard that unregisters on disconnect

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;

/// Per-connection bookkeeping.
struct ConnectionState {
    room_id: String,
}

/// Registry of active WebSocket connections.
///
/// Safe for concurrent access from every connection handler. A hierarchical
/// cancellation token lets shutdown close all sockets without the manager
/// holding any socket handles itself.
pub struct WsConnectionManager {
    /// Active connections: connection_id -> state.
    connections: DashMap<String, ConnectionState>,
    /// Counter for generating unique connection IDs.
    next_id: AtomicU64,
    /// Parent token; children are handed to connections. Replaced after
    /// close_all() so new connections can still be accepted.
    global_cancel: RwLock<CancellationToken>,
}

impl WsConnectionManager {
    /// Creates an empty manager.
    #[must_use]
    pub fn new() -> Self {
        Self {
            connections: DashMap::new(),
            next_id: AtomicU64::new(1),
            global_cancel: RwLock::new(CancellationToken::new()),
        }
    }

    /// Registers a connection bound for `room_id` and returns its guard.
    pub fn register(self: &Arc<Self>, room_id: &str) -> ConnectionGuard {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let conn_id = format!("ws-{}", id);
        let cancel_token = self.global_cancel.read().child_token();

        self.connections.insert(
            conn_id.clone(),
            ConnectionState {
                room_id: room_id.to_string(),
            },
        );
        log::info!(
            "[WS] Connection {} opened for room {} (total: {})",
            conn_id,
            room_id,
            self.connections.len()
        );

        ConnectionGuard {
            id: conn_id,
            manager: Arc::clone(self),
            cancel_token,
        }
    }

    fn unregister(&self, id: &str) {
        if self.connections.remove(id).is_some() {
            log::info!(
                "[WS] Connection {} closed (remaining: {})",
                id,
                self.connections.len()
            );
        }
    }

    /// Number of live connections.
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Number of live connections attached to one room.
    #[must_use]
    pub fn connections_for_room(&self, room_id: &str) -> usize {
        self.connections
            .iter()
            .filter(|entry| entry.value().room_id == room_id)
            .count()
    }

    /// Signals every connection handler to terminate, then resets the
    /// parent token so later connections are unaffected. Returns how many
    /// connections were signalled.
    pub fn close_all(&self) -> usize {
        let count = self.connections.len();
        if count > 0 {
            log::info!("[WS] Force-closing {} connection(s)", count);
            let mut guard = self.global_cancel.write();
            guard.cancel();
            *guard = CancellationToken::new();
        }
        count
    }
}

impl Default for WsConnectionManager {
    fn default() -> Self {
        Self::new()
    }
}

/// RAII guard that unregisters its connection when dropped, so handlers
/// that panic or return early still clean up.
pub struct ConnectionGuard {
    id: String,
    manager: Arc<WsConnectionManager>,
    cancel_token: CancellationToken,
}

impl ConnectionGuard {
    /// The connection ID.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Token cancelled when the server force-closes connections; select on
    /// it in the receive loop.
    #[must_use]
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel_token
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.manager.unregister(&self.id);
    }
}
