//! Test doubles for the connection seam.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::model::{ClientConnection, SendFailure};

/// In-memory connection that records every frame sent to it.
///
/// With `fail` set, every send errors, standing in for a closed socket.
pub(crate) struct RecordingConnection {
    sent: Mutex<Vec<String>>,
    fail: bool,
}

impl RecordingConnection {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            sent: Mutex::new(Vec::new()),
            fail: false,
        })
    }

    pub fn failing() -> Arc<Self> {
        Arc::new(Self {
            sent: Mutex::new(Vec::new()),
            fail: true,
        })
    }

    /// Fresh connection nobody needs to inspect afterwards.
    pub fn arc() -> Arc<Self> {
        Self::new()
    }

    /// Frames delivered so far.
    pub fn sent(&self) -> Vec<String> {
        self.sent.lock().clone()
    }
}

#[async_trait]
impl ClientConnection for RecordingConnection {
    async fn send_text(&self, payload: &str) -> Result<(), SendFailure> {
        if self.fail {
            return Err(SendFailure("socket closed".into()));
        }
        self.sent.lock().push(payload.to_string());
        Ok(())
    }
}
