//! Wire protocol: JSON frames exchanged with clients.
//!
//! One JSON object per text frame, always carrying a string `type`. Inbound
//! frames decode into [`Inbound`]; everything the server emits serializes
//! from [`Outbound`]. Unknown inbound types are dropped without a reply.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::party::model::{ReplyTo, RoomStateSnapshot, UserSummary, VideoFormat};

// ─────────────────────────────────────────────────────────────────────────────
// Inbound
// ─────────────────────────────────────────────────────────────────────────────

/// Message types that count against the high-frequency rate bucket.
#[must_use]
pub fn is_high_frequency(msg_type: &str) -> bool {
    matches!(
        msg_type,
        "ping" | "seek" | "seek_ready" | "buffer_start" | "buffer_end"
    )
}

/// Inbound client message.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Inbound {
    Join {
        #[serde(default)]
        username: Option<String>,
        #[serde(default)]
        avatar: Option<String>,
    },
    Play {
        /// Client position; informational only.
        #[serde(default)]
        time: Option<f64>,
    },
    Pause {
        /// Client position. Far from live time, this is a seek intent.
        #[serde(default)]
        time: Option<f64>,
    },
    Seek {
        #[serde(default)]
        time: f64,
    },
    SeekReady {
        #[serde(default)]
        seek_epoch: u64,
    },
    BufferStart,
    BufferEnd,
    Chat {
        message: String,
        #[serde(default)]
        reply_to: Option<ReplyTo>,
    },
    Typing,
    VideoChange {
        url: String,
        #[serde(default)]
        title: Option<String>,
        #[serde(default)]
        user_agent: Option<String>,
        #[serde(default)]
        referer: Option<String>,
        #[serde(default)]
        subtitle_url: Option<String>,
    },
    Ping {
        #[serde(default)]
        current_time: Option<f64>,
        #[serde(default, rename = "_ping_id")]
        ping_id: Option<Value>,
        #[serde(default)]
        syncing: Option<bool>,
    },
    GetState,
}

/// Result of decoding one inbound frame.
#[derive(Debug)]
pub enum ParsedFrame {
    /// Well-formed message.
    Message(Box<Inbound>),
    /// Valid JSON with an unrecognized or missing `type`; dropped silently.
    Unknown,
    /// Not valid JSON, or fields of a known type failed to decode.
    Invalid,
}

/// Decodes a frame, separating unknown types (silent drop) from malformed
/// payloads (error reply). The `type` string is returned alongside so the
/// router can rate-limit before paying for full decoding.
#[must_use]
pub fn parse_frame(raw: &str) -> (Option<String>, ParsedFrame) {
    let value: Value = match serde_json::from_str(raw) {
        Ok(v) => v,
        Err(_) => return (None, ParsedFrame::Invalid),
    };
    let Some(msg_type) = value.get("type").and_then(Value::as_str).map(String::from) else {
        return (None, ParsedFrame::Unknown);
    };
    match Inbound::deserialize(value) {
        Ok(msg) => (Some(msg_type), ParsedFrame::Message(Box::new(msg))),
        Err(_) if !KNOWN_TYPES.contains(&msg_type.as_str()) => {
            (Some(msg_type), ParsedFrame::Unknown)
        }
        Err(_) => (Some(msg_type), ParsedFrame::Invalid),
    }
}

const KNOWN_TYPES: &[&str] = &[
    "join",
    "play",
    "pause",
    "seek",
    "seek_ready",
    "buffer_start",
    "buffer_end",
    "chat",
    "typing",
    "video_change",
    "ping",
    "get_state",
];

// ─────────────────────────────────────────────────────────────────────────────
// Outbound
// ─────────────────────────────────────────────────────────────────────────────

/// Authoritative playback update.
#[derive(Debug, Clone, Serialize)]
pub struct SyncPayload {
    pub is_playing: bool,
    pub current_time: f64,
    /// The client must hard-seek to `current_time`, not drift toward it.
    pub force_seek: bool,
    /// Present when the client is asked to participate in a barrier.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seek_sync: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seek_epoch: Option<u64>,
    pub triggered_by: String,
}

/// Outbound server message.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Outbound {
    RoomState(RoomStateSnapshot),
    UserJoined {
        username: String,
        avatar: String,
        user_id: String,
        users: Vec<UserSummary>,
    },
    UserLeft {
        username: String,
        user_id: String,
        users: Vec<UserSummary>,
    },
    Sync(SyncPayload),
    /// Soft rate nudge; the client adjusts playback rate without seeking.
    SyncCorrection { rate: f64 },
    Chat {
        username: String,
        avatar: String,
        message: String,
        timestamp: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        reply_to: Option<ReplyTo>,
    },
    Typing { username: String },
    VideoChanged {
        url: String,
        title: String,
        format: VideoFormat,
        duration: f64,
        user_agent: String,
        referer: String,
        subtitle_url: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        thumbnail: Option<String>,
        changed_by: String,
    },
    Pong {
        #[serde(rename = "_ping_id", skip_serializing_if = "Option::is_none")]
        ping_id: Option<Value>,
    },
    Error { message: String },
}

impl Outbound {
    /// Plain sync frame. Chain [`Outbound::triggered_by`] to attribute it.
    #[must_use]
    pub fn sync(is_playing: bool, current_time: f64, force_seek: bool) -> Self {
        Self::Sync(SyncPayload {
            is_playing,
            current_time,
            force_seek,
            seek_sync: None,
            seek_epoch: None,
            triggered_by: String::new(),
        })
    }

    /// Sync frame requesting barrier participation.
    #[must_use]
    pub fn seek_sync(current_time: f64, epoch: u64) -> Self {
        Self::Sync(SyncPayload {
            is_playing: false,
            current_time,
            force_seek: true,
            seek_sync: Some(true),
            seek_epoch: Some(epoch),
            triggered_by: String::new(),
        })
    }

    /// Sets `triggered_by` on sync frames; no-op for other variants.
    #[must_use]
    pub fn triggered_by(mut self, who: impl Into<String>) -> Self {
        if let Self::Sync(ref mut payload) = self {
            payload.triggered_by = who.into();
        }
        self
    }

    /// Serializes to the wire representation.
    ///
    /// Serialization of these types cannot fail in practice; `None` is
    /// returned instead of panicking so a bug degrades to a dropped frame.
    #[must_use]
    pub fn to_json(&self) -> Option<String> {
        match serde_json::to_string(self) {
            Ok(s) => Some(s),
            Err(e) => {
                log::error!("[Protocol] Failed to serialize outbound frame: {}", e);
                None
            }
        }
    }
}
