//! WebSocket connection router.
//!
//! One task per connection: validate the frame, rate-limit it, gate on
//! join, dispatch to the engine, and emit the resulting broadcasts. All
//! room mutation happens inside engine methods; this module is plumbing.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket};
use axum::extract::{Path, State, WebSocketUpgrade};
use axum::response::{IntoResponse, Response};
use futures::sink::SinkExt;
use futures::stream::{SplitSink, StreamExt};
use serde_json::Value;

use crate::api::AppState;
use crate::error::MatineeError;
use crate::media::check_stream_available;
use crate::party::model::{ClientConnection, SendFailure, VideoFormat};
use crate::party::{
    Correction, PauseOutcome, ReplyTo, SeekOutcome, VideoUpdate,
};
use crate::protocol::{is_high_frequency, parse_frame, Inbound, Outbound, ParsedFrame};
use crate::protocol_constants::{
    GENERAL_LIMIT_PER_SEC, HIGH_FREQ_LIMIT_PER_SEC, MAX_PAYLOAD_BYTES, SEND_TIMEOUT_SECS,
};
use crate::utils::is_valid_room_token;

// ─────────────────────────────────────────────────────────────────────────────
// Outbound Connection
// ─────────────────────────────────────────────────────────────────────────────

/// Production [`ClientConnection`] over an axum WebSocket sink.
///
/// The internal mutex is the per-user send serializer: broadcasts and
/// heartbeat corrections contend here instead of interleaving on the wire.
struct WsClient {
    sink: tokio::sync::Mutex<SplitSink<WebSocket, Message>>,
}

impl WsClient {
    fn new(sink: SplitSink<WebSocket, Message>) -> Arc<Self> {
        Arc::new(Self {
            sink: tokio::sync::Mutex::new(sink),
        })
    }
}

#[async_trait]
impl ClientConnection for WsClient {
    async fn send_text(&self, payload: &str) -> Result<(), SendFailure> {
        let mut sink = self.sink.lock().await;
        sink.send(Message::Text(payload.to_string().into()))
            .await
            .map_err(|e| SendFailure(e.to_string()))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Rate Limiting
// ─────────────────────────────────────────────────────────────────────────────

/// Fixed-window counter, reset every second.
struct RateLimiter {
    limit: u32,
    count: u32,
    window_start: f64,
}

impl RateLimiter {
    fn new(limit: u32) -> Self {
        Self {
            limit,
            count: 0,
            window_start: 0.0,
        }
    }

    /// Counts one message at `now`; returns whether it is within budget.
    fn allow(&mut self, now: f64) -> bool {
        if now - self.window_start > 1.0 {
            self.count = 0;
            self.window_start = now;
        }
        self.count += 1;
        self.count <= self.limit
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Upgrade Handler
// ─────────────────────────────────────────────────────────────────────────────

/// WebSocket upgrade handler for `/ws/watch_party/{room_id}`.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Path(room_id): Path<String>,
    State(state): State<AppState>,
) -> Response {
    let room_id = room_id.to_ascii_uppercase();
    if !is_valid_room_token(&room_id) {
        return MatineeError::InvalidRequest("invalid room id".into()).into_response();
    }
    ws.on_upgrade(move |socket| handle_socket(socket, state, room_id))
        .into_response()
}

async fn handle_socket(socket: WebSocket, state: AppState, room_id: String) {
    let (sink, mut receiver) = socket.split();
    let conn = WsClient::new(sink);

    let conn_guard = state.ws_manager.register(&room_id);
    let cancel_token = conn_guard.cancel_token().clone();

    let mut session = Session {
        state,
        room_id,
        conn,
        user_id: None,
        username: String::new(),
        general_bucket: RateLimiter::new(GENERAL_LIMIT_PER_SEC),
        high_bucket: RateLimiter::new(HIGH_FREQ_LIMIT_PER_SEC),
    };

    loop {
        tokio::select! {
            _ = cancel_token.cancelled() => {
                log::info!("[WS] Connection {} force-closed", conn_guard.id());
                break;
            }
            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        session.handle_frame(text.as_str()).await;
                    }
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    _ => {}
                }
            }
        }
    }

    session.handle_disconnect().await;
}

// ─────────────────────────────────────────────────────────────────────────────
// Session
// ─────────────────────────────────────────────────────────────────────────────

/// Per-connection dispatch state.
struct Session {
    state: AppState,
    room_id: String,
    conn: Arc<WsClient>,
    /// Set once a `join` succeeds.
    user_id: Option<String>,
    username: String,
    general_bucket: RateLimiter,
    high_bucket: RateLimiter,
}

impl Session {
    /// Sends a frame on this connection, bypassing the roster (used before
    /// join and for protocol errors).
    async fn send_direct(&self, message: &Outbound) {
        let Some(payload) = message.to_json() else {
            return;
        };
        let _ = tokio::time::timeout(
            Duration::from_secs_f64(SEND_TIMEOUT_SECS),
            self.conn.send_text(&payload),
        )
        .await;
    }

    async fn send_error(&self, message: &str) {
        self.send_direct(&Outbound::Error {
            message: message.to_string(),
        })
        .await;
    }

    /// Validates, rate-limits, and dispatches one inbound text frame.
    async fn handle_frame(&mut self, raw: &str) {
        if raw.len() > MAX_PAYLOAD_BYTES {
            self.send_error("Message too large").await;
            return;
        }

        let (msg_type, parsed) = parse_frame(raw);
        let msg = match parsed {
            ParsedFrame::Message(msg) => *msg,
            ParsedFrame::Unknown => return,
            ParsedFrame::Invalid => {
                self.send_error("Invalid message format").await;
                return;
            }
        };
        let msg_type = msg_type.unwrap_or_default();

        let now = self.state.engine.now();
        if is_high_frequency(&msg_type) {
            if !self.high_bucket.allow(now) {
                // High-frequency overflow drops silently; these are
                // telemetry-class messages the client will repeat anyway.
                return;
            }
        } else if !self.general_bucket.allow(now) {
            self.send_error("You're sending messages too quickly").await;
            return;
        }

        let needs_user = !matches!(msg, Inbound::Join { .. } | Inbound::Ping { .. } | Inbound::GetState);
        if needs_user && self.user_id.is_none() {
            return;
        }

        match msg {
            Inbound::Join { username, avatar } => self.handle_join(username, avatar).await,
            Inbound::Play { .. } => self.handle_play(now).await,
            Inbound::Pause { time } => self.handle_pause(time, now).await,
            Inbound::Seek { time } => self.handle_seek(time, now).await,
            Inbound::SeekReady { seek_epoch } => self.handle_seek_ready(seek_epoch, now).await,
            Inbound::BufferStart => self.handle_buffer_start(now).await,
            Inbound::BufferEnd => self.handle_buffer_end(now).await,
            Inbound::Chat { message, reply_to } => self.handle_chat(message, reply_to).await,
            Inbound::Typing => self.handle_typing().await,
            Inbound::VideoChange {
                url,
                title,
                user_agent,
                referer,
                subtitle_url,
            } => {
                self.handle_video_change(url, title, user_agent, referer, subtitle_url)
                    .await
            }
            Inbound::Ping {
                current_time,
                ping_id,
                syncing,
            } => self.handle_ping(current_time, ping_id, syncing, now).await,
            Inbound::GetState => self.handle_get_state(now).await,
        }
    }

    // ─────────────────────────────────────────────────────────────────────
    // Handlers
    // ─────────────────────────────────────────────────────────────────────

    async fn handle_join(&mut self, username: Option<String>, avatar: Option<String>) {
        if self.user_id.is_some() {
            return;
        }

        let username = username
            .map(|u| u.trim().to_string())
            .filter(|u| !u.is_empty())
            .unwrap_or_else(|| default_username(&self.room_id));
        let avatar = avatar.filter(|a| !a.is_empty()).unwrap_or_else(|| "🎬".into());

        let outcome = self.state.engine.join(
            &self.room_id,
            self.conn.clone(),
            username.clone(),
            avatar.clone(),
        );
        self.user_id = Some(outcome.user_id.clone());
        self.username = username.clone();

        if let Some(mut snapshot) = self
            .state
            .engine
            .get_room_state(&self.room_id, self.state.engine.now())
        {
            snapshot.proxy_url = self.state.client_proxy_url();
            self.send_direct(&Outbound::RoomState(snapshot)).await;
        }

        self.state
            .engine
            .broadcast_to_room(
                &self.room_id,
                &Outbound::UserJoined {
                    username,
                    avatar,
                    user_id: outcome.user_id.clone(),
                    users: outcome.users,
                },
                Some(&outcome.user_id),
            )
            .await;
    }

    async fn handle_play(&self, now: f64) {
        let Some(current_time) = self.state.engine.manual_play(&self.room_id, now) else {
            return;
        };
        self.state
            .engine
            .broadcast_to_room(
                &self.room_id,
                &Outbound::sync(true, current_time, false)
                    .triggered_by(format!("{} (Play)", self.username)),
                None,
            )
            .await;
    }

    async fn handle_pause(&self, time: Option<f64>, now: f64) {
        match self.state.engine.pause_request(&self.room_id, time, now) {
            PauseOutcome::Paused { current_time } => {
                self.state
                    .engine
                    .broadcast_to_room(
                        &self.room_id,
                        &Outbound::sync(false, current_time, true)
                            .triggered_by(self.username.clone()),
                        None,
                    )
                    .await;
            }
            PauseOutcome::SeekViaPause(start) => {
                self.state.engine.arm_barrier_timeout(&self.room_id, &start);
                let message = if start.completed_immediately {
                    Outbound::sync(start.was_playing, start.target_time, true)
                } else {
                    Outbound::seek_sync(start.target_time, start.epoch)
                };
                self.state
                    .engine
                    .broadcast_to_room(
                        &self.room_id,
                        &message.triggered_by(format!("{} (Seek via Pause)", self.username)),
                        None,
                    )
                    .await;
            }
            PauseOutcome::Rejected => {}
        }
    }

    async fn handle_seek(&self, time: f64, now: f64) {
        let user_id = self.user_id.as_deref().unwrap_or_default();
        match self.state.engine.seek(&self.room_id, user_id, time, now) {
            SeekOutcome::Started(start) => {
                let message = if start.completed_immediately {
                    Outbound::sync(start.was_playing, start.target_time, true)
                } else {
                    Outbound::seek_sync(start.target_time, start.epoch)
                };
                self.state
                    .engine
                    .broadcast_to_room(
                        &self.room_id,
                        &message.triggered_by(format!("{} (Seek Sync)", self.username)),
                        None,
                    )
                    .await;
            }
            SeekOutcome::Deduped | SeekOutcome::NoRoom => {}
        }
    }

    async fn handle_seek_ready(&self, epoch: u64, now: f64) {
        if epoch == 0 {
            return;
        }
        let user_id = self.user_id.as_deref().unwrap_or_default();
        let Some(resume) = self
            .state
            .engine
            .mark_barrier_ready(&self.room_id, user_id, epoch, now)
        else {
            return;
        };
        if resume.should_resume {
            self.state
                .engine
                .broadcast_to_room(
                    &self.room_id,
                    &Outbound::sync(true, resume.current_time, true)
                        .triggered_by("System (Seek Sync Complete)"),
                    None,
                )
                .await;
        }
    }

    async fn handle_buffer_start(&self, now: f64) {
        let user_id = self.user_id.as_deref().unwrap_or_default();
        self.state
            .engine
            .buffer_start_and_schedule(&self.room_id, user_id, now);
    }

    async fn handle_buffer_end(&self, now: f64) {
        let user_id = self.user_id.as_deref().unwrap_or_default();
        let Some(current_time) = self
            .state
            .engine
            .buffer_end_and_check_resume(&self.room_id, user_id, now)
        else {
            return;
        };
        self.state
            .engine
            .broadcast_to_room(
                &self.room_id,
                &Outbound::sync(true, current_time, false)
                    .triggered_by("System (Auto Resume)"),
                None,
            )
            .await;
    }

    async fn handle_chat(&self, message: String, reply_to: Option<ReplyTo>) {
        let message = message.trim().to_string();
        if message.is_empty() {
            return;
        }
        let user_id = self.user_id.as_deref().unwrap_or_default();
        let Some(chat) = self
            .state
            .engine
            .add_chat_message(&self.room_id, user_id, message, reply_to)
        else {
            return;
        };
        self.state
            .engine
            .broadcast_to_room(
                &self.room_id,
                &Outbound::Chat {
                    username: chat.username,
                    avatar: chat.avatar,
                    message: chat.message,
                    timestamp: chat.timestamp,
                    reply_to: chat.reply_to,
                },
                None,
            )
            .await;
    }

    async fn handle_typing(&self) {
        let user_id = self.user_id.as_deref().unwrap_or_default();
        self.state
            .engine
            .broadcast_to_room(
                &self.room_id,
                &Outbound::Typing {
                    username: self.username.clone(),
                },
                Some(user_id),
            )
            .await;
    }

    /// Resolution can take tens of seconds; run it in a background task so
    /// this connection keeps processing frames meanwhile.
    async fn handle_video_change(
        &self,
        url: String,
        title: Option<String>,
        user_agent: Option<String>,
        referer: Option<String>,
        subtitle_url: Option<String>,
    ) {
        let url = url.trim().to_string();
        if url.is_empty() {
            self.send_error("Video URL is required").await;
            return;
        }

        let state = self.state.clone();
        let room_id = self.room_id.clone();
        let username = self.username.clone();
        let conn = self.conn.clone();

        tokio::spawn(async move {
            let info = state.resolver.resolve(&url).await;

            let mut stream_url = url.clone();
            let mut format = VideoFormat::infer_from_url(&url);
            let mut duration = 0.0;
            let mut thumbnail = None;
            let mut resolved_title = None;
            let mut user_agent = user_agent.unwrap_or_default();
            let mut referer = referer.unwrap_or_default();

            if let Some(info) = info {
                stream_url = info.stream_url;
                format = info.format;
                duration = info.duration;
                thumbnail = info.thumbnail;
                resolved_title = info.title;
                if let Some(ua) = info.user_agent {
                    user_agent = ua;
                }
                if let Some(r) = info.referer {
                    referer = r;
                }
            }

            let title = title
                .map(|t| t.trim().to_string())
                .filter(|t| !t.is_empty())
                .or(resolved_title)
                .unwrap_or_else(|| "Video".to_string());
            let subtitle_url = subtitle_url.unwrap_or_default();

            let availability_check = state.config.read().availability_check;
            if availability_check
                && !check_stream_available(&state.http_client, &stream_url, &user_agent, &referer)
                    .await
            {
                let frame = Outbound::Error {
                    message: "Stream URL is unreachable".into(),
                };
                if let Some(payload) = frame.to_json() {
                    let _ = tokio::time::timeout(
                        Duration::from_secs_f64(SEND_TIMEOUT_SECS),
                        conn.send_text(&payload),
                    )
                    .await;
                }
                return;
            }

            let update = VideoUpdate {
                url: stream_url.clone(),
                title: title.clone(),
                format,
                duration,
                user_agent: user_agent.clone(),
                referer: referer.clone(),
                subtitle_url: subtitle_url.clone(),
            };
            if !state
                .engine
                .update_video(&room_id, update, state.engine.now())
            {
                return;
            }

            state
                .engine
                .broadcast_to_room(
                    &room_id,
                    &Outbound::VideoChanged {
                        url: stream_url,
                        title,
                        format,
                        duration,
                        user_agent,
                        referer,
                        subtitle_url,
                        thumbnail,
                        changed_by: username,
                    },
                    None,
                )
                .await;
        });
    }

    async fn handle_ping(
        &self,
        current_time: Option<f64>,
        ping_id: Option<Value>,
        syncing: Option<bool>,
        now: f64,
    ) {
        self.send_direct(&Outbound::Pong { ping_id }).await;

        let Some(user_id) = self.user_id.as_deref() else {
            return;
        };
        let client_time = current_time.unwrap_or(0.0);
        let syncing = syncing == Some(true);

        let correction =
            self.state
                .engine
                .handle_heartbeat(&self.room_id, user_id, client_time, syncing, now);
        match correction {
            Some(Correction::Hard { current_time }) => {
                self.state
                    .engine
                    .send_to_user(
                        &self.room_id,
                        user_id,
                        &Outbound::sync(true, current_time, true)
                            .triggered_by("System (Heartbeat Sync)"),
                    )
                    .await;
            }
            Some(Correction::Rate { rate }) => {
                self.state
                    .engine
                    .send_to_user(&self.room_id, user_id, &Outbound::SyncCorrection { rate })
                    .await;
            }
            None => {}
        }
    }

    async fn handle_get_state(&self, now: f64) {
        let Some(mut snapshot) = self.state.engine.get_room_state(&self.room_id, now) else {
            return;
        };
        snapshot.proxy_url = self.state.client_proxy_url();
        self.send_direct(&Outbound::RoomState(snapshot)).await;
    }

    /// Connection teardown: detach the user and announce the departure.
    async fn handle_disconnect(&mut self) {
        let Some(user_id) = self.user_id.take() else {
            return;
        };
        let now = self.state.engine.now();
        let Some(outcome) = self.state.engine.leave(&self.room_id, &user_id, now) else {
            return;
        };
        if outcome.room_destroyed {
            return;
        }

        self.state
            .engine
            .broadcast_to_room(
                &self.room_id,
                &Outbound::UserLeft {
                    username: outcome.username,
                    user_id: outcome.user_id,
                    users: outcome.users,
                },
                None,
            )
            .await;

        if let Some(resume) = outcome.barrier_resume {
            if resume.should_resume {
                self.state
                    .engine
                    .broadcast_to_room(
                        &self.room_id,
                        &Outbound::sync(true, resume.current_time, true)
                            .triggered_by("System (Seek Sync Complete)"),
                        None,
                    )
                    .await;
            }
        }
    }
}

/// Fallback display name for clients that join without one.
fn default_username(room_id: &str) -> String {
    let prefix: String = room_id.chars().take(4).collect();
    format!("Guest-{}", prefix)
}
