//! HTTP route handlers.
//!
//! All handlers are thin; room state lives in the engine and the WebSocket
//! layer owns the sync protocol. This surface exists for room creation,
//! state inspection, health checks, and client configuration passthrough.

use axum::extract::{Path, State};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::json;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::api::ws::ws_handler;
use crate::api::AppState;
use crate::error::{MatineeError, MatineeResult};
use crate::protocol_constants::SERVICE_ID;
use crate::utils::{generate_room_token, is_valid_room_token};

/// Builds the application router.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/rooms", post(create_room))
        .route("/api/rooms/{room_id}", get(room_state))
        .route("/api/client-config", get(client_config))
        .route("/ws/watch_party/{room_id}", get(ws_handler))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Liveness probe.
async fn health() -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "service": SERVICE_ID,
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// Allocates an unused room token.
///
/// The room itself materializes on the first WebSocket join; this endpoint
/// only reserves an identifier clients can share.
async fn create_room(State(state): State<AppState>) -> MatineeResult<impl IntoResponse> {
    for _ in 0..16 {
        let room_id = generate_room_token();
        if !state.engine.room_exists(&room_id) {
            return Ok(Json(json!({
                "room_id": room_id,
                "ws_path": format!("/ws/watch_party/{}", room_id),
            })));
        }
    }
    // 32^8 tokens; colliding 16 times in a row means something is broken.
    Err(MatineeError::Internal(
        "could not allocate a room token".into(),
    ))
}

/// Live snapshot of one room.
async fn room_state(
    Path(room_id): Path<String>,
    State(state): State<AppState>,
) -> MatineeResult<impl IntoResponse> {
    let room_id = room_id.to_ascii_uppercase();
    if !is_valid_room_token(&room_id) {
        return Err(MatineeError::InvalidRequest("invalid room id".into()));
    }
    let mut snapshot = state
        .engine
        .get_room_state(&room_id, state.engine.now())
        .ok_or(MatineeError::RoomNotFound(room_id))?;
    snapshot.proxy_url = state.client_proxy_url();
    Ok(Json(snapshot))
}

/// Configuration values clients need to compose URLs and pick transports.
async fn client_config(State(state): State<AppState>) -> impl IntoResponse {
    let config = state.config.read();
    Json(json!({
        "proxy_enabled": config.proxy_enabled,
        "proxy_url": config.proxy_url,
        "ws_url": config.ws_url,
        "availability_check": config.availability_check,
        "production": config.production,
    }))
}
