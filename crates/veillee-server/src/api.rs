//! HTTP control plane.
//!
//! Three request/response operations next to the WebSocket endpoint:
//! create a room, preflight a join, and preview a room's metadata --
//! plus a liveness probe. Preflight and preview are read-only: calling
//! them never attaches anyone and never creates a room.

use std::sync::Arc;
use std::time::Instant;

use axum::extract::{Path, State};
use axum::http::header::AUTHORIZATION;
use axum::http::{HeaderMap, HeaderValue, Method};
use axum::routing::{get, post};
use axum::{Json, Router};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

use veillee_shared::constants::ROOM_ID_RANDOM_BYTES;
use veillee_shared::validate_room_id;

use crate::auth::{Identity, TokenVerifier};
use crate::config::ServerConfig;
use crate::connection;
use crate::error::ApiError;
use crate::mirror::{MirroredRoom, RoomMirror};
use crate::registry::{RoomOptions, RoomRegistry};

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ServerConfig>,
    pub verifier: Arc<TokenVerifier>,
    pub registry: RoomRegistry,
    pub mirror: Option<RoomMirror>,
    pub started_at: Instant,
}

pub fn build_router(state: AppState) -> Router {
    let cors = cors_layer(&state.config);

    Router::new()
        .route("/ws", get(connection::ws_handler))
        .route("/rooms", post(create_room))
        .route("/rooms/{id}/join", post(join_preflight))
        .route("/rooms/{id}/preview", get(preview_room))
        .route("/health", get(health_check))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Without configured origins, development allows everything and
/// production allows nothing -- a prod deployment must name its fronts.
fn cors_layer(config: &ServerConfig) -> CorsLayer {
    let methods = [Method::GET, Method::POST, Method::OPTIONS];

    if config.cors_origins.is_empty() {
        if config.production {
            return CorsLayer::new();
        }
        return CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(methods)
            .allow_headers(Any);
    }

    let origins: Vec<HeaderValue> = config
        .cors_origins
        .iter()
        .filter_map(|origin| origin.parse().ok())
        .collect();
    CorsLayer::new()
        .allow_origin(origins)
        .allow_methods(methods)
        .allow_headers(Any)
}

// ---------------------------------------------------------------------------
// Request/response bodies
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateRoomRequest {
    encryption_required: Option<bool>,
    video_url: Option<String>,
    video_time: Option<f64>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct UserInfo {
    id: String,
    name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    picture: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RoomResponse {
    room_id: String,
    encryption_required: bool,
    video_url: Option<String>,
    title_id: Option<String>,
    initial_time: Option<f64>,
    user: UserInfo,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    uptime_secs: u64,
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

async fn create_room(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Option<Json<CreateRoomRequest>>,
) -> Result<Json<RoomResponse>, ApiError> {
    let identity = authenticate(&headers, &state)?;
    let req = body.map(|Json(body)| body).unwrap_or_default();

    let title_id = req.video_url.as_deref().and_then(extract_title_id);
    let room_id = generate_room_id();
    let opts = RoomOptions {
        encryption_required: req.encryption_required,
        video_url: req.video_url,
        title_id,
        initial_time: req.video_time,
    };

    let snapshot = state.registry.ensure(&room_id, opts).await;

    if let Some(mirror) = &state.mirror {
        mirror
            .put_room(
                &room_id,
                &MirroredRoom {
                    encryption_required: snapshot.encryption_required,
                    video_url: snapshot.video_url.clone(),
                    title_id: snapshot.title_id.clone(),
                    initial_time: snapshot.initial_time,
                },
            )
            .await;
    }

    info!(
        room = %room_id,
        peer = %identity.user_id,
        encrypted = snapshot.encryption_required,
        "Room created"
    );

    Ok(Json(RoomResponse {
        room_id: snapshot.room_id,
        encryption_required: snapshot.encryption_required,
        video_url: snapshot.video_url,
        title_id: snapshot.title_id,
        initial_time: snapshot.initial_time,
        user: user_info(identity),
    }))
}

/// `POST /rooms/{id}/join` -- confirm a room still exists before opening
/// the streaming connection. Not a state transition.
async fn join_preflight(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(room_id): Path<String>,
) -> Result<Json<RoomResponse>, ApiError> {
    let identity = authenticate(&headers, &state)?;
    lookup_room(&state, &room_id, identity).await.map(Json)
}

/// `GET /rooms/{id}/preview` -- same shape as preflight, for rendering a
/// "join this room?" prompt without implying membership.
async fn preview_room(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(room_id): Path<String>,
) -> Result<Json<RoomResponse>, ApiError> {
    let identity = authenticate(&headers, &state)?;
    lookup_room(&state, &room_id, identity).await.map(Json)
}

async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        uptime_secs: state.started_at.elapsed().as_secs(),
    })
}

async fn lookup_room(
    state: &AppState,
    room_id: &str,
    identity: Identity,
) -> Result<RoomResponse, ApiError> {
    validate_room_id(room_id)?;

    if let Some(snapshot) = state.registry.lookup(room_id).await {
        return Ok(RoomResponse {
            room_id: snapshot.room_id,
            encryption_required: snapshot.encryption_required,
            video_url: snapshot.video_url,
            title_id: snapshot.title_id,
            initial_time: snapshot.initial_time,
            user: user_info(identity),
        });
    }

    // Another instance may own the room; answer from the mirror without
    // creating anything locally.
    if let Some(mirror) = &state.mirror {
        if let Some(room) = mirror.fetch(room_id).await {
            return Ok(RoomResponse {
                room_id: room_id.to_string(),
                encryption_required: room.encryption_required,
                video_url: room.video_url,
                title_id: room.title_id,
                initial_time: room.initial_time,
                user: user_info(identity),
            });
        }
    }

    Err(ApiError::RoomNotFound(room_id.to_string()))
}

fn user_info(identity: Identity) -> UserInfo {
    UserInfo {
        id: identity.user_id,
        name: identity.name,
        picture: identity.picture,
    }
}

fn authenticate(headers: &HeaderMap, state: &AppState) -> Result<Identity, ApiError> {
    let token = bearer_token(headers).ok_or(ApiError::AuthRequired)?;
    Ok(state.verifier.verify(token)?)
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
}

/// Random 8-character id from the URL-safe base64 alphabet, a subset of
/// the accepted room-id charset.
fn generate_room_id() -> String {
    let mut bytes = [0u8; ROOM_ID_RANDOM_BYTES];
    rand::thread_rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Pull the title id out of a player URL by path-segment match, e.g.
/// `https://www.example.com/watch/81234567?trackId=1` -> `81234567`.
/// Absence is not an error; not every player URL carries one.
pub(crate) fn extract_title_id(url: &str) -> Option<String> {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    let mut segments = path.split('/').filter(|s| !s.is_empty());
    while let Some(segment) = segments.next() {
        if segment == "watch" {
            return segments
                .next()
                .map(str::to_string)
                .filter(|s| !s.is_empty());
        }
    }
    None
}

pub async fn serve(state: AppState, addr: std::net::SocketAddr) -> anyhow::Result<()> {
    let app = build_router(state);

    info!(addr = %addr, "Starting HTTP server");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_room_ids_are_valid() {
        for _ in 0..100 {
            let id = generate_room_id();
            assert_eq!(id.len(), 8);
            assert!(validate_room_id(&id).is_ok());
        }
    }

    #[test]
    fn extracts_title_id_from_watch_urls() {
        assert_eq!(
            extract_title_id("https://www.example.com/watch/81234567"),
            Some("81234567".to_string())
        );
        assert_eq!(
            extract_title_id("https://www.example.com/watch/81234567?trackId=1&tctx=2"),
            Some("81234567".to_string())
        );
        assert_eq!(
            extract_title_id("https://www.example.com/watch/81234567#t=12"),
            Some("81234567".to_string())
        );
    }

    #[test]
    fn urls_without_a_title_yield_none() {
        assert_eq!(extract_title_id("https://www.example.com/browse"), None);
        assert_eq!(extract_title_id("https://www.example.com/watch/"), None);
        assert_eq!(extract_title_id("not a url"), None);
    }

    #[test]
    fn bearer_extraction_requires_the_scheme() {
        let mut headers = HeaderMap::new();
        assert_eq!(bearer_token(&headers), None);

        headers.insert(AUTHORIZATION, "Bearer abc.def.ghi".parse().unwrap());
        assert_eq!(bearer_token(&headers), Some("abc.def.ghi"));

        headers.insert(AUTHORIZATION, "Basic abc".parse().unwrap());
        assert_eq!(bearer_token(&headers), None);
    }
}
