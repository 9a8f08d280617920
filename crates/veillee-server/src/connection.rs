//! WebSocket connection management.
//!
//! Each accepted connection runs three cooperative tasks sharing one
//! handle: the reader (this handler task) decodes inbound frames and
//! feeds the router, a writer drains the member's bounded queue into the
//! sink -- the only place bytes are written, so concurrent senders can
//! never interleave frames -- and a heartbeat monitor evaluates liveness
//! every ping interval. Termination is one-way and idempotent: whichever
//! task finishes first tears the connection down and detaches the member,
//! after which the registry's empty-grace timer owns the room's fate.

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use chrono::Utc;
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, info};
use uuid::Uuid;

use veillee_shared::constants::{MAX_FRAME_SIZE, WRITE_QUEUE_DEPTH};
use veillee_shared::protocol::{ClientFrame, ServerFrame};
use veillee_shared::validate_room_id;

use crate::api::{extract_title_id, AppState};
use crate::auth::Identity;
use crate::registry::{MemberHandle, RoomOptions};
use crate::router::{self, Outcome, RouteContext};

#[derive(Debug, Deserialize)]
pub struct WsQuery {
    #[serde(rename = "roomId")]
    room_id: Option<String>,
    token: Option<String>,
}

/// `GET /ws?roomId=..&token=..` upgrade handler. Missing or invalid
/// inputs are rejected before the upgrade with a bare status code; the
/// client sees its connection close without a payload and cannot tell
/// which check failed.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(query): Query<WsQuery>,
    State(state): State<AppState>,
) -> Response {
    let Some(room_id) = query.room_id else {
        return StatusCode::BAD_REQUEST.into_response();
    };
    if validate_room_id(&room_id).is_err() {
        return StatusCode::BAD_REQUEST.into_response();
    }
    let Some(token) = query.token else {
        return StatusCode::UNAUTHORIZED.into_response();
    };
    let identity = match state.verifier.verify(&token) {
        Ok(identity) => identity,
        Err(_) => {
            debug!(room = %room_id, "Rejected WebSocket upgrade: bad token");
            return StatusCode::UNAUTHORIZED.into_response();
        }
    };

    ws.max_message_size(MAX_FRAME_SIZE)
        .on_upgrade(move |socket| handle_socket(socket, room_id, identity, state))
}

async fn handle_socket(socket: WebSocket, room_id: String, identity: Identity, state: AppState) {
    let (sink, mut stream) = socket.split();
    let (tx, rx) = mpsc::channel::<Message>(WRITE_QUEUE_DEPTH);

    // A room unknown locally may still exist in the shared mirror
    // (created by a sibling instance, or before a restart); hydrate
    // creation options from there so `encryption_required` survives.
    let opts = resolve_room_options(&state, &room_id).await;

    let member = MemberHandle::new(&identity, tx.clone());
    let connection_id = member.connection_id;
    let snapshot = state.registry.attach(&room_id, member, opts).await;

    info!(room = %room_id, peer = %identity.user_id, "Connection attached");

    let ctx = RouteContext {
        identity: identity.clone(),
        encryption_required: snapshot.encryption_required,
    };
    let liveness = Arc::new(Liveness::new(Utc::now().timestamp_millis()));

    let mut writer = tokio::spawn(write_loop(sink, rx));
    let mut heartbeat = tokio::spawn(heartbeat_loop(
        tx.clone(),
        liveness.clone(),
        state.config.ping_interval,
        state.config.activity_timeout,
    ));

    loop {
        tokio::select! {
            inbound = stream.next() => {
                match inbound {
                    Some(Ok(message)) => {
                        liveness.touch(Utc::now().timestamp_millis());
                        if let Message::Close(_) = message {
                            break;
                        }
                        handle_message(message, &ctx, &room_id, connection_id, &tx, &state).await;
                    }
                    Some(Err(e)) => {
                        debug!(room = %room_id, error = %e, "WebSocket read error");
                        break;
                    }
                    None => break,
                }
            }
            _ = &mut heartbeat => {
                debug!(room = %room_id, peer = %identity.user_id, "Liveness failed, force-closing");
                break;
            }
            _ = &mut writer => break,
        }
    }

    // Idempotent teardown: abort the helpers, drop the socket halves, and
    // let the registry arm the empty-grace timer if the room emptied.
    heartbeat.abort();
    writer.abort();
    state.registry.detach(&room_id, connection_id).await;
    info!(room = %room_id, peer = %identity.user_id, "Connection detached");
}

async fn resolve_room_options(state: &AppState, room_id: &str) -> RoomOptions {
    if state.registry.lookup(room_id).await.is_some() {
        return RoomOptions::default();
    }
    let Some(mirror) = &state.mirror else {
        return RoomOptions::default();
    };
    match mirror.fetch(room_id).await {
        Some(room) => RoomOptions {
            encryption_required: Some(room.encryption_required),
            video_url: room.video_url,
            title_id: room.title_id,
            initial_time: room.initial_time,
        },
        None => RoomOptions::default(),
    }
}

// ---------------------------------------------------------------------------
// Reader
// ---------------------------------------------------------------------------

async fn handle_message(
    message: Message,
    ctx: &RouteContext,
    room_id: &str,
    connection_id: Uuid,
    tx: &mpsc::Sender<Message>,
    state: &AppState,
) {
    match message {
        Message::Text(text) => {
            let Ok(frame) = serde_json::from_str::<ClientFrame>(text.as_str()) else {
                debug!(room = %room_id, "Dropping malformed frame");
                return;
            };
            dispatch(frame, ctx, room_id, connection_id, tx, state).await;
        }
        // Protocol-level ping/pong only count as activity; the caller has
        // already refreshed liveness.
        Message::Ping(_) | Message::Pong(_) => {}
        Message::Binary(_) => {
            debug!(room = %room_id, "Ignoring binary frame");
        }
        Message::Close(_) => {}
    }
}

async fn dispatch(
    frame: ClientFrame,
    ctx: &RouteContext,
    room_id: &str,
    connection_id: Uuid,
    tx: &mpsc::Sender<Message>,
    state: &AppState,
) {
    let now_ms = Utc::now().timestamp_millis();
    match router::route(frame, ctx, now_ms) {
        Outcome::Reply(frame) => send_frame(tx, &frame),
        Outcome::Broadcast { frame, echo } => {
            state
                .registry
                .broadcast(room_id, connection_id, &frame, echo)
                .await;
        }
        Outcome::BroadcastVideoState { frame, url, time } => {
            let title_id = url.as_deref().and_then(extract_title_id);
            state
                .registry
                .apply_video_state(room_id, url.as_deref(), time, title_id.as_deref())
                .await;
            // Mirror writes are fire-and-forget: their latency or failure
            // must never delay the broadcast.
            if let Some(mirror) = state.mirror.clone() {
                let room_id = room_id.to_string();
                tokio::spawn(async move {
                    mirror
                        .put_video_state(&room_id, url.as_deref(), time, title_id.as_deref())
                        .await;
                });
            }
            state
                .registry
                .broadcast(room_id, connection_id, &frame, false)
                .await;
        }
        Outcome::Discard => {}
    }
}

fn send_frame(tx: &mpsc::Sender<Message>, frame: &ServerFrame) {
    if let Ok(text) = serde_json::to_string(frame) {
        let _ = tx.try_send(Message::Text(text.into()));
    }
}

// ---------------------------------------------------------------------------
// Writer
// ---------------------------------------------------------------------------

async fn write_loop(mut sink: SplitSink<WebSocket, Message>, mut rx: mpsc::Receiver<Message>) {
    while let Some(message) = rx.recv().await {
        if sink.send(message).await.is_err() {
            break;
        }
    }
}

// ---------------------------------------------------------------------------
// Heartbeat
// ---------------------------------------------------------------------------

/// Liveness state shared between the reader and the heartbeat monitor.
struct Liveness {
    last_activity_ms: AtomicI64,
    awaiting_pong: AtomicBool,
}

impl Liveness {
    fn new(now_ms: i64) -> Self {
        Self {
            last_activity_ms: AtomicI64::new(now_ms),
            awaiting_pong: AtomicBool::new(false),
        }
    }

    /// Any inbound traffic -- protocol pong, JSON pong, or a regular
    /// frame -- counts as liveness and settles an outstanding ping.
    fn touch(&self, now_ms: i64) {
        self.last_activity_ms.store(now_ms, Ordering::Relaxed);
        self.awaiting_pong.store(false, Ordering::Relaxed);
    }
}

#[derive(Debug, PartialEq, Eq)]
enum HeartbeatVerdict {
    /// No inbound activity inside the activity window; terminate.
    Idle,
    /// The previous ping went a full interval without an answer; terminate.
    Unanswered,
    /// Healthy; send the next ping.
    Ping,
}

fn heartbeat_verdict(
    liveness: &Liveness,
    now_ms: i64,
    activity_timeout: Duration,
) -> HeartbeatVerdict {
    let idle_ms = now_ms - liveness.last_activity_ms.load(Ordering::Relaxed);
    if idle_ms > activity_timeout.as_millis() as i64 {
        return HeartbeatVerdict::Idle;
    }
    if liveness.awaiting_pong.load(Ordering::Relaxed) {
        return HeartbeatVerdict::Unanswered;
    }
    HeartbeatVerdict::Ping
}

/// Returns when the connection must be force-closed. Each tick emits both
/// a protocol ping and a JSON `{type:"ping"}` -- proxies that eat one
/// usually pass the other, and either answer satisfies liveness.
async fn heartbeat_loop(
    tx: mpsc::Sender<Message>,
    liveness: Arc<Liveness>,
    ping_interval: Duration,
    activity_timeout: Duration,
) {
    let mut ticker = tokio::time::interval(ping_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The first tick fires immediately; the connection just proved itself.
    ticker.tick().await;

    loop {
        ticker.tick().await;
        let now_ms = Utc::now().timestamp_millis();
        match heartbeat_verdict(&liveness, now_ms, activity_timeout) {
            HeartbeatVerdict::Idle => {
                debug!("Activity window exceeded");
                return;
            }
            HeartbeatVerdict::Unanswered => {
                debug!("Liveness ping unanswered");
                return;
            }
            HeartbeatVerdict::Ping => {
                liveness.awaiting_pong.store(true, Ordering::Relaxed);
                let _ = tx.try_send(Message::Ping(Bytes::new()));
                send_frame(&tx, &ServerFrame::Ping { ts: now_ms });
            }
        }
    }
}
