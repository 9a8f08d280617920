//! Best-effort room-metadata mirror.
//!
//! When a cache endpoint is configured, room creation and advertised
//! playback state are written to a shared redis instance so that room
//! metadata survives a restart and is visible to sibling instances. The
//! mirror is never authoritative for live membership. Every round trip is
//! time-bounded; failures are logged and swallowed, and the hub falls
//! back to its in-memory registry.

use std::collections::HashMap;
use std::time::Duration;

use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use tracing::{debug, warn};

use veillee_shared::constants::CACHE_TIMEOUT_SECS;

/// Room metadata as stored in the mirror. Live membership is deliberately
/// absent -- only this instance knows who is connected to it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MirroredRoom {
    pub encryption_required: bool,
    pub video_url: Option<String>,
    pub title_id: Option<String>,
    pub initial_time: Option<f64>,
}

#[derive(Clone)]
pub struct RoomMirror {
    conn: MultiplexedConnection,
    timeout: Duration,
    ttl_secs: i64,
}

impl RoomMirror {
    /// Connect to the configured cache endpoint. Mirrored entries expire
    /// after `ttl` so that orphaned metadata cannot outlive a crashed
    /// instance forever.
    pub async fn connect(url: &str, ttl: Duration) -> anyhow::Result<Self> {
        let client = redis::Client::open(url)?;
        let conn = client.get_multiplexed_async_connection().await?;
        Ok(Self {
            conn,
            timeout: Duration::from_secs(CACHE_TIMEOUT_SECS),
            ttl_secs: ttl.as_secs().max(1) as i64,
        })
    }

    fn key(room_id: &str) -> String {
        format!("room:{room_id}")
    }

    /// Write a full room record. Called on explicit room creation.
    pub async fn put_room(&self, room_id: &str, room: &MirroredRoom) {
        let key = Self::key(room_id);
        let fields = to_fields(room);
        let ttl = self.ttl_secs;
        let mut conn = self.conn.clone();

        let op = async move {
            let _: () = conn.hset_multiple(&key, &fields).await?;
            let _: () = conn.expire(&key, ttl).await?;
            Ok::<(), redis::RedisError>(())
        };

        match tokio::time::timeout(self.timeout, op).await {
            Ok(Ok(())) => debug!(room = %room_id, "Mirrored room metadata"),
            Ok(Err(e)) => warn!(room = %room_id, error = %e, "Mirror write failed"),
            Err(_) => warn!(room = %room_id, "Mirror write timed out"),
        }
    }

    /// Opportunistically record the latest advertised video state
    /// (sync-state position or episode switch).
    pub async fn put_video_state(
        &self,
        room_id: &str,
        url: Option<&str>,
        time: Option<f64>,
        title_id: Option<&str>,
    ) {
        let key = Self::key(room_id);
        let ttl = self.ttl_secs;
        let mut fields: Vec<(String, String)> = Vec::new();
        if let Some(time) = time {
            fields.push(("initial_time".into(), time.to_string()));
        }
        if let Some(url) = url {
            fields.push(("video_url".into(), url.to_string()));
        }
        if let Some(title) = title_id {
            fields.push(("title_id".into(), title.to_string()));
        }
        if fields.is_empty() {
            return;
        }
        let mut conn = self.conn.clone();

        let op = async move {
            let _: () = conn.hset_multiple(&key, &fields).await?;
            let _: () = conn.expire(&key, ttl).await?;
            Ok::<(), redis::RedisError>(())
        };

        match tokio::time::timeout(self.timeout, op).await {
            Ok(Ok(())) => debug!(room = %room_id, "Mirrored playback state"),
            Ok(Err(e)) => debug!(room = %room_id, error = %e, "Playback mirror write failed"),
            Err(_) => debug!(room = %room_id, "Playback mirror write timed out"),
        }
    }

    /// Look a room up in the mirror. `None` on miss, error, or timeout --
    /// callers fall back to in-memory state either way.
    pub async fn fetch(&self, room_id: &str) -> Option<MirroredRoom> {
        let key = Self::key(room_id);
        let mut conn = self.conn.clone();

        let op = async move { conn.hgetall::<_, HashMap<String, String>>(&key).await };

        match tokio::time::timeout(self.timeout, op).await {
            Ok(Ok(map)) if !map.is_empty() => Some(from_fields(&map)),
            Ok(Ok(_)) => None,
            Ok(Err(e)) => {
                warn!(room = %room_id, error = %e, "Mirror read failed");
                None
            }
            Err(_) => {
                warn!(room = %room_id, "Mirror read timed out");
                None
            }
        }
    }

    /// Remove a room's mirrored metadata (fired on empty-grace deletion).
    pub async fn delete(&self, room_id: &str) {
        let key = Self::key(room_id);
        let mut conn = self.conn.clone();

        let op = async move { conn.del::<_, ()>(&key).await };

        match tokio::time::timeout(self.timeout, op).await {
            Ok(Ok(())) => debug!(room = %room_id, "Removed mirrored room"),
            Ok(Err(e)) => warn!(room = %room_id, error = %e, "Mirror delete failed"),
            Err(_) => warn!(room = %room_id, "Mirror delete timed out"),
        }
    }
}

fn to_fields(room: &MirroredRoom) -> Vec<(String, String)> {
    let mut fields = vec![(
        "encryption_required".to_string(),
        if room.encryption_required { "1" } else { "0" }.to_string(),
    )];
    if let Some(url) = &room.video_url {
        fields.push(("video_url".into(), url.clone()));
    }
    if let Some(title) = &room.title_id {
        fields.push(("title_id".into(), title.clone()));
    }
    if let Some(time) = room.initial_time {
        fields.push(("initial_time".into(), time.to_string()));
    }
    fields
}

fn from_fields(map: &HashMap<String, String>) -> MirroredRoom {
    MirroredRoom {
        encryption_required: map
            .get("encryption_required")
            .map(|v| v == "1" || v == "true")
            .unwrap_or(false),
        video_url: map.get("video_url").cloned(),
        title_id: map.get("title_id").cloned(),
        initial_time: map.get("initial_time").and_then(|v| v.parse().ok()),
    }
}
