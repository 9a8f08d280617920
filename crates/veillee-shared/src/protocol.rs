//! JSON wire frames exchanged over a room's WebSocket connections.
//!
//! Frames are heterogeneous objects tagged by a `type` field. Inbound
//! frames ([`ClientFrame`]) never carry trusted identity: the hub stamps
//! `from`/`fromId` from the verified session, so outbound envelopes
//! ([`ServerFrame`]) cannot be spoofed. The `encrypted` and `key-exchange`
//! frames are the E2EE substrate -- the hub relays their payload fields
//! untouched and never stores them.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Inbound frames
// ---------------------------------------------------------------------------

/// A frame received from a client. Unknown `type` tags fail to parse and
/// are dropped by the reader.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ClientFrame {
    Ping {
        #[serde(default, deserialize_with = "lenient_millis")]
        ts: Option<i64>,
    },
    Pong {
        #[serde(default, deserialize_with = "lenient_millis")]
        ts: Option<i64>,
    },
    KeyExchange {
        #[serde(rename = "publicKey")]
        public_key: String,
        curve: Option<String>,
    },
    Encrypted {
        ciphertext: String,
        iv: String,
        tag: Option<String>,
        salt: Option<String>,
        alg: Option<String>,
        #[serde(rename = "recipientId")]
        recipient_id: Option<String>,
        #[serde(default, deserialize_with = "lenient_millis")]
        ts: Option<i64>,
    },
    System {
        text: String,
        url: Option<String>,
        #[serde(default, deserialize_with = "lenient_millis")]
        ts: Option<i64>,
    },
    EpisodeChanged {
        url: String,
        seq: Option<u64>,
        title: Option<String>,
        #[serde(default, deserialize_with = "lenient_millis")]
        ts: Option<i64>,
    },
    SyncRequest {
        #[serde(default, deserialize_with = "lenient_millis")]
        ts: Option<i64>,
    },
    SyncState {
        time: f64,
        paused: bool,
        url: Option<String>,
        #[serde(default, deserialize_with = "lenient_millis")]
        ts: Option<i64>,
    },
    State {
        payload: serde_json::Value,
    },
    Chat {
        text: String,
        #[serde(default, deserialize_with = "lenient_millis")]
        ts: Option<i64>,
    },
    Typing {
        active: bool,
        #[serde(default, deserialize_with = "lenient_millis")]
        ts: Option<i64>,
    },
}

// ---------------------------------------------------------------------------
// Outbound frames
// ---------------------------------------------------------------------------

/// One member of a room as advertised in a `presence` envelope. The same
/// user appears once per live connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Participant {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub picture: Option<String>,
}

/// A frame produced by the hub. Where an envelope attributes a sender,
/// `from`/`fromId` come from the verified session token.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ServerFrame {
    Ping {
        ts: i64,
    },
    Pong {
        ts: i64,
    },
    KeyExchange {
        #[serde(rename = "publicKey")]
        public_key: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        curve: Option<String>,
        from: String,
        #[serde(rename = "fromId")]
        from_id: String,
    },
    Encrypted {
        ciphertext: String,
        iv: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        tag: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        salt: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        alg: Option<String>,
        from: String,
        #[serde(rename = "fromId")]
        from_id: String,
        ts: i64,
        #[serde(
            rename = "recipientId",
            default,
            skip_serializing_if = "Option::is_none"
        )]
        recipient_id: Option<String>,
    },
    System {
        text: String,
        ts: i64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        url: Option<String>,
    },
    EpisodeChanged {
        url: String,
        ts: i64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        seq: Option<u64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        title: Option<String>,
        from: String,
        #[serde(rename = "fromId")]
        from_id: String,
    },
    SyncRequest {
        from: String,
        #[serde(rename = "fromId")]
        from_id: String,
        ts: i64,
    },
    SyncState {
        time: f64,
        paused: bool,
        url: Option<String>,
        from: String,
        #[serde(rename = "fromId")]
        from_id: String,
        ts: i64,
    },
    State {
        payload: serde_json::Value,
    },
    Chat {
        text: String,
        from: String,
        #[serde(rename = "fromId")]
        from_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        avatar: Option<String>,
        ts: i64,
    },
    Typing {
        from: String,
        #[serde(rename = "fromId")]
        from_id: String,
        active: bool,
        ts: i64,
    },
    Presence {
        participants: Vec<Participant>,
        users: Vec<String>,
        avatars: BTreeMap<String, String>,
        #[serde(rename = "encryptionRequired")]
        encryption_required: bool,
    },
}

// ---------------------------------------------------------------------------
// Timestamp leniency
// ---------------------------------------------------------------------------

// Client timestamps are advisory. A missing or non-numeric `ts` must not
// reject the whole frame; it deserializes to `None` and the hub stamps
// server wall time instead.
fn lenient_millis<'de, D>(deserializer: D) -> Result<Option<i64>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(value.as_ref().and_then(millis_from_value))
}

fn millis_from_value(value: &serde_json::Value) -> Option<i64> {
    value
        .as_i64()
        .or_else(|| value.as_f64().map(|f| f as i64))
}
