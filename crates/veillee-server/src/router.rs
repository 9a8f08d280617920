//! Inbound message policy.
//!
//! Every decoded frame passes through [`route`]. The policy table is
//! strict: the E2EE substrate (`key-exchange`, `encrypted`) and control
//! metadata (`system`, `episode-changed`, `sync-*`) relay in any room,
//! while plaintext `chat`/`typing`/`state` only relay where encryption is
//! not required. Rejections are silent -- a misbehaving client learns
//! nothing from the absence of fan-out, and legitimate clients racing a
//! key exchange are not spooked by error frames.
//!
//! Outbound attribution (`from`/`fromId`, chat avatars) always comes from
//! the verified identity; whatever the inbound frame claimed was already
//! discarded during parsing.

use veillee_shared::protocol::{ClientFrame, ServerFrame};

use crate::auth::Identity;

/// Per-connection routing context, fixed at attach time.
#[derive(Debug, Clone)]
pub struct RouteContext {
    pub identity: Identity,
    pub encryption_required: bool,
}

/// What the hub does with one inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// Answer the sender directly, no fan-out.
    Reply(ServerFrame),
    /// Fan out to the room; `echo` includes the sender.
    Broadcast { frame: ServerFrame, echo: bool },
    /// Fan out and record the advertised video state -- `sync-state`
    /// carries a position, an episode switch only a new url.
    BroadcastVideoState {
        frame: ServerFrame,
        url: Option<String>,
        time: Option<f64>,
    },
    /// Drop silently.
    Discard,
}

fn relay(frame: ServerFrame) -> Outcome {
    Outcome::Broadcast { frame, echo: false }
}

fn blank(s: &str) -> bool {
    s.trim().is_empty()
}

/// Apply the policy table to one inbound frame. `now_ms` is server wall
/// time; it replaces any missing or non-numeric client timestamp.
pub fn route(frame: ClientFrame, ctx: &RouteContext, now_ms: i64) -> Outcome {
    let from = ctx.identity.name.clone();
    let from_id = ctx.identity.user_id.clone();

    match frame {
        ClientFrame::Ping { .. } => Outcome::Reply(ServerFrame::Pong { ts: now_ms }),

        ClientFrame::Pong { .. } => Outcome::Discard,

        ClientFrame::KeyExchange { public_key, curve } => {
            if blank(&public_key) {
                return Outcome::Discard;
            }
            relay(ServerFrame::KeyExchange {
                public_key,
                curve,
                from,
                from_id,
            })
        }

        ClientFrame::Encrypted {
            ciphertext,
            iv,
            tag,
            salt,
            alg,
            recipient_id,
            ts,
        } => {
            if blank(&ciphertext) || blank(&iv) {
                return Outcome::Discard;
            }
            // Opaque passthrough: the payload fields are not inspected,
            // and recipientId is not enforced -- only the named recipient
            // can decrypt anyway.
            relay(ServerFrame::Encrypted {
                ciphertext,
                iv,
                tag,
                salt,
                alg,
                from,
                from_id,
                ts: ts.unwrap_or(now_ms),
                recipient_id,
            })
        }

        ClientFrame::System { text, url, ts } => {
            if blank(&text) {
                return Outcome::Discard;
            }
            relay(ServerFrame::System {
                text,
                ts: ts.unwrap_or(now_ms),
                url,
            })
        }

        ClientFrame::EpisodeChanged {
            url,
            seq,
            title,
            ts,
        } => {
            if blank(&url) {
                return Outcome::Discard;
            }
            // An episode switch re-advertises the room's video url so
            // late joiners hydrate onto the new episode. `seq` is
            // forwarded verbatim; dedupe is a client concern.
            Outcome::BroadcastVideoState {
                frame: ServerFrame::EpisodeChanged {
                    url: url.clone(),
                    ts: ts.unwrap_or(now_ms),
                    seq,
                    title,
                    from,
                    from_id,
                },
                url: Some(url),
                time: None,
            }
        }

        ClientFrame::SyncRequest { ts } => relay(ServerFrame::SyncRequest {
            from,
            from_id,
            ts: ts.unwrap_or(now_ms),
        }),

        ClientFrame::SyncState {
            time,
            paused,
            url,
            ts,
        } => Outcome::BroadcastVideoState {
            frame: ServerFrame::SyncState {
                time,
                paused,
                url: url.clone(),
                from,
                from_id,
                ts: ts.unwrap_or(now_ms),
            },
            url,
            time: Some(time),
        },

        ClientFrame::State { payload } => {
            if ctx.encryption_required {
                return Outcome::Discard;
            }
            relay(ServerFrame::State { payload })
        }

        ClientFrame::Chat { text, ts } => {
            if ctx.encryption_required || blank(&text) {
                return Outcome::Discard;
            }
            // Chat echoes to the sender: the server echo is the delivery
            // confirmation.
            Outcome::Broadcast {
                frame: ServerFrame::Chat {
                    text,
                    from,
                    from_id,
                    avatar: ctx.identity.picture.clone(),
                    ts: ts.unwrap_or(now_ms),
                },
                echo: true,
            }
        }

        ClientFrame::Typing { active, ts } => {
            if ctx.encryption_required {
                return Outcome::Discard;
            }
            relay(ServerFrame::Typing {
                from,
                from_id,
                active,
                ts: ts.unwrap_or(now_ms),
            })
        }
    }
}
