//! Room registry and lifecycle.
//!
//! The registry is the single source of truth for rooms and membership.
//! Every mutation happens under one `RwLock`, so joins, leaves, presence
//! snapshots and deletion timers cannot interleave: a room with members
//! never has a pending deletion timer, and a room that just emptied has
//! exactly one.
//!
//! Fan-out **never decrypts or inspects** relayed payloads -- members get
//! the serialized envelope as-is through their bounded write queues.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::Message;
use chrono::{DateTime, Utc};
use tokio::sync::{broadcast, mpsc, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use veillee_shared::protocol::ServerFrame;

use crate::auth::Identity;
use crate::presence;

// ---------------------------------------------------------------------------
// Room records
// ---------------------------------------------------------------------------

/// Options applied when a room is created or re-advertised.
/// `encryption_required` is only honored at creation; the flag is
/// immutable for the room's lifetime.
#[derive(Debug, Clone, Default)]
pub struct RoomOptions {
    pub encryption_required: Option<bool>,
    pub video_url: Option<String>,
    pub title_id: Option<String>,
    pub initial_time: Option<f64>,
}

/// Advertised metadata snapshot of a room, safe to hand out without
/// holding the registry lock.
#[derive(Debug, Clone)]
pub struct RoomSnapshot {
    pub room_id: String,
    pub encryption_required: bool,
    pub video_url: Option<String>,
    pub title_id: Option<String>,
    pub initial_time: Option<f64>,
    #[allow(dead_code)]
    pub created_at: DateTime<Utc>,
    pub member_count: usize,
}

/// One live connection of one user, as seen by its room. A user with two
/// tabs open holds two handles.
#[derive(Debug, Clone)]
pub struct MemberHandle {
    pub connection_id: Uuid,
    pub user_id: String,
    pub name: String,
    pub picture: Option<String>,
    sender: mpsc::Sender<Message>,
}

impl MemberHandle {
    pub fn new(identity: &Identity, sender: mpsc::Sender<Message>) -> Self {
        Self {
            connection_id: Uuid::new_v4(),
            user_id: identity.user_id.clone(),
            name: identity.name.clone(),
            picture: identity.picture.clone(),
            sender,
        }
    }

    /// Queue a frame for this member. A full queue drops the frame -- a
    /// slow consumer must not stall the rest of the room.
    fn try_send(&self, message: Message) {
        if self.sender.try_send(message).is_err() {
            debug!(peer = %self.user_id, "Dropping frame for slow member");
        }
    }
}

struct Room {
    encryption_required: bool,
    video_url: Option<String>,
    title_id: Option<String>,
    initial_time: Option<f64>,
    created_at: DateTime<Utc>,
    members: HashMap<Uuid, MemberHandle>,
    /// Pending empty-grace deletion, present only while `members` is empty.
    deletion: Option<JoinHandle<()>>,
}

impl Room {
    fn new(encryption_required: bool) -> Self {
        Self {
            encryption_required,
            video_url: None,
            title_id: None,
            initial_time: None,
            created_at: Utc::now(),
            members: HashMap::new(),
            deletion: None,
        }
    }

    fn cancel_deletion(&mut self) {
        if let Some(handle) = self.deletion.take() {
            handle.abort();
        }
    }

    /// Overwrite advertised metadata with whatever the options carry.
    /// The encryption flag is ignored here on purpose.
    fn apply(&mut self, opts: &RoomOptions) {
        if let Some(url) = &opts.video_url {
            self.video_url = Some(url.clone());
        }
        if let Some(title) = &opts.title_id {
            self.title_id = Some(title.clone());
        }
        if let Some(time) = opts.initial_time {
            self.initial_time = Some(time);
        }
    }

    fn snapshot(&self, room_id: &str) -> RoomSnapshot {
        RoomSnapshot {
            room_id: room_id.to_string(),
            encryption_required: self.encryption_required,
            video_url: self.video_url.clone(),
            title_id: self.title_id.clone(),
            initial_time: self.initial_time,
            created_at: self.created_at,
            member_count: self.members.len(),
        }
    }

    /// Push the current roster to every member. Called inside the same
    /// critical section as the membership mutation, which is what keeps
    /// presence ordered with respect to joins and leaves.
    fn broadcast_presence(&self) {
        let frame = presence::envelope(self.members.values(), self.encryption_required);
        let Ok(text) = serde_json::to_string(&frame) else {
            return;
        };
        for member in self.members.values() {
            member.try_send(Message::Text(text.clone().into()));
        }
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Owns all room records. Thread-safe via `Arc<RwLock<..>>` interior --
/// callers obtain a handle with `clone()`.
#[derive(Clone)]
pub struct RoomRegistry {
    rooms: Arc<RwLock<HashMap<String, Room>>>,
    default_encryption_required: bool,
    empty_grace: Duration,
    deleted_tx: broadcast::Sender<String>,
}

impl RoomRegistry {
    pub fn new(default_encryption_required: bool, empty_grace: Duration) -> Self {
        let (deleted_tx, _) = broadcast::channel(64);
        Self {
            rooms: Arc::new(RwLock::new(HashMap::new())),
            default_encryption_required,
            empty_grace,
            deleted_tx,
        }
    }

    /// Subscribe to room-deleted notifications (fired when an empty-grace
    /// timer expires a room).
    pub fn deletions(&self) -> broadcast::Receiver<String> {
        self.deleted_tx.subscribe()
    }

    /// Return the room record for `room_id`, creating it when absent, and
    /// replace any pending deletion timer. A room left empty -- created
    /// but never connected to -- keeps a fresh grace timer so it cannot
    /// leak forever.
    pub async fn ensure(&self, room_id: &str, opts: RoomOptions) -> RoomSnapshot {
        let mut rooms = self.rooms.write().await;
        let room = rooms.entry(room_id.to_string()).or_insert_with(|| {
            let encrypted = opts
                .encryption_required
                .unwrap_or(self.default_encryption_required);
            info!(room = %room_id, encrypted, "Created room");
            Room::new(encrypted)
        });
        room.cancel_deletion();
        room.apply(&opts);
        if room.members.is_empty() {
            room.deletion = Some(self.spawn_deletion(room_id));
        }
        room.snapshot(room_id)
    }

    pub async fn lookup(&self, room_id: &str) -> Option<RoomSnapshot> {
        let rooms = self.rooms.read().await;
        rooms.get(room_id).map(|room| room.snapshot(room_id))
    }

    /// Unconditionally remove a room.
    #[allow(dead_code)]
    pub async fn drop_room(&self, room_id: &str) {
        let mut rooms = self.rooms.write().await;
        if let Some(mut room) = rooms.remove(room_id) {
            room.cancel_deletion();
            info!(room = %room_id, "Dropped room");
        }
    }

    /// Attach a connection to a room, creating the room if needed. Cancels
    /// any pending deletion timer and announces the new roster to every
    /// member (the newcomer included).
    pub async fn attach(
        &self,
        room_id: &str,
        member: MemberHandle,
        opts: RoomOptions,
    ) -> RoomSnapshot {
        let mut rooms = self.rooms.write().await;
        let room = rooms.entry(room_id.to_string()).or_insert_with(|| {
            let encrypted = opts
                .encryption_required
                .unwrap_or(self.default_encryption_required);
            info!(room = %room_id, encrypted, "Created room");
            Room::new(encrypted)
        });
        room.cancel_deletion();
        room.apply(&opts);

        info!(
            room = %room_id,
            peer = %member.user_id,
            members = room.members.len() + 1,
            "Member joined room"
        );

        room.members.insert(member.connection_id, member);
        room.broadcast_presence();
        room.snapshot(room_id)
    }

    /// Detach a connection from its room. Idempotent. When the last member
    /// leaves, the empty-grace deletion timer is armed.
    pub async fn detach(&self, room_id: &str, connection_id: Uuid) {
        let mut rooms = self.rooms.write().await;
        let Some(room) = rooms.get_mut(room_id) else {
            return;
        };
        let Some(member) = room.members.remove(&connection_id) else {
            return;
        };

        info!(
            room = %room_id,
            peer = %member.user_id,
            members = room.members.len(),
            "Member left room"
        );

        room.broadcast_presence();

        if room.members.is_empty() {
            room.cancel_deletion();
            room.deletion = Some(self.spawn_deletion(room_id));
            debug!(
                room = %room_id,
                grace_secs = self.empty_grace.as_secs(),
                "Armed empty-room deletion timer"
            );
        }
    }

    fn spawn_deletion(&self, room_id: &str) -> JoinHandle<()> {
        let registry = self.clone();
        let room_id = room_id.to_string();
        let grace = self.empty_grace;
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            registry.expire_if_empty(&room_id).await;
        })
    }

    /// Fired by a deletion timer. Re-checks under the write lock: a join
    /// that slipped in during the grace keeps the room alive.
    async fn expire_if_empty(&self, room_id: &str) {
        let mut rooms = self.rooms.write().await;
        let still_empty = rooms
            .get(room_id)
            .map(|room| room.members.is_empty())
            .unwrap_or(false);
        if still_empty {
            rooms.remove(room_id);
            info!(room = %room_id, "Deleted room after empty grace");
            let _ = self.deleted_tx.send(room_id.to_string());
        }
    }

    /// Fan a frame out to the members of a room. The sender is skipped
    /// unless `echo` is set.
    pub async fn broadcast(&self, room_id: &str, from: Uuid, frame: &ServerFrame, echo: bool) {
        let rooms = self.rooms.read().await;
        let Some(room) = rooms.get(room_id) else {
            warn!(room = %room_id, "Broadcast into nonexistent room");
            return;
        };
        let Ok(text) = serde_json::to_string(frame) else {
            return;
        };
        for member in room.members.values() {
            if !echo && member.connection_id == from {
                continue;
            }
            member.try_send(Message::Text(text.clone().into()));
        }
    }

    /// Record the latest advertised video state -- a sync-state position
    /// or an episode switch -- so late joiners can hydrate from it. Not
    /// authoritative; peers reconcile themselves.
    pub async fn apply_video_state(
        &self,
        room_id: &str,
        url: Option<&str>,
        time: Option<f64>,
        title_id: Option<&str>,
    ) {
        let mut rooms = self.rooms.write().await;
        if let Some(room) = rooms.get_mut(room_id) {
            if let Some(url) = url {
                room.video_url = Some(url.to_string());
            }
            if let Some(title) = title_id {
                room.title_id = Some(title.to_string());
            }
            if let Some(time) = time {
                room.initial_time = Some(time);
            }
        }
    }

    pub async fn member_count(&self, room_id: &str) -> usize {
        let rooms = self.rooms.read().await;
        rooms.get(room_id).map(|r| r.members.len()).unwrap_or(0)
    }

    /// True when the room exists and has a pending deletion timer.
    pub async fn has_deletion_timer(&self, room_id: &str) -> bool {
        let rooms = self.rooms.read().await;
        rooms
            .get(room_id)
            .map(|room| room.deletion.is_some())
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity(name: &str) -> Identity {
        Identity {
            user_id: format!("{}-sub", name.to_lowercase()),
            name: name.to_string(),
            picture: None,
            email: None,
        }
    }

    fn member(name: &str) -> (MemberHandle, mpsc::Receiver<Message>) {
        let (tx, rx) = mpsc::channel(16);
        (MemberHandle::new(&identity(name), tx), rx)
    }

    fn frame_json(message: Message) -> serde_json::Value {
        match message {
            Message::Text(text) => serde_json::from_str(text.as_str()).unwrap(),
            other => panic!("expected text frame, got {other:?}"),
        }
    }

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn empty_room_deleted_after_grace() {
        let registry = RoomRegistry::new(false, Duration::from_secs(60));
        let (alice, _rx) = member("Alice");
        let alice_conn = alice.connection_id;

        registry.attach("r1", alice, RoomOptions::default()).await;
        assert!(!registry.has_deletion_timer("r1").await);

        registry.detach("r1", alice_conn).await;
        assert!(registry.has_deletion_timer("r1").await);
        assert!(registry.lookup("r1").await.is_some());

        tokio::time::sleep(Duration::from_secs(61)).await;
        settle().await;
        assert!(registry.lookup("r1").await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_within_grace_cancels_deletion() {
        let registry = RoomRegistry::new(false, Duration::from_secs(86_400));
        let opts = RoomOptions {
            encryption_required: Some(true),
            ..Default::default()
        };

        let (alice, _rx) = member("Alice");
        let alice_conn = alice.connection_id;
        registry.attach("r3", alice, opts).await;
        registry.detach("r3", alice_conn).await;
        assert!(registry.has_deletion_timer("r3").await);

        tokio::time::sleep(Duration::from_secs(60)).await;

        let (alice2, _rx2) = member("Alice");
        let snapshot = registry
            .attach("r3", alice2, RoomOptions::default())
            .await;
        assert!(snapshot.encryption_required);
        assert!(!registry.has_deletion_timer("r3").await);

        // Well past the original grace: the cancelled timer must not fire.
        tokio::time::sleep(Duration::from_secs(2 * 86_400)).await;
        settle().await;
        assert!(registry.lookup("r3").await.is_some());
        assert_eq!(registry.member_count("r3").await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn join_during_empty_window_wins_over_deletion() {
        let registry = RoomRegistry::new(false, Duration::from_secs(60));
        let (alice, _arx) = member("Alice");
        let alice_conn = alice.connection_id;
        registry.attach("r4", alice, RoomOptions::default()).await;

        // Membership drops to zero and a join lands immediately after.
        registry.detach("r4", alice_conn).await;
        let (bob, _brx) = member("Bob");
        registry.attach("r4", bob, RoomOptions::default()).await;

        assert!(!registry.has_deletion_timer("r4").await);
        tokio::time::sleep(Duration::from_secs(120)).await;
        settle().await;
        assert_eq!(registry.member_count("r4").await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn created_but_never_joined_room_still_expires() {
        let registry = RoomRegistry::new(false, Duration::from_secs(60));
        registry.ensure("lost", RoomOptions::default()).await;
        assert!(registry.has_deletion_timer("lost").await);

        tokio::time::sleep(Duration::from_secs(61)).await;
        settle().await;
        assert!(registry.lookup("lost").await.is_none());
    }

    #[tokio::test]
    async fn drop_room_is_unconditional() {
        let registry = RoomRegistry::new(false, Duration::from_secs(60));
        let (alice, _rx) = member("Alice");
        registry.attach("doomed", alice, RoomOptions::default()).await;
        registry.drop_room("doomed").await;
        assert!(registry.lookup("doomed").await.is_none());
    }

    #[tokio::test]
    async fn ensure_is_idempotent_and_encryption_is_immutable() {
        let registry = RoomRegistry::new(false, Duration::from_secs(60));
        let opts = RoomOptions {
            encryption_required: Some(false),
            video_url: Some("https://example.com/watch/1".into()),
            ..Default::default()
        };

        let first = registry.ensure("r5", opts.clone()).await;
        let second = registry.ensure("r5", opts).await;
        assert_eq!(first.encryption_required, second.encryption_required);
        assert_eq!(first.video_url, second.video_url);

        // A later ensure cannot flip the encryption flag.
        let flipped = registry
            .ensure(
                "r5",
                RoomOptions {
                    encryption_required: Some(true),
                    ..Default::default()
                },
            )
            .await;
        assert!(!flipped.encryption_required);
    }

    #[tokio::test]
    async fn presence_follows_membership() {
        let registry = RoomRegistry::new(false, Duration::from_secs(60));

        let (alice, mut alice_rx) = member("Alice");
        registry.attach("r6", alice, RoomOptions::default()).await;
        let roster = frame_json(alice_rx.try_recv().unwrap());
        assert_eq!(roster["type"], "presence");
        assert_eq!(roster["participants"].as_array().unwrap().len(), 1);

        let (bob, mut bob_rx) = member("Bob");
        let bob_conn = bob.connection_id;
        registry.attach("r6", bob, RoomOptions::default()).await;

        let roster = frame_json(alice_rx.try_recv().unwrap());
        assert_eq!(roster["participants"].as_array().unwrap().len(), 2);
        let roster = frame_json(bob_rx.try_recv().unwrap());
        assert_eq!(roster["users"].as_array().unwrap().len(), 2);

        registry.detach("r6", bob_conn).await;
        let roster = frame_json(alice_rx.try_recv().unwrap());
        let participants = roster["participants"].as_array().unwrap();
        assert_eq!(participants.len(), 1);
        assert_eq!(participants[0]["name"], "Alice");
    }

    #[tokio::test]
    async fn broadcast_scopes_the_sender() {
        let registry = RoomRegistry::new(false, Duration::from_secs(60));
        let (alice, mut alice_rx) = member("Alice");
        let alice_conn = alice.connection_id;
        let (bob, mut bob_rx) = member("Bob");
        registry.attach("r7", alice, RoomOptions::default()).await;
        registry.attach("r7", bob, RoomOptions::default()).await;

        // Drain presence traffic.
        while alice_rx.try_recv().is_ok() {}
        while bob_rx.try_recv().is_ok() {}

        let frame = ServerFrame::Typing {
            from: "Alice".into(),
            from_id: "alice-sub".into(),
            active: true,
            ts: 1,
        };
        registry.broadcast("r7", alice_conn, &frame, false).await;
        assert!(alice_rx.try_recv().is_err());
        assert_eq!(frame_json(bob_rx.try_recv().unwrap())["type"], "typing");

        let frame = ServerFrame::Chat {
            text: "hi".into(),
            from: "Alice".into(),
            from_id: "alice-sub".into(),
            avatar: None,
            ts: 2,
        };
        registry.broadcast("r7", alice_conn, &frame, true).await;
        assert_eq!(frame_json(alice_rx.try_recv().unwrap())["text"], "hi");
        assert_eq!(frame_json(bob_rx.try_recv().unwrap())["text"], "hi");
    }

    #[tokio::test]
    async fn video_state_updates_advertised_metadata() {
        let registry = RoomRegistry::new(false, Duration::from_secs(60));
        registry.ensure("r8", RoomOptions::default()).await;
        registry
            .apply_video_state("r8", Some("https://example.com/watch/99"), Some(321.5), Some("99"))
            .await;

        let snapshot = registry.lookup("r8").await.unwrap();
        assert_eq!(snapshot.video_url.as_deref(), Some("https://example.com/watch/99"));
        assert_eq!(snapshot.title_id.as_deref(), Some("99"));
        assert_eq!(snapshot.initial_time, Some(321.5));

        // An episode switch carries no position; the url moves and the
        // last advertised time survives.
        registry
            .apply_video_state("r8", Some("https://example.com/watch/100"), None, Some("100"))
            .await;
        let snapshot = registry.lookup("r8").await.unwrap();
        assert_eq!(snapshot.video_url.as_deref(), Some("https://example.com/watch/100"));
        assert_eq!(snapshot.title_id.as_deref(), Some("100"));
        assert_eq!(snapshot.initial_time, Some(321.5));
    }

    #[tokio::test(start_paused = true)]
    async fn deletion_notification_reaches_subscribers() {
        let registry = RoomRegistry::new(false, Duration::from_secs(1));
        let mut deletions = registry.deletions();

        let (alice, _rx) = member("Alice");
        let alice_conn = alice.connection_id;
        registry.attach("r9", alice, RoomOptions::default()).await;
        registry.detach("r9", alice_conn).await;

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(deletions.recv().await.unwrap(), "r9");
    }
}
