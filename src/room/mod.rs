//! Room State (C3)
//!
//! The authoritative per-room container (spec §3/§4.2). Every
//! state-mutating operation for a given room is serialized through one
//! critical section — `RoomState::inner`, a single `tokio::sync::Mutex`
//! guarding every room-scoped map (spec §5: "every state-mutating
//! operation for a given room is serialized through a per-room critical
//! section"). Reads that need a consistent multi-field snapshot (fan-out,
//! feed selection) take the same lock rather than composing several
//! fine-grained locks, so a torn read across `members` and
//! `screenShareProducerId` is impossible by construction.

mod quality;
mod registry;

pub use quality::{next_quality, Quality};
pub use registry::RoomRegistry;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use uuid::Uuid;

use crate::apps::AppsState;
use crate::error::ErrorKind;
use crate::media::{ProducerHandle, ProducerType, Router};
use crate::session::{ClientSession, Role, UserId};
use crate::webinar::WebinarConfig;
use crate::ws::ServerEvent;

/// A knocker awaiting admission (spec §3: `pendingClients`).
pub struct PendingClient {
    pub user_id: UserId,
    pub display_name: String,
    pub signal_tx: mpsc::Sender<ServerEvent>,
}

/// A transient grace timer for a dropped socket (spec §3:
/// `pendingDisconnects`). The task handle is aborted on cancellation
/// (reconnect-within-grace or explicit removal).
pub struct PendingDisconnect {
    pub task: tokio::task::JoinHandle<()>,
    /// Connection epoch observed at disconnect time; a reconnect must
    /// present the same `(userKey, sessionId)` to resume, so this is only
    /// used to make repeated-disconnect races a no-op rather than to gate
    /// resumption identity.
    pub epoch: u64,
}

/// A non-peer-owned stream (e.g. shared-browser video/audio), owned by the
/// room rather than any session (spec §3/§5).
pub struct SystemProducer {
    pub producer: Arc<ProducerHandle>,
    pub synthetic_user_id: String,
    pub producer_type: ProducerType,
}

struct RoomState {
    members: HashMap<UserId, Arc<ClientSession>>,
    pending_clients: HashMap<String, PendingClient>,
    pending_disconnects: HashMap<UserId, PendingDisconnect>,
    allowed_users: HashSet<String>,
    locked_allowed_users: HashSet<String>,
    is_locked: bool,
    is_chat_locked: bool,
    no_guests: bool,
    is_tts_disabled: bool,
    host_user_key: Option<String>,
    /// Meeting-level invite code hash, distinct from the webinar invite
    /// code (spec §4.4 step 3c: "If meeting invite code configured,
    /// require correct code"). `None` means no code is required.
    meeting_invite_code_hash: Option<String>,
    display_names_by_key: HashMap<String, String>,
    user_keys_by_id: HashMap<UserId, String>,
    hand_raised_by_user_id: HashSet<UserId>,
    screen_share: Option<(Uuid, UserId)>,
    current_quality: Quality,
    system_producers: HashMap<Uuid, SystemProducer>,
    cleanup_timer: Option<tokio::task::JoinHandle<()>>,
    deny_listed_users: HashSet<String>,
}

/// The authoritative per-room container (spec §3).
pub struct Room {
    /// `clientId:roomId`.
    pub channel_id: String,
    pub client_id: String,
    pub room_id: String,
    pub router: Router,
    pub webinar: Mutex<WebinarConfig>,
    pub apps: AppsState,
    inner: Mutex<RoomState>,
}

impl Room {
    pub fn new(client_id: String, room_id: String, router: Router) -> Self {
        Self {
            channel_id: format!("{client_id}:{room_id}"),
            client_id,
            room_id,
            router,
            webinar: Mutex::new(WebinarConfig::default()),
            apps: AppsState::default(),
            inner: Mutex::new(RoomState {
                members: HashMap::new(),
                pending_clients: HashMap::new(),
                pending_disconnects: HashMap::new(),
                allowed_users: HashSet::new(),
                locked_allowed_users: HashSet::new(),
                is_locked: false,
                is_chat_locked: false,
                no_guests: false,
                is_tts_disabled: false,
                host_user_key: None,
                meeting_invite_code_hash: None,
                display_names_by_key: HashMap::new(),
                user_keys_by_id: HashMap::new(),
                hand_raised_by_user_id: HashSet::new(),
                screen_share: None,
                current_quality: Quality::default(),
                system_producers: HashMap::new(),
                cleanup_timer: None,
                deny_listed_users: HashSet::new(),
            }),
        }
    }

    // -- membership -----------------------------------------------------

    pub async fn add_member(&self, session: Arc<ClientSession>) {
        let mut inner = self.inner.lock().await;
        inner
            .user_keys_by_id
            .insert(session.user_id.clone(), session.user_id.user_key.clone());
        inner
            .display_names_by_key
            .entry(session.user_id.user_key.clone())
            .or_insert_with(|| session.display_name.clone());
        inner.members.insert(session.user_id.clone(), session);
        self.cancel_cleanup_locked(&mut inner);
    }

    /// Returns the removed session, if present, so the caller can cascade
    /// its close and release any screen-share lease it held.
    pub async fn remove_member(&self, user_id: &UserId) -> Option<Arc<ClientSession>> {
        let mut inner = self.inner.lock().await;
        let removed = inner.members.remove(user_id);
        inner.user_keys_by_id.remove(user_id);
        inner.hand_raised_by_user_id.remove(user_id);
        if let Some((_, owner)) = &inner.screen_share {
            if owner == user_id {
                inner.screen_share = None;
            }
        }
        removed
    }

    pub async fn member(&self, user_id: &UserId) -> Option<Arc<ClientSession>> {
        self.inner.lock().await.members.get(user_id).cloned()
    }

    pub async fn members_snapshot(&self) -> Vec<Arc<ClientSession>> {
        self.inner.lock().await.members.values().cloned().collect()
    }

    pub async fn member_count(&self) -> usize {
        self.inner.lock().await.members.len()
    }

    pub async fn is_empty(&self) -> bool {
        let inner = self.inner.lock().await;
        inner.members.is_empty() && inner.pending_clients.is_empty()
    }

    /// Whether `user_key` currently has a member session (used by admission
    /// to enforce `pendingClients ∩ members = ∅`, spec §3).
    pub async fn has_member_with_key(&self, user_key: &str) -> bool {
        self.inner
            .lock()
            .await
            .members
            .keys()
            .any(|id| id.user_key == user_key)
    }

    pub async fn attendee_count(&self) -> usize {
        self.inner
            .lock()
            .await
            .members
            .values()
            .filter(|s| s.role == Role::WebinarAttendee)
            .count()
    }

    /// Non-ghost, non-attendee members, in stable insertion order — the
    /// active-speaker feed candidate set (spec §4.3).
    pub async fn feed_candidates(&self) -> Vec<Arc<ClientSession>> {
        self.inner
            .lock()
            .await
            .members
            .values()
            .filter(|s| !matches!(s.role, Role::Ghost | Role::WebinarAttendee))
            .cloned()
            .collect()
    }

    // -- pending clients (knock path) ------------------------------------

    pub async fn add_pending(&self, pending: PendingClient) {
        let mut inner = self.inner.lock().await;
        inner.pending_clients.insert(pending.user_id.user_key.clone(), pending);
        self.cancel_cleanup_locked(&mut inner);
    }

    pub async fn remove_pending(&self, user_key: &str) -> Option<PendingClient> {
        self.inner.lock().await.pending_clients.remove(user_key)
    }

    pub async fn pending_user_keys(&self) -> Vec<String> {
        self.inner.lock().await.pending_clients.keys().cloned().collect()
    }

    // -- grace window (pending disconnects) ------------------------------

    pub async fn set_pending_disconnect(&self, user_id: UserId, pending: PendingDisconnect) {
        let mut inner = self.inner.lock().await;
        if let Some(old) = inner.pending_disconnects.insert(user_id, pending) {
            old.task.abort();
        }
    }

    /// Cancel a scheduled disconnect (reconnection within the grace
    /// window). Returns true if one was actually pending.
    pub async fn cancel_pending_disconnect(&self, user_id: &UserId) -> bool {
        if let Some(pending) = self.inner.lock().await.pending_disconnects.remove(user_id) {
            pending.task.abort();
            true
        } else {
            false
        }
    }

    pub async fn take_pending_disconnect(&self, user_id: &UserId) -> Option<PendingDisconnect> {
        self.inner.lock().await.pending_disconnects.remove(user_id)
    }

    // -- admission policy -------------------------------------------------

    pub async fn is_locked(&self) -> bool {
        self.inner.lock().await.is_locked
    }

    pub async fn set_locked(&self, locked: bool) {
        let mut inner = self.inner.lock().await;
        inner.is_locked = locked;
        if !locked {
            inner.locked_allowed_users.clear();
        }
    }

    pub async fn is_chat_locked(&self) -> bool {
        self.inner.lock().await.is_chat_locked
    }

    pub async fn set_chat_locked(&self, locked: bool) {
        self.inner.lock().await.is_chat_locked = locked;
    }

    pub async fn no_guests(&self) -> bool {
        self.inner.lock().await.no_guests
    }

    pub async fn set_no_guests(&self, no_guests: bool) {
        self.inner.lock().await.no_guests = no_guests;
    }

    pub async fn is_tts_disabled(&self) -> bool {
        self.inner.lock().await.is_tts_disabled
    }

    pub async fn set_tts_disabled(&self, disabled: bool) {
        self.inner.lock().await.is_tts_disabled = disabled;
    }

    pub async fn allow_user(&self, user_key: String) {
        let mut inner = self.inner.lock().await;
        if inner.is_locked {
            inner.locked_allowed_users.insert(user_key.clone());
        }
        inner.allowed_users.insert(user_key);
    }

    pub async fn is_allowed(&self, user_key: &str) -> bool {
        let inner = self.inner.lock().await;
        if inner.deny_listed_users.contains(user_key) {
            return false;
        }
        if inner.is_locked {
            inner.locked_allowed_users.contains(user_key)
        } else {
            inner.allowed_users.contains(user_key)
        }
    }

    /// Kick forbids re-entry: purge clearances, deny-list the key (spec
    /// §4.4: "closes target session and forbids re-entry via
    /// `allowedUsers` removal plus a transient deny-list").
    pub async fn deny_reentry(&self, user_key: &str) {
        let mut inner = self.inner.lock().await;
        inner.allowed_users.remove(user_key);
        inner.locked_allowed_users.remove(user_key);
        inner.deny_listed_users.insert(user_key.to_string());
    }

    // -- host lifecycle ---------------------------------------------------

    pub async fn host_user_key(&self) -> Option<String> {
        self.inner.lock().await.host_user_key.clone()
    }

    pub async fn set_host_user_key(&self, user_key: Option<String>) {
        self.inner.lock().await.host_user_key = user_key;
    }

    /// True if `user_key` is the primary host. Ad-hoc admin status beyond
    /// the primary host is out of this core's scope (spec §9: "Admin-ness
    /// is a Room attribute ... and is reassignable" — reassignment is this
    /// single-host slot, not a list of co-admins).
    pub async fn is_admin(&self, user_key: &str) -> bool {
        self.inner.lock().await.host_user_key.as_deref() == Some(user_key)
    }

    // -- meeting invite code (spec §4.4 step 3c) ---------------------------

    /// Set (or clear) the meeting-level invite code. `code: None` removes
    /// the requirement entirely; `Some(code)` hashes and stores it.
    pub async fn set_meeting_invite_code(&self, secret: &str, code: Option<String>) {
        self.inner.lock().await.meeting_invite_code_hash = code.map(|c| crate::webinar::hash_invite_code(secret, &c));
    }

    pub async fn requires_meeting_invite_code(&self) -> bool {
        self.inner.lock().await.meeting_invite_code_hash.is_some()
    }

    /// Verify a presented code against the stored hash. Returns `false`
    /// both when no code was presented and when the code is wrong — the
    /// caller distinguishes those cases via [`Self::requires_meeting_invite_code`].
    pub async fn verify_meeting_invite_code(&self, secret: &str, presented: &str) -> bool {
        match &self.inner.lock().await.meeting_invite_code_hash {
            Some(hash) => crate::webinar::verify_invite_code(secret, presented, hash),
            None => false,
        }
    }

    // -- display names ----------------------------------------------------

    pub async fn display_name(&self, user_key: &str) -> Option<String> {
        self.inner.lock().await.display_names_by_key.get(user_key).cloned()
    }

    pub async fn set_display_name(&self, user_key: String, display_name: String) {
        self.inner.lock().await.display_names_by_key.insert(user_key, display_name);
    }

    // -- hand raise ---------------------------------------------------------

    pub async fn set_hand_raised(&self, user_id: UserId, raised: bool) {
        let mut inner = self.inner.lock().await;
        if raised {
            inner.hand_raised_by_user_id.insert(user_id);
        } else {
            inner.hand_raised_by_user_id.remove(&user_id);
        }
    }

    pub async fn is_hand_raised(&self, user_id: &UserId) -> bool {
        self.inner.lock().await.hand_raised_by_user_id.contains(user_id)
    }

    // -- screen-share lease -------------------------------------------------

    /// FCFS acquisition; rejects with [`ErrorKind::ScreenBusy`] if another
    /// session already holds the lease (spec §4.1/§4.2/§8 "Screen-share
    /// exclusivity").
    pub async fn acquire_screen_lease(&self, owner: UserId, producer_id: Uuid) -> Result<(), ErrorKind> {
        let mut inner = self.inner.lock().await;
        match &inner.screen_share {
            Some((_, existing_owner)) if *existing_owner != owner => Err(ErrorKind::ScreenBusy),
            _ => {
                inner.screen_share = Some((producer_id, owner));
                Ok(())
            }
        }
    }

    pub async fn release_screen_lease(&self, producer_id: Uuid) {
        let mut inner = self.inner.lock().await;
        if matches!(&inner.screen_share, Some((pid, _)) if *pid == producer_id) {
            inner.screen_share = None;
        }
    }

    pub async fn screen_share_producer_id(&self) -> Option<Uuid> {
        self.inner.lock().await.screen_share.as_ref().map(|(id, _)| *id)
    }

    // -- video quality --------------------------------------------------

    /// Recompute the quality target given the current membership count.
    /// Returns `Some(new_quality)` only when it actually changed, so the
    /// caller knows whether to broadcast `setVideoQuality`.
    pub async fn update_video_quality_target(
        &self,
        low_threshold: usize,
        standard_threshold: usize,
    ) -> Option<Quality> {
        let mut inner = self.inner.lock().await;
        let count = inner.members.len();
        let next = next_quality(inner.current_quality, count, low_threshold, standard_threshold);
        if next == inner.current_quality {
            None
        } else {
            inner.current_quality = next;
            Some(next)
        }
    }

    pub async fn current_quality(&self) -> Quality {
        self.inner.lock().await.current_quality
    }

    // -- system producers -------------------------------------------------

    pub async fn add_system_producer(&self, entry: SystemProducer) {
        self.inner.lock().await.system_producers.insert(entry.producer.id, entry);
    }

    pub async fn remove_system_producer(&self, producer_id: Uuid) -> Option<SystemProducer> {
        self.inner.lock().await.system_producers.remove(&producer_id)
    }

    pub async fn system_producers_snapshot(&self) -> Vec<Uuid> {
        self.inner.lock().await.system_producers.keys().copied().collect()
    }

    // -- cleanup timer ----------------------------------------------------

    /// Start (or replace) the dissolution timer. Any subsequent admission
    /// cancels it (spec §4.8: "Any admission cancels the timer"). `force`
    /// is forwarded to [`RoomRegistry::dissolve`] — `true` for the
    /// admin-absence rule (dissolves unconditionally), `false` for the
    /// empty-room rule (only if still empty).
    pub async fn schedule_cleanup(&self, delay: std::time::Duration, registry: Arc<RoomRegistry>, channel_id: String, force: bool) {
        let mut inner = self.inner.lock().await;
        if let Some(old) = inner.cleanup_timer.take() {
            old.abort();
        }
        inner.cleanup_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            registry.dissolve(&channel_id, force).await;
        }));
    }

    pub async fn cancel_cleanup(&self) {
        let mut inner = self.inner.lock().await;
        self.cancel_cleanup_locked(&mut inner);
    }

    fn cancel_cleanup_locked(&self, inner: &mut RoomState) {
        if let Some(old) = inner.cleanup_timer.take() {
            old.abort();
        }
    }

    /// Broadcast an event to every member except `exclude`. Clones sender
    /// handles before sending so I/O never happens while holding the room
    /// lock (grounded in the teacher's `Room::broadcast_except`).
    pub async fn broadcast_except(&self, exclude: &UserId, event: ServerEvent) {
        let sessions: Vec<Arc<ClientSession>> = {
            let inner = self.inner.lock().await;
            inner
                .members
                .iter()
                .filter(|(id, _)| *id != exclude)
                .map(|(_, s)| s.clone())
                .collect()
        };
        for session in sessions {
            let _ = session.signal_tx().await.send(event.clone()).await;
        }
    }

    pub async fn broadcast_all(&self, event: ServerEvent) {
        let sessions: Vec<Arc<ClientSession>> = {
            let inner = self.inner.lock().await;
            inner.members.values().cloned().collect()
        };
        for session in sessions {
            let _ = session.signal_tx().await.send(event.clone()).await;
        }
    }

    pub async fn notify_pending(&self, event: ServerEvent) {
        let senders: Vec<mpsc::Sender<ServerEvent>> = {
            let inner = self.inner.lock().await;
            inner.pending_clients.values().map(|p| p.signal_tx.clone()).collect()
        };
        for tx in senders {
            let _ = tx.send(event.clone()).await;
        }
    }

    /// Admin sessions currently in the room (at most one, the host).
    pub async fn admin_sessions(&self) -> Vec<Arc<ClientSession>> {
        let inner = self.inner.lock().await;
        match &inner.host_user_key {
            Some(key) => inner
                .members
                .values()
                .filter(|s| &s.user_id.user_key == key)
                .cloned()
                .collect(),
            None => Vec::new(),
        }
    }

    /// Send `event` to every admin session (spec §4.4 "notify admins" on
    /// a new knock).
    pub async fn notify_admins(&self, event: ServerEvent) {
        for session in self.admin_sessions().await {
            let _ = session.signal_tx().await.send(event.clone()).await;
        }
    }
}
