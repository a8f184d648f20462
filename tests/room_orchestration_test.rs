//! Cross-component integration tests exercising the scenarios from spec §8
//! directly against `RoomRegistry`/`AdmissionEngine` — no real network
//! socket, matching the teacher's style of driving handler-level logic in
//! `tests/screenshare_test.rs` rather than standing up a live server.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use confero_core::admission::{AdmissionEngine, JoinDecision, JoinRequest};
use confero_core::error::ErrorKind;
use confero_core::media::MediaEngine;
use confero_core::room::RoomRegistry;
use confero_core::session::Role;
use confero_core::webinar::WebinarConfigUpdate;
use confero_core::ws::ServerEvent;
use tokio::sync::mpsc;

const SECRET: &str = "test-sfu-secret";

fn media_engine() -> MediaEngine {
    MediaEngine::new("stun:stun.l.google.com:19302", None, None, None).expect("media engine init")
}

fn engine() -> Arc<AdmissionEngine> {
    let registry = Arc::new(RoomRegistry::new(media_engine(), true));
    Arc::new(AdmissionEngine::new(registry, SECRET.to_string(), Arc::new(AtomicBool::new(false)), 1000))
}

fn channel() -> (mpsc::Sender<ServerEvent>, mpsc::Receiver<ServerEvent>) {
    mpsc::channel(32)
}

fn join_req(
    room_id: &str,
    user_key: &str,
    session_id: &str,
    role: Role,
    is_host: bool,
    tx: mpsc::Sender<ServerEvent>,
) -> JoinRequest {
    JoinRequest {
        client_id: "instance-a".to_string(),
        room_id: room_id.to_string(),
        user_key: user_key.to_string(),
        session_id: session_id.to_string(),
        display_name: Some(user_key.to_string()),
        role,
        presented_invite_code: None,
        presented_signed_link: None,
        is_host_credential: is_host,
        is_guest_identity: !is_host,
        signal_tx: tx,
    }
}

/// Scenario 1: knock-and-admit (spec §8.1).
#[tokio::test]
async fn knock_and_admit() {
    let engine = engine();

    let (host_tx, mut host_rx) = channel();
    let (_room, decision) = engine
        .join(join_req("r1", "host", "s1", Role::Participant, true, host_tx))
        .await
        .expect("host joins");
    assert!(matches!(decision, JoinDecision::Joined(_)));

    let (guest_tx, mut guest_rx) = channel();
    let (room, decision) = engine
        .join(join_req("r1", "guest", "s1", Role::Participant, false, guest_tx))
        .await
        .expect("guest knocks");
    assert!(matches!(decision, JoinDecision::Waiting));

    // Host is notified of the pending knock.
    let notice = host_rx.recv().await.expect("host sees pendingUserJoined");
    assert!(matches!(notice, ServerEvent::PendingUserJoined { .. }));

    engine.admit_pending(&room, "guest").await.expect("host admits guest");

    let joined = guest_rx.recv().await.expect("guest sees userJoined");
    assert!(matches!(joined, ServerEvent::UserJoined { .. }));

    assert_eq!(room.member_count().await, 2);
}

/// Knocking into a locked room is rejected outright (spec §4.4 step 6).
#[tokio::test]
async fn locked_room_rejects_knock() {
    let engine = engine();
    let (host_tx, _host_rx) = channel();
    let (room, _) = engine
        .join(join_req("r-locked", "host", "s1", Role::Participant, true, host_tx))
        .await
        .unwrap();
    room.set_locked(true).await;

    let (guest_tx, _guest_rx) = channel();
    let err = engine
        .join(join_req("r-locked", "guest", "s1", Role::Participant, false, guest_tx))
        .await
        .unwrap_err();
    assert_eq!(err, ErrorKind::RoomLocked);
}

/// Scenario 2: screen-share lease exclusivity (spec §8.2).
#[tokio::test]
async fn screen_share_lease_is_exclusive_and_releases_on_close() {
    let engine = engine();
    let (a_tx, _a_rx) = channel();
    let (room, decision) = engine
        .join(join_req("r2", "a", "s1", Role::Participant, true, a_tx))
        .await
        .unwrap();
    let JoinDecision::Joined(session_a) = decision else { panic!("expected joined") };

    let producer_id_a = uuid::Uuid::new_v4();
    room.acquire_screen_lease(session_a.user_id.clone(), producer_id_a)
        .await
        .expect("first screen-share acquires the lease");

    let (b_tx, _b_rx) = channel();
    let (_, decision) = engine
        .join(join_req("r2", "b", "s1", Role::Participant, true, b_tx))
        .await
        .unwrap();
    let JoinDecision::Joined(session_b) = decision else { panic!("expected joined") };

    let producer_id_b = uuid::Uuid::new_v4();
    let err = room
        .acquire_screen_lease(session_b.user_id.clone(), producer_id_b)
        .await
        .unwrap_err();
    assert_eq!(err, ErrorKind::ScreenBusy);

    room.release_screen_lease(producer_id_a).await;

    room.acquire_screen_lease(session_b.user_id.clone(), producer_id_b)
        .await
        .expect("lease is free once the holder releases it");
}

/// Scenario 3: webinar attendee cap (spec §8.3).
#[tokio::test]
async fn webinar_attendee_cap_rejects_once_full() {
    let engine = engine();
    let (host_tx, _host_rx) = channel();
    let (room, _) = engine
        .join(join_req("w1", "host", "s1", Role::Participant, true, host_tx))
        .await
        .unwrap();

    {
        let mut webinar = room.webinar.lock().await;
        webinar
            .apply_update(
                WebinarConfigUpdate {
                    enabled: Some(true),
                    public_access: Some(true),
                    locked: None,
                    max_attendees: Some(2),
                    invite_code: None,
                },
                SECRET,
            )
            .unwrap();
    }

    for i in 0..2 {
        let (tx, _rx) = channel();
        let (_, decision) = engine
            .join(join_req("w1", &format!("attendee-{i}"), "s1", Role::WebinarAttendee, false, tx))
            .await
            .unwrap_or_else(|e| panic!("attendee {i} should be admitted, got {e:?}"));
        assert!(matches!(decision, JoinDecision::Joined(_)));
    }

    let (tx, _rx) = channel();
    let err = engine
        .join(join_req("w1", "attendee-2", "s1", Role::WebinarAttendee, false, tx))
        .await
        .unwrap_err();
    assert_eq!(err, ErrorKind::AttendeeCapExceeded);
    assert_eq!(room.attendee_count().await, 2);
}

/// Attendees cannot join a room with webinar mode disabled.
#[tokio::test]
async fn webinar_disabled_rejects_attendee_join() {
    let engine = engine();
    let (host_tx, _host_rx) = channel();
    let (_room, _) = engine
        .join(join_req("w2", "host", "s1", Role::Participant, true, host_tx))
        .await
        .unwrap();

    let (tx, _rx) = channel();
    let err = engine
        .join(join_req("w2", "attendee", "s1", Role::WebinarAttendee, false, tx))
        .await
        .unwrap_err();
    assert_eq!(err, ErrorKind::WebinarDisabled);
}

/// A ghost joining without host credentials is rejected (spec §4.4 step 3).
#[tokio::test]
async fn ghost_without_host_credential_is_rejected() {
    let engine = engine();
    let (tx, _rx) = channel();
    let err = engine
        .join(join_req("r3", "observer", "s1", Role::Ghost, false, tx))
        .await
        .unwrap_err();
    assert_eq!(err, ErrorKind::Forbidden);
}

/// `noGuests` blocks guest-identity joins but not host-credentialed ones.
#[tokio::test]
async fn no_guests_blocks_guest_identity() {
    let engine = engine();
    let (host_tx, _host_rx) = channel();
    let (room, _) = engine
        .join(join_req("r4", "host", "s1", Role::Participant, true, host_tx))
        .await
        .unwrap();
    room.set_no_guests(true).await;

    let (tx, _rx) = channel();
    let err = engine
        .join(join_req("r4", "guest-abc", "s1", Role::Participant, false, tx))
        .await
        .unwrap_err();
    assert_eq!(err, ErrorKind::GuestsBlocked);
}

/// Promotion and kick enforce the single-host invariant (spec §8
/// "Single host").
#[tokio::test]
async fn kick_of_host_clears_host_and_denies_reentry() {
    let engine = engine();
    let (host_tx, _host_rx) = channel();
    let (room, decision) = engine
        .join(join_req("r5", "host", "s1", Role::Participant, true, host_tx))
        .await
        .unwrap();
    let JoinDecision::Joined(host_session) = decision else { panic!("expected joined") };
    assert_eq!(room.host_user_key().await.as_deref(), Some("host"));

    // A second admin admits themself by promotion, then kicks the first host.
    let (second_tx, _second_rx) = channel();
    room.allow_user("second".to_string()).await;
    let (_, decision) = engine
        .join(join_req("r5", "second", "s1", Role::Participant, false, second_tx))
        .await
        .unwrap();
    let JoinDecision::Joined(_) = decision else { panic!("expected joined") };

    engine.promote_host(&room, "host", "second").await.unwrap();
    assert_eq!(room.host_user_key().await.as_deref(), Some("second"));

    engine
        .kick_user(&room, "second", &host_session.user_id)
        .await
        .expect("current admin can kick the prior host");
    assert!(room.member(&host_session.user_id).await.is_none());

    // Kicked users are denied re-entry even if previously cleared.
    room.allow_user("host".to_string()).await;
    assert!(!room.is_allowed("host").await);
}

/// Invite-code rotation invalidates the old code (spec §8.6).
#[tokio::test]
async fn invite_code_rotation_invalidates_prior_code() {
    let engine = engine();
    let (host_tx, _host_rx) = channel();
    let (room, _) = engine
        .join(join_req("w6", "host", "s1", Role::Participant, true, host_tx))
        .await
        .unwrap();

    {
        let mut webinar = room.webinar.lock().await;
        webinar
            .apply_update(
                WebinarConfigUpdate {
                    enabled: Some(true),
                    public_access: Some(false),
                    locked: None,
                    max_attendees: Some(10),
                    invite_code: Some(Some("v1".to_string())),
                },
                SECRET,
            )
            .unwrap();
    }

    let (tx, _rx) = join_req_channel();
    let mut req = join_req("w6", "attendee-a", "s1", Role::WebinarAttendee, false, tx);
    req.presented_invite_code = Some("v1".to_string());
    let (_, decision) = engine.join(req).await.expect("v1 is valid");
    assert!(matches!(decision, JoinDecision::Joined(_)));

    {
        let mut webinar = room.webinar.lock().await;
        webinar
            .apply_update(
                WebinarConfigUpdate {
                    enabled: None,
                    public_access: None,
                    locked: None,
                    max_attendees: None,
                    invite_code: Some(Some("v2".to_string())),
                },
                SECRET,
            )
            .unwrap();
    }

    let (tx, _rx) = join_req_channel();
    let mut req = join_req("w6", "attendee-b", "s2", Role::WebinarAttendee, false, tx);
    req.presented_invite_code = Some("v1".to_string());
    let err = engine.join(req).await.unwrap_err();
    assert_eq!(err, ErrorKind::InvalidInviteCode);

    let (tx, _rx) = join_req_channel();
    let mut req = join_req("w6", "attendee-c", "s1", Role::WebinarAttendee, false, tx);
    req.presented_invite_code = Some("v2".to_string());
    let (_, decision) = engine.join(req).await.expect("v2 is valid");
    assert!(matches!(decision, JoinDecision::Joined(_)));
}

fn join_req_channel() -> (mpsc::Sender<ServerEvent>, mpsc::Receiver<ServerEvent>) {
    mpsc::channel(8)
}

/// Reconnection within the grace window resumes the same session rather
/// than creating a second member (spec §4.4 "Grace window"), going through
/// the real `join` path rather than calling `resume` directly — a second
/// `joinRoom` is exactly what a reconnecting client sends.
#[tokio::test]
async fn reconnect_within_grace_window_resumes_session() {
    let registry = Arc::new(RoomRegistry::new(media_engine(), true));
    let engine = Arc::new(AdmissionEngine::new(registry.clone(), SECRET.to_string(), Arc::new(AtomicBool::new(false)), 1000));

    let (tx, _rx) = channel();
    let (room, decision) = engine
        .join(join_req("r7", "alice", "s1", Role::Participant, true, tx))
        .await
        .unwrap();
    let JoinDecision::Joined(session) = decision else { panic!("expected joined") };
    assert!(!session.pending_reconsume.load(Ordering::SeqCst));

    engine
        .schedule_disconnect(
            room.clone(),
            registry,
            session.user_id.clone(),
            std::time::Duration::from_secs(30),
            std::time::Duration::from_secs(300),
            std::time::Duration::from_secs(60),
        )
        .await;

    // Reconnecting before the grace timer fires — same userKey/sessionId —
    // must cancel the timer and hand back the same session rather than
    // admitting a second member or letting the timer evict it later.
    let (new_tx, mut new_rx) = channel();
    let (room2, decision2) = engine
        .join(join_req("r7", "alice", "s1", Role::Participant, true, new_tx))
        .await
        .unwrap();
    let JoinDecision::Joined(resumed_session) = decision2 else { panic!("expected joined") };

    assert!(Arc::ptr_eq(&session, &resumed_session));
    assert!(resumed_session.pending_reconsume.load(Ordering::SeqCst));
    assert_eq!(room2.member_count().await, 1);
    assert_eq!(room2.host_user_key().await.as_deref(), Some("alice"));

    // The session now talks through the new connection's channel.
    room2.broadcast_all(ServerEvent::UserLeft { user_id: "probe".to_string() }).await;
    assert!(new_rx.recv().await.is_some());
}
