//! Admission & Role Engine (C5)
//!
//! The join decision pipeline (spec §4.4) plus host lifecycle and the
//! grace-window reconnection machinery. Nothing here holds a room lock for
//! longer than a single `Room` method call — the pipeline is a sequence of
//! short, independently-awaited checks, not one big critical section.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::error::ErrorKind;
use crate::fanout;
use crate::room::{PendingClient, PendingDisconnect, Room, RoomRegistry};
use crate::session::{ClientSession, Role, UserId};
use crate::ws::ServerEvent;

/// Inputs for a join attempt (spec §4.4).
pub struct JoinRequest {
    pub client_id: String,
    pub room_id: String,
    pub user_key: String,
    pub session_id: String,
    pub display_name: Option<String>,
    pub role: Role,
    pub presented_invite_code: Option<String>,
    pub presented_signed_link: Option<String>,
    pub is_host_credential: bool,
    pub is_guest_identity: bool,
    pub signal_tx: mpsc::Sender<ServerEvent>,
}

pub enum JoinDecision {
    Joined(Arc<ClientSession>),
    Waiting,
}

/// Runs the short-circuiting admission pipeline from spec §4.4.
pub struct AdmissionEngine {
    registry: Arc<RoomRegistry>,
    sfu_secret: String,
    draining: Arc<std::sync::atomic::AtomicBool>,
    /// Non-webinar room size guard (SPEC_FULL §10.3). Webinar attendees are
    /// exempt — they're bounded separately by `webinar.max_attendees`.
    max_room_participants: usize,
}

impl AdmissionEngine {
    pub fn new(
        registry: Arc<RoomRegistry>,
        sfu_secret: String,
        draining: Arc<std::sync::atomic::AtomicBool>,
        max_room_participants: usize,
    ) -> Self {
        Self {
            registry,
            sfu_secret,
            draining,
            max_room_participants,
        }
    }

    pub async fn join(&self, req: JoinRequest) -> Result<(Arc<Room>, JoinDecision), ErrorKind> {
        // 1. Drain gate.
        if self.draining.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(ErrorKind::Draining);
        }

        // 2. Room resolution (creation gated by allowRoomCreation).
        let room = self.registry.get_or_create(&req.client_id, &req.room_id).await?;

        let user_id = UserId {
            user_key: req.user_key.clone(),
            session_id: req.session_id.clone(),
        };

        // 2a. Resume path: a reconnect presenting the same (userKey,
        // sessionId) as a pending disconnect cancels the grace timer and
        // hands the existing session its new connection's channel, rather
        // than running full admission again (spec §4.4 "Grace window":
        // "reconnection ... cancels the timer and resumes the session").
        if self.resume(&room, &user_id).await {
            if let Some(session) = room.member(&user_id).await {
                session.set_signal_tx(req.signal_tx.clone()).await;
                session.pending_reconsume.store(true, std::sync::atomic::Ordering::SeqCst);
                info!(channel_id = %room.channel_id, user_id = %user_id, "session resumed within grace window");
                return Ok((room, JoinDecision::Joined(session)));
            }
        }

        // 3. Role-specific preflight.
        match req.role {
            Role::WebinarAttendee => {
                let webinar = room.webinar.lock().await;
                if !webinar.enabled {
                    return Err(ErrorKind::WebinarDisabled);
                }
                if !webinar.public_access {
                    let link_ok = req
                        .presented_signed_link
                        .as_deref()
                        .is_some_and(|token| webinar.verify_signed_link(&self.sfu_secret, &req.client_id, &req.room_id, token));
                    let code_ok = req
                        .presented_invite_code
                        .as_deref()
                        .is_some_and(|code| webinar.verify_invite_code(&self.sfu_secret, code));
                    if !link_ok && !code_ok {
                        // Report the failure that matches what was actually
                        // presented (spec §8.6: a rejected invite code must
                        // surface `InvalidInviteCode`, not `InvalidSignedLink`).
                        return Err(if req.presented_invite_code.is_some() {
                            ErrorKind::InvalidInviteCode
                        } else {
                            ErrorKind::InvalidSignedLink
                        });
                    }
                }
                if room.attendee_count().await >= webinar.max_attendees as usize {
                    return Err(ErrorKind::AttendeeCapExceeded);
                }
                drop(webinar);

                // Attendees always admit once preflight passes — no
                // knocking (spec §4.4 step 3: "always admit (no knock)").
                let display_name = req.display_name.clone().unwrap_or_else(|| req.user_key.clone());
                let session = self.admit(&room, user_id, display_name, req.role, req.signal_tx).await;
                return Ok((room, JoinDecision::Joined(session)));
            }
            Role::Ghost => {
                if !req.is_host_credential {
                    return Err(ErrorKind::Forbidden);
                }
                if room.member_count().await >= self.max_room_participants {
                    return Err(ErrorKind::Forbidden);
                }
            }
            Role::Participant => {
                if room.member_count().await >= self.max_room_participants {
                    return Err(ErrorKind::Forbidden);
                }
                if room.no_guests().await && req.is_guest_identity {
                    return Err(ErrorKind::GuestsBlocked);
                }
                if room.requires_meeting_invite_code().await {
                    match req.presented_invite_code.as_deref() {
                        None => return Err(ErrorKind::InviteCodeRequired),
                        Some(code) => {
                            if !room.verify_meeting_invite_code(&self.sfu_secret, code).await {
                                return Err(ErrorKind::InvalidInviteCode);
                            }
                        }
                    }
                }
            }
        }

        let display_name = req.display_name.clone().unwrap_or_else(|| req.user_key.clone());

        // 4. Host path.
        if req.is_host_credential && req.role != Role::WebinarAttendee {
            let session = self.admit(&room, user_id, display_name, req.role, req.signal_tx).await;
            if room.host_user_key().await.is_none() {
                room.set_host_user_key(Some(req.user_key.clone())).await;
                room.cancel_cleanup().await;
                info!(channel_id = %room.channel_id, user_key = %req.user_key, "host assigned");
            }
            return Ok((room, JoinDecision::Joined(session)));
        }

        // 5. Pre-cleared path.
        if room.is_allowed(&req.user_key).await {
            let session = self.admit(&room, user_id, display_name, req.role, req.signal_tx).await;
            return Ok((room, JoinDecision::Joined(session)));
        }

        // 6. Locked room, not pre-cleared.
        if room.is_locked().await {
            return Err(ErrorKind::RoomLocked);
        }

        // 7. Knock path.
        room.add_pending(PendingClient {
            user_id: user_id.clone(),
            display_name: display_name.clone(),
            signal_tx: req.signal_tx.clone(),
        })
        .await;
        room.notify_admins(ServerEvent::PendingUserJoined {
            user_id: user_id.to_string(),
            display_name,
        })
        .await;
        Ok((room, JoinDecision::Waiting))
    }

    /// Instantiate and register the session (spec §4.4 step 8). Membership
    /// registration plus the `userJoined` broadcast happen here so every
    /// admission path — host, pre-cleared, or resolved knock — goes
    /// through one place.
    async fn admit(
        &self,
        room: &Room,
        user_id: UserId,
        display_name: String,
        role: Role,
        signal_tx: mpsc::Sender<ServerEvent>,
    ) -> Arc<ClientSession> {
        let session = Arc::new(ClientSession::new(user_id.clone(), display_name.clone(), role, signal_tx));
        room.set_display_name(user_id.user_key.clone(), display_name).await;
        room.add_member(session.clone()).await;
        room.broadcast_except(&user_id, ServerEvent::UserJoined { user_id: user_id.to_string() })
            .await;
        info!(channel_id = %room.channel_id, user_id = %user_id, "member admitted");
        Self::notify_membership_change(room, role).await;
        session
    }

    /// Recompute the active-speaker feed and, for webinar attendees,
    /// re-broadcast the live attendee count (spec §4.3 "Attendee
    /// counting", §4.6 "On membership change ... request C4 to refresh
    /// feed snapshot"). Called after every join, knock resolution, kick,
    /// and grace-window expiry.
    async fn notify_membership_change(room: &Room, role: Role) {
        fanout::refresh_feed_if_needed(room).await;
        if role == Role::WebinarAttendee {
            let webinar = room.webinar.lock().await;
            let max_attendees = webinar.max_attendees;
            drop(webinar);
            room.broadcast_all(ServerEvent::WebinarAttendeeCountChanged {
                room_id: room.room_id.clone(),
                attendee_count: room.attendee_count().await,
                max_attendees,
            })
            .await;
        }
    }

    /// Resolve a knock in the joiner's favor (spec §4.4 "admit(userKey)").
    pub async fn admit_pending(&self, room: &Room, user_key: &str) -> Result<Arc<ClientSession>, ErrorKind> {
        let pending = room.remove_pending(user_key).await.ok_or(ErrorKind::NotFound)?;
        let session = self
            .admit(room, pending.user_id.clone(), pending.display_name, Role::Participant, pending.signal_tx.clone())
            .await;
        let _ = pending
            .signal_tx
            .send(ServerEvent::UserJoined { user_id: pending.user_id.to_string() })
            .await;
        Ok(session)
    }

    /// `reject(userKey)` — purges the pending entry (spec §4.4).
    pub async fn reject_pending(&self, room: &Room, user_key: &str) -> Result<(), ErrorKind> {
        let pending = room.remove_pending(user_key).await.ok_or(ErrorKind::NotFound)?;
        let _ = pending
            .signal_tx
            .send(ServerEvent::Ack {
                id: 0,
                data: None,
                error: Some(ErrorKind::Forbidden),
            })
            .await;
        Ok(())
    }

    /// `promoteHost(targetUserKey)` — requires current admin, target must
    /// not be ghost/attendee (spec §4.4 "Host lifecycle").
    pub async fn promote_host(&self, room: &Room, requester_user_key: &str, target_user_key: &str) -> Result<(), ErrorKind> {
        if !room.is_admin(requester_user_key).await {
            return Err(ErrorKind::Forbidden);
        }
        let target_eligible = room
            .members_snapshot()
            .await
            .iter()
            .any(|s| s.user_id.user_key == target_user_key && !matches!(s.role, Role::Ghost | Role::WebinarAttendee));
        if !target_eligible {
            return Err(ErrorKind::Forbidden);
        }
        room.set_host_user_key(Some(target_user_key.to_string())).await;
        room.cancel_cleanup().await;
        Ok(())
    }

    /// `kickUser(userId)` — requires admin; closes target session and
    /// forbids re-entry (spec §4.4 "Host lifecycle").
    pub async fn kick_user(&self, room: &Room, requester_user_key: &str, target: &UserId) -> Result<(), ErrorKind> {
        if !room.is_admin(requester_user_key).await {
            return Err(ErrorKind::Forbidden);
        }
        if let Some(session) = room.remove_member(target).await {
            session.close().await;
            room.broadcast_all(ServerEvent::UserLeft { user_id: target.to_string() }).await;
            Self::gc_apps_awareness(room, &target.user_key).await;
            Self::notify_membership_change(room, session.role).await;
        }
        room.deny_reentry(&target.user_key).await;
        Ok(())
    }

    /// Clear a departed user's awareness state across every app document
    /// and broadcast the synthesized removal frames (spec §4.7: "on
    /// disconnect the room emits a synthesized removal update for every
    /// tracked clientId"). Shared by kick and grace-window expiry — both
    /// are a member actually leaving, not just a transient drop.
    async fn gc_apps_awareness(room: &Room, user_key: &str) {
        for (app_id, awareness_update) in room.apps.gc_user(user_key).await {
            room.broadcast_all(ServerEvent::AppsAwareness { app_id, awareness_update }).await;
        }
    }

    /// Schedule the grace-window teardown for a dropped socket (spec §4.4
    /// "Grace window"). Expiry triggers full removal; reconnection within
    /// the window cancels it via [`Self::resume`].
    pub async fn schedule_disconnect(
        &self,
        room: Arc<Room>,
        registry: Arc<RoomRegistry>,
        user_id: UserId,
        grace: Duration,
        admin_absence_grace: Duration,
        empty_room_grace: Duration,
    ) {
        let task_room = room.clone();
        let task_user_id = user_id.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            let channel_id = task_room.channel_id.clone();
            if let Some(session) = task_room.remove_member(&task_user_id).await {
                session.close().await;
                task_room
                    .broadcast_all(ServerEvent::UserLeft { user_id: task_user_id.to_string() })
                    .await;
                warn!(channel_id = %channel_id, user_id = %task_user_id, "grace window expired, session removed");
                Self::gc_apps_awareness(&task_room, &task_user_id.user_key).await;
                Self::notify_membership_change(&task_room, session.role).await;
            }
            if task_room.host_user_key().await.as_deref() == Some(task_user_id.user_key.as_str()) {
                task_room.set_host_user_key(None).await;
                task_room
                    .schedule_cleanup(admin_absence_grace, registry.clone(), channel_id.clone(), true)
                    .await;
            }
            if task_room.is_empty().await {
                task_room.schedule_cleanup(empty_room_grace, registry, channel_id, false).await;
            }
        });
        room.set_pending_disconnect(user_id, PendingDisconnect { task, epoch: 0 }).await;
    }

    /// Cancel a scheduled disconnect on reconnection within the grace
    /// window (spec §4.4: "reconnection ... cancels the timer and resumes
    /// the session").
    pub async fn resume(&self, room: &Room, user_id: &UserId) -> bool {
        room.cancel_pending_disconnect(user_id).await
    }
}
