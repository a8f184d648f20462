//! Signaling Dispatcher (C6)
//!
//! The axum WebSocket upgrade handler and the per-event multiplexer with
//! ack semantics (spec §4.5). Mirrors the teacher's `ws/mod.rs` split:
//! socket split into sender/receiver halves, an mpsc channel fans
//! server-originated events (including those from other rooms' fan-out
//! tasks) into the write half, and the read half is a plain dispatch loop.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::Response;
use futures::{SinkExt, StreamExt};
use serde_json::json;
use tokio::sync::mpsc;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::admission::{AdmissionEngine, JoinDecision, JoinRequest};
use crate::apps::{AwarenessUpdate, SyncMessage};
use crate::config::Config;
use crate::drain::DrainManager;
use crate::error::ErrorKind;
use crate::fanout;
use crate::media::{MediaEngine, ProducerKey, TransportDirection};
use crate::ratelimit::RateLimiter;
use crate::room::{Room, RoomRegistry};
use crate::session::{ClientSession, Role, UserId};
use crate::webinar::WebinarConfigUpdate;
use crate::ws::{ClientEvent, InboundMessage, ReactionKind, ServerEvent, TransportSide};

/// Shared process state handed to every connection (mirrors the teacher's
/// `AppState`, minus the database/auth layers this core doesn't own).
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<RoomRegistry>,
    pub config: Arc<Config>,
    pub admission: Arc<AdmissionEngine>,
    pub drain: Arc<DrainManager>,
    pub join_limiter: Arc<RateLimiter>,
    pub chat_limiter: Arc<RateLimiter>,
}

impl AppState {
    pub fn new(config: Arc<Config>, media_engine: MediaEngine, drain: Arc<DrainManager>) -> Self {
        let registry = Arc::new(RoomRegistry::new(media_engine, config.allow_room_creation));
        let admission = Arc::new(AdmissionEngine::new(
            registry.clone(),
            config.sfu_secret.clone(),
            drain.flag(),
            config.max_room_participants,
        ));
        Self {
            registry,
            config,
            admission,
            drain,
            join_limiter: Arc::new(RateLimiter::new(5, 0.5)),
            chat_limiter: Arc::new(RateLimiter::new(10, 1.0)),
        }
    }
}

/// Per-connection context established once `joinRoom` succeeds.
struct ConnectionState {
    room: Option<Arc<Room>>,
    session: Option<Arc<ClientSession>>,
    user_id: Option<UserId>,
    /// Handed off to the `ClientSession` on a successful join, so a forced
    /// drain or kick can later signal `handle_socket`'s read loop to exit
    /// (spec §4.8 "disconnect all sockets"). `None` once taken.
    disconnect_tx: Option<tokio::sync::oneshot::Sender<()>>,
}

impl ConnectionState {
    fn new(disconnect_tx: tokio::sync::oneshot::Sender<()>) -> Self {
        Self {
            room: None,
            session: None,
            user_id: None,
            disconnect_tx: Some(disconnect_tx),
        }
    }

    fn require(&self) -> Result<(&Arc<Room>, &Arc<ClientSession>, &UserId), ErrorKind> {
        match (&self.room, &self.session, &self.user_id) {
            (Some(room), Some(session), Some(user_id)) => Ok((room, session, user_id)),
            _ => Err(ErrorKind::Forbidden),
        }
    }
}

pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (mut sender, mut receiver) = socket.split();
    let (tx, mut rx) = mpsc::channel::<ServerEvent>(128);
    let (disconnect_tx, mut disconnect_rx) = tokio::sync::oneshot::channel::<()>();

    let writer = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            let Ok(json) = serde_json::to_string(&event) else {
                warn!("failed to serialize outbound event");
                continue;
            };
            if sender.send(Message::Text(json.into())).await.is_err() {
                break;
            }
        }
    });

    let mut conn = ConnectionState::new(disconnect_tx);

    loop {
        let msg = tokio::select! {
            msg = receiver.next() => msg,
            _ = &mut disconnect_rx => {
                info!("connection closed by server (kick or drain)");
                break;
            }
        };
        let Some(Ok(msg)) = msg else { break };
        let Message::Text(text) = msg else { continue };
        let inbound: InboundMessage = match serde_json::from_str(&text) {
            Ok(m) => m,
            Err(e) => {
                debug!(error = %e, "malformed inbound message");
                continue;
            }
        };

        let ack_id = inbound.id;
        match dispatch(&state, &mut conn, inbound.event, &tx).await {
            Ok(data) => {
                if let Some(id) = ack_id {
                    let _ = tx.send(ServerEvent::ack_ok(id, data)).await;
                }
            }
            Err(err) => {
                if let Some(id) = ack_id {
                    let _ = tx.send(ServerEvent::ack_err(id, err)).await;
                }
            }
        }
    }

    // Socket dropped: schedule the grace-window teardown rather than
    // tearing the session down immediately (spec §4.4 "Grace window").
    if let (Some(room), Some(user_id)) = (conn.room.clone(), conn.user_id.clone()) {
        state
            .admission
            .schedule_disconnect(
                room,
                state.registry.clone(),
                user_id,
                std::time::Duration::from_millis(state.config.disconnect_grace_ms),
                std::time::Duration::from_millis(state.config.admin_absence_grace_ms),
                std::time::Duration::from_millis(state.config.empty_room_grace_ms),
            )
            .await;
    }

    writer.abort();
}

/// Route one inbound event. Returns the ack payload on success (ignored by
/// the caller for fire-and-forget events whose `id` is absent).
#[instrument(skip(state, conn, tx, event))]
async fn dispatch(
    state: &AppState,
    conn: &mut ConnectionState,
    event: ClientEvent,
    tx: &mpsc::Sender<ServerEvent>,
) -> Result<serde_json::Value, ErrorKind> {
    match event {
        ClientEvent::JoinRoom {
            room_id,
            session_id,
            display_name,
            role,
            is_host,
            invite_code,
            signed_link,
        } => handle_join_room(state, conn, room_id, session_id, display_name, role, is_host, invite_code, signed_link, tx).await,

        ClientEvent::GetRtpCapabilities => {
            let (room, _, _) = conn.require()?;
            Ok(json!(room.router.rtp_capabilities()))
        }

        ClientEvent::CreateProducerTransport => create_transport(conn, TransportDirection::Producer).await,
        ClientEvent::CreateConsumerTransport => create_transport(conn, TransportDirection::Consumer).await,

        ClientEvent::ConnectTransport { transport_id, dtls_parameters } => {
            let (_, session, _) = conn.require()?;
            let transport = session.transport_by_id(transport_id).await.ok_or(ErrorKind::TransportNotFound)?;
            transport.connect(dtls_parameters).await.map_err(ErrorKind::from)?;
            Ok(json!({}))
        }

        ClientEvent::RestartIce { transport } => {
            let (_, session, _) = conn.require()?;
            let direction = transport_side_to_direction(transport);
            let handle = session.transport(direction).await.ok_or(ErrorKind::TransportNotFound)?;
            let params = handle.restart_ice().await.map_err(ErrorKind::from)?;
            Ok(json!(params))
        }

        ClientEvent::Produce {
            transport_id,
            kind,
            producer_type,
            rtp_parameters,
            paused,
        } => handle_produce(conn, transport_id, kind, producer_type, rtp_parameters, paused.unwrap_or(false)).await,

        ClientEvent::Consume { producer_id, rtp_capabilities } => handle_consume(conn, producer_id, rtp_capabilities).await,

        ClientEvent::ToggleMute { producer_id, paused } => handle_toggle(conn, producer_id, paused).await,
        ClientEvent::ToggleCamera { producer_id, paused } => handle_toggle(conn, producer_id, paused).await,

        ClientEvent::CloseProducer { producer_id } => {
            let (room, session, user_id) = conn.require()?;
            if let Some(key) = session.close_producer(producer_id).await {
                if key.r#type == crate::media::ProducerType::Screen {
                    room.release_screen_lease(producer_id).await;
                }
                fanout::on_producer_closed(room, user_id, producer_id).await;
            }
            Ok(json!({}))
        }

        ClientEvent::GetStats { id } => {
            let (_, session, _) = conn.require()?;
            let stats = session.stats_for(id).await.ok_or(ErrorKind::NotFound)?;
            Ok(json!(stats))
        }

        ClientEvent::SendChat { content } => {
            let (room, _, user_id) = conn.require()?;
            if !state.chat_limiter.try_acquire(&user_id.user_key) {
                return Ok(json!({"throttled": true}));
            }
            room.broadcast_all(ServerEvent::Chat {
                user_id: user_id.to_string(),
                content,
                timestamp: wall_clock_millis(),
            })
            .await;
            Ok(json!({}))
        }

        ClientEvent::SetHandRaised { raised } => {
            let (room, _, user_id) = conn.require()?;
            room.set_hand_raised(user_id.clone(), raised).await;
            room.broadcast_all(ServerEvent::HandRaised {
                user_id: user_id.to_string(),
                raised,
                timestamp: wall_clock_millis(),
            })
            .await;
            Ok(json!({}))
        }

        ClientEvent::SendReaction { kind, value, label } => {
            let (room, _, user_id) = conn.require()?;
            room.broadcast_all(ServerEvent::Reaction {
                user_id: user_id.to_string(),
                kind,
                value,
                label,
            })
            .await;
            Ok(json!({}))
        }

        ClientEvent::AdmitUser { user_id: target } => {
            let (room, _, user_id) = conn.require()?;
            require_admin(room, &user_id.user_key).await?;
            state.admission.admit_pending(room, &target).await?;
            Ok(json!({}))
        }

        ClientEvent::RejectUser { user_id: target } => {
            let (room, _, user_id) = conn.require()?;
            require_admin(room, &user_id.user_key).await?;
            state.admission.reject_pending(room, &target).await?;
            Ok(json!({}))
        }

        ClientEvent::PromoteHost { user_id: target } => {
            let (room, _, user_id) = conn.require()?;
            state.admission.promote_host(room, &user_id.user_key, &target).await?;
            Ok(json!({}))
        }

        ClientEvent::KickUser { user_id: target } => {
            let (room, _, user_id) = conn.require()?;
            let target_id = room
                .members_snapshot()
                .await
                .into_iter()
                .find(|m| m.user_id.user_key == target)
                .map(|m| m.user_id.clone())
                .ok_or(ErrorKind::NotFound)?;
            state.admission.kick_user(room, &user_id.user_key, &target_id).await?;
            Ok(json!({}))
        }

        ClientEvent::MuteAll => {
            let (room, _, user_id) = conn.require()?;
            require_admin(room, &user_id.user_key).await?;
            for member in room.members_snapshot().await {
                if member.user_id == *user_id {
                    continue;
                }
                if let Some(transport) = member.transport(TransportDirection::Producer).await {
                    for producer in member.producers_snapshot().await {
                        if producer.kind() == crate::media::Kind::Audio {
                            let _ = transport.pause_producer(producer.id, true).await;
                            fanout::on_producer_paused(room, &member.user_id, producer.id, true).await;
                        }
                    }
                }
            }
            Ok(json!({}))
        }

        ClientEvent::CloseAllVideo => {
            let (room, _, user_id) = conn.require()?;
            require_admin(room, &user_id.user_key).await?;
            for member in room.members_snapshot().await {
                if let Some(transport) = member.transport(TransportDirection::Producer).await {
                    for producer in member.producers_snapshot().await {
                        if producer.kind() == crate::media::Kind::Video {
                            transport.close_producer(producer.id).await;
                            fanout::on_producer_closed(room, &member.user_id, producer.id).await;
                        }
                    }
                }
            }
            Ok(json!({}))
        }

        ClientEvent::SetTtsDisabled { disabled } => {
            let (room, _, user_id) = conn.require()?;
            require_admin(room, &user_id.user_key).await?;
            room.set_tts_disabled(disabled).await;
            Ok(json!({}))
        }
        ClientEvent::SetRoomLocked { locked } => {
            let (room, _, user_id) = conn.require()?;
            require_admin(room, &user_id.user_key).await?;
            room.set_locked(locked).await;
            Ok(json!({}))
        }
        ClientEvent::SetChatLocked { locked } => {
            let (room, _, user_id) = conn.require()?;
            require_admin(room, &user_id.user_key).await?;
            room.set_chat_locked(locked).await;
            Ok(json!({}))
        }
        ClientEvent::SetNoGuests { no_guests } => {
            let (room, _, user_id) = conn.require()?;
            require_admin(room, &user_id.user_key).await?;
            room.set_no_guests(no_guests).await;
            Ok(json!({}))
        }

        ClientEvent::UpdateMeetingConfig { invite_code } => {
            let (room, _, user_id) = conn.require()?;
            require_admin(room, &user_id.user_key).await?;
            room.set_meeting_invite_code(&state.config.sfu_secret, invite_code).await;
            Ok(json!({}))
        }

        ClientEvent::UpdateWebinarConfig { update } => handle_webinar_update(state, conn, update).await,

        ClientEvent::GenerateWebinarLink => {
            let (room, _, user_id) = conn.require()?;
            require_admin(room, &user_id.user_key).await?;
            let webinar = room.webinar.lock().await;
            let link = webinar.generate_link(&state.config.webinar_base_url, &room.client_id, &room.room_id, &state.config.sfu_secret)?;
            Ok(json!({ "link": link }))
        }

        ClientEvent::RotateWebinarLink => {
            let (room, _, user_id) = conn.require()?;
            require_admin(room, &user_id.user_key).await?;
            let mut webinar = room.webinar.lock().await;
            webinar.rotate_link();
            let link_version = webinar.link_version;
            drop(webinar);
            room.broadcast_all(ServerEvent::WebinarConfigChanged {
                room_id: room.room_id.clone(),
                link_version,
            })
            .await;
            Ok(json!({ "linkVersion": link_version }))
        }

        ClientEvent::AppsOpen { app_id } => {
            let (room, _, user_id) = conn.require()?;
            if room.apps.is_locked().await {
                require_admin(room, &user_id.user_key).await?;
            }
            let (active_app_id, locked) = room.apps.open(app_id).await;
            room.broadcast_all(ServerEvent::AppsState { active_app_id, locked }).await;
            Ok(json!({}))
        }

        ClientEvent::AppsClose => {
            let (room, _, user_id) = conn.require()?;
            if room.apps.is_locked().await {
                require_admin(room, &user_id.user_key).await?;
            }
            let (active_app_id, locked, removal) = room.apps.close().await;
            if let Some((closed_app_id, awareness_update)) = removal {
                room.broadcast_all(ServerEvent::AppsAwareness {
                    app_id: closed_app_id,
                    awareness_update,
                })
                .await;
            }
            room.broadcast_all(ServerEvent::AppsState { active_app_id, locked }).await;
            Ok(json!({}))
        }

        ClientEvent::AppsLock { locked } => {
            let (room, _, user_id) = conn.require()?;
            require_admin(room, &user_id.user_key).await?;
            room.apps.set_locked(locked).await;
            let (active_app_id, locked) = room.apps.state().await;
            room.broadcast_all(ServerEvent::AppsState { active_app_id, locked }).await;
            Ok(json!({}))
        }

        ClientEvent::AppsSync { app_id, sync_message } => {
            let (room, _, _) = conn.require()?;
            let (state_vector, awareness) = room.apps.sync(&app_id, sync_message).await?;
            Ok(json!({
                "syncMessage": state_vector,
                "awarenessUpdate": awareness,
            }))
        }

        ClientEvent::AppsUpdate { app_id, update } => {
            let (room, _, user_id) = conn.require()?;
            room.apps.apply_update(&app_id, update.clone()).await?;
            room.broadcast_except(user_id, ServerEvent::AppsUpdate { app_id, update }).await;
            Ok(json!({}))
        }

        ClientEvent::AppsAwareness {
            app_id,
            awareness_update,
            client_id,
        } => {
            let (room, _, user_id) = conn.require()?;
            room.apps.apply_awareness(&app_id, user_id, client_id, awareness_update.clone()).await?;
            room.broadcast_except(
                user_id,
                ServerEvent::AppsAwareness {
                    app_id,
                    awareness_update,
                },
            )
            .await;
            Ok(json!({}))
        }
    }
}

async fn require_admin(room: &Room, user_key: &str) -> Result<(), ErrorKind> {
    if room.is_admin(user_key).await {
        Ok(())
    } else {
        Err(ErrorKind::Forbidden)
    }
}

fn transport_side_to_direction(side: TransportSide) -> TransportDirection {
    match side {
        TransportSide::Producer => TransportDirection::Producer,
        TransportSide::Consumer => TransportDirection::Consumer,
    }
}

async fn create_transport(conn: &mut ConnectionState, direction: TransportDirection) -> Result<serde_json::Value, ErrorKind> {
    let (room, session, _) = conn.require()?;
    let transport = session.create_transport(&room.router, direction).await?;
    let (ice_parameters, dtls_parameters) = transport.connection_params();
    Ok(json!({
        "id": transport.id,
        "iceParameters": ice_parameters,
        "dtlsParameters": dtls_parameters,
    }))
}

async fn handle_produce(
    conn: &mut ConnectionState,
    transport_id: Uuid,
    kind: crate::media::Kind,
    producer_type: crate::media::ProducerType,
    rtp_parameters: crate::media::RtpParameters,
    paused: bool,
) -> Result<serde_json::Value, ErrorKind> {
    let (room, session, user_id) = conn.require()?;
    let key = ProducerKey { kind, r#type: producer_type };

    let producer = session.produce(transport_id, key, rtp_parameters, paused).await?;

    if producer_type == crate::media::ProducerType::Screen {
        if let Err(e) = room.acquire_screen_lease(user_id.clone(), producer.id).await {
            session.close_producer(producer.id).await;
            return Err(e);
        }
    }

    fanout::on_new_producer(room, user_id, producer.id, kind, producer_type).await;
    Ok(json!({ "id": producer.id }))
}

async fn handle_consume(
    conn: &mut ConnectionState,
    producer_id: Uuid,
    rtp_capabilities: crate::media::RtpCapabilities,
) -> Result<serde_json::Value, ErrorKind> {
    let (room, session, _) = conn.require()?;
    let mut producer_kind = None;
    for member in room.members_snapshot().await {
        if let Some(p) = member.producer_by_id(producer_id).await {
            producer_kind = Some(p.kind());
            break;
        }
    }
    let producer_kind = producer_kind.ok_or(ErrorKind::NotFound)?;
    let consumer = session.consume(producer_id, producer_kind, &rtp_capabilities, &room.router).await?;
    Ok(json!({
        "id": consumer.id,
        "producerId": producer_id,
        "kind": producer_kind,
    }))
}

async fn handle_toggle(conn: &mut ConnectionState, producer_id: Uuid, paused: bool) -> Result<serde_json::Value, ErrorKind> {
    let (room, session, user_id) = conn.require()?;
    session.toggle_producer_pause(producer_id, paused).await?;
    fanout::on_producer_paused(room, user_id, producer_id, paused).await;
    Ok(json!({}))
}

async fn handle_webinar_update(
    state: &AppState,
    conn: &mut ConnectionState,
    update: WebinarConfigUpdate,
) -> Result<serde_json::Value, ErrorKind> {
    let (room, _, user_id) = conn.require()?;
    require_admin(room, &user_id.user_key).await?;
    let mut webinar = room.webinar.lock().await;
    webinar.apply_update(update, &state.config.sfu_secret)?;
    let link_version = webinar.link_version;
    drop(webinar);
    room.broadcast_all(ServerEvent::WebinarConfigChanged {
        room_id: room.room_id.clone(),
        link_version,
    })
    .await;
    Ok(json!({}))
}

#[allow(clippy::too_many_arguments)]
async fn handle_join_room(
    state: &AppState,
    conn: &mut ConnectionState,
    room_id: String,
    session_id: String,
    display_name: Option<String>,
    role: Role,
    is_host: Option<bool>,
    invite_code: Option<String>,
    signed_link: Option<String>,
    tx: &mpsc::Sender<ServerEvent>,
) -> Result<serde_json::Value, ErrorKind> {
    let user_key = display_name.clone().unwrap_or_else(|| session_id.clone());
    if !state.join_limiter.try_acquire(&user_key) {
        return Err(ErrorKind::Timeout);
    }

    let req = JoinRequest {
        client_id: state.config.instance_id.clone(),
        room_id: room_id.clone(),
        user_key: user_key.clone(),
        session_id,
        display_name,
        role,
        presented_invite_code: invite_code,
        presented_signed_link: signed_link,
        is_host_credential: is_host.unwrap_or(false),
        // Guest-ness is a property of the identity itself (spec §3:
        // `userKey` is "... or `guest-<sessionId>`"), not of whether this
        // particular join presents a host credential.
        is_guest_identity: user_key.starts_with("guest-"),
        signal_tx: tx.clone(),
    };

    let (room, decision) = state.admission.join(req).await?;

    match decision {
        JoinDecision::Joined(session) => {
            conn.user_id = Some(session.user_id.clone());
            conn.room = Some(room.clone());
            conn.session = Some(session.clone());
            if let Some(disconnect_tx) = conn.disconnect_tx.take() {
                session.set_disconnect_signal(disconnect_tx);
            }

            fanout::refresh_quality_target(&room, state.config.quality_low_threshold, state.config.quality_standard_threshold).await;

            let producers: Vec<_> = {
                let mut out = Vec::new();
                for member in room.members_snapshot().await {
                    if member.user_id == session.user_id {
                        continue;
                    }
                    for p in member.producers_snapshot().await {
                        out.push(json!({
                            "producerId": p.id,
                            "producerUserId": member.user_id.to_string(),
                            "kind": p.kind(),
                            "type": p.producer_type(),
                        }));
                    }
                }
                out
            };

            info!(channel_id = %room.channel_id, user_id = %session.user_id, "joined");
            Ok(json!({
                "status": "joined",
                "rtpCapabilities": room.router.rtp_capabilities(),
                "producers": producers,
            }))
        }
        JoinDecision::Waiting => Ok(json!({ "status": "waiting" })),
    }
}

fn wall_clock_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
