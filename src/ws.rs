//! Wire types shared by the Signaling Dispatcher (C6) and Fan-Out (C7).
//!
//! Every inbound event carries an optional ack id; if present, exactly one
//! [`ServerEvent::Ack`] with that id is sent back (spec §4.5: "Every
//! mutating event MUST invoke its ack exactly once"). Fire-and-forget
//! notifications (reactions, chat, awareness) omit the id.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::apps::{AwarenessUpdate, SyncMessage};
use crate::error::ErrorKind;
use crate::media::{DtlsParameters, IceCandidate, Kind, ProducerType, RtpCapabilities, RtpParameters};
use crate::room::Quality;
use crate::session::Role;
use crate::webinar::WebinarConfigUpdate;

/// Envelope wrapping every inbound message.
#[derive(Debug, Clone, Deserialize)]
pub struct InboundMessage {
    /// Present when the sender expects an ack.
    pub id: Option<u64>,
    #[serde(flatten)]
    pub event: ClientEvent,
}

/// Client-to-server events (spec §6, "Inbound events").
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "camelCase")]
pub enum ClientEvent {
    JoinRoom {
        room_id: String,
        session_id: String,
        display_name: Option<String>,
        role: Role,
        is_host: Option<bool>,
        invite_code: Option<String>,
        signed_link: Option<String>,
    },
    GetRtpCapabilities,
    CreateProducerTransport,
    CreateConsumerTransport,
    ConnectTransport {
        transport_id: Uuid,
        dtls_parameters: DtlsParameters,
    },
    RestartIce {
        transport: TransportSide,
    },
    Produce {
        transport_id: Uuid,
        kind: Kind,
        #[serde(rename = "type")]
        producer_type: ProducerType,
        rtp_parameters: RtpParameters,
        paused: Option<bool>,
    },
    Consume {
        producer_id: Uuid,
        rtp_capabilities: RtpCapabilities,
    },
    ToggleMute {
        producer_id: Uuid,
        paused: bool,
    },
    ToggleCamera {
        producer_id: Uuid,
        paused: bool,
    },
    CloseProducer {
        producer_id: Uuid,
    },
    GetStats {
        id: Uuid,
    },
    SendChat {
        content: String,
    },
    SetHandRaised {
        raised: bool,
    },
    SendReaction {
        kind: ReactionKind,
        value: String,
        label: Option<String>,
    },
    AdmitUser {
        user_id: String,
    },
    RejectUser {
        user_id: String,
    },
    PromoteHost {
        user_id: String,
    },
    KickUser {
        user_id: String,
    },
    MuteAll,
    CloseAllVideo,
    SetTtsDisabled {
        disabled: bool,
    },
    SetRoomLocked {
        locked: bool,
    },
    SetChatLocked {
        locked: bool,
    },
    SetNoGuests {
        no_guests: bool,
    },
    UpdateMeetingConfig {
        invite_code: Option<String>,
    },
    UpdateWebinarConfig {
        update: WebinarConfigUpdate,
    },
    GenerateWebinarLink,
    RotateWebinarLink,
    #[serde(rename = "apps:open")]
    AppsOpen { app_id: String },
    #[serde(rename = "apps:close")]
    AppsClose,
    #[serde(rename = "apps:lock")]
    AppsLock { locked: bool },
    #[serde(rename = "apps:sync")]
    AppsSync { app_id: String, sync_message: SyncMessage },
    #[serde(rename = "apps:update")]
    AppsUpdate { app_id: String, update: Vec<u8> },
    #[serde(rename = "apps:awareness")]
    AppsAwareness {
        app_id: String,
        awareness_update: AwarenessUpdate,
        client_id: Option<u64>,
    },
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportSide {
    Producer,
    Consumer,
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReactionKind {
    Emoji,
    Asset,
}

/// Server-to-client events (spec §6, "Outbound notifications") plus the
/// ack envelope.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "camelCase")]
pub enum ServerEvent {
    Ack {
        id: u64,
        #[serde(skip_serializing_if = "Option::is_none")]
        data: Option<serde_json::Value>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<ErrorKind>,
    },
    UserJoined {
        user_id: String,
    },
    UserLeft {
        user_id: String,
    },
    PendingUserJoined {
        user_id: String,
        display_name: String,
    },
    NewProducer {
        producer_id: Uuid,
        producer_user_id: String,
        kind: Kind,
        #[serde(rename = "type")]
        producer_type: ProducerType,
    },
    ProducerClosed {
        producer_id: Uuid,
        producer_user_id: String,
    },
    ToggleMedia {
        producer_id: Uuid,
        paused: bool,
    },
    SetVideoQuality {
        quality: Quality,
    },
    HandRaised {
        user_id: String,
        raised: bool,
        timestamp: i64,
    },
    Reaction {
        user_id: String,
        kind: ReactionKind,
        value: String,
        label: Option<String>,
    },
    Chat {
        user_id: String,
        content: String,
        timestamp: i64,
    },
    DisplayName {
        user_key: String,
        display_name: String,
    },
    #[serde(rename = "webinar:configChanged")]
    WebinarConfigChanged {
        room_id: String,
        link_version: u64,
    },
    #[serde(rename = "webinar:attendeeCountChanged")]
    WebinarAttendeeCountChanged {
        room_id: String,
        attendee_count: usize,
        max_attendees: u32,
    },
    #[serde(rename = "webinar:feedChanged")]
    WebinarFeedChanged {
        room_id: String,
        speaker_user_id: Option<String>,
        producers: Vec<Uuid>,
    },
    #[serde(rename = "apps:state")]
    AppsState {
        active_app_id: Option<String>,
        locked: bool,
    },
    #[serde(rename = "apps:update")]
    AppsUpdate { app_id: String, update: Vec<u8> },
    #[serde(rename = "apps:awareness")]
    AppsAwareness {
        app_id: String,
        awareness_update: AwarenessUpdate,
    },
    ServerRestarting {
        message: String,
        reconnecting: bool,
    },
    Ice {
        transport: TransportSide,
        candidate: IceCandidate,
    },
}

impl ServerEvent {
    pub fn ack_ok(id: u64, data: serde_json::Value) -> Self {
        Self::Ack {
            id,
            data: Some(data),
            error: None,
        }
    }

    pub fn ack_err(id: u64, error: ErrorKind) -> Self {
        Self::Ack {
            id,
            data: None,
            error: Some(error),
        }
    }
}
