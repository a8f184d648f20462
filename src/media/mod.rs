//! Media Engine Adapter (C1)
//!
//! Thin façade over the external media engine. Everything outside this
//! module talks to [`MediaEngine`]/[`Router`]/[`Transport`]/[`Producer`]/
//! [`Consumer`] handles — never to `webrtc`-crate types directly. That keeps
//! the SFU's room orchestration logic agnostic to which RTP engine backs it,
//! matching the "opaque Media Engine" framing in the spec.

mod router;
mod transport;

pub use router::Router;
pub use transport::{ConsumerHandle, ProducerHandle, Transport, TransportDirection};

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine as RtcMediaEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::rtp_transceiver::rtp_codec::{
    RTCRtpCodecCapability, RTCRtpCodecParameters, RTPCodecType,
};

use crate::error::MediaEngineError;

/// RTP media kind. Matches spec §3: `kind ∈ {audio, video}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Kind {
    Audio,
    Video,
}

impl From<Kind> for RTPCodecType {
    fn from(kind: Kind) -> Self {
        match kind {
            Kind::Audio => Self::Audio,
            Kind::Video => Self::Video,
        }
    }
}

/// Producer type. Matches spec §3: `type ∈ {webcam, screen}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProducerType {
    Webcam,
    Screen,
}

/// Key identifying a producer slot within a [`crate::session::ClientSession`].
/// A new produce on the same key replaces the prior entry (spec §3/§4.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProducerKey {
    pub kind: Kind,
    pub r#type: ProducerType,
}

/// Opaque ICE parameters handed back to the client on transport creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IceParameters {
    pub username_fragment: String,
    pub password: String,
}

/// Opaque ICE candidate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
}

/// Opaque DTLS parameters exchanged during `connectTransport`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DtlsParameters {
    pub role: String,
    pub fingerprint: String,
}

/// Opaque RTP capabilities advertised by a client / the router.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RtpCapabilities {
    pub codecs: Vec<String>,
}

/// Opaque RTP parameters describing an inbound produce.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RtpParameters {
    pub mid: Option<String>,
    pub encodings: Vec<String>,
}

/// Point-in-time counters for a producer or consumer (supplemental — see
/// SPEC_FULL §11).
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct MediaStats {
    pub packets: u64,
    pub bytes: u64,
}

/// Facade over the external media engine: creates routers (one per room),
/// WebRTC transports, and produce/consume handles.
///
/// A single [`MediaEngine`] instance is shared by the whole process; it
/// owns the codec-capable `webrtc` API but no room state whatsoever — room
/// state lives in [`crate::room::Room`].
pub struct MediaEngine {
    api: Arc<API>,
    ice_servers: Vec<RTCIceServer>,
}

impl MediaEngine {
    /// Build the adapter, registering the codec set the SFU forwards.
    pub fn new(
        stun_server: &str,
        turn_server: Option<&str>,
        turn_username: Option<&str>,
        turn_credential: Option<&str>,
    ) -> Result<Self, MediaEngineError> {
        let mut media_engine = RtcMediaEngine::default();

        media_engine
            .register_codec(
                RTCRtpCodecParameters {
                    capability: RTCRtpCodecCapability {
                        mime_type: "audio/opus".to_string(),
                        clock_rate: 48000,
                        channels: 2,
                        sdp_fmtp_line: "minptime=10;useinbandfec=1".to_string(),
                        rtcp_feedback: vec![],
                    },
                    payload_type: 111,
                    ..Default::default()
                },
                RTPCodecType::Audio,
            )
            .map_err(MediaEngineError::WebRtc)?;

        media_engine
            .register_codec(
                RTCRtpCodecParameters {
                    capability: RTCRtpCodecCapability {
                        mime_type: "video/VP8".to_string(),
                        clock_rate: 90000,
                        channels: 0,
                        sdp_fmtp_line: String::new(),
                        rtcp_feedback: vec![],
                    },
                    payload_type: 96,
                    ..Default::default()
                },
                RTPCodecType::Video,
            )
            .map_err(MediaEngineError::WebRtc)?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)
            .map_err(MediaEngineError::WebRtc)?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let mut ice_servers = vec![RTCIceServer {
            urls: vec![stun_server.to_string()],
            ..Default::default()
        }];
        if let Some(turn) = turn_server {
            ice_servers.push(RTCIceServer {
                urls: vec![turn.to_string()],
                username: turn_username.unwrap_or_default().to_string(),
                credential: turn_credential.unwrap_or_default().to_string(),
                ..Default::default()
            });
        }

        Ok(Self {
            api: Arc::new(api),
            ice_servers,
        })
    }

    /// Create a router scope for a newly created room. One router per room
    /// (spec glossary: "Router — media-engine scope within which producers
    /// and consumers can be connected; one per room").
    pub fn create_router(&self) -> Router {
        Router::new(self.api.clone(), self.rtc_configuration())
    }

    fn rtc_configuration(&self) -> RTCConfiguration {
        RTCConfiguration {
            ice_servers: self.ice_servers.clone(),
            ..Default::default()
        }
    }
}

/// Allocate a fresh random id for a transport/producer/consumer handle.
pub(crate) fn new_id() -> Uuid {
    Uuid::new_v4()
}
