//! Router (C1) — per-room media-engine scope.

use std::sync::Arc;
use webrtc::api::API;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::RTCPeerConnection;

use super::transport::{Transport, TransportDirection};
use super::RtpCapabilities;
use crate::error::MediaEngineError;

/// A Router is the media-engine scope for one room: every
/// [`Transport`] created through it shares the same codec capabilities and
/// can be connected to each other (spec glossary: "Router").
pub struct Router {
    api: Arc<API>,
    rtc_config: RTCConfiguration,
}

impl Router {
    pub(super) fn new(api: Arc<API>, rtc_config: RTCConfiguration) -> Self {
        Self { api, rtc_config }
    }

    /// The RTP capabilities this router supports, handed to clients via
    /// `getRtpCapabilities` (spec §6).
    pub fn rtp_capabilities(&self) -> RtpCapabilities {
        RtpCapabilities {
            codecs: vec!["audio/opus".to_string(), "video/VP8".to_string()],
        }
    }

    /// Create a new transport scoped to this router.
    pub async fn create_transport(
        &self,
        direction: TransportDirection,
    ) -> Result<Transport, MediaEngineError> {
        let peer_connection: RTCPeerConnection = self
            .api
            .new_peer_connection(self.rtc_config.clone())
            .await
            .map_err(MediaEngineError::WebRtc)?;

        Ok(Transport::new(direction, Arc::new(peer_connection)))
    }

    /// Whether a remote producer's RTP parameters can be consumed given the
    /// requesting client's capabilities. The real engine negotiates codec
    /// intersection; this adapter checks for a non-empty overlap.
    pub fn can_consume(&self, requester_caps: &RtpCapabilities) -> bool {
        let supported = self.rtp_capabilities();
        requester_caps
            .codecs
            .iter()
            .any(|c| supported.codecs.contains(c))
    }
}
