//! Client Session (C2)
//!
//! Per-peer state: socket handle, role, owned transports, owned producers,
//! owned consumers, mute/camera flags (spec §3/§4.1).

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::{mpsc, oneshot, RwLock};
use uuid::Uuid;

use crate::error::ErrorKind;
use crate::media::{
    ConsumerHandle, Kind, ProducerHandle, ProducerKey, ProducerType, Router, RtpCapabilities,
    RtpParameters, Transport, TransportDirection,
};
use crate::ws::ServerEvent;

/// A participant's role within a room. Host-ness is a *Room* attribute
/// (§4.4/§9: "Admin-ness is a Room attribute, not a type"), orthogonal to
/// this tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Participant,
    Ghost,
    WebinarAttendee,
}

/// Stable identity for a `(userKey, sessionId)` pair, per spec §3.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct UserId {
    pub user_key: String,
    pub session_id: String,
}

impl std::fmt::Display for UserId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}#{}", self.user_key, self.session_id)
    }
}

/// Per-peer state owned by a [`crate::room::Room`].
pub struct ClientSession {
    pub user_id: UserId,
    pub display_name: String,
    pub role: Role,
    /// Reassigned on reconnect (spec §4.4 "Grace window"), so this has to
    /// be mutable rather than the plain field a fresh session starts with.
    signal_tx: RwLock<mpsc::Sender<ServerEvent>>,

    /// Fires to tell this session's socket read loop to exit (drain/kick).
    /// `None` once consumed or if the session was never wired to a live
    /// connection (e.g. constructed directly in tests).
    disconnect: StdMutex<Option<oneshot::Sender<()>>>,

    producer_transport: RwLock<Option<Arc<Transport>>>,
    consumer_transport: RwLock<Option<Arc<Transport>>>,

    /// `(kind, type) -> producer`. A new produce on an occupied key closes
    /// and replaces the prior entry (spec §3).
    producers: RwLock<HashMap<ProducerKey, Arc<ProducerHandle>>>,

    /// `remote producerId -> consumer`. Invariant: at most one entry per
    /// remote producer (spec §8 "Consumer uniqueness").
    consumers: RwLock<HashMap<Uuid, Arc<ConsumerHandle>>>,

    is_muted: AtomicBool,
    is_camera_off: AtomicBool,

    /// Set by the admission engine on reconnection when the underlying
    /// socket changed but the session was resumed within the grace window;
    /// tells the dispatcher to ask the client to re-`consume` everything
    /// rather than assume its consumers survived (SPEC_FULL §12).
    pub pending_reconsume: AtomicBool,
}

impl ClientSession {
    pub fn new(
        user_id: UserId,
        display_name: String,
        role: Role,
        signal_tx: mpsc::Sender<ServerEvent>,
    ) -> Self {
        Self {
            user_id,
            display_name,
            role,
            signal_tx: RwLock::new(signal_tx),
            disconnect: StdMutex::new(None),
            producer_transport: RwLock::new(None),
            consumer_transport: RwLock::new(None),
            producers: RwLock::new(HashMap::new()),
            consumers: RwLock::new(HashMap::new()),
            is_muted: AtomicBool::new(false),
            is_camera_off: AtomicBool::new(false),
            pending_reconsume: AtomicBool::new(false),
        }
    }

    pub fn is_muted(&self) -> bool {
        self.is_muted.load(Ordering::SeqCst)
    }

    pub async fn signal_tx(&self) -> mpsc::Sender<ServerEvent> {
        self.signal_tx.read().await.clone()
    }

    /// Point this session at a new connection's outbound channel (spec
    /// §4.4 "reconnection ... resumes the session" — the resumed session
    /// keeps its identity but its socket is new).
    pub async fn set_signal_tx(&self, signal_tx: mpsc::Sender<ServerEvent>) {
        *self.signal_tx.write().await = signal_tx;
    }

    /// Wire up the trigger the owning connection's read loop waits on so a
    /// forced close (kick, drain) can end it (spec §4.8 "disconnect all
    /// sockets"). Replacing a prior signal (e.g. on resume) silently drops
    /// it, which is harmless since the old connection's loop has already
    /// exited by the time a new one reconnects.
    pub fn set_disconnect_signal(&self, signal: oneshot::Sender<()>) {
        *self.disconnect.lock().unwrap() = Some(signal);
    }

    fn disconnect_socket(&self) {
        if let Some(signal) = self.disconnect.lock().unwrap().take() {
            let _ = signal.send(());
        }
    }

    pub fn is_camera_off(&self) -> bool {
        self.is_camera_off.load(Ordering::SeqCst)
    }

    /// `createProducerTransport` / `createConsumerTransport`.
    pub async fn create_transport(
        &self,
        router: &Router,
        direction: TransportDirection,
    ) -> Result<Arc<Transport>, ErrorKind> {
        let slot = match direction {
            TransportDirection::Producer => &self.producer_transport,
            TransportDirection::Consumer => &self.consumer_transport,
        };

        if slot.read().await.is_some() {
            return Err(ErrorKind::TransportExhausted);
        }

        let transport = Arc::new(
            router
                .create_transport(direction)
                .await
                .map_err(|_| ErrorKind::MediaEngineError)?,
        );
        *slot.write().await = Some(transport.clone());
        Ok(transport)
    }

    pub async fn transport(&self, direction: TransportDirection) -> Option<Arc<Transport>> {
        match direction {
            TransportDirection::Producer => self.producer_transport.read().await.clone(),
            TransportDirection::Consumer => self.consumer_transport.read().await.clone(),
        }
    }

    /// Resolve whichever owned transport matches `transport_id`.
    pub async fn transport_by_id(&self, transport_id: Uuid) -> Option<Arc<Transport>> {
        if let Some(t) = self.producer_transport.read().await.clone() {
            if t.id == transport_id {
                return Some(t);
            }
        }
        if let Some(t) = self.consumer_transport.read().await.clone() {
            if t.id == transport_id {
                return Some(t);
            }
        }
        None
    }

    /// `produce{transportId, kind, rtpParameters, appData{type, paused}}`.
    ///
    /// Screen-share lease acquisition is the caller's responsibility
    /// ([`crate::room::Room::acquire_screen_lease`]) — it must happen
    /// atomically with registration so the exclusivity invariant never
    /// has a window where two screen producers both exist (spec §4.1/§8).
    pub async fn produce(
        &self,
        transport_id: Uuid,
        key: ProducerKey,
        rtp_parameters: RtpParameters,
        start_paused: bool,
    ) -> Result<Arc<ProducerHandle>, ErrorKind> {
        let transport = self
            .transport_by_id(transport_id)
            .await
            .filter(|t| t.direction == TransportDirection::Producer)
            .ok_or(ErrorKind::TransportNotFound)?;

        let producer = transport
            .produce(key, rtp_parameters)
            .await
            .map_err(|_| ErrorKind::MediaEngineError)?;

        if start_paused {
            transport
                .pause_producer(producer.id, true)
                .await
                .map_err(|_| ErrorKind::MediaEngineError)?;
        }

        // Replace-on-same-key: close whatever was there before inserting.
        let previous = self.producers.write().await.insert(key, producer.clone());
        if let Some(prev) = previous {
            let _ = transport.close_producer(prev.id).await;
        }

        if key.r#type == ProducerType::Webcam {
            match key.kind {
                Kind::Audio => self.is_muted.store(start_paused, Ordering::SeqCst),
                Kind::Video => self.is_camera_off.store(start_paused, Ordering::SeqCst),
            }
        }

        Ok(producer)
    }

    pub async fn producer(&self, key: ProducerKey) -> Option<Arc<ProducerHandle>> {
        self.producers.read().await.get(&key).cloned()
    }

    pub async fn producer_by_id(&self, producer_id: Uuid) -> Option<Arc<ProducerHandle>> {
        self.producers
            .read()
            .await
            .values()
            .find(|p| p.id == producer_id)
            .cloned()
    }

    pub async fn producers_snapshot(&self) -> Vec<Arc<ProducerHandle>> {
        self.producers.read().await.values().cloned().collect()
    }

    /// `closeProducer{producerId}`. Idempotent (spec §4.1).
    pub async fn close_producer(&self, producer_id: Uuid) -> Option<ProducerKey> {
        let transport = self.producer_transport.read().await.clone();
        let mut producers = self.producers.write().await;
        let key = producers
            .iter()
            .find(|(_, p)| p.id == producer_id)
            .map(|(k, _)| *k)?;
        producers.remove(&key);
        drop(producers);
        if let Some(t) = transport {
            t.close_producer(producer_id).await;
        }
        Some(key)
    }

    /// `toggleMute{producerId, paused}` / `toggleCamera{producerId, paused}`.
    pub async fn toggle_producer_pause(
        &self,
        producer_id: Uuid,
        paused: bool,
    ) -> Result<ProducerKey, ErrorKind> {
        let transport = self
            .producer_transport
            .read()
            .await
            .clone()
            .ok_or(ErrorKind::TransportNotFound)?;
        let key = {
            let producers = self.producers.read().await;
            producers
                .iter()
                .find(|(_, p)| p.id == producer_id)
                .map(|(k, _)| *k)
                .ok_or(ErrorKind::NotFound)?
        };
        transport
            .pause_producer(producer_id, paused)
            .await
            .map_err(|_| ErrorKind::MediaEngineError)?;

        if key.r#type == ProducerType::Webcam {
            match key.kind {
                Kind::Audio => self.is_muted.store(paused, Ordering::SeqCst),
                Kind::Video => self.is_camera_off.store(paused, Ordering::SeqCst),
            }
        }
        Ok(key)
    }

    /// `consume{producerId, rtpCapabilities}`.
    ///
    /// Invariant (spec §8): at most one consumer per remote producer id.
    pub async fn consume(
        &self,
        producer_id: Uuid,
        producer_kind: Kind,
        requester_caps: &RtpCapabilities,
        router: &Router,
    ) -> Result<Arc<ConsumerHandle>, ErrorKind> {
        if !router.can_consume(requester_caps) {
            return Err(ErrorKind::NotConsumable);
        }

        let transport = self
            .consumer_transport
            .read()
            .await
            .clone()
            .ok_or(ErrorKind::TransportNotFound)?;

        if self.consumers.read().await.contains_key(&producer_id) {
            return Err(ErrorKind::NotConsumable);
        }

        let consumer = transport
            .consume(producer_id, producer_kind)
            .await
            .map_err(|_| ErrorKind::MediaEngineError)?;
        self.consumers.write().await.insert(producer_id, consumer.clone());
        Ok(consumer)
    }

    /// Close the consumer (if any) sourced from `producer_id`. Called by
    /// fan-out (C7) when the upstream producer closes.
    pub async fn close_consumer_for_producer(&self, producer_id: Uuid) {
        let transport = self.consumer_transport.read().await.clone();
        if let Some(consumer) = self.consumers.write().await.remove(&producer_id) {
            if let Some(t) = transport {
                t.close_consumer(consumer.id).await;
            }
        }
    }

    pub async fn consumer_count(&self) -> usize {
        self.consumers.read().await.len()
    }

    /// `getStats{producerId}` / `getStats{consumerId}` passthrough (spec
    /// §11 supplemental: stats surface mirroring the teacher's
    /// `voice/stats.rs`). Checks owned producers first, then consumers,
    /// since the two id spaces are disjoint `Uuid`s.
    pub async fn stats_for(&self, id: Uuid) -> Option<crate::media::MediaStats> {
        if let Some(p) = self.producer_by_id(id).await {
            return Some(p.get_stats());
        }
        self.consumers.read().await.get(&id).map(|c| c.get_stats())
    }

    /// Cascading close: consumers → producers → transports → socket.
    /// Idempotent. Ending the socket's read loop (spec §4.8 "disconnect
    /// all sockets") lives here so every caller — kick, grace-window
    /// expiry, forced drain — gets it for free.
    pub async fn close(&self) {
        let consumer_transport = self.consumer_transport.write().await.take();
        let producer_transport = self.producer_transport.write().await.take();

        self.consumers.write().await.clear();
        self.producers.write().await.clear();

        if let Some(t) = consumer_transport {
            let _ = t.close().await;
        }
        if let Some(t) = producer_transport {
            let _ = t.close().await;
        }

        self.disconnect_socket();
    }
}
