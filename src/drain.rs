//! Drain & Lifecycle Manager (C9)
//!
//! Process-level concerns: the drain gate new joins check (spec §4.4 step
//! 1), forced drain with a grace notice, and the timers that dissolve
//! empty/admin-less rooms (the timers themselves are scheduled by
//! [`crate::admission::AdmissionEngine`] and [`crate::room::Room`]; this
//! module owns the drain flag and the forced-drain sequence).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::room::RoomRegistry;
use crate::ws::ServerEvent;

/// Clamp from spec §4.8: "wait `noticeMs` (bounded 0..30000)".
const MAX_NOTICE_MS: u64 = 30_000;

pub struct DrainManager {
    draining: Arc<AtomicBool>,
    instance_id: String,
    version: String,
}

impl DrainManager {
    pub fn new(instance_id: String, version: String) -> Self {
        Self {
            draining: Arc::new(AtomicBool::new(false)),
            instance_id,
            version,
        }
    }

    /// Shared flag checked by the admission pipeline's drain gate.
    pub fn flag(&self) -> Arc<AtomicBool> {
        self.draining.clone()
    }

    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::SeqCst)
    }

    /// `serverRestarting{message, reconnecting:true}` body, tagged with
    /// this instance's id/version so operators can tell which process
    /// issued the notice (SPEC_FULL §11, "Graceful drain notice rendering").
    fn notice_message(&self, notice: &str) -> String {
        format!("{notice} (instance {} v{})", self.instance_id, self.version)
    }

    /// Forced drain sequence (spec §4.8 "Forced drain"): mark draining,
    /// broadcast the restart notice to every room and every pending
    /// socket, wait `notice_ms` (clamped), then disconnect everything.
    pub async fn force_drain(&self, registry: Arc<RoomRegistry>, notice: &str, notice_ms: u64) {
        self.draining.store(true, Ordering::SeqCst);
        let notice_ms = notice_ms.min(MAX_NOTICE_MS);
        let message = self.notice_message(notice);

        let rooms = registry.all_rooms().await;
        info!(room_count = rooms.len(), notice_ms, "forced drain started");

        for room in &rooms {
            room.broadcast_all(ServerEvent::ServerRestarting {
                message: message.clone(),
                reconnecting: true,
            })
            .await;
            room.notify_pending(ServerEvent::ServerRestarting {
                message: message.clone(),
                reconnecting: true,
            })
            .await;
        }

        tokio::time::sleep(Duration::from_millis(notice_ms)).await;

        for room in &rooms {
            for member in room.members_snapshot().await {
                member.close().await;
            }
        }
        info!("forced drain disconnected all sockets");
    }

    /// Undo a drain (operational recovery path; not itself spec'd as a
    /// wire event, exposed only through the admin surface out of scope
    /// here — kept for the health/drain control endpoint in `main.rs`).
    pub fn cancel(&self) {
        self.draining.store(false, Ordering::SeqCst);
    }
}
