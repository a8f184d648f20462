//! Producer/Consumer Fan-Out (C7)
//!
//! Maintains the derived projection from room membership/producer state to
//! what each subscriber is told (spec §4.6). Screen-share exclusivity is
//! enforced at produce time (C2/C3), not here.

use std::sync::Arc;
use uuid::Uuid;

use crate::media::{Kind, ProducerType};
use crate::room::Room;
use crate::session::UserId;
use crate::ws::ServerEvent;

/// Broadcast a freshly created producer to every other room member, then
/// refresh the webinar feed if attendees are present (spec §4.6).
pub async fn on_new_producer(
    room: &Room,
    owner: &UserId,
    producer_id: Uuid,
    kind: Kind,
    producer_type: ProducerType,
) {
    room.broadcast_except(
        owner,
        ServerEvent::NewProducer {
            producer_id,
            producer_user_id: owner.to_string(),
            kind,
            producer_type,
        },
    )
    .await;
    refresh_feed_if_needed(room).await;
}

/// Broadcast a producer closure and have every subscriber drop its
/// matching consumer (spec §4.6).
pub async fn on_producer_closed(room: &Room, owner: &UserId, producer_id: Uuid) {
    room.broadcast_except(
        owner,
        ServerEvent::ProducerClosed {
            producer_id,
            producer_user_id: owner.to_string(),
        },
    )
    .await;
    for member in room.members_snapshot().await {
        member.close_consumer_for_producer(producer_id).await;
    }
    refresh_feed_if_needed(room).await;
}

/// Broadcast a pause/resume transition (`toggleMute`/`toggleCamera`,
/// spec §4.6 "producerPaused/Resumed").
pub async fn on_producer_paused(room: &Room, owner: &UserId, producer_id: Uuid, paused: bool) {
    room.broadcast_except(owner, ServerEvent::ToggleMedia { producer_id, paused })
        .await;
    refresh_feed_if_needed(room).await;
}

/// Recompute and, if changed, broadcast the active-speaker feed (spec
/// §4.6 "request C4 to refresh feed snapshot", spec §4.3 feed selection).
/// A no-op when the room has no live webinar attendees, since nothing
/// subscribes to the curated feed in that case.
pub async fn refresh_feed_if_needed(room: &Room) {
    if room.attendee_count().await == 0 {
        return;
    }
    let candidates = room.feed_candidates().await;
    let mut webinar = room.webinar.lock().await;
    if !webinar.enabled {
        return;
    }
    let changed = webinar.recompute_feed(&candidates).await;
    if changed {
        let speaker = webinar.current_speaker.clone();
        let producers = webinar.current_producers.clone();
        drop(webinar);
        room.broadcast_all(ServerEvent::WebinarFeedChanged {
            room_id: room.room_id.clone(),
            speaker_user_id: speaker,
            producers,
        })
        .await;
    }
}

/// Broadcast `setVideoQuality` after a membership change that moved the
/// hysteresis target (spec §4.2).
pub async fn refresh_quality_target(room: &Arc<Room>, low_threshold: usize, standard_threshold: usize) {
    if let Some(new_quality) = room.update_video_quality_target(low_threshold, standard_threshold).await {
        room.broadcast_all(ServerEvent::SetVideoQuality { quality: new_quality }).await;
    }
}
