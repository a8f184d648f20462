//! Webinar Controller (C4)
//!
//! Per-room webinar configuration, attendee counting, active-speaker feed
//! selection, and signed-link issuance (spec §4.3). Invite-code hashing
//! follows the same HMAC-SHA256 scheme as the teacher's webhook signing;
//! signed links reuse the teacher's JWT issuance pattern but with a
//! symmetric secret, since this process holds only `sfu_secret` rather
//! than an asymmetric keypair.

use hmac::{Hmac, Mac};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use uuid::Uuid;

use crate::error::ErrorKind;
use crate::session::{ClientSession, Role};

type HmacSha256 = Hmac<Sha256>;

const LINK_PURPOSE: &str = "webinar_link";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedMode {
    ActiveSpeaker,
}

impl Default for FeedMode {
    fn default() -> Self {
        Self::ActiveSpeaker
    }
}

/// Per-room webinar configuration (spec §3: "WebinarConfig").
#[derive(Debug, Clone)]
pub struct WebinarConfig {
    pub enabled: bool,
    pub public_access: bool,
    pub locked: bool,
    pub max_attendees: u32,
    pub invite_code_hash: Option<String>,
    pub link_version: u64,
    pub feed_mode: FeedMode,

    /// Current active-speaker feed state, recomputed on every relevant
    /// mutation (spec §4.3 step 1-5).
    pub current_speaker: Option<String>,
    pub current_producers: Vec<Uuid>,
}

impl Default for WebinarConfig {
    /// `maxAttendees` defaults to the bottom of its valid range (spec §3:
    /// `maxAttendees ∈ [1, 5000]`) rather than `u32::default()`'s `0`, which
    /// would reject every attendee the instant a webinar is enabled without
    /// an explicit cap.
    fn default() -> Self {
        Self {
            enabled: false,
            public_access: false,
            locked: false,
            max_attendees: 1,
            invite_code_hash: None,
            link_version: 0,
            feed_mode: FeedMode::default(),
            current_speaker: None,
            current_producers: Vec::new(),
        }
    }
}

/// Partial update accepted by `updateWebinarConfig` (spec §6).
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebinarConfigUpdate {
    pub enabled: Option<bool>,
    pub public_access: Option<bool>,
    pub locked: Option<bool>,
    pub max_attendees: Option<u32>,
    pub invite_code: Option<Option<String>>,
}

#[derive(Debug, Serialize, Deserialize)]
struct LinkClaims {
    room_id: String,
    client_id: String,
    link_version: u64,
    purpose: String,
    exp: i64,
}

impl WebinarConfig {
    /// Apply a partial update, enforcing the mutation rules from spec
    /// §4.3. Returns `true` if `linkVersion` was bumped (disabling, or an
    /// invite-code rotation implied by the caller separately).
    pub fn apply_update(&mut self, update: WebinarConfigUpdate, secret: &str) -> Result<bool, ErrorKind> {
        let mut link_bumped = false;

        if let Some(enabled) = update.enabled {
            if self.enabled && !enabled {
                self.link_version += 1;
                link_bumped = true;
            }
            self.enabled = enabled;
            if enabled && self.max_attendees == 0 {
                self.max_attendees = 1;
            }
        }
        if let Some(public_access) = update.public_access {
            self.public_access = public_access;
        }
        if let Some(locked) = update.locked {
            self.locked = locked;
        }
        if let Some(max_attendees) = update.max_attendees {
            self.max_attendees = max_attendees.clamp(1, 5000);
        }
        if let Some(invite_code) = update.invite_code {
            self.invite_code_hash = invite_code.map(|code| hash_invite_code(secret, &code));
        }

        Ok(link_bumped)
    }

    /// Generate the join link for this room (spec §4.3 "link generation").
    pub fn generate_link(
        &self,
        base_url: &str,
        client_id: &str,
        room_id: &str,
        secret: &str,
    ) -> Result<String, ErrorKind> {
        if self.public_access {
            return Ok(format!("{base_url}/{room_id}"));
        }
        let token = sign_link(secret, client_id, room_id, self.link_version)?;
        Ok(format!("{base_url}/{room_id}?wt={token}"))
    }

    /// Bump `linkVersion`, invalidating every previously issued signed
    /// link (spec §4.3 "rotating link bumps linkVersion").
    pub fn rotate_link(&mut self) {
        self.link_version += 1;
    }

    pub fn verify_invite_code(&self, secret: &str, presented: &str) -> bool {
        match &self.invite_code_hash {
            Some(hash) => verify_invite_code(secret, presented, hash),
            None => false,
        }
    }

    pub fn verify_signed_link(&self, secret: &str, client_id: &str, room_id: &str, token: &str) -> bool {
        verify_link(secret, client_id, room_id, self.link_version, token)
    }

    /// Active-speaker feed recomputation (spec §4.3 steps 1-5). `candidates`
    /// is the non-ghost, non-attendee membership in stable order.
    ///
    /// Returns `true` if the feed actually changed (speaker or producer id
    /// set), signaling the caller to broadcast `webinar:feedChanged`.
    pub async fn recompute_feed(&mut self, candidates: &[std::sync::Arc<ClientSession>]) -> bool {
        let mut speaker = None;
        let current = self.current_speaker.clone();

        // Step 2: keep current speaker if still eligible.
        if let Some(current) = &current {
            if let Some(session) = candidates.iter().find(|s| &s.user_id.to_string() == current) {
                if has_live_webcam_audio(session).await {
                    speaker = Some(current.clone());
                }
            }
        }

        // Step 3: first candidate with live webcam audio.
        if speaker.is_none() {
            for session in candidates {
                if has_live_webcam_audio(session).await {
                    speaker = Some(session.user_id.to_string());
                    break;
                }
            }
        }

        // Step 4: keep current speaker if they still have any producer.
        if speaker.is_none() {
            if let Some(current) = &current {
                if let Some(session) = candidates.iter().find(|s| &s.user_id.to_string() == current) {
                    if !session.producers_snapshot().await.is_empty() {
                        speaker = Some(current.clone());
                    }
                }
            }
        }

        // Step 5: first candidate with any producer, else none.
        if speaker.is_none() {
            for session in candidates {
                if !session.producers_snapshot().await.is_empty() {
                    speaker = Some(session.user_id.to_string());
                    break;
                }
            }
        }

        let mut producers = Vec::new();
        for session in candidates {
            for p in session.producers_snapshot().await {
                producers.push(p.id);
            }
        }
        producers.sort_unstable();

        let changed = speaker != self.current_speaker || producers != self.current_producers;
        self.current_speaker = speaker;
        self.current_producers = producers;
        changed
    }
}

async fn has_live_webcam_audio(session: &ClientSession) -> bool {
    for p in session.producers_snapshot().await {
        if p.kind() == crate::media::Kind::Audio
            && p.producer_type() == crate::media::ProducerType::Webcam
            && !p.is_paused()
        {
            return true;
        }
    }
    false
}

/// Keyed-MAC hash of an invite code (spec §4.3: "hashed via a keyed MAC
/// before storage; plain value never retained"). Shared by the webinar
/// invite code and the room-level meeting invite code (spec §4.4 step 3c),
/// since both are the same "secret the host handed out" concept.
pub(crate) fn hash_invite_code(secret: &str, code: &str) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key length");
    mac.update(code.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

pub(crate) fn verify_invite_code(secret: &str, presented: &str, expected_hash: &str) -> bool {
    let computed = hash_invite_code(secret, presented);
    constant_time_eq(&computed, expected_hash)
}

fn constant_time_eq(a: &str, b: &str) -> bool {
    a.len() == b.len()
        && a.as_bytes()
            .iter()
            .zip(b.as_bytes())
            .fold(0u8, |acc, (x, y)| acc | (x ^ y))
            == 0
}

fn sign_link(secret: &str, client_id: &str, room_id: &str, link_version: u64) -> Result<String, ErrorKind> {
    let claims = LinkClaims {
        room_id: room_id.to_string(),
        client_id: client_id.to_string(),
        link_version,
        purpose: LINK_PURPOSE.to_string(),
        exp: (chrono::Utc::now() + chrono::Duration::days(365)).timestamp(),
    };
    encode(&Header::new(Algorithm::HS256), &claims, &EncodingKey::from_secret(secret.as_bytes()))
        .map_err(|_| ErrorKind::InvalidSignedLink)
}

fn verify_link(secret: &str, client_id: &str, room_id: &str, current_link_version: u64, token: &str) -> bool {
    let mut validation = Validation::new(Algorithm::HS256);
    validation.validate_exp = true;
    let Ok(data) = decode::<LinkClaims>(token, &DecodingKey::from_secret(secret.as_bytes()), &validation) else {
        return false;
    };
    data.claims.purpose == LINK_PURPOSE
        && data.claims.room_id == room_id
        && data.claims.client_id == client_id
        && data.claims.link_version == current_link_version
}

/// Whether `role` is eligible for the webinar attendee cap check (spec
/// §4.3 "Attendee counting").
pub fn counts_toward_attendee_cap(role: Role) -> bool {
    role == Role::WebinarAttendee
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invite_code_round_trip() {
        let mut cfg = WebinarConfig::default();
        cfg.apply_update(
            WebinarConfigUpdate {
                enabled: None,
                public_access: None,
                locked: None,
                max_attendees: None,
                invite_code: Some(Some("letmein".to_string())),
            },
            "secret",
        )
        .unwrap();
        assert!(cfg.verify_invite_code("secret", "letmein"));
        assert!(!cfg.verify_invite_code("secret", "wrong"));
    }

    #[test]
    fn disabling_bumps_link_version() {
        let mut cfg = WebinarConfig { enabled: true, ..Default::default() };
        let bumped = cfg
            .apply_update(
                WebinarConfigUpdate {
                    enabled: Some(false),
                    public_access: None,
                    locked: None,
                    max_attendees: None,
                    invite_code: None,
                },
                "secret",
            )
            .unwrap();
        assert!(bumped);
        assert_eq!(cfg.link_version, 1);
    }

    #[test]
    fn max_attendees_is_clamped() {
        let mut cfg = WebinarConfig::default();
        cfg.apply_update(
            WebinarConfigUpdate {
                enabled: None,
                public_access: None,
                locked: None,
                max_attendees: Some(999_999),
                invite_code: None,
            },
            "secret",
        )
        .unwrap();
        assert_eq!(cfg.max_attendees, 5000);
    }

    #[test]
    fn signed_link_rejects_stale_version() {
        let token = sign_link("secret", "client1", "room1", 1).unwrap();
        assert!(verify_link("secret", "client1", "room1", 1, &token));
        assert!(!verify_link("secret", "client1", "room1", 2, &token));
    }
}
