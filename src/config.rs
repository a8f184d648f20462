//! Server Configuration
//!
//! Loads configuration from environment variables. Process-memory-only
//! state means there is no database or cache URL here — the only secret
//! this process holds is [`Config::sfu_secret`], used for invite-code
//! hashing and webinar link signing (spec §6).

use anyhow::{bail, Context, Result};
use std::env;

/// Server configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Server bind address (e.g. "0.0.0.0:8080").
    pub bind_address: String,

    /// Instance identifier, surfaced in `serverRestarting` notices and logs.
    pub instance_id: String,

    /// Crate version, surfaced alongside `instance_id`.
    pub version: String,

    /// HMAC/JWT signing secret for invite-code hashes and webinar links.
    pub sfu_secret: String,

    /// Base URL used when rendering webinar join links.
    pub webinar_base_url: String,

    /// Grace period before a disconnected session is fully torn down.
    pub disconnect_grace_ms: u64,

    /// Grace period a room without an admin is kept alive before GC.
    pub admin_absence_grace_ms: u64,

    /// Grace period an empty room (no members, no pending) is kept alive.
    pub empty_room_grace_ms: u64,

    /// Participant count at/above which quality downgrades to `low`.
    pub quality_low_threshold: usize,

    /// Participant count at/below which quality upgrades back to `standard`.
    pub quality_standard_threshold: usize,

    /// Hard cap on non-webinar room membership (fan-out bound).
    pub max_room_participants: usize,

    /// WebRTC STUN server.
    pub stun_server: String,

    /// WebRTC TURN server (optional).
    pub turn_server: Option<String>,

    /// WebRTC TURN username (optional).
    pub turn_username: Option<String>,

    /// WebRTC TURN credential (optional).
    pub turn_credential: Option<String>,

    /// Whether new room creation is allowed on join (vs. join-existing-only).
    pub allow_room_creation: bool,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        let cfg = Self {
            bind_address: env::var("BIND_ADDRESS").unwrap_or_else(|_| {
                let port = env::var("PORT").unwrap_or_else(|_| "8080".into());
                format!("0.0.0.0:{port}")
            }),
            instance_id: env::var("INSTANCE_ID")
                .unwrap_or_else(|_| uuid::Uuid::new_v4().to_string()),
            version: env::var("VERSION").unwrap_or_else(|_| env!("CARGO_PKG_VERSION").into()),
            sfu_secret: env::var("SFU_SECRET").context("SFU_SECRET must be set")?,
            webinar_base_url: env::var("WEBINAR_BASE_URL")
                .unwrap_or_else(|_| "https://meet.local".into()),
            disconnect_grace_ms: parse_env_or("DISCONNECT_GRACE_MS", 10_000),
            admin_absence_grace_ms: parse_env_or("ADMIN_ABSENCE_GRACE_MS", 300_000),
            empty_room_grace_ms: parse_env_or("EMPTY_ROOM_GRACE_MS", 60_000),
            quality_low_threshold: parse_env_or("QUALITY_LOW_THRESHOLD", 10),
            quality_standard_threshold: parse_env_or("QUALITY_STANDARD_THRESHOLD", 7),
            max_room_participants: parse_env_or("MAX_ROOM_PARTICIPANTS", 1000),
            stun_server: env::var("STUN_SERVER")
                .unwrap_or_else(|_| "stun:stun.l.google.com:19302".into()),
            turn_server: env::var("TURN_SERVER").ok(),
            turn_username: env::var("TURN_USERNAME").ok(),
            turn_credential: env::var("TURN_CREDENTIAL").ok(),
            allow_room_creation: env::var("ALLOW_ROOM_CREATION")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(true),
        };

        if cfg.quality_standard_threshold >= cfg.quality_low_threshold {
            bail!(
                "QUALITY_STANDARD_THRESHOLD ({}) must be less than QUALITY_LOW_THRESHOLD ({}) \
                 to avoid flapping",
                cfg.quality_standard_threshold,
                cfg.quality_low_threshold
            );
        }

        Ok(cfg)
    }
}

fn parse_env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_env_or_falls_back_to_default() {
        std::env::remove_var("CONFIG_TEST_MISSING_KEY");
        let v: u64 = parse_env_or("CONFIG_TEST_MISSING_KEY", 42);
        assert_eq!(v, 42);
    }
}
