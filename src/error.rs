//! Wire-level error kinds and internal error types.
//!
//! Every mutating signaling event acks either `{success: true, ...}` or
//! `{error: <kind>}` (spec §6/§7). `ErrorKind` is that closed error set;
//! it is never extended ad hoc by a handler.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error kinds returned over the wire via an event ack.
///
/// Deliberately flat and closed: handlers pick one of these, they never
/// invent a new string at the call site.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Error)]
pub enum ErrorKind {
    #[error("server is draining")]
    Draining,
    #[error("room is locked")]
    RoomLocked,
    #[error("guests are blocked from this room")]
    GuestsBlocked,
    #[error("an invite code is required")]
    InviteCodeRequired,
    #[error("invite code is invalid")]
    InvalidInviteCode,
    #[error("webinar mode is not enabled for this room")]
    WebinarDisabled,
    #[error("attendee cap exceeded")]
    AttendeeCapExceeded,
    #[error("signed link is invalid or stale")]
    InvalidSignedLink,
    #[error("session already owns a transport of this kind")]
    TransportExhausted,
    #[error("transport not found")]
    TransportNotFound,
    #[error("remote producer cannot be consumed with the given capabilities")]
    NotConsumable,
    #[error("screen share is already owned by another session")]
    ScreenBusy,
    #[error("media engine operation failed")]
    MediaEngineError,
    #[error("not authorized to perform this action")]
    Forbidden,
    #[error("not found")]
    NotFound,
    #[error("room is closed")]
    RoomClosed,
    #[error("operation timed out")]
    Timeout,
}

/// Convenience alias for handlers that answer with either data or a wire
/// [`ErrorKind`].
pub type AckResult<T> = Result<T, ErrorKind>;

/// Internal, process-local error type for the Media Engine Adapter (C1).
///
/// Never serialized to the wire directly — callers map it to
/// [`ErrorKind::MediaEngineError`] (or a more specific kind when the failure
/// is precisely classifiable, e.g. a transport lookup miss becomes
/// [`ErrorKind::TransportNotFound`] rather than a generic media error).
#[derive(Debug, Error)]
pub enum MediaEngineError {
    #[error("webrtc error: {0}")]
    WebRtc(#[from] webrtc::Error),
    #[error("transport {0} not found")]
    TransportNotFound(uuid::Uuid),
    #[error("producer {0} not found")]
    ProducerNotFound(uuid::Uuid),
    #[error("consumer {0} not found")]
    ConsumerNotFound(uuid::Uuid),
    #[error("router rejected consume: capabilities mismatch")]
    NotConsumable,
    #[error("{0}")]
    Other(String),
}

impl From<MediaEngineError> for ErrorKind {
    fn from(err: MediaEngineError) -> Self {
        match err {
            MediaEngineError::TransportNotFound(_) => Self::TransportNotFound,
            MediaEngineError::NotConsumable => Self::NotConsumable,
            MediaEngineError::WebRtc(_)
            | MediaEngineError::ProducerNotFound(_)
            | MediaEngineError::ConsumerNotFound(_)
            | MediaEngineError::Other(_) => Self::MediaEngineError,
        }
    }
}
