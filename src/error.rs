//! Crate-wide error kinds and their propagation policy.

use std::fmt;

use crate::wire::message::NotificationCode;

/// The error kinds the server core distinguishes.
///
/// `KeyMissing` is recovered internally (park the section, issue a
/// delegation query) rather than surfaced; every other variant either maps
/// to a peer-visible [`NotificationCode`] via [`RainsError::notification`]
/// or is logged without leaking details beyond `UnspecServerErr`.
#[derive(Debug)]
pub enum RainsError {
    /// Framing or parse failure on an inbound byte stream.
    Malformed(String),
    /// A frame's length prefix exceeded the configured `MsgMaxSize`.
    MsgTooLarge { limit: usize },
    /// A shard/zone consistency check failed.
    Inconsistent(String),
    /// A section had no signature that verified.
    Unverified,
    /// A signature's key could not be found; the section is parked.
    KeyMissing,
    /// A notification or reply referenced a token with no pending entry.
    TokenUnknown,
    /// A queue or cache is at its hard capacity.
    CapacityExceeded(&'static str),
    /// Every retry to reach a peer was exhausted.
    Unreachable,
    /// A pending entry aged out before it was resolved.
    Timeout,
    /// An unsupported algorithm, transport, or capability was requested.
    Unsupported(String),
    /// An internal invariant failure; never described to a peer.
    Internal(String),
}

impl RainsError {
    /// The notification code this error surfaces to the peer, if any.
    /// `KeyMissing` is recovered, not surfaced, so it has no notification.
    pub fn notification(&self) -> Option<NotificationCode> {
        match self {
            RainsError::Malformed(_) => Some(NotificationCode::BadMessage),
            RainsError::MsgTooLarge { .. } => Some(NotificationCode::MsgTooLarge),
            RainsError::Inconsistent(_) => Some(NotificationCode::RcvInconsistentMsg),
            RainsError::CapacityExceeded(_) => Some(NotificationCode::UnspecServerErr),
            RainsError::Unsupported(_) => Some(NotificationCode::ServerNotCapable),
            RainsError::Timeout => Some(NotificationCode::NoAssertionAvail),
            RainsError::Internal(_) => Some(NotificationCode::UnspecServerErr),
            RainsError::Unverified
            | RainsError::KeyMissing
            | RainsError::TokenUnknown
            | RainsError::Unreachable => None,
        }
    }
}

impl fmt::Display for RainsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RainsError::Malformed(detail) => write!(f, "malformed message: {detail}"),
            RainsError::MsgTooLarge { limit } => write!(f, "message frame exceeds the {limit}-byte limit"),
            RainsError::Inconsistent(detail) => write!(f, "inconsistent section: {detail}"),
            RainsError::Unverified => f.write_str("no signature on this section verified"),
            RainsError::KeyMissing => f.write_str("no zone key matched this signature"),
            RainsError::TokenUnknown => f.write_str("no pending entry for this token"),
            RainsError::CapacityExceeded(what) => write!(f, "{what} is at capacity"),
            RainsError::Unreachable => f.write_str("peer unreachable after all retries"),
            RainsError::Timeout => f.write_str("pending entry timed out"),
            RainsError::Unsupported(what) => write!(f, "unsupported: {what}"),
            RainsError::Internal(detail) => write!(f, "internal error: {detail}"),
        }
    }
}

impl std::error::Error for RainsError {}

impl From<crate::wire::codec::CodecError> for RainsError {
    fn from(e: crate::wire::codec::CodecError) -> Self {
        match e {
            crate::wire::codec::CodecError::MsgTooLarge { limit } => RainsError::MsgTooLarge { limit },
            crate::wire::codec::CodecError::Malformed(_) | crate::wire::codec::CodecError::Io(_) => {
                RainsError::Malformed(e.to_string())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_missing_has_no_peer_visible_notification() {
        assert!(RainsError::KeyMissing.notification().is_none());
    }

    #[test]
    fn inconsistent_maps_to_the_matching_notification_code() {
        assert_eq!(
            RainsError::Inconsistent("bad range".into()).notification(),
            Some(NotificationCode::RcvInconsistentMsg)
        );
    }

    #[test]
    fn an_oversized_codec_frame_maps_to_msg_too_large_rather_than_bad_message() {
        let codec_err = crate::wire::codec::CodecError::MsgTooLarge { limit: 65535 };
        let err: RainsError = codec_err.into();
        assert_eq!(err.notification(), Some(NotificationCode::MsgTooLarge));
    }
}
