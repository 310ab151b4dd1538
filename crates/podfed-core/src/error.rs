//! Error types for podfed core.

use thiserror::Error;

use crate::event::EventType;

/// Core errors raised while building or decoding values.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("invalid signature")]
    InvalidSignature,

    #[error("invalid public key")]
    InvalidPublicKey,

    #[error("invalid pod host: {0}")]
    InvalidHost(String),

    #[error("invalid video uuid: {0}")]
    InvalidUuid(String),

    #[error("invalid content identifier: {0}")]
    InvalidContentId(String),

    #[error("unknown relationship state: {0}")]
    UnknownState(String),

    #[error("encoding error: {0}")]
    EncodingError(String),

    #[error("decoding error: {0}")]
    DecodingError(String),
}

/// Validation errors for incoming events and friend requests.
///
/// A validation failure is final: the input is rejected and never retried.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("signature verification failed")]
    SignatureFailed,

    #[error("payload does not match event type {0:?}")]
    PayloadMismatch(EventType),

    #[error("missing origin pod host")]
    MissingOrigin,

    #[error("nil video uuid")]
    NilUuid,

    #[error("logical timestamp must be non-zero")]
    ZeroTimestamp,

    #[error("view delta must be positive")]
    ZeroViewDelta,

    #[error("{field} exceeds maximum length of {max}")]
    TooLong { field: &'static str, max: usize },

    #[error("too many tags: {count} (max {max})")]
    TooManyTags { count: usize, max: usize },

    #[error("video name must not be empty")]
    EmptyName,

    #[error("missing content identifier")]
    MissingContentId,

    #[error("friend request addressed to {got}, expected {expected}")]
    WrongRecipient { expected: String, got: String },

    #[error("structural error: {0}")]
    StructuralError(String),
}

impl From<CoreError> for ValidationError {
    fn from(e: CoreError) -> Self {
        match e {
            CoreError::InvalidSignature | CoreError::InvalidPublicKey => {
                ValidationError::SignatureFailed
            }
            other => ValidationError::StructuralError(other.to_string()),
        }
    }
}
