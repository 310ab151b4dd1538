//! Error types for the sync module.

use thiserror::Error;

/// Errors that can occur during federation operations.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Event or friend request failed validation. Never retried.
    #[error("validation error: {0}")]
    Validation(#[from] podfed_core::ValidationError),

    /// A single delivery attempt failed; the caller may retry.
    #[error("delivery to {host} failed: {reason}")]
    Delivery { host: String, reason: String },

    /// Retries against a pod are exhausted.
    #[error("pod {0} is unreachable")]
    UnreachablePod(String),

    /// Friendship requested with a pod that is already a friend.
    #[error("already friends with {0}")]
    AlreadyFriend(String),

    /// The remote pod refused a friend request.
    #[error("friend request rejected by {host}: {reason}")]
    Rejected { host: String, reason: String },

    /// The remote pod answered with something the protocol does not allow here.
    #[error("unexpected reply from {host}: {reply}")]
    UnexpectedReply { host: String, reply: String },

    /// Store operation failed.
    #[error("store error: {0}")]
    Store(#[from] podfed_store::StoreError),

    /// Transport-level error.
    #[error("transport error: {0}")]
    Transport(String),

    #[error("core error: {0}")]
    Core(#[from] podfed_core::CoreError),
}

/// Result type for sync operations.
pub type Result<T> = std::result::Result<T, SyncError>;
