//! Error types for a pod.

use podfed_core::{CoreError, ValidationError, VideoUuid};
use podfed_store::StoreError;
use podfed_sync::SyncError;
use thiserror::Error;

/// Errors that can occur during pod operations.
#[derive(Debug, Error)]
pub enum PodError {
    /// Validation error.
    #[error("validation error: {0}")]
    Validation(#[from] ValidationError),

    /// Storage error.
    #[error("storage error: {0}")]
    Store(#[from] StoreError),

    /// Federation error.
    #[error("federation error: {0}")]
    Sync(SyncError),

    #[error("core error: {0}")]
    Core(#[from] CoreError),

    /// Friendship requested with a pod that is already a friend.
    #[error("already friends with {0}")]
    AlreadyFriend(String),

    /// Mutation of a video that originated on another pod.
    #[error("video {0} is not local to this pod")]
    NotLocal(VideoUuid),

    /// Unknown or tombstoned video.
    #[error("video not found: {0}")]
    VideoNotFound(VideoUuid),

    /// A content identifier that neither the store nor the swarm can resolve.
    #[error("content not found: {0}")]
    ContentNotFound(String),

    /// The swarm client failed.
    #[error("swarm error: {0}")]
    Swarm(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<SyncError> for PodError {
    fn from(e: SyncError) -> Self {
        match e {
            SyncError::AlreadyFriend(host) => PodError::AlreadyFriend(host),
            SyncError::Validation(e) => PodError::Validation(e),
            SyncError::Store(e) => PodError::Store(e),
            other => PodError::Sync(other),
        }
    }
}

/// Result type for pod operations.
pub type Result<T> = std::result::Result<T, PodError>;
