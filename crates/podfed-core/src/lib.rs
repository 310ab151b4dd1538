//! # podfed core
//!
//! Pure primitives for pod federation: pods, videos, propagation events and
//! canonical encoding.
//!
//! This crate contains no I/O, no storage, no networking. It is pure
//! computation over the data the federation replicates.
//!
//! ## Key Types
//!
//! - [`PodHost`] - Network identity of a pod
//! - [`Pod`] / [`RelationshipState`] - A remote pod and how we relate to it
//! - [`FriendRequest`] - Signed friendship handshake message
//! - [`VideoRecord`] - Replicable catalog entry with per-field write stamps
//! - [`PropagationEvent`] - One catalog mutation, identified by its [`DedupKey`]
//!
//! ## Merge Rules
//!
//! Every mutable field group carries a [`Stamp`] (logical timestamp, origin
//! host). The greater stamp wins; tombstones are sticky; view counts move
//! only by deltas. See [`video`].

pub mod canonical;
pub mod crypto;
pub mod error;
pub mod event;
pub mod pod;
pub mod types;
pub mod validation;
pub mod video;

pub use canonical::{canonical_record_bytes, decode_cbor, encode_cbor};
pub use crypto::{Blake3Hash, Ed25519PublicKey, Ed25519Signature, Keypair};
pub use error::{CoreError, ValidationError};
pub use event::{
    DedupKey, EventPayload, EventType, OutboundItem, PropagationEvent, SnapshotRecord,
    VideoAddedPayload, VideoUpdatedPayload,
};
pub use pod::{FriendRequest, FriendRequestState, Pod, RelationshipState};
pub use types::{
    now_millis, ContentId, LogicalClock, LogicalTimestamp, PodHost, Stamp, VideoUuid,
};
pub use validation::{validate_event, validate_record, validate_snapshot_record};
pub use video::{FieldStamps, Video, VideoRecord};
