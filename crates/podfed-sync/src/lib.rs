//! # podfed sync
//!
//! The federation protocol between pods.
//!
//! ## Overview
//!
//! Pods befriend each other through a signed three-leg handshake, then push
//! every catalog mutation to their friends as a [`PropagationEvent`]. The
//! receiving side merges events idempotently, so delivery only has to be
//! at-least-once.
//!
//! ## Key Properties
//!
//! - **Idempotent**: Re-applying an event (same [`DedupKey`]) changes nothing
//! - **Order-tolerant**: Mutations that overtake their `VideoAdded` are buffered and replayed
//! - **Ordered per destination**: One drain per friend, head item retried first
//! - **Self-healing**: Friends that stay unreachable lose score and are demoted
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use podfed_core::{Keypair, PodHost};
//! use podfed_store::MemoryStore;
//! use podfed_sync::{
//!     MemoryNetwork, Negotiator, PodDirectory, Propagator, PropagatorConfig,
//! };
//!
//! async fn example() -> podfed_sync::Result<()> {
//!     let network = MemoryNetwork::new();
//!     let store = Arc::new(MemoryStore::new());
//!     let transport = Arc::new(network.transport(PodHost::new("a.example")?));
//!     let directory = Arc::new(PodDirectory::new(Arc::clone(&store)));
//!     let propagator = Arc::new(Propagator::new(
//!         Arc::clone(&store),
//!         Arc::clone(&transport),
//!         Arc::clone(&directory),
//!         PropagatorConfig::default(),
//!     ));
//!     let negotiator = Negotiator::new(Keypair::generate(), store, transport, directory, propagator);
//!
//!     negotiator.request_friendship(&PodHost::new("b.example")?).await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Message Flow
//!
//! ```text
//! Pod A                               Pod B
//!   |-------- FriendRequest ---------->|   B: PendingInbound
//!   |<------- Accepted ----------------|
//!   |-------- FriendConfirm ---------->|   A, B: Friend
//!   |-------- Snapshot(s) ------------>|
//!   |<------- Snapshot(s) -------------|
//!   |-------- Event ------------------>|   applied, gossiped onward
//!   |<------- Ack ---------------------|
//! ```
//!
//! [`PropagationEvent`]: podfed_core::PropagationEvent
//! [`DedupKey`]: podfed_core::DedupKey

pub mod applier;
pub mod convergence;
pub mod directory;
pub mod error;
pub mod keyed_lock;
pub mod messages;
pub mod negotiator;
pub mod propagator;
pub mod transport;
pub mod view_counter;

pub use applier::{Applier, ApplierConfig, ApplyOutcome, ApplyReport, BufferedEvent};
pub use convergence::{
    catalog_digest, compare_records, digest_records, verify_convergence, ConvergenceResult,
};
pub use directory::PodDirectory;
pub use error::{Result, SyncError};
pub use keyed_lock::KeyedLocks;
pub use messages::{limits, PodMessage, PodReply, PROTOCOL_VERSION};
pub use negotiator::Negotiator;
pub use propagator::{DrainReport, Propagator, PropagatorConfig, RetryPolicy};
pub use transport::{memory::MemoryNetwork, memory::MemoryTransport, MessageHandler, Transport};
pub use view_counter::ViewCounter;
