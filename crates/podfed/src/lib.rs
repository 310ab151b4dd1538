//! # podfed
//!
//! A federated video pod: a local catalog of video metadata that converges
//! with the catalogs of befriended pods.
//!
//! ## Overview
//!
//! Each pod owns its catalog and its list of friends. Local uploads,
//! edits, removals and views become propagation events that are queued
//! durably and pushed to every friend; friends merge them idempotently and
//! gossip them onward. Video bytes never travel through the pod: they are
//! seeded to a content swarm and referenced by a deterministic identifier.
//!
//! ## Key Concepts
//!
//! - **Friend**: A pod we exchange catalog events with, after a signed handshake
//! - **Propagation event**: One catalog mutation, applied at most once per pod
//! - **Tombstone**: A removed video, kept to absorb late events
//! - **Content identifier**: Swarm handle for a file, identical on every pod
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use podfed::{LocalSwarm, Pod, PodConfig, SwarmClient, UploadRequest};
//! use podfed::core::{Keypair, PodHost};
//! use podfed::store::SqliteStore;
//! use podfed::sync::MemoryNetwork;
//!
//! async fn example() -> podfed::Result<()> {
//!     let host = PodHost::new("localhost:9001")?;
//!     let network = MemoryNetwork::new();
//!     let swarm: Arc<dyn SwarmClient> = Arc::new(LocalSwarm::open("swarm").await?);
//!
//!     let pod = Arc::new(Pod::new(
//!         PodConfig::new(host.clone()),
//!         Keypair::generate(),
//!         Arc::new(SqliteStore::open("pod.db")?),
//!         Arc::new(network.transport(host)),
//!         swarm,
//!     ));
//!     pod.start();
//!
//!     pod.request_friendship(&PodHost::new("localhost:9002")?).await?;
//!     let video = pod
//!         .upload(UploadRequest {
//!             name: "my video".into(),
//!             description: "".into(),
//!             tags: vec![],
//!             duration: 10,
//!             author: "root".into(),
//!             file: "video.webm".into(),
//!         })
//!         .await?;
//!     println!("uploaded {}", video.uuid());
//!
//!     pod.shutdown().await
//! }
//! ```
//!
//! ## Re-exports
//!
//! This crate re-exports the component crates for convenience:
//!
//! - `podfed::core` - Core types (PodHost, VideoRecord, PropagationEvent, etc.)
//! - `podfed::store` - Storage abstraction and SQLite
//! - `podfed::sync` - Federation protocol

pub mod config;
pub mod error;
pub mod pod;
pub mod swarm;

// Re-export component crates
pub use podfed_core as core;
pub use podfed_store as store;
pub use podfed_sync as sync;

// Re-export main types for convenience
pub use config::PodConfig;
pub use error::{PodError, Result};
pub use pod::{Pod, UploadRequest};
pub use swarm::{LocalSwarm, SwarmClient, SwarmReferenceManager};

// Re-export commonly used core types
pub use podfed_core::{
    ContentId, Keypair, PodHost, RelationshipState, Video, VideoRecord, VideoUpdatedPayload,
    VideoUuid,
};
