//! # podfed store
//!
//! Storage abstraction for a pod. Provides a trait-based interface for the
//! video catalog, the pod directory, the dedup index, the durable outbound
//! queues and content references, with SQLite and in-memory implementations.
//!
//! ## Overview
//!
//! The [`Store`] trait keeps the federation engine storage-agnostic. The
//! primary implementation is [`SqliteStore`], with [`MemoryStore`] for testing.
//!
//! ## Key Types
//!
//! - [`Store`] - The async trait for all storage operations
//! - [`SqliteStore`] - SQLite-based persistent storage
//! - [`MemoryStore`] - In-memory storage for tests
//! - [`QueuedItem`] - An outbound item awaiting delivery
//!
//! ## Usage
//!
//! ```rust,no_run
//! use podfed_store::{SqliteStore, Store};
//!
//! async fn example() {
//!     // Open a SQLite database
//!     let store = SqliteStore::open("pod.db").unwrap();
//!
//!     // Or use an in-memory database for testing
//!     let store = SqliteStore::open_memory().unwrap();
//!
//!     let videos = store.list_videos(false).await.unwrap();
//!     assert!(videos.is_empty());
//! }
//! ```
//!
//! ## Design Notes
//!
//! - **Stable local ids**: a video keeps its local id across every upsert
//! - **Atomic apply**: `commit_event` records a dedup key and the record it
//!   produced together, so a failed write never leaves half an event behind
//! - **Durable queues**: outbound items survive restarts until acknowledged

pub mod error;
pub mod memory;
pub mod migration;
pub mod sqlite;
pub mod traits;

pub use error::{Result, StoreError};
pub use memory::MemoryStore;
pub use sqlite::SqliteStore;
pub use traits::{QueuedItem, Store, StoreExt};
