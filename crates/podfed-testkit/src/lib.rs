//! # podfed Testkit
//!
//! Testing utilities for podfed.
//!
//! ## Overview
//!
//! This crate provides:
//!
//! - **Fixtures**: a [`Cluster`] of pods on one in-memory network
//! - **Generators**: Proptest strategies for event histories and their
//!   arrival orders
//!
//! The integration tests under `tests/` drive whole clusters through the
//! friendship handshake, propagation, retries and convergence.
//!
//! ## Test Fixtures
//!
//! ```rust,ignore
//! use podfed_testkit::Cluster;
//!
//! let cluster = Cluster::new(2).await?;
//! cluster.pod(0).request_friendship(&cluster.host(1)).await?;
//! cluster.upload(0, "my super video").await?;
//! cluster.settle().await?;
//! assert!(cluster.converged().await?);
//! ```
//!
//! ## Property Testing
//!
//! ```rust,ignore
//! use proptest::prelude::*;
//! use podfed_testkit::generators::{live_history, shuffled};
//!
//! proptest! {
//!     #[test]
//!     fn arrival_order_does_not_matter((history, arrivals) in shuffled(live_history())) {
//!         // apply `history.events` and `arrivals` to two appliers and compare
//!     }
//! }
//! ```

pub mod fixtures;
pub mod generators;

pub use fixtures::{fast_retry, pod_host, Cluster, TestPod};
