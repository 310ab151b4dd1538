//! Convergence verification between pod catalogs.
//!
//! Two pods have converged when they hold the same replicable records for
//! every uuid. The local `id` and `is_local` flag are pod-specific and never
//! take part in the comparison.

use std::collections::BTreeMap;

use podfed_core::{canonical_record_bytes, Blake3Hash, VideoRecord, VideoUuid};
use podfed_store::Store;

use crate::error::Result;

const CATALOG_DOMAIN: &[u8] = b"podfed-catalog-v1:";

/// Compute a deterministic digest of a pod's whole catalog.
///
/// Algorithm:
/// 1. Take every record, tombstones included
/// 2. Sort by uuid
/// 3. Hash: Blake3(domain || canonical(record_1) || ... || canonical(record_n))
pub async fn catalog_digest<S: Store>(store: &S) -> Result<Blake3Hash> {
    let records: Vec<VideoRecord> = store
        .list_videos(true)
        .await?
        .into_iter()
        .map(|v| v.record)
        .collect();
    digest_records(&records)
}

/// Digest of a set of records, independent of their order.
pub fn digest_records(records: &[VideoRecord]) -> Result<Blake3Hash> {
    let mut sorted: Vec<&VideoRecord> = records.iter().collect();
    sorted.sort_by_key(|r| r.uuid);

    let mut hasher = blake3::Hasher::new();
    hasher.update(CATALOG_DOMAIN);
    for record in sorted {
        hasher.update(&canonical_record_bytes(record)?);
    }
    Ok(Blake3Hash(*hasher.finalize().as_bytes()))
}

/// Result of comparing two catalogs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConvergenceResult {
    /// Both catalogs hold identical records.
    Converged,
    /// The catalogs differ (may need more propagation rounds).
    Diverged {
        /// Present remotely, absent locally.
        missing_local: Vec<VideoUuid>,
        /// Present locally, absent remotely.
        missing_remote: Vec<VideoUuid>,
        /// Present on both sides with different contents.
        differing: Vec<VideoUuid>,
    },
}

impl ConvergenceResult {
    pub fn is_converged(&self) -> bool {
        matches!(self, ConvergenceResult::Converged)
    }
}

/// Compare two sets of records uuid by uuid.
pub fn compare_records(local: &[VideoRecord], remote: &[VideoRecord]) -> Result<ConvergenceResult> {
    let local: BTreeMap<VideoUuid, &VideoRecord> = local.iter().map(|r| (r.uuid, r)).collect();
    let remote: BTreeMap<VideoUuid, &VideoRecord> = remote.iter().map(|r| (r.uuid, r)).collect();

    let mut missing_local = Vec::new();
    let mut missing_remote = Vec::new();
    let mut differing = Vec::new();

    for (uuid, record) in &local {
        match remote.get(uuid) {
            None => missing_remote.push(*uuid),
            Some(other) => {
                if canonical_record_bytes(record)? != canonical_record_bytes(other)? {
                    differing.push(*uuid);
                }
            }
        }
    }
    missing_local.extend(remote.keys().filter(|uuid| !local.contains_key(uuid)));

    if missing_local.is_empty() && missing_remote.is_empty() && differing.is_empty() {
        Ok(ConvergenceResult::Converged)
    } else {
        Ok(ConvergenceResult::Diverged {
            missing_local,
            missing_remote,
            differing,
        })
    }
}

/// Compare the catalogs of two stores.
pub async fn verify_convergence<A: Store, B: Store>(local: &A, remote: &B) -> Result<ConvergenceResult> {
    let local: Vec<VideoRecord> = local.list_videos(true).await?.into_iter().map(|v| v.record).collect();
    let remote: Vec<VideoRecord> = remote.list_videos(true).await?.into_iter().map(|v| v.record).collect();
    compare_records(&local, &remote)
}
