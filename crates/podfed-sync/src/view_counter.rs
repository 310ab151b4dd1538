//! Per-video view accumulation between flushes.
//!
//! Recording a view is one atomic add; the map is only write-locked the
//! first time a uuid is seen. A flush swaps every counter back to zero and
//! hands the deltas to the caller, which turns them into
//! `ViewsIncremented` events. Counters left at zero are dropped from the map
//! unless a recorder still holds them.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use podfed_core::VideoUuid;

#[derive(Default)]
pub struct ViewCounter {
    counters: RwLock<HashMap<VideoUuid, Arc<AtomicU64>>>,
}

impl ViewCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count one view.
    pub fn record(&self, uuid: VideoUuid) {
        self.add(uuid, 1);
    }

    fn add(&self, uuid: VideoUuid, n: u64) {
        let existing = self
            .counters
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&uuid)
            .cloned();
        let counter = match existing {
            Some(counter) => counter,
            None => Arc::clone(
                self.counters
                    .write()
                    .unwrap_or_else(PoisonError::into_inner)
                    .entry(uuid)
                    .or_default(),
            ),
        };
        counter.fetch_add(n, Ordering::Relaxed);
    }

    /// Take every non-zero delta, resetting it to zero.
    ///
    /// Sorted by uuid so flushes are deterministic.
    pub fn drain(&self) -> Vec<(VideoUuid, u64)> {
        let mut counters = self.counters.write().unwrap_or_else(PoisonError::into_inner);
        let mut deltas: Vec<(VideoUuid, u64)> = counters
            .iter()
            .filter_map(|(uuid, c)| match c.swap(0, Ordering::AcqRel) {
                0 => None,
                n => Some((*uuid, n)),
            })
            .collect();
        // A recorder that cloned a counter before the lock may still add to it.
        counters.retain(|_, c| Arc::strong_count(c) > 1 || c.load(Ordering::Acquire) != 0);
        deltas.sort_by_key(|(uuid, _)| *uuid);
        deltas
    }

    /// Number of videos with a live counter.
    pub fn tracked(&self) -> usize {
        self.counters
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Put a delta back after a failed flush.
    pub fn restore(&self, uuid: VideoUuid, delta: u64) {
        self.add(uuid, delta);
    }

    /// Unflushed delta for one video.
    pub fn pending(&self, uuid: &VideoUuid) -> u64 {
        self.counters
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(uuid)
            .map(|c| c.load(Ordering::Acquire))
            .unwrap_or(0)
    }

    /// Sum of all unflushed deltas.
    pub fn pending_total(&self) -> u64 {
        self.counters
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .map(|c| c.load(Ordering::Acquire))
            .sum()
    }
}
