//! Strong type definitions for podfed.
//!
//! All identifiers are newtypes to prevent misuse at compile time.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use uuid::Uuid;

use crate::error::CoreError;

/// Network address of a pod, e.g. `localhost:9001` or `pod.example.org`.
///
/// Hosts are compared as plain strings. The ordering is used as the
/// deterministic tie-break wherever two pods must agree without talking.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PodHost(String);

impl PodHost {
    /// Parse a host, trimming whitespace and any trailing slash.
    pub fn new(host: impl AsRef<str>) -> Result<Self, CoreError> {
        let host = host.as_ref().trim().trim_end_matches('/');
        let host = host
            .strip_prefix("http://")
            .or_else(|| host.strip_prefix("https://"))
            .unwrap_or(host);

        if host.is_empty() {
            return Err(CoreError::InvalidHost("empty host".into()));
        }
        if host.contains(char::is_whitespace) || host.contains('/') {
            return Err(CoreError::InvalidHost(host.to_string()));
        }
        Ok(Self(host.to_string()))
    }

    /// `localhost:<port>`.
    pub fn localhost(port: u16) -> Self {
        Self(format!("localhost:{port}"))
    }

    /// Borrow the host string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for PodHost {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PodHost({})", self.0)
    }
}

impl fmt::Display for PodHost {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for PodHost {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Global identity of a video, stable across every pod that holds it.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VideoUuid(Uuid);

impl VideoUuid {
    /// Generate a fresh random uuid (v4).
    pub fn new_v4() -> Self {
        Self(Uuid::new_v4())
    }

    /// Create from raw bytes.
    pub const fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(Uuid::from_bytes(bytes))
    }

    /// Parse the hyphenated string form.
    pub fn parse(s: &str) -> Result<Self, CoreError> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|e| CoreError::InvalidUuid(e.to_string()))
    }

    /// Get the raw bytes.
    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }

    /// True for the all-zero uuid, which is never issued.
    pub fn is_nil(&self) -> bool {
        self.0.is_nil()
    }
}

impl fmt::Debug for VideoUuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VideoUuid({})", self.0)
    }
}

impl fmt::Display for VideoUuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.hyphenated())
    }
}

/// Prefix of every content identifier produced by [`ContentId::from_content`].
pub const MAGNET_PREFIX: &str = "magnet:?xt=urn:blake3:";

/// Transport-level handle for a file's content (a magnet URI).
///
/// Derived only from the file bytes, so every pod that seeds the same file
/// arrives at a byte-identical identifier.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContentId(String);

impl ContentId {
    /// Derive the identifier for a blob of file content.
    pub fn from_content(bytes: &[u8]) -> Self {
        Self(format!("{}{}", MAGNET_PREFIX, blake3::hash(bytes).to_hex()))
    }

    /// Parse an identifier received from another pod.
    pub fn parse(s: &str) -> Result<Self, CoreError> {
        let digest = s
            .strip_prefix(MAGNET_PREFIX)
            .ok_or_else(|| CoreError::InvalidContentId(s.to_string()))?;
        if digest.len() != 64 || !digest.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(CoreError::InvalidContentId(s.to_string()));
        }
        Ok(Self(s.to_string()))
    }

    /// The hex digest part, usable as a file name.
    pub fn digest_hex(&self) -> &str {
        self.0.strip_prefix(MAGNET_PREFIX).unwrap_or(&self.0)
    }

    /// Borrow the full magnet URI.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// True when the identifier carries no content reference.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for ContentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let digest = self.digest_hex();
        write!(f, "ContentId({})", &digest[..digest.len().min(16)])
    }
}

impl fmt::Display for ContentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Per-origin logical timestamp.
///
/// Wall-clock milliseconds, bumped so that it strictly increases on each
/// origin pod. Used only to order writes to the same video.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LogicalTimestamp(pub u64);

impl LogicalTimestamp {
    /// The zero timestamp; older than anything a clock issues.
    pub const ZERO: Self = Self(0);

    pub const fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for LogicalTimestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A write stamp: logical timestamp with the origin host as tie-break.
///
/// Field ordering makes the derived `Ord` compare the timestamp first.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Stamp {
    pub timestamp: LogicalTimestamp,
    pub origin: PodHost,
}

impl Stamp {
    pub fn new(timestamp: LogicalTimestamp, origin: PodHost) -> Self {
        Self { timestamp, origin }
    }
}

/// Monotonic clock issuing [`LogicalTimestamp`]s for one origin pod.
#[derive(Debug, Default)]
pub struct LogicalClock {
    last: AtomicU64,
}

impl LogicalClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Issue the next timestamp from the wall clock.
    pub fn tick(&self) -> LogicalTimestamp {
        self.tick_at(now_millis().max(0) as u64)
    }

    /// Issue the next timestamp given the current wall-clock reading.
    ///
    /// Returns `max(now_ms, last + 1)`.
    pub fn tick_at(&self, now_ms: u64) -> LogicalTimestamp {
        let mut last = self.last.load(Ordering::Acquire);
        loop {
            let next = now_ms.max(last + 1);
            match self
                .last
                .compare_exchange_weak(last, next, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return LogicalTimestamp(next),
                Err(current) => last = current,
            }
        }
    }

    /// Move the clock past a timestamp seen from another pod, so the next
    /// local write to the same video wins over it.
    pub fn observe(&self, seen: LogicalTimestamp) {
        self.last.fetch_max(seen.0, Ordering::AcqRel);
    }

    /// The last timestamp issued (zero if none).
    pub fn last(&self) -> LogicalTimestamp {
        LogicalTimestamp(self.last.load(Ordering::Acquire))
    }
}

/// Current time in Unix milliseconds.
pub fn now_millis() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}
