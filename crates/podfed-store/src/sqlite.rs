//! SQLite implementation of the Store trait.
//!
//! This is the primary storage backend for a pod. It uses rusqlite with
//! bundled SQLite, wrapped in async via tokio::spawn_blocking.

use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};

use podfed_core::{
    decode_cbor, encode_cbor, now_millis, ContentId, DedupKey, EventPayload, EventType,
    LogicalTimestamp, OutboundItem, Pod, PodHost, PropagationEvent, RelationshipState, Video,
    VideoRecord, VideoUuid,
};

use crate::error::{Result, StoreError};
use crate::migration;
use crate::traits::{QueuedItem, Store};

/// SQLite-based store implementation.
///
/// Thread-safe via internal Mutex. All operations use spawn_blocking
/// to avoid blocking the async runtime.
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Open a SQLite database at the given path.
    ///
    /// Creates the file and runs migrations if it doesn't exist.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let mut conn = Connection::open(path)?;
        migration::migrate(&mut conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Open an in-memory SQLite database.
    ///
    /// Useful for testing.
    pub fn open_memory() -> Result<Self> {
        let mut conn = Connection::open_in_memory()?;
        migration::migrate(&mut conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run a blocking operation on the connection off the async runtime.
    async fn run<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = conn
                .lock()
                .map_err(|e| StoreError::Unavailable(format!("mutex poisoned: {}", e)))?;
            f(&mut conn)
        })
        .await
        .map_err(|e| StoreError::Unavailable(format!("spawn_blocking failed: {}", e)))?
    }
}

fn row_to_video(id: i64, is_local: bool, record: &[u8]) -> Result<Video> {
    let record: VideoRecord = decode_cbor(record)?;
    Ok(Video {
        id: id as u64,
        is_local,
        record,
    })
}

type PodRow = (String, Option<String>, String, i64, i32);

fn row_to_pod((host, fingerprint, state, last_seen_at, score): PodRow) -> Result<Pod> {
    Ok(Pod {
        host: PodHost::new(&host).map_err(|e| StoreError::InvalidData(e.to_string()))?,
        public_key_fingerprint: fingerprint,
        state: RelationshipState::parse(&state)
            .map_err(|e| StoreError::InvalidData(e.to_string()))?,
        last_seen_at,
        score,
    })
}

fn select_video(conn: &Connection, uuid: &str) -> Result<Option<Video>> {
    let row: Option<(i64, bool, Vec<u8>)> = conn
        .query_row(
            "SELECT id, is_local, record FROM videos WHERE uuid = ?1",
            params![uuid],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )
        .optional()?;
    row.map(|(id, is_local, record)| row_to_video(id, is_local, &record))
        .transpose()
}

/// A record ready to be written to the `videos` table.
struct VideoRow {
    uuid: String,
    is_local: bool,
    tombstoned: bool,
    created_at: i64,
    record: Vec<u8>,
}

impl VideoRow {
    fn new(record: &VideoRecord, is_local: bool) -> Result<Self> {
        Ok(Self {
            uuid: record.uuid.to_string(),
            is_local,
            tombstoned: record.tombstoned,
            created_at: record.created_at,
            record: encode_cbor(record)?,
        })
    }

    /// Insert or update; `is_local` and the id are only set on insert.
    fn upsert(&self, conn: &Connection) -> Result<u64> {
        conn.execute(
            "INSERT INTO videos (uuid, is_local, tombstoned, created_at, record)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(uuid) DO UPDATE SET
                tombstoned = excluded.tombstoned,
                created_at = excluded.created_at,
                record = excluded.record",
            params![
                self.uuid,
                self.is_local,
                self.tombstoned,
                self.created_at,
                self.record
            ],
        )?;
        let id: i64 = conn.query_row(
            "SELECT id FROM videos WHERE uuid = ?1",
            params![self.uuid],
            |row| row.get(0),
        )?;
        Ok(id as u64)
    }
}

#[async_trait]
impl Store for SqliteStore {
    async fn get_video(&self, uuid: &VideoUuid) -> Result<Option<Video>> {
        let uuid = uuid.to_string();
        self.run(move |conn| select_video(conn, &uuid)).await
    }

    async fn upsert_video(&self, record: &VideoRecord, is_local: bool) -> Result<u64> {
        let row = VideoRow::new(record, is_local)?;
        self.run(move |conn| row.upsert(conn)).await
    }

    async fn list_videos(&self, include_tombstoned: bool) -> Result<Vec<Video>> {
        self.run(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, is_local, record FROM videos
                 WHERE ?1 OR tombstoned = 0
                 ORDER BY created_at, id",
            )?;
            let rows = stmt
                .query_map(params![include_tombstoned], |row| {
                    Ok((row.get::<_, i64>(0)?, row.get::<_, bool>(1)?, row.get::<_, Vec<u8>>(2)?))
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            rows.into_iter()
                .map(|(id, is_local, record)| row_to_video(id, is_local, &record))
                .collect()
        })
        .await
    }

    async fn get_pod(&self, host: &PodHost) -> Result<Option<Pod>> {
        let host = host.to_string();
        self.run(move |conn| {
            let row: Option<PodRow> = conn
                .query_row(
                    "SELECT host, public_key_fingerprint, state, last_seen_at, score
                     FROM pods WHERE host = ?1",
                    params![host],
                    |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?)),
                )
                .optional()?;
            row.map(row_to_pod).transpose()
        })
        .await
    }

    async fn upsert_pod(&self, pod: &Pod) -> Result<()> {
        let pod = pod.clone();
        self.run(move |conn| {
            conn.execute(
                "INSERT INTO pods (host, public_key_fingerprint, state, last_seen_at, score)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(host) DO UPDATE SET
                    public_key_fingerprint = excluded.public_key_fingerprint,
                    state = excluded.state,
                    last_seen_at = excluded.last_seen_at,
                    score = excluded.score",
                params![
                    pod.host.as_str(),
                    pod.public_key_fingerprint,
                    pod.state.as_str(),
                    pod.last_seen_at,
                    pod.score,
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn list_pods(&self) -> Result<Vec<Pod>> {
        self.run(|conn| {
            let mut stmt = conn.prepare(
                "SELECT host, public_key_fingerprint, state, last_seen_at, score
                 FROM pods ORDER BY host",
            )?;
            let rows: Vec<PodRow> = stmt
                .query_map([], |row| {
                    Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?))
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            rows.into_iter().map(row_to_pod).collect()
        })
        .await
    }

    async fn has_applied(&self, key: &DedupKey) -> Result<bool> {
        let key = key.clone();
        self.run(move |conn| {
            let found: Option<i64> = conn
                .query_row(
                    "SELECT 1 FROM applied_events
                     WHERE video_uuid = ?1 AND event_type = ?2 AND logical_ts = ?3 AND origin = ?4",
                    params![
                        key.video_uuid.to_string(),
                        key.event_type.as_str(),
                        key.timestamp.as_u64() as i64,
                        key.origin.as_str(),
                    ],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(found.is_some())
        })
        .await
    }

    async fn commit_event(
        &self,
        event: &PropagationEvent,
        write: Option<(&VideoRecord, bool)>,
        at: i64,
    ) -> Result<bool> {
        let key = event.dedup_key();
        let view_delta = match event.payload {
            EventPayload::ViewsIncremented { delta } => Some(delta as i64),
            _ => None,
        };
        let row = write
            .map(|(record, is_local)| VideoRow::new(record, is_local))
            .transpose()?;

        self.run(move |conn| {
            let tx = conn.transaction()?;
            let inserted = tx.execute(
                "INSERT OR IGNORE INTO applied_events
                    (video_uuid, event_type, logical_ts, origin, applied_at, view_delta)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    key.video_uuid.to_string(),
                    key.event_type.as_str(),
                    key.timestamp.as_u64() as i64,
                    key.origin.as_str(),
                    at,
                    view_delta,
                ],
            )?;
            if inserted == 0 {
                return Ok(false);
            }
            if let Some(row) = row {
                row.upsert(&tx)?;
            }
            tx.commit()?;
            Ok(true)
        })
        .await
    }

    async fn applied_views(&self, uuid: &VideoUuid) -> Result<Vec<PropagationEvent>> {
        let uuid = *uuid;
        self.run(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT logical_ts, origin, view_delta FROM applied_events
                 WHERE video_uuid = ?1 AND event_type = ?2 AND view_delta IS NOT NULL
                 ORDER BY logical_ts, origin",
            )?;
            let rows: Vec<(i64, String, i64)> = stmt
                .query_map(
                    params![uuid.to_string(), EventType::ViewsIncremented.as_str()],
                    |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
                )?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            rows.into_iter()
                .map(|(ts, origin, delta)| {
                    let origin = PodHost::new(&origin)
                        .map_err(|e| StoreError::InvalidData(e.to_string()))?;
                    Ok(PropagationEvent::new(
                        uuid,
                        origin,
                        LogicalTimestamp(ts as u64),
                        EventPayload::ViewsIncremented {
                            delta: delta as u64,
                        },
                    ))
                })
                .collect()
        })
        .await
    }

    async fn enqueue_outbound(&self, destination: &PodHost, item: &OutboundItem) -> Result<u64> {
        let bytes = encode_cbor(item)?;
        let destination = destination.to_string();
        self.run(move |conn| {
            conn.execute(
                "INSERT INTO outbound_queue (destination, item, enqueued_at) VALUES (?1, ?2, ?3)",
                params![destination, bytes, now_millis()],
            )?;
            Ok(conn.last_insert_rowid() as u64)
        })
        .await
    }

    async fn peek_outbound(&self, destination: &PodHost) -> Result<Option<QueuedItem>> {
        let destination = destination.clone();
        self.run(move |conn| {
            let row: Option<(i64, Vec<u8>, i64)> = conn
                .query_row(
                    "SELECT seq, item, enqueued_at FROM outbound_queue
                     WHERE destination = ?1 ORDER BY seq LIMIT 1",
                    params![destination.as_str()],
                    |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
                )
                .optional()?;
            match row {
                Some((seq, item, enqueued_at)) => Ok(Some(QueuedItem {
                    seq: seq as u64,
                    destination,
                    item: decode_cbor(&item)?,
                    enqueued_at,
                })),
                None => Ok(None),
            }
        })
        .await
    }

    async fn ack_outbound(&self, destination: &PodHost, seq: u64) -> Result<()> {
        let destination = destination.to_string();
        self.run(move |conn| {
            conn.execute(
                "DELETE FROM outbound_queue WHERE destination = ?1 AND seq = ?2",
                params![destination, seq as i64],
            )?;
            Ok(())
        })
        .await
    }

    async fn drop_outbound(&self, destination: &PodHost) -> Result<usize> {
        let destination = destination.to_string();
        self.run(move |conn| {
            let removed = conn.execute(
                "DELETE FROM outbound_queue WHERE destination = ?1",
                params![destination],
            )?;
            Ok(removed)
        })
        .await
    }

    async fn outbound_destinations(&self) -> Result<Vec<PodHost>> {
        self.run(|conn| {
            let mut stmt = conn
                .prepare("SELECT DISTINCT destination FROM outbound_queue ORDER BY destination")?;
            let hosts: Vec<String> = stmt
                .query_map([], |row| row.get(0))?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            hosts
                .into_iter()
                .map(|h| PodHost::new(&h).map_err(|e| StoreError::InvalidData(e.to_string())))
                .collect()
        })
        .await
    }

    async fn outbound_len(&self, destination: Option<&PodHost>) -> Result<usize> {
        let destination = destination.map(|d| d.to_string());
        self.run(move |conn| {
            let count: i64 = match destination {
                Some(d) => conn.query_row(
                    "SELECT COUNT(*) FROM outbound_queue WHERE destination = ?1",
                    params![d],
                    |row| row.get(0),
                )?,
                None => conn.query_row("SELECT COUNT(*) FROM outbound_queue", [], |row| {
                    row.get(0)
                })?,
            };
            Ok(count as usize)
        })
        .await
    }

    async fn put_content_ref(&self, content_id: &ContentId, path: &str) -> Result<()> {
        let content_id = content_id.to_string();
        let path = path.to_string();
        self.run(move |conn| {
            conn.execute(
                "INSERT INTO content_refs (content_id, path) VALUES (?1, ?2)
                 ON CONFLICT(content_id) DO UPDATE SET path = excluded.path",
                params![content_id, path],
            )?;
            Ok(())
        })
        .await
    }

    async fn get_content_ref(&self, content_id: &ContentId) -> Result<Option<String>> {
        let content_id = content_id.to_string();
        self.run(move |conn| {
            conn.query_row(
                "SELECT path FROM content_refs WHERE content_id = ?1",
                params![content_id],
                |row| row.get(0),
            )
            .optional()
            .map_err(StoreError::from)
        })
        .await
    }
}
