//! Database schema migrations for SQLite.
//!
//! We use a simple versioned migration system. Each migration is a SQL string
//! that transforms the schema from version N to N+1.

use rusqlite::Connection;

use podfed_core::now_millis;

use crate::error::{Result, StoreError};

/// Current schema version.
pub const CURRENT_VERSION: u32 = 2;

/// Initialize or migrate the database schema.
///
/// This function is idempotent - it can be called multiple times safely.
pub fn migrate(conn: &mut Connection) -> Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            version INTEGER PRIMARY KEY,
            applied_at INTEGER NOT NULL
        )",
        [],
    )?;

    let current: u32 = conn
        .query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
            [],
            |row| row.get(0),
        )
        .unwrap_or(0);

    if current < CURRENT_VERSION {
        let tx = conn.transaction()?;

        for version in (current + 1)..=CURRENT_VERSION {
            apply_migration(&tx, version)?;

            tx.execute(
                "INSERT INTO schema_migrations (version, applied_at) VALUES (?1, ?2)",
                rusqlite::params![version, now_millis()],
            )?;
        }

        tx.commit()?;
    }

    Ok(())
}

fn apply_migration(conn: &Connection, version: u32) -> Result<()> {
    match version {
        1 => apply_v1(conn),
        2 => apply_v2(conn),
        _ => Err(StoreError::Migration(format!(
            "unknown migration version: {}",
            version
        ))),
    }
}

/// Migration v1: Initial schema.
fn apply_v1(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        -- Video catalog, local and remote
        CREATE TABLE videos (
            id INTEGER PRIMARY KEY AUTOINCREMENT,  -- pod-local id
            uuid TEXT NOT NULL UNIQUE,             -- global identity
            is_local INTEGER NOT NULL,             -- 1 if uploaded here
            tombstoned INTEGER NOT NULL DEFAULT 0,
            created_at INTEGER NOT NULL,           -- Unix ms
            record BLOB NOT NULL                   -- CBOR VideoRecord
        );

        -- Pod directory
        CREATE TABLE pods (
            host TEXT PRIMARY KEY,
            public_key_fingerprint TEXT,
            state TEXT NOT NULL,
            last_seen_at INTEGER NOT NULL DEFAULT 0,
            score INTEGER NOT NULL
        );

        -- Dedup index of applied events
        CREATE TABLE applied_events (
            video_uuid TEXT NOT NULL,
            event_type TEXT NOT NULL,
            logical_ts INTEGER NOT NULL,
            origin TEXT NOT NULL,
            applied_at INTEGER NOT NULL,
            PRIMARY KEY (video_uuid, event_type, logical_ts, origin)
        );

        -- Durable per-destination delivery queue
        CREATE TABLE outbound_queue (
            seq INTEGER PRIMARY KEY AUTOINCREMENT,
            destination TEXT NOT NULL,
            item BLOB NOT NULL,                    -- CBOR OutboundItem
            enqueued_at INTEGER NOT NULL
        );

        -- Content identifier -> local file path
        CREATE TABLE content_refs (
            content_id TEXT PRIMARY KEY,
            path TEXT NOT NULL
        );

        CREATE INDEX idx_videos_created ON videos(created_at, id);
        CREATE INDEX idx_outbound_destination ON outbound_queue(destination, seq);
        "#,
    )?;

    Ok(())
}

/// Migration v2: keep the delta of applied view events, so a snapshot can
/// carry the events a view count is made of.
fn apply_v2(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        ALTER TABLE applied_events ADD COLUMN view_delta INTEGER;  -- NULL unless views_incremented
        "#,
    )?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migration_creates_tables() {
        let mut conn = Connection::open_in_memory().unwrap();
        migrate(&mut conn).unwrap();

        let tables: Vec<String> = conn
            .prepare("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")
            .unwrap()
            .query_map([], |row| row.get(0))
            .unwrap()
            .collect::<std::result::Result<Vec<_>, _>>()
            .unwrap();

        for table in [
            "videos",
            "pods",
            "applied_events",
            "outbound_queue",
            "content_refs",
            "schema_migrations",
        ] {
            assert!(tables.contains(&table.to_string()), "missing {table}");
        }
    }

    #[test]
    fn test_migration_idempotent() {
        let mut conn = Connection::open_in_memory().unwrap();
        migrate(&mut conn).unwrap();
        migrate(&mut conn).unwrap();
        migrate(&mut conn).unwrap();

        let version: u32 = conn
            .query_row("SELECT MAX(version) FROM schema_migrations", [], |row| {
                row.get(0)
            })
            .unwrap();
        assert_eq!(version, CURRENT_VERSION);
    }

    #[test]
    fn test_v1_database_is_upgraded() {
        let mut conn = Connection::open_in_memory().unwrap();
        conn.execute(
            "CREATE TABLE schema_migrations (version INTEGER PRIMARY KEY, applied_at INTEGER NOT NULL)",
            [],
        )
        .unwrap();
        apply_v1(&conn).unwrap();
        conn.execute("INSERT INTO schema_migrations VALUES (1, 0)", []).unwrap();

        migrate(&mut conn).unwrap();
        let has_delta: bool = conn
            .prepare("SELECT view_delta FROM applied_events")
            .is_ok();
        assert!(has_delta);
    }
}
