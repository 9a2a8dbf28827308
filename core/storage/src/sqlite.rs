//! SQLite-backed durable store.
//!
//! One table per collection, each with the four declared secondary indexes
//! (owner, parent, status, timestamp). Payloads are stored as JSON text so
//! large nested question sets round-trip unchanged.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, info};

use prepsync_common::{Error, Result, SharedClock};

use crate::collection::{Collection, IndexQuery, PersistedEntity};
use crate::store::DurableStore;

/// Current on-disk schema version.
pub const SCHEMA_VERSION: u32 = 1;

/// Raw row as read from SQLite, before payload decoding.
type RawRow = (String, Option<String>, Option<String>, Option<String>, i64, String);

/// Durable store using SQLite.
pub struct SqliteStore {
    conn: Mutex<Connection>,
    clock: SharedClock,
}

impl SqliteStore {
    /// Create or open a store database.
    ///
    /// # Errors
    /// - Database creation or schema migration failure
    pub fn open(db_path: impl AsRef<Path>, clock: SharedClock) -> Result<Self> {
        let conn = Connection::open(db_path.as_ref()).map_err(storage_err)?;
        Self::init(conn, clock)
    }

    /// Create an in-memory store (for testing).
    pub fn in_memory(clock: SharedClock) -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(storage_err)?;
        Self::init(conn, clock)
    }

    fn init(conn: Connection, clock: SharedClock) -> Result<Self> {
        let mut schema = String::from(
            r#"
            CREATE TABLE IF NOT EXISTS store_meta (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );
            "#,
        );
        for collection in Collection::ALL {
            schema.push_str(&table_schema(collection));
        }
        conn.execute_batch(&schema).map_err(storage_err)?;
        conn.execute(
            "INSERT OR REPLACE INTO store_meta (key, value) VALUES ('schema_version', ?1)",
            params![SCHEMA_VERSION.to_string()],
        )
        .map_err(storage_err)?;

        info!("Durable store opened (schema v{})", SCHEMA_VERSION);
        Ok(Self {
            conn: Mutex::new(conn),
            clock,
        })
    }

    /// Read a value from the store metadata table.
    pub fn meta(&self, key: &str) -> Result<Option<String>> {
        let conn = self.conn();
        conn.query_row(
            "SELECT value FROM store_meta WHERE key = ?1",
            params![key],
            |row| row.get(0),
        )
        .optional()
        .map_err(storage_err)
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn select(&self, collection: Collection, filter: &str, arg: &dyn rusqlite::ToSql) -> Result<Vec<PersistedEntity>> {
        let sql = format!(
            "SELECT id, owner_id, parent_id, status, last_updated, payload FROM {} \
             WHERE {} ORDER BY last_updated DESC, id ASC",
            collection.table_name(),
            filter
        );
        let rows: Vec<RawRow> = {
            let conn = self.conn();
            let mut stmt = conn.prepare(&sql).map_err(storage_err)?;
            let mapped = stmt
                .query_map([arg], |row| {
                    Ok((
                        row.get(0)?,
                        row.get(1)?,
                        row.get(2)?,
                        row.get(3)?,
                        row.get(4)?,
                        row.get(5)?,
                    ))
                })
                .map_err(storage_err)?;
            mapped.collect::<rusqlite::Result<_>>().map_err(storage_err)?
        };
        rows.into_iter().map(decode_row).collect()
    }
}

#[async_trait]
impl DurableStore for SqliteStore {
    fn name(&self) -> &str {
        "sqlite"
    }

    async fn put(&self, collection: Collection, mut entity: PersistedEntity) -> Result<PersistedEntity> {
        let millis = self.clock.now().timestamp_millis();
        entity.last_updated = from_millis(millis)?;
        let payload = serde_json::to_string(&entity.payload)?;

        debug!("Upserting {} into {}", entity.id, collection);
        self.conn()
            .execute(
                &format!(
                    "INSERT OR REPLACE INTO {} \
                     (id, owner_id, parent_id, status, last_updated, payload) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                    collection.table_name()
                ),
                params![
                    entity.id,
                    entity.owner_id,
                    entity.parent_id,
                    entity.status,
                    millis,
                    payload,
                ],
            )
            .map_err(storage_err)?;
        Ok(entity)
    }

    async fn get(&self, collection: Collection, id: &str) -> Result<Option<PersistedEntity>> {
        Ok(self.select(collection, "id = ?1", &id)?.into_iter().next())
    }

    async fn query_by_index(
        &self,
        collection: Collection,
        query: &IndexQuery,
    ) -> Result<Vec<PersistedEntity>> {
        match query {
            IndexQuery::Owner(owner) => self.select(collection, "owner_id = ?1", owner),
            IndexQuery::Parent(parent) => self.select(collection, "parent_id = ?1", parent),
            IndexQuery::Status(status) => self.select(collection, "status = ?1", status),
            IndexQuery::UpdatedSince(since) => {
                self.select(collection, "last_updated >= ?1", &since.timestamp_millis())
            }
        }
    }

    async fn delete(&self, collection: Collection, id: &str) -> Result<bool> {
        debug!("Deleting {} from {}", id, collection);
        let removed = self
            .conn()
            .execute(
                &format!("DELETE FROM {} WHERE id = ?1", collection.table_name()),
                params![id],
            )
            .map_err(storage_err)?;
        Ok(removed > 0)
    }

    async fn clear(&self, collection: Collection) -> Result<()> {
        info!("Clearing collection {}", collection);
        self.conn()
            .execute(&format!("DELETE FROM {}", collection.table_name()), [])
            .map_err(storage_err)?;
        Ok(())
    }

    async fn count(&self, collection: Collection) -> Result<u64> {
        let count: i64 = self
            .conn()
            .query_row(
                &format!("SELECT COUNT(*) FROM {}", collection.table_name()),
                [],
                |row| row.get(0),
            )
            .map_err(storage_err)?;
        Ok(count as u64)
    }

    async fn purge_before(&self, collection: Collection, cutoff: DateTime<Utc>) -> Result<u64> {
        let removed = self
            .conn()
            .execute(
                &format!("DELETE FROM {} WHERE last_updated < ?1", collection.table_name()),
                params![cutoff.timestamp_millis()],
            )
            .map_err(storage_err)?;
        if removed > 0 {
            info!("Purged {} stale entities from {}", removed, collection);
        }
        Ok(removed as u64)
    }
}

fn table_schema(collection: Collection) -> String {
    let t = collection.table_name();
    format!(
        r#"
        CREATE TABLE IF NOT EXISTS {t} (
            id TEXT PRIMARY KEY,
            owner_id TEXT,
            parent_id TEXT,
            status TEXT,
            last_updated INTEGER NOT NULL,
            payload TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_{t}_owner ON {t}(owner_id);
        CREATE INDEX IF NOT EXISTS idx_{t}_parent ON {t}(parent_id);
        CREATE INDEX IF NOT EXISTS idx_{t}_status ON {t}(status);
        CREATE INDEX IF NOT EXISTS idx_{t}_timestamp ON {t}(last_updated);
        "#
    )
}

fn decode_row(row: RawRow) -> Result<PersistedEntity> {
    let (id, owner_id, parent_id, status, last_updated, payload) = row;
    Ok(PersistedEntity {
        id,
        owner_id,
        parent_id,
        status,
        last_updated: from_millis(last_updated)?,
        payload: serde_json::from_str(&payload)?,
    })
}

fn from_millis(millis: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(millis)
        .ok_or_else(|| Error::Storage(format!("timestamp out of range: {}", millis)))
}

fn storage_err(err: rusqlite::Error) -> Error {
    Error::Storage(err.to_string())
}
