use chrono::{Duration, Utc};
use inspektor_common::{
    DatastoreId, Error, MetadataPayload, MetadataRequest, MetadataSnapshot, Relationship,
    RelationshipKey, Result,
};
use rusqlite::{Connection, OptionalExtension, params};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, info};

use crate::migrations::METADATA_CACHE_SCHEMA_V1;
use crate::session_store::parse_timestamp;

pub const DEFAULT_TTL_HOURS: i64 = 24;

/// Per-datastore schema knowledge accumulated across metadata round-trips.
///
/// Merges only ever add facts. An entry disappears when its TTL elapses (it
/// is evicted by the next `get`) or when it is invalidated explicitly. Every
/// merge is a read-modify-write under the connection lock, so concurrent
/// conversations sharing a datastore never lose each other's facts.
pub struct MetadataCache {
    conn: Mutex<Connection>,
    ttl: Duration,
}

impl MetadataCache {
    pub fn open(db_path: &Path, ttl: Duration) -> Result<Self> {
        info!("opening metadata cache at {}", db_path.display());
        let conn = Connection::open(db_path)
            .map_err(|e| Error::Database(format!("failed to open metadata cache: {e}")))?;

        conn.execute_batch("PRAGMA journal_mode=WAL;")
            .map_err(|e| Error::Database(format!("failed to set pragmas: {e}")))?;

        let cache = Self {
            conn: Mutex::new(conn),
            ttl,
        };
        cache.run_migrations()?;
        Ok(cache)
    }

    pub fn in_memory(ttl: Duration) -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| Error::Database(format!("failed to open in-memory database: {e}")))?;

        let cache = Self {
            conn: Mutex::new(conn),
            ttl,
        };
        cache.run_migrations()?;
        Ok(cache)
    }

    fn run_migrations(&self) -> Result<()> {
        let conn = self.connection()?;
        conn.execute_batch(METADATA_CACHE_SCHEMA_V1.sql)
            .map_err(|e| Error::Database(format!("metadata cache migration failed: {e}")))?;
        Ok(())
    }

    fn connection(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| Error::Database("metadata cache lock poisoned".into()))
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Fresh snapshot for the datastore, or `None` when absent or expired.
    pub fn get(&self, datastore_id: &DatastoreId) -> Result<Option<MetadataSnapshot>> {
        let conn = self.connection()?;
        load_fresh(&conn, datastore_id)
    }

    /// Fold `payload` into the datastore's entry and refresh its expiry.
    pub fn merge(
        &self,
        datastore_id: &DatastoreId,
        payload: &MetadataPayload,
    ) -> Result<MetadataSnapshot> {
        self.merge_inner(datastore_id, None, payload)
    }

    /// Like [`merge`](Self::merge), and also remembers that `request` was
    /// answered so repeating it is recognised even when the answer was empty.
    pub fn merge_fulfilled(
        &self,
        datastore_id: &DatastoreId,
        request: &MetadataRequest,
        payload: &MetadataPayload,
    ) -> Result<MetadataSnapshot> {
        self.merge_inner(datastore_id, Some(request), payload)
    }

    fn merge_inner(
        &self,
        datastore_id: &DatastoreId,
        request: Option<&MetadataRequest>,
        payload: &MetadataPayload,
    ) -> Result<MetadataSnapshot> {
        let conn = self.connection()?;

        let mut snapshot = load_fresh(&conn, datastore_id)?
            .unwrap_or_else(|| MetadataSnapshot::empty(datastore_id.clone()));
        merge_payload(&mut snapshot, payload);
        if let Some(request) = request {
            snapshot.fetched_requests.insert(request.key());
        }

        let now = Utc::now();
        snapshot.merged_at = now;
        let snapshot_json = serde_json::to_string(&snapshot)
            .map_err(|e| Error::Database(format!("failed to serialize metadata snapshot: {e}")))?;

        conn.execute(
            "INSERT INTO metadata_cache (datastore_id, snapshot, merged_at, expires_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(datastore_id) DO UPDATE SET
                snapshot = excluded.snapshot,
                merged_at = excluded.merged_at,
                expires_at = excluded.expires_at",
            params![
                datastore_id.as_str(),
                snapshot_json,
                now.to_rfc3339(),
                (now + self.ttl).to_rfc3339(),
            ],
        )
        .map_err(|e| Error::Database(format!("failed to store metadata snapshot: {e}")))?;

        debug!(
            datastore_id = %datastore_id,
            kind = payload.kind().as_str(),
            tables = snapshot.tables.len(),
            schemas = snapshot.schemas.len(),
            relationships = snapshot.relationships.len(),
            "merged metadata"
        );
        Ok(snapshot)
    }

    /// Drop everything known about the datastore. Returns whether an entry existed.
    pub fn invalidate(&self, datastore_id: &DatastoreId) -> Result<bool> {
        let conn = self.connection()?;
        let deleted = conn
            .execute(
                "DELETE FROM metadata_cache WHERE datastore_id = ?",
                params![datastore_id.as_str()],
            )
            .map_err(|e| Error::Database(format!("failed to invalidate metadata: {e}")))?;

        info!("invalidated metadata cache for {datastore_id}");
        Ok(deleted > 0)
    }

    /// Evict every expired entry. Returns the number removed.
    pub fn cleanup_expired(&self) -> Result<usize> {
        let conn = self.connection()?;
        let mut stmt = conn
            .prepare("SELECT datastore_id, expires_at FROM metadata_cache")
            .map_err(|e| Error::Database(format!("failed to prepare cleanup: {e}")))?;
        let rows = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))
            .map_err(|e| Error::Database(format!("failed to scan metadata cache: {e}")))?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| Error::Database(format!("failed to collect metadata rows: {e}")))?;
        drop(stmt);

        let now = Utc::now();
        let mut removed = 0;
        for (datastore_id, expires_at) in rows {
            if parse_timestamp(&expires_at)? <= now {
                removed += conn
                    .execute(
                        "DELETE FROM metadata_cache WHERE datastore_id = ?",
                        params![datastore_id],
                    )
                    .map_err(|e| Error::Database(format!("failed to evict metadata: {e}")))?;
            }
        }

        if removed > 0 {
            info!("cleaned up {removed} expired metadata entries");
        }
        Ok(removed)
    }
}

fn load_fresh(conn: &Connection, datastore_id: &DatastoreId) -> Result<Option<MetadataSnapshot>> {
    let row: Option<(String, String)> = conn
        .query_row(
            "SELECT snapshot, expires_at FROM metadata_cache WHERE datastore_id = ?",
            params![datastore_id.as_str()],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()
        .map_err(|e| Error::Database(format!("failed to load metadata snapshot: {e}")))?;

    let Some((snapshot_json, expires_at)) = row else {
        return Ok(None);
    };

    if parse_timestamp(&expires_at)? <= Utc::now() {
        conn.execute(
            "DELETE FROM metadata_cache WHERE datastore_id = ?",
            params![datastore_id.as_str()],
        )
        .map_err(|e| Error::Database(format!("failed to evict expired metadata: {e}")))?;
        debug!(datastore_id = %datastore_id, "evicted expired metadata");
        return Ok(None);
    }

    let snapshot = serde_json::from_str(&snapshot_json)
        .map_err(|e| Error::Database(format!("corrupt metadata snapshot: {e}")))?;
    Ok(Some(snapshot))
}

/// Union for tables and relationships, keyed upsert for schemas.
fn merge_payload(snapshot: &mut MetadataSnapshot, payload: &MetadataPayload) {
    match payload {
        MetadataPayload::Tables(tables) => {
            snapshot.tables.extend(tables.iter().cloned());
            snapshot.tables_fetched = true;
        }
        MetadataPayload::Schema(schemas) => {
            for (table, columns) in schemas {
                snapshot.tables.insert(table.clone());
                snapshot.schemas.insert(table.clone(), columns.clone());
            }
        }
        MetadataPayload::Relationships(edges) => {
            let mut merged: BTreeMap<RelationshipKey, Relationship> = snapshot
                .relationships
                .drain(..)
                .map(|r| (r.key(), r))
                .collect();
            for edge in edges {
                merged.entry(edge.key()).or_insert_with(|| edge.clone());
            }
            snapshot.relationships = merged.into_values().collect();
            snapshot.relationships_fetched = true;
        }
    }
}
