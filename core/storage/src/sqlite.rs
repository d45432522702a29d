//! SQLite-backed durable store.
//!
//! One `records` table keyed by (collection, id) plus an `outbox` table with
//! an auto-incrementing entry id. Compound operations run inside a single
//! transaction; that transaction boundary is the crash-safety contract the
//! sync engine relies on.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use std::collections::HashSet;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, info};

use satchel_common::{CollectionName, Error, Record, RecordId, Result};

use crate::outbox::{EntryId, OperationKind, OutboxEntry};
use crate::store::KeyValueStore;

/// Current schema version. Migrations only ever move forward.
const SCHEMA_VERSION: i64 = 1;

fn db_err(e: rusqlite::Error) -> Error {
    Error::Storage(e.to_string())
}

fn ts_to_millis(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_millis()
}

fn ts_from_millis(ms: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| Error::Storage(format!("Invalid timestamp in database: {}", ms)))
}

/// Durable store backed by SQLite.
///
/// Calls are short and local, so they run inline on the connection behind a
/// mutex rather than hopping to a blocking pool.
pub struct SqliteStore {
    collections: Vec<CollectionName>,
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Create or open the database at `db_path`.
    ///
    /// Idempotent: missing tables are created, an older schema is migrated
    /// forward. A database written by a newer schema version is refused.
    ///
    /// # Errors
    /// - Database open, schema creation or migration failure. Nothing can
    ///   function without the store, so callers must treat this as fatal.
    pub fn open(db_path: impl AsRef<Path>, collections: Vec<CollectionName>) -> Result<Self> {
        let conn = Connection::open(db_path).map_err(db_err)?;
        Self::init(conn, collections)
    }

    /// Create an in-memory database (for testing).
    pub fn in_memory(collections: Vec<CollectionName>) -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(db_err)?;
        Self::init(conn, collections)
    }

    fn init(conn: Connection, collections: Vec<CollectionName>) -> Result<Self> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS records (
                collection TEXT NOT NULL,
                id TEXT NOT NULL,
                temporary INTEGER NOT NULL,
                payload TEXT NOT NULL,
                updated_at INTEGER NOT NULL,
                PRIMARY KEY (collection, id)
            );

            CREATE TABLE IF NOT EXISTS outbox (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                collection TEXT NOT NULL,
                kind TEXT NOT NULL,
                target TEXT NOT NULL,
                target_temporary INTEGER NOT NULL,
                payload TEXT,
                created_at INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_outbox_collection ON outbox(collection);
            CREATE INDEX IF NOT EXISTS idx_outbox_kind ON outbox(kind);
            CREATE INDEX IF NOT EXISTS idx_outbox_created ON outbox(created_at);

            CREATE TABLE IF NOT EXISTS meta (
                key TEXT PRIMARY KEY,
                value INTEGER NOT NULL
            );
            "#,
        )
        .map_err(db_err)?;

        let version: Option<i64> = conn
            .query_row(
                "SELECT value FROM meta WHERE key = 'schema_version'",
                [],
                |row| row.get(0),
            )
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(db_err(other)),
            })?;

        match version {
            None => {
                conn.execute(
                    "INSERT INTO meta (key, value) VALUES ('schema_version', ?1)",
                    params![SCHEMA_VERSION],
                )
                .map_err(db_err)?;
            }
            Some(v) if v > SCHEMA_VERSION => {
                return Err(Error::Storage(format!(
                    "Database schema version {} is newer than supported version {}",
                    v, SCHEMA_VERSION
                )));
            }
            Some(v) if v < SCHEMA_VERSION => {
                // Forward-only migrations land here as the schema evolves.
                conn.execute(
                    "UPDATE meta SET value = ?1 WHERE key = 'schema_version'",
                    params![SCHEMA_VERSION],
                )
                .map_err(db_err)?;
                info!("Migrated store schema from {} to {}", v, SCHEMA_VERSION);
            }
            Some(_) => {}
        }

        info!(collections = collections.len(), "Opened sqlite store");
        Ok(Self {
            collections,
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().expect("sqlite connection lock poisoned")
    }

    fn check(&self, collection: &CollectionName) -> Result<()> {
        if self.collections.contains(collection) {
            Ok(())
        } else {
            Err(Error::UnknownCollection(collection.to_string()))
        }
    }

    fn record_from_row(id: String, temporary: bool, payload: String, ms: i64) -> Result<Record> {
        let payload = serde_json::from_str(&payload)
            .map_err(|e| Error::Serialization(format!("Corrupt record payload: {}", e)))?;
        let id = if temporary {
            RecordId::Temporary(id)
        } else {
            RecordId::Permanent(id)
        };
        Ok(Record {
            id,
            payload,
            updated_at: ts_from_millis(ms)?,
        })
    }

    fn entry_from_row(
        id: EntryId,
        collection: String,
        kind: String,
        target: String,
        target_temporary: bool,
        payload: Option<String>,
        ms: i64,
    ) -> Result<OutboxEntry> {
        let payload = payload
            .map(|p| {
                serde_json::from_str(&p)
                    .map_err(|e| Error::Serialization(format!("Corrupt entry payload: {}", e)))
            })
            .transpose()?;
        let target = if target_temporary {
            RecordId::Temporary(target)
        } else {
            RecordId::Permanent(target)
        };
        Ok(OutboxEntry {
            id,
            kind: OperationKind::parse(&kind)?,
            collection: CollectionName::new(collection)?,
            target,
            payload,
            created_at: ts_from_millis(ms)?,
        })
    }

    fn payload_json(record: &Record) -> Result<String> {
        serde_json::to_string(&record.payload).map_err(|e| Error::Serialization(e.to_string()))
    }

    fn upsert_record(
        conn: &Connection,
        collection: &CollectionName,
        record: &Record,
    ) -> Result<()> {
        conn.execute(
            r#"
            INSERT OR REPLACE INTO records (collection, id, temporary, payload, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            "#,
            params![
                collection.as_str(),
                record.id.as_str(),
                record.id.is_temporary() as i32,
                Self::payload_json(record)?,
                ts_to_millis(record.updated_at),
            ],
        )
        .map_err(db_err)?;
        Ok(())
    }

    fn insert_entry(
        conn: &Connection,
        collection: &CollectionName,
        kind: OperationKind,
        target: &RecordId,
        payload: Option<&serde_json::Value>,
    ) -> Result<EntryId> {
        let payload = payload
            .map(|p| serde_json::to_string(p).map_err(|e| Error::Serialization(e.to_string())))
            .transpose()?;
        conn.execute(
            r#"
            INSERT INTO outbox (collection, kind, target, target_temporary, payload, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
            params![
                collection.as_str(),
                kind.as_str(),
                target.as_str(),
                target.is_temporary() as i32,
                payload,
                ts_to_millis(Utc::now()),
            ],
        )
        .map_err(db_err)?;
        Ok(conn.last_insert_rowid())
    }

    fn query_entries(conn: &Connection, collection: Option<&CollectionName>) -> Result<Vec<OutboxEntry>> {
        let sql = match collection {
            Some(_) => {
                "SELECT id, collection, kind, target, target_temporary, payload, created_at
                 FROM outbox WHERE collection = ?1 ORDER BY created_at, id"
            }
            None => {
                "SELECT id, collection, kind, target, target_temporary, payload, created_at
                 FROM outbox ORDER BY created_at, id"
            }
        };
        let mut stmt = conn.prepare(sql).map_err(db_err)?;
        let map_row = |row: &rusqlite::Row<'_>| {
            Ok((
                row.get::<_, EntryId>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, i64>(4)? != 0,
                row.get::<_, Option<String>>(5)?,
                row.get::<_, i64>(6)?,
            ))
        };
        let rows: Vec<_> = match collection {
            Some(c) => stmt
                .query_map(params![c.as_str()], map_row)
                .map_err(db_err)?
                .collect::<rusqlite::Result<_>>()
                .map_err(db_err)?,
            None => stmt
                .query_map([], map_row)
                .map_err(db_err)?
                .collect::<rusqlite::Result<_>>()
                .map_err(db_err)?,
        };
        rows.into_iter()
            .map(|(id, coll, kind, target, temp, payload, ms)| {
                Self::entry_from_row(id, coll, kind, target, temp, payload, ms)
            })
            .collect()
    }
}

#[async_trait]
impl KeyValueStore for SqliteStore {
    fn name(&self) -> &str {
        "sqlite"
    }

    fn collections(&self) -> &[CollectionName] {
        &self.collections
    }

    async fn get_all(&self, collection: &CollectionName) -> Result<Vec<Record>> {
        self.check(collection)?;
        let conn = self.conn();
        let mut stmt = conn
            .prepare("SELECT id, temporary, payload, updated_at FROM records WHERE collection = ?1")
            .map_err(db_err)?;
        let rows: Vec<_> = stmt
            .query_map(params![collection.as_str()], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, i64>(1)? != 0,
                    row.get::<_, String>(2)?,
                    row.get::<_, i64>(3)?,
                ))
            })
            .map_err(db_err)?
            .collect::<rusqlite::Result<_>>()
            .map_err(db_err)?;
        rows.into_iter()
            .map(|(id, temp, payload, ms)| Self::record_from_row(id, temp, payload, ms))
            .collect()
    }

    async fn get(&self, collection: &CollectionName, id: &RecordId) -> Result<Option<Record>> {
        self.check(collection)?;
        let conn = self.conn();
        let row = conn
            .query_row(
                "SELECT id, temporary, payload, updated_at FROM records
                 WHERE collection = ?1 AND id = ?2 AND temporary = ?3",
                params![collection.as_str(), id.as_str(), id.is_temporary() as i32],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, i64>(1)? != 0,
                        row.get::<_, String>(2)?,
                        row.get::<_, i64>(3)?,
                    ))
                },
            )
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(db_err(other)),
            })?;
        row.map(|(id, temp, payload, ms)| Self::record_from_row(id, temp, payload, ms))
            .transpose()
    }

    async fn put(&self, collection: &CollectionName, record: &Record) -> Result<()> {
        self.check(collection)?;
        let conn = self.conn();
        Self::upsert_record(&conn, collection, record)
    }

    async fn delete(&self, collection: &CollectionName, id: &RecordId) -> Result<()> {
        self.check(collection)?;
        let conn = self.conn();
        conn.execute(
            "DELETE FROM records WHERE collection = ?1 AND id = ?2",
            params![collection.as_str(), id.as_str()],
        )
        .map_err(db_err)?;
        Ok(())
    }

    async fn clear(&self, collection: &CollectionName) -> Result<()> {
        self.check(collection)?;
        let conn = self.conn();
        conn.execute(
            "DELETE FROM records WHERE collection = ?1",
            params![collection.as_str()],
        )
        .map_err(db_err)?;
        Ok(())
    }

    async fn put_with_entry(
        &self,
        collection: &CollectionName,
        record: &Record,
        kind: OperationKind,
    ) -> Result<EntryId> {
        self.check(collection)?;
        let mut conn = self.conn();
        let tx = conn.transaction().map_err(db_err)?;
        Self::upsert_record(&tx, collection, record)?;
        let entry = Self::insert_entry(&tx, collection, kind, &record.id, Some(&record.payload))?;
        tx.commit().map_err(db_err)?;
        debug!(%collection, target = %record.id, %kind, "Queued local mutation");
        Ok(entry)
    }

    async fn delete_with_entry(
        &self,
        collection: &CollectionName,
        id: &RecordId,
    ) -> Result<EntryId> {
        self.check(collection)?;
        let mut conn = self.conn();
        let tx = conn.transaction().map_err(db_err)?;
        tx.execute(
            "DELETE FROM records WHERE collection = ?1 AND id = ?2",
            params![collection.as_str(), id.as_str()],
        )
        .map_err(db_err)?;
        let entry = Self::insert_entry(&tx, collection, OperationKind::Delete, id, None)?;
        tx.commit().map_err(db_err)?;
        debug!(%collection, target = %id, "Queued local delete");
        Ok(entry)
    }

    async fn discard_record(&self, collection: &CollectionName, id: &RecordId) -> Result<()> {
        self.check(collection)?;
        let mut conn = self.conn();
        let tx = conn.transaction().map_err(db_err)?;
        tx.execute(
            "DELETE FROM records WHERE collection = ?1 AND id = ?2",
            params![collection.as_str(), id.as_str()],
        )
        .map_err(db_err)?;
        tx.execute(
            "DELETE FROM outbox WHERE collection = ?1 AND target = ?2 AND target_temporary = ?3",
            params![collection.as_str(), id.as_str(), id.is_temporary() as i32],
        )
        .map_err(db_err)?;
        tx.commit().map_err(db_err)?;
        Ok(())
    }

    async fn pending_entries(&self) -> Result<Vec<OutboxEntry>> {
        let conn = self.conn();
        Self::query_entries(&conn, None)
    }

    async fn pending_for(&self, collection: &CollectionName) -> Result<Vec<OutboxEntry>> {
        self.check(collection)?;
        let conn = self.conn();
        Self::query_entries(&conn, Some(collection))
    }

    async fn remove_entry(&self, id: EntryId) -> Result<()> {
        let conn = self.conn();
        // Deleting a missing row affects zero rows; retried acknowledgements
        // are no-ops by construction.
        conn.execute("DELETE FROM outbox WHERE id = ?1", params![id])
            .map_err(db_err)?;
        Ok(())
    }

    async fn has_pending(&self) -> Result<bool> {
        let conn = self.conn();
        conn.query_row("SELECT EXISTS(SELECT 1 FROM outbox)", [], |row| {
            row.get::<_, i64>(0)
        })
        .map(|v| v != 0)
        .map_err(db_err)
    }

    async fn promote_record(
        &self,
        collection: &CollectionName,
        temp: &RecordId,
        record: &Record,
        entry: EntryId,
    ) -> Result<()> {
        self.check(collection)?;
        let mut conn = self.conn();
        let tx = conn.transaction().map_err(db_err)?;
        tx.execute(
            "DELETE FROM records WHERE collection = ?1 AND id = ?2",
            params![collection.as_str(), temp.as_str()],
        )
        .map_err(db_err)?;
        Self::upsert_record(&tx, collection, record)?;
        tx.execute(
            "UPDATE outbox SET target = ?1, target_temporary = ?2
             WHERE collection = ?3 AND target = ?4 AND target_temporary = ?5",
            params![
                record.id.as_str(),
                record.id.is_temporary() as i32,
                collection.as_str(),
                temp.as_str(),
                temp.is_temporary() as i32,
            ],
        )
        .map_err(db_err)?;
        tx.execute("DELETE FROM outbox WHERE id = ?1", params![entry])
            .map_err(db_err)?;
        tx.commit().map_err(db_err)?;
        debug!(%collection, old = %temp, new = %record.id, "Promoted record id");
        Ok(())
    }

    async fn put_confirmed(
        &self,
        collection: &CollectionName,
        record: &Record,
        entry: EntryId,
    ) -> Result<()> {
        self.check(collection)?;
        let mut conn = self.conn();
        let tx = conn.transaction().map_err(db_err)?;
        Self::upsert_record(&tx, collection, record)?;
        tx.execute("DELETE FROM outbox WHERE id = ?1", params![entry])
            .map_err(db_err)?;
        tx.commit().map_err(db_err)?;
        Ok(())
    }

    async fn replace_collection(
        &self,
        collection: &CollectionName,
        records: Vec<Record>,
        preserve: &HashSet<RecordId>,
    ) -> Result<()> {
        self.check(collection)?;
        let mut conn = self.conn();
        let tx = conn.transaction().map_err(db_err)?;

        let existing: Vec<(String, bool)> = {
            let mut stmt = tx
                .prepare("SELECT id, temporary FROM records WHERE collection = ?1")
                .map_err(db_err)?;
            let rows = stmt
                .query_map(params![collection.as_str()], |row| {
                    Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)? != 0))
                })
                .map_err(db_err)?
                .collect::<rusqlite::Result<_>>()
                .map_err(db_err)?;
            rows
        };
        for (id, temporary) in existing {
            let record_id = if temporary {
                RecordId::Temporary(id.clone())
            } else {
                RecordId::Permanent(id.clone())
            };
            if !preserve.contains(&record_id) {
                tx.execute(
                    "DELETE FROM records WHERE collection = ?1 AND id = ?2",
                    params![collection.as_str(), id],
                )
                .map_err(db_err)?;
            }
        }
        for record in &records {
            if !preserve.contains(&record.id) {
                Self::upsert_record(&tx, collection, record)?;
            }
        }
        tx.commit().map_err(db_err)?;
        Ok(())
    }
}
