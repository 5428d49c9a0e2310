//! SQLite backend.
//!
//! Each record is serialised to JSON and stored in a single table:
//!
//! ```sql
//! CREATE TABLE IF NOT EXISTS memories (
//!     id          TEXT PRIMARY KEY,
//!     memory_type TEXT NOT NULL,
//!     created     TEXT NOT NULL,
//!     data        TEXT NOT NULL,
//!     checksum    TEXT NOT NULL
//! );
//! ```
//!
//! - WAL mode for file databases.
//! - JSON keeps the schema stable as the record model grows.
//! - A blake3 checksum of the JSON detects row corruption; a mismatch is
//!   logged and the row is still returned.
//! - Backup via SQLite's online-backup API.
//!
//! The connection is opened by `initialize` and dropped by `close`. Trait
//! calls run their SQLite work on tokio's blocking pool, one at a time per
//! backend. `backup` and `integrity_check` are plain blocking calls.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use rusqlite::{Connection, OpenFlags, OptionalExtension, params};
use tracing::{debug, info, warn};

use crate::backend::StorageBackend;
use crate::error::{CtxMemError, Result};
use crate::memory::{MemoryPatch, MemoryRecord};
use crate::retrieval::{MemoryQuery, RetrievalEngine, ScoredMemory};
use crate::types::{MemoryId, StorageTier, Timestamp};

const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS memories (
    id          TEXT PRIMARY KEY,
    memory_type TEXT NOT NULL,
    created     TEXT NOT NULL,
    data        TEXT NOT NULL,
    checksum    TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS memories_created ON memories (created);";

/// Where the database lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SqliteLocation {
    /// A database file, created if missing.
    File(PathBuf),
    /// A private in-memory database. Records are lost on `close`.
    InMemory,
}

/// SQLite-backed backend.
pub struct SqliteBackend {
    name: String,
    tier: StorageTier,
    location: SqliteLocation,
    engine: RetrievalEngine,
    conn: Arc<Mutex<Option<Connection>>>,
}

impl std::fmt::Debug for SqliteBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteBackend")
            .field("name", &self.name)
            .field("tier", &self.tier)
            .field("location", &self.location)
            .field("open", &self.conn.lock().is_some())
            .finish_non_exhaustive()
    }
}

impl SqliteBackend {
    /// Backend over the database file at `path`. Nothing is opened until
    /// `initialize`.
    #[must_use]
    pub fn open<P: AsRef<Path>>(name: impl Into<String>, tier: StorageTier, path: P) -> Self {
        Self::with_location(
            name,
            tier,
            SqliteLocation::File(path.as_ref().to_path_buf()),
            RetrievalEngine::default(),
        )
    }

    /// Backend over a private in-memory database.
    #[must_use]
    pub fn open_in_memory(name: impl Into<String>, tier: StorageTier) -> Self {
        Self::with_location(name, tier, SqliteLocation::InMemory, RetrievalEngine::default())
    }

    /// Backend with an explicit location and retrieval engine.
    #[must_use]
    pub fn with_location(
        name: impl Into<String>,
        tier: StorageTier,
        location: SqliteLocation,
        engine: RetrievalEngine,
    ) -> Self {
        Self {
            name: name.into(),
            tier,
            location,
            engine,
            conn: Arc::new(Mutex::new(None)),
        }
    }

    /// Database location.
    #[must_use]
    pub fn location(&self) -> &SqliteLocation {
        &self.location
    }

    fn with_conn<T>(&self, f: impl FnOnce(&mut Connection) -> Result<T>) -> Result<T> {
        let mut guard = self.conn.lock();
        match guard.as_mut() {
            Some(conn) => f(conn),
            None => Err(CtxMemError::NotInitialized(self.name.clone())),
        }
    }

    /// Run `f` against the open connection on the blocking pool.
    async fn run<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&str, &mut Connection) -> Result<T> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        let name = self.name.clone();
        tokio::task::spawn_blocking(move || {
            let mut guard = conn.lock();
            match guard.as_mut() {
                Some(conn) => f(&name, conn),
                None => Err(CtxMemError::NotInitialized(name)),
            }
        })
        .await
        .map_err(|e| self.join_failure(&e))?
    }

    fn join_failure(&self, err: &tokio::task::JoinError) -> CtxMemError {
        CtxMemError::StorageFailure {
            backend: self.name.clone(),
            succeeded: Vec::new(),
            reason: format!("blocking task failed: {err}"),
        }
    }

    // ------------------------------------------------------------------
    // Maintenance
    // ------------------------------------------------------------------

    /// Copy the database to `dest_path` using SQLite's online-backup API.
    ///
    /// # Errors
    ///
    /// Returns [`CtxMemError::Database`] on SQLite failures, or
    /// `NotInitialized` if the backend is closed.
    pub fn backup<P: AsRef<Path>>(&self, dest_path: P) -> Result<()> {
        let start = Instant::now();
        self.with_conn(|conn| {
            let mut dest = Connection::open(dest_path.as_ref())?;
            let backup = rusqlite::backup::Backup::new(conn, &mut dest)?;
            backup.run_to_completion(256, std::time::Duration::from_millis(50), None)?;
            Ok(())
        })?;
        info!(
            backend = %self.name,
            dest = %dest_path.as_ref().display(),
            elapsed_ms = start.elapsed().as_millis(),
            "Database backup completed"
        );
        Ok(())
    }

    /// Run `PRAGMA integrity_check`. `Ok(false)` means corruption.
    ///
    /// # Errors
    ///
    /// Returns [`CtxMemError::Database`] if the check itself fails.
    pub fn integrity_check(&self) -> Result<bool> {
        self.with_conn(|conn| {
            let result: String = conn.query_row("PRAGMA integrity_check", [], |row| row.get(0))?;
            Ok(result == "ok")
        })
    }
}

// ---------------------------------------------------------------------------
// Row codec
// ---------------------------------------------------------------------------

fn connect(location: &SqliteLocation) -> Result<Connection> {
    let conn = match location {
        SqliteLocation::File(path) => {
            let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_NO_MUTEX;
            let conn = Connection::open_with_flags(path, flags)?;
            conn.execute_batch("PRAGMA journal_mode = WAL;")?;
            conn.execute_batch("PRAGMA synchronous = NORMAL;")?;
            conn.execute_batch("PRAGMA busy_timeout = 5000;")?;
            conn
        }
        SqliteLocation::InMemory => Connection::open_in_memory()?,
    };
    conn.execute_batch(SCHEMA)?;
    Ok(conn)
}


fn checksum_hex(data: &[u8]) -> String {
    blake3::hash(data).to_hex().to_string()
}

fn encode(record: &MemoryRecord) -> Result<(String, String)> {
    let json =
        serde_json::to_string(record).map_err(|e| CtxMemError::Serialization(e.to_string()))?;
    let checksum = checksum_hex(json.as_bytes());
    Ok((json, checksum))
}

fn decode(backend: &str, id: &str, data: &str, checksum: &str) -> Result<MemoryRecord> {
    let actual = checksum_hex(data.as_bytes());
    if actual != checksum {
        warn!(
            backend,
            memory = id,
            expected = checksum,
            actual = %actual,
            "Checksum mismatch, possible row corruption"
        );
    }
    serde_json::from_str(data).map_err(|e| CtxMemError::Serialization(e.to_string()))
}

fn upsert(conn: &Connection, record: &MemoryRecord) -> Result<()> {
    let (json, checksum) = encode(record)?;
    conn.execute(
        "INSERT INTO memories (id, memory_type, created, data, checksum)
         VALUES (?1, ?2, ?3, ?4, ?5)
         ON CONFLICT(id) DO UPDATE SET
            data = excluded.data,
            checksum = excluded.checksum",
        params![
            record.id.to_string(),
            record.memory_type.as_str(),
            record.metadata.created.to_rfc3339(),
            json,
            checksum
        ],
    )?;
    Ok(())
}

fn load_one(backend: &str, conn: &Connection, id: MemoryId) -> Result<Option<MemoryRecord>> {
    let mut stmt = conn.prepare_cached("SELECT data, checksum FROM memories WHERE id = ?1")?;
    let id_str = id.to_string();
    let row: Option<(String, String)> = stmt
        .query_row(params![id_str], |row| Ok((row.get(0)?, row.get(1)?)))
        .optional()?;
    row.map(|(data, checksum)| decode(backend, &id_str, &data, &checksum))
        .transpose()
}

fn load_all(backend: &str, conn: &Connection) -> Result<Vec<MemoryRecord>> {
    let mut stmt = conn.prepare_cached("SELECT id, data, checksum FROM memories")?;
    let rows = stmt.query_map([], |row| {
        Ok((
            row.get::<_, String>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, String>(2)?,
        ))
    })?;
    let mut records = Vec::new();
    for row in rows {
        let (id, data, checksum) = row?;
        records.push(decode(backend, &id, &data, &checksum)?);
    }
    Ok(records)
}

#[async_trait]
impl StorageBackend for SqliteBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn tier(&self) -> StorageTier {
        self.tier
    }

    async fn initialize(&self) -> Result<()> {
        let conn = Arc::clone(&self.conn);
        let name = self.name.clone();
        let location = self.location.clone();
        tokio::task::spawn_blocking(move || {
            let mut guard = conn.lock();
            if guard.is_some() {
                return Err(CtxMemError::AlreadyInitialized(name));
            }
            *guard = Some(connect(&location)?);
            Ok(())
        })
        .await
        .map_err(|e| self.join_failure(&e))??;
        info!(
            backend = %self.name,
            tier = %self.tier,
            location = ?self.location,
            "SQLite backend initialized"
        );
        Ok(())
    }

    async fn store(&self, mut record: MemoryRecord) -> Result<()> {
        record.validate()?;
        record.metadata.storage_tier = self.tier;
        let id = record.id;
        self.run(move |_, conn| upsert(conn, &record)).await?;
        debug!(backend = %self.name, memory = %id, "Stored record");
        Ok(())
    }

    async fn scan(&self, query: &MemoryQuery) -> Result<Vec<ScoredMemory>> {
        let start = Instant::now();
        let lookup = query.id;
        let records = self
            .run(move |name, conn| match lookup {
                Some(id) => Ok(load_one(name, conn, id)?.into_iter().collect()),
                None => load_all(name, conn),
            })
            .await?;
        let scanned = self.engine.scan(&records, query);
        debug!(
            backend = %self.name,
            rows = records.len(),
            matched = scanned.len(),
            elapsed_us = start.elapsed().as_micros(),
            "Scanned rows"
        );
        Ok(scanned)
    }

    async fn touch(&self, ids: &[MemoryId], at: Timestamp) -> Result<()> {
        let ids = ids.to_vec();
        self.run(move |name, conn| {
            let tx = conn.transaction()?;
            for id in ids {
                if let Some(mut record) = load_one(name, &tx, id)? {
                    record.record_access(at);
                    upsert(&tx, &record)?;
                }
            }
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn get(&self, id: MemoryId) -> Result<Option<MemoryRecord>> {
        self.run(move |name, conn| load_one(name, conn, id)).await
    }

    async fn records(&self) -> Result<Vec<MemoryRecord>> {
        self.run(|name, conn| load_all(name, conn)).await
    }

    async fn count(&self) -> Result<usize> {
        self.run(|_, conn| {
            let count: i64 = conn.query_row("SELECT COUNT(*) FROM memories", [], |row| row.get(0))?;
            Ok(usize::try_from(count).unwrap_or(0))
        })
        .await
    }

    async fn update(&self, id: MemoryId, patch: &MemoryPatch) -> Result<MemoryRecord> {
        let patch = patch.clone();
        let updated = self
            .run(move |name, conn| {
                let tx = conn.transaction()?;
                let mut record =
                    load_one(name, &tx, id)?.ok_or(CtxMemError::MemoryNotFound(id))?;
                patch.apply(&mut record, Utc::now())?;
                upsert(&tx, &record)?;
                tx.commit()?;
                Ok(record)
            })
            .await?;
        debug!(backend = %self.name, memory = %id, "Updated record");
        Ok(updated)
    }

    async fn delete(&self, id: MemoryId) -> Result<()> {
        let deleted = self
            .run(move |_, conn| {
                Ok(conn.execute("DELETE FROM memories WHERE id = ?1", params![id.to_string()])?)
            })
            .await?;
        if deleted == 0 {
            return Err(CtxMemError::MemoryNotFound(id));
        }
        debug!(backend = %self.name, memory = %id, "Deleted record");
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        let conn = Arc::clone(&self.conn);
        let name = self.name.clone();
        tokio::task::spawn_blocking(move || {
            let conn = conn
                .lock()
                .take()
                .ok_or(CtxMemError::NotInitialized(name))?;
            conn.close().map_err(|(_, e)| CtxMemError::Database(e))
        })
        .await
        .map_err(|e| self.join_failure(&e))??;
        info!(backend = %self.name, "SQLite backend closed");
        Ok(())
    }
}
