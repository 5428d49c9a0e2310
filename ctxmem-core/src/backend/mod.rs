//! Storage backends.
//!
//! A backend serves one [`StorageTier`] and holds records keyed by id.
//! Every backend runs the shared [`crate::retrieval::RetrievalEngine`] over
//! its own records. `retrieve` is defined once here as scan, paginate,
//! then access tracking.
//!
//! Lifecycle: a backend is unusable until [`StorageBackend::initialize`],
//! and [`StorageBackend::close`] releases its records and returns it to
//! the uninitialized state. Any other call outside that window fails with
//! [`crate::CtxMemError::NotInitialized`].

pub mod memory;
pub mod sqlite;

use std::fmt;
use std::time::Instant;

use async_trait::async_trait;
use chrono::Utc;

use crate::consolidation::ConsolidationOutcome;
use crate::error::Result;
use crate::memory::{MemoryPatch, MemoryRecord};
use crate::retrieval::{MemoryQuery, MemorySearchResult, ScoredMemory, paginate};
use crate::types::{MemoryId, StorageTier, Timestamp};

pub use memory::InMemoryBackend;
pub use sqlite::SqliteBackend;

/// Capability interface implemented by every concrete store.
#[async_trait]
pub trait StorageBackend: Send + Sync + fmt::Debug {
    /// Registered name.
    fn name(&self) -> &str;

    /// Tier this backend serves.
    fn tier(&self) -> StorageTier;

    /// Make the backend usable.
    ///
    /// # Errors
    /// `AlreadyInitialized` if called twice without an intervening `close`.
    async fn initialize(&self) -> Result<()>;

    /// Insert or replace a record by id.
    async fn store(&self, record: MemoryRecord) -> Result<()>;

    /// Candidates, scoring, filtering, and sorting. No side effects.
    async fn scan(&self, query: &MemoryQuery) -> Result<Vec<ScoredMemory>>;

    /// Record one access at `at` on each listed record. Unknown ids are
    /// skipped.
    async fn touch(&self, ids: &[MemoryId], at: Timestamp) -> Result<()>;

    /// Scan, paginate, and apply access tracking to the page.
    ///
    /// The returned records are the snapshots taken before tracking.
    async fn retrieve(&self, query: &MemoryQuery) -> Result<MemorySearchResult> {
        let start = Instant::now();
        let scanned = self.scan(query).await?;
        let total_count = scanned.len();
        let page = paginate(scanned, query.offset, query.limit);
        let ids: Vec<MemoryId> = page.iter().map(|m| m.record.id).collect();
        self.touch(&ids, Utc::now()).await?;
        Ok(MemorySearchResult {
            memories: page,
            total_count,
            query: query.clone(),
            took: start.elapsed(),
        })
    }

    /// Fetch one record without access tracking.
    async fn get(&self, id: MemoryId) -> Result<Option<MemoryRecord>>;

    /// Whether the backend holds `id`.
    async fn contains(&self, id: MemoryId) -> Result<bool> {
        Ok(self.get(id).await?.is_some())
    }

    /// Snapshot of every record.
    async fn records(&self) -> Result<Vec<MemoryRecord>>;

    /// Number of records held.
    async fn count(&self) -> Result<usize> {
        Ok(self.records().await?.len())
    }

    /// Apply a patch and return the updated record.
    ///
    /// # Errors
    /// `MemoryNotFound` if the id is absent; `Validation` if the patch is
    /// rejected, in which case the stored record is unchanged.
    async fn update(&self, id: MemoryId, patch: &MemoryPatch) -> Result<MemoryRecord>;

    /// Remove a record.
    ///
    /// # Errors
    /// `MemoryNotFound` if the id is absent.
    async fn delete(&self, id: MemoryId) -> Result<()>;

    /// Backend-native consolidation of `records`, if supported.
    ///
    /// Returns `None` when the backend has no native pass; the caller then
    /// runs the shared engine. Must not mutate stored state. Only the
    /// `folded` pairs are used: the caller re-reads both sides under their
    /// locks and merges them with the shared engine.
    async fn consolidate(&self, records: &[MemoryRecord]) -> Result<Option<ConsolidationOutcome>> {
        let _ = records;
        Ok(None)
    }

    /// Release every record and return to the uninitialized state.
    async fn close(&self) -> Result<()>;
}
