//! Reference in-process backend: an id → record map behind a `RwLock`.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use tracing::{debug, info};

use crate::backend::StorageBackend;
use crate::error::{CtxMemError, Result};
use crate::memory::{MemoryPatch, MemoryRecord};
use crate::retrieval::{MemoryQuery, RetrievalEngine, ScoredMemory};
use crate::types::{MemoryId, StorageTier, Timestamp};

type RecordMap = HashMap<MemoryId, MemoryRecord>;

/// Map-backed backend. `None` in the slot means uninitialized.
#[derive(Debug)]
pub struct InMemoryBackend {
    name: String,
    tier: StorageTier,
    engine: RetrievalEngine,
    records: RwLock<Option<RecordMap>>,
}

impl InMemoryBackend {
    /// New, uninitialized backend using the default retrieval engine.
    #[must_use]
    pub fn new(name: impl Into<String>, tier: StorageTier) -> Self {
        Self::with_engine(name, tier, RetrievalEngine::default())
    }

    /// New, uninitialized backend with a specific retrieval engine.
    #[must_use]
    pub fn with_engine(name: impl Into<String>, tier: StorageTier, engine: RetrievalEngine) -> Self {
        Self {
            name: name.into(),
            tier,
            engine,
            records: RwLock::new(None),
        }
    }

    fn not_initialized(&self) -> CtxMemError {
        CtxMemError::NotInitialized(self.name.clone())
    }

    fn read<T>(&self, f: impl FnOnce(&RecordMap) -> T) -> Result<T> {
        let guard = self.records.read();
        guard.as_ref().map(f).ok_or_else(|| self.not_initialized())
    }

    fn write<T>(&self, f: impl FnOnce(&mut RecordMap) -> Result<T>) -> Result<T> {
        let mut guard = self.records.write();
        match guard.as_mut() {
            Some(map) => f(map),
            None => Err(self.not_initialized()),
        }
    }
}

#[async_trait]
impl StorageBackend for InMemoryBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn tier(&self) -> StorageTier {
        self.tier
    }

    async fn initialize(&self) -> Result<()> {
        let mut guard = self.records.write();
        if guard.is_some() {
            return Err(CtxMemError::AlreadyInitialized(self.name.clone()));
        }
        *guard = Some(HashMap::new());
        info!(backend = %self.name, tier = %self.tier, "In-memory backend initialized");
        Ok(())
    }

    async fn store(&self, mut record: MemoryRecord) -> Result<()> {
        record.validate()?;
        record.metadata.storage_tier = self.tier;
        self.write(|map| {
            debug!(backend = %self.name, memory = %record.id, "Stored record");
            map.insert(record.id, record);
            Ok(())
        })
    }

    async fn scan(&self, query: &MemoryQuery) -> Result<Vec<ScoredMemory>> {
        self.read(|map| match query.id {
            Some(id) => self.engine.scan(map.get(&id), query),
            None => self.engine.scan(map.values(), query),
        })
    }

    async fn touch(&self, ids: &[MemoryId], at: Timestamp) -> Result<()> {
        self.write(|map| {
            for id in ids {
                if let Some(record) = map.get_mut(id) {
                    record.record_access(at);
                }
            }
            Ok(())
        })
    }

    async fn get(&self, id: MemoryId) -> Result<Option<MemoryRecord>> {
        self.read(|map| map.get(&id).cloned())
    }

    async fn records(&self) -> Result<Vec<MemoryRecord>> {
        self.read(|map| map.values().cloned().collect())
    }

    async fn count(&self) -> Result<usize> {
        self.read(|map| map.len())
    }

    async fn update(&self, id: MemoryId, patch: &MemoryPatch) -> Result<MemoryRecord> {
        self.write(|map| {
            let record = map.get_mut(&id).ok_or(CtxMemError::MemoryNotFound(id))?;
            patch.apply(record, Utc::now())?;
            debug!(backend = %self.name, memory = %id, "Updated record");
            Ok(record.clone())
        })
    }

    async fn delete(&self, id: MemoryId) -> Result<()> {
        self.write(|map| {
            map.remove(&id).ok_or(CtxMemError::MemoryNotFound(id))?;
            debug!(backend = %self.name, memory = %id, "Deleted record");
            Ok(())
        })
    }

    async fn close(&self) -> Result<()> {
        let released = self
            .records
            .write()
            .take()
            .ok_or_else(|| self.not_initialized())?
            .len();
        info!(backend = %self.name, released, "In-memory backend closed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::memory::MetadataPatch;
    use crate::session::SessionContext;
    use crate::types::MemoryType;

    fn record(text: &str) -> MemoryRecord {
        MemoryRecord::new(text, MemoryType::Semantic, &SessionContext::new(None, None))
    }

    async fn backend() -> InMemoryBackend {
        let backend = InMemoryBackend::new("main", StorageTier::VectorStore);
        backend.initialize().await.expect("init");
        backend
    }

    #[tokio::test]
    async fn lifecycle_is_enforced() {
        let backend = InMemoryBackend::new("main", StorageTier::MainContext);
        let err = backend.store(record("x")).await.expect_err("uninitialized");
        assert_eq!(err.kind(), ErrorKind::NotInitialized);

        backend.initialize().await.expect("init");
        let err = backend.initialize().await.expect_err("twice");
        assert_eq!(err.kind(), ErrorKind::AlreadyInitialized);

        backend.store(record("x")).await.expect("store");
        backend.close().await.expect("close");
        let err = backend.count().await.expect_err("closed");
        assert_eq!(err.kind(), ErrorKind::NotInitialized);

        // Reopening starts empty.
        backend.initialize().await.expect("reinit");
        assert_eq!(backend.count().await.expect("count"), 0);
    }

    #[tokio::test]
    async fn store_stamps_tier_and_upserts() {
        let backend = backend().await;
        let mut rec = record("likes tea");
        backend.store(rec.clone()).await.expect("store");
        rec.content.text = "likes coffee".into();
        backend.store(rec.clone()).await.expect("upsert");

        assert_eq!(backend.count().await.expect("count"), 1);
        let stored = backend.get(rec.id).await.expect("get").expect("present");
        assert_eq!(stored.content.text, "likes coffee");
        assert_eq!(stored.metadata.storage_tier, StorageTier::VectorStore);
    }

    #[tokio::test]
    async fn retrieve_tracks_access_on_page_only() {
        let backend = backend().await;
        let first = record("tea one").with_importance(0.9);
        let second = record("tea two").with_importance(0.1);
        backend.store(first.clone()).await.expect("store");
        backend.store(second.clone()).await.expect("store");

        let result = backend
            .retrieve(&MemoryQuery::new("tea").with_limit(1))
            .await
            .expect("retrieve");
        assert_eq!(result.total_count, 2);
        assert_eq!(result.ids(), vec![first.id]);
        // Returned copy is the pre-increment snapshot.
        assert_eq!(result.memories[0].record.metadata.access_count, 0);

        let first_now = backend.get(first.id).await.expect("get").expect("present");
        let second_now = backend.get(second.id).await.expect("get").expect("present");
        assert_eq!(first_now.metadata.access_count, 1);
        assert_eq!(second_now.metadata.access_count, 0);
    }

    #[tokio::test]
    async fn update_and_delete_report_missing_ids() {
        let backend = backend().await;
        let missing = MemoryId::new();
        let patch = MemoryPatch::metadata(MetadataPatch {
            importance: Some(0.3),
            ..MetadataPatch::default()
        });
        let err = backend.update(missing, &patch).await.expect_err("missing");
        assert_eq!(err.kind(), ErrorKind::NotFound);
        let err = backend.delete(missing).await.expect_err("missing");
        assert_eq!(err.kind(), ErrorKind::NotFound);

        let rec = record("x");
        backend.store(rec.clone()).await.expect("store");
        let updated = backend.update(rec.id, &patch).await.expect("update");
        assert!((updated.metadata.importance - 0.3).abs() < f32::EPSILON);
        backend.delete(rec.id).await.expect("delete");
        assert!(!backend.contains(rec.id).await.expect("contains"));
    }

    #[tokio::test]
    async fn reserved_extra_keys_are_rejected() {
        let backend = backend().await;
        let good = record("tea notes").with_importance(0.9);
        backend.store(good.clone()).await.expect("store");

        let bad = record("tea override").with_extra("importance", "high");
        let err = backend.store(bad).await.expect_err("reserved key");
        assert_eq!(err.kind(), ErrorKind::ValidationFailure);

        let patch = MemoryPatch::metadata(MetadataPatch {
            extra: std::collections::BTreeMap::from([(
                "source".to_string(),
                serde_json::Value::from("forged"),
            )]),
            ..MetadataPatch::default()
        });
        let err = backend.update(good.id, &patch).await.expect_err("reserved key");
        assert_eq!(err.kind(), ErrorKind::ValidationFailure);

        let stored = backend.get(good.id).await.expect("get").expect("present");
        assert_eq!(stored, good_with_tier(good));
        let json = serde_json::to_value(&stored).expect("ser");
        assert_eq!(json["metadata"]["source"], serde_json::Value::from("session"));
    }

    fn good_with_tier(mut rec: MemoryRecord) -> MemoryRecord {
        rec.metadata.storage_tier = StorageTier::VectorStore;
        rec
    }

    #[tokio::test]
    async fn rejects_invalid_records() {
        let backend = backend().await;
        let mut rec = record("x");
        rec.metadata.confidence = 2.0;
        let err = backend.store(rec).await.expect_err("invalid");
        assert_eq!(err.kind(), ErrorKind::ValidationFailure);
    }
}
