//! Multi-backend dispatch.
//!
//! Routes each call to the registered backends relevant to it:
//!
//! - **store** writes to every backend whose tier the routing policy allows
//!   for the record's memory type, preferred tier first, then ascending
//!   priority, then name. Writes are sequential and not rolled back; a
//!   failure reports which backends already hold the record.
//! - **update / delete** apply to every backend currently holding the id.
//! - **retrieve** asks every backend whose tier passes the query's tier
//!   filter, keeps the best-ranked copy of each id, re-sorts, paginates
//!   once, and then records the access on every backend that returned a
//!   paged record.
//!
//! Store, update, and delete on the same id are serialized with a per-id
//! async mutex. Access tracking and consolidation take the same locks,
//! always in ascending id order.

use std::collections::{BTreeMap, HashMap};
use std::collections::hash_map::Entry;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info, warn};

use crate::backend::StorageBackend;
use crate::config::RoutingConfig;
use crate::consolidation::{ConsolidationEngine, ConsolidationReport, Fingerprint};
use crate::error::{CtxMemError, Result};
use crate::memory::{MemoryPatch, MemoryRecord};
use crate::retrieval::{MemoryQuery, MemorySearchResult, ScoredMemory, paginate, sort_by_relevance};
use crate::types::{MemoryId, MemoryType, StorageTier, Timestamp};

/// A backend with its dispatch metadata.
#[derive(Debug, Clone)]
pub struct RegisteredBackend {
    /// Unique name.
    pub name: String,
    /// Tier served.
    pub tier: StorageTier,
    /// Write order; lower goes first.
    pub priority: u32,
    /// The backend itself.
    pub backend: Arc<dyn StorageBackend>,
}

/// Routes calls across registered backends.
#[derive(Debug)]
pub struct Dispatcher {
    backends: Vec<RegisteredBackend>,
    routing: RoutingConfig,
    consolidation: ConsolidationEngine,
    locks: DashMap<MemoryId, Arc<Mutex<()>>>,
}

impl Dispatcher {
    /// Empty dispatcher with the given routing policy.
    #[must_use]
    pub fn new(routing: RoutingConfig, consolidation: ConsolidationEngine) -> Self {
        Self {
            backends: Vec::new(),
            routing,
            consolidation,
            locks: DashMap::new(),
        }
    }

    /// Register a backend under its own name and tier.
    ///
    /// # Errors
    /// `Validation` if a backend with the same name is already registered.
    pub fn register(&mut self, backend: Arc<dyn StorageBackend>, priority: u32) -> Result<()> {
        let name = backend.name().to_string();
        if self.backends.iter().any(|b| b.name == name) {
            return Err(CtxMemError::Validation(format!(
                "backend '{name}' is already registered"
            )));
        }
        info!(backend = %name, tier = %backend.tier(), priority, "Backend registered");
        self.backends.push(RegisteredBackend {
            name,
            tier: backend.tier(),
            priority,
            backend,
        });
        self.backends
            .sort_by(|a, b| a.priority.cmp(&b.priority).then_with(|| a.name.cmp(&b.name)));
        Ok(())
    }

    /// Registered backends in priority order.
    #[must_use]
    pub fn backends(&self) -> &[RegisteredBackend] {
        &self.backends
    }

    /// Look up a backend by name.
    ///
    /// # Errors
    /// `BackendNotFound` if no backend has that name.
    pub fn backend(&self, name: &str) -> Result<&RegisteredBackend> {
        self.backends
            .iter()
            .find(|b| b.name == name)
            .ok_or_else(|| CtxMemError::BackendNotFound(name.to_string()))
    }

    /// Initialize every registered backend.
    ///
    /// # Errors
    /// The first backend failure; backends before it stay initialized.
    pub async fn initialize_all(&self) -> Result<()> {
        let mut done = Vec::new();
        for b in &self.backends {
            b.backend
                .initialize()
                .await
                .map_err(|e| e.into_fan_out(&b.name, done.clone()))?;
            done.push(b.name.clone());
        }
        Ok(())
    }

    /// Backends eligible for a new record, in write order.
    ///
    /// # Errors
    /// `Validation` if no registered backend is eligible, or if
    /// `tier_override` is not allowed for `memory_type`.
    pub fn targets_for(
        &self,
        memory_type: MemoryType,
        tier_override: Option<StorageTier>,
    ) -> Result<Vec<&RegisteredBackend>> {
        let rule = self.routing.rule(memory_type);
        if let Some(tier) = tier_override {
            if !rule.allows(tier) {
                return Err(CtxMemError::Validation(format!(
                    "storage tier {tier} is not allowed for {memory_type} memories"
                )));
            }
        }

        let mut targets: Vec<&RegisteredBackend> = self
            .backends
            .iter()
            .filter(|b| rule.allows(b.tier) && tier_override.is_none_or(|t| t == b.tier))
            .collect();
        // Already in (priority, name) order; a stable sort keeps it within
        // the preferred and non-preferred groups.
        targets.sort_by_key(|b| rule.preferred != Some(b.tier));

        if targets.is_empty() {
            return Err(CtxMemError::Validation(format!(
                "no registered backend serves {memory_type} memories"
            )));
        }
        Ok(targets)
    }

    fn lock_for(&self, id: MemoryId) -> Arc<Mutex<()>> {
        self.locks.entry(id).or_default().clone()
    }

    /// Lock every id in `ids`, which must be sorted and deduplicated.
    async fn lock_all(&self, ids: &[MemoryId]) -> Vec<OwnedMutexGuard<()>> {
        let mut guards = Vec::with_capacity(ids.len());
        for &id in ids {
            guards.push(self.lock_for(id).lock_owned().await);
        }
        guards
    }

    #[cfg(test)]
    fn lock_count(&self) -> usize {
        self.locks.len()
    }

    async fn holders(&self, id: MemoryId) -> Result<Vec<&RegisteredBackend>> {
        let mut holders = Vec::new();
        for b in &self.backends {
            if b.backend.contains(id).await? {
                holders.push(b);
            }
        }
        Ok(holders)
    }

    /// Write `record` to every eligible backend. Returns the backends
    /// written, in order.
    ///
    /// # Errors
    /// `Validation` when no backend is eligible; otherwise the first
    /// backend failure, as `StorageFailure` if earlier writes succeeded.
    pub async fn store(
        &self,
        record: &MemoryRecord,
        tier_override: Option<StorageTier>,
    ) -> Result<Vec<String>> {
        let targets = self.targets_for(record.memory_type, tier_override)?;
        let lock = self.lock_for(record.id);
        let guard = lock.lock().await;

        let mut succeeded = Vec::with_capacity(targets.len());
        for target in targets {
            let mut copy = record.clone();
            copy.metadata.storage_tier = target.tier;
            if let Err(e) = target.backend.store(copy).await {
                if succeeded.is_empty() {
                    // Nothing was written, so the id may never be seen again.
                    drop(guard);
                    self.locks.remove(&record.id);
                } else {
                    warn!(
                        memory = %record.id,
                        failed = %target.name,
                        succeeded = ?succeeded,
                        error = %e,
                        "Partial write"
                    );
                }
                return Err(e.into_fan_out(&target.name, succeeded));
            }
            succeeded.push(target.name.clone());
        }
        debug!(memory = %record.id, backends = ?succeeded, "Record dispatched");
        Ok(succeeded)
    }

    /// Apply `patch` on every backend holding `id`. Returns the updated
    /// record from the first holder and the backends updated.
    ///
    /// # Errors
    /// `MemoryNotFound` if no backend holds the id; `Validation` for a bad
    /// patch; otherwise the first backend failure.
    pub async fn update(
        &self,
        id: MemoryId,
        patch: &MemoryPatch,
    ) -> Result<(MemoryRecord, Vec<String>)> {
        patch.validate()?;
        let lock = self.lock_for(id);
        let _guard = lock.lock().await;

        let holders = self.holders(id).await?;
        let mut updated: Option<MemoryRecord> = None;
        let mut succeeded = Vec::with_capacity(holders.len());
        for holder in holders {
            match holder.backend.update(id, patch).await {
                Ok(record) => {
                    if updated.is_none() {
                        updated = Some(record);
                    }
                    succeeded.push(holder.name.clone());
                }
                Err(e) => return Err(e.into_fan_out(&holder.name, succeeded)),
            }
        }
        let record = updated.ok_or(CtxMemError::MemoryNotFound(id))?;
        Ok((record, succeeded))
    }

    /// Remove `id` from every backend holding it. Returns the backends
    /// it was removed from.
    ///
    /// # Errors
    /// `MemoryNotFound` if no backend holds the id; otherwise the first
    /// backend failure.
    pub async fn delete(&self, id: MemoryId) -> Result<Vec<String>> {
        let lock = self.lock_for(id);
        let guard = lock.lock().await;

        let holders = self.holders(id).await?;
        if holders.is_empty() {
            return Err(CtxMemError::MemoryNotFound(id));
        }
        let mut succeeded = Vec::with_capacity(holders.len());
        for holder in holders {
            if let Err(e) = holder.backend.delete(id).await {
                return Err(e.into_fan_out(&holder.name, succeeded));
            }
            succeeded.push(holder.name.clone());
        }
        drop(guard);
        self.locks.remove(&id);
        Ok(succeeded)
    }

    /// First copy of `id` in priority order, without access tracking.
    ///
    /// # Errors
    /// Propagates backend failures.
    pub async fn get(&self, id: MemoryId) -> Result<Option<MemoryRecord>> {
        for b in &self.backends {
            if let Some(record) = b.backend.get(id).await? {
                return Ok(Some(record));
            }
        }
        Ok(None)
    }

    /// Fan a query out, merge, paginate once, and track access.
    ///
    /// # Errors
    /// The first backend failure.
    pub async fn retrieve(&self, query: &MemoryQuery) -> Result<MemorySearchResult> {
        let start = Instant::now();
        let mut best: HashMap<MemoryId, ScoredMemory> = HashMap::new();
        let mut sources: HashMap<MemoryId, Vec<usize>> = HashMap::new();

        for (idx, b) in self.backends.iter().enumerate() {
            if !query.filters.allows_tier(b.tier) {
                continue;
            }
            for hit in b.backend.scan(query).await? {
                let id = hit.record.id;
                sources.entry(id).or_default().push(idx);
                match best.entry(id) {
                    Entry::Occupied(mut slot) => {
                        if hit.rank_cmp(slot.get()).is_lt() {
                            slot.insert(hit);
                        }
                    }
                    Entry::Vacant(slot) => {
                        slot.insert(hit);
                    }
                }
            }
        }

        let mut merged: Vec<ScoredMemory> = best.into_values().collect();
        if query.id.is_none() {
            sort_by_relevance(&mut merged);
        }
        let total_count = merged.len();
        let page = paginate(merged, query.offset, query.limit);

        let mut touched: BTreeMap<usize, Vec<MemoryId>> = BTreeMap::new();
        for m in &page {
            for &idx in sources.get(&m.record.id).into_iter().flatten() {
                touched.entry(idx).or_default().push(m.record.id);
            }
        }
        let mut page_ids: Vec<MemoryId> = page.iter().map(|m| m.record.id).collect();
        page_ids.sort();
        let guards = self.lock_all(&page_ids).await;
        let now = Utc::now();
        for (idx, ids) in touched {
            if let Some(b) = self.backends.get(idx) {
                b.backend.touch(&ids, now).await?;
            }
        }
        drop(guards);

        Ok(MemorySearchResult {
            memories: page,
            total_count,
            query: query.clone(),
            took: start.elapsed(),
        })
    }

    /// Consolidate records of one backend created at or before `horizon`.
    ///
    /// Eligible records are taken oldest first, so the oldest copy of a
    /// duplicated fact survives.
    ///
    /// # Errors
    /// `BackendNotFound` for an unknown name; otherwise the first backend
    /// failure. Folds applied before a failure are not rolled back.
    ///
    /// Each fold is merged into the live records under their locks. A
    /// duplicate that changed text or vanished since the snapshot is left
    /// alone.
    pub async fn consolidate(&self, name: &str, horizon: Timestamp) -> Result<ConsolidationReport> {
        let target = self.backend(name)?;
        let mut eligible: Vec<MemoryRecord> = target
            .backend
            .records()
            .await?
            .into_iter()
            .filter(|r| r.metadata.created <= horizon)
            .collect();
        eligible.sort_by(|a, b| {
            a.metadata
                .created
                .cmp(&b.metadata.created)
                .then_with(|| a.id.cmp(&b.id))
        });
        let examined = eligible.len();

        let outcome = match target.backend.consolidate(&eligible).await? {
            Some(native) => native,
            None => self.consolidation.consolidate(eligible, Utc::now()),
        };

        let mut involved: Vec<MemoryId> = outcome
            .folded
            .iter()
            .flat_map(|&(folded, survivor)| [folded, survivor])
            .collect();
        involved.sort();
        involved.dedup();
        let guards = self.lock_all(&involved).await;

        // The snapshot may be stale by now: merge the live copies instead.
        let mut groups: Vec<(MemoryId, Vec<MemoryId>)> = Vec::new();
        for &(folded, survivor) in &outcome.folded {
            match groups.iter_mut().find(|(id, _)| *id == survivor) {
                Some((_, members)) => members.push(folded),
                None => groups.push((survivor, vec![folded])),
            }
        }
        let now = Utc::now();
        let mut applied = Vec::with_capacity(outcome.folded.len());
        for (survivor_id, members) in groups {
            let Some(mut survivor) = target.backend.get(survivor_id).await? else {
                debug!(backend = %name, memory = %survivor_id, "Survivor vanished; group skipped");
                continue;
            };
            let fingerprint = Fingerprint::of(&survivor.content.text);
            let mut merged = Vec::with_capacity(members.len());
            for folded_id in members {
                match target.backend.get(folded_id).await? {
                    Some(folded) if Fingerprint::of(&folded.content.text) == fingerprint => {
                        self.consolidation.fold_into(&mut survivor, &folded, now);
                        merged.push(folded_id);
                    }
                    _ => debug!(backend = %name, memory = %folded_id, "Duplicate changed; not folded"),
                }
            }
            if merged.is_empty() {
                continue;
            }
            target.backend.store(survivor).await?;
            for folded_id in merged {
                target.backend.delete(folded_id).await?;
                applied.push((folded_id, survivor_id));
            }
        }
        drop(guards);
        for &(folded, _) in &applied {
            self.locks.remove(&folded);
        }

        info!(
            backend = %name,
            examined,
            folded = applied.len(),
            "Consolidation pass complete"
        );
        Ok(ConsolidationReport {
            backend: name.to_string(),
            examined,
            kept: examined.saturating_sub(applied.len()),
            folded: applied,
        })
    }

    /// Close every backend. Returns the names closed.
    ///
    /// # Errors
    /// The first failure, after every backend has been attempted.
    pub async fn close_all(&self) -> Result<Vec<String>> {
        let mut closed = Vec::with_capacity(self.backends.len());
        let mut first_error = None;
        for b in &self.backends {
            match b.backend.close().await {
                Ok(()) => closed.push(b.name.clone()),
                Err(e) => {
                    warn!(backend = %b.name, error = %e, "Backend failed to close");
                    if first_error.is_none() {
                        first_error = Some(e.into_fan_out(&b.name, closed.clone()));
                    }
                }
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(closed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::InMemoryBackend;
    use crate::error::ErrorKind;
    use crate::memory::MetadataPatch;
    use crate::session::SessionContext;

    async fn dispatcher(tiers: &[(&str, StorageTier, u32)]) -> Dispatcher {
        let mut d = Dispatcher::new(RoutingConfig::default(), ConsolidationEngine::default());
        for &(name, tier, priority) in tiers {
            d.register(Arc::new(InMemoryBackend::new(name, tier)), priority)
                .expect("register");
        }
        d.initialize_all().await.expect("init");
        d
    }

    fn record(text: &str, memory_type: MemoryType) -> MemoryRecord {
        MemoryRecord::new(text, memory_type, &SessionContext::new(None, None))
    }

    fn standard() -> [(&'static str, StorageTier, u32); 3] {
        [
            ("main", StorageTier::MainContext, 0),
            ("vectors", StorageTier::VectorStore, 10),
            ("archive", StorageTier::ExternalContext, 20),
        ]
    }

    #[tokio::test]
    async fn routing_follows_memory_type() {
        let d = dispatcher(&standard()).await;

        let working = record("scratch", MemoryType::Working);
        assert_eq!(d.store(&working, None).await.expect("store"), vec!["main"]);

        let semantic = record("fact", MemoryType::Semantic);
        assert_eq!(
            d.store(&semantic, None).await.expect("store"),
            vec!["main", "vectors"]
        );

        // Archival: preferred tier first, then priority order.
        let archival = record("old", MemoryType::Archival);
        assert_eq!(
            d.store(&archival, None).await.expect("store"),
            vec!["archive", "main", "vectors"]
        );

        let copy = d.backend("vectors").expect("backend").backend.get(semantic.id).await;
        assert_eq!(
            copy.expect("get").expect("present").metadata.storage_tier,
            StorageTier::VectorStore
        );
    }

    #[tokio::test]
    async fn tier_override_narrows_and_validates() {
        let d = dispatcher(&standard()).await;
        let semantic = record("fact", MemoryType::Semantic);
        assert_eq!(
            d.store(&semantic, Some(StorageTier::VectorStore))
                .await
                .expect("store"),
            vec!["vectors"]
        );
        let err = d
            .store(&record("x", MemoryType::Working), Some(StorageTier::GraphStore))
            .await
            .expect_err("disallowed tier");
        assert_eq!(err.kind(), ErrorKind::ValidationFailure);
    }

    #[tokio::test]
    async fn missing_eligible_backend_is_a_validation_failure() {
        let d = dispatcher(&[("vectors", StorageTier::VectorStore, 0)]).await;
        let err = d
            .store(&record("x", MemoryType::Working), None)
            .await
            .expect_err("no main_context backend");
        assert_eq!(err.kind(), ErrorKind::ValidationFailure);
    }

    #[tokio::test]
    async fn partial_write_reports_succeeded_backends() {
        let d = dispatcher(&standard()).await;
        d.backend("vectors")
            .expect("backend")
            .backend
            .close()
            .await
            .expect("close");

        let err = d
            .store(&record("fact", MemoryType::Semantic), None)
            .await
            .expect_err("vectors closed");
        match err {
            CtxMemError::StorageFailure {
                backend, succeeded, ..
            } => {
                assert_eq!(backend, "vectors");
                assert_eq!(succeeded, vec!["main".to_string()]);
            }
            other => panic!("expected StorageFailure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn retrieve_dedupes_copies_and_touches_each() {
        let d = dispatcher(&standard()).await;
        let semantic = record("tea is good", MemoryType::Semantic);
        d.store(&semantic, None).await.expect("store");

        let result = d.retrieve(&MemoryQuery::new("tea")).await.expect("retrieve");
        assert_eq!(result.total_count, 1);
        assert_eq!(result.ids(), vec![semantic.id]);

        for name in ["main", "vectors"] {
            let copy = d
                .backend(name)
                .expect("backend")
                .backend
                .get(semantic.id)
                .await
                .expect("get")
                .expect("present");
            assert_eq!(copy.metadata.access_count, 1, "backend {name}");
        }
    }

    #[tokio::test]
    async fn tier_filter_skips_backends() {
        let d = dispatcher(&standard()).await;
        let semantic = record("tea is good", MemoryType::Semantic);
        d.store(&semantic, None).await.expect("store");

        let result = d
            .retrieve(&MemoryQuery::new("tea").with_storage_tiers([StorageTier::VectorStore]))
            .await
            .expect("retrieve");
        assert_eq!(result.ids(), vec![semantic.id]);
        assert_eq!(
            result.memories[0].record.metadata.storage_tier,
            StorageTier::VectorStore
        );

        let main_copy = d
            .backend("main")
            .expect("backend")
            .backend
            .get(semantic.id)
            .await
            .expect("get")
            .expect("present");
        assert_eq!(main_copy.metadata.access_count, 0);
    }

    #[tokio::test]
    async fn update_and_delete_reach_every_holder() {
        let d = dispatcher(&standard()).await;
        let semantic = record("fact", MemoryType::Semantic);
        d.store(&semantic, None).await.expect("store");

        let patch = MemoryPatch::metadata(MetadataPatch {
            importance: Some(0.9),
            ..MetadataPatch::default()
        });
        let (updated, backends) = d.update(semantic.id, &patch).await.expect("update");
        assert_eq!(backends, vec!["main", "vectors"]);
        assert!((updated.metadata.importance - 0.9).abs() < f32::EPSILON);

        assert_eq!(
            d.delete(semantic.id).await.expect("delete"),
            vec!["main", "vectors"]
        );
        let err = d.delete(semantic.id).await.expect_err("gone");
        assert_eq!(err.kind(), ErrorKind::NotFound);
        let err = d.update(semantic.id, &patch).await.expect_err("gone");
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn consolidate_folds_within_one_backend() {
        let d = dispatcher(&[("main", StorageTier::MainContext, 0)]).await;
        let mut first = record("User likes tea", MemoryType::Working);
        first.metadata.access_count = 2;
        let mut second = record("user likes  TEA", MemoryType::Working);
        second.metadata.created = first.metadata.created + chrono::Duration::seconds(1);
        second.metadata.updated = second.metadata.created;
        second.metadata.last_accessed = second.metadata.created;
        second.metadata.access_count = 3;
        d.store(&first, None).await.expect("store");
        d.store(&second, None).await.expect("store");

        let report = d
            .consolidate("main", Utc::now() + chrono::Duration::hours(1))
            .await
            .expect("consolidate");
        assert_eq!(report.examined, 2);
        assert_eq!(report.kept, 1);
        assert_eq!(report.folded, vec![(second.id, first.id)]);

        let main = &d.backend("main").expect("backend").backend;
        assert_eq!(main.count().await.expect("count"), 1);
        let survivor = main.get(first.id).await.expect("get").expect("present");
        assert_eq!(survivor.metadata.access_count, 5);
        assert!((survivor.metadata.importance - 0.6).abs() < 1e-5);

        let err = d
            .consolidate("nope", Utc::now())
            .await
            .expect_err("unknown backend");
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    /// Backend whose consolidation hook applies a write that races the pass.
    #[derive(Debug)]
    struct RacingBackend {
        inner: InMemoryBackend,
        race: parking_lot::Mutex<Option<(MemoryId, MemoryPatch)>>,
    }

    #[async_trait::async_trait]
    impl StorageBackend for RacingBackend {
        fn name(&self) -> &str {
            self.inner.name()
        }
        fn tier(&self) -> StorageTier {
            self.inner.tier()
        }
        async fn initialize(&self) -> Result<()> {
            self.inner.initialize().await
        }
        async fn store(&self, record: MemoryRecord) -> Result<()> {
            self.inner.store(record).await
        }
        async fn scan(&self, query: &MemoryQuery) -> Result<Vec<ScoredMemory>> {
            self.inner.scan(query).await
        }
        async fn touch(&self, ids: &[MemoryId], at: Timestamp) -> Result<()> {
            self.inner.touch(ids, at).await
        }
        async fn get(&self, id: MemoryId) -> Result<Option<MemoryRecord>> {
            self.inner.get(id).await
        }
        async fn records(&self) -> Result<Vec<MemoryRecord>> {
            self.inner.records().await
        }
        async fn update(&self, id: MemoryId, patch: &MemoryPatch) -> Result<MemoryRecord> {
            self.inner.update(id, patch).await
        }
        async fn delete(&self, id: MemoryId) -> Result<()> {
            self.inner.delete(id).await
        }
        async fn consolidate(
            &self,
            _records: &[MemoryRecord],
        ) -> Result<Option<crate::consolidation::ConsolidationOutcome>> {
            let race = self.race.lock().take();
            if let Some((id, patch)) = race {
                self.inner.update(id, &patch).await?;
                self.inner.touch(&[id], Utc::now()).await?;
            }
            Ok(None)
        }
        async fn close(&self) -> Result<()> {
            self.inner.close().await
        }
    }

    #[tokio::test]
    async fn consolidation_keeps_writes_made_after_the_snapshot() {
        let mut first = record("User likes tea", MemoryType::Working).with_importance(0.5);
        first.metadata.access_count = 2;
        let mut second = record("user likes tea", MemoryType::Working);
        second.metadata.created = first.metadata.created + chrono::Duration::seconds(1);
        second.metadata.updated = second.metadata.created;
        second.metadata.last_accessed = second.metadata.created;
        second.metadata.access_count = 3;

        let racing = Arc::new(RacingBackend {
            inner: InMemoryBackend::new("main", StorageTier::MainContext),
            race: parking_lot::Mutex::new(Some((
                first.id,
                MemoryPatch::metadata(MetadataPatch {
                    importance: Some(0.05),
                    ..MetadataPatch::default()
                }),
            ))),
        });
        let mut d = Dispatcher::new(RoutingConfig::default(), ConsolidationEngine::default());
        d.register(racing.clone(), 0).expect("register");
        d.initialize_all().await.expect("init");
        d.store(&first, None).await.expect("store");
        d.store(&second, None).await.expect("store");

        let report = d
            .consolidate("main", Utc::now() + chrono::Duration::hours(1))
            .await
            .expect("consolidate");
        assert_eq!(report.folded, vec![(second.id, first.id)]);
        assert_eq!(report.kept, 1);

        let survivor = racing.get(first.id).await.expect("get").expect("present");
        assert!((survivor.metadata.importance - 0.15).abs() < 1e-5);
        // 2 stored + 1 concurrent access + 3 handed over.
        assert_eq!(survivor.metadata.access_count, 6);
        assert!(!racing.contains(second.id).await.expect("contains"));
        assert_eq!(d.lock_count(), 1);
    }

    #[tokio::test]
    async fn consolidation_skips_duplicates_edited_after_the_snapshot() {
        let first = record("same fact", MemoryType::Working);
        let mut second = record("same fact", MemoryType::Working);
        second.metadata.created = first.metadata.created + chrono::Duration::seconds(1);
        second.metadata.updated = second.metadata.created;
        second.metadata.last_accessed = second.metadata.created;

        let racing = Arc::new(RacingBackend {
            inner: InMemoryBackend::new("main", StorageTier::MainContext),
            race: parking_lot::Mutex::new(Some((
                second.id,
                MemoryPatch {
                    content: Some(crate::memory::MemoryContent::text("a different fact")),
                    ..MemoryPatch::default()
                },
            ))),
        });
        let mut d = Dispatcher::new(RoutingConfig::default(), ConsolidationEngine::default());
        d.register(racing.clone(), 0).expect("register");
        d.initialize_all().await.expect("init");
        d.store(&first, None).await.expect("store");
        d.store(&second, None).await.expect("store");

        let report = d
            .consolidate("main", Utc::now() + chrono::Duration::hours(1))
            .await
            .expect("consolidate");
        assert!(report.folded.is_empty());
        assert_eq!(report.kept, 2);
        assert_eq!(racing.count().await.expect("count"), 2);
        let untouched = racing.get(first.id).await.expect("get").expect("present");
        assert!((untouched.metadata.importance - first.metadata.importance).abs() < f32::EPSILON);
    }

    #[tokio::test]
    async fn failed_store_releases_its_lock() {
        let d = dispatcher(&standard()).await;
        d.backend("main")
            .expect("backend")
            .backend
            .close()
            .await
            .expect("close");

        let err = d
            .store(&record("scratch", MemoryType::Working), None)
            .await
            .expect_err("main closed");
        assert_eq!(err.kind(), ErrorKind::NotInitialized);
        assert_eq!(d.lock_count(), 0);

        // A partial write keeps the lock: the id lives on elsewhere.
        let d = dispatcher(&standard()).await;
        d.backend("vectors")
            .expect("backend")
            .backend
            .close()
            .await
            .expect("close");
        d.store(&record("fact", MemoryType::Semantic), None)
            .await
            .expect_err("vectors closed");
        assert_eq!(d.lock_count(), 1);
    }

    #[tokio::test]
    async fn horizon_excludes_recent_records() {
        let d = dispatcher(&[("main", StorageTier::MainContext, 0)]).await;
        let a = record("same", MemoryType::Working);
        let b = record("same", MemoryType::Working);
        d.store(&a, None).await.expect("store");
        d.store(&b, None).await.expect("store");

        let report = d
            .consolidate("main", a.metadata.created - chrono::Duration::seconds(1))
            .await
            .expect("consolidate");
        assert_eq!(report.examined, 0);
        assert!(report.folded.is_empty());
    }

    #[tokio::test]
    async fn duplicate_registration_is_rejected() {
        let mut d = Dispatcher::new(RoutingConfig::default(), ConsolidationEngine::default());
        d.register(Arc::new(InMemoryBackend::new("main", StorageTier::MainContext)), 0)
            .expect("first");
        let err = d
            .register(Arc::new(InMemoryBackend::new("main", StorageTier::VectorStore)), 1)
            .expect_err("duplicate");
        assert_eq!(err.kind(), ErrorKind::ValidationFailure);
    }
}
