//! The store facade: one owned entry point for every operation.
//!
//! A [`MemoryStore`] owns the session manager, the dispatcher and its
//! backends, the event bus, and the counters. Every memory operation is
//! scoped to an open session and fails with `SessionNotFound` otherwise.

use std::sync::Arc;

use chrono::{Duration, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{Instrument, info, info_span};

use crate::backend::sqlite::SqliteLocation;
use crate::backend::{InMemoryBackend, SqliteBackend, StorageBackend};
use crate::config::{BackendConfig, BackendKind, CtxMemConfig};
use crate::consolidation::{ConsolidationEngine, ConsolidationReport};
use crate::dispatcher::Dispatcher;
use crate::error::{CtxMemError, Result};
use crate::events::{EventBus, StoreEvent};
use crate::memory::{MemoryPatch, MemoryRecord, StoreOptions};
use crate::metrics::{CounterSnapshot, LatencyMonitor, LatencyPercentiles, StoreCounters, spans};
use crate::retrieval::{MemoryQuery, MemorySearchResult, QueryFilters, RetrievalEngine};
use crate::session::{SessionContext, SessionManager};
use crate::types::{MemoryId, MemoryType, SessionId, Timestamp};

/// Retrieval options accompanying a free-text query.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryOptions {
    /// Exact-id lookup.
    #[serde(default)]
    pub id: Option<MemoryId>,
    /// Post-scoring filters.
    #[serde(default, flatten)]
    pub filters: QueryFilters,
    /// Page size. Defaults to `retrieval.default_limit`.
    #[serde(default)]
    pub limit: Option<usize>,
    /// Records to skip.
    #[serde(default)]
    pub offset: usize,
    /// Minimum score. Defaults to the engine threshold.
    #[serde(default)]
    pub threshold: Option<f64>,
}

impl QueryOptions {
    /// Build the full query for `text`.
    #[must_use]
    pub fn into_query(self, text: impl Into<String>, default_limit: usize) -> MemoryQuery {
        MemoryQuery {
            text: text.into(),
            id: self.id,
            filters: self.filters,
            limit: self.limit.unwrap_or(default_limit),
            offset: self.offset,
            threshold: self.threshold,
        }
    }
}

/// Session-scoped memory store over one or more backends.
#[derive(Debug)]
pub struct MemoryStore {
    config: CtxMemConfig,
    sessions: SessionManager,
    dispatcher: Dispatcher,
    events: EventBus,
    counters: StoreCounters,
    latency: LatencyMonitor,
}

impl MemoryStore {
    /// Build and initialize a store with the backends named in `config`.
    ///
    /// # Errors
    /// `Config` for an invalid configuration; otherwise the first backend
    /// that fails to initialize.
    pub async fn from_config(config: CtxMemConfig) -> Result<Self> {
        config.validate()?;
        let engine = RetrievalEngine::new(&config.retrieval);
        let backends = config
            .backends
            .iter()
            .map(|b| (build_backend(b, &engine), b.priority))
            .collect();
        Self::with_backends(config, backends).await
    }

    /// Build and initialize a store over caller-supplied backends. The
    /// `backends` section of `config` is ignored.
    ///
    /// # Errors
    /// `Config` for an invalid configuration, `Validation` for duplicate
    /// backend names, or the first initialization failure.
    pub async fn with_backends(
        config: CtxMemConfig,
        backends: Vec<(Arc<dyn StorageBackend>, u32)>,
    ) -> Result<Self> {
        config.validate()?;
        let events = EventBus::new(config.sessions.event_channel_capacity);
        let mut dispatcher = Dispatcher::new(
            config.routing.clone(),
            ConsolidationEngine::new(config.consolidation.importance_boost),
        );
        for (backend, priority) in backends {
            dispatcher.register(backend, priority)?;
        }
        dispatcher.initialize_all().await?;
        info!(
            name = %config.general.name,
            backends = dispatcher.backends().len(),
            "Memory store ready"
        );

        Ok(Self {
            sessions: SessionManager::new(events.clone()),
            dispatcher,
            events,
            counters: StoreCounters::new(),
            latency: LatencyMonitor::default(),
            config,
        })
    }

    // ------------------------------------------------------------------
    // Sessions
    // ------------------------------------------------------------------

    /// Open a session.
    pub fn create_session(&self, user_id: Option<String>, agent_id: Option<String>) -> SessionId {
        StoreCounters::add(&self.counters.sessions_created, 1);
        self.sessions.create_session(user_id, agent_id)
    }

    /// Close a session. Its records are kept.
    ///
    /// # Errors
    /// `SessionNotFound` for an unknown id.
    pub fn close_session(&self, session_id: SessionId) -> Result<()> {
        self.observe(self.sessions.close_session(session_id))
    }

    /// Snapshot of a session's context.
    ///
    /// # Errors
    /// `SessionNotFound` for an unknown id.
    pub fn session(&self, session_id: SessionId) -> Result<SessionContext> {
        self.sessions.get(session_id)
    }

    /// Set one key of a session's correlation state. Records stored
    /// afterwards carry it in their context.
    ///
    /// # Errors
    /// `SessionNotFound` for an unknown id.
    pub fn set_state(
        &self,
        session_id: SessionId,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> Result<()> {
        self.observe(self.sessions.set_state(session_id, key, value))
    }

    /// Number of open sessions.
    #[must_use]
    pub fn session_count(&self) -> usize {
        self.sessions.session_count()
    }

    // ------------------------------------------------------------------
    // Memory operations
    // ------------------------------------------------------------------

    /// Store a new memory and return its id.
    ///
    /// # Errors
    /// `SessionNotFound`, `Validation` for out-of-range scores or an
    /// ineligible tier, or a backend failure.
    pub async fn store(
        &self,
        text: impl Into<String>,
        memory_type: MemoryType,
        session_id: SessionId,
        options: StoreOptions,
    ) -> Result<MemoryId> {
        let span = info_span!(spans::MEMORY_STORE, session = %session_id, %memory_type);
        let result = self
            .store_inner(text.into(), memory_type, session_id, options)
            .instrument(span)
            .await;
        self.observe(result)
    }

    async fn store_inner(
        &self,
        text: String,
        memory_type: MemoryType,
        session_id: SessionId,
        options: StoreOptions,
    ) -> Result<MemoryId> {
        let context = self.sessions.get(session_id)?;
        let mut record = MemoryRecord::new(text, memory_type, &context);
        let tier_override = options.storage_tier;
        options.apply_to(&mut record);
        record.validate()?;

        let backends = self.dispatcher.store(&record, tier_override).await?;
        StoreCounters::add(&self.counters.stores, 1);
        self.events.publish(StoreEvent::MemoryStored {
            memory_id: record.id,
            session_id,
            backends,
        });
        Ok(record.id)
    }

    /// Retrieve memories matching `query_text`.
    ///
    /// # Errors
    /// `SessionNotFound`, `Validation` for a NaN threshold, or a backend
    /// failure.
    pub async fn retrieve(
        &self,
        query_text: impl Into<String>,
        session_id: SessionId,
        options: QueryOptions,
    ) -> Result<MemorySearchResult> {
        let query = options.into_query(query_text, self.config.retrieval.default_limit);
        self.retrieve_query(&query, session_id).await
    }

    /// Retrieve with a fully built query.
    ///
    /// # Errors
    /// As [`MemoryStore::retrieve`].
    pub async fn retrieve_query(
        &self,
        query: &MemoryQuery,
        session_id: SessionId,
    ) -> Result<MemorySearchResult> {
        let span = info_span!(spans::MEMORY_RETRIEVE, session = %session_id);
        let result = self.retrieve_inner(query, session_id).instrument(span).await;
        self.observe(result)
    }

    async fn retrieve_inner(
        &self,
        query: &MemoryQuery,
        session_id: SessionId,
    ) -> Result<MemorySearchResult> {
        self.sessions.get(session_id)?;
        if query.threshold.is_some_and(f64::is_nan) {
            return Err(CtxMemError::Validation("threshold must be a number".into()));
        }

        let result = self.dispatcher.retrieve(query).await?;
        if self.latency.record(result.took) {
            tracing::warn!(
                took_ms = result.took.as_secs_f64() * 1000.0,
                budget_ms = self.latency.budget_ms(),
                "Slow retrieval"
            );
        }
        StoreCounters::add(&self.counters.retrievals, 1);
        StoreCounters::add(
            &self.counters.records_returned,
            u64::try_from(result.memories.len()).unwrap_or(u64::MAX),
        );
        self.events.publish(StoreEvent::MemoryRetrieved {
            session_id,
            returned: result.memories.len(),
            total_count: result.total_count,
        });
        Ok(result)
    }

    /// Apply a partial update to a memory on every backend holding it.
    ///
    /// # Errors
    /// `SessionNotFound`, `MemoryNotFound`, `Validation`, or a backend
    /// failure.
    pub async fn update(
        &self,
        memory_id: MemoryId,
        patch: MemoryPatch,
        session_id: SessionId,
    ) -> Result<MemoryRecord> {
        let span = info_span!(spans::MEMORY_UPDATE, session = %session_id, memory = %memory_id);
        let result = async {
            self.sessions.get(session_id)?;
            let (record, backends) = self.dispatcher.update(memory_id, &patch).await?;
            StoreCounters::add(&self.counters.updates, 1);
            self.events
                .publish(StoreEvent::MemoryUpdated { memory_id, backends });
            Ok(record)
        }
        .instrument(span)
        .await;
        self.observe(result)
    }

    /// Delete a memory from every backend holding it.
    ///
    /// # Errors
    /// `SessionNotFound`, `MemoryNotFound`, or a backend failure.
    pub async fn delete(&self, memory_id: MemoryId, session_id: SessionId) -> Result<()> {
        let span = info_span!(spans::MEMORY_DELETE, session = %session_id, memory = %memory_id);
        let result = async {
            self.sessions.get(session_id)?;
            let backends = self.dispatcher.delete(memory_id).await?;
            StoreCounters::add(&self.counters.deletes, 1);
            self.events
                .publish(StoreEvent::MemoryDeleted { memory_id, backends });
            Ok(())
        }
        .instrument(span)
        .await;
        self.observe(result)
    }

    /// Fetch one memory without touching its access statistics.
    ///
    /// # Errors
    /// `SessionNotFound`, `MemoryNotFound`, or a backend failure.
    pub async fn get(&self, memory_id: MemoryId, session_id: SessionId) -> Result<MemoryRecord> {
        let result = async {
            self.sessions.get(session_id)?;
            self.dispatcher
                .get(memory_id)
                .await?
                .ok_or(CtxMemError::MemoryNotFound(memory_id))
        }
        .await;
        self.observe(result)
    }

    // ------------------------------------------------------------------
    // Maintenance
    // ------------------------------------------------------------------

    /// Consolidate one backend's records created at or before `horizon`.
    ///
    /// # Errors
    /// `BackendNotFound` or a backend failure.
    pub async fn consolidate(&self, backend: &str, horizon: Timestamp) -> Result<ConsolidationReport> {
        let span = info_span!(spans::CONSOLIDATION, backend);
        let result = self.dispatcher.consolidate(backend, horizon).instrument(span).await;
        if let Ok(report) = &result {
            StoreCounters::add(
                &self.counters.folds,
                u64::try_from(report.folded.len()).unwrap_or(u64::MAX),
            );
            self.events.publish(StoreEvent::Consolidated {
                backend: report.backend.clone(),
                examined: report.examined,
                folded: report.folded.len(),
            });
        }
        self.observe(result)
    }

    /// Consolidate every backend up to `horizon`.
    ///
    /// # Errors
    /// The first failing backend; earlier reports are discarded.
    pub async fn consolidate_all(&self, horizon: Timestamp) -> Result<Vec<ConsolidationReport>> {
        let names: Vec<String> = self
            .dispatcher
            .backends()
            .iter()
            .map(|b| b.name.clone())
            .collect();
        let mut reports = Vec::with_capacity(names.len());
        for name in names {
            reports.push(self.consolidate(&name, horizon).await?);
        }
        Ok(reports)
    }

    /// The pass an external scheduler runs every
    /// `consolidation.interval_secs`: every backend, records older than
    /// `consolidation.min_age_secs`.
    ///
    /// # Errors
    /// As [`MemoryStore::consolidate_all`].
    pub async fn consolidate_due(&self) -> Result<Vec<ConsolidationReport>> {
        let min_age = i64::try_from(self.config.consolidation.min_age_secs).unwrap_or(i64::MAX);
        let horizon = Duration::try_seconds(min_age)
            .and_then(|age| Utc::now().checked_sub_signed(age))
            .unwrap_or(chrono::DateTime::<Utc>::MIN_UTC);
        self.consolidate_all(horizon).await
    }

    /// Close every session, then every backend.
    ///
    /// # Errors
    /// The first backend that fails to close; the rest are still closed.
    pub async fn shutdown(&self) -> Result<()> {
        let span = info_span!(spans::SHUTDOWN);
        let result = async {
            let sessions = self.sessions.close_all();
            let backends = self.dispatcher.close_all().await?;
            info!(sessions = sessions.len(), backends = backends.len(), "Memory store shut down");
            self.events.publish(StoreEvent::BackendsClosed { backends });
            Ok(())
        }
        .instrument(span)
        .await;
        self.observe(result)
    }

    // ------------------------------------------------------------------
    // Introspection
    // ------------------------------------------------------------------

    /// Subscribe to store events.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.events.subscribe()
    }

    /// Counter snapshot.
    #[must_use]
    pub fn counters(&self) -> CounterSnapshot {
        self.counters.snapshot()
    }

    /// Recent retrieval latency percentiles.
    #[must_use]
    pub fn latency(&self) -> LatencyPercentiles {
        self.latency.percentiles()
    }

    /// Active configuration.
    #[must_use]
    pub fn config(&self) -> &CtxMemConfig {
        &self.config
    }

    /// The dispatcher and its registered backends.
    #[must_use]
    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    fn observe<T>(&self, result: Result<T>) -> Result<T> {
        if let Err(e) = &result {
            StoreCounters::add(&self.counters.failures, 1);
            tracing::debug!(kind = %e.kind(), error = %e, "Operation failed");
        }
        result
    }
}

fn build_backend(config: &BackendConfig, engine: &RetrievalEngine) -> Arc<dyn StorageBackend> {
    match config.kind {
        BackendKind::InMemory => Arc::new(InMemoryBackend::with_engine(
            config.name.clone(),
            config.tier,
            engine.clone(),
        )),
        BackendKind::Sqlite => {
            let location = config
                .path()
                .map_or(SqliteLocation::InMemory, SqliteLocation::File);
            Arc::new(SqliteBackend::with_location(
                config.name.clone(),
                config.tier,
                location,
                engine.clone(),
            ))
        }
    }
}
