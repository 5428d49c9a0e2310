//! Memory Retrieval: score, filter, sort, and paginate.
//!
//! Every backend runs the same pipeline over its own records:
//!
//! 1. Candidates: the exact-id match, or every record.
//! 2. Scoring with the pluggable [`RelevanceScorer`], dropping anything
//!    below the threshold. Exact-id lookups are not scored.
//! 3. Filtering on memory type, storage tier, creation time, and metadata.
//! 4. Sorting: score desc, importance desc, creation time desc.
//! 5. Pagination over `[offset, offset + limit)`.
//!
//! Steps 1–4 are [`RetrievalEngine::scan`]; backends paginate and apply
//! access tracking themselves.

pub mod scoring;

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::RetrievalConfig;
use crate::memory::MemoryRecord;
use crate::types::{MemoryId, MemoryType, RetrievalScore, StorageTier, TimeRange};

pub use scoring::{LexicalScorer, RelevanceScorer};

/// Page size used when a query does not set one.
pub const DEFAULT_LIMIT: usize = 10;

/// Score reported for exact-id lookups, which skip scoring.
pub const EXACT_MATCH_SCORE: f64 = 1.0;

// ---------------------------------------------------------------------------
// Query
// ---------------------------------------------------------------------------

/// Optional filters applied after scoring.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryFilters {
    /// Keep only these memory types.
    #[serde(default)]
    pub memory_types: Option<Vec<MemoryType>>,
    /// Keep only these storage tiers. Also narrows which backends are asked.
    #[serde(default)]
    pub storage_tiers: Option<Vec<StorageTier>>,
    /// Keep only records created inside this range.
    #[serde(default)]
    pub time_range: Option<TimeRange>,
    /// Metadata keys that must equal the given values.
    #[serde(default)]
    pub metadata: BTreeMap<String, Value>,
}

impl QueryFilters {
    /// Whether `tier` passes the storage-tier filter.
    #[must_use]
    pub fn allows_tier(&self, tier: StorageTier) -> bool {
        self.storage_tiers
            .as_ref()
            .is_none_or(|tiers| tiers.contains(&tier))
    }

    /// Whether `record` passes every filter.
    #[must_use]
    pub fn accepts(&self, record: &MemoryRecord) -> bool {
        if let Some(types) = &self.memory_types {
            if !types.contains(&record.memory_type) {
                return false;
            }
        }
        if !self.allows_tier(record.metadata.storage_tier) {
            return false;
        }
        if let Some(range) = &self.time_range {
            if !range.contains(&record.metadata.created) {
                return false;
            }
        }
        self.metadata
            .iter()
            .all(|(key, value)| record.metadata.matches(key, value))
    }
}

/// A retrieval request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryQuery {
    /// Free-text query.
    #[serde(default)]
    pub text: String,
    /// Exact-id lookup. Skips scoring and sorting.
    #[serde(default)]
    pub id: Option<MemoryId>,
    /// Post-scoring filters.
    #[serde(default)]
    pub filters: QueryFilters,
    /// Page size.
    #[serde(default = "default_limit")]
    pub limit: usize,
    /// Records to skip before the page starts.
    #[serde(default)]
    pub offset: usize,
    /// Minimum score. Falls back to the engine default.
    #[serde(default)]
    pub threshold: Option<f64>,
}

fn default_limit() -> usize {
    DEFAULT_LIMIT
}

impl MemoryQuery {
    /// Free-text query with default paging.
    #[must_use]
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            id: None,
            filters: QueryFilters::default(),
            limit: DEFAULT_LIMIT,
            offset: 0,
            threshold: None,
        }
    }

    /// Exact-id lookup.
    #[must_use]
    pub fn by_id(id: MemoryId) -> Self {
        Self {
            id: Some(id),
            ..Self::new("")
        }
    }

    /// Set the page size.
    #[must_use]
    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    /// Set the page offset.
    #[must_use]
    pub fn with_offset(mut self, offset: usize) -> Self {
        self.offset = offset;
        self
    }

    /// Set the minimum score.
    #[must_use]
    pub fn with_threshold(mut self, threshold: f64) -> Self {
        self.threshold = Some(threshold);
        self
    }

    /// Keep only these memory types.
    #[must_use]
    pub fn with_memory_types(mut self, types: impl IntoIterator<Item = MemoryType>) -> Self {
        self.filters.memory_types = Some(types.into_iter().collect());
        self
    }

    /// Keep only these storage tiers.
    #[must_use]
    pub fn with_storage_tiers(mut self, tiers: impl IntoIterator<Item = StorageTier>) -> Self {
        self.filters.storage_tiers = Some(tiers.into_iter().collect());
        self
    }

    /// Keep only records created inside `range`.
    #[must_use]
    pub fn with_time_range(mut self, range: TimeRange) -> Self {
        self.filters.time_range = Some(range);
        self
    }

    /// Require a metadata key to equal `value`.
    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.filters.metadata.insert(key.into(), value.into());
        self
    }
}

// ---------------------------------------------------------------------------
// Results
// ---------------------------------------------------------------------------

/// A record with its relevance score.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredMemory {
    /// The record, as it was before access tracking.
    pub record: MemoryRecord,
    /// Relevance score.
    pub score: RetrievalScore,
}

impl ScoredMemory {
    /// Ranking order: best first. Ids break exact ties so the order is
    /// stable across calls.
    #[must_use]
    pub fn rank_cmp(&self, other: &Self) -> Ordering {
        other
            .score
            .cmp(&self.score)
            .then_with(|| {
                other
                    .record
                    .metadata
                    .importance
                    .total_cmp(&self.record.metadata.importance)
            })
            .then_with(|| other.record.metadata.created.cmp(&self.record.metadata.created))
            .then_with(|| self.record.id.cmp(&other.record.id))
    }
}

/// One page of retrieval results.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemorySearchResult {
    /// The page, best first.
    pub memories: Vec<ScoredMemory>,
    /// Matches after filtering, before pagination.
    pub total_count: usize,
    /// The query that produced this page.
    pub query: MemoryQuery,
    /// Time spent searching.
    pub took: Duration,
}

impl MemorySearchResult {
    /// Ids in page order.
    #[must_use]
    pub fn ids(&self) -> Vec<MemoryId> {
        self.memories.iter().map(|m| m.record.id).collect()
    }

    /// Whether the page is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.memories.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// The shared retrieval pipeline.
#[derive(Debug, Clone)]
pub struct RetrievalEngine {
    scorer: Arc<dyn RelevanceScorer>,
    default_threshold: f64,
}

impl RetrievalEngine {
    /// Engine with the lexical scorer and thresholds from config.
    #[must_use]
    pub fn new(config: &RetrievalConfig) -> Self {
        Self::with_scorer(Arc::new(LexicalScorer::from_config(config)), config.default_threshold)
    }

    /// Engine with a custom scorer.
    #[must_use]
    pub fn with_scorer(scorer: Arc<dyn RelevanceScorer>, default_threshold: f64) -> Self {
        Self {
            scorer,
            default_threshold,
        }
    }

    /// The threshold applied to queries that carry none.
    #[must_use]
    pub fn default_threshold(&self) -> f64 {
        self.default_threshold
    }

    /// Steps 1–4: candidates, scoring, filtering, sorting.
    ///
    /// Has no side effects on the records.
    pub fn scan<'a, I>(&self, records: I, query: &MemoryQuery) -> Vec<ScoredMemory>
    where
        I: IntoIterator<Item = &'a MemoryRecord>,
    {
        if let Some(id) = query.id {
            return records
                .into_iter()
                .filter(|r| r.id == id && query.filters.accepts(r))
                .map(|r| ScoredMemory {
                    record: r.clone(),
                    score: RetrievalScore::new(EXACT_MATCH_SCORE),
                })
                .collect();
        }

        let threshold = query.threshold.unwrap_or(self.default_threshold);
        let mut scored: Vec<ScoredMemory> = records
            .into_iter()
            .filter_map(|r| {
                let score = self.scorer.score(&query.text, r);
                (score >= threshold && query.filters.accepts(r)).then(|| ScoredMemory {
                    record: r.clone(),
                    score: RetrievalScore::new(score),
                })
            })
            .collect();
        sort_by_relevance(&mut scored);
        tracing::trace!(
            scorer = self.scorer.name(),
            threshold,
            matched = scored.len(),
            "Scan complete"
        );
        scored
    }
}

impl Default for RetrievalEngine {
    fn default() -> Self {
        Self::new(&RetrievalConfig::default())
    }
}

/// Sort best first.
pub fn sort_by_relevance(results: &mut [ScoredMemory]) {
    results.sort_by(ScoredMemory::rank_cmp);
}

/// Slice out `[offset, offset + limit)`. Out-of-range offsets give an
/// empty page.
#[must_use]
pub fn paginate<T>(items: Vec<T>, offset: usize, limit: usize) -> Vec<T> {
    items.into_iter().skip(offset).take(limit).collect()
}
