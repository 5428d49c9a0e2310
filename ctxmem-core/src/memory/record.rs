//! Memory Record: one stored fact.
//!
//! A record bundles the fact itself ([`MemoryContent`]), bookkeeping
//! ([`MemoryMetadata`]), and the session context it was written under.
//! Importance and confidence live in [0, 1]; `access_count` only grows;
//! `updated` and `last_accessed` never precede `created`.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{CtxMemError, Result};
use crate::session::SessionContext;
use crate::types::{MemoryId, MemoryType, StorageTier, Timestamp};

/// Source recorded when the caller does not supply one.
pub const DEFAULT_SOURCE: &str = "session";
/// Importance assigned when the caller does not supply one.
pub const DEFAULT_IMPORTANCE: f32 = 0.5;
/// Confidence assigned when the caller does not supply one.
pub const DEFAULT_CONFIDENCE: f32 = 1.0;

/// Names of the built-in metadata fields. `extra` is flattened next to
/// them on the wire, so it may not use any of these keys.
pub const RESERVED_METADATA_KEYS: [&str; 8] = [
    "source",
    "confidence",
    "importance",
    "access_count",
    "created",
    "updated",
    "last_accessed",
    "storage_tier",
];

/// A typed edge from one memory to another.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Relationship {
    /// Kind of relation (e.g. "contradicts", "refines").
    pub relation_type: String,
    /// Memory on the other end.
    pub target_id: MemoryId,
    /// Strength of the relation (0.0 to 1.0).
    pub strength: f32,
}

/// The fact itself.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MemoryContent {
    /// Natural-language statement.
    pub text: String,
    /// Ordered keywords.
    #[serde(default)]
    pub keywords: Vec<String>,
    /// Unordered tags.
    #[serde(default)]
    pub tags: BTreeSet<String>,
    /// Optional dense vector supplied by an external embedder.
    #[serde(default)]
    pub embedding: Option<Vec<f32>>,
    /// Edges to other memories.
    #[serde(default)]
    pub relationships: Vec<Relationship>,
}

impl MemoryContent {
    /// Plain text content with no keywords, tags, or relations.
    #[must_use]
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Self::default()
        }
    }
}

/// Bookkeeping attached to every record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryMetadata {
    /// Who or what produced the fact.
    pub source: String,
    /// Belief in the fact (0.0 to 1.0).
    pub confidence: f32,
    /// How much the fact matters (0.0 to 1.0).
    pub importance: f32,
    /// Times the record was returned from a query page.
    pub access_count: u64,
    /// Creation time.
    pub created: Timestamp,
    /// Last mutation time.
    pub updated: Timestamp,
    /// Last time the record was returned from a query page.
    pub last_accessed: Timestamp,
    /// Tier of the backend holding this copy.
    pub storage_tier: StorageTier,
    /// Free-form keys matched by metadata-equality filters.
    #[serde(default, flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl MemoryMetadata {
    fn new(now: Timestamp) -> Self {
        Self {
            source: DEFAULT_SOURCE.to_string(),
            confidence: DEFAULT_CONFIDENCE,
            importance: DEFAULT_IMPORTANCE,
            access_count: 0,
            created: now,
            updated: now,
            last_accessed: now,
            storage_tier: StorageTier::MainContext,
            extra: BTreeMap::new(),
        }
    }

    /// Look up a metadata key as a JSON value.
    ///
    /// Named fields shadow `extra` keys of the same name.
    #[must_use]
    pub fn lookup(&self, key: &str) -> Option<Value> {
        match key {
            "source" => Some(Value::from(self.source.clone())),
            "confidence" => Some(Value::from(f64::from(self.confidence))),
            "importance" => Some(Value::from(f64::from(self.importance))),
            "access_count" => Some(Value::from(self.access_count)),
            "storage_tier" => Some(Value::from(self.storage_tier.as_str())),
            "created" => Some(Value::from(self.created.to_rfc3339())),
            "updated" => Some(Value::from(self.updated.to_rfc3339())),
            "last_accessed" => Some(Value::from(self.last_accessed.to_rfc3339())),
            other => self.extra.get(other).cloned(),
        }
    }

    /// Whether `key` holds a value equal to `expected`.
    ///
    /// Numbers compare with a small tolerance so `0.8` matches an
    /// importance stored as `f32`.
    #[must_use]
    pub fn matches(&self, key: &str, expected: &Value) -> bool {
        match (self.lookup(key), expected) {
            (Some(Value::Number(actual)), Value::Number(expected)) => {
                match (actual.as_f64(), expected.as_f64()) {
                    (Some(a), Some(b)) => (a - b).abs() < 1e-6,
                    _ => false,
                }
            }
            (Some(actual), expected) => actual == *expected,
            (None, _) => false,
        }
    }
}

/// One stored fact with its metadata and originating context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryRecord {
    /// Unique identifier, immutable.
    pub id: MemoryId,
    /// Semantic category, immutable.
    pub memory_type: MemoryType,
    /// The fact.
    pub content: MemoryContent,
    /// Bookkeeping.
    pub metadata: MemoryMetadata,
    /// Session context captured at write time.
    pub context: SessionContext,
    /// Seconds to live from creation. Recorded, not enforced.
    #[serde(default)]
    pub ttl: Option<u64>,
}

impl MemoryRecord {
    /// Create a record for `text` under `context`, with default metadata.
    ///
    /// The record's context copy is stamped with the new record id.
    #[must_use]
    pub fn new(text: impl Into<String>, memory_type: MemoryType, context: &SessionContext) -> Self {
        let id = MemoryId::new();
        Self {
            id,
            memory_type,
            content: MemoryContent::text(text),
            metadata: MemoryMetadata::new(Utc::now()),
            context: context.for_memory(id),
            ttl: None,
        }
    }

    /// Set importance, clamped to [0, 1].
    #[must_use]
    pub fn with_importance(mut self, importance: f32) -> Self {
        self.metadata.importance = clamp_unit(importance);
        self
    }

    /// Set confidence, clamped to [0, 1].
    #[must_use]
    pub fn with_confidence(mut self, confidence: f32) -> Self {
        self.metadata.confidence = clamp_unit(confidence);
        self
    }

    /// Set the source label.
    #[must_use]
    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.metadata.source = source.into();
        self
    }

    /// Add tags.
    #[must_use]
    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.content.tags.extend(tags.into_iter().map(Into::into));
        self
    }

    /// Append keywords.
    #[must_use]
    pub fn with_keywords<I, S>(mut self, keywords: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.content
            .keywords
            .extend(keywords.into_iter().map(Into::into));
        self
    }

    /// Set the time-to-live in seconds.
    #[must_use]
    pub fn with_ttl(mut self, seconds: u64) -> Self {
        self.ttl = Some(seconds);
        self
    }

    /// Set a free-form metadata key.
    #[must_use]
    pub fn with_extra(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.extra.insert(key.into(), value.into());
        self
    }

    /// Check field-level invariants.
    ///
    /// # Errors
    ///
    /// Returns [`CtxMemError::Validation`] for empty text, importance or
    /// confidence outside [0, 1], relationship strengths outside [0, 1],
    /// or an `extra` key that shadows a built-in metadata field.
    pub fn validate(&self) -> Result<()> {
        if self.content.text.trim().is_empty() {
            return Err(CtxMemError::Validation("memory text must not be empty".into()));
        }
        check_extra_keys(self.metadata.extra.keys())?;
        check_unit("importance", self.metadata.importance)?;
        check_unit("confidence", self.metadata.confidence)?;
        for rel in &self.content.relationships {
            check_unit("relationship strength", rel.strength)?;
        }
        Ok(())
    }

    /// Record one access: bump the counter and the access time.
    pub fn record_access(&mut self, now: Timestamp) {
        self.metadata.access_count = self.metadata.access_count.saturating_add(1);
        self.metadata.last_accessed = now.max(self.metadata.created);
    }

    /// Mark the record as mutated at `now`.
    pub fn touch_updated(&mut self, now: Timestamp) {
        self.metadata.updated = now.max(self.metadata.created);
    }

    /// Whether the record's TTL has elapsed at `now`.
    #[must_use]
    pub fn is_expired(&self, now: Timestamp) -> bool {
        self.ttl.is_some_and(|ttl| {
            let ttl = i64::try_from(ttl).unwrap_or(i64::MAX);
            Duration::try_seconds(ttl)
                .and_then(|d| self.metadata.created.checked_add_signed(d))
                .is_some_and(|expiry| expiry <= now)
        })
    }
}

/// Clamp to [0, 1], mapping NaN to 0.
#[must_use]
pub fn clamp_unit(value: f32) -> f32 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, 1.0)
    }
}

pub(crate) fn check_extra_keys<'a>(keys: impl IntoIterator<Item = &'a String>) -> Result<()> {
    match keys
        .into_iter()
        .find(|key| RESERVED_METADATA_KEYS.contains(&key.as_str()))
    {
        Some(key) => Err(CtxMemError::Validation(format!(
            "metadata key '{key}' is reserved"
        ))),
        None => Ok(()),
    }
}

pub(crate) fn check_unit(field: &str, value: f32) -> Result<()> {
    if (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(CtxMemError::Validation(format!(
            "{field} must be within [0, 1], got {value}"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    fn ctx() -> SessionContext {
        SessionContext::new(Some("u".into()), None)
    }

    #[test]
    fn new_record_stamps_context_with_own_id() {
        let record = MemoryRecord::new("likes tea", MemoryType::Semantic, &ctx());
        assert_eq!(record.context.memory_id, Some(record.id));
        assert_eq!(record.metadata.access_count, 0);
        assert!(record.metadata.updated >= record.metadata.created);
    }

    #[test]
    fn builders_clamp_scores() {
        let record = MemoryRecord::new("x", MemoryType::Working, &ctx())
            .with_importance(4.0)
            .with_confidence(-1.0);
        assert!((record.metadata.importance - 1.0).abs() < f32::EPSILON);
        assert!(record.metadata.confidence.abs() < f32::EPSILON);
        assert!(clamp_unit(f32::NAN).abs() < f32::EPSILON);
    }

    #[test]
    fn validate_rejects_out_of_range_fields() {
        let mut record = MemoryRecord::new("x", MemoryType::Working, &ctx());
        record.metadata.importance = 1.5;
        assert_eq!(
            record.validate().expect_err("importance").kind(),
            ErrorKind::ValidationFailure
        );

        let blank = MemoryRecord::new("   ", MemoryType::Working, &ctx());
        assert!(blank.validate().is_err());
    }

    #[test]
    fn record_access_is_monotonic() {
        let mut record = MemoryRecord::new("x", MemoryType::Episodic, &ctx());
        let before = record.metadata.created - Duration::seconds(5);
        record.record_access(before);
        assert_eq!(record.metadata.access_count, 1);
        assert_eq!(record.metadata.last_accessed, record.metadata.created);
    }

    #[test]
    fn metadata_lookup_covers_named_and_extra_keys() {
        let record = MemoryRecord::new("x", MemoryType::Semantic, &ctx())
            .with_importance(0.8)
            .with_extra("project", "atlas");
        let meta = &record.metadata;
        assert!(meta.matches("importance", &Value::from(0.8)));
        assert!(meta.matches("project", &Value::from("atlas")));
        assert!(meta.matches("storage_tier", &Value::from("main_context")));
        assert!(!meta.matches("project", &Value::from("zeus")));
        assert!(!meta.matches("missing", &Value::from(1)));
    }

    #[test]
    fn ttl_expiry_is_reported_not_enforced() {
        let record = MemoryRecord::new("x", MemoryType::Working, &ctx()).with_ttl(60);
        let created = record.metadata.created;
        assert!(!record.is_expired(created + Duration::seconds(59)));
        assert!(record.is_expired(created + Duration::seconds(60)));
    }

    #[test]
    fn validate_rejects_reserved_extra_keys() {
        for key in RESERVED_METADATA_KEYS {
            let record = MemoryRecord::new("x", MemoryType::Semantic, &ctx())
                .with_importance(0.9)
                .with_extra(key, "high");
            let err = record.validate().expect_err(key);
            assert_eq!(err.kind(), ErrorKind::ValidationFailure);
        }
        let ok = MemoryRecord::new("x", MemoryType::Semantic, &ctx()).with_extra("priority", "high");
        assert!(ok.validate().is_ok());
    }

    #[test]
    fn serde_flattens_extra_metadata() {
        let record =
            MemoryRecord::new("x", MemoryType::Semantic, &ctx()).with_extra("lang", "rust");
        let json = serde_json::to_value(&record).expect("ser");
        assert_eq!(json["metadata"]["lang"], Value::from("rust"));
        let back: MemoryRecord = serde_json::from_value(json).expect("de");
        assert_eq!(back, record);
    }
}
