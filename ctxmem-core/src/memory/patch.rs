//! Partial records: store-time overrides and update patches.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Result;
use crate::memory::record::{
    MemoryContent, MemoryRecord, Relationship, check_extra_keys, check_unit,
};
use crate::session::SessionContext;
use crate::types::{StorageTier, Timestamp};

/// Key-by-key metadata changes. `None` leaves a field as is.
///
/// `access_count`, the timestamps, and the storage tier are owned by the
/// store and cannot be patched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetadataPatch {
    /// New source label.
    #[serde(default)]
    pub source: Option<String>,
    /// New confidence (0.0 to 1.0).
    #[serde(default)]
    pub confidence: Option<f32>,
    /// New importance (0.0 to 1.0).
    #[serde(default)]
    pub importance: Option<f32>,
    /// Free-form keys to merge. A `null` value removes the key.
    #[serde(default)]
    pub extra: BTreeMap<String, Value>,
}

/// Changes applied by an update call.
///
/// Content and context are replaced wholesale; metadata merges key by key.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MemoryPatch {
    /// Replacement content.
    #[serde(default)]
    pub content: Option<MemoryContent>,
    /// Metadata changes.
    #[serde(default)]
    pub metadata: Option<MetadataPatch>,
    /// Replacement context. The record id stamp is preserved.
    #[serde(default)]
    pub context: Option<SessionContext>,
    /// New time-to-live in seconds.
    #[serde(default)]
    pub ttl: Option<u64>,
    /// Drop the time-to-live. Wins over `ttl`.
    #[serde(default)]
    pub clear_ttl: bool,
}

impl MemoryPatch {
    /// Patch that only changes metadata.
    #[must_use]
    pub fn metadata(metadata: MetadataPatch) -> Self {
        Self {
            metadata: Some(metadata),
            ..Self::default()
        }
    }

    /// Check the patch's own fields.
    ///
    /// # Errors
    ///
    /// Returns [`crate::CtxMemError::Validation`] for scores outside [0, 1]
    /// or `extra` keys that name a built-in metadata field.
    pub fn validate(&self) -> Result<()> {
        if let Some(meta) = &self.metadata {
            check_extra_keys(meta.extra.keys())?;
            if let Some(importance) = meta.importance {
                check_unit("importance", importance)?;
            }
            if let Some(confidence) = meta.confidence {
                check_unit("confidence", confidence)?;
            }
        }
        Ok(())
    }

    /// Apply the patch to `record` at time `now`.
    ///
    /// # Errors
    ///
    /// Returns [`crate::CtxMemError::Validation`] if the patch or the
    /// resulting record is invalid; `record` is left untouched in that case.
    pub fn apply(&self, record: &mut MemoryRecord, now: Timestamp) -> Result<()> {
        self.validate()?;
        let mut next = record.clone();

        if let Some(content) = &self.content {
            next.content = content.clone();
        }
        if let Some(context) = &self.context {
            next.context = context.for_memory(next.id);
        }
        if let Some(meta) = &self.metadata {
            if let Some(source) = &meta.source {
                next.metadata.source.clone_from(source);
            }
            if let Some(confidence) = meta.confidence {
                next.metadata.confidence = confidence;
            }
            if let Some(importance) = meta.importance {
                next.metadata.importance = importance;
            }
            for (key, value) in &meta.extra {
                if value.is_null() {
                    next.metadata.extra.remove(key);
                } else {
                    next.metadata.extra.insert(key.clone(), value.clone());
                }
            }
        }
        if self.clear_ttl {
            next.ttl = None;
        } else if let Some(ttl) = self.ttl {
            next.ttl = Some(ttl);
        }

        next.validate()?;
        next.touch_updated(now);
        *record = next;
        Ok(())
    }
}

/// Caller overrides applied when a memory is first stored.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StoreOptions {
    /// Source label.
    #[serde(default)]
    pub source: Option<String>,
    /// Confidence (0.0 to 1.0).
    #[serde(default)]
    pub confidence: Option<f32>,
    /// Importance (0.0 to 1.0).
    #[serde(default)]
    pub importance: Option<f32>,
    /// Restrict the write to eligible backends of this tier.
    #[serde(default)]
    pub storage_tier: Option<StorageTier>,
    /// Keywords.
    #[serde(default)]
    pub keywords: Vec<String>,
    /// Tags.
    #[serde(default)]
    pub tags: BTreeSet<String>,
    /// Externally computed embedding.
    #[serde(default)]
    pub embedding: Option<Vec<f32>>,
    /// Edges to other memories.
    #[serde(default)]
    pub relationships: Vec<Relationship>,
    /// Time-to-live in seconds.
    #[serde(default)]
    pub ttl: Option<u64>,
    /// Free-form metadata keys.
    #[serde(default)]
    pub extra: BTreeMap<String, Value>,
}

impl StoreOptions {
    /// Apply the overrides to a freshly built record.
    ///
    /// Scores are taken as given; [`MemoryRecord::validate`] rejects
    /// out-of-range values afterwards.
    pub fn apply_to(self, record: &mut MemoryRecord) {
        if let Some(source) = self.source {
            record.metadata.source = source;
        }
        if let Some(confidence) = self.confidence {
            record.metadata.confidence = confidence;
        }
        if let Some(importance) = self.importance {
            record.metadata.importance = importance;
        }
        if let Some(tier) = self.storage_tier {
            record.metadata.storage_tier = tier;
        }
        record.content.keywords.extend(self.keywords);
        record.content.tags.extend(self.tags);
        if self.embedding.is_some() {
            record.content.embedding = self.embedding;
        }
        record.content.relationships.extend(self.relationships);
        if self.ttl.is_some() {
            record.ttl = self.ttl;
        }
        record.metadata.extra.extend(self.extra);
    }
}
