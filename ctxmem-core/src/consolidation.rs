//! Memory Consolidation: fold duplicate facts into one record.
//!
//! Records are grouped by a content fingerprint: a blake3 hash of the text
//! after lower-casing, collapsing whitespace, and trimming. Within each
//! group the first record (in input order) survives. Every later duplicate
//! raises the survivor's importance by a fixed boost (capped at 1.0) and
//! hands over its access count, then disappears.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::memory::{MemoryRecord, clamp_unit};
use crate::types::{MemoryId, Timestamp};

/// Importance added per folded duplicate when none is configured.
pub const DEFAULT_IMPORTANCE_BOOST: f32 = 0.1;

/// 256-bit content fingerprint.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Fingerprint([u8; 32]);

impl Fingerprint {
    /// Fingerprint of `text` after normalization.
    #[must_use]
    pub fn of(text: &str) -> Self {
        Self(*blake3::hash(normalize(text).as_bytes()).as_bytes())
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint({self})")
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0[..8] {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

/// Lower-case, collapse runs of whitespace to one space, trim.
#[must_use]
pub fn normalize(text: &str) -> String {
    text.split_whitespace()
        .map(str::to_lowercase)
        .collect::<Vec<_>>()
        .join(" ")
}

/// Result of one consolidation pass.
#[derive(Debug, Clone, Default)]
pub struct ConsolidationOutcome {
    /// Surviving records, in input order of first appearance.
    pub kept: Vec<MemoryRecord>,
    /// `(folded, survivor)` pairs in the order folds happened.
    pub folded: Vec<(MemoryId, MemoryId)>,
}

impl ConsolidationOutcome {
    /// Ids that no longer exist after the pass.
    pub fn folded_ids(&self) -> impl Iterator<Item = MemoryId> + '_ {
        self.folded.iter().map(|(folded, _)| *folded)
    }
}

/// Summary of a consolidation pass over one backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsolidationReport {
    /// Backend that was consolidated.
    pub backend: String,
    /// Records eligible for the pass.
    pub examined: usize,
    /// Records remaining from the eligible set.
    pub kept: usize,
    /// `(folded, survivor)` pairs.
    pub folded: Vec<(MemoryId, MemoryId)>,
}

/// Deduplicates and merges records.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ConsolidationEngine {
    importance_boost: f32,
}

impl ConsolidationEngine {
    /// Engine with the given per-fold importance boost, clamped to [0, 1].
    #[must_use]
    pub fn new(importance_boost: f32) -> Self {
        Self {
            importance_boost: clamp_unit(importance_boost),
        }
    }

    /// Fold duplicates in `records`, stamping survivors as updated at `now`.
    #[must_use]
    pub fn consolidate(&self, records: Vec<MemoryRecord>, now: Timestamp) -> ConsolidationOutcome {
        let mut outcome = ConsolidationOutcome::default();
        let mut survivors: HashMap<Fingerprint, usize> = HashMap::new();

        for record in records {
            let fingerprint = Fingerprint::of(&record.content.text);
            if let Some(&index) = survivors.get(&fingerprint) {
                let survivor = &mut outcome.kept[index];
                self.fold_into(survivor, &record, now);
                tracing::debug!(
                    %fingerprint,
                    folded = %record.id,
                    survivor = %survivor.id,
                    "Folded duplicate memory"
                );
                outcome.folded.push((record.id, survivor.id));
            } else {
                survivors.insert(fingerprint, outcome.kept.len());
                outcome.kept.push(record);
            }
        }
        outcome
    }

    /// Merge one duplicate into `survivor`: boost importance, add the
    /// duplicate's access count, stamp `updated`.
    pub fn fold_into(&self, survivor: &mut MemoryRecord, folded: &MemoryRecord, now: Timestamp) {
        let meta = &mut survivor.metadata;
        meta.importance = clamp_unit(meta.importance + self.importance_boost);
        meta.access_count = meta.access_count.saturating_add(folded.metadata.access_count);
        survivor.touch_updated(now);
    }
}

impl Default for ConsolidationEngine {
    fn default() -> Self {
        Self::new(DEFAULT_IMPORTANCE_BOOST)
    }
}
