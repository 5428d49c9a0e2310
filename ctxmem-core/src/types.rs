//! Core type definitions for the ctxmem memory store.
//!
//! Identifiers, the memory-type and storage-tier taxonomies, and the
//! ordered score wrapper used by retrieval.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use ordered_float::OrderedFloat;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::CtxMemError;

// ---------------------------------------------------------------------------
// Identity Types
// ---------------------------------------------------------------------------

/// Unique identifier for a memory record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MemoryId(pub Uuid);

impl MemoryId {
    /// Create a new random memory ID.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for MemoryId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for MemoryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for MemoryId {
    type Err = CtxMemError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|e| CtxMemError::Validation(format!("invalid memory id '{s}': {e}")))
    }
}

/// Unique identifier for a caller session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(pub Uuid);

impl SessionId {
    /// Create a new random session ID.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Taxonomies
// ---------------------------------------------------------------------------

/// Semantic category of a memory. Fixed at creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryType {
    /// Something that happened.
    Episodic,
    /// A fact or preference.
    Semantic,
    /// How to do something.
    Procedural,
    /// Scratch state for the current task.
    Working,
    /// Long-term cold storage.
    Archival,
}

impl MemoryType {
    /// Every memory type, in declaration order.
    pub const ALL: [Self; 5] = [
        Self::Episodic,
        Self::Semantic,
        Self::Procedural,
        Self::Working,
        Self::Archival,
    ];

    /// The snake-case name of this type.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Episodic => "episodic",
            Self::Semantic => "semantic",
            Self::Procedural => "procedural",
            Self::Working => "working",
            Self::Archival => "archival",
        }
    }
}

impl fmt::Display for MemoryType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MemoryType {
    type Err = CtxMemError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| CtxMemError::Validation(format!("unknown memory type '{s}'")))
    }
}

/// Locality class served by a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageTier {
    /// Hot, in-process context.
    MainContext,
    /// Durable storage outside the process context.
    ExternalContext,
    /// Embedding-indexed storage.
    VectorStore,
    /// Relationship-indexed storage.
    GraphStore,
    /// Time-indexed storage.
    TemporalStore,
}

impl StorageTier {
    /// Every storage tier, in declaration order.
    pub const ALL: [Self; 5] = [
        Self::MainContext,
        Self::ExternalContext,
        Self::VectorStore,
        Self::GraphStore,
        Self::TemporalStore,
    ];

    /// The snake-case name of this tier.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::MainContext => "main_context",
            Self::ExternalContext => "external_context",
            Self::VectorStore => "vector_store",
            Self::GraphStore => "graph_store",
            Self::TemporalStore => "temporal_store",
        }
    }
}

impl fmt::Display for StorageTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StorageTier {
    type Err = CtxMemError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| CtxMemError::Validation(format!("unknown storage tier '{s}'")))
    }
}

// ---------------------------------------------------------------------------
// Time
// ---------------------------------------------------------------------------

/// Wall-clock timestamp used throughout the store.
pub type Timestamp = DateTime<Utc>;

/// Inclusive time window. Either bound may be open.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TimeRange {
    /// Earliest accepted timestamp.
    #[serde(default)]
    pub start: Option<Timestamp>,
    /// Latest accepted timestamp.
    #[serde(default)]
    pub end: Option<Timestamp>,
}

impl TimeRange {
    /// Whether `t` falls inside the window, bounds included.
    #[must_use]
    pub fn contains(&self, t: &Timestamp) -> bool {
        self.start.is_none_or(|start| *t >= start) && self.end.is_none_or(|end| *t <= end)
    }
}

// ---------------------------------------------------------------------------
// Retrieval Score
// ---------------------------------------------------------------------------

/// Relevance score with a total order, used to rank retrieval candidates.
///
/// Lexical scores are unbounded above; only their relative order matters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RetrievalScore(pub OrderedFloat<f64>);

impl RetrievalScore {
    /// Create a retrieval score from a raw f64.
    #[must_use]
    pub fn new(score: f64) -> Self {
        Self(OrderedFloat(score))
    }

    /// Get the raw score value.
    #[must_use]
    pub fn value(self) -> f64 {
        self.0.into_inner()
    }
}
