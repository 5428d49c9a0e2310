//! Configuration for the ctxmem memory store.
//!
//! Maps directly to `ctxmem.toml`. Every section and field has a default,
//! so an empty document yields a working two-backend in-memory store.

use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{CtxMemError, Result};
use crate::types::{MemoryType, StorageTier};

/// Top-level ctxmem configuration, loadable from TOML.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CtxMemConfig {
    /// General settings.
    #[serde(default)]
    pub general: GeneralConfig,
    /// Backends registered at startup.
    #[serde(default = "default_backends")]
    pub backends: Vec<BackendConfig>,
    /// Memory type to storage tier routing.
    #[serde(default)]
    pub routing: RoutingConfig,
    /// Retrieval scoring and pagination defaults.
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    /// Consolidation tuning.
    #[serde(default)]
    pub consolidation: ConsolidationConfig,
    /// Session and event settings.
    #[serde(default)]
    pub sessions: SessionsConfig,
}

impl Default for CtxMemConfig {
    fn default() -> Self {
        Self {
            general: GeneralConfig::default(),
            backends: default_backends(),
            routing: RoutingConfig::default(),
            retrieval: RetrievalConfig::default(),
            consolidation: ConsolidationConfig::default(),
            sessions: SessionsConfig::default(),
        }
    }
}

impl CtxMemConfig {
    /// Load configuration from a TOML string.
    ///
    /// # Errors
    /// Returns `CtxMemError::Config` if the TOML is invalid or fails
    /// [`CtxMemConfig::validate`].
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(toml_str).map_err(|e| CtxMemError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML file.
    ///
    /// # Errors
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &std::path::Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Check cross-field constraints.
    ///
    /// # Errors
    /// Returns `CtxMemError::Config` for duplicate backend names, negative
    /// or NaN thresholds and weights, or an importance boost outside [0, 1].
    pub fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for backend in &self.backends {
            if backend.name.trim().is_empty() {
                return Err(CtxMemError::Config("backend name must not be empty".into()));
            }
            if !seen.insert(backend.name.as_str()) {
                return Err(CtxMemError::Config(format!(
                    "duplicate backend name '{}'",
                    backend.name
                )));
            }
        }

        let r = &self.retrieval;
        for (field, value) in [
            ("retrieval.default_threshold", r.default_threshold),
            ("retrieval.request_threshold", r.request_threshold),
            ("retrieval.text_weight", r.text_weight),
            ("retrieval.keyword_weight", r.keyword_weight),
            ("retrieval.tag_weight", r.tag_weight),
        ] {
            if value.is_nan() || value < 0.0 {
                return Err(CtxMemError::Config(format!(
                    "{field} must be a non-negative number, got {value}"
                )));
            }
        }

        let boost = self.consolidation.importance_boost;
        if !(0.0..=1.0).contains(&boost) {
            return Err(CtxMemError::Config(format!(
                "consolidation.importance_boost must be within [0, 1], got {boost}"
            )));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Sub-configs
// ---------------------------------------------------------------------------

/// General settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Instance name, attached to lifecycle log events.
    #[serde(default = "default_instance_name")]
    pub name: String,
    /// Suggested log level for the embedding application. The library
    /// installs no subscriber.
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            name: default_instance_name(),
            log_level: default_log_level(),
        }
    }
}

/// Concrete backend implementation to build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// Process-local map.
    InMemory,
    /// SQLite file (`options.path`) or in-memory database when no path
    /// is given.
    Sqlite,
}

/// One backend registration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    /// Unique backend name.
    pub name: String,
    /// Tier this backend serves.
    pub tier: StorageTier,
    /// Write order; lower goes first.
    #[serde(default = "default_priority")]
    pub priority: u32,
    /// Implementation.
    #[serde(default = "default_backend_kind")]
    pub kind: BackendKind,
    /// Kind-specific options.
    #[serde(default)]
    pub options: BTreeMap<String, Value>,
}

impl BackendConfig {
    /// In-memory backend registration.
    #[must_use]
    pub fn in_memory(name: impl Into<String>, tier: StorageTier, priority: u32) -> Self {
        Self {
            name: name.into(),
            tier,
            priority,
            kind: BackendKind::InMemory,
            options: BTreeMap::new(),
        }
    }

    /// The `path` option, if set.
    #[must_use]
    pub fn path(&self) -> Option<PathBuf> {
        self.options
            .get("path")
            .and_then(Value::as_str)
            .map(PathBuf::from)
    }
}

/// Eligible tiers for one memory type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteRule {
    /// Tiers a record of this type may be written to.
    pub tiers: Vec<StorageTier>,
    /// Tier written first, ahead of priority order.
    #[serde(default)]
    pub preferred: Option<StorageTier>,
}

impl RouteRule {
    fn new(tiers: &[StorageTier], preferred: Option<StorageTier>) -> Self {
        Self {
            tiers: tiers.to_vec(),
            preferred,
        }
    }

    /// Whether `tier` is eligible under this rule.
    #[must_use]
    pub fn allows(&self, tier: StorageTier) -> bool {
        self.tiers.contains(&tier)
    }
}

/// Routing policy, one rule per memory type.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingConfig {
    /// Episodic memories.
    #[serde(default = "default_context_and_vectors")]
    pub episodic: RouteRule,
    /// Semantic memories.
    #[serde(default = "default_context_and_vectors")]
    pub semantic: RouteRule,
    /// Procedural memories.
    #[serde(default = "default_context_and_vectors")]
    pub procedural: RouteRule,
    /// Working memories.
    #[serde(default = "default_working_route")]
    pub working: RouteRule,
    /// Archival memories.
    #[serde(default = "default_archival_route")]
    pub archival: RouteRule,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            episodic: default_context_and_vectors(),
            semantic: default_context_and_vectors(),
            procedural: default_context_and_vectors(),
            working: default_working_route(),
            archival: default_archival_route(),
        }
    }
}

impl RoutingConfig {
    /// The rule for `memory_type`.
    #[must_use]
    pub fn rule(&self, memory_type: MemoryType) -> &RouteRule {
        match memory_type {
            MemoryType::Episodic => &self.episodic,
            MemoryType::Semantic => &self.semantic,
            MemoryType::Procedural => &self.procedural,
            MemoryType::Working => &self.working,
            MemoryType::Archival => &self.archival,
        }
    }
}

/// Retrieval settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalConfig {
    /// Threshold applied when a query carries none.
    #[serde(default = "default_0_5")]
    pub default_threshold: f64,
    /// Threshold the protocol layer fills in when a request omits one.
    #[serde(default = "default_0_7")]
    pub request_threshold: f64,
    /// Page size when the caller gives none.
    #[serde(default = "default_limit")]
    pub default_limit: usize,
    /// Added when the query is a substring of the text.
    #[serde(default = "default_0_8")]
    pub text_weight: f64,
    /// Added per matching keyword.
    #[serde(default = "default_0_6")]
    pub keyword_weight: f64,
    /// Added per matching tag.
    #[serde(default = "default_0_7")]
    pub tag_weight: f64,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            default_threshold: 0.5,
            request_threshold: 0.7,
            default_limit: 10,
            text_weight: 0.8,
            keyword_weight: 0.6,
            tag_weight: 0.7,
        }
    }
}

/// Consolidation settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsolidationConfig {
    /// Importance added to the kept record per folded duplicate.
    #[serde(default = "default_0_1")]
    pub importance_boost: f32,
    /// Suggested interval for an external scheduler, in seconds.
    #[serde(default = "default_3600")]
    pub interval_secs: u64,
    /// Only records at least this old are consolidated by a scheduled pass.
    #[serde(default)]
    pub min_age_secs: u64,
}

impl Default for ConsolidationConfig {
    fn default() -> Self {
        Self {
            importance_boost: 0.1,
            interval_secs: 3600,
            min_age_secs: 0,
        }
    }
}

/// Session settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionsConfig {
    /// Events buffered per subscriber before it lags.
    #[serde(default = "default_channel_capacity")]
    pub event_channel_capacity: usize,
}

impl Default for SessionsConfig {
    fn default() -> Self {
        Self {
            event_channel_capacity: 256,
        }
    }
}

// ---------------------------------------------------------------------------
// Serde default helpers
// ---------------------------------------------------------------------------

fn default_backends() -> Vec<BackendConfig> {
    vec![
        BackendConfig::in_memory("main", StorageTier::MainContext, 0),
        BackendConfig::in_memory("vectors", StorageTier::VectorStore, 10),
    ]
}
fn default_context_and_vectors() -> RouteRule {
    RouteRule::new(&[StorageTier::MainContext, StorageTier::VectorStore], None)
}
fn default_working_route() -> RouteRule { RouteRule::new(&[StorageTier::MainContext], None) }
fn default_archival_route() -> RouteRule {
    RouteRule::new(&StorageTier::ALL, Some(StorageTier::ExternalContext))
}
fn default_instance_name() -> String { "ctxmem".to_string() }
fn default_log_level() -> String { "info".to_string() }
fn default_backend_kind() -> BackendKind { BackendKind::InMemory }
fn default_priority() -> u32 { 100 }
fn default_limit() -> usize { 10 }
fn default_channel_capacity() -> usize { 256 }
fn default_3600() -> u64 { 3600 }
fn default_0_1() -> f32 { 0.1 }
fn default_0_5() -> f64 { 0.5 }
fn default_0_6() -> f64 { 0.6 }
fn default_0_7() -> f64 { 0.7 }
fn default_0_8() -> f64 { 0.8 }
