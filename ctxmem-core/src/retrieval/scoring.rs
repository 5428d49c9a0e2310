//! Relevance scoring for retrieval.
//!
//! Score = w_text · [query ⊂ text] + w_kw · |matching keywords| + w_tag · |matching tags|
//!
//! A keyword or tag matches when it contains the query, or when the query
//! contains the (non-empty) keyword or tag. Everything is compared
//! lower-cased. The score has no upper bound.

use std::fmt;

use crate::config::RetrievalConfig;
use crate::memory::MemoryRecord;

/// Scores one record against a query string.
///
/// Implementations must be `Send + Sync`; the engine shares one scorer
/// across every backend. An embedding-based scorer slots in here.
pub trait RelevanceScorer: Send + Sync + fmt::Debug {
    /// Relevance of `record` to `query`. Higher is better; must not be NaN.
    fn score(&self, query: &str, record: &MemoryRecord) -> f64;

    /// Scorer name for logs.
    fn name(&self) -> &str;
}

/// Keyword/tag/substring scorer.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LexicalScorer {
    /// Added when the query is a substring of the text.
    pub text_weight: f64,
    /// Added per matching keyword.
    pub keyword_weight: f64,
    /// Added per matching tag.
    pub tag_weight: f64,
}

impl LexicalScorer {
    /// Scorer with weights taken from retrieval config.
    #[must_use]
    pub fn from_config(config: &RetrievalConfig) -> Self {
        Self {
            text_weight: config.text_weight,
            keyword_weight: config.keyword_weight,
            tag_weight: config.tag_weight,
        }
    }
}

impl Default for LexicalScorer {
    fn default() -> Self {
        Self::from_config(&RetrievalConfig::default())
    }
}

impl RelevanceScorer for LexicalScorer {
    fn score(&self, query: &str, record: &MemoryRecord) -> f64 {
        let query = query.to_lowercase();
        let mut score = 0.0;

        if record.content.text.to_lowercase().contains(&query) {
            score += self.text_weight;
        }
        let keyword_hits = record
            .content
            .keywords
            .iter()
            .filter(|k| term_matches(&query, k))
            .count();
        let tag_hits = record
            .content
            .tags
            .iter()
            .filter(|t| term_matches(&query, t))
            .count();

        score += self.keyword_weight * hits(keyword_hits);
        score += self.tag_weight * hits(tag_hits);
        score
    }

    fn name(&self) -> &str {
        "lexical"
    }
}

#[allow(clippy::cast_precision_loss)]
fn hits(count: usize) -> f64 {
    count as f64
}

/// `query` is already lower-cased.
fn term_matches(query: &str, term: &str) -> bool {
    let term = term.to_lowercase();
    term.contains(query) || (!term.is_empty() && query.contains(term.as_str()))
}
