//! Relevance ranking of knowledge entries against a text or signature query
//!
//! Five factors feed a weighted score in `[0, 1]`: tag overlap, lexical
//! overlap, recency, popularity and local origin. Ties are broken in that
//! same order and finally by id, so a fixed pool and query always rank the
//! same way.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BTreeSet, HashSet};

use super::signature::ErrorSignature;
use super::text::{is_technology, jaccard, token_set, tokenize};
use crate::types::KnowledgeEntry;

/// Relative weight of each scoring factor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatcherWeights {
    #[serde(default = "default_tag_weight")]
    pub tag: f64,
    #[serde(default = "default_lexical_weight")]
    pub lexical: f64,
    #[serde(default = "default_recency_weight")]
    pub recency: f64,
    #[serde(default = "default_popularity_weight")]
    pub popularity: f64,
    #[serde(default = "default_local_weight")]
    pub local: f64,
}

fn default_tag_weight() -> f64 { 0.40 }
fn default_lexical_weight() -> f64 { 0.35 }
fn default_recency_weight() -> f64 { 0.12 }
fn default_popularity_weight() -> f64 { 0.08 }
fn default_local_weight() -> f64 { 0.05 }

impl Default for MatcherWeights {
    fn default() -> Self {
        Self {
            tag: default_tag_weight(),
            lexical: default_lexical_weight(),
            recency: default_recency_weight(),
            popularity: default_popularity_weight(),
            local: default_local_weight(),
        }
    }
}

impl MatcherWeights {
    fn total(&self) -> f64 {
        self.tag + self.lexical + self.recency + self.popularity + self.local
    }
}

/// Matcher configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatcherConfig {
    #[serde(default)]
    pub weights: MatcherWeights,
    /// Age at which the recency factor halves
    #[serde(default = "default_half_life")]
    pub recency_half_life_days: f64,
    /// Results scoring below this are dropped
    #[serde(default)]
    pub min_score: f64,
    /// Results returned by tools when no limit is given
    #[serde(default = "default_limit")]
    pub default_limit: usize,
}

fn default_half_life() -> f64 { 30.0 }
fn default_limit() -> usize { 5 }

impl Default for MatcherConfig {
    fn default() -> Self {
        Self {
            weights: MatcherWeights::default(),
            recency_half_life_days: default_half_life(),
            min_score: 0.0,
            default_limit: default_limit(),
        }
    }
}

/// What to rank against
#[derive(Debug, Clone)]
pub enum Query {
    Text(String),
    Signature(ErrorSignature),
}

impl From<&str> for Query {
    fn from(text: &str) -> Self {
        Query::Text(text.to_string())
    }
}

impl From<String> for Query {
    fn from(text: String) -> Self {
        Query::Text(text)
    }
}

impl From<ErrorSignature> for Query {
    fn from(signature: ErrorSignature) -> Self {
        Query::Signature(signature)
    }
}

/// Per-factor scores, each in `[0, 1]`
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct ScoreFactors {
    pub tag: f64,
    pub lexical: f64,
    pub recency: f64,
    pub popularity: f64,
    pub local: f64,
}

/// A ranked entry
#[derive(Debug, Clone, Serialize)]
pub struct Match {
    pub entry: KnowledgeEntry,
    pub score: f64,
    pub factors: ScoreFactors,
}

/// Scores and orders entries
#[derive(Debug, Clone, Default)]
pub struct RelevanceMatcher {
    config: MatcherConfig,
}

struct PreparedQuery {
    tokens: BTreeSet<String>,
    tags: BTreeSet<String>,
}

impl RelevanceMatcher {
    pub fn new(config: MatcherConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &MatcherConfig {
        &self.config
    }

    /// Rank `pool` against `query` as of now
    pub fn rank(&self, query: &Query, pool: &[KnowledgeEntry]) -> Vec<Match> {
        self.rank_at(query, pool, Utc::now())
    }

    /// Rank with a fixed clock. Never mutates the pool.
    pub fn rank_at(&self, query: &Query, pool: &[KnowledgeEntry], now: DateTime<Utc>) -> Vec<Match> {
        let superseded: HashSet<&str> = pool.iter()
            .filter_map(|e| e.supersedes.as_deref())
            .collect();
        let candidates: Vec<&KnowledgeEntry> = pool.iter()
            .filter(|e| e.is_visible() && !superseded.contains(e.id.as_str()))
            .collect();

        let tag_vocabulary: BTreeSet<&str> = candidates.iter()
            .flat_map(|e| e.tags.iter().map(String::as_str))
            .collect();
        let prepared = prepare(query, &tag_vocabulary);
        let open_query = prepared.tokens.is_empty() && prepared.tags.is_empty();

        let mut matches: Vec<Match> = candidates.into_iter()
            .filter_map(|entry| {
                let factors = self.factors(&prepared, entry, now);
                if !open_query && factors.tag == 0.0 && factors.lexical == 0.0 {
                    return None;
                }
                let score = self.combine(&factors);
                (score >= self.config.min_score).then(|| Match {
                    entry: entry.clone(),
                    score,
                    factors,
                })
            })
            .collect();

        matches.sort_by(compare_matches);
        matches
    }

    fn factors(&self, query: &PreparedQuery, entry: &KnowledgeEntry, now: DateTime<Utc>) -> ScoreFactors {
        let tag = jaccard(&query.tags, &entry.tags);

        let lexical = if query.tokens.is_empty() {
            0.0
        } else {
            let document = token_set(&format!("{} {}", entry.title, entry.content));
            query.tokens.intersection(&document).count() as f64 / query.tokens.len() as f64
        };

        let age_days = (now - entry.updated_at).num_seconds().max(0) as f64 / 86_400.0;
        let half_life = self.config.recency_half_life_days.max(f64::EPSILON);
        let recency = 0.5f64.powf(age_days / half_life);

        let uses = (entry.usage_count as f64).ln_1p();
        let popularity = uses / (1.0 + uses);

        let local = if entry.origin.is_local() { 1.0 } else { 0.0 };

        ScoreFactors { tag, lexical, recency, popularity, local }
    }

    fn combine(&self, f: &ScoreFactors) -> f64 {
        let defaults = MatcherWeights::default();
        let w = if self.config.weights.total() > 0.0 { &self.config.weights } else { &defaults };
        let raw = w.tag * f.tag
            + w.lexical * f.lexical
            + w.recency * f.recency
            + w.popularity * f.popularity
            + w.local * f.local;
        (raw / w.total()).clamp(0.0, 1.0)
    }
}

fn prepare(query: &Query, tag_vocabulary: &BTreeSet<&str>) -> PreparedQuery {
    let (tokens, mut tags) = match query {
        Query::Text(text) => (tokenize(text), BTreeSet::new()),
        Query::Signature(signature) => (signature.query_tokens(), signature.query_tags()),
    };
    for token in &tokens {
        if is_technology(token) || tag_vocabulary.contains(token.as_str()) {
            tags.insert(token.clone());
        }
    }
    PreparedQuery {
        tokens: tokens.into_iter().collect(),
        tags,
    }
}

/// Descending score, then each factor in precedence order, then id ascending
fn compare_matches(a: &Match, b: &Match) -> Ordering {
    b.score.total_cmp(&a.score)
        .then_with(|| b.factors.tag.total_cmp(&a.factors.tag))
        .then_with(|| b.factors.lexical.total_cmp(&a.factors.lexical))
        .then_with(|| b.factors.recency.total_cmp(&a.factors.recency))
        .then_with(|| b.factors.popularity.total_cmp(&a.factors.popularity))
        .then_with(|| b.factors.local.total_cmp(&a.factors.local))
        .then_with(|| a.entry.id.cmp(&b.entry.id))
}
