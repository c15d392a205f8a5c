//! Recall-preserving prefilter applied to each raw list before fusion.
//!
//! Each list is filtered independently: score floor, document length bounds,
//! then an optional TF-IDF diversity pass. Filtering never reorders a list and
//! never invents ids.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::candidate::{DocumentLookup, RankInput};
use crate::error::ConfigError;
use crate::text::tfidf_vectors;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PrefilterConfig {
    pub enabled: bool,
    /// Lexical score floor. Ignored for id-only inputs.
    pub min_bm25_score: f64,
    /// Vector score floor; cosine ≥ 0.7 is usually relevant, so this stays low.
    pub min_vector_score: f64,
    /// Minimum document length in characters.
    pub min_doc_length: usize,
    /// Maximum document length in characters.
    pub max_doc_length: usize,
    pub enable_diversity: bool,
    pub diversity_threshold: f64,
}

impl Default for PrefilterConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            min_bm25_score: 0.1,
            min_vector_score: 0.3,
            min_doc_length: 20,
            max_doc_length: 50_000,
            enable_diversity: true,
            diversity_threshold: 0.9,
        }
    }
}

impl PrefilterConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.min_bm25_score.is_finite() {
            return Err(ConfigError::invalid("prefilter.min_bm25_score", "must be finite"));
        }
        if !self.min_vector_score.is_finite() {
            return Err(ConfigError::invalid("prefilter.min_vector_score", "must be finite"));
        }
        if self.min_doc_length > self.max_doc_length {
            return Err(ConfigError::invalid(
                "prefilter.min_doc_length",
                "must be <= prefilter.max_doc_length",
            ));
        }
        if !(0.0..=1.0).contains(&self.diversity_threshold) {
            return Err(ConfigError::invalid(
                "prefilter.diversity_threshold",
                "must be within [0, 1]",
            ));
        }
        Ok(())
    }
}

/// Counts and retention rates of a prefilter pass.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FilterStats {
    pub bm25_original: usize,
    pub bm25_filtered: usize,
    pub vector_original: usize,
    pub vector_filtered: usize,
    pub bm25_retention: f64,
    pub vector_retention: f64,
    pub dropped_by_score: usize,
    pub dropped_by_length: usize,
    pub dropped_by_diversity: usize,
}

#[derive(Debug, Clone, Copy, Default)]
struct Drops {
    score: usize,
    length: usize,
    diversity: usize,
}

/// Which floor applies to a list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListKind {
    Lexical,
    Vector,
}

#[derive(Debug, Clone, Default)]
pub struct Prefilter {
    config: PrefilterConfig,
}

impl Prefilter {
    pub fn new(config: PrefilterConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &PrefilterConfig {
        &self.config
    }

    /// Filter both raw lists.
    pub fn prefilter_all(
        &self,
        bm25: &RankInput,
        vector: &RankInput,
        docs: &dyn DocumentLookup,
    ) -> (RankInput, RankInput) {
        let (b, v, _) = self.prefilter_all_with_stats(bm25, vector, docs);
        (b, v)
    }

    pub fn prefilter_all_with_stats(
        &self,
        bm25: &RankInput,
        vector: &RankInput,
        docs: &dyn DocumentLookup,
    ) -> (RankInput, RankInput, FilterStats) {
        if !self.config.enabled {
            let stats = Self::get_filter_stats(bm25, vector, bm25, vector);
            return (bm25.clone(), vector.clone(), stats);
        }

        let (filtered_bm25, lex_drops) = self.filter_list(bm25, ListKind::Lexical, docs);
        let (filtered_vector, vec_drops) = self.filter_list(vector, ListKind::Vector, docs);

        let mut stats = Self::get_filter_stats(bm25, vector, &filtered_bm25, &filtered_vector);
        stats.dropped_by_score = lex_drops.score + vec_drops.score;
        stats.dropped_by_length = lex_drops.length + vec_drops.length;
        stats.dropped_by_diversity = lex_drops.diversity + vec_drops.diversity;

        debug!(
            stage = "prefilter",
            bm25_in = stats.bm25_original,
            bm25_out = stats.bm25_filtered,
            vector_in = stats.vector_original,
            vector_out = stats.vector_filtered,
            dropped_by_score = stats.dropped_by_score,
            dropped_by_length = stats.dropped_by_length,
            dropped_by_diversity = stats.dropped_by_diversity,
            "Prefilter complete"
        );

        (filtered_bm25, filtered_vector, stats)
    }

    /// Original/filtered counts and retention rates. An empty original list
    /// has retention 1.0.
    #[must_use]
    pub fn get_filter_stats(
        original_bm25: &RankInput,
        original_vector: &RankInput,
        filtered_bm25: &RankInput,
        filtered_vector: &RankInput,
    ) -> FilterStats {
        let rate = |orig: usize, kept: usize| {
            if orig == 0 { 1.0 } else { kept as f64 / orig as f64 }
        };
        FilterStats {
            bm25_original: original_bm25.len(),
            bm25_filtered: filtered_bm25.len(),
            vector_original: original_vector.len(),
            vector_filtered: filtered_vector.len(),
            bm25_retention: rate(original_bm25.len(), filtered_bm25.len()),
            vector_retention: rate(original_vector.len(), filtered_vector.len()),
            ..FilterStats::default()
        }
    }

    /// Filter a single list.
    pub fn filter(&self, list: &RankInput, kind: ListKind, docs: &dyn DocumentLookup) -> RankInput {
        self.filter_list(list, kind, docs).0
    }

    fn filter_list(&self, list: &RankInput, kind: ListKind, docs: &dyn DocumentLookup) -> (RankInput, Drops) {
        let floor = match kind {
            ListKind::Lexical => self.config.min_bm25_score,
            ListKind::Vector => self.config.min_vector_score,
        };
        let apply_floor = list.is_scored();
        let mut drops = Drops::default();

        // Best first, so the diversity pass keeps the higher scoring of a pair.
        let mut survivors: Vec<(String, String)> = Vec::new();
        for pair in list.to_ranked() {
            if apply_floor && pair.score < floor {
                drops.score += 1;
                continue;
            }
            let text = docs.text(&pair.id).map(|t| t.into_owned()).unwrap_or_default();
            let len = text.chars().count();
            if len < self.config.min_doc_length || len > self.config.max_doc_length {
                drops.length += 1;
                continue;
            }
            survivors.push((pair.id, text));
        }

        if self.config.enable_diversity && survivors.len() > 1 {
            let before = survivors.len();
            survivors = self.diversify(survivors);
            drops.diversity = before - survivors.len();
        }

        let keep: HashSet<String> = survivors.into_iter().map(|(id, _)| id).collect();
        (list.retain_ids(&keep), drops)
    }

    /// Greedy pass over best-first survivors dropping anything too similar to
    /// an already kept document. Vectorizer failure keeps everything.
    fn diversify(&self, survivors: Vec<(String, String)>) -> Vec<(String, String)> {
        let texts: Vec<&str> = survivors.iter().map(|(_, t)| t.as_str()).collect();
        let vectors = match tfidf_vectors(&texts) {
            Ok(v) => v,
            Err(err) => {
                warn!(error = %err, stage = "prefilter", "Diversity filter skipped");
                return survivors;
            }
        };

        let mut kept: Vec<usize> = Vec::with_capacity(survivors.len());
        for i in 0..vectors.len() {
            let redundant = kept
                .iter()
                .any(|&j| vectors[i].cosine(&vectors[j]) > self.config.diversity_threshold);
            if !redundant {
                kept.push(i);
            }
        }

        let keep: HashSet<usize> = kept.into_iter().collect();
        survivors
            .into_iter()
            .enumerate()
            .filter_map(|(i, s)| keep.contains(&i).then_some(s))
            .collect()
    }
}
