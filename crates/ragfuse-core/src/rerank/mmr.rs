//! Maximal marginal relevance selection with a per-file repetition penalty.
//!
//! At each step the remaining candidate maximizing
//!
//! ```text
//! alpha * relevance - (1 - alpha) * max_sim_to_selected - penalty * picks_from_same_file
//! ```
//!
//! is selected, where `relevance` is the min-max normalized incoming score and
//! similarity is the guarded cosine of embeddings. A candidate without an
//! embedding has similarity 0 to everything and is flagged with
//! `mmr_missing_embedding`.

use serde::{Deserialize, Serialize};

use crate::candidate::{Candidate, MetaValue};
use crate::error::ConfigError;
use crate::text::{dense_cosine, min_max_normalize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MmrConfig {
    pub enabled: bool,
    /// Relevance weight; `1 - alpha` weights redundancy.
    pub alpha: f64,
    pub file_penalty: f64,
    /// Penalty used when the request tag is one of `ops_tags`.
    pub ops_file_penalty: f64,
    pub ops_tags: Vec<String>,
}

impl Default for MmrConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            alpha: 0.7,
            file_penalty: 0.10,
            ops_file_penalty: 0.12,
            ops_tags: vec!["ops".to_string(), "runbook".to_string(), "incident".to_string()],
        }
    }
}

impl MmrConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(0.0..=1.0).contains(&self.alpha) {
            return Err(ConfigError::invalid("mmr.alpha", "must be within [0, 1]"));
        }
        if !self.file_penalty.is_finite() || self.file_penalty < 0.0 {
            return Err(ConfigError::invalid("mmr.file_penalty", "must be finite and >= 0"));
        }
        if !self.ops_file_penalty.is_finite() || self.ops_file_penalty < 0.0 {
            return Err(ConfigError::invalid("mmr.ops_file_penalty", "must be finite and >= 0"));
        }
        Ok(())
    }

    /// Per-file penalty for a request tagged `tag`.
    #[must_use]
    pub fn penalty_for(&self, tag: Option<&str>) -> f64 {
        match tag {
            Some(tag) if self.ops_tags.iter().any(|t| t.eq_ignore_ascii_case(tag)) => {
                self.ops_file_penalty
            }
            _ => self.file_penalty,
        }
    }
}

#[derive(Debug, Clone)]
pub struct MmrReranker {
    config: MmrConfig,
    file_key: String,
}

impl Default for MmrReranker {
    fn default() -> Self {
        Self {
            config: MmrConfig::default(),
            file_key: "file".to_string(),
        }
    }
}

impl MmrReranker {
    pub fn new(config: MmrConfig, file_key: impl Into<String>) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            config,
            file_key: file_key.into(),
        })
    }

    pub fn config(&self) -> &MmrConfig {
        &self.config
    }

    fn file_of<'a>(&self, candidate: &'a Candidate) -> Option<&'a str> {
        candidate.metadata.get(&self.file_key).and_then(MetaValue::as_str)
    }

    /// Greedily select up to `k` candidates. Deterministic; ties go to the
    /// earlier candidate. Selected candidates keep their metadata and gain
    /// `mmr_rank`, `mmr_score`, `pre_mmr_score` and `rerank_stage`.
    ///
    /// `score` is replaced by the running minimum of the objective, so it never
    /// increases along the returned order.
    pub fn select(&self, candidates: Vec<Candidate>, k: usize, tag: Option<&str>) -> Vec<Candidate> {
        let n = candidates.len();
        let k = k.min(n);
        if k == 0 {
            return Vec::new();
        }

        let alpha = self.config.alpha;
        let penalty = self.config.penalty_for(tag);
        let scores: Vec<f64> = candidates.iter().map(|c| c.score).collect();
        let relevance = min_max_normalize(&scores);
        let files: Vec<Option<String>> = candidates
            .iter()
            .map(|c| self.file_of(c).map(str::to_string))
            .collect();

        let mut max_sim = vec![f64::NEG_INFINITY; n];
        let mut file_picks: Vec<usize> = vec![0; n];
        let mut remaining: Vec<bool> = vec![true; n];
        let mut order: Vec<(usize, f64)> = Vec::with_capacity(k);

        for _ in 0..k {
            let mut best: Option<(usize, f64)> = None;
            for i in (0..n).filter(|&i| remaining[i]) {
                let redundancy = if order.is_empty() { 0.0 } else { max_sim[i] };
                let mmr = alpha * relevance[i]
                    - (1.0 - alpha) * redundancy
                    - penalty * file_picks[i] as f64;
                if best.is_none_or(|(_, b)| mmr > b) {
                    best = Some((i, mmr));
                }
            }
            let Some((chosen, mmr)) = best else { break };
            remaining[chosen] = false;
            order.push((chosen, mmr));

            for i in (0..n).filter(|&i| remaining[i]) {
                let sim = similarity(&candidates[i], &candidates[chosen]);
                if sim > max_sim[i] {
                    max_sim[i] = sim;
                }
                if files[i].is_some() && files[i] == files[chosen] {
                    file_picks[i] += 1;
                }
            }
        }

        let mut slots: Vec<Option<Candidate>> = candidates.into_iter().map(Some).collect();
        let mut floor = f64::INFINITY;
        order
            .into_iter()
            .enumerate()
            .filter_map(|(rank, (i, mmr))| {
                let mut c = slots[i].take()?;
                // Negative similarity can lift a later pick above an earlier one.
                floor = floor.min(mmr);
                c.annotate("pre_mmr_score", c.score);
                c.score = floor;
                c.annotate("mmr_rank", rank + 1);
                c.annotate("mmr_score", mmr);
                c.annotate("rerank_stage", "mmr");
                if c.embedding.is_none() {
                    c.annotate("mmr_missing_embedding", true);
                }
                Some(c)
            })
            .collect()
    }
}

fn similarity(a: &Candidate, b: &Candidate) -> f64 {
    match (&a.embedding, &b.embedding) {
        (Some(x), Some(y)) => dense_cosine(x, y),
        _ => 0.0,
    }
}
