//! Weighted Reciprocal Rank Fusion of the lexical and semantic rank lists.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::candidate::{RankInput, RankedPair};
use crate::error::ConfigError;

/// Fusion weights. `lambda_lex` and `lambda_sem` are renormalized to sum to 1
/// at use time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FusionWeights {
    /// RRF smoothing constant; larger k flattens rank differences.
    pub k: u32,
    pub lambda_lex: f64,
    pub lambda_sem: f64,
}

impl Default for FusionWeights {
    fn default() -> Self {
        Self {
            k: 60,
            lambda_lex: 0.6,
            lambda_sem: 0.4,
        }
    }
}

impl FusionWeights {
    /// Create validated weights.
    pub fn new(k: u32, lambda_lex: f64, lambda_sem: f64) -> Result<Self, ConfigError> {
        let weights = Self {
            k,
            lambda_lex,
            lambda_sem,
        };
        weights.validate()?;
        Ok(weights)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.lambda_lex.is_finite() || self.lambda_lex < 0.0 {
            return Err(ConfigError::invalid(
                "fusion.lambda_lex",
                "must be finite and >= 0",
            ));
        }
        if !self.lambda_sem.is_finite() || self.lambda_sem < 0.0 {
            return Err(ConfigError::invalid(
                "fusion.lambda_sem",
                "must be finite and >= 0",
            ));
        }
        if self.lambda_lex + self.lambda_sem <= 0.0 {
            return Err(ConfigError::invalid(
                "fusion.lambda_lex + fusion.lambda_sem",
                "must be > 0",
            ));
        }
        Ok(())
    }

    /// `(lambda_lex, lambda_sem)` scaled to sum to 1.
    #[must_use]
    pub fn normalized(&self) -> (f64, f64) {
        let sum = self.lambda_lex + self.lambda_sem;
        if sum <= 0.0 || !sum.is_finite() {
            return (0.5, 0.5);
        }
        if (sum - 1.0).abs() <= f64::EPSILON {
            return (self.lambda_lex, self.lambda_sem);
        }
        (self.lambda_lex / sum, self.lambda_sem / sum)
    }
}

/// A fused result with its per-list ranks (1-indexed) for provenance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FusedResult {
    pub id: String,
    pub score: f64,
    pub lexical_rank: Option<usize>,
    pub semantic_rank: Option<usize>,
}

impl From<FusedResult> for RankedPair {
    fn from(r: FusedResult) -> Self {
        Self::new(r.id, r.score)
    }
}

/// Weighted RRF engine. Pure and deterministic.
#[derive(Debug, Clone, Default)]
pub struct FusionEngine {
    weights: FusionWeights,
}

impl FusionEngine {
    pub fn new(weights: FusionWeights) -> Result<Self, ConfigError> {
        weights.validate()?;
        Ok(Self { weights })
    }

    pub fn weights(&self) -> &FusionWeights {
        &self.weights
    }

    /// Fuse two rank lists into `(id, score)` pairs sorted by fused score.
    pub fn fuse(&self, lexical: &RankInput, semantic: &RankInput, limit: Option<usize>) -> Vec<RankedPair> {
        self.fuse_detailed(lexical, semantic, limit)
            .into_iter()
            .map(RankedPair::from)
            .collect()
    }

    /// Fuse and keep per-list ranks.
    ///
    /// score(id) = λ_lex / (k + rank_lex) + λ_sem / (k + rank_sem), where an
    /// absent rank contributes 0. Output is the union of input ids sorted by
    /// score descending, ties broken by id ascending.
    pub fn fuse_detailed(
        &self,
        lexical: &RankInput,
        semantic: &RankInput,
        limit: Option<usize>,
    ) -> Vec<FusedResult> {
        let (lambda_lex, lambda_sem) = self.weights.normalized();
        let k = f64::from(self.weights.k);

        let mut scores: HashMap<String, (f64, Option<usize>, Option<usize>)> = HashMap::new();

        for (rank, pair) in lexical.to_ranked().into_iter().enumerate() {
            let rank = rank + 1;
            let entry = scores.entry(pair.id).or_insert((0.0, None, None));
            entry.0 += lambda_lex / (k + rank as f64);
            entry.1 = Some(rank);
        }

        for (rank, pair) in semantic.to_ranked().into_iter().enumerate() {
            let rank = rank + 1;
            let entry = scores.entry(pair.id).or_insert((0.0, None, None));
            entry.0 += lambda_sem / (k + rank as f64);
            entry.2 = Some(rank);
        }

        let mut results: Vec<FusedResult> = scores
            .into_iter()
            .map(|(id, (score, lexical_rank, semantic_rank))| FusedResult {
                id,
                score,
                lexical_rank,
                semantic_rank,
            })
            .collect();

        results.sort_by(|a, b| b.score.total_cmp(&a.score).then_with(|| a.id.cmp(&b.id)));

        if let Some(limit) = limit {
            results.truncate(limit);
        }
        results
    }
}

/// Convenience wrapper: `fuse(bm25, vector, k, lambda_lex, lambda_sem, limit)`.
pub fn fuse(
    bm25: &RankInput,
    vector: &RankInput,
    k: u32,
    lambda_lex: f64,
    lambda_sem: f64,
    limit: Option<usize>,
) -> Result<Vec<RankedPair>, ConfigError> {
    let engine = FusionEngine::new(FusionWeights::new(k, lambda_lex, lambda_sem)?)?;
    Ok(engine.fuse(bm25, vector, limit))
}
