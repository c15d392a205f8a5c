//! Two-tier reranking.
//!
//! The heuristic and MMR rerankers are always available. The cross-encoder
//! tier scores query/document pairs through a [`PairScorer`] behind a circuit
//! breaker and a timeout, and falls back to the heuristic reranker on any
//! failure.

pub mod cross_encoder;
pub mod heuristic;
pub mod mmr;

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::candidate::Candidate;
use crate::error::ConfigError;

pub use cross_encoder::{CrossEncoderConfig, CrossEncoderReranker, PairScorer};
pub use heuristic::{HeuristicReranker, HeuristicScorer};
pub use mmr::{MmrConfig, MmrReranker};

/// How a [`RerankResult`] was produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RerankMethod {
    CrossEncoder,
    /// Cross-encoder disabled, missing or its circuit is open.
    HeuristicFallback,
    /// Cross-encoder exceeded `max_timeout_ms`.
    TimeoutFallback,
    /// Cross-encoder failed.
    ErrorFallback,
}

impl RerankMethod {
    #[must_use]
    pub fn is_fallback(self) -> bool {
        !matches!(self, Self::CrossEncoder)
    }
}

impl fmt::Display for RerankMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CrossEncoder => write!(f, "cross_encoder"),
            Self::HeuristicFallback => write!(f, "heuristic_fallback"),
            Self::TimeoutFallback => write!(f, "timeout_fallback"),
            Self::ErrorFallback => write!(f, "error_fallback"),
        }
    }
}

/// Reranked candidates plus telemetry. `scores[i]` belongs to
/// `candidates[i]` and lies in [0, 1].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RerankResult {
    pub query: String,
    pub candidates: Vec<Candidate>,
    pub scores: Vec<f64>,
    pub method: RerankMethod,
    pub latency_ms: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RerankResult {
    #[must_use]
    pub fn len(&self) -> usize {
        self.candidates.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.candidates.is_empty()
    }

    /// Ids in rank order.
    #[must_use]
    pub fn ids(&self) -> Vec<&str> {
        self.candidates.iter().map(|c| c.id.as_str()).collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RerankConfig {
    /// Use the cross-encoder tier when a scorer is attached.
    pub enabled: bool,
    /// Weight of the heuristic score against the normalized fused score.
    pub alpha: f64,
    /// Only the first `top_m` candidates are rescored; the rest keep their
    /// order behind them.
    pub top_m: usize,
    /// Number of results returned by the pipeline.
    pub top_k: usize,
}

impl Default for RerankConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            alpha: 0.6,
            top_m: 50,
            top_k: 10,
        }
    }
}

impl RerankConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(0.0..=1.0).contains(&self.alpha) {
            return Err(ConfigError::invalid("rerank.alpha", "must be within [0, 1]"));
        }
        if self.top_m == 0 {
            return Err(ConfigError::invalid("rerank.top_m", "must be >= 1"));
        }
        if self.top_k == 0 {
            return Err(ConfigError::invalid("rerank.top_k", "must be >= 1"));
        }
        Ok(())
    }
}
