//! Cross-encoder reranking behind a circuit breaker and a timeout.
//!
//! Pair scoring runs on tokio's blocking pool in micro-batches, bounded by a
//! semaphore of `max_workers` permits. The whole scoring call is awaited under
//! `max_timeout_ms`; on expiry the in-flight batches are abandoned (they finish
//! on the blocking pool and their results are dropped). `timeout_ms` is a soft
//! target that only produces a warning.
//!
//! Every failure path (no scorer, open circuit, timeout, scorer error, panic)
//! returns a heuristic ranking with scores min-max normalized to [0, 1] and the
//! matching [`RerankMethod`].

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use super::heuristic::HeuristicReranker;
use super::{RerankMethod, RerankResult};
use crate::candidate::{Candidate, TextField};
use crate::circuit_breaker::SharedCircuitBreaker;
use crate::error::{ConfigError, RerankError};
use crate::text::min_max_normalize;

/// External pairwise relevance model.
///
/// Called from a blocking thread with one micro-batch at a time. Must return
/// exactly one finite score per document; any range is accepted and squashed
/// through the logistic function.
pub trait PairScorer: Send + Sync + 'static {
    fn score_pairs(&self, query: &str, documents: &[String]) -> Result<Vec<f64>, RerankError>;

    fn name(&self) -> &str {
        "cross_encoder"
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CrossEncoderConfig {
    pub batch_size: usize,
    pub max_workers: usize,
    /// Soft latency target.
    pub timeout_ms: u64,
    /// Hard deadline after which the heuristic fallback is used.
    pub max_timeout_ms: u64,
}

impl Default for CrossEncoderConfig {
    fn default() -> Self {
        Self {
            batch_size: 32,
            max_workers: 4,
            timeout_ms: 400,
            max_timeout_ms: 600,
        }
    }
}

impl CrossEncoderConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.batch_size == 0 {
            return Err(ConfigError::invalid("cross_encoder.batch_size", "must be >= 1"));
        }
        if self.max_workers == 0 {
            return Err(ConfigError::invalid("cross_encoder.max_workers", "must be >= 1"));
        }
        if self.max_timeout_ms == 0 {
            return Err(ConfigError::invalid("circuit_breaker.max_timeout_ms", "must be >= 1"));
        }
        if self.timeout_ms > self.max_timeout_ms {
            return Err(ConfigError::invalid(
                "circuit_breaker.timeout_ms",
                "must be <= circuit_breaker.max_timeout_ms",
            ));
        }
        Ok(())
    }
}

pub struct CrossEncoderReranker {
    scorer: Option<Arc<dyn PairScorer>>,
    config: CrossEncoderConfig,
    breaker: SharedCircuitBreaker,
    pool: Arc<Semaphore>,
    fallback: HeuristicReranker,
}

impl std::fmt::Debug for CrossEncoderReranker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CrossEncoderReranker")
            .field("scorer", &self.scorer.as_ref().map(|s| s.name().to_string()))
            .field("config", &self.config)
            .field("breaker", &self.breaker.status())
            .finish_non_exhaustive()
    }
}

impl CrossEncoderReranker {
    /// A reranker without a scorer always takes the heuristic path.
    pub fn new(
        scorer: Option<Arc<dyn PairScorer>>,
        config: CrossEncoderConfig,
        breaker: SharedCircuitBreaker,
        fallback: HeuristicReranker,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let pool = Arc::new(Semaphore::new(config.max_workers));
        Ok(Self {
            scorer,
            config,
            breaker,
            pool,
            fallback,
        })
    }

    pub fn has_scorer(&self) -> bool {
        self.scorer.is_some()
    }

    pub fn scorer(&self) -> Option<Arc<dyn PairScorer>> {
        self.scorer.clone()
    }

    pub fn breaker(&self) -> &SharedCircuitBreaker {
        &self.breaker
    }

    pub fn config(&self) -> &CrossEncoderConfig {
        &self.config
    }

    /// Rerank `candidates` for `query`. Never fails.
    pub async fn rerank_async(
        &self,
        query: &str,
        candidates: Vec<Candidate>,
        text_field: &TextField,
    ) -> RerankResult {
        let started = Instant::now();

        if candidates.is_empty() {
            return RerankResult {
                query: query.to_string(),
                candidates,
                scores: Vec::new(),
                method: RerankMethod::HeuristicFallback,
                latency_ms: elapsed_ms(started),
                error: None,
            };
        }

        let Some(scorer) = self.scorer.clone() else {
            return self.fallback(query, candidates, text_field, RerankMethod::HeuristicFallback, None, started);
        };

        let Some(permit) = self.breaker.try_acquire() else {
            let err = RerankError::CircuitOpen(self.breaker.name());
            debug!(error = %err, "Skipping cross-encoder");
            return self.fallback(
                query,
                candidates,
                text_field,
                RerankMethod::HeuristicFallback,
                Some(err.to_string()),
                started,
            );
        };

        let documents: Vec<String> = candidates
            .iter()
            .map(|c| c.field_text(text_field).to_string())
            .collect();
        let deadline = Duration::from_millis(self.config.max_timeout_ms);
        let outcome = tokio::time::timeout(deadline, self.score_all(scorer, query, documents)).await;

        match outcome {
            Ok(Ok(raw)) => {
                permit.success();
                let latency_ms = elapsed_ms(started);
                if latency_ms > self.config.timeout_ms as f64 {
                    warn!(
                        latency_ms,
                        target_ms = self.config.timeout_ms,
                        "Cross-encoder exceeded soft latency target"
                    );
                }
                self.primary(query, candidates, &raw, started)
            }
            Ok(Err(err)) => {
                permit.failure();
                warn!(error = %err, "Cross-encoder failed; using heuristic fallback");
                self.fallback(
                    query,
                    candidates,
                    text_field,
                    RerankMethod::ErrorFallback,
                    Some(err.to_string()),
                    started,
                )
            }
            Err(_) => {
                permit.failure();
                let err = RerankError::Timeout(self.config.max_timeout_ms);
                warn!(error = %err, "Cross-encoder timed out; using heuristic fallback");
                self.fallback(
                    query,
                    candidates,
                    text_field,
                    RerankMethod::TimeoutFallback,
                    Some(err.to_string()),
                    started,
                )
            }
        }
    }

    /// Heuristic ranking only, with scores normalized to [0, 1].
    pub fn rerank_heuristic(&self, query: &str, candidates: Vec<Candidate>, text_field: &TextField) -> RerankResult {
        self.fallback(query, candidates, text_field, RerankMethod::HeuristicFallback, None, Instant::now())
    }

    /// Score every document, `batch_size` at a time on the bounded pool.
    async fn score_all(
        &self,
        scorer: Arc<dyn PairScorer>,
        query: &str,
        documents: Vec<String>,
    ) -> Result<Vec<f64>, RerankError> {
        let expected = documents.len();
        let query: Arc<str> = Arc::from(query);
        let mut handles = Vec::new();

        for batch in documents.chunks(self.config.batch_size) {
            let permit = Arc::clone(&self.pool)
                .acquire_owned()
                .await
                .map_err(|e| RerankError::WorkerPool(e.to_string()))?;
            let scorer = Arc::clone(&scorer);
            let query = Arc::clone(&query);
            let batch = batch.to_vec();
            handles.push(tokio::task::spawn_blocking(move || {
                let _permit = permit;
                let scores = scorer.score_pairs(&query, &batch)?;
                if scores.len() != batch.len() {
                    return Err(RerankError::ScoreCountMismatch {
                        expected: batch.len(),
                        got: scores.len(),
                    });
                }
                Ok(scores)
            }));
        }

        let mut all = Vec::with_capacity(expected);
        for handle in handles {
            let batch = handle
                .await
                .map_err(|e| RerankError::TaskPanicked(e.to_string()))??;
            all.extend(batch);
        }

        if let Some(pos) = all.iter().position(|s| !s.is_finite()) {
            return Err(RerankError::NonFiniteScore(pos));
        }
        Ok(all)
    }

    fn primary(&self, query: &str, candidates: Vec<Candidate>, raw: &[f64], started: Instant) -> RerankResult {
        let mut scored: Vec<(usize, f64, Candidate)> = candidates
            .into_iter()
            .zip(raw)
            .enumerate()
            .map(|(i, (mut c, &r))| {
                let score = logistic(r);
                c.annotate("cross_encoder_raw", r);
                c.annotate("fused_score", c.score);
                c.annotate("rerank_stage", "cross_encoder");
                c.score = score;
                (i, score, c)
            })
            .collect();
        scored.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));

        let scores = scored.iter().map(|(_, s, _)| *s).collect();
        let candidates = scored.into_iter().map(|(_, _, c)| c).collect();
        RerankResult {
            query: query.to_string(),
            candidates,
            scores,
            method: RerankMethod::CrossEncoder,
            latency_ms: elapsed_ms(started),
            error: None,
        }
    }

    fn fallback(
        &self,
        query: &str,
        candidates: Vec<Candidate>,
        text_field: &TextField,
        method: RerankMethod,
        error: Option<String>,
        started: Instant,
    ) -> RerankResult {
        let (mut candidates, raw) = self.fallback.rerank(query, candidates, text_field);
        let scores = min_max_normalize(&raw);
        for (c, &s) in candidates.iter_mut().zip(&scores) {
            c.score = s;
            c.annotate("rerank_method", method.to_string());
        }
        RerankResult {
            query: query.to_string(),
            candidates,
            scores,
            method,
            latency_ms: elapsed_ms(started),
            error,
        }
    }
}

fn logistic(x: f64) -> f64 {
    1.0 / (1.0 + (-x).exp())
}

fn elapsed_ms(started: Instant) -> f64 {
    started.elapsed().as_secs_f64() * 1000.0
}
