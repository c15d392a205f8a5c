//! The retrieval pipeline.
//!
//! [`AdvancedRetriever::retrieve`] runs the stages in a fixed order:
//!
//! 1. intent routing (may short-circuit to a structured backend)
//! 2. prefilter of both raw lists
//! 3. dedup of the candidate pool
//! 4. weighted RRF fusion
//! 5. freshness adjustment
//! 6. windowing of the top candidates
//! 7. rerank: cross-encoder when attached and healthy, else heuristic + MMR
//! 8. per-file cap, then truncation to `rerank.top_k`
//!
//! Only construction can fail. At request time every stage either succeeds or
//! passes its input through and records the degradation.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{Instrument, debug, info, info_span};

use crate::candidate::{Candidate, DocumentLookup, MetaValue, RankInput, TextField};
use crate::circuit_breaker::SharedCircuitBreaker;
use crate::config::RetrieverConfig;
use crate::dedup::{DedupReport, Deduplicator};
use crate::error::ConfigError;
use crate::freshness::{FreshnessEnhancer, FreshnessMetadata};
use crate::intent::{IntentClassification, IntentRouter};
use crate::logging::{LogError, init_logging};
use crate::prefilter::{FilterStats, Prefilter};
use crate::rerank::heuristic::HeuristicScorer;
use crate::rerank::{
    CrossEncoderReranker, HeuristicReranker, MmrReranker, PairScorer, RerankMethod, RerankResult,
};
use crate::search::{DocumentWindow, FusionEngine, Windower};

/// One query against two raw candidate lists.
#[derive(Debug, Clone)]
pub struct RetrievalRequest {
    pub query: String,
    pub tag: Option<String>,
    pub request_id: Option<String>,
    pub bm25: RankInput,
    pub vector: RankInput,
    /// Reference time for freshness; the current time when `None`.
    pub now: Option<DateTime<Utc>>,
}

impl RetrievalRequest {
    pub fn new(query: impl Into<String>, bm25: impl Into<RankInput>, vector: impl Into<RankInput>) -> Self {
        Self {
            query: query.into(),
            tag: None,
            request_id: None,
            bm25: bm25.into(),
            vector: vector.into(),
            now: None,
        }
    }

    #[must_use]
    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = Some(tag.into());
        self
    }

    #[must_use]
    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    #[must_use]
    pub fn at(mut self, now: DateTime<Utc>) -> Self {
        self.now = Some(now);
        self
    }
}

/// A final result with its citation windows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrievalHit {
    pub candidate: Candidate,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub windows: Vec<DocumentWindow>,
    /// Index into `windows` of the window best matching the query.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub best_window: Option<usize>,
}

impl RetrievalHit {
    pub fn id(&self) -> &str {
        &self.candidate.id
    }

    pub fn score(&self) -> f64 {
        self.candidate.score
    }
}

/// Rerank telemetry without the candidates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RerankSummary {
    pub method: RerankMethod,
    pub latency_ms: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub mmr_applied: bool,
}

impl From<&RerankResult> for RerankSummary {
    fn from(result: &RerankResult) -> Self {
        Self {
            method: result.method,
            latency_ms: result.latency_ms,
            error: result.error.clone(),
            mmr_applied: false,
        }
    }
}

/// Wall time per stage in milliseconds.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StageTimings {
    pub intent_ms: f64,
    pub prefilter_ms: f64,
    pub dedup_ms: f64,
    pub fusion_ms: f64,
    pub freshness_ms: f64,
    pub window_ms: f64,
    pub rerank_ms: f64,
    pub total_ms: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RetrievalOutcome {
    pub intent: Option<IntentClassification>,
    /// The query should be answered by `intent.route_target`; `results` is empty.
    pub short_circuit: bool,
    pub results: Vec<RetrievalHit>,
    pub rerank: Option<RerankSummary>,
    pub freshness: Option<FreshnessMetadata>,
    pub filter_stats: FilterStats,
    pub dedup: Option<DedupReport>,
    pub timings: StageTimings,
}

impl RetrievalOutcome {
    /// Result ids in rank order.
    #[must_use]
    pub fn ids(&self) -> Vec<&str> {
        self.results.iter().map(RetrievalHit::id).collect()
    }

    /// One JSON line for request logs.
    pub fn to_json_line(&self) -> crate::Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Composes every stage behind one `retrieve` call.
///
/// Cheap to share: stages are immutable after construction and the circuit
/// breaker is the only state carried across requests.
#[derive(Debug)]
pub struct AdvancedRetriever {
    config: RetrieverConfig,
    intent: IntentRouter,
    prefilter: Prefilter,
    dedup: Deduplicator,
    fusion: FusionEngine,
    freshness: FreshnessEnhancer,
    windower: Windower,
    cross_encoder: CrossEncoderReranker,
    mmr: MmrReranker,
    scorer: HeuristicScorer,
}

impl AdvancedRetriever {
    /// Validate `config` and build every stage. No cross-encoder is attached.
    pub fn new(config: RetrieverConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let breaker = SharedCircuitBreaker::from_config(config.breaker_config());
        let cross_encoder = build_cross_encoder(&config, None, breaker)?;
        Ok(Self {
            intent: IntentRouter::new(config.intent.clone())?,
            prefilter: Prefilter::new(config.prefilter.clone())?,
            dedup: Deduplicator::new(config.dedup.clone())?,
            fusion: FusionEngine::new(config.fusion.clone())?,
            freshness: FreshnessEnhancer::new(config.freshness.clone())?,
            windower: Windower::new(config.window.clone())?,
            mmr: MmrReranker::new(config.mmr.clone(), config.file_key.clone())?,
            cross_encoder,
            scorer: HeuristicScorer,
            config,
        })
    }

    /// Load `path`, install the logging it configures and build the pipeline.
    ///
    /// A subscriber installed earlier by the host is kept.
    pub fn from_config_file(path: &Path) -> crate::Result<Self> {
        let config = RetrieverConfig::load(path)?;
        match init_logging(&config.logging) {
            Ok(()) | Err(LogError::AlreadyInitialized | LogError::SetSubscriber(_)) => {}
            Err(err) => return Err(err.into()),
        }
        Ok(Self::new(config)?)
    }

    /// Attach a cross-encoder model.
    pub fn with_scorer(mut self, scorer: Arc<dyn PairScorer>) -> Result<Self, ConfigError> {
        let breaker = self.cross_encoder.breaker().clone();
        self.cross_encoder = build_cross_encoder(&self.config, Some(scorer), breaker)?;
        Ok(self)
    }

    /// Share a circuit breaker with other retrievers calling the same model.
    pub fn with_circuit_breaker(mut self, breaker: SharedCircuitBreaker) -> Result<Self, ConfigError> {
        let scorer = self.cross_encoder.scorer();
        self.cross_encoder = build_cross_encoder(&self.config, scorer, breaker)?;
        Ok(self)
    }

    pub fn config(&self) -> &RetrieverConfig {
        &self.config
    }

    pub fn circuit_breaker(&self) -> &SharedCircuitBreaker {
        self.cross_encoder.breaker()
    }

    pub async fn retrieve(&self, request: RetrievalRequest, docs: &dyn DocumentLookup) -> RetrievalOutcome {
        let span = info_span!(
            "retrieve",
            request_id = request.request_id.as_deref().unwrap_or(""),
            tag = request.tag.as_deref().unwrap_or(""),
        );
        self.run(request, docs).instrument(span).await
    }

    async fn run(&self, request: RetrievalRequest, docs: &dyn DocumentLookup) -> RetrievalOutcome {
        let started = Instant::now();
        let mut outcome = RetrievalOutcome::default();
        let query = request.query.as_str();

        // 1. Intent
        let t = Instant::now();
        if self.config.intent.enabled {
            let intent = self.intent.classify(query, request.request_id.as_deref());
            outcome.short_circuit = intent.should_short_circuit;
            outcome.intent = Some(intent);
        }
        outcome.timings.intent_ms = elapsed_ms(t);
        if outcome.short_circuit {
            outcome.timings.total_ms = elapsed_ms(started);
            info!(
                route_target = ?outcome.intent.as_ref().map(|i| i.route_target),
                "Short-circuiting to structured backend"
            );
            return outcome;
        }

        // 2. Prefilter
        let t = Instant::now();
        let (bm25, vector, stats) = self
            .prefilter
            .prefilter_all_with_stats(&request.bm25, &request.vector, docs);
        outcome.filter_stats = stats;
        outcome.timings.prefilter_ms = elapsed_ms(t);

        // 3. Dedup. Pool members are scored by their fused rank over the
        // filtered lists so the best-ranked copy of a duplicate survives.
        let t = Instant::now();
        let pool: Vec<Candidate> = self
            .fusion
            .fuse(&bm25, &vector, None)
            .into_iter()
            .map(|pair| hydrate(&pair.id, pair.score, docs))
            .collect();
        let (pool, report) = self.dedup.filter_duplicates_with_report(pool, &TextField::Body);
        let keep: HashSet<String> = pool.iter().map(|c| c.id.clone()).collect();
        let (bm25, vector) = (bm25.retain_ids(&keep), vector.retain_ids(&keep));
        outcome.dedup = Some(report);
        outcome.timings.dedup_ms = elapsed_ms(t);

        // 4. Fusion
        let t = Instant::now();
        let mut by_id: HashMap<String, Candidate> =
            pool.into_iter().map(|c| (c.id.clone(), c)).collect();
        let mut candidates: Vec<Candidate> = self
            .fusion
            .fuse_detailed(&bm25, &vector, None)
            .into_iter()
            .filter_map(|fused| {
                let mut c = by_id.remove(&fused.id)?;
                c.score = fused.score;
                c.annotate("fused_score", fused.score);
                if let Some(rank) = fused.lexical_rank {
                    c.annotate("lexical_rank", rank);
                }
                if let Some(rank) = fused.semantic_rank {
                    c.annotate("semantic_rank", rank);
                }
                Some(c)
            })
            .collect();
        outcome.timings.fusion_ms = elapsed_ms(t);
        debug!(stage = "fusion", candidates = candidates.len(), "Fusion complete");

        // 5. Freshness
        let t = Instant::now();
        if self.config.freshness.enabled {
            let (adjusted, meta) = self.freshness.enhance(query, candidates, request.now);
            candidates = adjusted;
            outcome.freshness = Some(meta);
        }
        outcome.timings.freshness_ms = elapsed_ms(t);

        // 6. Windows
        let t = Instant::now();
        let mut windows: HashMap<String, Vec<DocumentWindow>> = HashMap::new();
        if self.config.window.enabled {
            let top = self.config.window.top_n.min(candidates.len());
            for window in self.windower.create_windows(&candidates[..top], None) {
                windows.entry(window.document_id.clone()).or_default().push(window);
            }
            for c in &mut candidates {
                if let Some(best) = windows.get(&c.id).and_then(|w| self.best_window(query, w)) {
                    c.annotate("best_window", best);
                }
            }
            debug!(stage = "window", documents = windows.len(), "Windowing complete");
        }
        outcome.timings.window_ms = elapsed_ms(t);

        // 7. Rerank
        let t = Instant::now();
        let result = if self.config.rerank.enabled {
            self.cross_encoder
                .rerank_async(query, candidates, &TextField::Body)
                .await
        } else {
            self.cross_encoder
                .rerank_heuristic(query, candidates, &TextField::Body)
        };
        let mut summary = RerankSummary::from(&result);
        candidates = result.candidates;
        if result.method != RerankMethod::CrossEncoder && self.config.mmr.enabled {
            let k = candidates.len();
            candidates = self.mmr.select(candidates, k, request.tag.as_deref());
            summary.mmr_applied = true;
        }
        outcome.rerank = Some(summary);
        outcome.timings.rerank_ms = elapsed_ms(t);

        // 8. Cap per file, then truncate
        let candidates = self.cap_per_file(candidates);
        outcome.results = candidates
            .into_iter()
            .take(self.config.rerank.top_k)
            .map(|candidate| {
                let windows = windows.remove(&candidate.id).unwrap_or_default();
                let best_window = candidate
                    .metadata
                    .get("best_window")
                    .and_then(MetaValue::as_f64)
                    .map(|i| i as usize);
                RetrievalHit {
                    candidate,
                    windows,
                    best_window,
                }
            })
            .collect();

        outcome.timings.total_ms = elapsed_ms(started);
        info!(
            results = outcome.results.len(),
            bm25_in = outcome.filter_stats.bm25_original,
            vector_in = outcome.filter_stats.vector_original,
            rerank_method = ?outcome.rerank.as_ref().map(|r| r.method),
            latency_ms = outcome.timings.total_ms,
            "Retrieval complete"
        );
        outcome
    }

    fn best_window(&self, query: &str, windows: &[DocumentWindow]) -> Option<usize> {
        let mut best: Option<(usize, f64)> = None;
        for (i, window) in windows.iter().enumerate() {
            let score = self.scorer.score(query, &window.text);
            if best.is_none_or(|(_, b)| score > b) {
                best = Some((i, score));
            }
        }
        best.map(|(i, _)| i)
    }

    /// Keep at most `per_file_cap` candidates per `file_key` value. Candidates
    /// without a file are never capped.
    fn cap_per_file(&self, candidates: Vec<Candidate>) -> Vec<Candidate> {
        let cap = self.config.per_file_cap;
        let mut seen: HashMap<String, usize> = HashMap::new();
        let before = candidates.len();
        let kept: Vec<Candidate> = candidates
            .into_iter()
            .filter(|c| match c.metadata.get(&self.config.file_key).and_then(MetaValue::as_str) {
                Some(file) => {
                    let count = seen.entry(file.to_string()).or_insert(0);
                    *count += 1;
                    *count <= cap
                }
                None => true,
            })
            .collect();
        if kept.len() < before {
            debug!(stage = "per_file_cap", dropped = before - kept.len(), cap, "Capped results per file");
        }
        kept
    }
}

fn build_cross_encoder(
    config: &RetrieverConfig,
    scorer: Option<Arc<dyn PairScorer>>,
    breaker: SharedCircuitBreaker,
) -> Result<CrossEncoderReranker, ConfigError> {
    CrossEncoderReranker::new(
        scorer,
        config.cross_encoder_config(),
        breaker,
        HeuristicReranker::new(config.rerank.alpha, config.rerank.top_m),
    )
}

/// Build a pipeline candidate from the document store.
fn hydrate(id: &str, score: f64, docs: &dyn DocumentLookup) -> Candidate {
    let text = docs.text(id).map(|t| t.into_owned()).unwrap_or_default();
    let mut candidate = Candidate::new(id, score, text);
    candidate.embedding = docs.embedding(id);
    candidate.metadata = docs.metadata(id);
    candidate
}

fn elapsed_ms(started: Instant) -> f64 {
    started.elapsed().as_secs_f64() * 1000.0
}
