//! End-to-end pipeline scenarios.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{TimeZone, Utc};

use ragfuse_core::candidate::{Document, MetaValue};
use ragfuse_core::circuit_breaker::CircuitStateKind;
use ragfuse_core::error::RerankError;
use ragfuse_core::intent::RouteTarget;
use ragfuse_core::rerank::{PairScorer, RerankMethod};
use ragfuse_core::{AdvancedRetriever, RetrievalRequest, RetrieverConfig};

// ────────────────────────────────────────────────────────────────────
// Fixtures
// ────────────────────────────────────────────────────────────────────

const QUERY: &str = "raft quorum election";

fn doc(text: impl Into<String>, file: &str) -> Document {
    let mut d = Document::new(text);
    d.metadata.insert("file".into(), MetaValue::from(file));
    d
}

/// 400 filler tokens with the query phrase at tokens 300..303.
fn long_raft_text() -> String {
    (0..400)
        .map(|i| match i {
            300 => "raft".to_string(),
            301 => "quorum".to_string(),
            302 => "election".to_string(),
            _ => format!("w{i}"),
        })
        .collect::<Vec<_>>()
        .join(" ")
}

fn store() -> HashMap<String, Document> {
    let leader = "leader election in raft uses randomized timeouts and a quorum of votes";
    HashMap::from([
        ("raft".to_string(), doc(long_raft_text(), "consensus.md")),
        ("leader".to_string(), doc(leader, "consensus.md")),
        ("copy".to_string(), doc(leader, "mirror.md")),
        ("paxos".to_string(), doc("paxos reaches agreement with proposers acceptors and learners", "paxos.md")),
        ("gossip".to_string(), doc("gossip protocols spread membership updates across large clusters", "gossip.md")),
        ("short".to_string(), doc("tiny", "short.md")),
    ])
}

fn request() -> RetrievalRequest {
    RetrievalRequest::new(
        QUERY,
        vec![("raft", 8.0), ("copy", 6.0), ("short", 5.0), ("paxos", 2.0), ("lowscore", 0.01)],
        vec![("leader", 0.9), ("raft", 0.4), ("gossip", 0.5)],
    )
    .with_request_id("req-42")
}

struct OverlapScorer;

impl PairScorer for OverlapScorer {
    fn score_pairs(&self, query: &str, documents: &[String]) -> Result<Vec<f64>, RerankError> {
        Ok(documents
            .iter()
            .map(|d| query.split_whitespace().filter(|w| d.contains(w)).count() as f64)
            .collect())
    }
}

struct FailingScorer;

impl PairScorer for FailingScorer {
    fn score_pairs(&self, _query: &str, _documents: &[String]) -> Result<Vec<f64>, RerankError> {
        Err(RerankError::ModelError("backend down".into()))
    }
}

// ────────────────────────────────────────────────────────────────────
// Default pipeline
// ────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn full_pipeline_ranks_windows_and_records_provenance() {
    let retriever = AdvancedRetriever::new(RetrieverConfig::default()).unwrap();
    let outcome = retriever.retrieve(request(), &store()).await;

    assert!(!outcome.short_circuit);
    let ids = outcome.ids();
    assert_eq!(ids[0], "raft");
    assert!(!ids.contains(&"short"), "too-short document survived");
    assert!(!ids.contains(&"lowscore"), "below-floor document survived");

    // The leader/copy pair collapses to one.
    let copies = ids.iter().filter(|id| **id == "leader" || **id == "copy").count();
    assert_eq!(copies, 1);
    assert_eq!(outcome.dedup.as_ref().map(|d| d.removed), Some(1));

    let top = &outcome.results[0];
    assert_eq!(top.windows.len(), 3);
    assert_eq!(top.best_window, Some(2));
    let meta = &top.candidate.metadata;
    assert_eq!(meta.get("lexical_rank"), Some(&MetaValue::Int(1)));
    assert_eq!(meta.get("semantic_rank"), Some(&MetaValue::Int(2)));
    assert!(meta.contains_key("fused_score"));
    assert!(meta.contains_key("heuristic_score"));
    assert_eq!(meta.get("mmr_rank"), Some(&MetaValue::Int(1)));

    let rerank = outcome.rerank.as_ref().unwrap();
    assert_eq!(rerank.method, RerankMethod::HeuristicFallback);
    assert!(rerank.mmr_applied);
    assert!(outcome.results.windows(2).all(|w| w[0].score() >= w[1].score()));
    assert!(meta.contains_key("pre_mmr_score"));

    assert_eq!(outcome.filter_stats.bm25_original, 5);
    assert_eq!(outcome.filter_stats.bm25_filtered, 3);
    assert!(outcome.timings.total_ms >= 0.0);
}

#[tokio::test]
async fn outcome_serializes_to_json() {
    let retriever = AdvancedRetriever::new(RetrieverConfig::default()).unwrap();
    let outcome = retriever.retrieve(request(), &store()).await;
    let json = serde_json::to_value(&outcome).unwrap();
    assert!(json["results"].is_array());
    assert_eq!(json["rerank"]["method"], "heuristic_fallback");
}

#[tokio::test]
async fn empty_inputs_yield_empty_results() {
    let retriever = AdvancedRetriever::new(RetrieverConfig::default()).unwrap();
    let request = RetrievalRequest::new(QUERY, Vec::<String>::new(), Vec::<String>::new());
    let outcome = retriever.retrieve(request, &store()).await;
    assert!(outcome.results.is_empty());
    assert!(!outcome.short_circuit);
}

#[tokio::test]
async fn per_file_cap_and_top_k_bound_results() {
    let config = RetrieverConfig {
        per_file_cap: 1,
        ..RetrieverConfig::default()
    };
    let retriever = AdvancedRetriever::new(config).unwrap();
    let request = RetrievalRequest::new(
        QUERY,
        vec![("raft", 8.0), ("leader", 6.0)],
        vec![("paxos", 0.9)],
    );
    let outcome = retriever.retrieve(request, &store()).await;
    let consensus = outcome
        .results
        .iter()
        .filter(|h| h.candidate.metadata.get("file").and_then(MetaValue::as_str) == Some("consensus.md"))
        .count();
    assert_eq!(consensus, 1);

    let mut config = RetrieverConfig::default();
    config.rerank.top_k = 2;
    let retriever = AdvancedRetriever::new(config).unwrap();
    let outcome = retriever.retrieve(request_all(), &store()).await;
    assert_eq!(outcome.results.len(), 2);
}

fn request_all() -> RetrievalRequest {
    RetrievalRequest::new(
        QUERY,
        vec!["raft", "leader", "paxos", "gossip"],
        Vec::<String>::new(),
    )
}

// ────────────────────────────────────────────────────────────────────
// Intent routing
// ────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn structured_query_short_circuits_when_routing_enabled() {
    let mut config = RetrieverConfig::default();
    config.intent.enable_structured_routing = true;
    let retriever = AdvancedRetriever::new(config).unwrap();
    let request = RetrievalRequest::new(
        "how many orders did customer 48213 place per month since 2024-01-01, total revenue",
        vec![("raft", 1.0)],
        Vec::<String>::new(),
    )
    .with_request_id("req-7");
    let outcome = retriever.retrieve(request, &store()).await;
    assert!(outcome.short_circuit);
    assert!(outcome.results.is_empty());
    assert_eq!(outcome.intent.map(|i| i.route_target), Some(RouteTarget::Sql));
}

// ────────────────────────────────────────────────────────────────────
// Freshness
// ────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn fresh_document_wins_recency_query() {
    let mut docs = HashMap::new();
    let mut old = doc("raft release notes covering log compaction and snapshot installation", "old.md");
    old.metadata.insert("updated_at".into(), MetaValue::from("2024-02-04"));
    let mut new = doc("raft release notes covering joint consensus membership changes", "new.md");
    new.metadata.insert("updated_at".into(), MetaValue::from("2025-03-14"));
    docs.insert("old".to_string(), old);
    docs.insert("new".to_string(), new);

    let retriever = AdvancedRetriever::new(RetrieverConfig::default()).unwrap();
    let request = RetrievalRequest::new(
        "latest raft release notes",
        vec![("old", 5.0), ("new", 4.0)],
        Vec::<String>::new(),
    )
    .at(Utc.with_ymd_and_hms(2025, 3, 15, 0, 0, 0).unwrap());
    let outcome = retriever.retrieve(request, &docs).await;

    assert_eq!(outcome.ids(), vec!["new", "old"]);
    let freshness = outcome.freshness.unwrap();
    assert!(freshness.is_freshness_sensitive);
    assert_eq!(freshness.documents_with_timestamp, 2);
}

// ────────────────────────────────────────────────────────────────────
// Cross-encoder
// ────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn attached_scorer_replaces_heuristic_and_skips_mmr() {
    let retriever = AdvancedRetriever::new(RetrieverConfig::default())
        .unwrap()
        .with_scorer(Arc::new(OverlapScorer))
        .unwrap();
    let outcome = retriever.retrieve(request(), &store()).await;
    let rerank = outcome.rerank.unwrap();
    assert_eq!(rerank.method, RerankMethod::CrossEncoder);
    assert!(!rerank.mmr_applied);
    assert!(outcome.results.iter().all(|h| (0.0..=1.0).contains(&h.score())));
}

#[tokio::test]
async fn disabled_cross_encoder_never_calls_scorer() {
    let mut config = RetrieverConfig::default();
    config.rerank.enabled = false;
    let retriever = AdvancedRetriever::new(config)
        .unwrap()
        .with_scorer(Arc::new(FailingScorer))
        .unwrap();
    let outcome = retriever.retrieve(request(), &store()).await;
    assert_eq!(outcome.rerank.unwrap().method, RerankMethod::HeuristicFallback);
    assert_eq!(retriever.circuit_breaker().state(), CircuitStateKind::Closed);
}

#[tokio::test]
async fn concurrent_requests_share_the_breaker() {
    let mut config = RetrieverConfig::default();
    config.circuit_breaker.failure_threshold = 2;
    let retriever = AdvancedRetriever::new(config)
        .unwrap()
        .with_scorer(Arc::new(FailingScorer))
        .unwrap();
    let docs = store();

    let (a, b, c) = tokio::join!(
        retriever.retrieve(request(), &docs),
        retriever.retrieve(request(), &docs),
        retriever.retrieve(request(), &docs),
    );
    for outcome in [&a, &b, &c] {
        assert!(!outcome.results.is_empty());
        assert!(outcome.rerank.as_ref().unwrap().method.is_fallback());
    }
    assert_eq!(retriever.circuit_breaker().state(), CircuitStateKind::Open);
}

#[tokio::test]
async fn outcome_encodes_as_single_json_line() {
    let retriever = AdvancedRetriever::new(RetrieverConfig::default()).unwrap();
    let outcome = retriever.retrieve(request(), &store()).await;
    let line = outcome.to_json_line().unwrap();
    assert!(!line.contains('\n'));
    let back: serde_json::Value = serde_json::from_str(&line).unwrap();
    assert_eq!(back["results"][0]["candidate"]["id"], "raft");
}
