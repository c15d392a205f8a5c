//! Property-based tests for the recall-preserving prefilter.
//!
//! - Filtered lists keep their input variant and relative order
//! - Every surviving scored entry meets its list's floor
//! - Every survivor's text length is within bounds
//! - Id-only lists never lose entries to the score floor
//! - Retention rates stay within [0, 1]
//! - A disabled prefilter is the identity

use std::collections::HashMap;

use proptest::prelude::*;

use ragfuse_core::candidate::RankInput;
use ragfuse_core::prefilter::{ListKind, Prefilter, PrefilterConfig};

// ────────────────────────────────────────────────────────────────────
// Strategies
// ────────────────────────────────────────────────────────────────────

const WORDS: &[&str] = &[
    "fusion", "rank", "lexical", "vector", "window", "token", "breaker", "probe", "cache",
    "freshness", "decay", "intent", "router", "query", "document",
];

fn arb_text() -> impl Strategy<Value = String> {
    prop::collection::vec(0usize..WORDS.len(), 0..30)
        .prop_map(|idx| idx.into_iter().map(|i| WORDS[i]).collect::<Vec<_>>().join(" "))
}

fn arb_corpus() -> impl Strategy<Value = HashMap<String, String>> {
    prop::collection::vec(arb_text(), 12).prop_map(|texts| {
        texts
            .into_iter()
            .enumerate()
            .map(|(i, t)| (format!("d{i}"), t))
            .collect()
    })
}

fn arb_pairs() -> impl Strategy<Value = Vec<(String, f64)>> {
    prop::collection::vec((0usize..14, 0.0f64..1.0), 0..14).prop_map(|v| {
        let mut seen = std::collections::HashSet::new();
        v.into_iter()
            .filter(|(i, _)| seen.insert(*i))
            .map(|(i, s)| (format!("d{i}"), s))
            .collect()
    })
}

fn ids_of(list: &RankInput) -> Vec<String> {
    match list {
        RankInput::Ids(ids) => ids.clone(),
        RankInput::Pairs(pairs) => pairs.iter().map(|(id, _)| id.clone()).collect(),
        RankInput::Map(map) => map.keys().cloned().collect(),
    }
}

fn is_subsequence(sub: &[String], full: &[String]) -> bool {
    let mut it = full.iter();
    sub.iter().all(|s| it.any(|f| f == s))
}

// ────────────────────────────────────────────────────────────────────
// Floors and bounds
// ────────────────────────────────────────────────────────────────────

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    #[test]
    fn prop_pairs_keep_order_and_variant(docs in arb_corpus(), pairs in arb_pairs()) {
        let prefilter = Prefilter::default();
        let input = RankInput::Pairs(pairs);
        let out = prefilter.filter(&input, ListKind::Lexical, &docs);
        prop_assert!(matches!(out, RankInput::Pairs(_)));
        prop_assert!(is_subsequence(&ids_of(&out), &ids_of(&input)));
    }

    #[test]
    fn prop_survivors_meet_floor_and_length(docs in arb_corpus(), pairs in arb_pairs(), vector in any::<bool>()) {
        let config = PrefilterConfig::default();
        let prefilter = Prefilter::new(config.clone()).unwrap();
        let (kind, floor) = if vector {
            (ListKind::Vector, config.min_vector_score)
        } else {
            (ListKind::Lexical, config.min_bm25_score)
        };
        let out = prefilter.filter(&RankInput::Pairs(pairs), kind, &docs);
        if let RankInput::Pairs(kept) = out {
            for (id, score) in kept {
                prop_assert!(score >= floor, "{} kept with score {}", id, score);
                let len = docs.get(&id).map_or(0, |t| t.chars().count());
                prop_assert!(len >= config.min_doc_length && len <= config.max_doc_length);
            }
        }
    }

    #[test]
    fn prop_ids_skip_score_floor(docs in arb_corpus()) {
        let config = PrefilterConfig {
            enable_diversity: false,
            min_doc_length: 0,
            ..PrefilterConfig::default()
        };
        let prefilter = Prefilter::new(config).unwrap();
        let ids: Vec<String> = (0..12).map(|i| format!("d{i}")).collect();
        let out = prefilter.filter(&RankInput::from(ids.clone()), ListKind::Vector, &docs);
        prop_assert_eq!(ids_of(&out), ids);
    }
}

// ────────────────────────────────────────────────────────────────────
// Stats and passthrough
// ────────────────────────────────────────────────────────────────────

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    #[test]
    fn prop_retention_in_unit_interval(docs in arb_corpus(), bm25 in arb_pairs(), vector in arb_pairs()) {
        let prefilter = Prefilter::default();
        let (b, v, stats) = prefilter.prefilter_all_with_stats(
            &RankInput::Pairs(bm25.clone()),
            &RankInput::Pairs(vector.clone()),
            &docs,
        );
        prop_assert!((0.0..=1.0).contains(&stats.bm25_retention));
        prop_assert!((0.0..=1.0).contains(&stats.vector_retention));
        prop_assert_eq!(stats.bm25_filtered, b.len());
        prop_assert_eq!(stats.vector_filtered, v.len());
        let dropped = stats.dropped_by_score + stats.dropped_by_length + stats.dropped_by_diversity;
        prop_assert_eq!(dropped, bm25.len() + vector.len() - b.len() - v.len());
    }

    #[test]
    fn prop_disabled_is_identity(docs in arb_corpus(), bm25 in arb_pairs(), vector in arb_pairs()) {
        let prefilter = Prefilter::new(PrefilterConfig { enabled: false, ..PrefilterConfig::default() }).unwrap();
        let bm25 = RankInput::Pairs(bm25);
        let vector = RankInput::Pairs(vector);
        let (b, v) = prefilter.prefilter_all(&bm25, &vector, &docs);
        prop_assert_eq!(b, bm25);
        prop_assert_eq!(v, vector);
    }
}
