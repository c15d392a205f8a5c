//! Property-based tests for weighted RRF fusion.
//!
//! - Output is exactly the union of input ids, each once
//! - Scores are finite, non-negative and sorted (ties by id)
//! - Swapping the lists together with the weights gives the same scores
//! - `limit` truncates a prefix of the unlimited output
//! - An id in both lists outranks the same rank in only one list

use std::collections::HashSet;

use proptest::prelude::*;

use ragfuse_core::candidate::RankInput;
use ragfuse_core::search::{FusionEngine, FusionWeights, fuse};

// ────────────────────────────────────────────────────────────────────
// Strategies
// ────────────────────────────────────────────────────────────────────

fn arb_ids(max: usize) -> impl Strategy<Value = Vec<String>> {
    prop::collection::vec(0u32..40, 0..max).prop_map(|v| {
        let mut seen = HashSet::new();
        v.into_iter()
            .filter(|n| seen.insert(*n))
            .map(|n| format!("doc{n}"))
            .collect()
    })
}

fn arb_weights() -> impl Strategy<Value = FusionWeights> {
    (1u32..200, 0.0f64..1.0, 0.0f64..1.0)
        .prop_filter("one weight positive", |(_, a, b)| a + b > 1e-6)
        .prop_map(|(k, a, b)| FusionWeights::new(k, a, b).unwrap())
}

// ────────────────────────────────────────────────────────────────────
// Output shape
// ────────────────────────────────────────────────────────────────────

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    #[test]
    fn prop_output_is_union(lex in arb_ids(25), sem in arb_ids(25), w in arb_weights()) {
        let engine = FusionEngine::new(w).unwrap();
        let out = engine.fuse(&RankInput::from(lex.clone()), &RankInput::from(sem.clone()), None);
        let expected: HashSet<&str> = lex.iter().chain(&sem).map(String::as_str).collect();
        let got: HashSet<&str> = out.iter().map(|p| p.id.as_str()).collect();
        prop_assert_eq!(out.len(), got.len(), "duplicate ids in output");
        prop_assert_eq!(got, expected);
    }

    #[test]
    fn prop_scores_sorted_and_finite(lex in arb_ids(25), sem in arb_ids(25), w in arb_weights()) {
        let engine = FusionEngine::new(w).unwrap();
        let out = engine.fuse(&RankInput::from(lex), &RankInput::from(sem), None);
        for p in &out {
            prop_assert!(p.score.is_finite() && p.score >= 0.0);
        }
        for pair in out.windows(2) {
            let (a, b) = (&pair[0], &pair[1]);
            prop_assert!(
                a.score > b.score || (a.score == b.score && a.id < b.id),
                "{:?} before {:?}", a, b
            );
        }
    }

    #[test]
    fn prop_limit_is_prefix(lex in arb_ids(25), sem in arb_ids(25), limit in 0usize..30) {
        let engine = FusionEngine::default();
        let lex = RankInput::from(lex);
        let sem = RankInput::from(sem);
        let full = engine.fuse(&lex, &sem, None);
        let limited = engine.fuse(&lex, &sem, Some(limit));
        prop_assert_eq!(limited.len(), limit.min(full.len()));
        prop_assert_eq!(&full[..limited.len()], &limited[..]);
    }

    #[test]
    fn prop_deterministic(lex in arb_ids(25), sem in arb_ids(25), w in arb_weights()) {
        let engine = FusionEngine::new(w).unwrap();
        let lex = RankInput::from(lex);
        let sem = RankInput::from(sem);
        prop_assert_eq!(engine.fuse(&lex, &sem, None), engine.fuse(&lex, &sem, None));
    }
}

// ────────────────────────────────────────────────────────────────────
// Weight symmetry
// ────────────────────────────────────────────────────────────────────

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    #[test]
    fn prop_swap_lists_and_weights(lex in arb_ids(20), sem in arb_ids(20), k in 1u32..100, a in 0.01f64..1.0, b in 0.01f64..1.0) {
        let lex = RankInput::from(lex);
        let sem = RankInput::from(sem);
        let forward = fuse(&lex, &sem, k, a, b, None).unwrap();
        let swapped = fuse(&sem, &lex, k, b, a, None).unwrap();
        prop_assert_eq!(forward.len(), swapped.len());
        for (x, y) in forward.iter().zip(&swapped) {
            prop_assert_eq!(&x.id, &y.id);
            prop_assert!((x.score - y.score).abs() < 1e-12);
        }
    }

    #[test]
    fn prop_both_lists_beats_one(rank in 0usize..10, k in 1u32..100) {
        let ids: Vec<String> = (0..10).map(|i| format!("d{i}")).collect();
        let lex = RankInput::from(ids.clone());
        let mut sem_ids = vec![ids[rank].clone()];
        sem_ids.extend((0..5).map(|i| format!("only_sem{i}")));
        let sem = RankInput::from(sem_ids);
        let out = fuse(&lex, &sem, k, 0.5, 0.5, None).unwrap();
        prop_assert_eq!(out[0].id.as_str(), ids[rank].as_str());
    }

    #[test]
    fn prop_negative_weight_rejected(a in -10.0f64..-0.001) {
        prop_assert!(FusionWeights::new(60, a, 0.5).is_err());
        prop_assert!(FusionWeights::new(60, 0.5, a).is_err());
    }
}
