//! Cheap lexical reranker.
//!
//! `heuristic(q, d) = overlap(q, d) + 0.2 * phrase(q, d) + 0.1 * code(q, d)`
//! where `overlap` is the share of query terms present in the document,
//! `phrase` fires when a multi-word query appears verbatim and `code` fires
//! for a technical query against a document carrying code markers. The
//! ranking score blends it with the min-max normalized fused score.

use std::sync::LazyLock;

use regex::Regex;

use crate::candidate::{Candidate, TextField};
use crate::text::{min_max_normalize, term_set};

const PHRASE_BONUS: f64 = 0.2;
const CODE_BONUS: f64 = 0.1;

static TECHNICAL_QUERY_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)(\b(error|exception|function|method|class|struct|trait|api|stacktrace|stack trace|traceback|compile|syntax|null|undefined|panic|segfault|config)\b|[a-z_]\w*\(\)|::|->|\b[a-z]+_[a-z_]+\b)",
    )
    .expect("technical query pattern")
});

static CODE_MARKER_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(```|\bfn\s+\w+|\bdef\s+\w+|\bclass\s+\w+|\bimport\s+\w+|#include|=>|\w+\([^)]*\)\s*[;{]|\{\s*$|^\s*\}|;\s*$)")
        .expect("code marker pattern")
});

#[derive(Debug, Clone, Copy, Default)]
pub struct HeuristicScorer;

impl HeuristicScorer {
    /// Query-document score in [0, 1.3].
    #[must_use]
    pub fn score(&self, query: &str, doc: &str) -> f64 {
        let query_terms = term_set(query);
        if query_terms.is_empty() {
            return 0.0;
        }
        let doc_terms = term_set(doc);
        let overlap = query_terms.intersection(&doc_terms).count() as f64 / query_terms.len() as f64;

        let mut score = overlap;
        if query_terms.len() >= 2 && contains_phrase(query, doc) {
            score += PHRASE_BONUS;
        }
        if looks_technical(query) && has_code_markers(doc) {
            score += CODE_BONUS;
        }
        score
    }
}

fn collapse_whitespace(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ").to_lowercase()
}

fn contains_phrase(query: &str, doc: &str) -> bool {
    let phrase = collapse_whitespace(query);
    !phrase.is_empty() && collapse_whitespace(doc).contains(&phrase)
}

#[must_use]
pub fn looks_technical(query: &str) -> bool {
    TECHNICAL_QUERY_RE.is_match(query)
}

#[must_use]
pub fn has_code_markers(doc: &str) -> bool {
    doc.lines().any(|line| CODE_MARKER_RE.is_match(line))
}

/// Blends heuristic relevance with the incoming fused score.
#[derive(Debug, Clone)]
pub struct HeuristicReranker {
    alpha: f64,
    top_m: usize,
    scorer: HeuristicScorer,
}

impl Default for HeuristicReranker {
    fn default() -> Self {
        Self::new(0.6, 50)
    }
}

impl HeuristicReranker {
    /// `alpha` is clamped to [0, 1]; `top_m` to at least 1.
    #[must_use]
    pub fn new(alpha: f64, top_m: usize) -> Self {
        let alpha = if alpha.is_finite() { alpha.clamp(0.0, 1.0) } else { 0.6 };
        Self {
            alpha,
            top_m: top_m.max(1),
            scorer: HeuristicScorer,
        }
    }

    pub fn alpha(&self) -> f64 {
        self.alpha
    }

    pub fn scorer(&self) -> &HeuristicScorer {
        &self.scorer
    }

    /// Rerank the first `top_m` candidates by
    /// `alpha * heuristic + (1 - alpha) * minmax(fused)`; the tail keeps its
    /// order behind them.
    ///
    /// Returned scores never increase along the output order: the tail is
    /// spread by rank over `[0, head_min)`, below the last blended head score.
    pub fn rerank(&self, query: &str, candidates: Vec<Candidate>, text_field: &TextField) -> (Vec<Candidate>, Vec<f64>) {
        let mut candidates = candidates;
        let split = self.top_m.min(candidates.len());
        let tail = candidates.split_off(split);
        let head = candidates;

        let fused: Vec<f64> = head.iter().map(|c| c.score).collect();
        let normalized = min_max_normalize(&fused);

        let mut scored: Vec<(usize, f64, Candidate)> = head
            .into_iter()
            .zip(normalized)
            .enumerate()
            .map(|(i, (mut c, norm))| {
                let heuristic = self.scorer.score(query, c.field_text(text_field));
                let blended = self.alpha * heuristic + (1.0 - self.alpha) * norm;
                c.annotate("heuristic_score", heuristic);
                c.annotate("fused_score", c.score);
                c.annotate("rerank_stage", "heuristic");
                (i, blended, c)
            })
            .collect();
        scored.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));

        let mut scores = Vec::with_capacity(scored.len() + tail.len());
        let mut out = Vec::with_capacity(scored.len() + tail.len());
        for (_, blended, mut c) in scored {
            c.score = blended;
            scores.push(blended);
            out.push(c);
        }
        let head_min = scores.last().copied().unwrap_or(1.0).max(0.0);
        let steps = (tail.len() + 1) as f64;
        for (rank, mut c) in tail.into_iter().enumerate() {
            let below = head_min * (steps - 1.0 - rank as f64) / steps;
            c.annotate("fused_score", c.score);
            c.score = below;
            scores.push(below);
            out.push(c);
        }
        (out, scores)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overlap_ratio() {
        let s = HeuristicScorer.score("rust async runtime", "a runtime for async code");
        assert!((s - 2.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn phrase_bonus_applies_to_multi_word_queries() {
        let s = HeuristicScorer.score("circuit breaker", "The Circuit  Breaker opens after failures");
        assert!((s - 1.2).abs() < 1e-9);
        let single = HeuristicScorer.score("breaker", "the breaker opens");
        assert!((single - 1.0).abs() < 1e-9);
    }

    #[test]
    fn code_bonus_needs_technical_query_and_code() {
        let doc = "Use this:\nfn parse_config(path: &Path) {\n    todo\n}";
        let s = HeuristicScorer.score("parse_config error", doc);
        // "parse_config" and "error": one of two terms present, plus code bonus.
        assert!((s - 0.6).abs() < 1e-9, "score {s}");
        let plain = HeuristicScorer.score("holiday schedule", doc);
        assert_eq!(plain, 0.0);
    }

    #[test]
    fn empty_query_scores_zero() {
        assert_eq!(HeuristicScorer.score("", "anything"), 0.0);
    }

    #[test]
    fn blends_with_fused_scores() {
        let reranker = HeuristicReranker::new(1.0, 10);
        let candidates = vec![
            Candidate::new("fused_top", 0.9, "unrelated text"),
            Candidate::new("lexical_match", 0.1, "tokio runtime tuning"),
        ];
        let (out, scores) = reranker.rerank("tokio runtime", candidates, &TextField::Body);
        assert_eq!(out[0].id, "lexical_match");
        assert!(scores[0] >= scores[1]);
        assert!(out[0].metadata.contains_key("heuristic_score"));

        let reranker = HeuristicReranker::new(0.0, 10);
        let candidates = vec![
            Candidate::new("fused_top", 0.9, "unrelated text"),
            Candidate::new("lexical_match", 0.1, "tokio runtime tuning"),
        ];
        let (out, _) = reranker.rerank("tokio runtime", candidates, &TextField::Body);
        assert_eq!(out[0].id, "fused_top");
    }

    #[test]
    fn alpha_is_clamped() {
        assert_eq!(HeuristicReranker::new(3.0, 1).alpha(), 1.0);
        assert_eq!(HeuristicReranker::new(-1.0, 1).alpha(), 0.0);
    }

    #[test]
    fn tail_beyond_top_m_keeps_order() {
        let reranker = HeuristicReranker::new(1.0, 1);
        let candidates = vec![
            Candidate::new("a", 0.9, "x"),
            Candidate::new("b", 0.5, "query words"),
            Candidate::new("c", 0.4, "query words"),
        ];
        let (out, scores) = reranker.rerank("query words", candidates, &TextField::Body);
        let ids: Vec<&str> = out.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
        assert_eq!(scores.len(), 3);
    }

    #[test]
    fn scores_never_increase_past_top_m() {
        let reranker = HeuristicReranker::new(0.6, 1);
        let candidates = vec![
            Candidate::new("a", 0.9, "alpha"),
            Candidate::new("b", 0.5, "beta"),
            Candidate::new("c", 0.4, "gamma"),
        ];
        let (out, scores) = reranker.rerank("unrelated query", candidates, &TextField::Body);
        let ids: Vec<&str> = out.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
        assert!(scores.windows(2).all(|w| w[0] > w[1]), "{scores:?}");
        assert!(scores.iter().all(|s| *s >= 0.0));
        assert_eq!(out[1].metadata.get("fused_score"), Some(&crate::candidate::MetaValue::Float(0.5)));
    }
}
