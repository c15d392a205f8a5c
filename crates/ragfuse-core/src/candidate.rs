//! Candidate records and the input shapes accepted from search backends.

use std::borrow::Cow;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;

use serde::{Deserialize, Serialize};

/// Scalar metadata value. Kept JSON-compatible so enhancement metadata can be
/// serialized without conversion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetaValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

impl MetaValue {
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Numeric view of the value; strings are not coerced.
    #[must_use]
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Int(i) => Some(*i as f64),
            Self::Float(f) => Some(*f),
            _ => None,
        }
    }
}

impl fmt::Display for MetaValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => write!(f, "null"),
            Self::Bool(b) => write!(f, "{b}"),
            Self::Int(i) => write!(f, "{i}"),
            Self::Float(x) => write!(f, "{x}"),
            Self::Str(s) => write!(f, "{s}"),
        }
    }
}

impl From<&str> for MetaValue {
    fn from(value: &str) -> Self {
        Self::Str(value.to_string())
    }
}

impl From<String> for MetaValue {
    fn from(value: String) -> Self {
        Self::Str(value)
    }
}

impl From<f64> for MetaValue {
    fn from(value: f64) -> Self {
        if value.is_finite() {
            Self::Float(value)
        } else {
            Self::Null
        }
    }
}

impl From<i64> for MetaValue {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<usize> for MetaValue {
    fn from(value: usize) -> Self {
        Self::Int(i64::try_from(value).unwrap_or(i64::MAX))
    }
}

impl From<bool> for MetaValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

/// Ordered metadata map; ordering keeps serialized output stable.
pub type Metadata = BTreeMap<String, MetaValue>;

/// A retrieval candidate flowing through the pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    pub id: String,
    /// Opaque ranking signal; not bounded before normalization.
    pub score: f64,
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
    #[serde(default)]
    pub metadata: Metadata,
}

impl Candidate {
    pub fn new(id: impl Into<String>, score: f64, text: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            score: finite_or_zero(score),
            text: text.into(),
            embedding: None,
            metadata: Metadata::new(),
        }
    }

    #[must_use]
    pub fn with_embedding(mut self, embedding: Vec<f32>) -> Self {
        self.embedding = Some(embedding);
        self
    }

    #[must_use]
    pub fn with_meta(mut self, key: impl Into<String>, value: impl Into<MetaValue>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Record a score-provenance value under `key`.
    pub fn annotate(&mut self, key: &str, value: impl Into<MetaValue>) {
        self.metadata.insert(key.to_string(), value.into());
    }

    /// Resolve the text selected by `field`, falling back to an empty string.
    #[must_use]
    pub fn field_text<'a>(&'a self, field: &TextField) -> &'a str {
        match field {
            TextField::Body => &self.text,
            TextField::Metadata(key) => self
                .metadata
                .get(key)
                .and_then(MetaValue::as_str)
                .unwrap_or(""),
        }
    }
}

/// Which text of a candidate a stage should read.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TextField {
    #[default]
    Body,
    Metadata(String),
}

/// Canonical `(id, score)` exchange type. The score is always finite.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankedPair {
    pub id: String,
    pub score: f64,
}

impl RankedPair {
    /// Build a pair, mapping NaN/infinite scores to 0.0.
    pub fn new(id: impl Into<String>, score: f64) -> Self {
        Self {
            id: id.into(),
            score: finite_or_zero(score),
        }
    }
}

impl<S: Into<String>> From<(S, f64)> for RankedPair {
    fn from((id, score): (S, f64)) -> Self {
        Self::new(id, score)
    }
}

pub(crate) fn finite_or_zero(x: f64) -> f64 {
    if x.is_finite() { x } else { 0.0 }
}

/// A raw candidate list as produced by a search backend.
#[derive(Debug, Clone, PartialEq)]
pub enum RankInput {
    /// Already-ranked id sequence (best first). Carries no scores.
    Ids(Vec<String>),
    /// `(id, score)` pairs in any order.
    Pairs(Vec<(String, f64)>),
    /// id → score mapping.
    Map(HashMap<String, f64>),
}

impl RankInput {
    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            Self::Ids(ids) => ids.len(),
            Self::Pairs(pairs) => pairs.len(),
            Self::Map(map) => map.len(),
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether the input carries backend scores (score floors apply).
    #[must_use]
    pub fn is_scored(&self) -> bool {
        !matches!(self, Self::Ids(_))
    }

    /// Normalize into a best-first list of pairs.
    ///
    /// Id sequences keep their order and get a descending synthetic score of
    /// `1 / rank`. Pairs and maps are sorted by score descending; ties keep
    /// input order for pairs and fall back to id order for maps. Duplicate
    /// ids keep their best-ranked occurrence.
    #[must_use]
    pub fn to_ranked(&self) -> Vec<RankedPair> {
        let mut ranked: Vec<RankedPair> = match self {
            Self::Ids(ids) => ids
                .iter()
                .enumerate()
                .map(|(i, id)| RankedPair::new(id.clone(), 1.0 / (i as f64 + 1.0)))
                .collect(),
            Self::Pairs(pairs) => {
                let mut v: Vec<RankedPair> = pairs
                    .iter()
                    .map(|(id, s)| RankedPair {
                        id: id.clone(),
                        score: if s.is_nan() { f64::NEG_INFINITY } else { *s },
                    })
                    .collect();
                v.sort_by(|a, b| b.score.total_cmp(&a.score));
                v
            }
            Self::Map(map) => {
                let mut v: Vec<RankedPair> = map
                    .iter()
                    .map(|(id, s)| RankedPair {
                        id: id.clone(),
                        score: if s.is_nan() { f64::NEG_INFINITY } else { *s },
                    })
                    .collect();
                v.sort_by(|a, b| b.score.total_cmp(&a.score).then_with(|| a.id.cmp(&b.id)));
                v
            }
        };

        let mut seen = HashSet::with_capacity(ranked.len());
        ranked.retain(|p| seen.insert(p.id.clone()));
        for pair in &mut ranked {
            pair.score = finite_or_zero(pair.score);
        }
        ranked
    }

    /// Keep only ids in `keep`, preserving the variant and order.
    #[must_use]
    pub fn retain_ids(&self, keep: &HashSet<String>) -> Self {
        match self {
            Self::Ids(ids) => Self::Ids(ids.iter().filter(|id| keep.contains(*id)).cloned().collect()),
            Self::Pairs(pairs) => Self::Pairs(
                pairs
                    .iter()
                    .filter(|(id, _)| keep.contains(id))
                    .cloned()
                    .collect(),
            ),
            Self::Map(map) => Self::Map(
                map.iter()
                    .filter(|(id, _)| keep.contains(*id))
                    .map(|(id, s)| (id.clone(), *s))
                    .collect(),
            ),
        }
    }

    /// 1-indexed rank per id.
    #[must_use]
    pub fn rank_map(&self) -> HashMap<String, usize> {
        self.to_ranked()
            .into_iter()
            .enumerate()
            .map(|(i, p)| (p.id, i + 1))
            .collect()
    }
}

impl From<Vec<String>> for RankInput {
    fn from(ids: Vec<String>) -> Self {
        Self::Ids(ids)
    }
}

impl From<Vec<&str>> for RankInput {
    fn from(ids: Vec<&str>) -> Self {
        Self::Ids(ids.into_iter().map(str::to_string).collect())
    }
}

impl From<Vec<(String, f64)>> for RankInput {
    fn from(pairs: Vec<(String, f64)>) -> Self {
        Self::Pairs(pairs)
    }
}

impl From<Vec<(&str, f64)>> for RankInput {
    fn from(pairs: Vec<(&str, f64)>) -> Self {
        Self::Pairs(pairs.into_iter().map(|(id, s)| (id.to_string(), s)).collect())
    }
}

impl From<Vec<RankedPair>> for RankInput {
    fn from(pairs: Vec<RankedPair>) -> Self {
        Self::Pairs(pairs.into_iter().map(|p| (p.id, p.score)).collect())
    }
}

impl From<HashMap<String, f64>> for RankInput {
    fn from(map: HashMap<String, f64>) -> Self {
        Self::Map(map)
    }
}

/// A stored document as returned by a [`DocumentLookup`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
    #[serde(default)]
    pub metadata: Metadata,
}

impl Document {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Self::default()
        }
    }
}

/// Document text store consulted by the pipeline (id → text).
///
/// Only `text` is required; embeddings and metadata enable MMR diversity,
/// freshness and per-file capping when the store can provide them.
pub trait DocumentLookup: Send + Sync {
    fn text(&self, id: &str) -> Option<Cow<'_, str>>;

    fn embedding(&self, _id: &str) -> Option<Vec<f32>> {
        None
    }

    fn metadata(&self, _id: &str) -> Metadata {
        Metadata::new()
    }
}

impl DocumentLookup for HashMap<String, String> {
    fn text(&self, id: &str) -> Option<Cow<'_, str>> {
        self.get(id).map(|s| Cow::Borrowed(s.as_str()))
    }
}

impl DocumentLookup for HashMap<String, Document> {
    fn text(&self, id: &str) -> Option<Cow<'_, str>> {
        self.get(id).map(|d| Cow::Borrowed(d.text.as_str()))
    }

    fn embedding(&self, id: &str) -> Option<Vec<f32>> {
        self.get(id).and_then(|d| d.embedding.clone())
    }

    fn metadata(&self, id: &str) -> Metadata {
        self.get(id).map(|d| d.metadata.clone()).unwrap_or_default()
    }
}

/// Adapts a closure `Fn(&str) -> Option<String>` into a [`DocumentLookup`].
pub struct FnLookup<F>(pub F);

impl<F> DocumentLookup for FnLookup<F>
where
    F: Fn(&str) -> Option<String> + Send + Sync,
{
    fn text(&self, id: &str) -> Option<Cow<'_, str>> {
        (self.0)(id).map(Cow::Owned)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ranked_pair_sanitizes_non_finite() {
        assert_eq!(RankedPair::new("a", f64::NAN).score, 0.0);
        assert_eq!(RankedPair::new("a", f64::INFINITY).score, 0.0);
        assert_eq!(RankedPair::new("a", 0.25).score, 0.25);
    }

    #[test]
    fn ids_keep_order() {
        let input = RankInput::from(vec!["c", "a", "b"]);
        let ranks = input.rank_map();
        assert_eq!(ranks["c"], 1);
        assert_eq!(ranks["a"], 2);
        assert_eq!(ranks["b"], 3);
        assert!(!input.is_scored());
    }

    #[test]
    fn pairs_sorted_by_score() {
        let input = RankInput::from(vec![("a", 0.1), ("b", 0.9), ("c", 0.5)]);
        let ranked = input.to_ranked();
        let ids: Vec<&str> = ranked.iter().map(|p| p.id.as_str()).collect();
        assert_eq!(ids, vec!["b", "c", "a"]);
    }

    #[test]
    fn map_ties_break_by_id() {
        let mut map = HashMap::new();
        map.insert("z".to_string(), 0.5);
        map.insert("a".to_string(), 0.5);
        map.insert("m".to_string(), 0.9);
        let ranked = RankInput::from(map).to_ranked();
        let ids: Vec<&str> = ranked.iter().map(|p| p.id.as_str()).collect();
        assert_eq!(ids, vec!["m", "a", "z"]);
    }

    #[test]
    fn duplicate_ids_keep_best_rank() {
        let input = RankInput::from(vec![("a", 0.2), ("a", 0.8), ("b", 0.5)]);
        let ranked = input.to_ranked();
        assert_eq!(ranked.len(), 2);
        assert_eq!(ranked[0].id, "a");
        assert!((ranked[0].score - 0.8).abs() < f64::EPSILON);
    }

    #[test]
    fn nan_scores_rank_last() {
        let input = RankInput::from(vec![("a", f64::NAN), ("b", 0.1)]);
        let ranked = input.to_ranked();
        assert_eq!(ranked[0].id, "b");
        assert_eq!(ranked[1].score, 0.0);
    }

    #[test]
    fn field_text_reads_metadata() {
        let c = Candidate::new("1", 0.5, "body").with_meta("title", "Heading");
        assert_eq!(c.field_text(&TextField::Body), "body");
        assert_eq!(c.field_text(&TextField::Metadata("title".into())), "Heading");
        assert_eq!(c.field_text(&TextField::Metadata("missing".into())), "");
    }

    #[test]
    fn meta_value_untagged_serde() {
        let mut meta = Metadata::new();
        meta.insert("n".into(), MetaValue::Int(3));
        meta.insert("s".into(), MetaValue::from("x"));
        meta.insert("z".into(), MetaValue::Null);
        let json = serde_json::to_string(&meta).unwrap();
        assert_eq!(json, r#"{"n":3,"s":"x","z":null}"#);
    }

    #[test]
    fn fn_lookup_wraps_closure() {
        let lookup = FnLookup(|id: &str| (id == "a").then(|| "alpha".to_string()));
        assert_eq!(lookup.text("a").as_deref(), Some("alpha"));
        assert!(lookup.text("b").is_none());
        assert!(lookup.metadata("a").is_empty());
    }
}
