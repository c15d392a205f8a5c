//! Query intent classification and route selection.
//!
//! Four pattern families each score the fraction of their patterns a query
//! matches. The weighted sum (clamped to 1) is the structured-intent
//! confidence:
//!
//! | family     | weight |
//! |------------|--------|
//! | lookup     | 0.6    |
//! | identifier | 0.4    |
//! | temporal   | 0.3    |
//! | metric     | 0.4    |
//!
//! `confidence >= 0.5` is structured, `>= 0.2` hybrid, otherwise text RAG.
//! Classification is a pure function of the query, request id and config.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::ConfigError;

const STRUCTURED_THRESHOLD: f64 = 0.5;
const HYBRID_THRESHOLD: f64 = 0.2;

const LOOKUP_WEIGHT: f64 = 0.6;
const IDENTIFIER_WEIGHT: f64 = 0.4;
const TEMPORAL_WEIGHT: f64 = 0.3;
const METRIC_WEIGHT: f64 = 0.4;

fn compile(patterns: &[&str]) -> Vec<Regex> {
    patterns
        .iter()
        .map(|p| Regex::new(p).expect("intent pattern"))
        .collect()
}

static LOOKUP_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    compile(&[
        r"(?i)\b(how many|count|total|sum|average|avg|number of)\b",
        r"(?i)\b(list|show|find|get|lookup|look up|fetch)\b.*\b(all|records?|rows?|entries|orders?|users?|customers?|accounts?|tickets?|invoices?)\b",
        r"(?i)\b(group(ed)? by|per|top \d+|maximum|minimum|max|min)\b",
    ])
});

static IDENTIFIER_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    compile(&[
        r"(?i)\b(id|uuid|sku|ticket|order|invoice|account|customer|user)\s*(#|no\.?|number|id)?\s*[:=#]?\s*[a-z0-9-]*\d[a-z0-9-]*\b",
        r"(?i)\b[a-z]{2,10}-\d{2,}\b",
        r"(?i)\b[0-9a-f]{8}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{12}\b",
    ])
});

static TEMPORAL_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    compile(&[
        r"\b\d{4}-\d{2}(-\d{2})?\b",
        r"(?i)\b(yesterday|today|last (day|week|month|quarter|year)|this (week|month|quarter|year)|since|between|before|after)\b",
        r"(?i)\b(q[1-4]|jan(uary)?|feb(ruary)?|mar(ch)?|apr(il)?|june?|july?|aug(ust)?|sep(tember)?|oct(ober)?|nov(ember)?|dec(ember)?)\b",
    ])
});

static METRIC_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    compile(&[
        r"(?i)\b(revenue|sales|latency|throughput|error rate|cpu|memory|usage|conversion|churn|growth|kpi|metrics?|p50|p95|p99)\b",
        r"(?i)\b\d+(\.\d+)?\s*(%|percent\b|ms\b|gb\b|mb\b)",
        r"(?i)\b(trend|trends|compare|comparison|breakdown|distribution|ratio|rate)\b",
    ])
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntentType {
    Structured,
    TextRag,
    Hybrid,
}

impl fmt::Display for IntentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Structured => write!(f, "structured"),
            Self::TextRag => write!(f, "text_rag"),
            Self::Hybrid => write!(f, "hybrid"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RouteTarget {
    Sql,
    Kg,
    Rag,
    Hybrid,
}

impl fmt::Display for RouteTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sql => write!(f, "sql"),
            Self::Kg => write!(f, "kg"),
            Self::Rag => write!(f, "rag"),
            Self::Hybrid => write!(f, "hybrid"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntentClassification {
    pub intent_type: IntentType,
    pub confidence: f64,
    pub reasoning: String,
    pub route_target: RouteTarget,
    /// Extracted spans keyed by kind: `identifiers`, `dates`, `metrics`,
    /// `aggregations`. Kinds with no matches are absent.
    pub structured_fields: BTreeMap<String, Vec<String>>,
    pub should_short_circuit: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct IntentConfig {
    pub enabled: bool,
    /// Allow short-circuiting to a structured backend.
    pub enable_structured_routing: bool,
    pub short_circuit_threshold: f64,
    /// Minimum target score for a single backend to win over `hybrid`.
    pub route_dominance_threshold: f64,
    pub canary_enabled: bool,
    /// Percentage of request ids (0-100) admitted to short-circuiting.
    pub canary_sample_pct: f64,
    pub canary_salt: String,
}

impl Default for IntentConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            enable_structured_routing: false,
            short_circuit_threshold: 0.7,
            route_dominance_threshold: 0.8,
            canary_enabled: false,
            canary_sample_pct: 0.0,
            canary_salt: "ragfuse-intent".to_string(),
        }
    }
}

impl IntentConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(0.0..=1.0).contains(&self.short_circuit_threshold) {
            return Err(ConfigError::invalid(
                "intent.short_circuit_threshold",
                "must be within [0, 1]",
            ));
        }
        if !(0.0..=1.0).contains(&self.route_dominance_threshold) {
            return Err(ConfigError::invalid(
                "intent.route_dominance_threshold",
                "must be within [0, 1]",
            ));
        }
        if !(0.0..=100.0).contains(&self.canary_sample_pct) {
            return Err(ConfigError::invalid(
                "intent.canary_sample_pct",
                "must be within [0, 100]",
            ));
        }
        Ok(())
    }
}

/// Per-family fraction of matched patterns.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct FamilyScores {
    pub lookup: f64,
    pub identifier: f64,
    pub temporal: f64,
    pub metric: f64,
}

impl FamilyScores {
    #[must_use]
    pub fn of(query: &str) -> Self {
        Self {
            lookup: fraction_matched(&LOOKUP_PATTERNS, query),
            identifier: fraction_matched(&IDENTIFIER_PATTERNS, query),
            temporal: fraction_matched(&TEMPORAL_PATTERNS, query),
            metric: fraction_matched(&METRIC_PATTERNS, query),
        }
    }

    #[must_use]
    pub fn confidence(&self) -> f64 {
        (self.lookup * LOOKUP_WEIGHT
            + self.identifier * IDENTIFIER_WEIGHT
            + self.temporal * TEMPORAL_WEIGHT
            + self.metric * METRIC_WEIGHT)
            .clamp(0.0, 1.0)
    }
}

fn fraction_matched(patterns: &[Regex], query: &str) -> f64 {
    if patterns.is_empty() {
        return 0.0;
    }
    let hits = patterns.iter().filter(|p| p.is_match(query)).count();
    hits as f64 / patterns.len() as f64
}

fn matches_of(patterns: &[Regex], query: &str) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for pattern in patterns {
        for m in pattern.find_iter(query) {
            let text = m.as_str().trim().to_string();
            if !text.is_empty() && !out.contains(&text) {
                out.push(text);
            }
        }
    }
    out
}

fn structured_fields(query: &str) -> BTreeMap<String, Vec<String>> {
    let mut fields = BTreeMap::new();
    let kinds: [(&str, &[Regex]); 4] = [
        ("identifiers", IDENTIFIER_PATTERNS.as_slice()),
        ("dates", &TEMPORAL_PATTERNS[..1]),
        ("metrics", &METRIC_PATTERNS[..1]),
        ("aggregations", &LOOKUP_PATTERNS[..1]),
    ];
    for (kind, patterns) in kinds {
        let found = matches_of(patterns, query);
        if !found.is_empty() {
            fields.insert(kind.to_string(), found);
        }
    }
    fields
}

const SQL_KEYWORDS: &[&str] = &[
    "how many", "count", "sum", "total", "average", "avg", "group by", "per", "table", "rows",
    "records", "orders", "revenue", "sales", "top",
];
const KG_KEYWORDS: &[&str] = &[
    "related", "relationship", "relationships", "connected", "depends on", "dependency",
    "dependencies", "linked", "owner", "owns", "graph", "path between", "upstream", "downstream",
    "neighbors",
];
const RAG_KEYWORDS: &[&str] = &[
    "how", "why", "explain", "what is", "describe", "guide", "documentation", "docs", "example",
    "tutorial", "best practice",
];

/// Scores sql/kg/rag targets from keywords and family scores.
#[derive(Debug, Clone)]
pub struct RouteTargetSelector {
    dominance_threshold: f64,
}

impl Default for RouteTargetSelector {
    fn default() -> Self {
        Self {
            dominance_threshold: 0.8,
        }
    }
}

impl RouteTargetSelector {
    #[must_use]
    pub fn new(dominance_threshold: f64) -> Self {
        Self {
            dominance_threshold,
        }
    }

    /// `(sql, kg, rag)` scores, each in [0, 1].
    #[must_use]
    pub fn scores(&self, query: &str, families: &FamilyScores, confidence: f64) -> (f64, f64, f64) {
        let normalized = normalize_for_keywords(query);
        let hits = |keywords: &[&str]| {
            keywords
                .iter()
                .filter(|kw| normalized.contains(&format!(" {kw} ")))
                .count() as f64
        };

        let sql = hits(SQL_KEYWORDS) * 0.2
            + families.lookup * 0.5
            + families.metric * 0.3
            + families.identifier * 0.2;
        let kg = hits(KG_KEYWORDS) * 0.25 + families.identifier * 0.2;
        let rag = hits(RAG_KEYWORDS) * 0.25 + (1.0 - confidence) * 0.5;

        (sql.clamp(0.0, 1.0), kg.clamp(0.0, 1.0), rag.clamp(0.0, 1.0))
    }

    /// Highest scoring target, or `Hybrid` when none reaches the dominance
    /// threshold. Ties prefer sql, then kg, then rag.
    #[must_use]
    pub fn select(&self, query: &str, families: &FamilyScores, confidence: f64) -> RouteTarget {
        let (sql, kg, rag) = self.scores(query, families, confidence);
        let mut best = (RouteTarget::Sql, sql);
        for (target, score) in [(RouteTarget::Kg, kg), (RouteTarget::Rag, rag)] {
            if score > best.1 {
                best = (target, score);
            }
        }
        if best.1 < self.dominance_threshold {
            RouteTarget::Hybrid
        } else {
            best.0
        }
    }
}

fn normalize_for_keywords(query: &str) -> String {
    let words: Vec<String> = query
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(str::to_lowercase)
        .collect();
    format!(" {} ", words.join(" "))
}

/// Stable bucket in [0, 100) for canary sampling.
fn canary_bucket(salt: &str, request_id: &str) -> f64 {
    let mut hasher = Sha256::new();
    hasher.update(salt.as_bytes());
    hasher.update(b":");
    hasher.update(request_id.as_bytes());
    let digest = hasher.finalize();
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest[..8]);
    (u64::from_be_bytes(prefix) % 10_000) as f64 / 100.0
}

#[derive(Debug, Clone, Default)]
pub struct IntentRouter {
    config: IntentConfig,
    selector: RouteTargetSelector,
}

impl IntentRouter {
    pub fn new(config: IntentConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let selector = RouteTargetSelector::new(config.route_dominance_threshold);
        Ok(Self { config, selector })
    }

    pub fn config(&self) -> &IntentConfig {
        &self.config
    }

    pub fn classify(&self, query: &str, request_id: Option<&str>) -> IntentClassification {
        let families = FamilyScores::of(query);
        let confidence = families.confidence();
        let intent_type = if confidence >= STRUCTURED_THRESHOLD {
            IntentType::Structured
        } else if confidence >= HYBRID_THRESHOLD {
            IntentType::Hybrid
        } else {
            IntentType::TextRag
        };
        let route_target = self.selector.select(query, &families, confidence);

        let eligible = self.config.enable_structured_routing
            && intent_type == IntentType::Structured
            && confidence >= self.config.short_circuit_threshold
            && matches!(route_target, RouteTarget::Sql | RouteTarget::Kg);
        let should_short_circuit = eligible && self.canary_admits(request_id);

        let reasoning = format!(
            "lookup={:.2} identifier={:.2} temporal={:.2} metric={:.2} -> {} ({:.2}), target {}",
            families.lookup,
            families.identifier,
            families.temporal,
            families.metric,
            intent_type,
            confidence,
            route_target
        );

        IntentClassification {
            intent_type,
            confidence,
            reasoning,
            route_target,
            structured_fields: structured_fields(query),
            should_short_circuit,
        }
    }

    /// Whether `request_id` falls inside the canary sample. Always true when
    /// the canary gate is off; never true for a missing id when it is on.
    #[must_use]
    pub fn canary_admits(&self, request_id: Option<&str>) -> bool {
        if !self.config.canary_enabled {
            return true;
        }
        match request_id {
            Some(id) => canary_bucket(&self.config.canary_salt, id) < self.config.canary_sample_pct,
            None => false,
        }
    }
}
