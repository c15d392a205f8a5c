//! Freshness-aware score adjustment.
//!
//! [`FreshnessDetector`] decides whether a query cares about recency. When it
//! does, [`FreshnessEnhancer`] multiplies each result's score by an
//! exponential half-life decay (floored) and a linear recency boost for
//! documents younger than the recency threshold, then re-sorts.
//!
//! Detector weights: any recency keyword 0.6 (+0.1 per additional keyword),
//! a date 0.4, a time-sensitive verb 0.3, a comparison word 0.2; the sum is
//! clamped to 1.

use std::fmt;
use std::sync::LazyLock;

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::candidate::{Candidate, MetaValue, Metadata};
use crate::error::ConfigError;

static RECENCY_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(latest|newest|recent|recently|current|currently|up[- ]to[- ]date|today|this (week|month|year)|nowadays|right now)\b",
    )
    .expect("recency pattern")
});
static DATE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b((19|20)\d{2}(-\d{2}(-\d{2})?)?|(january|february|march|april|june|july|august|september|october|november|december)\s+\d{4})\b",
    )
    .expect("date pattern")
});
static TIME_VERB_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(changed|updated|released|announced|deprecated|launched|introduced|added|removed)\b")
        .expect("time verb pattern")
});
static COMPARISON_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(since|before|after|as of|compared to|versus|vs|newer than|older than)\b")
        .expect("comparison pattern")
});

const RECENCY_BASE: f64 = 0.6;
const RECENCY_EXTRA: f64 = 0.1;
const DATE_WEIGHT: f64 = 0.4;
const TIME_VERB_WEIGHT: f64 = 0.3;
const COMPARISON_WEIGHT: f64 = 0.2;

const SECONDS_PER_DAY: f64 = 86_400.0;
/// Numeric timestamps above this are taken as epoch milliseconds.
const EPOCH_MS_CUTOFF: f64 = 1e11;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FreshnessConfig {
    pub enabled: bool,
    pub enable_time_decay: bool,
    pub decay_half_life_days: f64,
    /// Lower bound of the decay multiplier.
    pub decay_floor: f64,
    pub enable_recency_prior: bool,
    pub recency_threshold_days: f64,
    /// Multiplier for a zero-age document; falls linearly to 1 at the threshold.
    pub recency_boost_factor: f64,
    pub sensitivity_threshold: f64,
    /// Metadata keys checked in order for a document timestamp.
    pub timestamp_fields: Vec<String>,
}

impl Default for FreshnessConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            enable_time_decay: true,
            decay_half_life_days: 30.0,
            decay_floor: 0.3,
            enable_recency_prior: true,
            recency_threshold_days: 7.0,
            recency_boost_factor: 1.2,
            sensitivity_threshold: 0.6,
            timestamp_fields: [
                "timestamp",
                "created_at",
                "updated_at",
                "published_at",
                "modified_at",
                "date",
            ]
            .into_iter()
            .map(String::from)
            .collect(),
        }
    }
}

impl FreshnessConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.decay_half_life_days.is_finite() || self.decay_half_life_days <= 0.0 {
            return Err(ConfigError::invalid("freshness.decay_half_life_days", "must be > 0"));
        }
        if !(0.0..=1.0).contains(&self.decay_floor) {
            return Err(ConfigError::invalid("freshness.decay_floor", "must be within [0, 1]"));
        }
        if !self.recency_threshold_days.is_finite() || self.recency_threshold_days < 0.0 {
            return Err(ConfigError::invalid(
                "freshness.recency_threshold_days",
                "must be finite and >= 0",
            ));
        }
        if !self.recency_boost_factor.is_finite() || self.recency_boost_factor < 1.0 {
            return Err(ConfigError::invalid("freshness.recency_boost_factor", "must be >= 1"));
        }
        if !(0.0..=1.0).contains(&self.sensitivity_threshold) {
            return Err(ConfigError::invalid(
                "freshness.sensitivity_threshold",
                "must be within [0, 1]",
            ));
        }
        Ok(())
    }
}

/// The detector's view of a query.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FreshnessSignals {
    pub recency_terms: Vec<String>,
    pub dates: Vec<String>,
    pub time_verbs: Vec<String>,
    pub comparisons: Vec<String>,
    pub confidence: f64,
    pub is_sensitive: bool,
}

#[derive(Debug, Clone)]
pub struct FreshnessDetector {
    threshold: f64,
}

impl Default for FreshnessDetector {
    fn default() -> Self {
        Self { threshold: 0.6 }
    }
}

fn found(re: &Regex, query: &str) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for m in re.find_iter(query) {
        let term = m.as_str().to_lowercase();
        if !out.contains(&term) {
            out.push(term);
        }
    }
    out
}

impl FreshnessDetector {
    #[must_use]
    pub fn new(threshold: f64) -> Self {
        Self { threshold }
    }

    #[must_use]
    pub fn detect(&self, query: &str) -> FreshnessSignals {
        let recency_terms = found(&RECENCY_RE, query);
        let dates = found(&DATE_RE, query);
        let time_verbs = found(&TIME_VERB_RE, query);
        let comparisons = found(&COMPARISON_RE, query);

        let mut confidence = 0.0;
        if !recency_terms.is_empty() {
            confidence += RECENCY_BASE + RECENCY_EXTRA * (recency_terms.len() - 1) as f64;
        }
        if !dates.is_empty() {
            confidence += DATE_WEIGHT;
        }
        if !time_verbs.is_empty() {
            confidence += TIME_VERB_WEIGHT;
        }
        if !comparisons.is_empty() {
            confidence += COMPARISON_WEIGHT;
        }
        let confidence: f64 = confidence.clamp(0.0, 1.0);

        FreshnessSignals {
            recency_terms,
            dates,
            time_verbs,
            comparisons,
            confidence,
            is_sensitive: confidence >= self.threshold,
        }
    }

    #[must_use]
    pub fn is_freshness_sensitive(&self, query: &str) -> bool {
        self.detect(query).is_sensitive
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Enhancement {
    TimeDecay,
    RecencyBoost,
}

impl fmt::Display for Enhancement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TimeDecay => write!(f, "time_decay"),
            Self::RecencyBoost => write!(f, "recency_boost"),
        }
    }
}

/// What the enhancer did for one query.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FreshnessMetadata {
    pub is_freshness_sensitive: bool,
    pub signals: FreshnessSignals,
    pub enhancements_applied: Vec<Enhancement>,
    pub documents_with_timestamp: usize,
    pub documents_without_timestamp: usize,
}

/// Read a timestamp from the first matching metadata key.
///
/// Numbers are epoch seconds, or milliseconds when larger than 1e11. Strings
/// may be RFC 3339, `YYYY-MM-DD HH:MM:SS`, `YYYY-MM-DDTHH:MM:SS`, `YYYY-MM-DD`
/// or a number.
#[must_use]
pub fn extract_timestamp(metadata: &Metadata, fields: &[String]) -> Option<DateTime<Utc>> {
    fields
        .iter()
        .filter_map(|key| metadata.get(key))
        .find_map(parse_timestamp)
}

fn parse_timestamp(value: &MetaValue) -> Option<DateTime<Utc>> {
    match value {
        MetaValue::Int(_) | MetaValue::Float(_) => value.as_f64().and_then(from_epoch),
        MetaValue::Str(s) => parse_timestamp_str(s.trim()),
        MetaValue::Null | MetaValue::Bool(_) => None,
    }
}

fn from_epoch(raw: f64) -> Option<DateTime<Utc>> {
    if !raw.is_finite() {
        return None;
    }
    let secs = if raw.abs() > EPOCH_MS_CUTOFF { raw / 1000.0 } else { raw };
    let whole = secs.trunc();
    let nanos = ((secs - whole) * 1e9).round().clamp(0.0, 999_999_999.0) as u32;
    DateTime::from_timestamp(whole as i64, nanos)
}

fn parse_timestamp_str(s: &str) -> Option<DateTime<Utc>> {
    if s.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    for fmt in ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(naive.and_utc());
        }
    }
    if let Ok(date) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
        return date.and_hms_opt(0, 0, 0).map(|naive| naive.and_utc());
    }
    s.parse::<f64>().ok().and_then(from_epoch)
}

#[derive(Debug, Clone, Default)]
pub struct FreshnessEnhancer {
    config: FreshnessConfig,
    detector: FreshnessDetector,
}

impl FreshnessEnhancer {
    pub fn new(config: FreshnessConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let detector = FreshnessDetector::new(config.sensitivity_threshold);
        Ok(Self { config, detector })
    }

    pub fn config(&self) -> &FreshnessConfig {
        &self.config
    }

    pub fn detector(&self) -> &FreshnessDetector {
        &self.detector
    }

    /// Decay multiplier for a document `age_days` old.
    #[must_use]
    pub fn decay_factor(&self, age_days: f64) -> f64 {
        let half_life = self.config.decay_half_life_days;
        let raw = (-age_days.max(0.0) * std::f64::consts::LN_2 / half_life).exp();
        raw.max(self.config.decay_floor)
    }

    /// Recency multiplier: `boost_factor` at age 0 falling linearly to 1 at
    /// the threshold, 1 beyond it.
    #[must_use]
    pub fn recency_boost(&self, age_days: f64) -> f64 {
        let threshold = self.config.recency_threshold_days;
        let age = age_days.max(0.0);
        if threshold <= 0.0 || age >= threshold {
            return 1.0;
        }
        1.0 + (self.config.recency_boost_factor - 1.0) * (1.0 - age / threshold)
    }

    /// Adjust `results` for a freshness-sensitive query. Insensitive queries
    /// pass through unchanged. `now` defaults to the current time.
    pub fn enhance(
        &self,
        query: &str,
        results: Vec<Candidate>,
        now: Option<DateTime<Utc>>,
    ) -> (Vec<Candidate>, FreshnessMetadata) {
        let signals = self.detector.detect(query);
        let mut metadata = FreshnessMetadata {
            is_freshness_sensitive: signals.is_sensitive,
            signals,
            ..FreshnessMetadata::default()
        };

        if !self.config.enabled || !metadata.is_freshness_sensitive {
            return (results, metadata);
        }

        let now = now.unwrap_or_else(Utc::now);
        let mut decayed = false;
        let mut boosted = false;
        let mut results = results;

        for candidate in &mut results {
            let Some(ts) = extract_timestamp(&candidate.metadata, &self.config.timestamp_fields)
            else {
                metadata.documents_without_timestamp += 1;
                continue;
            };
            metadata.documents_with_timestamp += 1;

            let age_days = ((now - ts).num_milliseconds() as f64 / 1000.0 / SECONDS_PER_DAY).max(0.0);
            let decay = if self.config.enable_time_decay {
                decayed = true;
                self.decay_factor(age_days)
            } else {
                1.0
            };
            let boost = if self.config.enable_recency_prior {
                self.recency_boost(age_days)
            } else {
                1.0
            };
            boosted |= boost > 1.0;

            let before = candidate.score;
            candidate.annotate("pre_freshness_score", before);
            candidate.annotate("freshness_decay", decay);
            candidate.annotate("freshness_boost", boost);
            candidate.annotate("age_days", age_days);
            candidate.score = before * decay * boost;
        }

        if decayed {
            metadata.enhancements_applied.push(Enhancement::TimeDecay);
        }
        if boosted {
            metadata.enhancements_applied.push(Enhancement::RecencyBoost);
        }

        results.sort_by(|a, b| b.score.total_cmp(&a.score));

        debug!(
            stage = "freshness",
            with_timestamp = metadata.documents_with_timestamp,
            without_timestamp = metadata.documents_without_timestamp,
            applied = ?metadata.enhancements_applied,
            "Freshness adjustment applied"
        );

        (results, metadata)
    }
}
