//! Near-duplicate suppression over candidate lists.
//!
//! Three strategies share one greedy driver: candidates are visited by score
//! descending and a candidate survives only if it is not a duplicate of one
//! already kept. Survivors are optionally put back in input order.
//!
//! - [`DedupMethod::Exact`]: SHA-256 of lower-cased, trimmed text.
//! - [`DedupMethod::MinHash`]: MinHash signatures over FNV-1a hashed
//!   character n-grams, one splitmix64 salt per permutation from a fixed seed.
//!   Duplicate when the estimated Jaccard similarity ≥ threshold.
//! - [`DedupMethod::Cosine`]: TF-IDF cosine ≥ threshold.
//!
//! Vectorizer failures degrade to returning the input unchanged.

use std::collections::HashSet;
use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::candidate::{Candidate, TextField};
use crate::error::ConfigError;
use crate::text::{SparseVector, tfidf_vectors};

/// Deduplication strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DedupMethod {
    Exact,
    #[default]
    #[serde(rename = "minhash")]
    MinHash,
    Cosine,
}

impl DedupMethod {
    /// Threshold used when the config leaves it unset.
    #[must_use]
    pub fn default_threshold(self) -> f64 {
        match self {
            Self::Exact => 1.0,
            Self::MinHash => 0.8,
            Self::Cosine => 0.9,
        }
    }
}

impl fmt::Display for DedupMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exact => write!(f, "exact"),
            Self::MinHash => write!(f, "minhash"),
            Self::Cosine => write!(f, "cosine"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DedupConfig {
    pub enabled: bool,
    pub method: DedupMethod,
    /// Similarity at or above which two candidates are duplicates. `None`
    /// uses the method default (0.8 minhash, 0.9 cosine).
    pub threshold: Option<f64>,
    /// Number of MinHash permutations.
    pub num_perm: usize,
    /// Character n-gram size for MinHash shingles.
    pub ngram_size: usize,
    /// Put survivors back in input order instead of score order.
    pub restore_order: bool,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            method: DedupMethod::MinHash,
            threshold: None,
            num_perm: 128,
            ngram_size: 3,
            restore_order: true,
        }
    }
}

impl DedupConfig {
    #[must_use]
    pub fn effective_threshold(&self) -> f64 {
        self.threshold
            .unwrap_or_else(|| self.method.default_threshold())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Some(t) = self.threshold {
            if !(0.0..=1.0).contains(&t) {
                return Err(ConfigError::invalid("dedup.threshold", "must be within [0, 1]"));
            }
        }
        if self.num_perm == 0 {
            return Err(ConfigError::invalid("dedup.num_perm", "must be >= 1"));
        }
        if self.ngram_size == 0 {
            return Err(ConfigError::invalid("dedup.ngram_size", "must be >= 1"));
        }
        Ok(())
    }
}

/// What a dedup pass did, for telemetry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DedupReport {
    pub method: DedupMethod,
    pub input: usize,
    pub output: usize,
    pub removed: usize,
    /// The strategy failed and the input was returned unchanged.
    pub degraded: bool,
}

#[derive(Debug, Clone, Default)]
pub struct Deduplicator {
    config: DedupConfig,
}

impl Deduplicator {
    pub fn new(config: DedupConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self { config })
    }

    /// Shorthand for a deduplicator using `method` with its default threshold.
    #[must_use]
    pub fn with_method(method: DedupMethod) -> Self {
        Self {
            config: DedupConfig {
                method,
                ..DedupConfig::default()
            },
        }
    }

    pub fn config(&self) -> &DedupConfig {
        &self.config
    }

    pub fn filter_duplicates(&self, candidates: Vec<Candidate>, text_field: &TextField) -> Vec<Candidate> {
        self.filter_duplicates_with_report(candidates, text_field).0
    }

    pub fn filter_duplicates_with_report(
        &self,
        candidates: Vec<Candidate>,
        text_field: &TextField,
    ) -> (Vec<Candidate>, DedupReport) {
        let input = candidates.len();
        let method = self.config.method;
        let passthrough = |candidates: Vec<Candidate>, degraded| {
            let report = DedupReport {
                method,
                input,
                output: input,
                removed: 0,
                degraded,
            };
            (candidates, report)
        };

        if !self.config.enabled || input < 2 {
            return passthrough(candidates, false);
        }

        let texts: Vec<&str> = candidates.iter().map(|c| c.field_text(text_field)).collect();
        let keep = match method {
            DedupMethod::Exact => Some(greedy_exact(&candidates, &texts)),
            DedupMethod::MinHash => Some(greedy_minhash(
                &candidates,
                &texts,
                self.config.num_perm,
                self.config.ngram_size,
                self.config.effective_threshold(),
            )),
            DedupMethod::Cosine => match tfidf_vectors(&texts) {
                Ok(vectors) => Some(greedy_cosine(
                    &candidates,
                    &vectors,
                    self.config.effective_threshold(),
                )),
                Err(err) => {
                    warn!(error = %err, stage = "dedup", "Cosine dedup failed; returning input unchanged");
                    None
                }
            },
        };

        let Some(mut keep) = keep else {
            return passthrough(candidates, true);
        };

        if self.config.restore_order {
            keep.sort_unstable();
        }

        let mut slots: Vec<Option<Candidate>> = candidates.into_iter().map(Some).collect();
        let output: Vec<Candidate> = keep.into_iter().filter_map(|i| slots[i].take()).collect();

        let report = DedupReport {
            method,
            input,
            output: output.len(),
            removed: input - output.len(),
            degraded: false,
        };
        debug!(
            stage = "dedup",
            method = %method,
            input = report.input,
            removed = report.removed,
            "Dedup complete"
        );
        (output, report)
    }
}

/// Indices ordered by score descending; ties keep input order.
fn score_order(candidates: &[Candidate]) -> Vec<usize> {
    let mut order: Vec<usize> = (0..candidates.len()).collect();
    order.sort_by(|&a, &b| candidates[b].score.total_cmp(&candidates[a].score).then(a.cmp(&b)));
    order
}

/// Greedy keep-first over score order; `is_dup(i, j)` compares a candidate
/// against an already kept one.
fn greedy(candidates: &[Candidate], mut is_dup: impl FnMut(usize, usize) -> bool) -> Vec<usize> {
    let mut kept: Vec<usize> = Vec::new();
    for i in score_order(candidates) {
        if !kept.iter().any(|&j| is_dup(i, j)) {
            kept.push(i);
        }
    }
    kept
}

fn greedy_exact(candidates: &[Candidate], texts: &[&str]) -> Vec<usize> {
    let mut seen: HashSet<String> = HashSet::with_capacity(texts.len());
    score_order(candidates)
        .into_iter()
        .filter(|&i| seen.insert(content_hash(texts[i])))
        .collect()
}

fn greedy_minhash(
    candidates: &[Candidate],
    texts: &[&str],
    num_perm: usize,
    ngram_size: usize,
    threshold: f64,
) -> Vec<usize> {
    let signatures: Vec<Vec<u64>> = texts
        .iter()
        .map(|t| minhash_signature(&char_shingles(t, ngram_size), num_perm))
        .collect();
    greedy(candidates, |i, j| {
        estimated_jaccard(&signatures[i], &signatures[j]) >= threshold
    })
}

fn greedy_cosine(candidates: &[Candidate], vectors: &[SparseVector], threshold: f64) -> Vec<usize> {
    greedy(candidates, |i, j| vectors[i].cosine(&vectors[j]) >= threshold)
}

/// SHA-256 hex digest of the normalized (trimmed, lower-cased) text.
#[must_use]
pub fn content_hash(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.trim().to_lowercase().as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Hashes of the lower-cased character n-grams of `text`. Text shorter than
/// `n` characters is a single shingle.
fn char_shingles(text: &str, n: usize) -> Vec<u64> {
    let chars: Vec<char> = text.to_lowercase().chars().collect();
    if chars.len() < n {
        let s: String = chars.into_iter().collect();
        return vec![fnv1a(s.as_bytes())];
    }
    let mut buf = String::new();
    let mut shingles: Vec<u64> = chars
        .windows(n)
        .map(|w| {
            buf.clear();
            buf.extend(w);
            fnv1a(buf.as_bytes())
        })
        .collect();
    shingles.sort_unstable();
    shingles.dedup();
    shingles
}

fn fnv1a(bytes: &[u8]) -> u64 {
    let mut h: u64 = 0xcbf2_9ce4_8422_2325;
    for &b in bytes {
        h ^= u64::from(b);
        h = h.wrapping_mul(0x0100_0000_01b3);
    }
    h
}

/// Seed of the MinHash salt sequence. Signatures are stable across runs.
const MINHASH_SEED: u64 = 0x5EED_F00D_D0C5_0001;

/// One min-hash per salt: `min(mix64(shingle ^ salt_i))`, with the salts
/// drawn from a splitmix64 sequence started at [`MINHASH_SEED`].
fn minhash_signature(shingles: &[u64], num_perm: usize) -> Vec<u64> {
    let mut state = MINHASH_SEED;
    (0..num_perm)
        .map(|_| {
            state = state.wrapping_add(0x9E37_79B9_7F4A_7C15);
            let salt = mix64(state);
            shingles
                .iter()
                .map(|&shingle| mix64(shingle ^ salt))
                .min()
                .unwrap_or(u64::MAX)
        })
        .collect()
}

fn mix64(mut z: u64) -> u64 {
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}

fn estimated_jaccard(a: &[u64], b: &[u64]) -> f64 {
    if a.is_empty() || a.len() != b.len() {
        return 0.0;
    }
    let matching = a.iter().zip(b).filter(|(x, y)| x == y).count();
    matching as f64 / a.len() as f64
}
