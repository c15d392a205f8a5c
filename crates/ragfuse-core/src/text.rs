//! Tokenization, TF-IDF vectorization and cosine similarity helpers shared by
//! the prefilter, the deduplicator and the rerankers.

use std::collections::{BTreeMap, HashMap, HashSet};

use crate::error::VectorizeError;

/// Lower-cased alphanumeric terms of at least two characters.
#[must_use]
pub fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !(c.is_alphanumeric() || c == '_'))
        .filter(|w| w.chars().count() >= 2)
        .map(str::to_lowercase)
        .collect()
}

/// Unique terms of `text`.
#[must_use]
pub fn term_set(text: &str) -> HashSet<String> {
    tokenize(text).into_iter().collect()
}

/// L2-normalized sparse vector: `(term index, weight)` sorted by index.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SparseVector {
    entries: Vec<(usize, f64)>,
}

impl SparseVector {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Dot product via a merge over the sorted indices.
    #[must_use]
    pub fn dot(&self, other: &Self) -> f64 {
        let (mut i, mut j) = (0, 0);
        let mut sum = 0.0;
        while i < self.entries.len() && j < other.entries.len() {
            let (ai, av) = self.entries[i];
            let (bj, bv) = other.entries[j];
            match ai.cmp(&bj) {
                std::cmp::Ordering::Less => i += 1,
                std::cmp::Ordering::Greater => j += 1,
                std::cmp::Ordering::Equal => {
                    sum += av * bv;
                    i += 1;
                    j += 1;
                }
            }
        }
        sum
    }

    /// Cosine similarity; vectors are unit length so this is the dot product,
    /// clamped against rounding drift.
    #[must_use]
    pub fn cosine(&self, other: &Self) -> f64 {
        if self.is_empty() || other.is_empty() {
            return 0.0;
        }
        self.dot(other).clamp(-1.0, 1.0)
    }
}

/// Smoothed TF-IDF: `tf * (ln((1 + n) / (1 + df)) + 1)`, rows L2-normalized.
///
/// Fails with [`VectorizeError::EmptyVocabulary`] when no document yields a
/// single term.
pub fn tfidf_vectors<S: AsRef<str>>(documents: &[S]) -> Result<Vec<SparseVector>, VectorizeError> {
    let tokenized: Vec<Vec<String>> = documents.iter().map(|d| tokenize(d.as_ref())).collect();

    let mut vocabulary: BTreeMap<&str, usize> = BTreeMap::new();
    for tokens in &tokenized {
        for token in tokens {
            vocabulary.entry(token.as_str()).or_insert(0);
        }
    }
    if vocabulary.is_empty() {
        return Err(VectorizeError::EmptyVocabulary);
    }
    for (index, slot) in vocabulary.values_mut().enumerate() {
        *slot = index;
    }

    let mut df: HashMap<usize, usize> = HashMap::new();
    for tokens in &tokenized {
        let unique: HashSet<usize> = tokens.iter().map(|t| vocabulary[t.as_str()]).collect();
        for idx in unique {
            *df.entry(idx).or_insert(0) += 1;
        }
    }

    let n = documents.len() as f64;
    let vectors = tokenized
        .iter()
        .map(|tokens| {
            let mut tf: BTreeMap<usize, f64> = BTreeMap::new();
            for token in tokens {
                *tf.entry(vocabulary[token.as_str()]).or_insert(0.0) += 1.0;
            }
            let mut entries: Vec<(usize, f64)> = tf
                .into_iter()
                .map(|(idx, count)| {
                    let doc_freq = df.get(&idx).copied().unwrap_or(1) as f64;
                    let idf = ((1.0 + n) / (1.0 + doc_freq)).ln() + 1.0;
                    (idx, count * idf)
                })
                .collect();
            let norm = entries.iter().map(|(_, w)| w * w).sum::<f64>().sqrt();
            if norm > 0.0 {
                for (_, w) in &mut entries {
                    *w /= norm;
                }
            }
            SparseVector { entries }
        })
        .collect();

    Ok(vectors)
}

/// Pairwise TF-IDF cosine similarity matrix.
pub fn similarity_matrix<S: AsRef<str>>(documents: &[S]) -> Result<Vec<Vec<f64>>, VectorizeError> {
    let vectors = tfidf_vectors(documents)?;
    let n = vectors.len();
    let mut matrix = vec![vec![0.0; n]; n];
    for i in 0..n {
        matrix[i][i] = if vectors[i].is_empty() { 0.0 } else { 1.0 };
        for j in (i + 1)..n {
            let sim = vectors[i].cosine(&vectors[j]);
            matrix[i][j] = sim;
            matrix[j][i] = sim;
        }
    }
    Ok(matrix)
}

/// Dense cosine similarity guarded against zero, NaN and infinite norms.
///
/// Mismatched dimensions compare as 0.0. The result is clamped to [-1, 1].
#[must_use]
pub fn dense_cosine(a: &[f32], b: &[f32]) -> f64 {
    if a.is_empty() || a.len() != b.len() {
        return 0.0;
    }
    let mut dot = 0.0f64;
    let mut norm_a = 0.0f64;
    let mut norm_b = 0.0f64;
    for (&x, &y) in a.iter().zip(b) {
        let (x, y) = (f64::from(x), f64::from(y));
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    let denom = norm_a.sqrt() * norm_b.sqrt();
    if !denom.is_finite() || denom <= f64::EPSILON || !dot.is_finite() {
        return 0.0;
    }
    (dot / denom).clamp(-1.0, 1.0)
}

/// Min-max normalize into [0, 1]. A constant (or single) input maps to 1.0
/// when positive and 0.0 otherwise.
#[must_use]
pub fn min_max_normalize(scores: &[f64]) -> Vec<f64> {
    let finite = scores.iter().copied().filter(|s| s.is_finite());
    let (min, max) = finite.fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), s| {
        (lo.min(s), hi.max(s))
    });
    if !min.is_finite() || !max.is_finite() {
        return vec![0.0; scores.len()];
    }
    let range = max - min;
    scores
        .iter()
        .map(|&s| {
            if !s.is_finite() {
                0.0
            } else if range <= f64::EPSILON {
                if max > 0.0 { 1.0 } else { 0.0 }
            } else {
                ((s - min) / range).clamp(0.0, 1.0)
            }
        })
        .collect()
}
