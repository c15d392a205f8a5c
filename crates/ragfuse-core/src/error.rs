//! Error types for ragfuse-core
//!
//! Only configuration errors are allowed to escape the public pipeline.
//! Everything else (vectorizer failures, cross-encoder timeouts, open circuits)
//! is absorbed at the stage boundary and surfaced as metadata.

use thiserror::Error;

/// Result type alias using the library's Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for ragfuse-core
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration errors (fatal at construction time)
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    /// Reranker errors (never returned by the public rerank contract)
    #[error("Rerank error: {0}")]
    Rerank(#[from] RerankError),

    /// Logging initialization errors
    #[error("Logging error: {0}")]
    Logging(#[from] crate::logging::LogError),

    /// Outcome serialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Whether this error should abort pipeline construction.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Config(_) | Self::Logging(_))
    }
}

/// Configuration errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Config file not found: {0}")]
    FileNotFound(String),

    #[error("Failed to read config file {0}: {1}")]
    ReadFailed(String, String),

    #[error("Failed to parse config: {0}")]
    ParseFailed(String),

    #[error("Validation error: {0}")]
    ValidationError(String),
}

impl ConfigError {
    pub(crate) fn invalid(field: &str, requirement: &str) -> Self {
        Self::ValidationError(format!("{field} {requirement}"))
    }
}

/// Failures of the cross-encoder tier.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RerankError {
    #[error("rerank model error: {0}")]
    ModelError(String),

    #[error("scorer returned {got} scores for {expected} documents")]
    ScoreCountMismatch { expected: usize, got: usize },

    #[error("scorer returned a non-finite score at position {0}")]
    NonFiniteScore(usize),

    #[error("cross-encoder timed out after {0} ms")]
    Timeout(u64),

    #[error("circuit breaker `{0}` is open")]
    CircuitOpen(String),

    #[error("worker pool unavailable: {0}")]
    WorkerPool(String),

    #[error("scoring task panicked: {0}")]
    TaskPanicked(String),
}

/// TF-IDF vectorization failures.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum VectorizeError {
    #[error("empty vocabulary; documents contain no indexable terms")]
    EmptyVocabulary,
}
