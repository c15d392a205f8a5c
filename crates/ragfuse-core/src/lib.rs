//! ragfuse-core: Retrieval fusion and reranking engine
//!
//! Sits between lexical/vector search backends and answer composition in a
//! retrieval-augmented pipeline. Takes two raw candidate lists for a query and
//! produces one deduplicated, diversity-aware, freshness-aware ranked list
//! with citation windows.
//!
//! # Architecture
//!
//! ```text
//! query ─→ IntentRouter ─(structured)─→ short-circuit to sql/kg
//!              ↓
//! bm25 + vector ─→ Prefilter ─→ Deduplicator ─→ FusionEngine (weighted RRF)
//!                                                   ↓
//!                               FreshnessEnhancer ─→ Windower
//!                                                   ↓
//!          CrossEncoderReranker (circuit breaker + timeout) │ Heuristic + MMR
//!                                                   ↓
//!                                           per-file cap ─→ results
//! ```
//!
//! # Modules
//!
//! - `candidate`: Candidate records, rank-list inputs, document lookup
//! - `intent`: Structured/text query classification and route selection
//! - `prefilter`: Score floors, length bounds, TF-IDF diversity
//! - `dedup`: Exact, MinHash and cosine near-duplicate suppression
//! - `search`: Weighted RRF fusion and document windowing
//! - `freshness`: Freshness detection, time decay and recency boost
//! - `rerank`: Heuristic, MMR and cross-encoder rerankers
//! - `circuit_breaker`: Failure isolation for the cross-encoder tier
//! - `retriever`: The end-to-end pipeline
//! - `config`: TOML configuration
//! - `logging`: Tracing subscriber setup
//!
//! # Safety
//!
//! This crate forbids unsafe code.

#![forbid(unsafe_code)]

pub mod candidate;
pub mod circuit_breaker;
pub mod config;
pub mod dedup;
pub mod error;
pub mod freshness;
pub mod intent;
pub mod logging;
pub mod prefilter;
pub mod rerank;
pub mod retriever;
pub mod search;
pub mod text;

pub use candidate::{Candidate, Document, DocumentLookup, FnLookup, MetaValue, Metadata, RankInput, RankedPair, TextField};
pub use config::RetrieverConfig;
pub use error::{ConfigError, Error, RerankError, Result};
pub use rerank::{RerankMethod, RerankResult};
pub use retriever::{AdvancedRetriever, RetrievalHit, RetrievalOutcome, RetrievalRequest};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_is_set() {
        assert!(!VERSION.is_empty());
    }
}
