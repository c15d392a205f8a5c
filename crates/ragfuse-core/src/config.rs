//! Retriever configuration.
//!
//! One TOML document with a table per stage. Every section defaults, unknown
//! keys are rejected at parse time and [`RetrieverConfig::validate`] rejects
//! out-of-range values before any stage is built.
//!
//! ```toml
//! per_file_cap = 5
//!
//! [fusion]
//! k = 60
//! lambda_lex = 0.6
//! lambda_sem = 0.4
//!
//! [dedup]
//! method = "minhash"
//!
//! [circuit_breaker]
//! failure_threshold = 5
//! recovery_timeout_s = 30.0
//! timeout_ms = 400
//! max_timeout_ms = 600
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::circuit_breaker::CircuitBreakerConfig;
use crate::dedup::DedupConfig;
use crate::error::ConfigError;
use crate::freshness::FreshnessConfig;
use crate::intent::IntentConfig;
use crate::logging::{LogConfig, LogLevel};
use crate::prefilter::PrefilterConfig;
use crate::rerank::{CrossEncoderConfig, MmrConfig, RerankConfig};
use crate::search::{FusionWeights, WindowConfig};

/// Worker-pool sizing for the cross-encoder tier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CrossEncoderSection {
    pub batch_size: usize,
    pub max_workers: usize,
}

impl Default for CrossEncoderSection {
    fn default() -> Self {
        let defaults = CrossEncoderConfig::default();
        Self {
            batch_size: defaults.batch_size,
            max_workers: defaults.max_workers,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CircuitBreakerSection {
    pub failure_threshold: u32,
    pub success_threshold: u32,
    pub recovery_timeout_s: f64,
    /// Soft latency target of one cross-encoder call.
    pub timeout_ms: u64,
    /// Hard deadline of one cross-encoder call.
    pub max_timeout_ms: u64,
}

impl Default for CircuitBreakerSection {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 1,
            recovery_timeout_s: 30.0,
            timeout_ms: 400,
            max_timeout_ms: 600,
        }
    }
}

impl CircuitBreakerSection {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.failure_threshold == 0 {
            return Err(ConfigError::invalid("circuit_breaker.failure_threshold", "must be >= 1"));
        }
        if self.success_threshold == 0 {
            return Err(ConfigError::invalid("circuit_breaker.success_threshold", "must be >= 1"));
        }
        if Duration::try_from_secs_f64(self.recovery_timeout_s).is_err() {
            return Err(ConfigError::invalid(
                "circuit_breaker.recovery_timeout_s",
                "must be finite, >= 0 and representable as a duration",
            ));
        }
        if self.max_timeout_ms == 0 {
            return Err(ConfigError::invalid("circuit_breaker.max_timeout_ms", "must be >= 1"));
        }
        if self.timeout_ms > self.max_timeout_ms {
            return Err(ConfigError::invalid(
                "circuit_breaker.timeout_ms",
                "must be <= circuit_breaker.max_timeout_ms",
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetrieverConfig {
    pub fusion: FusionWeights,
    pub prefilter: PrefilterConfig,
    pub dedup: DedupConfig,
    pub window: WindowConfig,
    pub freshness: FreshnessConfig,
    pub rerank: RerankConfig,
    pub mmr: MmrConfig,
    pub cross_encoder: CrossEncoderSection,
    pub circuit_breaker: CircuitBreakerSection,
    pub intent: IntentConfig,
    pub logging: LogConfig,
    /// Maximum results sharing one `file_key` value.
    pub per_file_cap: usize,
    /// Metadata key naming a result's source file.
    pub file_key: String,
}

impl Default for RetrieverConfig {
    fn default() -> Self {
        Self {
            fusion: FusionWeights::default(),
            prefilter: PrefilterConfig::default(),
            dedup: DedupConfig::default(),
            window: WindowConfig::default(),
            freshness: FreshnessConfig::default(),
            rerank: RerankConfig::default(),
            mmr: MmrConfig::default(),
            cross_encoder: CrossEncoderSection::default(),
            circuit_breaker: CircuitBreakerSection::default(),
            intent: IntentConfig::default(),
            logging: LogConfig::default(),
            per_file_cap: 5,
            file_key: "file".to_string(),
        }
    }
}

impl RetrieverConfig {
    /// Parse and validate a TOML document.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: Self =
            toml::from_str(content).map_err(|e| ConfigError::ParseFailed(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a TOML file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Err(ConfigError::FileNotFound(path.display().to_string()));
        }
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFailed(path.display().to_string(), e.to_string()))?;
        Self::from_toml_str(&content)
    }

    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::ParseFailed(e.to_string()))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.fusion.validate()?;
        self.prefilter.validate()?;
        self.dedup.validate()?;
        self.window.validate()?;
        self.freshness.validate()?;
        self.rerank.validate()?;
        self.mmr.validate()?;
        self.circuit_breaker.validate()?;
        self.cross_encoder_config().validate()?;
        self.intent.validate()?;

        self.logging
            .level
            .parse::<LogLevel>()
            .map_err(|e| ConfigError::ValidationError(format!("logging.level {e}")))?;
        if self.per_file_cap == 0 {
            return Err(ConfigError::invalid("per_file_cap", "must be >= 1"));
        }
        if self.file_key.trim().is_empty() {
            return Err(ConfigError::invalid("file_key", "must not be empty"));
        }
        Ok(())
    }

    #[must_use]
    pub fn breaker_config(&self) -> CircuitBreakerConfig {
        let section = &self.circuit_breaker;
        // Only an unvalidated config can miss here.
        let recovery = Duration::try_from_secs_f64(section.recovery_timeout_s)
            .unwrap_or_else(|_| CircuitBreakerConfig::default().recovery_timeout);
        CircuitBreakerConfig::new(section.failure_threshold, section.success_threshold, recovery)
    }

    #[must_use]
    pub fn cross_encoder_config(&self) -> CrossEncoderConfig {
        CrossEncoderConfig {
            batch_size: self.cross_encoder.batch_size,
            max_workers: self.cross_encoder.max_workers,
            timeout_ms: self.circuit_breaker.timeout_ms,
            max_timeout_ms: self.circuit_breaker.max_timeout_ms,
        }
    }
}
