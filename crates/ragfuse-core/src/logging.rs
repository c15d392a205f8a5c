//! Structured logging for ragfuse
//!
//! The library itself only emits `tracing` events. Hosts that do not install
//! their own subscriber can call [`init_logging`] once at startup.
//!
//! # Correlation Fields
//!
//! Spans and events use these field names:
//! - `request_id`: Caller-supplied request identifier
//! - `tag`: Domain/tag hint passed with the query
//! - `stage`: Pipeline stage (`prefilter`, `dedup`, `fusion`, ...)
//! - `circuit`: Circuit breaker name
//!
//! # Safety
//!
//! **Never log raw document text or full queries at info level.** Counts,
//! ids and scores are fine; content goes to `trace` at most.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, OnceLock};
use tracing::Level;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::fmt::time::SystemTime;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, fmt as tfmt};

// Set once the global subscriber is installed.
static LOGGING_INITIALIZED: OnceLock<bool> = OnceLock::new();

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    /// Human-friendly output for interactive use
    #[default]
    Pretty,
    /// JSON lines for ingestion
    Json,
}

impl fmt::Display for LogFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pretty => write!(f, "pretty"),
            Self::Json => write!(f, "json"),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LogConfig {
    /// Minimum level; `RUST_LOG` wins when set.
    pub level: String,

    pub format: LogFormat,

    /// Append a copy of every event here.
    pub file: Option<PathBuf>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
            file: None,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LogError {
    #[error("a ragfuse subscriber is already installed")]
    AlreadyInitialized,

    #[error("{0}")]
    InvalidLevel(String),

    #[error("cannot open log file: {0}")]
    FileCreate(#[from] io::Error),

    #[error("another global subscriber is installed: {0}")]
    SetSubscriber(#[from] tracing::subscriber::SetGlobalDefaultError),
}

/// Install the global subscriber described by `config`.
///
/// Events always go to stderr; `file`, when set, receives a second copy
/// without ANSI colors. `RUST_LOG` overrides the configured level, e.g.
/// `RUST_LOG=ragfuse_core::retriever=debug`. Only the first call succeeds.
pub fn init_logging(config: &LogConfig) -> Result<(), LogError> {
    if is_logging_initialized() {
        return Err(LogError::AlreadyInitialized);
    }

    let level: LogLevel = config.level.parse().map_err(LogError::InvalidLevel)?;
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::default().add_directive(LevelFilter::from_level(level.into()).into())
    });
    let file = config.file.as_deref().map(open_log_file).transpose()?;

    let json = config.format == LogFormat::Json;
    let stderr_pretty = (!json).then(|| tfmt::layer().with_writer(io::stderr).with_target(true));
    let stderr_json = json.then(|| {
        tfmt::layer()
            .json()
            .with_timer(SystemTime)
            .with_writer(io::stderr)
            .with_current_span(true)
            .with_span_list(false)
            .flatten_event(true)
    });
    let (file_pretty, file_json) = match (file, config.format) {
        (None, _) => (None, None),
        (Some(file), LogFormat::Pretty) => (
            Some(tfmt::layer().with_writer(Mutex::new(file)).with_ansi(false)),
            None,
        ),
        (Some(file), LogFormat::Json) => (
            None,
            Some(
                tfmt::layer()
                    .json()
                    .with_timer(SystemTime)
                    .with_writer(Mutex::new(file))
                    .with_current_span(true)
                    .flatten_event(true),
            ),
        ),
    };

    let subscriber = tracing_subscriber::registry()
        .with(filter)
        .with(stderr_pretty)
        .with(stderr_json)
        .with(file_pretty)
        .with(file_json);
    tracing::subscriber::set_global_default(subscriber)?;
    let _ = LOGGING_INITIALIZED.set(true);

    tracing::info!(
        log_level = %config.level,
        log_format = %config.format,
        log_file = ?config.file,
        "Logging initialized"
    );
    Ok(())
}

fn open_log_file(path: &Path) -> Result<File, LogError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    Ok(OpenOptions::new().create(true).append(true).open(path)?)
}

pub fn is_logging_initialized() -> bool {
    LOGGING_INITIALIZED.get().is_some()
}

/// Accepted values of `logging.level`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl From<LogLevel> for Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Trace => Self::TRACE,
            LogLevel::Debug => Self::DEBUG,
            LogLevel::Info => Self::INFO,
            LogLevel::Warn => Self::WARN,
            LogLevel::Error => Self::ERROR,
        }
    }
}

impl std::str::FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "trace" => Ok(Self::Trace),
            "debug" => Ok(Self::Debug),
            "info" => Ok(Self::Info),
            "warn" | "warning" => Ok(Self::Warn),
            "error" => Ok(Self::Error),
            _ => Err(format!(
                "`{s}` is not a log level (trace, debug, info, warn, error)"
            )),
        }
    }
}
