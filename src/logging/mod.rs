//! Tracing subscriber setup
//!
//! The allocator only emits `tracing` events. Binaries and test suites that want
//! to see them call [`init_logging_default`] once.
//!
//! - `RUST_LOG`: filter directives (e.g. "devcache=trace"), default `warn`
//! - `DEVCACHE_LOG_FORMAT`: "human" (default) or "json"

use once_cell::sync::OnceCell;
use thiserror::Error;
use tracing_subscriber::{
    fmt,
    layer::{Layered, SubscriberExt},
    util::SubscriberInitExt,
    EnvFilter, Layer, Registry,
};

static TRACING_INITIALIZED: OnceCell<()> = OnceCell::new();

const LOG_FORMAT_ENV: &str = "DEVCACHE_LOG_FORMAT";

type BoxedLayer = Box<dyn Layer<Layered<EnvFilter, Registry>> + Send + Sync>;

/// Errors raised while installing the subscriber
#[derive(Debug, Error)]
pub enum LoggingError {
    #[error("invalid log filter: {0}")]
    InvalidFilter(String),

    /// Another global subscriber is already installed
    #[error("failed to install subscriber: {0}")]
    InstallFailed(String),
}

/// Console output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Human,
    Json,
}

impl LogFormat {
    /// Parse a format name, case-insensitive
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "human" | "pretty" => Some(LogFormat::Human),
            "json" => Some(LogFormat::Json),
            _ => None,
        }
    }

    fn from_env() -> Self {
        std::env::var(LOG_FORMAT_ENV)
            .ok()
            .and_then(|s| Self::parse(&s))
            .unwrap_or_default()
    }
}

/// Install the subscriber, ignoring failures
pub fn init_logging_default() {
    try_init_logging().ok();
}

/// Install the subscriber described by the environment
///
/// Only the first call does anything; later calls return `Ok(())`.
pub fn try_init_logging() -> Result<(), LoggingError> {
    let mut result = Ok(());
    TRACING_INITIALIZED.get_or_init(|| {
        result = install(LogFormat::from_env());
    });
    result
}

/// Has a subscriber install been attempted
pub fn is_initialized() -> bool {
    TRACING_INITIALIZED.get().is_some()
}

fn install(format: LogFormat) -> Result<(), LoggingError> {
    let filter = match std::env::var("RUST_LOG") {
        Ok(directives) => {
            EnvFilter::try_new(directives).map_err(|e| LoggingError::InvalidFilter(e.to_string()))?
        }
        Err(_) => EnvFilter::new("warn"),
    };

    let layer: BoxedLayer = match format {
        LogFormat::Json => fmt::layer().json().with_target(false).boxed(),
        LogFormat::Human => fmt::layer().with_target(true).with_thread_ids(true).boxed(),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(layer)
        .try_init()
        .map_err(|e| LoggingError::InstallFailed(e.to_string()))
}
