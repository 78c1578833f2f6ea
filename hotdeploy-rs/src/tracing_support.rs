//! Tracing and logging support.
//!
//! Both binaries initialise structured logging through this module so the
//! host service and the client render events the same way.

pub use tracing::{self, debug, error, info, instrument, trace, warn};

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Tracing output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TracingFormat {
    /// Human-readable multi-line format.
    Pretty,

    /// Single-line format (default for the interactive client).
    Compact,

    /// JSON format, one object per line.
    Json,
}

/// Tracing configuration.
#[derive(Debug, Clone)]
pub struct TracingConfig {
    /// Log level filter.
    ///
    /// If None, uses RUST_LOG environment variable or defaults to "info".
    pub level: Option<tracing::Level>,

    /// Output format.
    pub format: TracingFormat,

    /// Include timestamps in output.
    pub timestamps: bool,

    /// Include target module names in output.
    pub target: bool,

    /// Include thread IDs in output.
    pub thread_ids: bool,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self {
            level: None,
            format: TracingFormat::Compact,
            timestamps: true,
            target: false,
            thread_ids: false,
        }
    }
}

impl TracingConfig {
    /// Config used by `--verbose`
    pub fn verbose() -> Self {
        Self {
            level: Some(tracing::Level::DEBUG),
            target: true,
            ..Self::default()
        }
    }
}

/// Initialize tracing subscriber with default settings.
///
/// Uses RUST_LOG environment variable for level filtering.
/// Defaults to "info" level if RUST_LOG is not set.
pub fn init_subscriber() {
    init_subscriber_with_config(TracingConfig::default());
}

/// Initialize tracing subscriber with custom configuration.
///
/// Calling this more than once keeps the first subscriber.
pub fn init_subscriber_with_config(config: TracingConfig) {
    let filter = if let Some(level) = config.level {
        EnvFilter::new(level.to_string())
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    let layer = tracing_subscriber::fmt::layer()
        .with_target(config.target)
        .with_thread_ids(config.thread_ids)
        .with_writer(std::io::stderr);

    let result = match (config.format, config.timestamps) {
        (TracingFormat::Pretty, true) => tracing_subscriber::registry()
            .with(filter)
            .with(layer.pretty())
            .try_init(),
        (TracingFormat::Pretty, false) => tracing_subscriber::registry()
            .with(filter)
            .with(layer.pretty().without_time())
            .try_init(),
        (TracingFormat::Compact, true) => tracing_subscriber::registry()
            .with(filter)
            .with(layer.compact())
            .try_init(),
        (TracingFormat::Compact, false) => tracing_subscriber::registry()
            .with(filter)
            .with(layer.compact().without_time())
            .try_init(),
        (TracingFormat::Json, true) => tracing_subscriber::registry()
            .with(filter)
            .with(layer.json())
            .try_init(),
        (TracingFormat::Json, false) => tracing_subscriber::registry()
            .with(filter)
            .with(layer.json().without_time())
            .try_init(),
    };

    if let Err(e) = result {
        tracing::debug!(error = %e, "Tracing subscriber already initialized");
    }
}
