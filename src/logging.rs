//! Tracing setup for the `cpl-daq` binary
//!
//! Pretty, compact or JSON output on stderr. `RUST_LOG` overrides the
//! configured level. Initialization is idempotent so tests can call it freely.

use crate::error::{AppResult, CplError};
use tracing::Level;
use tracing_subscriber::{
    fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer, Registry,
};

/// Log line layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    /// Multi-line, colored
    Pretty,
    /// One line per event, for the lab PC console
    Compact,
    /// One JSON object per event
    Json,
}

impl std::str::FromStr for OutputFormat {
    type Err = CplError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pretty" => Ok(OutputFormat::Pretty),
            "compact" => Ok(OutputFormat::Compact),
            "json" => Ok(OutputFormat::Json),
            other => Err(CplError::Configuration(format!(
                "Invalid log format '{}'. Must be one of: pretty, compact, json",
                other
            ))),
        }
    }
}

/// Level and layout of the global subscriber.
#[derive(Debug, Clone)]
pub struct TracingConfig {
    /// Default level when `RUST_LOG` is unset
    pub level: Level,
    /// Line layout
    pub format: OutputFormat,
    /// ANSI colors, `Pretty` only
    pub with_ansi: bool,
}

impl TracingConfig {
    /// Compact output at `level`.
    pub fn new(level: Level) -> Self {
        Self {
            level,
            format: OutputFormat::Compact,
            with_ansi: true,
        }
    }

    /// Set output format
    pub fn with_format(mut self, format: OutputFormat) -> Self {
        self.format = format;
        self
    }

    /// Enable or disable ANSI colors
    pub fn with_ansi(mut self, enabled: bool) -> Self {
        self.with_ansi = enabled;
        self
    }
}

/// Install the global subscriber. A no-op if one is already set.
pub fn init(config: TracingConfig) -> AppResult<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.level.as_str().to_lowercase()));

    match config.format {
        OutputFormat::Pretty => install(
            fmt::layer()
                .pretty()
                .with_thread_names(true)
                .with_ansi(config.with_ansi)
                .with_filter(env_filter),
        ),
        OutputFormat::Compact => install(
            fmt::layer()
                .compact()
                .with_thread_names(true)
                .with_ansi(false)
                .with_filter(env_filter),
        ),
        OutputFormat::Json => install(fmt::layer().json().with_filter(env_filter)),
    }
}

fn install<L>(layer: L) -> AppResult<()>
where
    L: Layer<Registry> + Send + Sync + 'static,
{
    if tracing::dispatcher::has_been_set() {
        return Ok(());
    }
    tracing_subscriber::registry()
        .with(layer)
        .try_init()
        .map_err(|e| CplError::Configuration(format!("Failed to initialize tracing: {}", e)))
}

/// Parse `trace`, `debug`, `info`, `warn` or `error`, any case.
pub fn parse_log_level(level: &str) -> AppResult<Level> {
    level.parse().map_err(|_| {
        CplError::Configuration(format!(
            "Invalid log level '{}'. Must be one of: trace, debug, info, warn, error",
            level
        ))
    })
}
