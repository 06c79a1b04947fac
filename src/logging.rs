//! Structured logging
//!
//! Text output for terminals, JSON lines for log shippers. `RUST_LOG`
//! overrides the level given on the command line.

use eyre::{eyre, Result};
use std::str::FromStr;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Output format of the log subscriber
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    /// Human-readable lines
    #[default]
    Text,
    /// One JSON object per event
    Json,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "text" | "pretty" => Ok(Self::Text),
            "json" => Ok(Self::Json),
            other => Err(format!("unknown log format '{}', expected text|json", other)),
        }
    }
}

/// Default filter directive for `level`
pub fn default_directive(level: &str) -> String {
    format!("{}={},warn", env!("CARGO_CRATE_NAME"), level)
}

/// Install the global subscriber
///
/// Fails if a subscriber is already installed.
pub fn init(format: LogFormat, level: &str) -> Result<()> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive(level)));

    let registry = tracing_subscriber::registry().with(filter);
    match format {
        LogFormat::Text => registry.with(tracing_subscriber::fmt::layer()).try_init(),
        LogFormat::Json => registry
            .with(tracing_subscriber::fmt::layer().json().with_current_span(false))
            .try_init(),
    }
    .map_err(|e| eyre!("Failed to install log subscriber: {}", e))
}
