//! Logging configuration for PartitionCache binaries.
//!
//! This is the only place in the workspace that is allowed to install a
//! global [`tracing`] subscriber; library crates only emit events through
//! `observability_deps::tracing`.
#![deny(rustdoc::broken_intra_doc_links, rustdoc::bare_urls, rust_2018_idioms)]
#![warn(missing_debug_implementations, missing_docs)]

use observability_deps::tracing::subscriber::set_global_default;
use std::io;
use thiserror::Error;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    EnvFilter, Registry,
};

/// The wire format log lines are emitted in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// Human-readable, one line per event, matching the original Python
    /// `logging.getLogger("PartitionCache")` default formatter.
    Logfmt,
    /// Machine-readable JSON, one object per line.
    Json,
}

impl std::str::FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "logfmt" | "text" => Ok(Self::Logfmt),
            "json" => Ok(Self::Json),
            other => Err(format!("unknown log format '{other}', expected logfmt|json")),
        }
    }
}

/// Logging configuration, derivable from CLI flags/environment variables
/// when the `clap` feature is enabled (the default).
#[derive(Debug, Clone)]
#[cfg_attr(feature = "clap", derive(clap::Parser))]
pub struct LoggingConfig {
    /// Log message filter, using `tracing-subscriber`'s `EnvFilter` syntax
    /// (e.g. `partitioncache=debug,sqlx=warn`).
    #[cfg_attr(
        feature = "clap",
        clap(
            long = "log-filter",
            env = "PARTITIONCACHE_LOG_FILTER",
            default_value = "info"
        )
    )]
    pub log_filter: String,

    /// Emit logs as JSON instead of the default human-readable format.
    #[cfg_attr(
        feature = "clap",
        clap(long = "log-format", env = "PARTITIONCACHE_LOG_FORMAT", default_value = "logfmt")
    )]
    pub log_format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            log_filter: "info".to_string(),
            log_format: "logfmt".to_string(),
        }
    }
}

/// Errors building a subscriber.
#[derive(Debug, Error)]
pub enum Error {
    /// The filter string could not be parsed.
    #[error("invalid log filter: {0}")]
    InvalidFilter(#[from] tracing_subscriber::filter::ParseError),

    /// The format string was not recognised.
    #[error("invalid log format: {0}")]
    InvalidFormat(String),

    /// A subscriber was already installed.
    #[error("a global tracing subscriber is already set")]
    AlreadyInstalled,
}

/// Install a global [`tracing`] subscriber built from `config`, writing to
/// stderr. Returns an error rather than panicking if a subscriber is already
/// installed, so embedding applications retain control.
pub fn install_global(config: &LoggingConfig) -> Result<(), Error> {
    let format: LogFormat = config
        .log_format
        .parse()
        .map_err(Error::InvalidFormat)?;
    let filter = EnvFilter::try_new(&config.log_filter)?;

    let subscriber = Registry::default().with(filter);

    let result = match format {
        LogFormat::Json => {
            let layer = fmt::layer()
                .json()
                .with_span_events(FmtSpan::NONE)
                .with_writer(io::stderr);
            set_global_default(subscriber.with(layer))
        }
        LogFormat::Logfmt => {
            let layer = fmt::layer()
                .with_span_events(FmtSpan::NONE)
                .with_writer(io::stderr);
            set_global_default(subscriber.with(layer))
        }
    };

    result.map_err(|_| Error::AlreadyInstalled)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_known_formats() {
        assert_eq!("json".parse::<LogFormat>().unwrap(), LogFormat::Json);
        assert_eq!("logfmt".parse::<LogFormat>().unwrap(), LogFormat::Logfmt);
        assert!("yaml".parse::<LogFormat>().is_err());
    }

    #[test]
    fn default_config_is_valid() {
        let config = LoggingConfig::default();
        assert_eq!(config.log_filter, "info");
    }
}
