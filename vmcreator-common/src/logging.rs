//! Logging initialization using tracing.

use anyhow::{anyhow, Result};
use std::str::FromStr;
use tracing::debug;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Output format of the log stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// Human-readable lines on stderr
    #[default]
    Pretty,
    /// One JSON object per event
    Json,
}

impl FromStr for LogFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "pretty" | "text" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            other => Err(anyhow!("unknown log format: {}", other)),
        }
    }
}

/// Log level implied by the `--debug` switch.
pub fn level_for(debug: bool) -> &'static str {
    if debug {
        "debug"
    } else {
        "info"
    }
}

/// Initialize the tracing subscriber.
///
/// `RUST_LOG` takes precedence over `level` when set.
pub fn init_logging(format: LogFormat, level: &str) -> Result<()> {
    install(format, env_filter(level))
}

/// Initialize logging for a command-line run.
///
/// `--debug` pins the level to `debug` regardless of `RUST_LOG`; without
/// it `RUST_LOG` may still override the default `info`.
pub fn init_cli_logging(format: LogFormat, debug: bool) -> Result<()> {
    install(format, cli_filter(debug))
}

/// Initialize human-readable logging on stderr.
///
/// # Arguments
/// * `level` - Log level string (trace, debug, info, warn, error)
pub fn init_logging_pretty(level: &str) -> Result<()> {
    install(LogFormat::Pretty, env_filter(level))
}

/// Initialize logging with JSON output format.
/// Suitable for feeding a log aggregator.
pub fn init_logging_json(level: &str) -> Result<()> {
    install(LogFormat::Json, env_filter(level))
}

fn env_filter(level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level))
}

fn cli_filter(debug: bool) -> EnvFilter {
    if debug {
        EnvFilter::new(level_for(true))
    } else {
        env_filter(level_for(false))
    }
}

fn install(format: LogFormat, filter: EnvFilter) -> Result<()> {
    let registry = tracing_subscriber::registry().with(filter);
    let installed = match format {
        LogFormat::Pretty => registry
            .with(
                fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_target(true)
                    .with_file(true)
                    .with_line_number(true),
            )
            .try_init(),
        LogFormat::Json => registry
            .with(fmt::layer().json().with_writer(std::io::stderr).with_target(true))
            .try_init(),
    };
    installed.map_err(|e| anyhow!("failed to initialize logging: {}", e))?;

    debug!(format = ?format, "Logging initialized");
    Ok(())
}
