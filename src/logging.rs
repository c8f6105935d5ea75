//! Tracing infrastructure.
//!
//! Structured, async-aware logging built on `tracing` and
//! `tracing-subscriber`:
//! - environment-based filtering (`RUST_LOG`, falling back to a default level)
//! - pretty, compact, or JSON output
//!
//! The library itself only emits events; the binary (or a test harness) calls
//! [`init`] once at startup.
//!
//! # Example
//! ```no_run
//! use bench_broker::logging::{self, LogFormat};
//!
//! logging::init(LogFormat::Compact, "info").expect("tracing init");
//! tracing::info!("broker starting");
//! ```

use std::str::FromStr;

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Output format for log events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// Pretty-printed with colors, for interactive use.
    Pretty,
    /// Single-line, no colors, for CI logs.
    Compact,
    /// JSON lines, for log aggregation.
    Json,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pretty" => Ok(LogFormat::Pretty),
            "compact" => Ok(LogFormat::Compact),
            "json" => Ok(LogFormat::Json),
            other => Err(format!(
                "unknown log format '{other}' (expected pretty, compact, or json)"
            )),
        }
    }
}

/// Initialize the global tracing subscriber.
///
/// `default_level` applies when `RUST_LOG` is unset. Returns an error when a
/// global subscriber is already installed.
pub fn init(format: LogFormat, default_level: &str) -> Result<(), String> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_level.to_string()));

    let registry = tracing_subscriber::registry().with(filter);
    let result = match format {
        LogFormat::Pretty => registry
            .with(fmt::layer().with_target(true).with_thread_names(true))
            .try_init(),
        LogFormat::Compact => registry
            .with(fmt::layer().compact().with_ansi(false))
            .try_init(),
        LogFormat::Json => registry.with(fmt::layer().json()).try_init(),
    };
    result.map_err(|err| format!("failed to initialize tracing: {err}"))
}
