//! Tracing subscriber setup.
//!
//! The server installs a registry with an `EnvFilter`, a stderr layer
//! (pretty or JSON) and, when `logging.directory` is set, a daily-rolling
//! file layer. One-shot CLI commands only get a compact `warn` layer.

use anyhow::{Context, Result};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

use crate::config::{LogFormat, LoggingSection};

const LOG_FILE_PREFIX: &str = "agentdeck.log";

/// Build the filter: `RUST_LOG` wins, then `verbose`, then the configured
/// level.
pub fn build_filter(rust_log: Option<&str>, level: &str, verbose: bool) -> Result<EnvFilter> {
    if let Some(directives) = rust_log.filter(|d| !d.trim().is_empty()) {
        return EnvFilter::try_new(directives).context("Invalid RUST_LOG directives");
    }
    let level = if verbose { "debug" } else { level };
    EnvFilter::try_new(level).with_context(|| format!("Invalid logging.level '{}'", level))
}

/// Install the global subscriber for the server.
///
/// The returned guard flushes the file writer on drop and must be held for
/// the life of the process.
pub fn init_tracing(section: &LoggingSection, verbose: bool) -> Result<Option<WorkerGuard>> {
    let rust_log = std::env::var("RUST_LOG").ok();
    let filter = build_filter(rust_log.as_deref(), &section.level, verbose)?;

    let (pretty, json) = match section.format {
        LogFormat::Pretty => (Some(fmt::layer().with_writer(std::io::stderr)), None),
        LogFormat::Json => (
            None,
            Some(
                fmt::layer()
                    .json()
                    .with_target(true)
                    .with_writer(std::io::stderr),
            ),
        ),
    };

    let (file_layer, guard) = match &section.directory {
        Some(dir) => {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create log directory {}", dir.display()))?;
            let appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (
                Some(fmt::layer().with_ansi(false).with_writer(writer)),
                Some(guard),
            )
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(pretty)
        .with(json)
        .with(file_layer)
        .try_init()
        .context("Failed to install tracing subscriber")?;

    Ok(guard)
}

/// Compact stderr logging for one-shot commands. A no-op if a subscriber
/// is already installed.
pub fn init_cli_tracing(verbose: bool) {
    let level = if verbose { "debug" } else { "warn" };
    let _ = fmt()
        .with_env_filter(EnvFilter::new(level))
        .with_writer(std::io::stderr)
        .compact()
        .without_time()
        .try_init();
}
