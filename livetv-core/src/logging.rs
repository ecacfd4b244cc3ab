use std::fs::OpenOptions;
use std::sync::Arc;

use anyhow::Context;
use tracing::Level;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan, writer::BoxMakeWriter},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Layer,
};

use crate::config::LoggingConfig;

/// Install the global tracing subscriber.
///
/// `RUST_LOG` wins over `level`. Logs go to stderr, or to `file_path` when
/// set, so stdout stays free for player events.
pub fn init_logging(config: &LoggingConfig) -> anyhow::Result<()> {
    let level = log_level(&config.level)?;
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.as_str().to_lowercase()));
    let (writer, to_terminal) = log_writer(config)?;

    let output = if config.format == "json" {
        fmt::layer()
            .json()
            .with_span_events(FmtSpan::CLOSE)
            .with_current_span(true)
            .with_span_list(true)
            .with_file(true)
            .with_line_number(true)
            .with_writer(writer)
            .boxed()
    } else {
        fmt::layer()
            .pretty()
            .with_ansi(to_terminal)
            .with_file(false)
            .with_line_number(true)
            .with_writer(writer)
            .boxed()
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(output)
        .try_init()
        .context("A global tracing subscriber is already installed")
}

/// Returns the writer and whether it is an interactive stream.
fn log_writer(config: &LoggingConfig) -> anyhow::Result<(BoxMakeWriter, bool)> {
    let Some(path) = &config.file_path else {
        return Ok((BoxMakeWriter::new(std::io::stderr), true));
    };
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("Failed to open log file {path}"))?;
    Ok((BoxMakeWriter::new(Arc::new(file)), false))
}

fn log_level(level: &str) -> anyhow::Result<Level> {
    Ok(match level.to_ascii_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" | "warning" => Level::WARN,
        "error" => Level::ERROR,
        other => anyhow::bail!("Invalid log level: {other}"),
    })
}
