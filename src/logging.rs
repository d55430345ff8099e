//! Logging setup shared by both binaries.
//!
//! Events go to the console, and also to `log_file` when one is configured.

use anyhow::{Context, Result};
use std::fs::OpenOptions;
use std::path::Path;
use std::sync::Mutex;
use tracing::{Level, Subscriber};
use tracing_subscriber::{
    filter::{EnvFilter, LevelFilter},
    fmt::layer,
    prelude::*,
    registry,
    registry::LookupSpan,
    Layer,
};

/// Installs the global subscriber.
///
/// `RUST_LOG` overrides `default_level`, e.g. `RUST_LOG=pairlink=debug`.
pub fn init(default_level: Level, log_file: Option<&Path>) -> Result<()> {
    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::from_level(default_level).into())
        .from_env()
        .context("invalid RUST_LOG filter")?;

    let console = layer()
        .with_target(false)
        .with_thread_ids(true)
        .with_file(false)
        .with_line_number(false);

    let file = log_file.map(file_layer).transpose()?;

    registry()
        .with(filter)
        .with(console)
        .with(file)
        .try_init()
        .map_err(|e| anyhow::anyhow!("failed to install tracing subscriber: {}", e))
}

/// A plain-text layer appending to `path`. Parent directories are created.
pub fn file_layer<S>(path: &Path) -> Result<impl Layer<S>>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("failed to create log directory {}", dir.display()))?;
    }

    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("failed to open log file {}", path.display()))?;

    Ok(layer()
        .with_writer(Mutex::new(file))
        .with_ansi(false)
        .with_target(false)
        .with_thread_ids(true))
}
