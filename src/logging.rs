//! Logging Module
//!
//! Structured logging with file output for diagnostics.

use std::path::Path;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const QUIET_TARGETS: &str = "hyper=warn,reqwest=warn,tungstenite=warn,tokio_tungstenite=warn";

/// Initialize logging with console and file output.
///
/// Calling this again after a subscriber is installed leaves the first one in place.
pub fn init(log_dir: &Path) -> anyhow::Result<()> {
    std::fs::create_dir_all(log_dir)?;

    // Daily rotation, keep a week
    let file_appender = RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix("safesignal")
        .filename_suffix("log")
        .max_log_files(7)
        .build(log_dir)?;

    let file_layer = fmt::layer()
        .with_ansi(false)
        .with_target(true)
        .with_writer(file_appender);

    // Console output in debug builds only
    #[cfg(debug_assertions)]
    let console_layer = Some(fmt::layer().with_target(true).pretty());

    #[cfg(not(debug_assertions))]
    let console_layer: Option<fmt::Layer<_>> = None;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| default_filter());

    let subscriber = tracing_subscriber::registry()
        .with(filter)
        .with(file_layer)
        .with(console_layer);

    let _ = tracing::subscriber::set_global_default(subscriber);
    Ok(())
}

fn default_filter() -> EnvFilter {
    let level = if cfg!(debug_assertions) { "debug" } else { "info" };
    EnvFilter::new(format!("{level},{QUIET_TARGETS}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_creates_log_directory_and_tolerates_reinit() {
        let dir = tempfile::tempdir().unwrap();
        let log_dir = dir.path().join("logs");

        init(&log_dir).unwrap();
        init(&log_dir).unwrap();
        assert!(log_dir.is_dir());
    }
}
