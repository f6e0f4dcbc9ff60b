use crate::utils::error::{Result, RozError};
use std::fs::OpenOptions;
use std::path::Path;
use std::sync::Mutex;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Map the level names used in deployment env files (`INGEST_LOG_LEVEL=DEBUG`)
/// onto tracing directives.
pub fn normalize_level(level: &str) -> &'static str {
    match level.trim().to_ascii_uppercase().as_str() {
        "TRACE" | "NOTSET" => "trace",
        "DEBUG" => "debug",
        "WARN" | "WARNING" => "warn",
        "ERROR" | "CRITICAL" => "error",
        _ => "info",
    }
}

fn build_filter(level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("roz={},warn", normalize_level(level))))
}

/// Install the global subscriber for one roz service.
///
/// With a log file, compact lines are appended to it without ANSI colours;
/// otherwise they go to stdout. `json` switches to one JSON object per line.
pub fn init_logger(service: &str, log_file: Option<&Path>, level: &str, json: bool) -> Result<()> {
    let filter = build_filter(level);

    let writer = match log_file {
        Some(path) => {
            if let Some(parent) = path.parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent)?;
                }
            }
            let file = OpenOptions::new().create(true).append(true).open(path)?;
            Some(Mutex::new(file))
        }
        None => None,
    };

    let registry = tracing_subscriber::registry().with(filter);

    let init = match (writer, json) {
        (Some(file), true) => registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(file))
            .try_init(),
        (Some(file), false) => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .with_ansi(false)
                    .with_target(false)
                    .with_writer(file)
                    .compact(),
            )
            .try_init(),
        (None, true) => registry
            .with(tracing_subscriber::fmt::layer().json())
            .try_init(),
        (None, false) => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .with_target(false)
                    .with_thread_ids(false)
                    .with_file(false)
                    .with_line_number(false)
                    .compact(),
            )
            .try_init(),
    };

    init.map_err(|e| RozError::config(format!("failed to install logger: {}", e)))?;

    tracing::debug!(service, "logger initialised");
    Ok(())
}
