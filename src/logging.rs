//! Tracing subscriber setup for the `tumbler` binary.
//!
//! Library code only emits `tracing` events; this is the one place that
//! decides where they go. `RUST_LOG` wins over `[logging] level`.

use std::path::Path;

use anyhow::{Context, Result};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

use crate::config::{LogFormat, LoggingConfig};

/// Install the global subscriber.
///
/// Returns the file writer's guard when `[logging] file` is set; dropping it
/// flushes and stops the background writer, so keep it alive for the life of
/// the process. Calling this twice is harmless; the second call is ignored.
pub fn init_logging(
    config: &LoggingConfig,
    workspace: &Path,
    verbose: bool,
) -> Result<Option<WorkerGuard>> {
    let default_level = if verbose { "debug" } else { config.level.as_str() };
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_level))
        .with_context(|| format!("Invalid log level '{}'", default_level))?;

    let text_layer = (config.format == LogFormat::Text)
        .then(|| fmt::layer().with_target(false).with_writer(std::io::stderr));
    let json_layer = (config.format == LogFormat::Json)
        .then(|| fmt::layer().json().with_writer(std::io::stderr));

    let (file_layer, guard) = match &config.file {
        Some(file) => {
            let path = if file.is_absolute() {
                file.clone()
            } else {
                workspace.join(file)
            };
            let dir = path.parent().unwrap_or(workspace);
            let name = path
                .file_name()
                .with_context(|| format!("Log file path has no file name: {}", path.display()))?;
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create log directory {}", dir.display()))?;
            let appender = tracing_appender::rolling::never(dir, name);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer().json().with_ansi(false).with_writer(writer);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(text_layer)
        .with(json_layer)
        .with(file_layer)
        .try_init()
        .ok();

    Ok(guard)
}
