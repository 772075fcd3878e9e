//! Observability: structured logging and operation metrics.

mod logging;
mod metrics;

pub use logging::{LogFormat, LoggingConfig};
pub use metrics::{
    OPERATION_DURATION_SECONDS, OPERATIONS_TOTAL, RETRIES_TOTAL, record_operation, record_retry,
};

use crate::config::LoggingSettings;
use crate::{Error, Result};
use std::fs::OpenOptions;
use std::path::Path;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{Layer, Registry};

static INSTALLED: AtomicBool = AtomicBool::new(false);

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

/// Initializes logging from config settings with env overrides.
///
/// # Errors
///
/// Returns an error if logging has already been initialized or the log file
/// cannot be opened.
pub fn init_from_settings(settings: &LoggingSettings, verbose: bool) -> Result<()> {
    init(LoggingConfig::from_settings(settings, verbose))
}

/// Installs the global tracing subscriber.
///
/// Without a log file, events go to stderr so command output on stdout
/// stays clean.
///
/// # Errors
///
/// Returns an error if logging has already been initialized or the log file
/// cannot be opened.
pub fn init(config: LoggingConfig) -> Result<()> {
    if INSTALLED.swap(true, Ordering::SeqCst) {
        return Err(init_failure("observability already initialized"));
    }

    let installed = output_layer(&config).and_then(|layer| {
        tracing_subscriber::registry()
            .with(layer)
            .with(config.filter)
            .try_init()
            .map_err(|e| init_failure(&e.to_string()))
    });
    if installed.is_err() {
        INSTALLED.store(false, Ordering::SeqCst);
    }
    installed
}

/// Builds the formatting layer for the configured sink and format.
fn output_layer(config: &LoggingConfig) -> Result<BoxedLayer> {
    let (writer, ansi) = match &config.file {
        Some(path) => (log_file_writer(path)?, false),
        None => (BoxMakeWriter::new(std::io::stderr), true),
    };

    let layer = tracing_subscriber::fmt::layer()
        .with_writer(writer)
        .with_target(true);
    Ok(match config.format {
        LogFormat::Json => layer
            .json()
            .with_current_span(true)
            .with_span_list(true)
            .boxed(),
        LogFormat::Pretty => layer.with_ansi(ansi).boxed(),
    })
}

/// Opens `path` in append mode, creating missing parent directories.
fn log_file_writer(path: &Path) -> Result<BoxMakeWriter> {
    if let Some(dir) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(dir).map_err(|e| Error::operation("create_log_dir", e))?;
    }
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| Error::operation("open_log_file", format!("{}: {e}", path.display())))?;
    Ok(BoxMakeWriter::new(Mutex::new(file)))
}

fn init_failure(cause: &str) -> Error {
    Error::operation("observability_init", cause)
}
