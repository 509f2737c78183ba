//! Logging bootstrap: stdout plus an optional non-blocking rolling file.

use anyhow::Context as _;
use camino::Utf8Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, fmt};

/// Keeps the non-blocking writers alive for the lifetime of the process.
pub struct LoggerGuard {
    _file_guard: Option<WorkerGuard>,
    _stdio_guard: WorkerGuard,
}

pub fn init(log_filter: &str, log_file: Option<&Utf8Path>) -> anyhow::Result<LoggerGuard> {
    let env_filter = EnvFilter::try_new(log_filter).context("invalid log filtering directives")?;

    let (stdio_writer, stdio_guard) = tracing_appender::non_blocking(std::io::stdout());
    let stdio_layer = fmt::layer().with_writer(stdio_writer);

    let (file_layer, file_guard) = match log_file {
        Some(path) => {
            let folder = path.parent().context("invalid log path (parent)")?;
            let prefix = path.file_name().context("invalid log path (file_name)")?;
            let appender = tracing_appender::rolling::daily(folder, prefix);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer().with_writer(writer).with_ansi(false);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(stdio_layer)
        .with(file_layer)
        .with(env_filter)
        .init();

    Ok(LoggerGuard {
        _file_guard: file_guard,
        _stdio_guard: stdio_guard,
    })
}
