pub mod queue;
pub mod sink;

use crate::plan::LoggerConfig;
use std::fs::{self, OpenOptions};
use std::io;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Environment variable overriding the log filter, `RUST_LOG`-style.
pub const LOG_FILTER_ENV: &str = "PUP_LOG";

/// Keeps the file appender worker alive for the duration of the program.
pub struct FileLoggerGuard {
    _worker: Option<WorkerGuard>,
}

/// Installs the global tracing subscriber: a console layer honouring the
/// `decorate`/`colors` options, plus an appending file layer when
/// `logger.stdout` names a path.
pub fn init_tracing(logger: &LoggerConfig, level: &str) -> Result<FileLoggerGuard, io::Error> {
    let filter =
        EnvFilter::try_from_env(LOG_FILTER_ENV).unwrap_or_else(|_| EnvFilter::new(level));
    let decorate = logger.decorate.unwrap_or(true);
    let colors = logger.colors.unwrap_or(true);

    let console = fmt::layer()
        .with_ansi(colors)
        .with_target(decorate)
        .with_level(decorate);

    match &logger.stdout {
        Some(path) => {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            let file = OpenOptions::new().create(true).append(true).open(path)?;
            let (writer, guard) = tracing_appender::non_blocking(file);
            tracing_subscriber::registry()
                .with(filter)
                .with(console)
                .with(fmt::layer().with_writer(writer).with_ansi(false))
                .init();
            Ok(FileLoggerGuard {
                _worker: Some(guard),
            })
        }
        None => {
            tracing_subscriber::registry()
                .with(filter)
                .with(console)
                .init();
            Ok(FileLoggerGuard { _worker: None })
        }
    }
}
