//! Tracing bootstrap for hosts embedding the engine: env-filtered stdout
//! plus an optional daily-rolling JSON file.

use std::path::PathBuf;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, Registry, fmt};

/// Installs the global subscriber. `RUST_LOG` wins over `default_level`.
/// Keep the returned guard alive for as long as file logging should flush.
pub fn init_tracing(
    default_level: &str,
    log_dir: Option<PathBuf>,
) -> anyhow::Result<Option<WorkerGuard>> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let stdout = fmt::layer().with_target(true);

    match log_dir {
        Some(dir) => {
            let appender = RollingFileAppender::new(Rotation::DAILY, dir, "convoflow.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let file = fmt::layer().json().with_writer(writer);
            Registry::default()
                .with(filter)
                .with(stdout)
                .with(file)
                .try_init()?;
            Ok(Some(guard))
        }
        None => {
            Registry::default().with(filter).with(stdout).try_init()?;
            Ok(None)
        }
    }
}
