pub mod app;
pub mod collab;
pub mod config;
pub mod download;
pub mod error;
pub mod events;
pub mod http;
pub mod loader;
pub mod manifest;
pub mod model;
pub mod query;
pub mod scheduler;
pub mod storage;
pub mod task;
pub mod transport;

use crate::config::LoggingConfig;
use tracing_subscriber::{prelude::*, EnvFilter};

fn env_filter(logging: &LoggingConfig) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(logging.level.as_deref().unwrap_or("info"))
    })
}

/// Install the global subscriber: stdout, plus a file when configured
pub fn init_logging(logging: &LoggingConfig) -> anyhow::Result<()> {
    if logging.log_to_file {
        let file = std::fs::File::create(&logging.log_file_path).map_err(|e| {
            anyhow::anyhow!("cannot create log file '{}': {}", logging.log_file_path, e)
        })?;

        let file_appender = tracing_subscriber::fmt::layer()
            .with_file(true)
            .with_line_number(true)
            .with_ansi(false)
            .with_writer(std::sync::Mutex::new(file));

        let stdout_appender = tracing_subscriber::fmt::layer()
            .with_file(true)
            .with_line_number(true);

        tracing_subscriber::registry()
            .with(env_filter(logging))
            .with(file_appender)
            .with(stdout_appender)
            .try_init()
            .map_err(|e| anyhow::anyhow!("failed to initialize logging: {}", e))?;
    } else {
        tracing_subscriber::registry()
            .with(env_filter(logging))
            .with(
                tracing_subscriber::fmt::layer()
                    .with_file(true)
                    .with_line_number(true),
            )
            .try_init()
            .map_err(|e| anyhow::anyhow!("failed to initialize logging: {}", e))?;
    }
    Ok(())
}
