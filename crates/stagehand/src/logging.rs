use anyhow::Result;
use std::fs::{self, File};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::config::{LogOutput, LoggingConfig};

/// Install the global `tracing` subscriber described by `config`.
///
/// Fails if a subscriber is already installed or the log file cannot be created.
pub fn setup_global_logging(config: &LoggingConfig) -> Result<()> {
    let level = config.tracing_level()?;
    // Format: <level>,stagehand=<level>
    let filter = format!("{},stagehand={}", level.as_str(), level.as_str());

    match config.output {
        LogOutput::File => {
            let log_path = config
                .file_path
                .as_deref()
                .ok_or_else(|| anyhow::anyhow!("logging.output = \"file\" needs file_path"))?;
            if let Some(parent) = log_path.parent() {
                fs::create_dir_all(parent)?;
            }
            let file = File::create(log_path)?;
            let file_writer = std::sync::Mutex::new(file).with_max_level(tracing::Level::TRACE);

            let file_layer = fmt::layer()
                .with_writer(file_writer)
                .with_thread_ids(true)
                .with_line_number(true)
                .with_file(true)
                .with_target(true)
                .with_ansi(false)
                .with_filter(EnvFilter::builder().parse(&filter)?);

            tracing_subscriber::registry()
                .with(file_layer)
                .try_init()
                .map_err(|e| anyhow::anyhow!("Failed to initialize logging: {}", e))?;
        }
        LogOutput::Stdout => {
            let stdout_layer = fmt::layer()
                .with_writer(std::io::stdout)
                .with_thread_ids(true)
                .with_target(true)
                .with_ansi(true)
                .pretty()
                .with_filter(EnvFilter::builder().parse(&filter)?);

            tracing_subscriber::registry()
                .with(stdout_layer)
                .try_init()
                .map_err(|e| anyhow::anyhow!("Failed to initialize logging: {}", e))?;
        }
    }

    Ok(())
}
