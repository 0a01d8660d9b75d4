// SPDX-License-Identifier: GPL-3.0-only

//! Tracing subscriber setup: console output plus optional rotated log files

use std::fs;
use std::path::Path;

use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Registry, fmt, reload};

use crate::config::LogConfig;
use crate::constants::defaults;
use crate::errors::AppError;

/// Map level names accepted on the command line onto filter directives
pub fn normalize_level(level: &str) -> String {
    match level.trim().to_ascii_lowercase().as_str() {
        "err" | "critical" => "error".to_string(),
        "warning" => "warn".to_string(),
        other => other.to_string(),
    }
}

/// RUST_LOG wins over the configured level
fn build_filter(level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(normalize_level(level)))
        .unwrap_or_else(|_| EnvFilter::new(defaults::LOG_LEVEL))
}

/// Daily `pitv.<date>.log` files, oldest deleted beyond the retention count
fn file_appender(dir: &Path, force_mkdirs: bool) -> Result<RollingFileAppender, AppError> {
    if !dir.exists() {
        if !force_mkdirs {
            return Err(AppError::Logging(format!(
                "log directory {} does not exist",
                dir.display()
            )));
        }
        fs::create_dir_all(dir)?;
    }

    RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(defaults::LOG_FILE_PREFIX)
        .filename_suffix(defaults::LOG_FILE_SUFFIX)
        .max_log_files(defaults::LOG_FILES_KEPT)
        .build(dir)
        .map_err(|e| AppError::Logging(format!("log file in {}: {e}", dir.display())))
}

/// Handle for changing the level after a configuration reload
pub struct LogHandle {
    filter: reload::Handle<EnvFilter, Registry>,
}

impl LogHandle {
    pub fn set_level(&self, level: &str) {
        if let Err(e) = self.filter.reload(build_filter(level)) {
            tracing::warn!(error = %e, "Failed to apply new log level");
        }
    }
}

/// Install the global subscriber
///
/// Set RUST_LOG to override the configured level, e.g. `RUST_LOG=pitv=debug`.
pub fn init(config: &LogConfig) -> Result<LogHandle, AppError> {
    let (filter, handle) = reload::Layer::new(build_filter(&config.level));

    let file_layer = match &config.dir {
        Some(dir) => {
            let appender = file_appender(dir, config.force_mkdirs)?;
            Some(fmt::layer().with_ansi(false).with_writer(appender))
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true).with_level(true))
        .with(file_layer)
        .try_init()
        .map_err(|e| AppError::Logging(e.to_string()))?;

    Ok(LogHandle { filter: handle })
}
