//! Log setup for the `pilot` binary.
//!
//! Logs go to a file under `${PILOT_HOME}/logs` so they never mix with the
//! interactive terminal. `PILOT_LOG` overrides the configured filter.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

use crate::config::{LoggingConfig, paths};

pub const LOG_ENV: &str = "PILOT_LOG";

/// Filter directive: `PILOT_LOG` if set and non-empty, else the config.
pub fn filter_directive(config: &LoggingConfig) -> String {
    std::env::var(LOG_ENV)
        .ok()
        .filter(|value| !value.trim().is_empty())
        .unwrap_or_else(|| config.filter.clone())
}

/// Full path of the log file.
pub fn log_file_path(config: &LoggingConfig) -> PathBuf {
    paths::logs_dir().join(&config.file)
}

/// Installs the global subscriber writing to `dir/<config.file>`.
///
/// Keep the returned guard alive for the whole process; dropping it
/// flushes and stops the writer.
///
/// # Errors
/// Returns an error if the filter is invalid, the directory cannot be
/// created, or a global subscriber is already installed.
pub fn init_in(dir: &Path, config: &LoggingConfig) -> Result<WorkerGuard> {
    let directive = filter_directive(config);
    let filter = EnvFilter::try_new(&directive)
        .with_context(|| format!("Invalid log filter: {directive}"))?;

    std::fs::create_dir_all(dir)
        .with_context(|| format!("Failed to create log directory {}", dir.display()))?;
    let appender = tracing_appender::rolling::never(dir, &config.file);
    let (writer, guard) = tracing_appender::non_blocking(appender);

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_ansi(false).with_writer(writer))
        .try_init()
        .context("Failed to initialise tracing subscriber")?;

    Ok(guard)
}

/// Installs the global subscriber at the default log location.
///
/// # Errors
/// See [`init_in`].
pub fn init(config: &LoggingConfig) -> Result<WorkerGuard> {
    init_in(&paths::logs_dir(), config)
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;

    #[test]
    fn test_invalid_filter_is_rejected() {
        let dir = tempdir().unwrap();
        let config = LoggingConfig {
            filter: "pilot=loudest".to_string(),
            ..Default::default()
        };
        if std::env::var(LOG_ENV).is_err() {
            assert!(init_in(dir.path(), &config).is_err());
        }
    }

    #[test]
    fn test_config_filter_used_without_env() {
        let config = LoggingConfig {
            filter: "debug".to_string(),
            ..Default::default()
        };
        if std::env::var(LOG_ENV).is_err() {
            assert_eq!(filter_directive(&config), "debug");
        }
    }
}
