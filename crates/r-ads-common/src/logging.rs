//! ---
//! ads_section: "01-core-functionality"
//! ads_subsection: "module"
//! ads_type: "source"
//! ads_scope: "code"
//! ads_description: "Shared primitives and utilities for the adapter SDK."
//! ads_version: "v0.0.0-prealpha"
//! ads_owner: "tbd"
//! ---
use anyhow::{Context, Result};
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::daily;
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt::{self, time::UtcTime};
use tracing_subscriber::layer::{Layer, SubscriberExt};
use tracing_subscriber::util::SubscriberInitExt;

use crate::config::LoggingConfig;

/// Environment variable holding the log filter directive.
pub const LOG_ENV: &str = "R_ADS_LOG";

const DEFAULT_DIRECTIVE: &str = "info";

/// Flush guards of the non-blocking writers; they live for the rest of the process.
struct LogGuards {
    _file: WorkerGuard,
    _stdout: WorkerGuard,
}

static GUARDS: OnceCell<LogGuards> = OnceCell::new();

/// Available stdout log formats.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum LogFormat {
    StructuredJson,
    #[default]
    Pretty,
}

/// Resolve the filter directive: `R_ADS_LOG`, then `RUST_LOG`, then `info`.
pub fn build_filter() -> EnvFilter {
    match std::env::var(LOG_ENV) {
        Ok(directive) => EnvFilter::try_new(&directive).unwrap_or_else(|err| {
            eprintln!(
                "invalid {} directive ({}); defaulting to {}",
                LOG_ENV, err, DEFAULT_DIRECTIVE
            );
            EnvFilter::new(DEFAULT_DIRECTIVE)
        }),
        Err(_) => EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(DEFAULT_DIRECTIVE)),
    }
}

/// Install the global tracing subscriber for a host process.
///
/// Library crates never call this. Stdout gets `config.format` and every event is
/// also appended as JSON to a daily file under `config.directory`. Returns `false`
/// when a subscriber was already installed.
pub fn init_tracing(service_name: &str, config: &LoggingConfig) -> Result<bool> {
    if GUARDS.get().is_some() {
        return Ok(false);
    }
    std::fs::create_dir_all(&config.directory).with_context(|| {
        format!("unable to create log directory {}", config.directory.display())
    })?;
    let prefix = config.file_prefix.as_deref().unwrap_or("r-ads");
    let file_name = format!("{}-{}.log", prefix, service_name);

    let (file_writer, file_guard) =
        tracing_appender::non_blocking(daily(&config.directory, file_name));
    let (stdout_writer, stdout_guard) = tracing_appender::non_blocking(std::io::stdout());
    if GUARDS
        .set(LogGuards {
            _file: file_guard,
            _stdout: stdout_guard,
        })
        .is_err()
    {
        return Ok(false);
    }

    let stdout_layer = match config.format {
        LogFormat::StructuredJson => fmt::layer()
            .with_target(false)
            .with_timer(UtcTime::rfc_3339())
            .json()
            .with_writer(stdout_writer)
            .boxed(),
        LogFormat::Pretty => fmt::layer()
            .with_timer(UtcTime::rfc_3339())
            .with_writer(stdout_writer)
            .boxed(),
    };
    let file_layer = fmt::layer()
        .with_timer(UtcTime::rfc_3339())
        .json()
        .with_writer(file_writer);

    let installed = tracing_subscriber::registry()
        .with(build_filter())
        .with(stdout_layer)
        .with(file_layer)
        .try_init()
        .is_ok();
    if installed {
        info!(
            service = %service_name,
            log_dir = %config.directory.display(),
            format = ?config.format,
            "tracing initialised"
        );
    }
    Ok(installed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_install_is_a_no_op() {
        let dir = tempfile::tempdir().unwrap();
        let config = LoggingConfig {
            directory: dir.path().join("logs"),
            format: LogFormat::StructuredJson,
            file_prefix: Some("test".into()),
        };
        init_tracing("unit", &config).unwrap();
        assert!(config.directory.is_dir());
        assert!(!init_tracing("unit", &config).unwrap());
    }
}
