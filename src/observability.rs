//! Logging configuration, subscriber setup, and shared lifecycle events.

use std::env;

use thiserror::Error;
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::config::RunConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Pretty,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
    pub include_target: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
            include_target: true,
        }
    }
}

#[derive(Debug, Error)]
pub enum LoggingInitError {
    #[error("logging already initialized: {0}")]
    AlreadyInitialized(#[from] tracing::subscriber::SetGlobalDefaultError),
}

pub fn logging_config_from_env() -> LoggingConfig {
    let defaults = LoggingConfig::default();

    let level = env::var("INDEXGAP_LOG_LEVEL")
        .ok()
        .map(|raw| raw.trim().to_string())
        .filter(|raw| !raw.is_empty())
        .unwrap_or(defaults.level);
    let format = env::var("INDEXGAP_LOG_FORMAT")
        .ok()
        .and_then(|raw| parse_log_format(&raw))
        .unwrap_or(defaults.format);
    let include_target = env::var("INDEXGAP_LOG_TARGET")
        .ok()
        .and_then(|raw| parse_bool(&raw))
        .unwrap_or(defaults.include_target);

    LoggingConfig {
        level,
        format,
        include_target,
    }
}

pub fn init_logging(config: &LoggingConfig) -> Result<(), LoggingInitError> {
    let env_filter = EnvFilter::try_new(&config.level).unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(config.include_target)
        .with_ansi(config.format == LogFormat::Pretty);

    match config.format {
        LogFormat::Json => tracing::subscriber::set_global_default(builder.json().finish())?,
        LogFormat::Pretty => tracing::subscriber::set_global_default(builder.pretty().finish())?,
    }

    Ok(())
}

pub fn log_app_start(component: &'static str, logging: &LoggingConfig) {
    info!(
        component,
        event = "app.start",
        log_level = %logging.level,
        log_format = ?logging.format,
        include_target = logging.include_target
    );
}

pub fn log_run_config(component: &'static str, cfg: &RunConfig) {
    info!(
        component,
        event = "app.config",
        store_path = %cfg.store_path.display(),
        start = %cfg.start,
        end = %cfg.end,
        tolerated_gap_days = cfg.tolerated_gap_days,
        max_passes = cfg.max_passes
    );
}

pub fn log_app_finish(component: &'static str, elapsed_ms: u128) {
    info!(component, event = "app.finish", elapsed_ms = elapsed_ms as u64);
}

fn parse_log_format(raw: &str) -> Option<LogFormat> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "json" => Some(LogFormat::Json),
        "pretty" | "text" => Some(LogFormat::Pretty),
        _ => None,
    }
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
