//! Logging setup shared by the binaries

use crate::config::LoggingConfig;
use anyhow::{Context, Result};
use std::ffi::OsString;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::EnvFilter;

/// Level override read by both binaries
pub const LOG_LEVEL_ENV: &str = "UNITY_CLI_LOG";

pub const LOG_FILE_NAME: &str = "relay.log";

/// Map a level name to a tracing level; `WARNING` and `CRITICAL` are accepted
pub fn parse_level(name: &str) -> Option<Level> {
    match name.trim().to_ascii_uppercase().as_str() {
        "DEBUG" => Some(Level::DEBUG),
        "INFO" => Some(Level::INFO),
        "WARN" | "WARNING" => Some(Level::WARN),
        "ERROR" | "CRITICAL" => Some(Level::ERROR),
        _ => None,
    }
}

/// `--debug` wins, then the env override, then the configured level, then INFO
pub fn resolve_log_level(debug: bool, env_value: Option<&str>, configured: &str) -> Level {
    if debug {
        return Level::DEBUG;
    }
    env_value
        .and_then(parse_level)
        .or_else(|| parse_level(configured))
        .unwrap_or(Level::INFO)
}

/// `$XDG_STATE_HOME/unity-cli/logs`, defaulting to `~/.local/state/unity-cli/logs`
pub fn default_log_dir(xdg_state_home: Option<OsString>, home: Option<PathBuf>) -> PathBuf {
    let state_home = match xdg_state_home {
        Some(dir) if !dir.is_empty() => PathBuf::from(dir),
        _ => home
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".local")
            .join("state"),
    };
    state_home.join("unity-cli").join("logs")
}

pub fn log_dir(config: &LoggingConfig) -> PathBuf {
    match &config.log_dir {
        Some(dir) => dir.clone(),
        None => default_log_dir(std::env::var_os("XDG_STATE_HOME"), dirs::home_dir()),
    }
}

fn open_log_file(dir: &Path) -> std::io::Result<(PathBuf, std::fs::File)> {
    std::fs::create_dir_all(dir)?;
    let path = dir.join(LOG_FILE_NAME);
    let file = OpenOptions::new().create(true).append(true).open(&path)?;
    Ok((path, file))
}

/// Install the global subscriber
///
/// Always logs to stderr. With `to_file`, also appends to the relay log file
/// when its directory can be created. Returns the log file path in use.
pub fn init(config: &LoggingConfig, debug: bool, to_file: bool) -> Result<Option<PathBuf>> {
    let env_level = std::env::var(LOG_LEVEL_ENV).ok();
    let level = resolve_log_level(debug, env_level.as_deref(), &config.level);
    let filter = EnvFilter::from_default_env().add_directive(level.into());

    let mut file_error = None;
    let file = if to_file && config.file {
        match open_log_file(&log_dir(config)) {
            Ok(opened) => Some(opened),
            Err(e) => {
                file_error = Some(e);
                None
            }
        }
    } else {
        None
    };
    let log_path = file.as_ref().map(|(path, _)| path.clone());

    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false);
    let file_layer = file.map(|(_, file)| {
        tracing_subscriber::fmt::layer()
            .with_writer(Arc::new(file))
            .with_ansi(false)
    });

    let subscriber = tracing_subscriber::registry()
        .with(stderr_layer)
        .with(file_layer)
        .with(filter);
    tracing::subscriber::set_global_default(subscriber)
        .context("Failed to install tracing subscriber")?;

    if let Some(e) = file_error {
        tracing::warn!("Log file unavailable, logging to stderr only: {}", e);
    }
    Ok(log_path)
}
