//! Configuration management

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_RELAY_HOST: &str = "127.0.0.1";
pub const DEFAULT_RELAY_PORT: u16 = 6500;
pub const DEFAULT_TIMEOUT_MS: u64 = 30_000;

/// Connect timeout in seconds
pub const DEFAULT_CONNECT_TIMEOUT: f64 = 5.0;

/// Per-project config file name
pub const CONFIG_FILE_NAME: &str = ".unity-cli.toml";

/// Main configuration structure
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub client: ClientConfig,
    pub server: ServerConfig,
    pub logging: LoggingConfig,
}

/// Client-side settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Relay server host
    pub relay_host: String,

    /// Relay server port
    pub relay_port: u16,

    /// Socket connect timeout in seconds
    pub timeout: f64,

    /// Command execution timeout in milliseconds
    pub timeout_ms: u64,

    /// Target instance selector
    pub instance: Option<String>,

    /// Initial retry backoff in milliseconds
    pub retry_initial_ms: u64,

    /// Maximum retry backoff in milliseconds
    pub retry_max_ms: u64,

    /// Total retry budget in milliseconds
    pub retry_max_time_ms: u64,

    /// Status file directory override
    pub status_dir: Option<PathBuf>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            relay_host: DEFAULT_RELAY_HOST.to_string(),
            relay_port: DEFAULT_RELAY_PORT,
            timeout: DEFAULT_CONNECT_TIMEOUT,
            timeout_ms: DEFAULT_TIMEOUT_MS,
            instance: None,
            retry_initial_ms: 500,
            retry_max_ms: 8_000,
            retry_max_time_ms: 30_000,
            status_dir: None,
        }
    }
}

impl ClientConfig {
    /// Falls back to the default when `timeout` is not a usable duration
    pub fn connect_timeout(&self) -> Duration {
        Duration::try_from_secs_f64(self.timeout)
            .ok()
            .filter(|timeout| !timeout.is_zero())
            .unwrap_or(Duration::from_secs_f64(DEFAULT_CONNECT_TIMEOUT))
    }

    pub fn relay_addr(&self) -> String {
        format!("{}:{}", self.relay_host, self.relay_port)
    }
}

/// Relay server settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Bind host
    pub host: String,

    /// Bind port (0 picks a free port)
    pub port: u16,

    /// Request timeout when the client does not send `timeout_ms`
    pub request_timeout_ms: u64,

    /// How long a dropped instance stays listed as disconnected
    pub disconnect_grace_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_RELAY_HOST.to_string(),
            port: DEFAULT_RELAY_PORT,
            request_timeout_ms: DEFAULT_TIMEOUT_MS,
            disconnect_grace_ms: 5_000,
        }
    }
}

impl ServerConfig {
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn disconnect_grace(&self) -> Duration {
        Duration::from_millis(self.disconnect_grace_ms)
    }
}

/// Logging settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default level when neither `--debug` nor `UNITY_CLI_LOG` is set
    pub level: String,

    /// Also write the relay log to a file
    pub file: bool,

    /// Log directory override
    pub log_dir: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "INFO".to_string(),
            file: true,
            log_dir: None,
        }
    }
}

impl Config {
    /// Load config from an explicit path, or search the usual places
    ///
    /// Missing files fall back to defaults; a file that exists but does not
    /// parse is an error.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        let path = match explicit {
            Some(path) => Some(path.to_path_buf()),
            None => {
                let cwd = std::env::current_dir().context("Failed to read current directory")?;
                Self::find_config_file(&cwd)
            }
        };

        match path {
            Some(path) if path.exists() => Self::load_from(&path),
            Some(path) if explicit.is_some() => {
                bail!("Config file not found: {}", path.display())
            }
            _ => Ok(Config::default()),
        }
    }

    /// Parse and validate a config file
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse {}", path.display()))?;
        config.validate()?;
        tracing::debug!("Loaded config from {}", path.display());
        Ok(config)
    }

    /// Look in `start`, then the enclosing Unity project root, then the user config dir
    pub fn find_config_file(start: &Path) -> Option<PathBuf> {
        let local = start.join(CONFIG_FILE_NAME);
        if local.exists() {
            return Some(local);
        }

        if let Some(root) = find_project_root(start) {
            let in_project = root.join(CONFIG_FILE_NAME);
            if in_project.exists() {
                return Some(in_project);
            }
        }

        let user = Self::user_config_path();
        user.exists().then_some(user)
    }

    /// Get the user-level config file path
    pub fn user_config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("unity-relay")
            .join("config.toml")
    }

    pub fn validate(&self) -> Result<()> {
        let client = &self.client;
        if client.relay_port == 0 {
            bail!("client.relay_port must be between 1 and 65535");
        }
        if !(client.timeout > 0.0 && client.timeout.is_finite()) {
            bail!("client.timeout must be a positive number of seconds");
        }
        for (name, value) in [
            ("client.timeout_ms", client.timeout_ms),
            ("client.retry_initial_ms", client.retry_initial_ms),
            ("client.retry_max_ms", client.retry_max_ms),
            ("client.retry_max_time_ms", client.retry_max_time_ms),
            ("server.request_timeout_ms", self.server.request_timeout_ms),
        ] {
            if value == 0 {
                bail!("{} must be greater than 0", name);
            }
        }
        Ok(())
    }

    /// Render the config as TOML
    pub fn to_toml(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }
}

/// First ancestor of `start` that looks like a Unity project
pub fn find_project_root(start: &Path) -> Option<PathBuf> {
    start
        .ancestors()
        .find(|dir| dir.join("Assets").is_dir() && dir.join("ProjectSettings").is_dir())
        .map(Path::to_path_buf)
}
