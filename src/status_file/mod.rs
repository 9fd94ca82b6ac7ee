//! Status-file fallback
//!
//! Instances write a small JSON snapshot of their status to
//! `status-{hash}.json` in a shared directory. Readers consult it only to
//! answer "is this instance reloading right now" when the socket cannot;
//! every read is best-effort and never fails.

use crate::config::{DEFAULT_RELAY_HOST, DEFAULT_RELAY_PORT};
use crate::registry::{matches_path_suffix, normalize_selector};
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use sha1::{Digest, Sha1};
use std::ffi::OsString;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable overriding the status directory
pub const STATUS_DIR_ENV: &str = "UNITY_BRIDGE_STATUS_DIR";

/// Default directory name under the home directory
pub const STATUS_DIR_NAME: &str = ".unity-bridge";

/// Status files older than this are treated as abandoned
pub const DEFAULT_MAX_AGE: Duration = Duration::from_secs(120);

/// Status an instance advertises through its status file
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileStatus {
    #[default]
    Ready,
    Reloading,
    #[serde(other)]
    Unknown,
}

/// Parsed content of a status file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusFileContent {
    #[serde(default)]
    pub instance_id: String,

    #[serde(default)]
    pub project_name: String,

    #[serde(default, rename = "unity_version", alias = "application_version")]
    pub application_version: String,

    #[serde(default)]
    pub status: FileStatus,

    #[serde(default = "default_relay_host")]
    pub relay_host: String,

    #[serde(default = "default_relay_port")]
    pub relay_port: u16,

    #[serde(default = "Utc::now", deserialize_with = "lenient_timestamp")]
    pub timestamp: DateTime<Utc>,

    #[serde(default)]
    pub seq: u64,
}

impl StatusFileContent {
    pub fn is_reloading(&self) -> bool {
        self.status == FileStatus::Reloading
    }

    /// Whether the snapshot is at most `max_age` old at `now`
    pub fn is_fresh_at(&self, max_age: Duration, now: DateTime<Utc>) -> bool {
        let age = now.signed_duration_since(self.timestamp);
        match chrono::Duration::from_std(max_age) {
            Ok(max_age) => age <= max_age,
            Err(_) => true,
        }
    }
}

fn default_relay_host() -> String {
    DEFAULT_RELAY_HOST.to_string()
}

fn default_relay_port() -> u16 {
    DEFAULT_RELAY_PORT
}

/// Parse an ISO-8601 timestamp; a trailing `Z` or a missing offset mean UTC
pub fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    let value = value.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(value) {
        return Some(ts.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|naive| naive.and_utc())
}

fn lenient_timestamp<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = serde_json::Value::deserialize(deserializer)?;
    Ok(raw
        .as_str()
        .and_then(parse_timestamp)
        .unwrap_or_else(Utc::now))
}

/// First 4 bytes of the SHA-1 of the instance id, as 8 lowercase hex chars
pub fn compute_instance_hash(instance_id: &str) -> String {
    let digest = Sha1::digest(instance_id.as_bytes());
    digest[..4].iter().map(|b| format!("{:02x}", b)).collect()
}

/// File name used for an instance's status file
pub fn status_file_name(instance_id: &str) -> String {
    format!("status-{}.json", compute_instance_hash(instance_id))
}

/// Pick the status directory from the env override or the home directory
pub fn resolve_status_dir(env_value: Option<OsString>, home: Option<PathBuf>) -> PathBuf {
    match env_value {
        Some(dir) if !dir.is_empty() => PathBuf::from(dir),
        _ => home.unwrap_or_else(|| PathBuf::from(".")).join(STATUS_DIR_NAME),
    }
}

/// Directory holding instance status files
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusDir {
    path: PathBuf,
}

impl StatusDir {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// `$UNITY_BRIDGE_STATUS_DIR`, else `~/.unity-bridge`
    pub fn from_env() -> Self {
        Self::new(resolve_status_dir(
            std::env::var_os(STATUS_DIR_ENV),
            dirs::home_dir(),
        ))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn file_path(&self, instance_id: &str) -> PathBuf {
        self.path.join(status_file_name(instance_id))
    }

    /// Read the status file of one instance
    pub fn read(&self, instance_id: &str) -> Option<StatusFileContent> {
        read_file(&self.file_path(instance_id))
    }

    /// Read every status file, newest first
    pub fn read_all(&self) -> Vec<StatusFileContent> {
        let entries = match std::fs::read_dir(&self.path) {
            Ok(entries) => entries,
            Err(e) => {
                tracing::debug!("Cannot list status dir {}: {}", self.path.display(), e);
                return Vec::new();
            }
        };

        let mut results: Vec<StatusFileContent> = entries
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| is_status_file_name(path))
            .filter_map(|path| read_file(&path))
            .collect();
        results.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        results
    }

    pub fn is_reloading(&self, instance_id: &str, max_age: Duration) -> bool {
        self.is_reloading_at(instance_id, max_age, Utc::now())
    }

    /// True iff the instance's file says `reloading` and is at most `max_age` old
    pub fn is_reloading_at(&self, instance_id: &str, max_age: Duration, now: DateTime<Utc>) -> bool {
        let Some(status) = self.read(instance_id) else {
            return false;
        };
        if !status.is_reloading() {
            return false;
        }
        if !status.is_fresh_at(max_age, now) {
            tracing::debug!("Status file for {} is stale", instance_id);
            return false;
        }
        true
    }

    pub fn is_any_instance_reloading(&self, query: &str, max_age: Duration) -> bool {
        self.is_any_instance_reloading_at(query, max_age, Utc::now())
    }

    /// Like `is_reloading`, but also matches `project_name` or a path suffix
    pub fn is_any_instance_reloading_at(
        &self,
        query: &str,
        max_age: Duration,
        now: DateTime<Utc>,
    ) -> bool {
        if self.is_reloading_at(query, max_age, now) {
            return true;
        }

        let query = normalize_selector(query);
        if query.is_empty() {
            return false;
        }
        self.read_all().iter().any(|status| {
            status.is_reloading()
                && status.is_fresh_at(max_age, now)
                && (status.project_name == query
                    || matches_path_suffix(&status.instance_id, query))
        })
    }

    /// Whether any fresh status file says `reloading`
    pub fn is_any_reloading(&self, max_age: Duration) -> bool {
        let now = Utc::now();
        self.read_all()
            .iter()
            .any(|status| status.is_reloading() && status.is_fresh_at(max_age, now))
    }

    /// Write a status snapshot (instance side), replacing the file atomically
    pub fn write(&self, content: &StatusFileContent) -> std::io::Result<PathBuf> {
        std::fs::create_dir_all(&self.path)?;
        let target = self.file_path(&content.instance_id);
        let tmp = target.with_extension("json.tmp");

        let json = serde_json::to_vec_pretty(content)?;
        {
            let mut file = std::fs::File::create(&tmp)?;
            file.write_all(&json)?;
            file.sync_all()?;
        }
        std::fs::rename(&tmp, &target)?;
        Ok(target)
    }
}

fn is_status_file_name(path: &Path) -> bool {
    path.file_name()
        .and_then(|name| name.to_str())
        .is_some_and(|name| name.starts_with("status-") && name.ends_with(".json"))
}

fn read_file(path: &Path) -> Option<StatusFileContent> {
    let bytes = match std::fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
        Err(e) => {
            tracing::debug!("Failed to read status file {}: {}", path.display(), e);
            return None;
        }
    };
    match serde_json::from_slice(&bytes) {
        Ok(content) => Some(content),
        Err(e) => {
            tracing::debug!("Invalid status file {}: {}", path.display(), e);
            None
        }
    }
}
