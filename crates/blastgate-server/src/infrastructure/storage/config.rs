//! TOML-based configuration for the server.
//!
//! The file location is given on the command line (`--config`, default
//! `blastgate.toml` in the working directory).  A missing file is not an
//! error: the server starts with defaults and command-line overrides.
//!
//! ```toml
//! [server]
//! port = 3300
//! access_token = "change-me"
//!
//! [webhook]
//! url = "https://app.example.com/api/webhooks/whatsapp/status"
//!
//! [delivery]
//! max_attempts = 3
//! retry_backoff_secs = 10
//! ```
//!
//! # Serde default values
//!
//! Fields annotated with `#[serde(default = "some_fn")]` use the return value
//! of `some_fn()` when the field is absent from the TOML file, so a partial
//! file (or none at all) always yields a complete configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use blastgate_core::{DeliveryPolicy, ReconnectPolicy};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error type for configuration file operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A file system I/O error occurred.
    #[error("I/O error accessing config at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The TOML content could not be parsed.
    #[error("failed to parse config TOML: {0}")]
    Parse(#[from] toml::de::Error),
}

// ── Config schema types ───────────────────────────────────────────────────────

/// Top-level server configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub webhook: WebhookConfig,
    #[serde(default)]
    pub reconnect: ReconnectConfig,
    #[serde(default)]
    pub delivery: DeliveryConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
}

/// HTTP listener and access control.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerConfig {
    /// IP address to bind.  `"0.0.0.0"` binds all interfaces.
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Shared secret every request must carry as `access_token`.
    #[serde(default)]
    pub access_token: String,
    /// `tracing` log level: `"error"`, `"warn"`, `"info"`, `"debug"`, `"trace"`.
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// How long `/login` and `/get_qrcode` wait for a pairing code.
    #[serde(default = "default_qr_wait_secs")]
    pub qr_wait_secs: u64,
}

/// Where state lives on disk.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StorageConfig {
    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,
    /// Parent directory of the per-device session directories.
    #[serde(default = "default_session_dir")]
    pub session_dir: PathBuf,
}

/// Outbound status notifications.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WebhookConfig {
    /// Endpoint receiving status notifications.  Notifications are only
    /// logged when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default = "default_webhook_timeout_secs")]
    pub timeout_secs: u64,
}

/// Backoff for transient disconnects.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReconnectConfig {
    #[serde(default = "default_reconnect_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_secs")]
    pub max_delay_secs: u64,
    /// Upper bound on opening one session.
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
}

/// Per-recipient send behaviour and default blast pacing.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeliveryConfig {
    #[serde(default = "default_delivery_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_retry_backoff_secs")]
    pub retry_backoff_secs: u64,
    #[serde(default = "default_send_timeout_secs")]
    pub send_timeout_secs: u64,
    #[serde(default = "default_delay_min_secs")]
    pub default_delay_min_secs: u32,
    #[serde(default = "default_delay_max_secs")]
    pub default_delay_max_secs: u32,
}

/// Polling for scheduled blasts.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SchedulerConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
}

// ── Default helpers ───────────────────────────────────────────────────────────

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    3300
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_qr_wait_secs() -> u64 {
    10
}
fn default_database_path() -> PathBuf {
    PathBuf::from("blastgate.db")
}
fn default_session_dir() -> PathBuf {
    PathBuf::from("sessions")
}
fn default_webhook_timeout_secs() -> u64 {
    10
}
fn default_reconnect_attempts() -> u32 {
    10
}
fn default_base_delay_ms() -> u64 {
    1000
}
fn default_max_delay_secs() -> u64 {
    60
}
fn default_connect_timeout_secs() -> u64 {
    60
}
fn default_delivery_attempts() -> u32 {
    3
}
fn default_retry_backoff_secs() -> u64 {
    10
}
fn default_send_timeout_secs() -> u64 {
    60
}
fn default_delay_min_secs() -> u32 {
    5
}
fn default_delay_max_secs() -> u32 {
    15
}
fn default_true() -> bool {
    true
}
fn default_poll_interval_secs() -> u64 {
    60
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            port: default_port(),
            access_token: String::new(),
            log_level: default_log_level(),
            qr_wait_secs: default_qr_wait_secs(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
            session_dir: default_session_dir(),
        }
    }
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            url: None,
            timeout_secs: default_webhook_timeout_secs(),
        }
    }
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_reconnect_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_secs: default_max_delay_secs(),
            connect_timeout_secs: default_connect_timeout_secs(),
        }
    }
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_delivery_attempts(),
            retry_backoff_secs: default_retry_backoff_secs(),
            send_timeout_secs: default_send_timeout_secs(),
            default_delay_min_secs: default_delay_min_secs(),
            default_delay_max_secs: default_delay_max_secs(),
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            poll_interval_secs: default_poll_interval_secs(),
        }
    }
}

// ── Conversions into core policies ────────────────────────────────────────────

impl ReconnectConfig {
    pub fn policy(&self) -> ReconnectPolicy {
        ReconnectPolicy {
            max_attempts: self.max_attempts,
            base_delay: Duration::from_millis(self.base_delay_ms),
            max_delay: Duration::from_secs(self.max_delay_secs),
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

impl DeliveryConfig {
    pub fn policy(&self) -> DeliveryPolicy {
        DeliveryPolicy {
            max_attempts: self.max_attempts.max(1),
            retry_backoff: Duration::from_secs(self.retry_backoff_secs),
            send_timeout: Duration::from_secs(self.send_timeout_secs),
        }
    }
}

// ── Loading ───────────────────────────────────────────────────────────────────

/// Loads `AppConfig` from `path`, returning `AppConfig::default()` if the
/// file does not exist.
///
/// # Errors
///
/// Returns [`ConfigError::Io`] for file-system errors other than "not found",
/// and [`ConfigError::Parse`] if the TOML is malformed.
pub fn load_config(path: &Path) -> Result<AppConfig, ConfigError> {
    match std::fs::read_to_string(path) {
        Ok(content) => {
            let cfg: AppConfig = toml::from_str(&content)?;
            Ok(cfg)
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(AppConfig::default()),
        Err(e) => Err(ConfigError::Io {
            path: path.to_path_buf(),
            source: e,
        }),
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_app_config_default_matches_documented_values() {
        // Arrange / Act
        let cfg = AppConfig::default();

        // Assert
        assert_eq!(cfg.server.port, 3300);
        assert_eq!(cfg.server.qr_wait_secs, 10);
        assert_eq!(cfg.reconnect.max_attempts, 10);
        assert_eq!(cfg.delivery.max_attempts, 3);
        assert_eq!(cfg.delivery.default_delay_min_secs, 5);
        assert_eq!(cfg.delivery.default_delay_max_secs, 15);
        assert!(cfg.webhook.url.is_none());
        assert!(cfg.scheduler.enabled);
    }

    #[test]
    fn test_default_reconnect_policy_matches_core_default() {
        assert_eq!(ReconnectConfig::default().policy(), ReconnectPolicy::default());
        assert_eq!(DeliveryConfig::default().policy(), DeliveryPolicy::default());
    }

    #[test]
    fn test_partial_toml_fills_remaining_fields_with_defaults() {
        // Arrange
        let text = r#"
            [server]
            access_token = "s3cret"

            [delivery]
            retry_backoff_secs = 2
        "#;

        // Act
        let cfg: AppConfig = toml::from_str(text).expect("parse");

        // Assert
        assert_eq!(cfg.server.access_token, "s3cret");
        assert_eq!(cfg.server.port, 3300);
        assert_eq!(cfg.delivery.retry_backoff_secs, 2);
        assert_eq!(cfg.delivery.send_timeout_secs, 60);
        assert_eq!(cfg.storage, StorageConfig::default());
    }

    #[test]
    fn test_zero_delivery_attempts_is_clamped_to_one() {
        let cfg = DeliveryConfig {
            max_attempts: 0,
            ..DeliveryConfig::default()
        };
        assert_eq!(cfg.policy().max_attempts, 1);
    }

    #[test]
    fn test_load_config_missing_file_returns_defaults() {
        let tmp = tempfile::tempdir().unwrap();
        let cfg = load_config(&tmp.path().join("absent.toml")).unwrap();
        assert_eq!(cfg, AppConfig::default());
    }

    #[test]
    fn test_load_config_reads_file() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("blastgate.toml");
        std::fs::write(
            &path,
            "[webhook]\nurl = \"http://localhost:8000/hook\"\n[scheduler]\nenabled = false\n",
        )
        .unwrap();

        let cfg = load_config(&path).unwrap();

        assert_eq!(cfg.webhook.url.as_deref(), Some("http://localhost:8000/hook"));
        assert!(!cfg.scheduler.enabled);
    }

    #[test]
    fn test_load_config_rejects_malformed_toml() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("bad.toml");
        std::fs::write(&path, "[server\nport = ").unwrap();

        assert!(matches!(load_config(&path), Err(ConfigError::Parse(_))));
    }
}
