//! Configuration types and loading.
//!
//! Config is loaded from a JSON file (e.g. `~/.moyo/config.json`) and environment.
//! Every field has a default, so a missing file or an empty object is a valid config.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Top-level application config.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// Backend endpoints.
    #[serde(default)]
    pub server: ServerConfig,

    /// Realtime channel behaviour (registration, reconnect).
    #[serde(default)]
    pub channel: ChannelConfig,

    /// Local file validation for submissions.
    #[serde(default)]
    pub uploads: UploadConfig,

    /// Notification lifetime.
    #[serde(default)]
    pub notifications: NotificationsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerConfig {
    /// WebSocket endpoint of the realtime channel. Overridden by MOYO_WS_URL env.
    #[serde(default = "default_ws_url")]
    pub ws_url: String,

    /// Multipart message endpoint. Overridden by MOYO_UPLOAD_URL env.
    #[serde(default = "default_upload_url")]
    pub upload_url: String,
}

fn default_ws_url() -> String {
    "ws://127.0.0.1:8001/ws".to_string()
}

fn default_upload_url() -> String {
    "http://127.0.0.1:8001/chat/v1/messages".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            ws_url: default_ws_url(),
            upload_url: default_upload_url(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelConfig {
    /// Event names the session is registered under on every connect. Older backends
    /// also expect "/chat/v1/ai/stream-chat".
    #[serde(default = "default_registration_events")]
    pub registration_events: Vec<String>,

    #[serde(default)]
    pub reconnect: ReconnectConfig,
}

fn default_registration_events() -> Vec<String> {
    vec!["register".to_string()]
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            registration_events: default_registration_events(),
            reconnect: ReconnectConfig::default(),
        }
    }
}

/// Retry policy after the link drops. Backoff is linear: `backoff_ms * attempt`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconnectConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: u64,
}

fn default_true() -> bool {
    true
}

fn default_max_attempts() -> u32 {
    5
}

fn default_backoff_ms() -> u64 {
    1000
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_attempts: default_max_attempts(),
            backoff_ms: default_backoff_ms(),
        }
    }
}

impl ReconnectConfig {
    pub fn delay(&self, attempt: u32) -> Duration {
        Duration::from_millis(self.backoff_ms.saturating_mul(u64::from(attempt)))
    }
}

/// File allow-list and size ceiling. A file passes if either its MIME type or its
/// extension is listed.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadConfig {
    #[serde(default = "default_max_file_bytes")]
    pub max_file_bytes: u64,
    #[serde(default = "default_allowed_mime_types")]
    pub allowed_mime_types: Vec<String>,
    /// Extensions including the leading dot, compared case-insensitively.
    #[serde(default = "default_allowed_extensions")]
    pub allowed_extensions: Vec<String>,
}

fn default_max_file_bytes() -> u64 {
    10 * 1024 * 1024
}

fn default_allowed_mime_types() -> Vec<String> {
    ["text/plain", "application/pdf", "text/markdown", "text/csv"]
        .into_iter()
        .map(String::from)
        .collect()
}

fn default_allowed_extensions() -> Vec<String> {
    [".txt", ".pdf", ".md", ".csv"]
        .into_iter()
        .map(String::from)
        .collect()
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            max_file_bytes: default_max_file_bytes(),
            allowed_mime_types: default_allowed_mime_types(),
            allowed_extensions: default_allowed_extensions(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationsConfig {
    /// Seconds a notice stays visible unless dismissed (default 10).
    #[serde(default = "default_ttl_secs")]
    pub ttl_secs: u64,
    /// How often expired notices are pruned (default 1000 ms).
    #[serde(default = "default_sweep_interval_ms")]
    pub sweep_interval_ms: u64,
}

fn default_ttl_secs() -> u64 {
    10
}

fn default_sweep_interval_ms() -> u64 {
    1000
}

impl Default for NotificationsConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_ttl_secs(),
            sweep_interval_ms: default_sweep_interval_ms(),
        }
    }
}

impl NotificationsConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms.max(1))
    }
}

fn non_empty_env(key: &str) -> Option<String> {
    std::env::var(key).ok().and_then(|s| {
        let t = s.trim();
        if t.is_empty() {
            None
        } else {
            Some(t.to_string())
        }
    })
}

/// Resolve the WebSocket URL: env MOYO_WS_URL overrides config.
pub fn resolve_ws_url(config: &Config) -> String {
    non_empty_env("MOYO_WS_URL").unwrap_or_else(|| config.server.ws_url.clone())
}

/// Resolve the upload URL: env MOYO_UPLOAD_URL overrides config.
pub fn resolve_upload_url(config: &Config) -> String {
    non_empty_env("MOYO_UPLOAD_URL").unwrap_or_else(|| config.server.upload_url.clone())
}

/// Resolve config path from env or default.
pub fn default_config_path() -> PathBuf {
    std::env::var("MOYO_CONFIG_PATH").map(PathBuf::from).unwrap_or_else(|_| {
        dirs::home_dir()
            .map(|h| h.join(".moyo").join("config.json"))
            .unwrap_or_else(|| PathBuf::from("config.json"))
    })
}

/// Load config from the given path, MOYO_CONFIG_PATH, or the default. Missing file => default config.
/// Returns the config and the path that was used.
pub fn load_config(path: Option<PathBuf>) -> Result<(Config, PathBuf)> {
    let path = path.unwrap_or_else(default_config_path);
    let config = if !path.exists() {
        log::debug!("config file not found, using defaults: {}", path.display());
        Config::default()
    } else {
        let s = std::fs::read_to_string(&path)
            .with_context(|| format!("reading config from {}", path.display()))?;
        serde_json::from_str(&s)
            .with_context(|| format!("parsing config from {}", path.display()))?
    };
    Ok((config, path))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_object_yields_defaults() {
        let c: Config = serde_json::from_str("{}").unwrap();
        assert_eq!(c.server.ws_url, "ws://127.0.0.1:8001/ws");
        assert_eq!(c.channel.registration_events, ["register"]);
        assert!(c.channel.reconnect.enabled);
        assert_eq!(c.channel.reconnect.max_attempts, 5);
        assert_eq!(c.uploads.max_file_bytes, 10 * 1024 * 1024);
        assert_eq!(c.notifications.ttl(), Duration::from_secs(10));
    }

    #[test]
    fn camel_case_keys_and_partial_sections() {
        let c: Config = serde_json::from_str(
            r#"{
                "server": { "wsUrl": "ws://backend/ws" },
                "channel": {
                    "registrationEvents": ["register", "/chat/v1/ai/stream-chat"],
                    "reconnect": { "backoffMs": 250 }
                },
                "notifications": { "sweepIntervalMs": 200 }
            }"#,
        )
        .unwrap();
        assert_eq!(c.server.ws_url, "ws://backend/ws");
        assert_eq!(c.server.upload_url, "http://127.0.0.1:8001/chat/v1/messages");
        assert_eq!(c.channel.registration_events.len(), 2);
        assert_eq!(c.channel.reconnect.max_attempts, 5);
        assert_eq!(c.channel.reconnect.delay(3), Duration::from_millis(750));
        assert_eq!(c.notifications.sweep_interval(), Duration::from_millis(200));
        assert_eq!(c.notifications.ttl_secs, 10);
    }

    #[test]
    fn missing_file_is_default_config() {
        let path = std::env::temp_dir().join("moyo-config-does-not-exist.json");
        let (c, used) = load_config(Some(path.clone())).unwrap();
        assert_eq!(used, path);
        assert_eq!(c.uploads.allowed_extensions, [".txt", ".pdf", ".md", ".csv"]);
    }

    #[test]
    fn malformed_file_reports_path() {
        let path = std::env::temp_dir().join(format!("moyo-config-{}.json", std::process::id()));
        std::fs::write(&path, "{ not json").unwrap();
        let err = load_config(Some(path.clone())).unwrap_err();
        let _ = std::fs::remove_file(&path);
        assert!(format!("{:#}", err).contains("parsing config"));
    }
}
