use std::{fs, path::Path, time::Duration};

use anyhow::{anyhow, Context};
use serde::Deserialize;
use url::Url;

use crate::backoff::ReconnectPolicy;

pub const DEFAULT_SETTINGS_FILE: &str = "client.toml";

#[derive(Debug, Clone, PartialEq)]
pub struct ClientSettings {
    pub ws_url: String,
    pub api_base_url: String,
    pub user_id: Option<String>,
    pub reconnect_base_ms: u64,
    pub reconnect_max_ms: u64,
    pub reconnect_jitter: f64,
    pub ack_timeout_secs: u64,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            ws_url: "ws://localhost:8080/api/v1/ws".into(),
            api_base_url: "http://localhost:8080/api/v1/private".into(),
            user_id: None,
            reconnect_base_ms: 2_000,
            reconnect_max_ms: 30_000,
            reconnect_jitter: 0.2,
            ack_timeout_secs: 15,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct FileSettings {
    ws_url: Option<String>,
    api_base_url: Option<String>,
    user_id: Option<String>,
    reconnect_base_ms: Option<u64>,
    reconnect_max_ms: Option<u64>,
    reconnect_jitter: Option<f64>,
    ack_timeout_secs: Option<u64>,
}

impl ClientSettings {
    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy::new(
            Duration::from_millis(self.reconnect_base_ms),
            Duration::from_millis(self.reconnect_max_ms),
            self.reconnect_jitter,
        )
    }

    pub fn ack_timeout(&self) -> Duration {
        Duration::from_secs(self.ack_timeout_secs)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        let ws = Url::parse(&self.ws_url)
            .with_context(|| format!("invalid websocket url '{}'", self.ws_url))?;
        if !matches!(ws.scheme(), "ws" | "wss") {
            return Err(anyhow!("ws_url must start with ws:// or wss://"));
        }
        let api = Url::parse(&self.api_base_url)
            .with_context(|| format!("invalid api url '{}'", self.api_base_url))?;
        if !matches!(api.scheme(), "http" | "https") {
            return Err(anyhow!("api_base_url must start with http:// or https://"));
        }
        if self.reconnect_base_ms == 0 || self.reconnect_max_ms < self.reconnect_base_ms {
            return Err(anyhow!(
                "reconnect_max_ms ({}) must be >= reconnect_base_ms ({}) > 0",
                self.reconnect_max_ms,
                self.reconnect_base_ms
            ));
        }
        if !(0.0..=1.0).contains(&self.reconnect_jitter) {
            return Err(anyhow!("reconnect_jitter must be within 0.0..=1.0"));
        }
        Ok(())
    }

    fn apply_file(&mut self, file_cfg: FileSettings) {
        if let Some(v) = file_cfg.ws_url {
            self.ws_url = v;
        }
        if let Some(v) = file_cfg.api_base_url {
            self.api_base_url = v;
        }
        if let Some(v) = file_cfg.user_id {
            self.user_id = Some(v);
        }
        if let Some(v) = file_cfg.reconnect_base_ms {
            self.reconnect_base_ms = v;
        }
        if let Some(v) = file_cfg.reconnect_max_ms {
            self.reconnect_max_ms = v;
        }
        if let Some(v) = file_cfg.reconnect_jitter {
            self.reconnect_jitter = v;
        }
        if let Some(v) = file_cfg.ack_timeout_secs {
            self.ack_timeout_secs = v;
        }
    }

    fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("APP__WS_URL") {
            self.ws_url = v;
        }
        if let Some(v) = lookup("APP__API_BASE_URL") {
            self.api_base_url = v;
        }
        if let Some(v) = lookup("APP__USER_ID") {
            self.user_id = Some(v);
        }
        if let Some(parsed) = lookup("APP__RECONNECT_BASE_MS").and_then(|v| v.parse().ok()) {
            self.reconnect_base_ms = parsed;
        }
        if let Some(parsed) = lookup("APP__RECONNECT_MAX_MS").and_then(|v| v.parse().ok()) {
            self.reconnect_max_ms = parsed;
        }
        if let Some(parsed) = lookup("APP__RECONNECT_JITTER").and_then(|v| v.parse().ok()) {
            self.reconnect_jitter = parsed;
        }
        if let Some(parsed) = lookup("APP__ACK_TIMEOUT_SECS").and_then(|v| v.parse().ok()) {
            self.ack_timeout_secs = parsed;
        }
    }
}

/// Defaults, then `client.toml` in the working directory, then `APP__*`
/// environment variables.
pub fn load_settings() -> ClientSettings {
    load_settings_from(Path::new(DEFAULT_SETTINGS_FILE), |key| std::env::var(key).ok())
}

pub fn load_settings_from<F>(path: &Path, lookup: F) -> ClientSettings
where
    F: Fn(&str) -> Option<String>,
{
    let mut settings = ClientSettings::default();

    if let Ok(raw) = fs::read_to_string(path) {
        match toml::from_str::<FileSettings>(&raw) {
            Ok(file_cfg) => settings.apply_file(file_cfg),
            Err(err) => {
                tracing::warn!(path = %path.display(), error = %err, "ignoring unreadable settings file")
            }
        }
    }

    settings.apply_env(lookup);
    settings
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
