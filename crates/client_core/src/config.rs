use std::{fs, path::Path, time::Duration};

use anyhow::Context;
use serde::Deserialize;

pub const DEFAULT_CONFIG_FILE: &str = "client.toml";

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub api_url: String,
    /// Messages retained per channel; 0 keeps everything.
    pub message_cache_size: usize,
    pub use_message_queue: bool,
    pub connect_timeout_ms: u64,
    pub event_channel_capacity: usize,
    pub queue_retry_delay_ms: u64,
    pub auto_reconnect: bool,
    pub reconnect_delay_ms: u64,
    pub max_reconnect_delay_ms: u64,
    /// 0 retries forever.
    pub max_reconnect_attempts: u32,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            api_url: "https://discord.com/api".into(),
            message_cache_size: 100,
            use_message_queue: true,
            connect_timeout_ms: 30_000,
            event_channel_capacity: 1024,
            queue_retry_delay_ms: 1_000,
            auto_reconnect: true,
            reconnect_delay_ms: 1_000,
            max_reconnect_delay_ms: 60_000,
            max_reconnect_attempts: 0,
        }
    }
}

impl ClientConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn queue_retry_delay(&self) -> Duration {
        Duration::from_millis(self.queue_retry_delay_ms)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    pub fn max_reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.max_reconnect_delay_ms.max(self.reconnect_delay_ms))
    }
}

/// Reads `client.toml` from the working directory, then applies `APP__*` overrides.
pub fn load_config() -> anyhow::Result<ClientConfig> {
    let path = Path::new(DEFAULT_CONFIG_FILE);
    let config = if path.exists() {
        load_config_file(path)?
    } else {
        ClientConfig::default()
    };
    Ok(apply_env_overrides(config, |key| std::env::var(key).ok()))
}

pub fn load_config_file(path: &Path) -> anyhow::Result<ClientConfig> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read client config '{}'", path.display()))?;
    toml::from_str(&raw)
        .with_context(|| format!("failed to parse client config '{}'", path.display()))
}

pub(crate) fn apply_env_overrides(
    mut config: ClientConfig,
    lookup: impl Fn(&str) -> Option<String>,
) -> ClientConfig {
    fn parsed<T: std::str::FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
        lookup(key).and_then(|v| v.trim().parse().ok())
    }

    if let Some(v) = lookup("APP__API_URL") {
        config.api_url = v;
    }
    if let Some(v) = parsed(&lookup, "APP__MESSAGE_CACHE_SIZE") {
        config.message_cache_size = v;
    }
    if let Some(v) = parsed(&lookup, "APP__USE_MESSAGE_QUEUE") {
        config.use_message_queue = v;
    }
    if let Some(v) = parsed(&lookup, "APP__CONNECT_TIMEOUT_MS") {
        config.connect_timeout_ms = v;
    }
    if let Some(v) = parsed(&lookup, "APP__EVENT_CHANNEL_CAPACITY") {
        config.event_channel_capacity = v;
    }
    if let Some(v) = parsed(&lookup, "APP__QUEUE_RETRY_DELAY_MS") {
        config.queue_retry_delay_ms = v;
    }
    if let Some(v) = parsed(&lookup, "APP__AUTO_RECONNECT") {
        config.auto_reconnect = v;
    }
    if let Some(v) = parsed(&lookup, "APP__RECONNECT_DELAY_MS") {
        config.reconnect_delay_ms = v;
    }
    if let Some(v) = parsed(&lookup, "APP__MAX_RECONNECT_DELAY_MS") {
        config.max_reconnect_delay_ms = v;
    }
    if let Some(v) = parsed(&lookup, "APP__MAX_RECONNECT_ATTEMPTS") {
        config.max_reconnect_attempts = v;
    }

    config
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
