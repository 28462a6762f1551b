use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// How outbound text reaches the assistant
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum TransportMode {
    #[default]
    WebSocket,
    Http,
}

impl TransportMode {
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "websocket" | "ws" => Some(TransportMode::WebSocket),
            "http" => Some(TransportMode::Http),
            _ => None,
        }
    }
}

/// What happens to the predicted placeholder when real fragments arrive
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum MergePolicy {
    /// Replace or extend the placeholder depending on the first real fragments
    #[default]
    Blend,
    /// Drop the placeholder on the first real fragment
    Discard,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct ConnectionConfig {
    pub url: String,
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub send_retry_delay_ms: u64,
    pub send_retry_limit: u32,
    /// 0 disables keepalive pings
    pub keepalive_ms: u64,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            url: "ws://localhost:8080/ws".to_string(),
            max_attempts: 5,
            base_delay_ms: 1000,
            max_delay_ms: 10_000,
            send_retry_delay_ms: 1000,
            send_retry_limit: 5,
            keepalive_ms: 30_000,
        }
    }
}

impl ConnectionConfig {
    /// Delay before the n-th reconnect attempt (1-based)
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        let delay = self.base_delay_ms.saturating_mul(1u64 << exponent);
        Duration::from_millis(delay.min(self.max_delay_ms))
    }

    pub fn send_retry_delay(&self) -> Duration {
        Duration::from_millis(self.send_retry_delay_ms)
    }

    pub fn keepalive(&self) -> Option<Duration> {
        (self.keepalive_ms > 0).then(|| Duration::from_millis(self.keepalive_ms))
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct PacingConfig {
    /// When off, fragments are released as soon as they arrive
    pub batching: bool,
    pub batch_size: usize,
    pub min_batch_size: usize,
    pub max_batch_size: usize,
    /// How far a cycle's batch size may stray from `batch_size`
    pub batch_size_spread: usize,
    pub pause_ms: u64,
    pub pause_jitter_ms: u64,
    pub min_pause_ms: u64,
    pub max_pause_ms: u64,
    pub sentence_pause_ms: u64,
    pub grace_ms: u64,
    pub idle_timeout_ms: u64,
    pub placeholder: bool,
    pub placeholder_delay_ms: u64,
    pub merge_policy: MergePolicy,
}

impl Default for PacingConfig {
    fn default() -> Self {
        Self {
            batching: true,
            batch_size: 5,
            min_batch_size: 3,
            max_batch_size: 8,
            batch_size_spread: 1,
            pause_ms: 800,
            pause_jitter_ms: 150,
            min_pause_ms: 600,
            max_pause_ms: 1200,
            sentence_pause_ms: 200,
            grace_ms: 500,
            idle_timeout_ms: 8000,
            placeholder: true,
            placeholder_delay_ms: 800,
            merge_policy: MergePolicy::Blend,
        }
    }
}

impl PacingConfig {
    pub fn grace(&self) -> Duration {
        Duration::from_millis(self.grace_ms)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    pub fn placeholder_delay(&self) -> Duration {
        Duration::from_millis(self.placeholder_delay_ms)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct ApiConfig {
    /// Server origin for the HTTP endpoints, e.g. `http://localhost:8000`
    pub base_url: Option<String>,
    pub timeout_ms: u64,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            timeout_ms: 30_000,
        }
    }
}

/// A keyword rule for the placeholder shown before the first real fragment
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct PredictionRule {
    pub keywords: Vec<String>,
    pub text: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct Config {
    pub transport: TransportMode,
    pub connection: ConnectionConfig,
    pub pacing: PacingConfig,
    pub api: ApiConfig,
    pub predictions: Vec<PredictionRule>,
    pub welcome_message: Option<String>,
    pub audio_dir: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self::new()
    }
}

impl Config {
    pub fn new() -> Self {
        Self {
            transport: TransportMode::WebSocket,
            connection: ConnectionConfig::default(),
            pacing: PacingConfig::default(),
            api: ApiConfig::default(),
            predictions: Vec::new(),
            welcome_message: Some("Welcome! How can I help you today?".to_string()),
            audio_dir: None,
        }
    }

    /// Load from the default location, then apply environment overrides.
    /// On first run the defaults are written out so they can be edited.
    pub fn load() -> Result<Self> {
        let config_path = Self::get_config_path()?;
        let mut config = Self::load_from(&config_path)?;
        if !config_path.exists() {
            if let Err(e) = config.save_to(&config_path) {
                tracing::warn!(path = %config_path.display(), error = %e, "could not write default config");
            }
        }
        config.apply_env_overrides();
        Ok(config)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::new());
        }

        let config_content = fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&config_content)
            .map_err(|e| anyhow!("Invalid config file {:?}: {}", path, e))?;
        Ok(config)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        // Create config directory if it doesn't exist
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let config_content = serde_json::to_string_pretty(self)?;
        fs::write(path, config_content)?;
        Ok(())
    }

    /// Environment variables win over the config file
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(url) = lookup("PARLEY_WS_URL").filter(|v| !v.is_empty()) {
            self.connection.url = url;
        }
        if let Some(url) = lookup("PARLEY_API_URL").filter(|v| !v.is_empty()) {
            self.api.base_url = Some(url);
        }
        if let Some(mode) = lookup("PARLEY_TRANSPORT").and_then(|v| TransportMode::from_str(&v)) {
            self.transport = mode;
        }
    }

    /// Where downloaded audio clips are cached
    pub fn audio_dir(&self) -> Option<PathBuf> {
        self.audio_dir
            .clone()
            .or_else(|| dirs::cache_dir().map(|p| p.join("parley").join("audio")))
    }

    fn get_config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow!("Could not determine config directory"))?;

        Ok(config_dir.join("parley").join("config.json"))
    }
}
