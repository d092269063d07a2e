use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use super::platform;
use super::protocol::DownloadMode;

/// Semitone bounds accepted by the backend's pitch shifter.
pub const PITCH_RANGE: std::ops::RangeInclusive<i8> = -12..=12;
/// Playback-speed bounds accepted by the backend.
pub const SPEED_RANGE: std::ops::RangeInclusive<f32> = 0.5..=2.0;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub backend: BackendConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub defaults: DefaultsConfig,
    #[serde(default)]
    pub http: HttpConfig,
}

/// Where the job-processing backend lives.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    /// Resolving a playlist runs yt-dlp on the backend and is much slower.
    #[serde(default = "default_playlist_timeout_secs")]
    pub playlist_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    #[serde(default = "default_concurrency_limit")]
    pub concurrency_limit: usize,
    /// Interval of the global `/download/jobs` snapshot poll.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Interval of the per-job status poll used when the push channel is down.
    #[serde(default = "default_channel_fallback_interval_ms")]
    pub channel_fallback_interval_ms: u64,
    #[serde(default)]
    pub retry_params: RetryParams,
    /// Maximum number of items fetched when resolving a playlist.
    #[serde(default = "default_playlist_limit")]
    pub playlist_limit: u32,
}

/// Which transform parameters a retried entry gets.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RetryParams {
    /// Keep the pitch/speed/quality captured on the failed entry.
    #[default]
    Original,
    /// Use whatever the `[defaults]` section says right now.
    Current,
}

/// Global download settings, captured into each entry when it is added.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DefaultsConfig {
    #[serde(default)]
    pub pitch: i8,
    #[serde(default = "default_speed")]
    pub speed: f32,
    #[serde(default = "default_quality")]
    pub quality: String,
    #[serde(default)]
    pub mode: DownloadMode,
    #[serde(default)]
    pub organize: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    #[serde(default = "default_http_enabled")]
    pub enabled: bool,
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            request_timeout_secs: default_request_timeout_secs(),
            playlist_timeout_secs: default_playlist_timeout_secs(),
        }
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            concurrency_limit: default_concurrency_limit(),
            poll_interval_ms: default_poll_interval_ms(),
            channel_fallback_interval_ms: default_channel_fallback_interval_ms(),
            retry_params: RetryParams::default(),
            playlist_limit: default_playlist_limit(),
        }
    }
}

impl Default for DefaultsConfig {
    fn default() -> Self {
        Self {
            pitch: 0,
            speed: default_speed(),
            quality: default_quality(),
            mode: DownloadMode::default(),
            organize: false,
        }
    }
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            enabled: default_http_enabled(),
            bind_address: default_bind_address(),
            port: default_port(),
        }
    }
}

fn default_base_url() -> String {
    "http://localhost:8000".to_string()
}

fn default_request_timeout_secs() -> u64 {
    30
}

fn default_playlist_timeout_secs() -> u64 {
    60
}

fn default_concurrency_limit() -> usize {
    4
}

fn default_poll_interval_ms() -> u64 {
    2000
}

fn default_channel_fallback_interval_ms() -> u64 {
    1000
}

fn default_playlist_limit() -> u32 {
    50
}

fn default_speed() -> f32 {
    1.0
}

fn default_quality() -> String {
    "320".to_string()
}

fn default_http_enabled() -> bool {
    true
}

fn default_bind_address() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8990
}

impl BackendConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn playlist_timeout(&self) -> Duration {
        Duration::from_secs(self.playlist_timeout_secs)
    }
}

impl QueueConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn channel_fallback_interval(&self) -> Duration {
        Duration::from_millis(self.channel_fallback_interval_ms)
    }
}

impl Config {
    pub fn load() -> anyhow::Result<Self> {
        let config_path = Self::config_path();

        if !config_path.exists() {
            let config = Self::default();
            config.save()?;
            return Ok(config);
        }

        let content = std::fs::read_to_string(&config_path)?;
        Self::from_toml_str(&content)
    }

    /// Parse a config document and pull out-of-range values back into bounds.
    pub fn from_toml_str(content: &str) -> anyhow::Result<Self> {
        let mut config: Self = toml::from_str(content)?;
        config.sanitize();
        Ok(config)
    }

    pub fn save(&self) -> anyhow::Result<()> {
        let config_path = Self::config_path();
        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(&config_path, content)?;
        Ok(())
    }

    pub fn config_path() -> PathBuf {
        platform::config_dir().join("config.toml")
    }

    fn sanitize(&mut self) {
        if self.queue.concurrency_limit == 0 {
            tracing::warn!("config: concurrency_limit 0, new entries stay pending");
        }
        if self.queue.poll_interval_ms == 0 {
            tracing::warn!("config: poll_interval_ms 0 is not usable, using 1");
            self.queue.poll_interval_ms = 1;
        }
        if self.queue.channel_fallback_interval_ms == 0 {
            tracing::warn!("config: channel_fallback_interval_ms 0 is not usable, using 1");
            self.queue.channel_fallback_interval_ms = 1;
        }
        let pitch = self
            .defaults
            .pitch
            .clamp(*PITCH_RANGE.start(), *PITCH_RANGE.end());
        let speed = self
            .defaults
            .speed
            .clamp(*SPEED_RANGE.start(), *SPEED_RANGE.end());
        if pitch != self.defaults.pitch || speed != self.defaults.speed {
            tracing::warn!(
                "config: defaults out of range (pitch={}, speed={}), clamped to pitch={}, speed={}",
                self.defaults.pitch,
                self.defaults.speed,
                pitch,
                speed
            );
            self.defaults.pitch = pitch;
            self.defaults.speed = speed;
        }
        let trimmed = self.backend.base_url.trim_end_matches('/');
        if trimmed.len() != self.backend.base_url.len() {
            self.backend.base_url = trimmed.to_string();
        }
    }
}
