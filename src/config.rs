//! Process settings: TOML file, `.env`, then `GUILDKEEPER_*` overrides.

use crate::batch::BatcherConfig;
use crate::health::HealthConfig;
use crate::scheduler::service::{DEFAULT_CLEAN_FOOTER, DEFAULT_CLEAN_MESSAGE};
use crate::scheduler::SchedulerConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

pub const ENV_PREFIX: &str = "GUILDKEEPER_";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read settings file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse settings: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid value for {key}: {value}")]
    BadOverride { key: String, value: String },

    #[error("invalid settings: {0}")]
    Invalid(String),
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(default)]
pub struct Settings {
    pub logging: LoggingSettings,
    pub cache: CacheSettings,
    pub batching: BatchingSettings,
    pub retention: RetentionSettings,
    pub scheduler: SchedulerSettings,
    pub voice: VoiceSettings,
    pub health: HealthSettings,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct LoggingSettings {
    /// `EnvFilter` directives; `RUST_LOG` wins when set.
    pub filter: String,
    pub ansi: bool,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct CacheSettings {
    pub ttl_seconds: u64,
    pub max_entries: usize,
    pub purge_interval_seconds: u64,
}

/// One batcher. Both fields are required when the section is present.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct BatchSettings {
    pub flush_interval_seconds: u64,
    pub max_batch_size: usize,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct BatchingSettings {
    #[serde(default = "BatchSettings::xp")]
    pub xp: BatchSettings,
    #[serde(default = "BatchSettings::message_cache")]
    pub message_cache: BatchSettings,
    #[serde(default = "BatchSettings::event_log")]
    pub event_log: BatchSettings,
    #[serde(default = "BatchSettings::presence")]
    pub presence: BatchSettings,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct RetentionSettings {
    pub message_retention_days: u64,
    pub sweep_interval_hours: u64,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct SchedulerSettings {
    pub poll_interval_seconds: u64,
    pub retry_offset_seconds: u64,
    pub max_concurrent_jobs: usize,
    pub default_warning_minutes: u32,
    pub clean_message: String,
    pub clean_footer: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct VoiceSettings {
    pub accrual_interval_seconds: u64,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct HealthSettings {
    pub poll_interval_seconds: u64,
    pub grace_period_seconds: u64,
    pub reopen_delay_seconds: u64,
    pub backoff_base_seconds: u64,
    pub backoff_cap_seconds: u64,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            filter: "info".to_string(),
            ansi: true,
        }
    }
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            ttl_seconds: 300,
            max_entries: 10_000,
            purge_interval_seconds: 600,
        }
    }
}

impl BatchSettings {
    fn with(flush_interval_seconds: u64, max_batch_size: usize) -> Self {
        Self {
            flush_interval_seconds,
            max_batch_size,
        }
    }

    pub fn xp() -> Self {
        Self::with(10, 200)
    }

    pub fn message_cache() -> Self {
        Self::with(5, 100)
    }

    pub fn event_log() -> Self {
        Self::with(10, 1000)
    }

    /// The interval only sets how often held changes are checked; each
    /// guild's own `presence_batch_seconds` decides when they are sent.
    pub fn presence() -> Self {
        Self::with(10, 1000)
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_secs(self.flush_interval_seconds)
    }

    pub fn to_config(&self) -> BatcherConfig {
        BatcherConfig::new(self.flush_interval(), self.max_batch_size)
    }
}

impl Default for BatchingSettings {
    fn default() -> Self {
        Self {
            xp: BatchSettings::xp(),
            message_cache: BatchSettings::message_cache(),
            event_log: BatchSettings::event_log(),
            presence: BatchSettings::presence(),
        }
    }
}

impl Default for RetentionSettings {
    fn default() -> Self {
        Self {
            message_retention_days: 7,
            sweep_interval_hours: 24,
        }
    }
}

impl RetentionSettings {
    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.message_retention_days * 24 * 3600)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_hours * 3600)
    }
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            poll_interval_seconds: 60,
            retry_offset_seconds: 3600,
            max_concurrent_jobs: 5,
            default_warning_minutes: 15,
            clean_message: DEFAULT_CLEAN_MESSAGE.to_string(),
            clean_footer: DEFAULT_CLEAN_FOOTER.to_string(),
        }
    }
}

impl SchedulerSettings {
    pub fn to_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            poll_interval: Duration::from_secs(self.poll_interval_seconds),
            retry_offset: Duration::from_secs(self.retry_offset_seconds),
            max_concurrent_jobs: self.max_concurrent_jobs,
            default_warning_minutes: self.default_warning_minutes,
            clean_message: self.clean_message.clone(),
            clean_footer: self.clean_footer.clone(),
        }
    }
}

impl Default for VoiceSettings {
    fn default() -> Self {
        Self {
            accrual_interval_seconds: 60,
        }
    }
}

impl Default for HealthSettings {
    fn default() -> Self {
        Self {
            poll_interval_seconds: 30,
            grace_period_seconds: 120,
            reopen_delay_seconds: 5,
            backoff_base_seconds: 10,
            backoff_cap_seconds: 120,
        }
    }
}

impl HealthSettings {
    pub fn to_config(&self) -> HealthConfig {
        HealthConfig {
            poll_interval: Duration::from_secs(self.poll_interval_seconds),
            grace_period: Duration::from_secs(self.grace_period_seconds),
            reopen_delay: Duration::from_secs(self.reopen_delay_seconds),
            backoff_base: Duration::from_secs(self.backoff_base_seconds),
            backoff_cap: Duration::from_secs(self.backoff_cap_seconds),
        }
    }
}

impl Settings {
    /// Read settings from `path`. A missing file yields the defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        if !path.exists() {
            info!(path = %path.display(), "No settings file, using defaults");
            return Ok(Self::default());
        }

        let raw = std::fs::read_to_string(path)?;
        let settings: Settings = toml::from_str(&raw)?;
        debug!(path = %path.display(), "Loaded settings file");
        Ok(settings)
    }

    /// `.env`, then the file, then process environment overrides, then
    /// validation.
    pub fn from_env_and_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        if let Ok(env_file) = dotenv::dotenv() {
            debug!(path = %env_file.display(), "Loaded .env");
        }

        let mut settings = Self::load(path)?;
        settings.apply_overrides(|key| std::env::var(key).ok())?;
        settings.validate()?;
        Ok(settings)
    }

    /// Apply `GUILDKEEPER_*` overrides read through `lookup`.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| {
            let key = format!("{}{}", ENV_PREFIX, name);
            lookup(&key).map(|value| (key, value))
        };

        if let Some((_, value)) = var("LOG") {
            self.logging.filter = value;
        }
        if let Some((key, value)) = var("CACHE_TTL_SECONDS") {
            self.cache.ttl_seconds = parse(key, value)?;
        }
        if let Some((key, value)) = var("SCHEDULER_POLL_SECONDS") {
            self.scheduler.poll_interval_seconds = parse(key, value)?;
        }
        if let Some((key, value)) = var("VOICE_ACCRUAL_SECONDS") {
            self.voice.accrual_interval_seconds = parse(key, value)?;
        }
        if let Some((key, value)) = var("HEALTH_POLL_SECONDS") {
            self.health.poll_interval_seconds = parse(key, value)?;
        }
        if let Some((key, value)) = var("MESSAGE_RETENTION_DAYS") {
            self.retention.message_retention_days = parse(key, value)?;
        }

        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let nonzero = [
            ("cache.ttl_seconds", self.cache.ttl_seconds),
            ("cache.max_entries", self.cache.max_entries as u64),
            ("cache.purge_interval_seconds", self.cache.purge_interval_seconds),
            ("retention.message_retention_days", self.retention.message_retention_days),
            ("retention.sweep_interval_hours", self.retention.sweep_interval_hours),
            ("scheduler.poll_interval_seconds", self.scheduler.poll_interval_seconds),
            ("scheduler.retry_offset_seconds", self.scheduler.retry_offset_seconds),
            ("scheduler.max_concurrent_jobs", self.scheduler.max_concurrent_jobs as u64),
            ("voice.accrual_interval_seconds", self.voice.accrual_interval_seconds),
            ("health.poll_interval_seconds", self.health.poll_interval_seconds),
            ("health.backoff_cap_seconds", self.health.backoff_cap_seconds),
        ];
        for (key, value) in nonzero {
            if value == 0 {
                return Err(ConfigError::Invalid(format!("{} must be greater than zero", key)));
            }
        }

        let batchers = [
            ("xp", &self.batching.xp),
            ("message_cache", &self.batching.message_cache),
            ("event_log", &self.batching.event_log),
            ("presence", &self.batching.presence),
        ];
        for (name, batch) in batchers {
            if batch.flush_interval_seconds == 0 || batch.max_batch_size == 0 {
                return Err(ConfigError::Invalid(format!(
                    "batching.{} needs a non-zero interval and batch size",
                    name
                )));
            }
        }

        if self.scheduler.clean_message.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "scheduler.clean_message must not be empty".to_string(),
            ));
        }

        Ok(())
    }
}

fn parse<T: std::str::FromStr>(key: String, value: String) -> Result<T, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::BadOverride { key, value })
}
