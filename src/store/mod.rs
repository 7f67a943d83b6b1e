//! Storage boundary.
//!
//! The crate never speaks SQL; everything it persists goes through these
//! traits. Absent per-guild configuration is not an error: the config reads
//! return the documented defaults. Batch writes are expected to be atomic.

pub mod memory;
pub mod types;

pub use memory::{Fault, MemoryStore};
pub use types::*;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("Storage unavailable: {0}")]
    Unavailable(String),
    #[error("Transaction failed: {0}")]
    Transaction(String),
    #[error("Record not found: {0}")]
    NotFound(String),
    #[error("Conflicting update: {0}")]
    Conflict(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

#[async_trait]
pub trait ConfigStore: Send + Sync {
    async fn logging_config(&self, guild_id: &str) -> StoreResult<LoggingConfig>;
    async fn save_logging_config(&self, config: &LoggingConfig) -> StoreResult<()>;
    async fn voice_xp_config(&self, guild_id: &str) -> StoreResult<VoiceXpConfig>;
    async fn save_voice_xp_config(&self, guild_id: &str, config: &VoiceXpConfig)
        -> StoreResult<()>;
}

#[async_trait]
pub trait XpStore: Send + Sync {
    /// Apply every delta in a single transaction. Users with leveling
    /// disabled are skipped and do not appear in the result.
    async fn apply_xp_batch(&self, deltas: &[XpDelta]) -> StoreResult<Vec<XpApplied>>;

    /// Reward roles of `guild_id` whose level is at most `level`.
    async fn level_roles(&self, guild_id: &str, level: i64) -> StoreResult<Vec<LevelRole>>;
}

#[async_trait]
pub trait MessageCacheStore: Send + Sync {
    /// Upsert all messages in one transaction; returns how many were written.
    async fn cache_messages(&self, messages: &[CachedMessage]) -> StoreResult<usize>;
    async fn cached_message(&self, message_id: &str) -> StoreResult<Option<CachedMessage>>;
    async fn purge_messages_before(&self, cutoff: DateTime<Utc>) -> StoreResult<u64>;
}

#[async_trait]
pub trait VoiceSessionStore: Send + Sync {
    async fn load_voice_sessions(&self) -> StoreResult<Vec<PersistedVoiceSession>>;
    async fn save_voice_session(&self, session: &PersistedVoiceSession) -> StoreResult<()>;
    async fn remove_voice_session(&self, guild_id: &str, user_id: &str) -> StoreResult<()>;
}

#[async_trait]
pub trait ScheduleStore: Send + Sync {
    /// Create a resource, or replace the settings of the one already
    /// rotating `channel_id` in that guild (keeping its slot).
    async fn upsert_resource(&self, resource: NewResource) -> StoreResult<ScheduledResource>;
    async fn resource(&self, key: &ResourceKey) -> StoreResult<Option<ScheduledResource>>;
    async fn find_resource(
        &self,
        guild_id: &str,
        channel_id: &str,
    ) -> StoreResult<Option<ScheduledResource>>;
    async fn list_resources(&self, guild_id: &str) -> StoreResult<Vec<ScheduledResource>>;
    async fn remove_resource(&self, key: &ResourceKey) -> StoreResult<bool>;
    async fn set_enabled(&self, key: &ResourceKey, enabled: bool) -> StoreResult<bool>;
    async fn set_custom_message(&self, key: &ResourceKey, message: Option<String>)
        -> StoreResult<bool>;
    async fn set_custom_image(&self, key: &ResourceKey, image: Option<String>)
        -> StoreResult<bool>;

    async fn due_resources(&self, now: DateTime<Utc>) -> StoreResult<Vec<ScheduledResource>>;
    async fn resources_needing_warning(
        &self,
        now: DateTime<Utc>,
    ) -> StoreResult<Vec<ScheduledResource>>;

    /// Swap in the replacement channel and advance the schedule, clearing
    /// `warned`. Fails with [`StoreError::Conflict`] if the stored channel is
    /// no longer `expected_channel`.
    async fn complete_run(
        &self,
        key: &ResourceKey,
        expected_channel: &str,
        completion: &RunCompletion,
    ) -> StoreResult<()>;
    async fn reschedule(&self, key: &ResourceKey, next_run: DateTime<Utc>) -> StoreResult<()>;
    async fn mark_warned(&self, key: &ResourceKey) -> StoreResult<()>;
}

/// Everything the coordinator needs from one backing store.
pub trait Storage:
    ConfigStore + XpStore + MessageCacheStore + VoiceSessionStore + ScheduleStore
{
}

impl<T> Storage for T where
    T: ConfigStore + XpStore + MessageCacheStore + VoiceSessionStore + ScheduleStore
{
}
