use super::ttl::TtlCache;
use crate::clock::Clock;
use crate::store::{ConfigStore, LoggingConfig, StoreResult, VoiceXpConfig};
use std::sync::Arc;
use std::time::Duration;
use tracing::{instrument, warn};

/// Read-through access to per-guild configuration.
///
/// A miss fetches from the store and caches whatever comes back, including
/// the default for an unconfigured guild. Storage errors are returned as-is
/// and leave the cache untouched. A fill that raced a `set_*` or
/// `invalidate` for the same guild is returned but not cached.
pub struct GuildConfigs {
    store: Arc<dyn ConfigStore>,
    logging: TtlCache<String, LoggingConfig>,
    voice_xp: TtlCache<String, VoiceXpConfig>,
}

impl GuildConfigs {
    pub fn new(
        store: Arc<dyn ConfigStore>,
        ttl: Duration,
        max_entries: usize,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            logging: TtlCache::new(ttl, clock.clone()).with_max_entries(max_entries),
            voice_xp: TtlCache::new(ttl, clock).with_max_entries(max_entries),
        }
    }

    #[instrument(skip(self))]
    pub async fn logging_config(&self, guild_id: &str) -> StoreResult<LoggingConfig> {
        let key = guild_id.to_string();
        if let Some(config) = self.logging.get(&key).await {
            return Ok(config);
        }

        let seen = self.logging.generation(&key);
        let config = self.store.logging_config(guild_id).await.map_err(|e| {
            warn!(guild_id = guild_id, error = %e, "Failed to load logging config");
            e
        })?;
        self.logging.set_if_unchanged(key, config.clone(), seen).await;
        Ok(config)
    }

    #[instrument(skip(self))]
    pub async fn voice_xp_config(&self, guild_id: &str) -> StoreResult<VoiceXpConfig> {
        let key = guild_id.to_string();
        if let Some(config) = self.voice_xp.get(&key).await {
            return Ok(config);
        }

        let seen = self.voice_xp.generation(&key);
        let config = self.store.voice_xp_config(guild_id).await.map_err(|e| {
            warn!(guild_id = guild_id, error = %e, "Failed to load voice XP config");
            e
        })?;
        self.voice_xp.set_if_unchanged(key, config.clone(), seen).await;
        Ok(config)
    }

    pub async fn set_logging_config(&self, config: LoggingConfig) -> StoreResult<()> {
        self.store.save_logging_config(&config).await?;
        self.logging.invalidate(&config.guild_id).await;
        Ok(())
    }

    pub async fn set_voice_xp_config(
        &self,
        guild_id: &str,
        config: VoiceXpConfig,
    ) -> StoreResult<()> {
        self.store.save_voice_xp_config(guild_id, &config).await?;
        self.voice_xp.invalidate(&guild_id.to_string()).await;
        Ok(())
    }

    pub async fn invalidate(&self, guild_id: &str) {
        let key = guild_id.to_string();
        self.logging.invalidate(&key).await;
        self.voice_xp.invalidate(&key).await;
    }

    pub async fn purge_expired(&self) -> usize {
        self.logging.purge_expired().await + self.voice_xp.purge_expired().await
    }
}
