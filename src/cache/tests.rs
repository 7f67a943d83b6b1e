//! Expiry, eviction and read-through behaviour.

use super::*;
use crate::clock::{Clock, ManualClock};
use crate::store::{ConfigStore, Fault, LoggingConfig, MemoryStore, VoiceXpConfig};
use crate::store::StoreResult;
use async_trait::async_trait;
use chrono::Duration as ChronoDuration;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio_test::{assert_err, assert_ok};

fn clock() -> (ManualClock, Arc<dyn Clock>) {
    let manual = ManualClock::default();
    let shared: Arc<dyn Clock> = Arc::new(manual.clone());
    (manual, shared)
}

#[tokio::test]
async fn entries_expire_exactly_at_ttl() {
    let (manual, clock) = clock();
    let cache: TtlCache<String, u32> = TtlCache::new(Duration::from_secs(60), clock);

    cache.set("a".into(), 1).await;
    manual.advance(ChronoDuration::seconds(59));
    assert_eq!(cache.get(&"a".to_string()).await, Some(1));

    manual.advance(ChronoDuration::seconds(1));
    assert_eq!(cache.get(&"a".to_string()).await, None);
    // still stored until purged
    assert_eq!(cache.len().await, 1);
    assert_eq!(cache.purge_expired().await, 1);
    assert!(cache.is_empty().await);
}

#[tokio::test]
async fn set_overwrites_value_and_expiry() {
    let (manual, clock) = clock();
    let cache: TtlCache<String, u32> = TtlCache::new(Duration::from_secs(60), clock);

    cache.set("a".into(), 1).await;
    manual.advance(ChronoDuration::seconds(50));
    cache.set("a".into(), 2).await;
    manual.advance(ChronoDuration::seconds(50));

    assert_eq!(cache.get(&"a".to_string()).await, Some(2));
}

#[tokio::test]
async fn invalidate_and_clear() {
    let (_, clock) = clock();
    let cache: TtlCache<&'static str, u32> = TtlCache::new(Duration::from_secs(60), clock);

    cache.set("a", 1).await;
    cache.set("b", 2).await;
    cache.invalidate(&"a").await;
    assert_eq!(cache.get(&"a").await, None);
    assert_eq!(cache.get(&"b").await, Some(2));

    cache.clear().await;
    assert!(cache.is_empty().await);
}

#[tokio::test]
async fn full_cache_evicts_expired_then_oldest() {
    let (manual, clock) = clock();
    let cache: TtlCache<u32, u32> =
        TtlCache::new(Duration::from_secs(60), clock).with_max_entries(2);

    cache.set(1, 1).await;
    manual.advance(ChronoDuration::seconds(10));
    cache.set(2, 2).await;
    manual.advance(ChronoDuration::seconds(10));
    cache.set(3, 3).await;

    assert_eq!(cache.len().await, 2);
    assert_eq!(cache.get(&1).await, None);
    assert_eq!(cache.get(&2).await, Some(2));

    // entry 2 is expired by now and goes before any live entry
    manual.advance(ChronoDuration::seconds(50));
    cache.set(4, 4).await;
    assert_eq!(cache.len().await, 2);
    assert_eq!(cache.get(&3).await, Some(3));
    assert_eq!(cache.get(&4).await, Some(4));
}

#[tokio::test]
async fn fill_is_dropped_after_invalidate_or_clear() {
    let (_, clock) = clock();
    let cache: TtlCache<&'static str, u32> = TtlCache::new(Duration::from_secs(60), clock);

    let seen = cache.generation(&"a");
    cache.invalidate(&"a").await;
    assert!(!cache.set_if_unchanged("a", 1, seen).await);
    assert_eq!(cache.get(&"a").await, None);

    let seen = cache.generation(&"a");
    cache.clear().await;
    assert!(!cache.set_if_unchanged("a", 1, seen).await);

    // other keys do not disturb the fill
    let seen = cache.generation(&"a");
    cache.invalidate(&"b").await;
    assert!(cache.set_if_unchanged("a", 2, seen).await);
    assert_eq!(cache.get(&"a").await, Some(2));
}

fn configs(store: Arc<MemoryStore>, clock: Arc<dyn Clock>) -> GuildConfigs {
    GuildConfigs::new(store, Duration::from_secs(300), 1000, clock)
}

#[tokio::test]
async fn unconfigured_guild_is_cached_too() {
    let (_, clock) = clock();
    let store = Arc::new(MemoryStore::new());
    let configs = configs(store.clone(), clock);

    let first = assert_ok!(configs.logging_config("g").await);
    let second = assert_ok!(configs.logging_config("g").await);

    assert_eq!(first, LoggingConfig::unconfigured("g"));
    assert_eq!(first, second);
    assert_eq!(store.config_reads(), 1);
}

#[tokio::test]
async fn refetches_after_ttl() {
    let (manual, clock) = clock();
    let store = Arc::new(MemoryStore::new());
    let configs = configs(store.clone(), clock);

    assert_ok!(configs.voice_xp_config("g").await);
    manual.advance(ChronoDuration::seconds(300));
    assert_ok!(configs.voice_xp_config("g").await);

    assert_eq!(store.config_reads(), 2);
}

#[tokio::test]
async fn storage_errors_are_not_cached() {
    let (_, clock) = clock();
    let store = Arc::new(MemoryStore::new());
    let configs = configs(store.clone(), clock);

    store.inject(Fault::ConfigReads);
    assert_err!(configs.logging_config("g").await);

    store.heal(Fault::ConfigReads);
    assert_ok!(configs.logging_config("g").await);
    assert_eq!(store.config_reads(), 1);
}

#[tokio::test]
async fn writes_invalidate_the_cached_entry() {
    let (_, clock) = clock();
    let store = Arc::new(MemoryStore::new());
    let configs = configs(store.clone(), clock);

    let before = assert_ok!(configs.voice_xp_config("g").await);
    assert!(!before.enabled);

    let enabled = VoiceXpConfig {
        enabled: true,
        ..VoiceXpConfig::default()
    };
    assert_ok!(configs.set_voice_xp_config("g", enabled.clone()).await);
    assert_eq!(assert_ok!(configs.voice_xp_config("g").await), enabled);

    let mut logging = LoggingConfig::unconfigured("g");
    logging.enabled = true;
    logging.log_channel_id = Some("logs".into());
    assert_ok!(configs.set_logging_config(logging.clone()).await);
    assert_eq!(
        assert_ok!(configs.logging_config("g").await).active_channel(),
        Some("logs")
    );
    assert_eq!(assert_ok!(store.logging_config("g").await), logging);
}

/// Holds the next logging-config read after it has fetched its value,
/// until released.
struct GatedStore {
    inner: MemoryStore,
    hold_next: AtomicBool,
    reading: Notify,
    release: Notify,
}

#[async_trait]
impl ConfigStore for GatedStore {
    async fn logging_config(&self, guild_id: &str) -> StoreResult<LoggingConfig> {
        let config = self.inner.logging_config(guild_id).await;
        if self.hold_next.swap(false, Ordering::SeqCst) {
            self.reading.notify_one();
            self.release.notified().await;
        }
        config
    }

    async fn save_logging_config(&self, config: &LoggingConfig) -> StoreResult<()> {
        self.inner.save_logging_config(config).await
    }

    async fn voice_xp_config(&self, guild_id: &str) -> StoreResult<VoiceXpConfig> {
        self.inner.voice_xp_config(guild_id).await
    }

    async fn save_voice_xp_config(&self, guild_id: &str, config: &VoiceXpConfig) -> StoreResult<()> {
        self.inner.save_voice_xp_config(guild_id, config).await
    }
}

#[tokio::test]
async fn write_during_a_miss_is_not_masked_by_the_stale_fill() {
    let (_, clock) = clock();
    let store = Arc::new(GatedStore {
        inner: MemoryStore::new(),
        hold_next: AtomicBool::new(true),
        reading: Notify::new(),
        release: Notify::new(),
    });
    let configs = Arc::new(GuildConfigs::new(
        store.clone(),
        Duration::from_secs(300),
        1000,
        clock,
    ));

    let reader = tokio::spawn({
        let configs = configs.clone();
        async move { configs.logging_config("g").await }
    });
    store.reading.notified().await;

    let mut logging = LoggingConfig::unconfigured("g");
    logging.enabled = true;
    logging.log_channel_id = Some("logs".into());
    assert_ok!(configs.set_logging_config(logging.clone()).await);

    store.release.notify_one();
    let stale = assert_ok!(reader.await.unwrap());
    assert_eq!(stale, LoggingConfig::unconfigured("g"));

    assert_eq!(assert_ok!(configs.logging_config("g").await), logging);
}
