//! Wiring: one [`Settings`] value plus the platform collaborators in, every
//! background loop running out.

use crate::batch::{
    sweep_expired_messages, BatchSink, EventBatcher, EventLogBatcher, EventLogSink, LogEvents,
    MessageCacheBatcher, MessageCacheSink, PresenceBatcher, PresenceChanges, PresenceSink,
    RoleGrants, XpBatcher, XpGrant, XpKey, XpSink,
};
use crate::cache::GuildConfigs;
use crate::clock::Clock;
use crate::config::Settings;
use crate::health::{Connection, ConnectionHealthMonitor, HealthHandle};
use crate::notify::Notifier;
use crate::scheduler::{ChannelActions, DedupScheduler};
use crate::store::{CachedMessage, MessageCacheStore, Storage};
use crate::task::{self, FirstRun, Shutdown};
use crate::voice::{VoicePresence, VoiceXpTracker};
use anyhow::Context;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Platform-side implementations the coordinator drives.
pub struct Collaborators {
    pub notifier: Arc<dyn Notifier>,
    pub roles: Arc<dyn RoleGrants>,
    pub actions: Arc<dyn ChannelActions>,
    pub presence: Arc<dyn VoicePresence>,
    pub connection: Arc<dyn Connection>,
    pub clock: Arc<dyn Clock>,
}

/// Owns every background component for one bot process.
pub struct Coordinator {
    configs: Arc<GuildConfigs>,
    xp: Arc<XpBatcher>,
    messages: Arc<MessageCacheBatcher>,
    event_log: Arc<EventLogBatcher>,
    presence: Arc<PresenceBatcher>,
    scheduler: Arc<DedupScheduler>,
    voice: Arc<VoiceXpTracker>,
    health: Arc<ConnectionHealthMonitor>,
    maintenance: Shutdown,
    sweepers: Mutex<Vec<JoinHandle<()>>>,
}

impl Coordinator {
    /// Build and start everything. Voice sessions are recovered before this
    /// returns.
    pub async fn start<S>(
        settings: &Settings,
        store: Arc<S>,
        collaborators: Collaborators,
    ) -> anyhow::Result<Self>
    where
        S: Storage + 'static,
    {
        settings.validate().context("refusing to start with invalid settings")?;

        let Collaborators {
            notifier,
            roles,
            actions,
            presence,
            connection,
            clock,
        } = collaborators;

        let configs = Arc::new(GuildConfigs::new(
            store.clone(),
            Duration::from_secs(settings.cache.ttl_seconds),
            settings.cache.max_entries,
            clock.clone(),
        ));

        let batching = &settings.batching;
        let xp_sink: Arc<dyn BatchSink<XpKey, XpGrant>> =
            Arc::new(XpSink::new(store.clone(), notifier.clone(), roles));
        let xp: Arc<XpBatcher> = EventBatcher::new("xp", batching.xp.to_config(), xp_sink);

        let message_sink: Arc<dyn BatchSink<String, CachedMessage>> =
            Arc::new(MessageCacheSink::new(store.clone()));
        let messages: Arc<MessageCacheBatcher> =
            EventBatcher::new("message-cache", batching.message_cache.to_config(), message_sink);

        let event_sink: Arc<dyn BatchSink<String, LogEvents>> = Arc::new(EventLogSink::new(
            configs.clone(),
            notifier.clone(),
            batching.event_log.flush_interval(),
        ));
        let event_log: Arc<EventLogBatcher> =
            EventBatcher::new("event-log", batching.event_log.to_config(), event_sink);

        let presence_sink: Arc<dyn BatchSink<String, PresenceChanges>> = Arc::new(PresenceSink::new(
            configs.clone(),
            notifier.clone(),
            clock.clone(),
        ));
        let presence_batcher: Arc<PresenceBatcher> =
            EventBatcher::new("presence", batching.presence.to_config(), presence_sink);

        let health = ConnectionHealthMonitor::new(
            HealthHandle::new(),
            connection,
            settings.health.to_config(),
        );

        let scheduler = DedupScheduler::new(
            store.clone(),
            actions,
            notifier,
            Arc::new(health.handle()),
            clock.clone(),
            settings.scheduler.to_config(),
        );

        let voice = VoiceXpTracker::new(
            store.clone(),
            configs.clone(),
            presence,
            xp.clone(),
            clock.clone(),
            Duration::from_secs(settings.voice.accrual_interval_seconds),
        );

        let maintenance = Shutdown::new();
        let sweepers = vec![
            spawn_retention_sweeper(settings, store.clone(), clock, &maintenance),
            spawn_cache_purge(settings, configs.clone(), &maintenance),
        ];

        xp.start();
        messages.start();
        event_log.start();
        presence_batcher.start();
        let recovered = voice.start().await;
        scheduler.start();
        health.start();

        info!(recovered_voice_sessions = recovered, "Coordinator started");

        Ok(Self {
            configs,
            xp,
            messages,
            event_log,
            presence: presence_batcher,
            scheduler,
            voice,
            health,
            maintenance,
            sweepers: Mutex::new(sweepers),
        })
    }

    pub fn configs(&self) -> &Arc<GuildConfigs> {
        &self.configs
    }

    pub fn xp(&self) -> &Arc<XpBatcher> {
        &self.xp
    }

    pub fn messages(&self) -> &Arc<MessageCacheBatcher> {
        &self.messages
    }

    pub fn event_log(&self) -> &Arc<EventLogBatcher> {
        &self.event_log
    }

    pub fn presence(&self) -> &Arc<PresenceBatcher> {
        &self.presence
    }

    pub fn scheduler(&self) -> &Arc<DedupScheduler> {
        &self.scheduler
    }

    pub fn voice(&self) -> &Arc<VoiceXpTracker> {
        &self.voice
    }

    /// For gateway event handlers to report connection transitions.
    pub fn health(&self) -> HealthHandle {
        self.health.handle()
    }

    /// Ordered stop: supervision and rotation first, then voice sessions
    /// (whose last grants land in the XP batcher), then every batcher's
    /// final flush, then the maintenance loops.
    pub async fn shutdown(&self) {
        info!("Coordinator shutting down");

        self.health.stop().await;
        self.scheduler.stop().await;
        self.voice.stop().await;

        tokio::join!(
            self.xp.stop(),
            self.messages.stop(),
            self.event_log.stop(),
            self.presence.stop(),
        );

        self.maintenance.trigger();
        let sweepers = std::mem::take(
            &mut *self.sweepers.lock().unwrap_or_else(PoisonError::into_inner),
        );
        for handle in sweepers {
            if let Err(e) = handle.await {
                warn!(error = %e, "Maintenance loop ended abnormally");
            }
        }

        info!("Coordinator stopped");
    }
}

fn spawn_retention_sweeper<S>(
    settings: &Settings,
    store: Arc<S>,
    clock: Arc<dyn Clock>,
    maintenance: &Shutdown,
) -> JoinHandle<()>
where
    S: MessageCacheStore + 'static,
{
    let retention = settings.retention.retention();
    task::spawn_periodic(
        "message-retention",
        settings.retention.sweep_interval(),
        FirstRun::Immediately,
        maintenance.listener(),
        move || {
            let store = store.clone();
            let clock = clock.clone();
            async move {
                sweep_expired_messages(store.as_ref(), clock.as_ref(), retention).await;
            }
        },
    )
}

fn spawn_cache_purge(
    settings: &Settings,
    configs: Arc<GuildConfigs>,
    maintenance: &Shutdown,
) -> JoinHandle<()> {
    task::spawn_periodic(
        "config-cache-purge",
        Duration::from_secs(settings.cache.purge_interval_seconds),
        FirstRun::AfterPeriod,
        maintenance.listener(),
        move || {
            let configs = configs.clone();
            async move {
                configs.purge_expired().await;
            }
        },
    )
}
