use super::actions::{ChannelActions, ConnectivityProbe};
use super::dedup::{DedupGuard, DedupLocks};
use super::error::{JobError, Result, SchedulerError};
use crate::clock::Clock;
use crate::notify::{self, Color, Notice, Notifier};
use crate::store::{NewResource, ResourceKey, RunCompletion, ScheduleStore, ScheduledResource};
use crate::task::{self, FirstRun, Shutdown, WorkerPool};
use chrono::{DateTime, Utc};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

pub const DEFAULT_CLEAN_MESSAGE: &str = "This channel has been automatically cleaned!";
pub const DEFAULT_CLEAN_FOOTER: &str = "Auto-cleaned";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerConfig {
    pub poll_interval: Duration,
    pub retry_offset: Duration,
    pub max_concurrent_jobs: usize,
    pub default_warning_minutes: u32,
    pub clean_message: String,
    pub clean_footer: String,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(60),
            retry_offset: Duration::from_secs(3600),
            max_concurrent_jobs: 5,
            default_warning_minutes: 15,
            clean_message: DEFAULT_CLEAN_MESSAGE.to_string(),
            clean_footer: DEFAULT_CLEAN_FOOTER.to_string(),
        }
    }
}

/// Periodic channel rotation ("auto-clean") with one run per resource slot.
pub struct DedupScheduler {
    store: Arc<dyn ScheduleStore>,
    actions: Arc<dyn ChannelActions>,
    notifier: Arc<dyn Notifier>,
    probe: Arc<dyn ConnectivityProbe>,
    clock: Arc<dyn Clock>,
    config: SchedulerConfig,
    locks: DedupLocks,
    jobs: WorkerPool,
    shutdown: Shutdown,
    ticker: Mutex<Option<JoinHandle<()>>>,
}

fn hours(h: u32) -> chrono::Duration {
    chrono::Duration::hours(i64::from(h))
}

impl DedupScheduler {
    pub fn new(
        store: Arc<dyn ScheduleStore>,
        actions: Arc<dyn ChannelActions>,
        notifier: Arc<dyn Notifier>,
        probe: Arc<dyn ConnectivityProbe>,
        clock: Arc<dyn Clock>,
        config: SchedulerConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            jobs: WorkerPool::new("scheduler-job", config.max_concurrent_jobs),
            store,
            actions,
            notifier,
            probe,
            clock,
            config,
            locks: DedupLocks::new(),
            shutdown: Shutdown::new(),
            ticker: Mutex::new(None),
        })
    }

    pub fn start(self: &Arc<Self>) {
        let mut ticker = self.ticker.lock().unwrap_or_else(PoisonError::into_inner);
        if ticker.is_some() || self.shutdown.is_triggered() {
            return;
        }

        let scheduler = Arc::clone(self);
        *ticker = Some(task::spawn_periodic(
            "scheduler",
            self.config.poll_interval,
            FirstRun::AfterPeriod,
            self.shutdown.listener(),
            move || {
                let scheduler = Arc::clone(&scheduler);
                async move {
                    scheduler.poll().await;
                }
            },
        ));

        info!(
            poll_interval_secs = self.config.poll_interval.as_secs(),
            max_concurrent_jobs = self.config.max_concurrent_jobs,
            "Scheduler started"
        );
    }

    /// Stop polling and let running jobs finish.
    pub async fn stop(&self) {
        self.shutdown.trigger();
        let ticker = self
            .ticker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = ticker {
            if let Err(e) = handle.await {
                warn!(error = %e, "Scheduler ticker ended abnormally");
            }
        }
        self.wait_for_jobs().await;
        info!("Scheduler stopped");
    }

    pub async fn wait_for_jobs(&self) {
        self.jobs.drain().await;
    }

    pub fn is_running(&self, key: &ResourceKey) -> bool {
        self.locks.is_running(key)
    }

    /// One scheduler tick: start every due job that is not already running,
    /// then send pending warnings. Returns the number of jobs started.
    pub async fn poll(self: &Arc<Self>) -> usize {
        if !self.probe.is_connected() {
            info!("Skipping scheduler poll, not connected");
            return 0;
        }

        let now = self.clock.now();
        let mut started = 0;

        match self.store.due_resources(now).await {
            Ok(due) => {
                for resource in due {
                    let Some(guard) = self.locks.try_acquire(&resource.key) else {
                        debug!(resource = %resource.key, "Rotation already running, skipping");
                        continue;
                    };

                    let scheduler = Arc::clone(self);
                    self.jobs.spawn(async move {
                        // outcome is logged inside
                        let _ = scheduler.run_job(resource, guard).await;
                    });
                    started += 1;
                }
            }
            Err(e) => error!(error = %e, "Failed to query due rotations"),
        }

        self.send_warnings(now).await;
        started
    }

    /// Rotate one resource while holding its lock. Any failure before the
    /// replacement is persisted reschedules the resource for a retry.
    #[instrument(skip(self, resource, guard), fields(resource = %resource.key, run_id = %guard.run_id()))]
    pub async fn run_job(
        &self,
        resource: ScheduledResource,
        guard: DedupGuard,
    ) -> std::result::Result<String, JobError> {
        let _guard = guard;
        let now = self.clock.now();
        info!(channel_id = %resource.channel_id, "Rotating channel");

        match self.rotate(&resource, now).await {
            Ok(new_channel) => {
                info!(
                    old_channel = %resource.channel_id,
                    new_channel = %new_channel,
                    "Channel rotated"
                );
                Ok(new_channel)
            }
            Err(e) => {
                warn!(error = %e, "Rotation failed, scheduling retry");
                let retry = chrono::Duration::from_std(self.config.retry_offset)
                    .unwrap_or_else(|_| chrono::Duration::hours(1));
                if let Err(e) = self.store.reschedule(&resource.key, now + retry).await {
                    error!(error = %e, "Failed to reschedule rotation");
                }
                Err(e)
            }
        }
    }

    async fn rotate(
        &self,
        resource: &ScheduledResource,
        now: DateTime<Utc>,
    ) -> std::result::Result<String, JobError> {
        let old_channel = resource.channel_id.as_str();

        let template = self
            .actions
            .snapshot(&resource.key.guild_id, old_channel)
            .await
            .map_err(JobError::Snapshot)?;

        let new_channel = self
            .actions
            .create_from(&template)
            .await
            .map_err(JobError::Create)?;

        // nothing is destroyed until the replacement is on record
        let completion = RunCompletion {
            new_channel_id: new_channel.clone(),
            next_run: now + hours(resource.interval_hours),
            last_run: now,
        };
        if let Err(e) = self
            .store
            .complete_run(&resource.key, old_channel, &completion)
            .await
        {
            error!(new_channel = %new_channel, error = %e, "Failed to persist replacement channel, removing it");
            if let Err(e) = self.actions.destroy(&new_channel).await {
                warn!(new_channel = %new_channel, error = %e, "Failed to remove orphaned replacement channel");
            }
            return Err(JobError::Persist(e));
        }

        if let Err(e) = self.actions.reposition(&new_channel, template.position).await {
            warn!(new_channel = %new_channel, error = %e, "Failed to reposition replacement channel");
        }

        if let Err(e) = self.actions.destroy(old_channel).await {
            warn!(
                old_channel = %old_channel,
                new_channel = %new_channel,
                error = %e,
                "Failed to delete old channel, replacement is active"
            );
        }

        notify::dispatch(
            self.notifier.as_ref(),
            &new_channel,
            self.completion_notice(resource, now),
        )
        .await;

        Ok(new_channel)
    }

    fn completion_notice(&self, resource: &ScheduledResource, now: DateTime<Utc>) -> Notice {
        let message = resource
            .custom_message
            .as_deref()
            .filter(|m| !m.is_empty())
            .unwrap_or(&self.config.clean_message);

        let mut notice = Notice::new("", Color::PINK)
            .with_description(message)
            .with_footer(&self.config.clean_footer)
            .with_timestamp(now);
        if let Some(image) = resource.custom_image.as_deref().filter(|i| !i.is_empty()) {
            notice = notice.with_image(image);
        }
        notice
    }

    async fn send_warnings(&self, now: DateTime<Utc>) {
        let upcoming = match self.store.resources_needing_warning(now).await {
            Ok(upcoming) => upcoming,
            Err(e) => {
                error!(error = %e, "Failed to query rotation warnings");
                return;
            }
        };

        for resource in upcoming {
            let minutes = (resource.next_run - now).num_minutes().max(0);
            let notice = Notice::new("Channel Clean Warning", Color::AMBER)
                .with_description(format!(
                    "This channel will be cleaned in **{} minutes**!\n\nAll messages will be deleted.",
                    minutes
                ))
                .with_footer("Save any important messages now!");

            notify::dispatch(self.notifier.as_ref(), &resource.channel_id, notice).await;

            if let Err(e) = self.store.mark_warned(&resource.key).await {
                warn!(resource = %resource.key, error = %e, "Failed to mark rotation as warned");
            }
        }
    }

    /// Rotate `channel_id` every `interval_hours`, starting one interval from
    /// now. Adding a channel that is already scheduled replaces its settings.
    #[instrument(skip(self))]
    pub async fn add_resource(
        &self,
        guild_id: &str,
        channel_id: &str,
        interval_hours: u32,
        warning_minutes: Option<u32>,
    ) -> Result<ScheduledResource> {
        if interval_hours == 0 {
            return Err(SchedulerError::InvalidInterval);
        }

        let resource = self
            .store
            .upsert_resource(NewResource {
                guild_id: guild_id.to_string(),
                channel_id: channel_id.to_string(),
                interval_hours,
                warning_minutes: warning_minutes.unwrap_or(self.config.default_warning_minutes),
                next_run: self.clock.now() + hours(interval_hours),
            })
            .await?;

        info!(resource = %resource.key, next_run = %resource.next_run, "Channel rotation scheduled");
        Ok(resource)
    }

    pub async fn remove_resource(&self, guild_id: &str, channel_id: &str) -> Result<()> {
        let key = self.resolve(guild_id, channel_id).await?;
        self.store.remove_resource(&key).await?;
        info!(resource = %key, "Channel rotation removed");
        Ok(())
    }

    pub async fn set_enabled(&self, guild_id: &str, channel_id: &str, enabled: bool) -> Result<()> {
        let key = self.resolve(guild_id, channel_id).await?;
        self.store.set_enabled(&key, enabled).await?;
        Ok(())
    }

    pub async fn set_custom_message(
        &self,
        guild_id: &str,
        channel_id: &str,
        message: Option<String>,
    ) -> Result<()> {
        let key = self.resolve(guild_id, channel_id).await?;
        self.store.set_custom_message(&key, message).await?;
        Ok(())
    }

    pub async fn set_custom_image(
        &self,
        guild_id: &str,
        channel_id: &str,
        image: Option<String>,
    ) -> Result<()> {
        let key = self.resolve(guild_id, channel_id).await?;
        self.store.set_custom_image(&key, image).await?;
        Ok(())
    }

    pub async fn list_resources(&self, guild_id: &str) -> Result<Vec<ScheduledResource>> {
        Ok(self.store.list_resources(guild_id).await?)
    }

    async fn resolve(&self, guild_id: &str, channel_id: &str) -> Result<ResourceKey> {
        self.store
            .find_resource(guild_id, channel_id)
            .await?
            .map(|r| r.key)
            .ok_or_else(|| SchedulerError::NotFound {
                guild_id: guild_id.to_string(),
                channel_id: channel_id.to_string(),
            })
    }
}
