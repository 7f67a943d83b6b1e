//! Rotation ordering, retry and deduplication.

use super::*;
use crate::clock::{Clock, ManualClock};
use crate::notify::testing::RecordingNotifier;
use crate::notify::Color;
use crate::store::{Fault, MemoryStore, ScheduleStore};
use async_trait::async_trait;
use chrono::{Duration, TimeZone, Utc};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Semaphore;

#[derive(Default)]
struct FakeActions {
    calls: Mutex<Vec<String>>,
    created: AtomicUsize,
    fail_create: AtomicBool,
    fail_destroy: AtomicBool,
    gate: Option<Arc<Semaphore>>,
}

impl FakeActions {
    fn gated(gate: Arc<Semaphore>) -> Self {
        Self {
            gate: Some(gate),
            ..Default::default()
        }
    }

    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl ChannelActions for FakeActions {
    async fn snapshot(
        &self,
        guild_id: &str,
        channel_id: &str,
    ) -> Result<ChannelTemplate, ActionError> {
        if let Some(gate) = &self.gate {
            gate.acquire().await.unwrap().forget();
        }
        self.record(format!("snapshot:{}", channel_id));
        Ok(ChannelTemplate {
            guild_id: guild_id.to_string(),
            name: format!("chan-{}", channel_id),
            topic: None,
            parent_id: None,
            position: 3,
            nsfw: false,
            rate_limit_per_user: 0,
        })
    }

    async fn create_from(&self, template: &ChannelTemplate) -> Result<String, ActionError> {
        self.record(format!("create:{}", template.name));
        if self.fail_create.load(Ordering::SeqCst) {
            return Err(ActionError::Forbidden("manage channels".into()));
        }
        let n = self.created.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(format!("new-{}", n))
    }

    async fn reposition(&self, channel_id: &str, position: i32) -> Result<(), ActionError> {
        self.record(format!("reposition:{}:{}", channel_id, position));
        Ok(())
    }

    async fn destroy(&self, channel_id: &str) -> Result<(), ActionError> {
        self.record(format!("destroy:{}", channel_id));
        if self.fail_destroy.load(Ordering::SeqCst) {
            return Err(ActionError::NotFound(channel_id.to_string()));
        }
        Ok(())
    }
}

struct Offline;

impl ConnectivityProbe for Offline {
    fn is_connected(&self) -> bool {
        false
    }
}

struct Harness {
    store: Arc<MemoryStore>,
    actions: Arc<FakeActions>,
    notifier: Arc<RecordingNotifier>,
    clock: ManualClock,
    scheduler: Arc<DedupScheduler>,
}

fn harness_with(actions: FakeActions, probe: Arc<dyn ConnectivityProbe>) -> Harness {
    let store = Arc::new(MemoryStore::new());
    let actions = Arc::new(actions);
    let notifier = Arc::new(RecordingNotifier::default());
    let clock = ManualClock::new(Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap());

    let scheduler = DedupScheduler::new(
        store.clone(),
        actions.clone(),
        notifier.clone(),
        probe,
        Arc::new(clock.clone()),
        SchedulerConfig::default(),
    );

    Harness {
        store,
        actions,
        notifier,
        clock,
        scheduler,
    }
}

fn harness() -> Harness {
    harness_with(FakeActions::default(), Arc::new(AlwaysConnected))
}

#[tokio::test]
async fn replacement_is_persisted_before_the_original_is_destroyed() {
    let h = harness();
    let added = h.scheduler.add_resource("g", "old", 24, None).await.unwrap();
    assert_eq!(added.warning_minutes, 15);

    h.clock.advance(Duration::hours(24));
    assert_eq!(h.scheduler.poll().await, 1);
    h.scheduler.wait_for_jobs().await;

    let stored = h.store.resource(&added.key).await.unwrap().unwrap();
    assert_eq!(stored.channel_id, "new-1");
    assert_eq!(stored.next_run, h.clock.now() + Duration::hours(24));
    assert_eq!(stored.last_run, Some(h.clock.now()));
    assert!(stored.enabled);
    assert!(!stored.warned);

    assert_eq!(
        h.actions.calls(),
        vec![
            "snapshot:old",
            "create:chan-old",
            "reposition:new-1:3",
            "destroy:old"
        ]
    );

    let sent = h.notifier.sent();
    assert_eq!(sent.len(), 1);
    let (dest, notice) = &sent[0];
    assert_eq!(dest, "new-1");
    assert_eq!(notice.description, service::DEFAULT_CLEAN_MESSAGE);
    assert_eq!(notice.footer.as_deref(), Some(service::DEFAULT_CLEAN_FOOTER));
    assert_eq!(notice.color, Color::PINK);
}

#[tokio::test]
async fn failed_create_reschedules_for_retry() {
    let h = harness();
    h.actions.fail_create.store(true, Ordering::SeqCst);
    let added = h.scheduler.add_resource("g", "old", 24, None).await.unwrap();

    h.clock.advance(Duration::hours(24));
    h.scheduler.poll().await;
    h.scheduler.wait_for_jobs().await;

    let stored = h.store.resource(&added.key).await.unwrap().unwrap();
    assert_eq!(stored.next_run, h.clock.now() + Duration::hours(1));
    assert!(stored.enabled);
    assert_eq!(stored.channel_id, "old");
    assert!(stored.last_run.is_none());
    assert_eq!(h.actions.calls(), vec!["snapshot:old", "create:chan-old"]);
    assert!(h.notifier.sent().is_empty());

    // lock released, and the retry picks it up again
    assert!(!h.scheduler.is_running(&added.key));
    h.actions.fail_create.store(false, Ordering::SeqCst);
    h.clock.advance(Duration::hours(1));
    assert_eq!(h.scheduler.poll().await, 1);
    h.scheduler.wait_for_jobs().await;
    let stored = h.store.resource(&added.key).await.unwrap().unwrap();
    assert_eq!(stored.channel_id, "new-1");
}

#[tokio::test]
async fn failed_persist_removes_the_replacement_and_keeps_the_original() {
    let h = harness();
    let added = h.scheduler.add_resource("g", "old", 24, None).await.unwrap();
    let scheduled_for = added.next_run;

    h.clock.advance(Duration::hours(24));
    h.store.inject(Fault::ScheduleWrites);
    h.scheduler.poll().await;
    h.scheduler.wait_for_jobs().await;
    h.store.heal(Fault::ScheduleWrites);

    assert_eq!(
        h.actions.calls(),
        vec!["snapshot:old", "create:chan-old", "destroy:new-1"]
    );
    let stored = h.store.resource(&added.key).await.unwrap().unwrap();
    assert_eq!(stored.channel_id, "old");
    assert_eq!(stored.next_run, scheduled_for);
    assert!(!h.scheduler.is_running(&added.key));
}

#[tokio::test]
async fn trailing_failures_do_not_fail_the_run() {
    let h = harness();
    h.actions.fail_destroy.store(true, Ordering::SeqCst);
    let added = h.scheduler.add_resource("g", "old", 6, None).await.unwrap();

    h.clock.advance(Duration::hours(6));
    h.scheduler.poll().await;
    h.scheduler.wait_for_jobs().await;

    let stored = h.store.resource(&added.key).await.unwrap().unwrap();
    assert_eq!(stored.channel_id, "new-1");
    assert_eq!(stored.next_run, h.clock.now() + Duration::hours(6));
    assert_eq!(h.notifier.sent().len(), 1);
}

#[tokio::test]
async fn a_running_resource_is_skipped_not_queued() {
    let gate = Arc::new(Semaphore::new(0));
    let h = harness_with(FakeActions::gated(gate.clone()), Arc::new(AlwaysConnected));
    let added = h.scheduler.add_resource("g", "old", 24, None).await.unwrap();
    h.clock.advance(Duration::hours(24));

    assert_eq!(h.scheduler.poll().await, 1);
    assert!(h.scheduler.is_running(&added.key));
    assert_eq!(h.scheduler.poll().await, 0);

    gate.add_permits(1);
    h.scheduler.wait_for_jobs().await;
    assert!(!h.scheduler.is_running(&added.key));
    assert_eq!(
        h.actions
            .calls()
            .iter()
            .filter(|c| c.starts_with("snapshot"))
            .count(),
        1
    );

    h.clock.advance(Duration::hours(24));
    gate.add_permits(1);
    assert_eq!(h.scheduler.poll().await, 1);
    h.scheduler.wait_for_jobs().await;
    let stored = h.store.resource(&added.key).await.unwrap().unwrap();
    assert_eq!(stored.channel_id, "new-2");
}

#[tokio::test]
async fn poll_is_skipped_while_disconnected() {
    let h = harness_with(FakeActions::default(), Arc::new(Offline));
    h.scheduler.add_resource("g", "old", 1, Some(30)).await.unwrap();

    h.clock.advance(Duration::hours(2));
    assert_eq!(h.scheduler.poll().await, 0);
    assert!(h.actions.calls().is_empty());
    assert!(h.notifier.sent().is_empty());
}

#[tokio::test]
async fn warning_is_sent_once_and_cleared_by_the_run() {
    let h = harness();
    let added = h.scheduler.add_resource("g", "chan", 1, Some(15)).await.unwrap();

    h.clock.advance(Duration::minutes(50));
    assert_eq!(h.scheduler.poll().await, 0);
    let sent = h.notifier.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].0, "chan");
    assert!(sent[0].1.description.contains("**10 minutes**"));
    assert!(h.store.resource(&added.key).await.unwrap().unwrap().warned);

    h.clock.advance(Duration::minutes(1));
    h.scheduler.poll().await;
    assert_eq!(h.notifier.sent().len(), 1);

    h.clock.advance(Duration::minutes(9));
    assert_eq!(h.scheduler.poll().await, 1);
    h.scheduler.wait_for_jobs().await;
    let stored = h.store.resource(&added.key).await.unwrap().unwrap();
    assert!(!stored.warned);
    assert_eq!(h.notifier.sent().len(), 2);
}

#[tokio::test]
async fn administrative_surface() {
    let h = harness();

    assert!(matches!(
        h.scheduler.add_resource("g", "c", 0, None).await,
        Err(SchedulerError::InvalidInterval)
    ));

    let first = h.scheduler.add_resource("g", "c", 24, None).await.unwrap();
    let again = h.scheduler.add_resource("g", "c", 12, Some(5)).await.unwrap();
    assert_eq!(first.key, again.key);
    assert_eq!(again.interval_hours, 12);
    assert_eq!(again.warning_minutes, 5);
    assert_eq!(h.scheduler.list_resources("g").await.unwrap().len(), 1);
    assert!(h.scheduler.list_resources("other").await.unwrap().is_empty());

    assert!(matches!(
        h.scheduler.remove_resource("g", "missing").await,
        Err(SchedulerError::NotFound { .. })
    ));

    h.scheduler.set_enabled("g", "c", false).await.unwrap();
    h.clock.advance(Duration::hours(12));
    assert_eq!(h.scheduler.poll().await, 0);

    h.scheduler.set_enabled("g", "c", true).await.unwrap();
    h.scheduler
        .set_custom_message("g", "c", Some("Fresh start".into()))
        .await
        .unwrap();
    h.scheduler
        .set_custom_image("g", "c", Some("https://img.example/broom.png".into()))
        .await
        .unwrap();
    assert_eq!(h.scheduler.poll().await, 1);
    h.scheduler.wait_for_jobs().await;

    let sent = h.notifier.sent();
    let (_, notice) = sent.last().unwrap();
    assert_eq!(notice.description, "Fresh start");
    assert_eq!(
        notice.image_url.as_deref(),
        Some("https://img.example/broom.png")
    );

    // admin calls follow the channel through the rotation
    h.scheduler.remove_resource("g", "new-1").await.unwrap();
    assert!(h.scheduler.list_resources("g").await.unwrap().is_empty());
}
