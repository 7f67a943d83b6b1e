//! Online-status changes, summarised per guild by transition.

use super::batcher::{BatchRecord, BatchSink, EventBatcher};
use super::describe_window;
use crate::cache::GuildConfigs;
use crate::clock::Clock;
use crate::notify::{self, capped_list, Color, Notice, Notifier, MAX_FIELDS};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::{debug, warn};

const MAX_USERS_PER_TRANSITION: usize = 20;

pub type PresenceBatcher = EventBatcher<String, PresenceChanges>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresenceChange {
    pub user_id: String,
    pub username: String,
    pub old_status: String,
    pub new_status: String,
    pub at: DateTime<Utc>,
}

impl PresenceChange {
    pub fn new(user_id: &str, username: &str, old_status: &str, new_status: &str) -> Self {
        Self {
            user_id: user_id.to_string(),
            username: username.to_string(),
            old_status: old_status.to_string(),
            new_status: new_status.to_string(),
            at: Utc::now(),
        }
    }

    pub fn observed_at(mut self, at: DateTime<Utc>) -> Self {
        self.at = at;
        self
    }

    fn transition(&self) -> String {
        format!("{} → {}", self.old_status, self.new_status)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PresenceChanges(pub Vec<PresenceChange>);

impl BatchRecord for PresenceChanges {
    fn merge(&mut self, newer: Self) {
        self.0.extend(newer.0);
    }
}

impl EventBatcher<String, PresenceChanges> {
    pub fn add_change(&self, guild_id: &str, change: PresenceChange) {
        self.add(guild_id.to_string(), PresenceChanges(vec![change]));
    }
}

/// Holds each guild's changes until the oldest one is older than that
/// guild's `presence_batch_seconds`, then sends one summary.
pub struct PresenceSink {
    configs: Arc<GuildConfigs>,
    notifier: Arc<dyn Notifier>,
    clock: Arc<dyn Clock>,
    held: Mutex<HashMap<String, Vec<PresenceChange>>>,
}

/// Window used when a guild's config cannot be read.
pub const DEFAULT_PRESENCE_WINDOW: Duration = Duration::from_secs(120);

impl PresenceSink {
    pub fn new(configs: Arc<GuildConfigs>, notifier: Arc<dyn Notifier>, clock: Arc<dyn Clock>) -> Self {
        Self {
            configs,
            notifier,
            clock,
            held: Mutex::new(HashMap::new()),
        }
    }

    pub fn held_len(&self) -> usize {
        self.held().values().map(Vec::len).sum()
    }

    fn held(&self) -> MutexGuard<'_, HashMap<String, Vec<PresenceChange>>> {
        self.held.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Send every guild whose window has elapsed, or every guild at all
    /// when `force` is set.
    async fn release(&self, force: bool) {
        let guilds: Vec<String> = self.held().keys().cloned().collect();
        let now = self.clock.now();

        for guild_id in guilds {
            let config = self.configs.logging_config(&guild_id).await;
            let window = match &config {
                Ok(config) => Duration::from_secs(config.presence_batch_seconds),
                Err(_) => DEFAULT_PRESENCE_WINDOW,
            };

            let changes = {
                let mut held = self.held();
                let due = match held.get(&guild_id).and_then(|changes| changes.first()) {
                    Some(oldest) => force || (now - oldest.at).to_std().map_or(false, |age| age >= window),
                    None => false,
                };
                if !due {
                    continue;
                }
                held.remove(&guild_id).unwrap_or_default()
            };

            let config = match config {
                Ok(config) => config,
                Err(e) => {
                    warn!(guild_id = %guild_id, changes = changes.len(), error = %e, "Dropping presence changes");
                    continue;
                }
            };

            let channel = match config.active_channel() {
                Some(channel) if config.presence_change => channel,
                _ => {
                    debug!(guild_id = %guild_id, "Presence logging off, dropping changes");
                    continue;
                }
            };

            let notice = presence_notice(&changes, &describe_window(window));
            notify::dispatch(self.notifier.as_ref(), channel, notice).await;
        }
    }
}

#[async_trait]
impl BatchSink<String, PresenceChanges> for PresenceSink {
    async fn write_batch(&self, batch: HashMap<String, PresenceChanges>) {
        let mut held = self.held();
        for (guild_id, PresenceChanges(changes)) in batch {
            held.entry(guild_id).or_default().extend(changes);
        }
    }

    async fn tick(&self) {
        self.release(false).await;
    }

    async fn close(&self) {
        self.release(true).await;
    }
}

pub fn presence_notice(changes: &[PresenceChange], window: &str) -> Notice {
    let mut by_transition: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for change in changes {
        by_transition
            .entry(change.transition())
            .or_default()
            .push(change.username.clone());
    }
    let transitions: Vec<(String, Vec<String>)> = by_transition.into_iter().collect();

    let mut notice = Notice::new("Presence Changes", Color::BLUE).with_description(format!(
        "**{}** presence changes in the last {}",
        changes.len(),
        window
    ));
    notice.push_capped_fields(&transitions, MAX_FIELDS, "transitions", |(transition, users)| {
        (
            transition.clone(),
            capped_list(users, MAX_USERS_PER_TRANSITION),
            false,
        )
    });
    notice.with_timestamp(Utc::now())
}
