//! Voice, nickname and avatar events, summarised per guild and kind.

use super::batcher::{BatchRecord, BatchSink, EventBatcher};
use super::describe_window;
use crate::cache::GuildConfigs;
use crate::notify::{self, capped_list, Color, Notice, Notifier, MAX_FIELDS};
use crate::store::LoggingConfig;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

const MAX_USERS_PER_CHANNEL: usize = 15;
const MAX_CHANGE_FIELDS: usize = 10;

pub type EventLogBatcher = EventBatcher<String, LogEvents>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LogEventKind {
    VoiceJoin,
    VoiceLeave,
    Nickname,
    Avatar,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEvent {
    pub kind: LogEventKind,
    pub user_id: String,
    pub username: String,
    pub channel_id: Option<String>,
    pub old_value: Option<String>,
    pub new_value: Option<String>,
    pub at: DateTime<Utc>,
}

impl LogEvent {
    fn new(kind: LogEventKind, user_id: &str, username: &str) -> Self {
        Self {
            kind,
            user_id: user_id.to_string(),
            username: username.to_string(),
            channel_id: None,
            old_value: None,
            new_value: None,
            at: Utc::now(),
        }
    }

    pub fn voice_join(user_id: &str, username: &str, channel_id: &str) -> Self {
        Self {
            channel_id: Some(channel_id.to_string()),
            ..Self::new(LogEventKind::VoiceJoin, user_id, username)
        }
    }

    pub fn voice_leave(user_id: &str, username: &str, channel_id: &str) -> Self {
        Self {
            channel_id: Some(channel_id.to_string()),
            ..Self::new(LogEventKind::VoiceLeave, user_id, username)
        }
    }

    pub fn nickname(
        user_id: &str,
        username: &str,
        old: Option<&str>,
        new: Option<&str>,
    ) -> Self {
        Self {
            old_value: old.map(str::to_string),
            new_value: new.map(str::to_string),
            ..Self::new(LogEventKind::Nickname, user_id, username)
        }
    }

    /// `avatar_url` is the new avatar, when known.
    pub fn avatar(user_id: &str, username: &str, avatar_url: Option<&str>) -> Self {
        Self {
            new_value: avatar_url.map(str::to_string),
            ..Self::new(LogEventKind::Avatar, user_id, username)
        }
    }
}

/// Every event queued for one guild, oldest first.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LogEvents(pub Vec<LogEvent>);

impl BatchRecord for LogEvents {
    fn merge(&mut self, newer: Self) {
        self.0.extend(newer.0);
    }
}

impl EventBatcher<String, LogEvents> {
    pub fn add_event(&self, guild_id: &str, event: LogEvent) {
        self.add(guild_id.to_string(), LogEvents(vec![event]));
    }
}

pub struct EventLogSink {
    configs: Arc<GuildConfigs>,
    notifier: Arc<dyn Notifier>,
    window: String,
}

impl EventLogSink {
    pub fn new(configs: Arc<GuildConfigs>, notifier: Arc<dyn Notifier>, window: Duration) -> Self {
        Self {
            configs,
            notifier,
            window: describe_window(window),
        }
    }
}

#[async_trait]
impl BatchSink<String, LogEvents> for EventLogSink {
    async fn write_batch(&self, batch: HashMap<String, LogEvents>) {
        for (guild_id, LogEvents(events)) in batch {
            let config = match self.configs.logging_config(&guild_id).await {
                Ok(config) => config,
                Err(e) => {
                    warn!(guild_id = %guild_id, events = events.len(), error = %e, "Dropping log events");
                    continue;
                }
            };

            let Some(channel) = config.active_channel() else {
                debug!(guild_id = %guild_id, events = events.len(), "Logging disabled, dropping events");
                continue;
            };

            for notice in event_notices(&config, &events, &self.window) {
                notify::dispatch(self.notifier.as_ref(), channel, notice).await;
            }
        }
    }
}

/// One notice per event kind the guild has switched on.
pub fn event_notices(config: &LoggingConfig, events: &[LogEvent], window: &str) -> Vec<Notice> {
    let of_kind = |kind: LogEventKind| -> Vec<&LogEvent> {
        events.iter().filter(|e| e.kind == kind).collect()
    };

    let mut notices = Vec::new();

    let joins = of_kind(LogEventKind::VoiceJoin);
    if config.member_join_voice && !joins.is_empty() {
        notices.push(voice_notice("Members Joined Voice", Color::GREEN, &joins, window));
    }

    let leaves = of_kind(LogEventKind::VoiceLeave);
    if config.member_leave_voice && !leaves.is_empty() {
        notices.push(voice_notice("Members Left Voice", Color::RED, &leaves, window));
    }

    let nicknames = of_kind(LogEventKind::Nickname);
    if config.nickname_change && !nicknames.is_empty() {
        let mut notice = Notice::new("Nickname Changes", Color::PURPLE).with_description(format!(
            "**{}** nickname changes in the last {}",
            nicknames.len(),
            window
        ));
        notice.push_capped_fields(&nicknames, MAX_CHANGE_FIELDS, "nickname changes", |e| {
            let old = e.old_value.as_deref().unwrap_or(&e.username);
            let new = e.new_value.as_deref().unwrap_or(&e.username);
            (format!("<@{}>", e.user_id), format!("`{}` → `{}`", old, new), true)
        });
        notices.push(notice.with_timestamp(Utc::now()));
    }

    let avatars = of_kind(LogEventKind::Avatar);
    if config.avatar_change && !avatars.is_empty() {
        let mut notice = Notice::new("Avatar Changes", Color::TEAL).with_description(format!(
            "**{}** avatar changes in the last {}",
            avatars.len(),
            window
        ));
        notice.push_capped_fields(&avatars, MAX_CHANGE_FIELDS, "avatar changes", |e| {
            let value = match e.new_value.as_deref() {
                Some(url) if !url.is_empty() => format!("[New Avatar]({})", url),
                _ => "Avatar updated".to_string(),
            };
            (format!("<@{}>", e.user_id), value, true)
        });
        notices.push(notice.with_timestamp(Utc::now()));
    }

    notices
}

fn voice_notice(title: &str, color: Color, events: &[&LogEvent], window: &str) -> Notice {
    let mut by_channel: BTreeMap<&str, Vec<String>> = BTreeMap::new();
    for event in events {
        by_channel
            .entry(event.channel_id.as_deref().unwrap_or("unknown"))
            .or_default()
            .push(format!("<@{}>", event.user_id));
    }
    let channels: Vec<(&str, Vec<String>)> = by_channel.into_iter().collect();

    let mut notice = Notice::new(title, color).with_description(format!(
        "**{}** voice events in the last {}",
        events.len(),
        window
    ));
    notice.push_capped_fields(&channels, MAX_FIELDS, "channels", |(channel, users)| {
        (
            format!("<#{}>", channel),
            capped_list(users, MAX_USERS_PER_CHANNEL),
            false,
        )
    });
    notice.with_timestamp(Utc::now())
}
