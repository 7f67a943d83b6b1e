use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Per-guild logging configuration. [`LoggingConfig::unconfigured`] is what
/// storage hands back for a guild that never set one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub guild_id: String,
    pub log_channel_id: Option<String>,
    pub message_delete: bool,
    pub message_edit: bool,
    pub member_join_voice: bool,
    pub member_leave_voice: bool,
    pub nickname_change: bool,
    pub avatar_change: bool,
    pub presence_change: bool,
    pub presence_batch_seconds: u64,
    pub enabled: bool,
}

impl LoggingConfig {
    pub fn unconfigured(guild_id: impl Into<String>) -> Self {
        Self {
            guild_id: guild_id.into(),
            log_channel_id: None,
            message_delete: true,
            message_edit: true,
            member_join_voice: true,
            member_leave_voice: true,
            nickname_change: true,
            avatar_change: true,
            presence_change: true,
            presence_batch_seconds: 120,
            enabled: false,
        }
    }

    /// The channel to log into, if logging is switched on and has somewhere to go.
    pub fn active_channel(&self) -> Option<&str> {
        match (&self.log_channel_id, self.enabled) {
            (Some(channel), true) if !channel.is_empty() => Some(channel.as_str()),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoiceXpConfig {
    pub enabled: bool,
    pub xp_rate: i64,
    pub interval_seconds: u64,
    pub ignore_afk: bool,
}

impl Default for VoiceXpConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            xp_rate: 10,
            interval_seconds: 300,
            ignore_afk: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct XpDelta {
    pub guild_id: String,
    pub user_id: String,
    /// Where to announce a level-up; `None` for silent grants (voice accrual).
    pub channel_id: Option<String>,
    pub xp: i64,
}

/// Outcome of one applied delta, as seen inside the write transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct XpApplied {
    pub guild_id: String,
    pub user_id: String,
    pub channel_id: Option<String>,
    pub old_level: i64,
    pub new_level: i64,
    pub total_xp: i64,
}

impl XpApplied {
    pub fn levelled_up(&self) -> bool {
        self.new_level > self.old_level
    }
}

/// A role a guild hands out once a member reaches `level`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LevelRole {
    pub role_id: String,
    pub level: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedMessage {
    pub message_id: String,
    pub guild_id: String,
    pub channel_id: String,
    pub author_id: String,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

/// Last known voice location, kept only as a recovery hint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersistedVoiceSession {
    pub guild_id: String,
    pub user_id: String,
    pub channel_id: String,
    pub joined_at: DateTime<Utc>,
}

/// Immutable logical identity of a scheduled resource. The channel behind
/// it changes on every rotation; the slot does not.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceKey {
    pub guild_id: String,
    pub slot_id: u64,
}

impl ResourceKey {
    pub fn new(guild_id: impl Into<String>, slot_id: u64) -> Self {
        Self {
            guild_id: guild_id.into(),
            slot_id,
        }
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.guild_id, self.slot_id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduledResource {
    pub key: ResourceKey,
    pub channel_id: String,
    pub interval_hours: u32,
    pub warning_minutes: u32,
    pub next_run: DateTime<Utc>,
    pub last_run: Option<DateTime<Utc>>,
    pub enabled: bool,
    pub warned: bool,
    pub custom_message: Option<String>,
    pub custom_image: Option<String>,
}

impl ScheduledResource {
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.enabled && self.next_run <= now
    }

    pub fn needs_warning(&self, now: DateTime<Utc>) -> bool {
        let window = chrono::Duration::minutes(i64::from(self.warning_minutes));
        self.enabled
            && !self.warned
            && self.warning_minutes > 0
            && self.next_run - window <= now
            && now < self.next_run
    }
}

/// Administrative request to rotate a channel every `interval_hours`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewResource {
    pub guild_id: String,
    pub channel_id: String,
    pub interval_hours: u32,
    pub warning_minutes: u32,
    pub next_run: DateTime<Utc>,
}

/// Fields written by a successful rotation, before anything is destroyed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunCompletion {
    pub new_channel_id: String,
    pub next_run: DateTime<Utc>,
    pub last_run: DateTime<Utc>,
}
