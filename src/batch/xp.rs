//! XP accrual: additive per-user deltas written in one transaction, with
//! level-ups announced per channel and level roles granted afterwards.

use super::batcher::{BatchRecord, BatchSink, EventBatcher};
use crate::notify::{self, Color, Notice, Notifier};
use crate::store::{XpApplied, XpDelta, XpStore};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, info, warn};

const MAX_LEVEL_UP_LINES: usize = 20;

/// `(guild_id, user_id)`
pub type XpKey = (String, String);

pub type XpBatcher = EventBatcher<XpKey, XpGrant>;

/// Level reached with `xp` total experience.
pub fn level_for_xp(xp: i64) -> i64 {
    if xp <= 0 {
        return 0;
    }
    let xp = xp as f64;
    (((1.0 + 8.0 * xp / 50.0).sqrt() - 1.0) / 2.0).floor() as i64
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct XpGrant {
    /// Where a resulting level-up gets announced.
    pub channel_id: Option<String>,
    pub xp: i64,
}

impl BatchRecord for XpGrant {
    fn merge(&mut self, newer: Self) {
        self.xp += newer.xp;
        if newer.channel_id.is_some() {
            self.channel_id = newer.channel_id;
        }
    }
}

impl EventBatcher<XpKey, XpGrant> {
    pub fn add_xp(&self, guild_id: &str, user_id: &str, channel_id: Option<&str>, xp: i64) {
        self.add(
            (guild_id.to_string(), user_id.to_string()),
            XpGrant {
                channel_id: channel_id.map(str::to_string),
                xp,
            },
        );
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RoleGrantError {
    #[error("Missing permission: {0}")]
    Forbidden(String),
    #[error("Platform request failed: {0}")]
    Request(String),
}

/// Member role changes the level rewards need from the platform.
#[async_trait]
pub trait RoleGrants: Send + Sync {
    /// Granting a role the member already has is not an error.
    async fn grant_role(&self, guild_id: &str, user_id: &str, role_id: &str)
        -> Result<(), RoleGrantError>;
}

/// Logs every grant instead of performing it. Used for dry runs.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingRoleGrants;

#[async_trait]
impl RoleGrants for TracingRoleGrants {
    async fn grant_role(
        &self,
        guild_id: &str,
        user_id: &str,
        role_id: &str,
    ) -> Result<(), RoleGrantError> {
        info!(guild_id = guild_id, user_id = user_id, role_id = role_id, "Role grant");
        Ok(())
    }
}

pub struct XpSink {
    store: Arc<dyn XpStore>,
    notifier: Arc<dyn Notifier>,
    roles: Arc<dyn RoleGrants>,
}

impl XpSink {
    pub fn new(store: Arc<dyn XpStore>, notifier: Arc<dyn Notifier>, roles: Arc<dyn RoleGrants>) -> Self {
        Self {
            store,
            notifier,
            roles,
        }
    }

    /// Grant every reward role at or below the new level. Best-effort: a
    /// failed lookup or grant is logged and the rest carry on.
    async fn grant_level_roles(&self, row: &XpApplied) -> usize {
        let roles = match self.store.level_roles(&row.guild_id, row.new_level).await {
            Ok(roles) => roles,
            Err(e) => {
                warn!(guild_id = %row.guild_id, user_id = %row.user_id, error = %e, "Could not load level roles");
                return 0;
            }
        };

        let mut granted = 0;
        for role in roles {
            match self.roles.grant_role(&row.guild_id, &row.user_id, &role.role_id).await {
                Ok(()) => granted += 1,
                Err(e) => warn!(
                    guild_id = %row.guild_id,
                    user_id = %row.user_id,
                    role_id = %role.role_id,
                    error = %e,
                    "Level role grant failed"
                ),
            }
        }
        granted
    }
}

#[async_trait]
impl BatchSink<XpKey, XpGrant> for XpSink {
    async fn write_batch(&self, batch: HashMap<XpKey, XpGrant>) {
        let deltas: Vec<XpDelta> = batch
            .into_iter()
            .map(|((guild_id, user_id), grant)| XpDelta {
                guild_id,
                user_id,
                channel_id: grant.channel_id,
                xp: grant.xp,
            })
            .collect();

        let applied = match self.store.apply_xp_batch(&deltas).await {
            Ok(applied) => applied,
            Err(e) => {
                error!(records = deltas.len(), error = %e, "Dropping XP batch");
                return;
            }
        };

        let mut by_channel: BTreeMap<&str, Vec<&XpApplied>> = BTreeMap::new();
        let mut roles_granted = 0;
        for row in applied.iter().filter(|row| row.levelled_up()) {
            roles_granted += self.grant_level_roles(row).await;
            if let Some(channel) = row.channel_id.as_deref() {
                by_channel.entry(channel).or_default().push(row);
            }
        }

        let announced: usize = by_channel.values().map(Vec::len).sum();
        for (channel, rows) in by_channel {
            notify::dispatch(self.notifier.as_ref(), channel, level_up_notice(&rows)).await;
        }

        debug!(
            records = deltas.len(),
            applied = applied.len(),
            level_ups = announced,
            roles_granted = roles_granted,
            "Processed XP batch"
        );
    }
}

pub fn level_up_notice(rows: &[&XpApplied]) -> Notice {
    let mut rows = rows.to_vec();
    rows.sort_by(|a, b| (&a.guild_id, &a.user_id).cmp(&(&b.guild_id, &b.user_id)));

    let mut lines: Vec<String> = rows
        .iter()
        .take(MAX_LEVEL_UP_LINES)
        .map(|row| format!("<@{}> just reached **Level {}**!", row.user_id, row.new_level))
        .collect();
    if rows.len() > MAX_LEVEL_UP_LINES {
        lines.push(format!("+{} more", rows.len() - MAX_LEVEL_UP_LINES));
    }

    Notice::new("Level Up!", Color::GOLD).with_description(lines.join("\n"))
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::Mutex;

    /// Records `(guild, user, role)` grants; roles listed in `refuse` fail.
    #[derive(Default)]
    pub struct RecordingRoleGrants {
        pub granted: Mutex<Vec<(String, String, String)>>,
        pub refuse: Vec<String>,
    }

    impl RecordingRoleGrants {
        pub fn granted(&self) -> Vec<(String, String, String)> {
            self.granted.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl RoleGrants for RecordingRoleGrants {
        async fn grant_role(
            &self,
            guild_id: &str,
            user_id: &str,
            role_id: &str,
        ) -> Result<(), RoleGrantError> {
            if self.refuse.iter().any(|r| r == role_id) {
                return Err(RoleGrantError::Forbidden(role_id.to_string()));
            }
            self.granted
                .lock()
                .unwrap()
                .push((guild_id.to_string(), user_id.to_string(), role_id.to_string()));
            Ok(())
        }
    }
}
