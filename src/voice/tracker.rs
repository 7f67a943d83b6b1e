use crate::batch::XpBatcher;
use crate::cache::GuildConfigs;
use crate::clock::Clock;
use crate::store::{PersistedVoiceSession, VoiceSessionStore};
use crate::task::{self, FirstRun, Shutdown};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

/// Live view of who is sitting in voice, as reported by the platform.
#[async_trait]
pub trait VoicePresence: Send + Sync {
    async fn is_present(&self, guild_id: &str, user_id: &str, channel_id: &str) -> bool;
    async fn afk_channel(&self, guild_id: &str) -> Option<String>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VoiceSession {
    pub guild_id: String,
    pub user_id: String,
    pub channel_id: String,
    pub joined_at: DateTime<Utc>,
    pub last_accrual_at: DateTime<Utc>,
}

impl VoiceSession {
    fn started(guild_id: &str, user_id: &str, channel_id: &str, now: DateTime<Utc>) -> Self {
        Self {
            guild_id: guild_id.to_string(),
            user_id: user_id.to_string(),
            channel_id: channel_id.to_string(),
            joined_at: now,
            last_accrual_at: now,
        }
    }

    fn persisted(&self) -> PersistedVoiceSession {
        PersistedVoiceSession {
            guild_id: self.guild_id.clone(),
            user_id: self.user_id.clone(),
            channel_id: self.channel_id.clone(),
            joined_at: self.joined_at,
        }
    }
}

/// guild_id -> user_id -> session
type SessionMap = HashMap<String, HashMap<String, VoiceSession>>;

/// (guild_id, user_id) -> ticket of the join waiting on its guild config
type JoinTickets = HashMap<(String, String), u64>;

/// Tracks voice sessions for XP accrual and rebuilds them after a restart.
///
/// The persisted rows are only a recovery hint: joins and leaves write
/// through, moves do not, and shutdown rewrites every live session.
pub struct VoiceXpTracker {
    sessions: RwLock<SessionMap>,
    // locked only while `sessions` is held for writing
    joining: Mutex<JoinTickets>,
    next_ticket: AtomicU64,
    store: Arc<dyn VoiceSessionStore>,
    configs: Arc<GuildConfigs>,
    presence: Arc<dyn VoicePresence>,
    xp: Arc<XpBatcher>,
    clock: Arc<dyn Clock>,
    accrual_interval: Duration,
    shutdown: Shutdown,
    ticker: Mutex<Option<JoinHandle<()>>>,
}

impl VoiceXpTracker {
    pub fn new(
        store: Arc<dyn VoiceSessionStore>,
        configs: Arc<GuildConfigs>,
        presence: Arc<dyn VoicePresence>,
        xp: Arc<XpBatcher>,
        clock: Arc<dyn Clock>,
        accrual_interval: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            sessions: RwLock::new(HashMap::new()),
            joining: Mutex::new(HashMap::new()),
            next_ticket: AtomicU64::new(1),
            store,
            configs,
            presence,
            xp,
            clock,
            accrual_interval,
            shutdown: Shutdown::new(),
            ticker: Mutex::new(None),
        })
    }

    fn read(&self) -> RwLockReadGuard<'_, SessionMap> {
        self.sessions.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, SessionMap> {
        self.sessions.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn joining(&self) -> MutexGuard<'_, JoinTickets> {
        self.joining.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Recover persisted sessions, then start the accrual loop.
    pub async fn start(self: &Arc<Self>) -> usize {
        let recovered = self.recover().await;

        let mut ticker = self.ticker.lock().unwrap_or_else(PoisonError::into_inner);
        if ticker.is_none() && !self.shutdown.is_triggered() {
            let tracker = Arc::clone(self);
            *ticker = Some(task::spawn_periodic(
                "voice-accrual",
                self.accrual_interval,
                FirstRun::AfterPeriod,
                self.shutdown.listener(),
                move || {
                    let tracker = Arc::clone(&tracker);
                    async move {
                        tracker.accrue().await;
                    }
                },
            ));
        }

        info!(recovered = recovered, "Voice XP tracker started");
        recovered
    }

    /// Rebuild sessions from storage for users the platform still sees in
    /// the same channel; drop the rest. Timers restart at now.
    #[instrument(skip(self))]
    pub async fn recover(&self) -> usize {
        let persisted = match self.store.load_voice_sessions().await {
            Ok(rows) => rows,
            Err(e) => {
                error!(error = %e, "Failed to load voice sessions");
                return 0;
            }
        };

        let mut recovered = 0;
        for row in persisted {
            let present = self
                .presence
                .is_present(&row.guild_id, &row.user_id, &row.channel_id)
                .await;

            if !present {
                debug!(guild_id = %row.guild_id, user_id = %row.user_id, "Stale voice session, removing");
                if let Err(e) = self
                    .store
                    .remove_voice_session(&row.guild_id, &row.user_id)
                    .await
                {
                    warn!(guild_id = %row.guild_id, user_id = %row.user_id, error = %e, "Failed to remove stale voice session");
                }
                continue;
            }

            let session =
                VoiceSession::started(&row.guild_id, &row.user_id, &row.channel_id, self.clock.now());
            self.write()
                .entry(row.guild_id)
                .or_default()
                .insert(row.user_id, session);
            recovered += 1;
        }

        if recovered > 0 {
            info!(recovered = recovered, "Recovered voice sessions");
        }
        recovered
    }

    /// Apply a voice state change. `None` means the user left voice.
    ///
    /// A join waits on the guild's config before it creates a session. Any
    /// later transition for the same user revokes that join's ticket, so a
    /// leave arriving meanwhile is never followed by a session.
    pub async fn handle_transition(&self, guild_id: &str, user_id: &str, new_channel: Option<&str>) {
        let Some(channel_id) = new_channel else {
            self.handle_leave(guild_id, user_id).await;
            return;
        };

        let key = (guild_id.to_string(), user_id.to_string());
        let ticket = {
            let mut sessions = self.write();
            if let Some(session) = sessions
                .get_mut(guild_id)
                .and_then(|guild| guild.get_mut(user_id))
            {
                if session.channel_id != channel_id {
                    debug!(guild_id = guild_id, user_id = user_id, channel_id = channel_id, "Voice session moved");
                    session.channel_id = channel_id.to_string();
                }
                return;
            }

            let ticket = self.next_ticket.fetch_add(1, Ordering::Relaxed);
            self.joining().insert(key.clone(), ticket);
            ticket
        };

        let enabled = match self.configs.voice_xp_config(guild_id).await {
            Ok(config) => config.enabled,
            Err(e) => {
                warn!(guild_id = guild_id, error = %e, "Voice XP config unavailable, not tracking join");
                false
            }
        };

        let session = VoiceSession::started(guild_id, user_id, channel_id, self.clock.now());
        let persisted = session.persisted();
        {
            let mut sessions = self.write();
            let mut joining = self.joining();
            if joining.get(&key) != Some(&ticket) {
                debug!(guild_id = guild_id, user_id = user_id, "Join superseded while loading config");
                return;
            }
            joining.remove(&key);
            if !enabled {
                return;
            }

            let guild = sessions.entry(guild_id.to_string()).or_default();
            if guild.contains_key(user_id) {
                return;
            }
            guild.insert(user_id.to_string(), session);
        }

        debug!(guild_id = guild_id, user_id = user_id, channel_id = channel_id, "Voice session started");
        if let Err(e) = self.store.save_voice_session(&persisted).await {
            warn!(guild_id = guild_id, user_id = user_id, error = %e, "Failed to persist voice session");
        }
    }

    async fn handle_leave(&self, guild_id: &str, user_id: &str) {
        let removed = {
            let mut sessions = self.write();
            self.joining()
                .remove(&(guild_id.to_string(), user_id.to_string()));
            let removed = sessions.get_mut(guild_id).and_then(|g| g.remove(user_id));
            if sessions.get(guild_id).is_some_and(HashMap::is_empty) {
                sessions.remove(guild_id);
            }
            removed
        };

        if removed.is_some() {
            debug!(guild_id = guild_id, user_id = user_id, "Voice session ended");
            if let Err(e) = self.store.remove_voice_session(guild_id, user_id).await {
                warn!(guild_id = guild_id, user_id = user_id, error = %e, "Failed to remove voice session");
            }
        }
    }

    /// One accrual pass. Returns how many grants were queued.
    pub async fn accrue(&self) -> usize {
        let now = self.clock.now();
        let guilds: Vec<String> = self.read().keys().cloned().collect();
        let mut grants: Vec<(String, String, i64)> = Vec::new();

        for guild_id in guilds {
            let config = match self.configs.voice_xp_config(&guild_id).await {
                Ok(config) if config.enabled => config,
                Ok(_) => continue,
                Err(e) => {
                    warn!(guild_id = %guild_id, error = %e, "Skipping voice accrual");
                    continue;
                }
            };

            let afk_channel = if config.ignore_afk {
                self.presence.afk_channel(&guild_id).await
            } else {
                None
            };
            let interval = chrono::Duration::seconds(config.interval_seconds as i64);

            let mut sessions = self.write();
            let Some(guild_sessions) = sessions.get_mut(&guild_id) else {
                continue;
            };
            for session in guild_sessions.values_mut() {
                if now - session.last_accrual_at < interval {
                    continue;
                }
                if afk_channel.as_deref() != Some(session.channel_id.as_str()) {
                    grants.push((guild_id.clone(), session.user_id.clone(), config.xp_rate));
                }
                session.last_accrual_at = now;
            }
        }

        for (guild_id, user_id, xp) in &grants {
            self.xp.add_xp(guild_id, user_id, None, *xp);
        }

        if !grants.is_empty() {
            debug!(grants = grants.len(), "Queued voice XP");
        }
        grants.len()
    }

    /// Stop accrual, then persist every live session for the next recovery.
    pub async fn stop(&self) -> usize {
        self.shutdown.trigger();
        let ticker = self
            .ticker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = ticker {
            if let Err(e) = handle.await {
                warn!(error = %e, "Voice accrual loop ended abnormally");
            }
        }

        let snapshot: Vec<PersistedVoiceSession> = self
            .read()
            .values()
            .flat_map(|guild| guild.values().map(VoiceSession::persisted))
            .collect();

        let mut saved = 0;
        for session in &snapshot {
            match self.store.save_voice_session(session).await {
                Ok(()) => saved += 1,
                Err(e) => warn!(guild_id = %session.guild_id, user_id = %session.user_id, error = %e, "Failed to persist voice session"),
            }
        }

        info!(sessions = saved, "Voice XP tracker stopped");
        saved
    }

    /// Live sessions, across all guilds when `guild_id` is `None`.
    pub fn active_sessions(&self, guild_id: Option<&str>) -> usize {
        let sessions = self.read();
        match guild_id {
            Some(guild_id) => sessions.get(guild_id).map_or(0, HashMap::len),
            None => sessions.values().map(HashMap::len).sum(),
        }
    }

    pub fn sessions_for_guild(&self, guild_id: &str) -> Vec<VoiceSession> {
        let mut sessions: Vec<VoiceSession> = self
            .read()
            .get(guild_id)
            .map(|guild| guild.values().cloned().collect())
            .unwrap_or_default();
        sessions.sort_by(|a, b| a.user_id.cmp(&b.user_id));
        sessions
    }
}
