//! In-memory [`Storage`](super::Storage) implementation.
//!
//! Batch writes are staged as [`TxOperation`]s on a transaction and only
//! applied to the tables on commit, so a failed batch leaves nothing behind.
//! Faults can be injected per operation family, which is how the tests
//! exercise the at-most-once and retry paths.

use super::*;
use crate::batch::xp::level_for_xp;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::Mutex as AsyncMutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Fault {
    ConfigReads,
    XpBatch,
    MessageBatch,
    VoiceSessions,
    ScheduleWrites,
}

#[derive(Debug, Clone)]
enum TxOperation {
    PutLevel {
        guild_id: String,
        user_id: String,
        row: LevelRow,
    },
    PutMessage(CachedMessage),
}

#[derive(Debug)]
struct Transaction {
    operations: Vec<TxOperation>,
}

struct TransactionManager {
    active_txs: HashMap<u64, Transaction>,
    next_tx_id: u64,
}

impl TransactionManager {
    fn new() -> Self {
        Self {
            active_txs: HashMap::new(),
            next_tx_id: 1,
        }
    }

    fn begin_transaction(&mut self) -> u64 {
        let tx_id = self.next_tx_id;
        self.next_tx_id += 1;

        self.active_txs.insert(
            tx_id,
            Transaction {
                operations: Vec::new(),
            },
        );
        tx_id
    }

    fn add_operation(&mut self, tx_id: u64, op: TxOperation) -> StoreResult<()> {
        let tx = self
            .active_txs
            .get_mut(&tx_id)
            .ok_or_else(|| StoreError::Transaction("Transaction not found".to_string()))?;

        tx.operations.push(op);
        Ok(())
    }

    /// Removes the transaction, so a later `add_operation` on the same id
    /// fails as not found.
    fn commit_transaction(&mut self, tx_id: u64) -> StoreResult<Vec<TxOperation>> {
        let tx = self
            .active_txs
            .remove(&tx_id)
            .ok_or_else(|| StoreError::Transaction("Transaction not found".to_string()))?;

        Ok(tx.operations)
    }

    fn rollback(&mut self, tx_id: u64) -> StoreResult<()> {
        self.active_txs
            .remove(&tx_id)
            .ok_or_else(|| StoreError::Transaction("Transaction not found".to_string()))?;
        Ok(())
    }

    fn active_transaction_count(&self) -> usize {
        self.active_txs.len()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct LevelRow {
    xp: i64,
    level: i64,
    enabled: bool,
}

impl Default for LevelRow {
    fn default() -> Self {
        Self {
            xp: 0,
            level: 0,
            enabled: true,
        }
    }
}

type UserKey = (String, String);

#[derive(Default)]
struct Tables {
    logging: HashMap<String, LoggingConfig>,
    voice_xp: HashMap<String, VoiceXpConfig>,
    levels: HashMap<UserKey, LevelRow>,
    // guild -> role -> level
    ranks: HashMap<String, BTreeMap<String, i64>>,
    messages: HashMap<String, CachedMessage>,
    voice_sessions: HashMap<UserKey, PersistedVoiceSession>,
    resources: BTreeMap<ResourceKey, ScheduledResource>,
}

impl Tables {
    fn apply(&mut self, operations: Vec<TxOperation>) {
        for op in operations {
            match op {
                TxOperation::PutLevel {
                    guild_id,
                    user_id,
                    row,
                } => {
                    self.levels.insert((guild_id, user_id), row);
                }
                TxOperation::PutMessage(message) => {
                    self.messages.insert(message.message_id.clone(), message);
                }
            }
        }
    }
}

pub struct MemoryStore {
    tables: AsyncMutex<Tables>,
    tx_manager: Mutex<TransactionManager>,
    faults: Mutex<HashSet<Fault>>,
    next_slot: AtomicU64,
    config_reads: AtomicUsize,
    xp_batches: AtomicUsize,
    message_batches: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            tables: AsyncMutex::new(Tables::default()),
            tx_manager: Mutex::new(TransactionManager::new()),
            faults: Mutex::new(HashSet::new()),
            next_slot: AtomicU64::new(1),
            config_reads: AtomicUsize::new(0),
            xp_batches: AtomicUsize::new(0),
            message_batches: AtomicUsize::new(0),
        }
    }

    /// Make every following call in `fault`'s family fail until [`heal`](Self::heal).
    pub fn inject(&self, fault: Fault) {
        self.faults().insert(fault);
    }

    pub fn heal(&self, fault: Fault) {
        self.faults().remove(&fault);
    }

    pub fn config_reads(&self) -> usize {
        self.config_reads.load(Ordering::SeqCst)
    }

    pub fn committed_xp_batches(&self) -> usize {
        self.xp_batches.load(Ordering::SeqCst)
    }

    pub fn committed_message_batches(&self) -> usize {
        self.message_batches.load(Ordering::SeqCst)
    }

    pub fn open_transactions(&self) -> usize {
        self.tx().active_transaction_count()
    }

    /// `(total_xp, level)` for a user, if any XP was ever written.
    pub async fn xp_of(&self, guild_id: &str, user_id: &str) -> Option<(i64, i64)> {
        let tables = self.tables.lock().await;
        tables
            .levels
            .get(&(guild_id.to_string(), user_id.to_string()))
            .map(|row| (row.xp, row.level))
    }

    pub async fn set_leveling_enabled(&self, guild_id: &str, user_id: &str, enabled: bool) {
        let mut tables = self.tables.lock().await;
        tables
            .levels
            .entry((guild_id.to_string(), user_id.to_string()))
            .or_default()
            .enabled = enabled;
    }

    /// Reward `role_id` at `level`. One level per role, as with the
    /// `(guild, role)` key of a ranks table.
    pub async fn set_level_role(&self, guild_id: &str, role_id: &str, level: i64) {
        let mut tables = self.tables.lock().await;
        tables
            .ranks
            .entry(guild_id.to_string())
            .or_default()
            .insert(role_id.to_string(), level);
    }

    pub async fn message_count(&self) -> usize {
        self.tables.lock().await.messages.len()
    }

    pub async fn voice_session_rows(&self) -> Vec<PersistedVoiceSession> {
        let tables = self.tables.lock().await;
        let mut rows: Vec<_> = tables.voice_sessions.values().cloned().collect();
        rows.sort_by(|a, b| (&a.guild_id, &a.user_id).cmp(&(&b.guild_id, &b.user_id)));
        rows
    }

    fn tx(&self) -> MutexGuard<'_, TransactionManager> {
        self.tx_manager.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn faults(&self) -> MutexGuard<'_, HashSet<Fault>> {
        self.faults.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn check(&self, fault: Fault) -> StoreResult<()> {
        if self.faults().contains(&fault) {
            return Err(StoreError::Unavailable(format!("injected fault: {:?}", fault)));
        }
        Ok(())
    }

    fn resource_mut<'a>(
        tables: &'a mut Tables,
        key: &ResourceKey,
    ) -> StoreResult<&'a mut ScheduledResource> {
        tables
            .resources
            .get_mut(key)
            .ok_or_else(|| StoreError::NotFound(format!("scheduled resource {}", key)))
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ConfigStore for MemoryStore {
    async fn logging_config(&self, guild_id: &str) -> StoreResult<LoggingConfig> {
        self.check(Fault::ConfigReads)?;
        self.config_reads.fetch_add(1, Ordering::SeqCst);
        let tables = self.tables.lock().await;
        Ok(tables
            .logging
            .get(guild_id)
            .cloned()
            .unwrap_or_else(|| LoggingConfig::unconfigured(guild_id)))
    }

    async fn save_logging_config(&self, config: &LoggingConfig) -> StoreResult<()> {
        let mut tables = self.tables.lock().await;
        tables
            .logging
            .insert(config.guild_id.clone(), config.clone());
        Ok(())
    }

    async fn voice_xp_config(&self, guild_id: &str) -> StoreResult<VoiceXpConfig> {
        self.check(Fault::ConfigReads)?;
        self.config_reads.fetch_add(1, Ordering::SeqCst);
        let tables = self.tables.lock().await;
        Ok(tables.voice_xp.get(guild_id).cloned().unwrap_or_default())
    }

    async fn save_voice_xp_config(
        &self,
        guild_id: &str,
        config: &VoiceXpConfig,
    ) -> StoreResult<()> {
        let mut tables = self.tables.lock().await;
        tables.voice_xp.insert(guild_id.to_string(), config.clone());
        Ok(())
    }
}

#[async_trait]
impl XpStore for MemoryStore {
    async fn apply_xp_batch(&self, deltas: &[XpDelta]) -> StoreResult<Vec<XpApplied>> {
        let mut tables = self.tables.lock().await;
        let tx_id = self.tx().begin_transaction();

        // rows already staged in this transaction win over committed ones
        let mut staged: HashMap<UserKey, LevelRow> = HashMap::new();
        let mut applied = Vec::with_capacity(deltas.len());

        for delta in deltas {
            let key = (delta.guild_id.clone(), delta.user_id.clone());
            let row = staged
                .get(&key)
                .or_else(|| tables.levels.get(&key))
                .copied()
                .unwrap_or_default();

            if !row.enabled {
                continue;
            }

            let total_xp = row.xp + delta.xp;
            let updated = LevelRow {
                xp: total_xp,
                level: level_for_xp(total_xp),
                enabled: true,
            };

            self.tx().add_operation(
                tx_id,
                TxOperation::PutLevel {
                    guild_id: delta.guild_id.clone(),
                    user_id: delta.user_id.clone(),
                    row: updated,
                },
            )?;
            staged.insert(key, updated);

            applied.push(XpApplied {
                guild_id: delta.guild_id.clone(),
                user_id: delta.user_id.clone(),
                channel_id: delta.channel_id.clone(),
                old_level: row.level,
                new_level: updated.level,
                total_xp,
            });
        }

        if let Err(e) = self.check(Fault::XpBatch) {
            self.tx().rollback(tx_id)?;
            return Err(StoreError::Transaction(e.to_string()));
        }

        let operations = self.tx().commit_transaction(tx_id)?;
        tables.apply(operations);
        self.xp_batches.fetch_add(1, Ordering::SeqCst);

        Ok(applied)
    }

    async fn level_roles(&self, guild_id: &str, level: i64) -> StoreResult<Vec<LevelRole>> {
        self.check(Fault::ConfigReads)?;
        let tables = self.tables.lock().await;
        let mut roles: Vec<LevelRole> = tables
            .ranks
            .get(guild_id)
            .into_iter()
            .flatten()
            .filter(|(_, at)| **at <= level)
            .map(|(role_id, &at)| LevelRole {
                role_id: role_id.clone(),
                level: at,
            })
            .collect();
        roles.sort_by(|a, b| (a.level, &a.role_id).cmp(&(b.level, &b.role_id)));
        Ok(roles)
    }
}

#[async_trait]
impl MessageCacheStore for MemoryStore {
    async fn cache_messages(&self, messages: &[CachedMessage]) -> StoreResult<usize> {
        let mut tables = self.tables.lock().await;
        let tx_id = self.tx().begin_transaction();

        for message in messages {
            self.tx()
                .add_operation(tx_id, TxOperation::PutMessage(message.clone()))?;
        }

        if let Err(e) = self.check(Fault::MessageBatch) {
            self.tx().rollback(tx_id)?;
            return Err(StoreError::Transaction(e.to_string()));
        }

        let operations = self.tx().commit_transaction(tx_id)?;
        let written = operations.len();
        tables.apply(operations);
        self.message_batches.fetch_add(1, Ordering::SeqCst);

        Ok(written)
    }

    async fn cached_message(&self, message_id: &str) -> StoreResult<Option<CachedMessage>> {
        let tables = self.tables.lock().await;
        Ok(tables.messages.get(message_id).cloned())
    }

    async fn purge_messages_before(&self, cutoff: DateTime<Utc>) -> StoreResult<u64> {
        self.check(Fault::MessageBatch)?;
        let mut tables = self.tables.lock().await;
        let before = tables.messages.len();
        tables.messages.retain(|_, m| m.created_at >= cutoff);
        Ok((before - tables.messages.len()) as u64)
    }
}

#[async_trait]
impl VoiceSessionStore for MemoryStore {
    async fn load_voice_sessions(&self) -> StoreResult<Vec<PersistedVoiceSession>> {
        self.check(Fault::VoiceSessions)?;
        let tables = self.tables.lock().await;
        Ok(tables.voice_sessions.values().cloned().collect())
    }

    async fn save_voice_session(&self, session: &PersistedVoiceSession) -> StoreResult<()> {
        self.check(Fault::VoiceSessions)?;
        let mut tables = self.tables.lock().await;
        tables.voice_sessions.insert(
            (session.guild_id.clone(), session.user_id.clone()),
            session.clone(),
        );
        Ok(())
    }

    async fn remove_voice_session(&self, guild_id: &str, user_id: &str) -> StoreResult<()> {
        self.check(Fault::VoiceSessions)?;
        let mut tables = self.tables.lock().await;
        tables
            .voice_sessions
            .remove(&(guild_id.to_string(), user_id.to_string()));
        Ok(())
    }
}

#[async_trait]
impl ScheduleStore for MemoryStore {
    async fn upsert_resource(&self, resource: NewResource) -> StoreResult<ScheduledResource> {
        let mut tables = self.tables.lock().await;

        let existing = tables
            .resources
            .values()
            .find(|r| r.key.guild_id == resource.guild_id && r.channel_id == resource.channel_id)
            .map(|r| r.key.clone());
        let key = existing.unwrap_or_else(|| {
            ResourceKey::new(
                resource.guild_id.clone(),
                self.next_slot.fetch_add(1, Ordering::SeqCst),
            )
        });

        let previous = tables.resources.get(&key);
        let stored = ScheduledResource {
            key: key.clone(),
            channel_id: resource.channel_id,
            interval_hours: resource.interval_hours,
            warning_minutes: resource.warning_minutes,
            next_run: resource.next_run,
            last_run: previous.and_then(|r| r.last_run),
            enabled: true,
            warned: false,
            custom_message: previous.and_then(|r| r.custom_message.clone()),
            custom_image: previous.and_then(|r| r.custom_image.clone()),
        };
        tables.resources.insert(key, stored.clone());
        Ok(stored)
    }

    async fn resource(&self, key: &ResourceKey) -> StoreResult<Option<ScheduledResource>> {
        Ok(self.tables.lock().await.resources.get(key).cloned())
    }

    async fn find_resource(
        &self,
        guild_id: &str,
        channel_id: &str,
    ) -> StoreResult<Option<ScheduledResource>> {
        let tables = self.tables.lock().await;
        Ok(tables
            .resources
            .values()
            .find(|r| r.key.guild_id == guild_id && r.channel_id == channel_id)
            .cloned())
    }

    async fn list_resources(&self, guild_id: &str) -> StoreResult<Vec<ScheduledResource>> {
        let tables = self.tables.lock().await;
        Ok(tables
            .resources
            .values()
            .filter(|r| r.key.guild_id == guild_id)
            .cloned()
            .collect())
    }

    async fn remove_resource(&self, key: &ResourceKey) -> StoreResult<bool> {
        Ok(self.tables.lock().await.resources.remove(key).is_some())
    }

    async fn set_enabled(&self, key: &ResourceKey, enabled: bool) -> StoreResult<bool> {
        let mut tables = self.tables.lock().await;
        Ok(match tables.resources.get_mut(key) {
            Some(resource) => {
                resource.enabled = enabled;
                true
            }
            None => false,
        })
    }

    async fn set_custom_message(
        &self,
        key: &ResourceKey,
        message: Option<String>,
    ) -> StoreResult<bool> {
        let mut tables = self.tables.lock().await;
        Ok(match tables.resources.get_mut(key) {
            Some(resource) => {
                resource.custom_message = message;
                true
            }
            None => false,
        })
    }

    async fn set_custom_image(
        &self,
        key: &ResourceKey,
        image: Option<String>,
    ) -> StoreResult<bool> {
        let mut tables = self.tables.lock().await;
        Ok(match tables.resources.get_mut(key) {
            Some(resource) => {
                resource.custom_image = image;
                true
            }
            None => false,
        })
    }

    async fn due_resources(&self, now: DateTime<Utc>) -> StoreResult<Vec<ScheduledResource>> {
        let tables = self.tables.lock().await;
        Ok(tables
            .resources
            .values()
            .filter(|r| r.is_due(now))
            .cloned()
            .collect())
    }

    async fn resources_needing_warning(
        &self,
        now: DateTime<Utc>,
    ) -> StoreResult<Vec<ScheduledResource>> {
        let tables = self.tables.lock().await;
        Ok(tables
            .resources
            .values()
            .filter(|r| r.needs_warning(now))
            .cloned()
            .collect())
    }

    async fn complete_run(
        &self,
        key: &ResourceKey,
        expected_channel: &str,
        completion: &RunCompletion,
    ) -> StoreResult<()> {
        self.check(Fault::ScheduleWrites)?;
        let mut tables = self.tables.lock().await;
        let resource = Self::resource_mut(&mut tables, key)?;

        if resource.channel_id != expected_channel {
            return Err(StoreError::Conflict(format!(
                "resource {} now points at {}, expected {}",
                key, resource.channel_id, expected_channel
            )));
        }

        resource.channel_id = completion.new_channel_id.clone();
        resource.next_run = completion.next_run;
        resource.last_run = Some(completion.last_run);
        resource.warned = false;
        Ok(())
    }

    async fn reschedule(&self, key: &ResourceKey, next_run: DateTime<Utc>) -> StoreResult<()> {
        self.check(Fault::ScheduleWrites)?;
        let mut tables = self.tables.lock().await;
        Self::resource_mut(&mut tables, key)?.next_run = next_run;
        Ok(())
    }

    async fn mark_warned(&self, key: &ResourceKey) -> StoreResult<()> {
        self.check(Fault::ScheduleWrites)?;
        let mut tables = self.tables.lock().await;
        Self::resource_mut(&mut tables, key)?.warned = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(id: &str) -> CachedMessage {
        CachedMessage {
            message_id: id.into(),
            guild_id: "g".into(),
            channel_id: "c".into(),
            author_id: "a".into(),
            content: "hi".into(),
            created_at: Utc::now(),
        }
    }

    fn delta(guild: &str, user: &str, xp: i64) -> XpDelta {
        XpDelta {
            guild_id: guild.into(),
            user_id: user.into(),
            channel_id: None,
            xp,
        }
    }

    #[tokio::test]
    async fn failed_xp_batch_leaves_nothing_behind() {
        let store = MemoryStore::new();
        store.inject(Fault::XpBatch);

        let result = store
            .apply_xp_batch(&[delta("g", "a", 100), delta("g", "b", 50)])
            .await;
        assert!(matches!(result, Err(StoreError::Transaction(_))));
        assert_eq!(store.xp_of("g", "a").await, None);
        assert_eq!(store.open_transactions(), 0);

        store.heal(Fault::XpBatch);
        let applied = store.apply_xp_batch(&[delta("g", "a", 100)]).await.unwrap();
        assert_eq!(applied.len(), 1);
        assert_eq!(store.xp_of("g", "a").await, Some((100, level_for_xp(100))));
    }

    #[test]
    fn committed_transaction_takes_no_more_operations() {
        let mut manager = TransactionManager::new();
        let tx_id = manager.begin_transaction();
        manager
            .add_operation(tx_id, TxOperation::PutMessage(message("m1")))
            .unwrap();

        let operations = manager.commit_transaction(tx_id).unwrap();
        assert_eq!(operations.len(), 1);
        assert_eq!(manager.active_transaction_count(), 0);

        let late = manager.add_operation(tx_id, TxOperation::PutMessage(message("m2")));
        assert!(matches!(late, Err(StoreError::Transaction(_))));
        assert!(manager.commit_transaction(tx_id).is_err());
        assert!(manager.rollback(tx_id).is_err());
    }

    #[tokio::test]
    async fn level_roles_are_filtered_by_level() {
        let store = MemoryStore::new();
        store.set_level_role("g", "bronze", 1).await;
        store.set_level_role("g", "silver", 5).await;
        store.set_level_role("g", "gold", 10).await;
        store.set_level_role("other", "elsewhere", 1).await;

        let roles = store.level_roles("g", 5).await.unwrap();
        let ids: Vec<&str> = roles.iter().map(|r| r.role_id.as_str()).collect();
        assert_eq!(ids, vec!["bronze", "silver"]);
        assert!(store.level_roles("g", 0).await.unwrap().is_empty());
        assert!(store.level_roles("none", 99).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn disabled_users_are_skipped() {
        let store = MemoryStore::new();
        store.set_leveling_enabled("g", "muted", false).await;

        let applied = store
            .apply_xp_batch(&[delta("g", "muted", 500), delta("g", "a", 25)])
            .await
            .unwrap();

        assert_eq!(applied.len(), 1);
        assert_eq!(applied[0].user_id, "a");
        assert_eq!(store.xp_of("g", "muted").await, Some((0, 0)));
    }

    #[tokio::test]
    async fn unconfigured_guilds_get_documented_defaults() {
        let store = MemoryStore::new();
        let logging = store.logging_config("g").await.unwrap();
        assert_eq!(logging, LoggingConfig::unconfigured("g"));
        assert!(logging.active_channel().is_none());

        let voice = store.voice_xp_config("g").await.unwrap();
        assert_eq!(voice, VoiceXpConfig::default());
        assert!(!voice.enabled);
    }

    #[tokio::test]
    async fn complete_run_is_a_compare_and_set_on_the_channel() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let resource = store
            .upsert_resource(NewResource {
                guild_id: "g".into(),
                channel_id: "old".into(),
                interval_hours: 24,
                warning_minutes: 15,
                next_run: now,
            })
            .await
            .unwrap();

        let completion = RunCompletion {
            new_channel_id: "new".into(),
            next_run: now + chrono::Duration::hours(24),
            last_run: now,
        };
        store
            .complete_run(&resource.key, "old", &completion)
            .await
            .unwrap();

        let again = store.complete_run(&resource.key, "old", &completion).await;
        assert!(matches!(again, Err(StoreError::Conflict(_))));

        let stored = store.resource(&resource.key).await.unwrap().unwrap();
        assert_eq!(stored.channel_id, "new");
        assert_eq!(stored.last_run, Some(now));
    }
}
