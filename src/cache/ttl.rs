use crate::clock::Clock;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::debug;

#[derive(Debug, Clone)]
struct CacheEntry<V> {
    value: V,
    inserted_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
}

impl<V> CacheEntry<V> {
    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// Snapshot of how often a key has been invalidated. A read-through fill
/// taken before a write must not land after that write's invalidation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Generation {
    cleared: u64,
    key: u64,
}

struct Generations<K> {
    cleared: u64,
    per_key: HashMap<K, u64>,
}

/// Keyed cache whose entries read as absent once `ttl` has passed since the
/// last `set`, whether or not they have been evicted yet.
pub struct TtlCache<K, V> {
    entries: RwLock<HashMap<K, CacheEntry<V>>>,
    // only touched while `entries` is held for writing, or for a plain read
    generations: Mutex<Generations<K>>,
    ttl: chrono::Duration,
    max_entries: Option<usize>,
    clock: Arc<dyn Clock>,
}

impl<K, V> TtlCache<K, V>
where
    K: Eq + Hash + Clone + std::fmt::Debug,
    V: Clone,
{
    pub fn new(ttl: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            generations: Mutex::new(Generations {
                cleared: 0,
                per_key: HashMap::new(),
            }),
            ttl: chrono::Duration::from_std(ttl)
                .unwrap_or_else(|_| chrono::Duration::days(365)),
            max_entries: None,
            clock,
        }
    }

    /// Bound the number of live entries. When full, expired entries go first,
    /// then the oldest insertion.
    pub fn with_max_entries(mut self, max_entries: usize) -> Self {
        self.max_entries = Some(max_entries.max(1));
        self
    }

    pub async fn get(&self, key: &K) -> Option<V> {
        let now = self.clock.now();
        let entries = self.entries.read().await;

        match entries.get(key) {
            Some(entry) if !entry.is_expired(now) => {
                debug!(key = ?key, "Cache hit");
                Some(entry.value.clone())
            }
            _ => {
                debug!(key = ?key, "Cache miss");
                None
            }
        }
    }

    pub async fn set(&self, key: K, value: V) {
        let mut entries = self.entries.write().await;
        self.insert(&mut entries, key, value);
    }

    /// Current generation of `key`. Take it before reading the backing
    /// store, then fill with [`set_if_unchanged`](Self::set_if_unchanged).
    pub fn generation(&self, key: &K) -> Generation {
        let generations = self.generations();
        Generation {
            cleared: generations.cleared,
            key: generations.per_key.get(key).copied().unwrap_or(0),
        }
    }

    /// `set`, unless `key` was invalidated or the cache cleared since
    /// `seen` was taken. Returns whether the value was stored.
    pub async fn set_if_unchanged(&self, key: K, value: V, seen: Generation) -> bool {
        let mut entries = self.entries.write().await;
        if self.generation(&key) != seen {
            debug!(key = ?key, "Invalidated during fill, not caching");
            return false;
        }
        self.insert(&mut entries, key, value);
        true
    }

    fn insert(&self, entries: &mut HashMap<K, CacheEntry<V>>, key: K, value: V) {
        let now = self.clock.now();

        if let Some(max) = self.max_entries {
            if entries.len() >= max && !entries.contains_key(&key) {
                entries.retain(|_, entry| !entry.is_expired(now));

                if entries.len() >= max {
                    if let Some(oldest) = entries
                        .iter()
                        .min_by_key(|(_, entry)| entry.inserted_at)
                        .map(|(k, _)| k.clone())
                    {
                        entries.remove(&oldest);
                    }
                }
            }
        }

        entries.insert(
            key,
            CacheEntry {
                value,
                inserted_at: now,
                expires_at: now + self.ttl,
            },
        );
    }

    pub async fn invalidate(&self, key: &K) {
        let mut entries = self.entries.write().await;
        entries.remove(key);
        *self.generations().per_key.entry(key.clone()).or_insert(0) += 1;
    }

    pub async fn clear(&self) {
        let mut entries = self.entries.write().await;
        entries.clear();
        let mut generations = self.generations();
        generations.cleared += 1;
        generations.per_key.clear();
        debug!("Cache cleared");
    }

    fn generations(&self) -> MutexGuard<'_, Generations<K>> {
        self.generations.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Physically drop expired entries; returns how many were removed.
    pub async fn purge_expired(&self) -> usize {
        let now = self.clock.now();
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|_, entry| !entry.is_expired(now));
        before - entries.len()
    }

    /// Stored entries, expired ones included until purged.
    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}
