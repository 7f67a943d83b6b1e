use crate::store::ResourceKey;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use uuid::Uuid;

type RunningMap = HashMap<ResourceKey, Uuid>;

fn lock(map: &Mutex<RunningMap>) -> MutexGuard<'_, RunningMap> {
    map.lock().unwrap_or_else(PoisonError::into_inner)
}

/// At most one run per resource slot. The entry is removed when the
/// [`DedupGuard`] drops, which also happens while unwinding.
#[derive(Debug, Clone, Default)]
pub struct DedupLocks {
    running: Arc<Mutex<RunningMap>>,
}

impl DedupLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// `None` if a run for `key` is already in progress.
    pub fn try_acquire(&self, key: &ResourceKey) -> Option<DedupGuard> {
        let mut running = lock(&self.running);
        if running.contains_key(key) {
            return None;
        }

        let run_id = Uuid::new_v4();
        running.insert(key.clone(), run_id);
        Some(DedupGuard {
            running: Arc::clone(&self.running),
            key: key.clone(),
            run_id,
        })
    }

    pub fn is_running(&self, key: &ResourceKey) -> bool {
        lock(&self.running).contains_key(key)
    }

    pub fn running(&self) -> usize {
        lock(&self.running).len()
    }
}

#[derive(Debug)]
pub struct DedupGuard {
    running: Arc<Mutex<RunningMap>>,
    key: ResourceKey,
    run_id: Uuid,
}

impl DedupGuard {
    pub fn key(&self) -> &ResourceKey {
        &self.key
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }
}

impl Drop for DedupGuard {
    fn drop(&mut self) {
        let mut running = lock(&self.running);
        // only clear our own entry
        if running.get(&self.key) == Some(&self.run_id) {
            running.remove(&self.key);
        }
    }
}
