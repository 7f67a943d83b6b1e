//! Message snapshots for later delete/edit logging, plus the retention sweep.

use super::batcher::{BatchRecord, BatchSink, EventBatcher};
use crate::clock::Clock;
use crate::store::{CachedMessage, MessageCacheStore};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, instrument};

pub type MessageCacheBatcher = EventBatcher<String, CachedMessage>;

impl BatchRecord for CachedMessage {
    fn merge(&mut self, newer: Self) {
        *self = newer;
    }
}

impl EventBatcher<String, CachedMessage> {
    pub fn add_message(&self, message: CachedMessage) {
        self.add(message.message_id.clone(), message);
    }
}

pub struct MessageCacheSink {
    store: Arc<dyn MessageCacheStore>,
}

impl MessageCacheSink {
    pub fn new(store: Arc<dyn MessageCacheStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl BatchSink<String, CachedMessage> for MessageCacheSink {
    async fn write_batch(&self, batch: HashMap<String, CachedMessage>) {
        let messages: Vec<CachedMessage> = batch.into_values().collect();

        match self.store.cache_messages(&messages).await {
            Ok(written) => debug!(messages = written, "Cached message batch"),
            Err(e) => error!(messages = messages.len(), error = %e, "Dropping message cache batch"),
        }
    }
}

/// Delete cached messages older than `retention`. Returns the number
/// removed, or `None` if the store refused.
#[instrument(skip(store, clock))]
pub async fn sweep_expired_messages(
    store: &dyn MessageCacheStore,
    clock: &dyn Clock,
    retention: Duration,
) -> Option<u64> {
    let retention = chrono::Duration::from_std(retention).unwrap_or_else(|_| chrono::Duration::days(7));
    let cutoff = clock.now() - retention;

    match store.purge_messages_before(cutoff).await {
        Ok(removed) => {
            if removed > 0 {
                info!(removed = removed, cutoff = %cutoff, "Purged expired cached messages");
            }
            Some(removed)
        }
        Err(e) => {
            error!(error = %e, "Failed to purge cached messages");
            None
        }
    }
}
