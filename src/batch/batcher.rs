use crate::task::{self, FirstRun, Shutdown};
use async_trait::async_trait;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// A payload that can be folded into an earlier one for the same key.
pub trait BatchRecord: Send + 'static {
    fn merge(&mut self, newer: Self);
}

/// Consumes one flushed batch. Implementations own the storage transaction
/// and any notifications derived from it; errors are theirs to log.
///
/// Calls arrive from a single writer task in flush order.
#[async_trait]
pub trait BatchSink<K, R>: Send + Sync
where
    K: Send + 'static,
    R: Send + 'static,
{
    async fn write_batch(&self, batch: HashMap<K, R>);

    /// Runs after every timed flush, even an empty one. Sinks that hold
    /// records back release the ones now due here.
    async fn tick(&self) {}

    /// Last call before the writer exits on stop. Anything still held must
    /// go out now.
    async fn close(&self) {}
}

enum Job<K, R> {
    Batch(HashMap<K, R>),
    Tick,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatcherConfig {
    pub flush_interval: Duration,
    pub max_batch_size: usize,
}

impl BatcherConfig {
    pub fn new(flush_interval: Duration, max_batch_size: usize) -> Self {
        Self {
            flush_interval,
            max_batch_size,
        }
    }
}

struct Pending<K, R> {
    records: HashMap<K, R>,
    closed: bool,
    writer: Option<Writer<K, R>>,
}

/// The one task that talks to the sink. Batches reach it in the order they
/// were swapped out of `Pending`.
struct Writer<K, R> {
    tx: mpsc::UnboundedSender<Job<K, R>>,
    handle: JoinHandle<()>,
}

/// Keyed accumulator flushed on size, on a timer, and once more on stop.
///
/// `add` only touches the in-memory map. A flush swaps the map out and
/// queues the snapshot for a single writer task, both under the lock, so
/// every record lands in exactly one batch and batches commit in order.
pub struct EventBatcher<K, R> {
    name: &'static str,
    config: BatcherConfig,
    pending: Mutex<Pending<K, R>>,
    sink: Arc<dyn BatchSink<K, R>>,
    shutdown: Shutdown,
    ticker: Mutex<Option<JoinHandle<()>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl<K, R> EventBatcher<K, R>
where
    K: Eq + Hash + Send + Sync + 'static,
    R: BatchRecord,
{
    pub fn new(
        name: &'static str,
        config: BatcherConfig,
        sink: Arc<dyn BatchSink<K, R>>,
    ) -> Arc<Self> {
        let capacity = config.max_batch_size.min(1024);
        Arc::new(Self {
            name,
            config,
            pending: Mutex::new(Pending {
                records: HashMap::with_capacity(capacity),
                closed: false,
                writer: None,
            }),
            sink,
            shutdown: Shutdown::new(),
            ticker: Mutex::new(None),
        })
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Start the flush ticker. Calling it again is a no-op.
    pub fn start(self: &Arc<Self>) {
        let mut ticker = lock(&self.ticker);
        if ticker.is_some() || self.shutdown.is_triggered() {
            return;
        }

        let batcher = Arc::clone(self);
        *ticker = Some(task::spawn_periodic(
            self.name,
            self.config.flush_interval,
            FirstRun::AfterPeriod,
            self.shutdown.listener(),
            move || {
                let batcher = Arc::clone(&batcher);
                async move { batcher.tick() }
            },
        ));

        info!(
            batcher = self.name,
            flush_interval_ms = self.config.flush_interval.as_millis() as u64,
            max_batch_size = self.config.max_batch_size,
            "Batcher started"
        );
    }

    /// Merge `record` into the pending batch. Never waits on I/O; a full
    /// batch is queued for the writer before returning.
    pub fn add(&self, key: K, record: R) {
        let mut pending = lock(&self.pending);
        if pending.closed {
            warn!(batcher = self.name, "Batcher stopped, dropping record");
            return;
        }

        match pending.records.entry(key) {
            Entry::Occupied(mut existing) => existing.get_mut().merge(record),
            Entry::Vacant(slot) => {
                slot.insert(record);
            }
        }

        if pending.records.len() >= self.config.max_batch_size {
            let batch = std::mem::take(&mut pending.records);
            debug!(batcher = self.name, records = batch.len(), "Batch full, flushing early");
            self.dispatch(&mut pending, batch);
        }
    }

    /// Queue whatever is pending for the writer.
    pub fn flush(&self) {
        let mut pending = lock(&self.pending);
        if pending.records.is_empty() {
            return;
        }
        let batch = std::mem::take(&mut pending.records);
        self.dispatch(&mut pending, batch);
    }

    /// Timed flush: queue what is pending, then let the sink see that the
    /// interval elapsed.
    fn tick(&self) {
        let mut pending = lock(&self.pending);
        if pending.closed {
            return;
        }
        if !pending.records.is_empty() {
            let batch = std::mem::take(&mut pending.records);
            self.dispatch(&mut pending, batch);
        }
        self.send(&mut pending, Job::Tick);
    }

    pub fn pending_len(&self) -> usize {
        lock(&self.pending).records.len()
    }

    /// Stop the ticker, queue the remaining records behind any earlier
    /// flush, and wait until the writer has handed all of them to the sink.
    pub async fn stop(&self) {
        self.shutdown.trigger();
        let ticker = lock(&self.ticker).take();
        if let Some(handle) = ticker {
            if let Err(e) = handle.await {
                warn!(batcher = self.name, error = %e, "Flush ticker ended abnormally");
            }
        }

        let (remaining, writer) = {
            let mut pending = lock(&self.pending);
            pending.closed = true;
            let batch = std::mem::take(&mut pending.records);
            let remaining = batch.len();
            if remaining > 0 {
                self.dispatch(&mut pending, batch);
            }
            (remaining, pending.writer.take())
        };

        if let Some(Writer { tx, handle }) = writer {
            // closing the channel lets the writer exit once it is empty
            drop(tx);
            if let Err(e) = handle.await {
                warn!(batcher = self.name, error = %e, "Batch writer ended abnormally");
            }
        }

        info!(batcher = self.name, final_records = remaining, "Batcher stopped");
    }

    /// Caller holds the `pending` lock, so queue order is swap order.
    fn dispatch(&self, pending: &mut Pending<K, R>, batch: HashMap<K, R>) {
        self.send(pending, Job::Batch(batch));
    }

    fn send(&self, pending: &mut Pending<K, R>, job: Job<K, R>) {
        let writer = pending.writer.get_or_insert_with(|| self.spawn_writer());
        if let Err(mpsc::error::SendError(Job::Batch(batch))) = writer.tx.send(job) {
            warn!(
                batcher = self.name,
                records = batch.len(),
                "Batch writer gone, dropping batch"
            );
        }
    }

    fn spawn_writer(&self) -> Writer<K, R> {
        let (tx, mut rx) = mpsc::unbounded_channel::<Job<K, R>>();
        let sink = Arc::clone(&self.sink);
        let name = self.name;
        let handle = tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                match job {
                    Job::Batch(batch) => task::contain(name, sink.write_batch(batch)).await,
                    Job::Tick => task::contain(name, sink.tick()).await,
                };
            }
            task::contain(name, sink.close()).await;
            debug!(batcher = name, "Batch writer drained");
        });
        Writer { tx, handle }
    }
}
