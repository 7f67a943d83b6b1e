//! Background task plumbing shared by every periodic loop.
//!
//! - [`Shutdown`] / [`StopListener`]: explicit stop signal per loop.
//! - [`contain`]: catches a panic inside one iteration or job and logs it.
//! - [`spawn_periodic`]: "wake every T or on stop, whichever first".
//! - [`WorkerPool`]: bounded detached work that can be drained on stop.

use futures::FutureExt;
use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{watch, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, warn};

/// Owner side of a stop signal. Dropping it also counts as a stop.
#[derive(Debug)]
pub struct Shutdown {
    tx: watch::Sender<bool>,
}

impl Shutdown {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx }
    }

    pub fn listener(&self) -> StopListener {
        StopListener {
            rx: self.tx.subscribe(),
        }
    }

    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_triggered(&self) -> bool {
        *self.tx.borrow()
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone)]
pub struct StopListener {
    rx: watch::Receiver<bool>,
}

impl StopListener {
    /// Resolves once the paired [`Shutdown`] is triggered or dropped.
    pub async fn stopped(&mut self) {
        let _ = self.rx.wait_for(|stopped| *stopped).await;
    }
}

/// Run `fut`, turning a panic into a logged error. Returns `None` when the
/// future panicked.
pub async fn contain<F>(context: &str, fut: F) -> Option<F::Output>
where
    F: Future,
{
    match AssertUnwindSafe(fut).catch_unwind().await {
        Ok(output) => Some(output),
        Err(panic) => {
            error!(
                context = context,
                panic = %panic_message(panic.as_ref()),
                "Panic contained in background work"
            );
            None
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// When a periodic loop runs its first iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FirstRun {
    Immediately,
    AfterPeriod,
}

/// Spawn a loop that calls `tick` every `period` until `listener` fires.
/// Each iteration is wrapped in [`contain`] so a panic never ends the loop.
pub fn spawn_periodic<F, Fut>(
    name: &'static str,
    period: Duration,
    first_run: FirstRun,
    mut listener: StopListener,
    mut tick: F,
) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        if first_run == FirstRun::AfterPeriod {
            // interval() completes its first tick immediately
            ticker.tick().await;
        }

        loop {
            tokio::select! {
                _ = listener.stopped() => break,
                _ = ticker.tick() => {
                    contain(name, tick()).await;
                }
            }
        }

        debug!(task = name, "Periodic task stopped");
    })
}

/// Detached background work with a concurrency bound. Every unit of work
/// owns its inputs; [`WorkerPool::drain`] waits for everything spawned so far.
pub struct WorkerPool {
    name: &'static str,
    permits: Arc<Semaphore>,
    tasks: Mutex<JoinSet<()>>,
}

impl WorkerPool {
    pub fn new(name: &'static str, max_in_flight: usize) -> Self {
        Self {
            name,
            permits: Arc::new(Semaphore::new(max_in_flight.max(1))),
            tasks: Mutex::new(JoinSet::new()),
        }
    }

    pub fn spawn<F>(&self, work: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let permits = self.permits.clone();
        let name = self.name;

        let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        // reap finished work so the set does not grow without bound
        while tasks.try_join_next().is_some() {}
        tasks.spawn(async move {
            let Ok(_permit) = permits.acquire_owned().await else {
                return;
            };
            contain(name, work).await;
        });
    }

    /// Wait for every unit of work spawned before this call.
    pub async fn drain(&self) {
        let mut tasks = {
            let mut guard = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
            std::mem::replace(&mut *guard, JoinSet::new())
        };

        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                warn!(pool = self.name, error = %e, "Background work did not complete");
            }
        }
    }

    pub fn in_flight(&self) -> usize {
        self.tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn contain_swallows_panics() {
        let out: Option<()> = contain("test", async { panic!("boom") }).await;
        assert!(out.is_none());

        let ok = contain("test", async { 7 }).await;
        assert_eq!(ok, Some(7));
    }

    #[tokio::test(start_paused = true)]
    async fn periodic_loop_survives_a_panicking_iteration() {
        let shutdown = Shutdown::new();
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = runs.clone();

        let handle = spawn_periodic(
            "test-loop",
            Duration::from_secs(10),
            FirstRun::AfterPeriod,
            shutdown.listener(),
            move || {
                let counter = counter.clone();
                async move {
                    if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                        panic!("first iteration fails");
                    }
                }
            },
        );

        tokio::time::sleep(Duration::from_secs(35)).await;
        shutdown.trigger();
        handle.await.unwrap();

        assert_eq!(runs.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn drain_waits_for_spawned_work() {
        let pool = WorkerPool::new("test-pool", 2);
        let done = Arc::new(AtomicUsize::new(0));

        for _ in 0..5 {
            let done = done.clone();
            pool.spawn(async move {
                tokio::task::yield_now().await;
                done.fetch_add(1, Ordering::SeqCst);
            });
        }

        pool.drain().await;
        assert_eq!(done.load(Ordering::SeqCst), 5);
        assert_eq!(pool.in_flight(), 0);
    }
}
