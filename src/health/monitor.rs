use crate::scheduler::ConnectivityProbe;
use crate::task::{self, FirstRun, Shutdown};
use async_trait::async_trait;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("failed to close connection: {0}")]
    Close(String),

    #[error("failed to open connection: {0}")]
    Open(String),
}

/// The platform connection the monitor can force-cycle.
#[async_trait]
pub trait Connection: Send + Sync {
    async fn close(&self) -> Result<(), ConnectError>;
    async fn open(&self) -> Result<(), ConnectError>;
}

#[derive(Debug, Clone)]
pub struct HealthConfig {
    pub poll_interval: Duration,
    pub grace_period: Duration,
    pub reopen_delay: Duration,
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(30),
            grace_period: Duration::from_secs(120),
            reopen_delay: Duration::from_secs(5),
            backoff_base: Duration::from_secs(10),
            backoff_cap: Duration::from_secs(120),
        }
    }
}

impl HealthConfig {
    /// `min(attempts * base, cap)`
    pub fn backoff_for(&self, attempts: u32) -> Duration {
        self.backoff_base
            .saturating_mul(attempts)
            .min(self.backoff_cap)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No transition reported yet.
    Connecting,
    Connected,
    Disconnected { since: Instant },
}

#[derive(Debug)]
struct Tracked {
    state: ConnectionState,
    attempts: u32,
}

/// Cheap cloneable view of the connection state. Event handlers report
/// transitions through it; the scheduler reads it as its probe.
#[derive(Debug, Clone)]
pub struct HealthHandle {
    inner: Arc<Mutex<Tracked>>,
}

impl Default for HealthHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthHandle {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Tracked {
                state: ConnectionState::Connecting,
                attempts: 0,
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Tracked> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn on_connected(&self) {
        let mut tracked = self.lock();
        if tracked.attempts > 0 {
            info!(attempts = tracked.attempts, "Reconnected");
        } else {
            info!("Connected to gateway");
        }
        tracked.state = ConnectionState::Connected;
        tracked.attempts = 0;
    }

    pub fn on_resumed(&self) {
        let mut tracked = self.lock();
        info!("Connection resumed");
        tracked.state = ConnectionState::Connected;
        tracked.attempts = 0;
    }

    pub fn on_disconnected(&self) {
        let mut tracked = self.lock();
        warn!("Disconnected from gateway");
        tracked.state = ConnectionState::Disconnected {
            since: Instant::now(),
        };
    }

    pub fn state(&self) -> ConnectionState {
        self.lock().state
    }

    pub fn attempts(&self) -> u32 {
        self.lock().attempts
    }

    /// Bump the attempt counter if the connection has been down for at
    /// least `grace`. Returns the new count.
    fn claim_attempt(&self, grace: Duration) -> Option<u32> {
        let mut tracked = self.lock();
        match tracked.state {
            ConnectionState::Disconnected { since } if since.elapsed() >= grace => {
                tracked.attempts += 1;
                Some(tracked.attempts)
            }
            _ => None,
        }
    }
}

impl ConnectivityProbe for HealthHandle {
    fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }
}

/// Outer supervisor over the transport's own reconnect logic: when the
/// connection stays down past the grace period it is force-cycled, with a
/// linear backoff capped at `backoff_cap` between attempts.
pub struct ConnectionHealthMonitor {
    handle: HealthHandle,
    connection: Arc<dyn Connection>,
    config: HealthConfig,
    shutdown: Shutdown,
    ticker: Mutex<Option<JoinHandle<()>>>,
}

impl ConnectionHealthMonitor {
    pub fn new(
        handle: HealthHandle,
        connection: Arc<dyn Connection>,
        config: HealthConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            handle,
            connection,
            config,
            shutdown: Shutdown::new(),
            ticker: Mutex::new(None),
        })
    }

    pub fn handle(&self) -> HealthHandle {
        self.handle.clone()
    }

    pub fn start(self: &Arc<Self>) {
        let mut ticker = self.ticker.lock().unwrap_or_else(PoisonError::into_inner);
        if ticker.is_some() || self.shutdown.is_triggered() {
            return;
        }

        let monitor = Arc::clone(self);
        *ticker = Some(task::spawn_periodic(
            "health-monitor",
            self.config.poll_interval,
            FirstRun::AfterPeriod,
            self.shutdown.listener(),
            move || {
                let monitor = Arc::clone(&monitor);
                async move {
                    monitor.check_once().await;
                }
            },
        ));
        info!(
            poll_secs = self.config.poll_interval.as_secs(),
            grace_secs = self.config.grace_period.as_secs(),
            "Health monitor started"
        );
    }

    /// One evaluation. Returns whether a reconnect was attempted; the
    /// backoff wait happens before returning.
    pub async fn check_once(&self) -> bool {
        let Some(attempt) = self.handle.claim_attempt(self.config.grace_period) else {
            return false;
        };

        warn!(
            attempt = attempt,
            grace_secs = self.config.grace_period.as_secs(),
            "Connection down past grace period, forcing reconnect"
        );

        if let Err(e) = self.connection.close().await {
            debug!(error = %e, "Close before reconnect failed");
        }
        if !self.pause(self.config.reopen_delay).await {
            return true;
        }
        if let Err(e) = self.connection.open().await {
            error!(attempt = attempt, error = %e, "Reconnect failed");
        }

        let backoff = self.config.backoff_for(attempt);
        info!(backoff_secs = backoff.as_secs(), "Waiting before next reconnect check");
        self.pause(backoff).await;
        true
    }

    /// Sleep unless stopped first. Returns false when interrupted.
    async fn pause(&self, duration: Duration) -> bool {
        let mut listener = self.shutdown.listener();
        tokio::select! {
            _ = tokio::time::sleep(duration) => true,
            _ = listener.stopped() => false,
        }
    }

    pub async fn stop(&self) {
        self.shutdown.trigger();
        let ticker = self
            .ticker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = ticker {
            if let Err(e) = handle.await {
                warn!(error = %e, "Health monitor ended abnormally");
            }
        }
        info!("Health monitor stopped");
    }
}
