use super::*;
use crate::scheduler::ConnectivityProbe;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;

#[derive(Default)]
struct FakeConnection {
    closes: AtomicUsize,
    opens: AtomicUsize,
    fail_open: AtomicBool,
}

impl FakeConnection {
    fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connection for FakeConnection {
    async fn close(&self) -> Result<(), ConnectError> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn open(&self) -> Result<(), ConnectError> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        if self.fail_open.load(Ordering::SeqCst) {
            return Err(ConnectError::Open("gateway unreachable".into()));
        }
        Ok(())
    }
}

fn monitor(connection: Arc<FakeConnection>) -> Arc<ConnectionHealthMonitor> {
    ConnectionHealthMonitor::new(HealthHandle::new(), connection, HealthConfig::default())
}

#[test]
fn backoff_grows_linearly_then_caps() {
    let config = HealthConfig::default();
    assert_eq!(config.backoff_for(1), Duration::from_secs(10));
    assert_eq!(config.backoff_for(5), Duration::from_secs(50));
    assert_eq!(config.backoff_for(12), Duration::from_secs(120));
    assert_eq!(config.backoff_for(u32::MAX), Duration::from_secs(120));
}

#[test]
fn probe_follows_reported_transitions() {
    let handle = HealthHandle::new();
    assert_eq!(handle.state(), ConnectionState::Connecting);
    assert!(!handle.is_connected());

    handle.on_connected();
    assert!(handle.is_connected());

    handle.on_disconnected();
    assert!(!handle.is_connected());

    handle.on_resumed();
    assert!(handle.is_connected());
}

#[tokio::test(start_paused = true)]
async fn nothing_happens_inside_grace_or_while_connected() {
    let connection = Arc::new(FakeConnection::default());
    let monitor = monitor(connection.clone());
    let handle = monitor.handle();

    assert!(!monitor.check_once().await);
    handle.on_connected();
    assert!(!monitor.check_once().await);

    handle.on_disconnected();
    sleep(Duration::from_secs(119)).await;
    assert!(!monitor.check_once().await);
    assert_eq!(connection.opens(), 0);
}

#[tokio::test(start_paused = true)]
async fn reconnect_resets_attempts() {
    let connection = Arc::new(FakeConnection::default());
    connection.fail_open.store(true, Ordering::SeqCst);
    let monitor = monitor(connection.clone());
    let handle = monitor.handle();

    handle.on_disconnected();
    sleep(Duration::from_secs(120)).await;
    assert!(monitor.check_once().await);
    assert!(monitor.check_once().await);
    assert_eq!(handle.attempts(), 2);
    assert_eq!(connection.closes.load(Ordering::SeqCst), 2);

    handle.on_connected();
    assert_eq!(handle.attempts(), 0);
    assert!(!monitor.check_once().await);
}

#[tokio::test(start_paused = true)]
async fn one_attempt_per_outage_window() {
    let connection = Arc::new(FakeConnection::default());
    let monitor = monitor(connection.clone());
    let handle = monitor.handle();

    handle.on_disconnected();
    monitor.start();

    // polls at 30, 60, 90 see less than the grace period
    sleep(Duration::from_secs(119)).await;
    assert_eq!(connection.closes.load(Ordering::SeqCst), 0);

    // the poll at 120 closes, reopens at 125, then backs off for 10s
    sleep(Duration::from_secs(7)).await;
    assert_eq!(connection.opens(), 1);
    assert_eq!(handle.attempts(), 1);

    // a fresh disconnect inside the backoff window starts a new grace period
    sleep(Duration::from_secs(4)).await;
    handle.on_disconnected();
    sleep(Duration::from_secs(100)).await;
    assert_eq!(connection.opens(), 1);

    // first poll at or after 130 + 120 is at 270, reopening at 275
    sleep(Duration::from_secs(50)).await;
    assert_eq!(connection.opens(), 2);
    assert_eq!(handle.attempts(), 2);

    monitor.stop().await;
}

#[tokio::test(start_paused = true)]
async fn stop_interrupts_backoff() {
    let connection = Arc::new(FakeConnection::default());
    let monitor = monitor(connection.clone());
    let handle = monitor.handle();

    handle.on_disconnected();
    monitor.start();
    sleep(Duration::from_secs(126)).await;
    assert_eq!(connection.opens(), 1);

    let started = tokio::time::Instant::now();
    monitor.stop().await;
    assert!(started.elapsed() < Duration::from_secs(10));
}
