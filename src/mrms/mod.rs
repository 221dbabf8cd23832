//! MySQL restart detection.
//!
//! One watcher per DSN polls `Uptime`. A restart is detected when the
//! server reports less uptime than it should have accumulated since the
//! previous poll, which also catches restarts during long agent outages.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::context::AgentContext;
use crate::mysql::{redact, ConnectionFactory, Connector};

/// Default poll interval.
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(1);

/// Capacity of every subscriber channel.
pub const SUBSCRIBER_CHANNEL_SIZE: usize = 10;

const SERVICE: &str = "mrms";

/// Receiving end of a restart subscription. Each notification carries the
/// DSN of the restarted server.
#[derive(Debug)]
pub struct Subscription {
    pub id: u64,
    pub dsn: String,
    pub rx: mpsc::Receiver<String>,
}

/// Uptime bookkeeping of one server.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct UptimeState {
    last_uptime: u64,
    last_check: Option<f64>,
}

impl UptimeState {
    /// Record one observation taken at `now` (seconds). Returns true when
    /// the server restarted since the previous observation.
    pub fn observe(&mut self, uptime: u64, now: f64) -> bool {
        let restarted = match self.last_check {
            Some(last_check) => {
                let elapsed = (now - last_check).max(0.0).floor() as u64;
                uptime < self.last_uptime.saturating_add(elapsed)
            }
            None => false,
        };

        self.last_uptime = uptime;
        self.last_check = Some(now);
        restarted
    }
}

struct Watcher {
    conn: Arc<dyn Connector>,
    state: UptimeState,
    subscribers: Vec<(u64, mpsc::Sender<String>)>,
}

/// Restart detector shared by every subsystem that talks to MySQL.
pub struct Monitor {
    ctx: AgentContext,
    factory: Arc<dyn ConnectionFactory>,
    interval: Duration,
    watchers: DashMap<String, Watcher>,
    global: parking_lot::Mutex<Vec<mpsc::Sender<String>>>,
    next_id: AtomicU64,
    cancel: CancellationToken,
    handle: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl Monitor {
    pub fn new(ctx: AgentContext, factory: Arc<dyn ConnectionFactory>, interval: Duration) -> Self {
        Self {
            ctx,
            factory,
            interval,
            watchers: DashMap::new(),
            global: parking_lot::Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
            cancel: CancellationToken::new(),
            handle: parking_lot::Mutex::new(None),
        }
    }

    /// Watch `dsn` and subscribe to its restarts.
    pub fn add(&self, dsn: &str) -> Subscription {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_CHANNEL_SIZE);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);

        self.watchers
            .entry(dsn.to_string())
            .or_insert_with(|| {
                info!(dsn = %redact(dsn), "watching mysql instance");
                Watcher {
                    conn: self.factory.make(dsn),
                    state: UptimeState::default(),
                    subscribers: Vec::new(),
                }
            })
            .subscribers
            .push((id, tx));

        self.update_status();

        Subscription {
            id,
            dsn: dsn.to_string(),
            rx,
        }
    }

    /// Drop a subscription; the watcher goes away with its last subscriber.
    pub fn remove(&self, dsn: &str, id: u64) {
        let empty = match self.watchers.get_mut(dsn) {
            Some(mut w) => {
                w.subscribers.retain(|(sid, _)| *sid != id);
                w.subscribers.is_empty()
            }
            None => return,
        };

        if empty {
            if let Some((_, w)) = self.watchers.remove(dsn) {
                let conn = w.conn;
                tokio::spawn(async move { conn.close().await });
            }
            info!(dsn = %redact(dsn), "stopped watching mysql instance");
        }

        self.update_status();
    }

    /// Notifications carrying the DSN of any restarted server.
    pub fn global_subscribe(&self) -> mpsc::Receiver<String> {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_CHANNEL_SIZE);
        self.global.lock().push(tx);
        rx
    }

    pub fn start(self: &Arc<Self>) {
        let mut handle = self.handle.lock();
        if handle.is_some() {
            return;
        }

        let monitor = Arc::clone(self);
        *handle = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(monitor.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = monitor.cancel.cancelled() => break,
                    _ = ticker.tick() => monitor.check_all().await,
                }
            }

            debug!("restart monitor stopped");
        }));
    }

    pub async fn stop(&self) {
        self.cancel.cancel();
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    /// Poll every watched server once.
    pub async fn check_all(&self) {
        let dsns: Vec<(String, Arc<dyn Connector>)> = self
            .watchers
            .iter()
            .map(|w| (w.key().clone(), Arc::clone(&w.conn)))
            .collect();

        for (dsn, conn) in dsns {
            let uptime = match conn.uptime().await {
                Ok(uptime) => uptime,
                Err(e) => {
                    debug!(dsn = %redact(&dsn), error = %format!("{e:#}"), "uptime check failed");
                    conn.close().await;
                    continue;
                }
            };

            self.observe(&dsn, uptime, epoch_secs());
        }
    }

    /// Feed one uptime reading; notifies subscribers on restart.
    pub fn observe(&self, dsn: &str, uptime: u64, now: f64) -> bool {
        let restarted = {
            let Some(mut w) = self.watchers.get_mut(dsn) else {
                return false;
            };

            if !w.state.observe(uptime, now) {
                return false;
            }

            w.subscribers.retain(|(id, tx)| notify(tx, dsn, *id));
            true
        };

        warn!(dsn = %redact(dsn), uptime, "mysql restart detected");
        self.ctx.health.mysql_restarts.inc();
        self.ctx.status.update(
            SERVICE,
            "mrms-last-restart",
            format!("{} at {}", redact(dsn), chrono::Utc::now().to_rfc3339()),
        );

        self.global.lock().retain(|tx| notify(tx, dsn, 0));

        restarted
    }

    pub fn status(&self) -> BTreeMap<String, String> {
        self.ctx.status.service(SERVICE)
    }

    fn update_status(&self) {
        self.ctx
            .status
            .update(SERVICE, "mrms-monitor", format!("{} instances", self.watchers.len()));
    }
}

/// Non-blocking send; false when the subscriber is gone.
fn notify(tx: &mpsc::Sender<String>, dsn: &str, id: u64) -> bool {
    match tx.try_send(dsn.to_string()) {
        Ok(()) => true,
        Err(mpsc::error::TrySendError::Full(_)) => {
            warn!(dsn = %redact(dsn), subscriber = id, "restart subscriber full, notification dropped");
            true
        }
        Err(mpsc::error::TrySendError::Closed(_)) => false,
    }
}

fn epoch_secs() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mysql::MockConnectionFactory;

    const DSN: &str = "mysql://root@127.0.0.1:3306/";

    fn monitor(dir: &std::path::Path) -> (Arc<Monitor>, Arc<MockConnectionFactory>) {
        let ctx = AgentContext::for_tests(dir);
        let factory = Arc::new(MockConnectionFactory::new());
        let monitor = Arc::new(Monitor::new(
            ctx,
            Arc::clone(&factory) as Arc<dyn ConnectionFactory>,
            Duration::from_millis(10),
        ));
        (monitor, factory)
    }

    #[test]
    fn test_restart_detected_across_outage() {
        let mut state = UptimeState::default();
        assert!(!state.observe(60, 0.0));
        // 30 < 60 + 120
        assert!(state.observe(30, 120.0));
    }

    #[test]
    fn test_steady_uptime_is_not_a_restart() {
        let mut state = UptimeState::default();
        assert!(!state.observe(100, 1000.4));
        assert!(!state.observe(101, 1001.9));
        assert!(!state.observe(103, 1003.2));
        assert!(!state.observe(3603, 4603.0));
    }

    #[test]
    fn test_plain_decrease_is_a_restart() {
        let mut state = UptimeState::default();
        state.observe(500, 0.0);
        assert!(state.observe(2, 1.0));
    }

    #[tokio::test]
    async fn test_subscribers_notified() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let (monitor, _) = monitor(tmp.path());

        let mut sub = monitor.add(DSN);
        let mut global = monitor.global_subscribe();

        assert!(!monitor.observe(DSN, 60, 0.0));
        assert!(monitor.observe(DSN, 30, 120.0));

        assert_eq!(sub.rx.try_recv().expect("subscriber"), DSN);
        assert_eq!(global.try_recv().expect("global"), DSN);
        assert_eq!(monitor.ctx.health.mysql_restarts.get(), 1.0);
    }

    #[tokio::test]
    async fn test_remove_last_subscriber_drops_watcher() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let (monitor, _) = monitor(tmp.path());

        let a = monitor.add(DSN);
        let b = monitor.add(DSN);
        assert_eq!(monitor.watchers.len(), 1);

        monitor.remove(DSN, a.id);
        assert_eq!(monitor.watchers.len(), 1);
        monitor.remove(DSN, b.id);
        assert!(monitor.watchers.is_empty());
        assert!(!monitor.observe(DSN, 1, 1.0));
    }

    #[tokio::test]
    async fn test_poll_loop_reads_uptime() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let (monitor, factory) = monitor(tmp.path());
        let conn = factory.get(DSN);
        conn.push_uptime(1000);

        let mut sub = monitor.add(DSN);
        monitor.start();
        tokio::time::sleep(Duration::from_millis(50)).await;

        conn.push_uptime(1);
        let dsn = tokio::time::timeout(Duration::from_secs(5), sub.rx.recv())
            .await
            .expect("restart in time")
            .expect("channel open");
        assert_eq!(dsn, DSN);

        monitor.stop().await;
        assert!(conn.connects() >= 2);
    }
}
