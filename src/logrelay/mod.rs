//! Log relay: local file output plus remote push with an offline buffer.

pub mod buffer;
pub mod layer;
pub mod manager;

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::de::IgnoredAny;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub use buffer::{LogBuffer, BUFFER_SIZE};
pub use layer::RelayLayer;
pub use manager::Manager;

use crate::client::Link;
use crate::config::LogConfig;
use crate::context::AgentContext;
use crate::proto::LogEntry;

/// Capacity of the producer queue feeding the relay.
pub const LOG_QUEUE_SIZE: usize = 1000;

const FLUSH_INTERVAL: Duration = Duration::from_secs(1);
const STATUS_SERVICE: &str = "log";

/// The remote log link as seen by the relay: inbound messages are ignored.
pub type LogLink = dyn Link<IgnoredAny, LogEntry>;

/// Single consumer of every log entry the agent produces.
///
/// Producers (the tracing layer) push into a bounded queue without blocking.
/// The relay task owns the log file, the offline buffer and the link's send
/// queue, so delivery order matches queue order.
pub struct Relay {
    ctx: AgentContext,
    link: Option<Arc<LogLink>>,
    tx: mpsc::Sender<LogEntry>,
    rx: Arc<parking_lot::Mutex<Option<mpsc::Receiver<LogEntry>>>>,
    config: watch::Sender<LogConfig>,
    cancel: parking_lot::Mutex<CancellationToken>,
    handle: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl Relay {
    pub fn new(ctx: AgentContext, link: Option<Arc<LogLink>>, config: LogConfig) -> Self {
        let (tx, rx) = mpsc::channel(LOG_QUEUE_SIZE);
        let (config, _) = watch::channel(config);

        Self {
            ctx,
            link,
            tx,
            rx: Arc::new(parking_lot::Mutex::new(Some(rx))),
            config,
            cancel: parking_lot::Mutex::new(CancellationToken::new()),
            handle: parking_lot::Mutex::new(None),
        }
    }

    /// Producer side of the log queue.
    pub fn sender(&self) -> mpsc::Sender<LogEntry> {
        self.tx.clone()
    }

    pub fn config(&self) -> LogConfig {
        self.config.borrow().clone()
    }

    /// Hand a new level/file/offline setting to the relay task.
    pub fn set_config(&self, config: LogConfig) {
        self.config.send_replace(config);
    }

    pub fn is_running(&self) -> bool {
        self.handle
            .lock()
            .as_ref()
            .is_some_and(|h| !h.is_finished())
    }

    pub fn start(&self) -> Result<()> {
        let Some(rx) = self.rx.lock().take() else {
            bail!("log relay already started");
        };

        let cancel = CancellationToken::new();
        *self.cancel.lock() = cancel.clone();

        let mut task = RelayTask {
            ctx: self.ctx.clone(),
            link_tx: self.link.as_ref().map(|l| l.send_chan()),
            connected: self.link.as_ref().map(|l| l.connect_chan()),
            config: self.config.subscribe(),
            file: None,
            buffer: LogBuffer::default(),
        };
        task.apply_config();

        let rx_slot = Arc::clone(&self.rx);
        let handle = tokio::spawn(async move {
            let rx = task.run(rx, cancel).await;
            *rx_slot.lock() = Some(rx);
        });
        *self.handle.lock() = Some(handle);

        if let Some(link) = &self.link {
            link.connect();
        }

        Ok(())
    }

    /// Stop after writing out what is already queued.
    pub async fn stop(&self) {
        self.cancel.lock().cancel();
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

struct OpenFile {
    path: String,
    file: File,
}

struct RelayTask {
    ctx: AgentContext,
    link_tx: Option<mpsc::Sender<LogEntry>>,
    connected: Option<watch::Receiver<bool>>,
    config: watch::Receiver<LogConfig>,
    file: Option<OpenFile>,
    buffer: LogBuffer,
}

impl RelayTask {
    async fn run(
        &mut self,
        mut rx: mpsc::Receiver<LogEntry>,
        cancel: CancellationToken,
    ) -> mpsc::Receiver<LogEntry> {
        let mut flush = tokio::time::interval(FLUSH_INTERVAL);
        flush.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        self.set_status("Running");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,

                entry = rx.recv() => match entry {
                    Some(entry) => self.relay(entry),
                    None => break,
                },

                changed = self.config.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    self.apply_config();
                }

                Some(up) = wait_connect(&mut self.connected) => {
                    if up {
                        self.flush();
                    }
                }

                _ = flush.tick() => self.flush(),
            }
        }

        while let Ok(entry) = rx.try_recv() {
            self.relay(entry);
        }
        self.flush();

        self.set_status("Stopped");
        debug!("log relay stopped");

        rx
    }

    fn set_status(&self, relay: &str) {
        let status = &self.ctx.status;
        status.update(STATUS_SERVICE, "log-relay", relay);
        status.update(
            STATUS_SERVICE,
            "log-buffer",
            format!("{} buffered, {} lost", self.buffer.len(), self.buffer.lost()),
        );
    }

    fn is_connected(&self) -> bool {
        self.connected.as_ref().is_some_and(|c| *c.borrow())
    }

    fn apply_config(&mut self) {
        let cfg = self.config.borrow_and_update().clone();

        let current = self.file.as_ref().map(|f| f.path.as_str()).unwrap_or("");
        if current != cfg.file {
            self.file = None;
            if !cfg.file.is_empty() {
                match open_log_file(&cfg.file) {
                    Ok(file) => {
                        self.file = Some(OpenFile {
                            path: cfg.file.clone(),
                            file,
                        })
                    }
                    Err(e) => warn!(error = %format!("{e:#}"), "log file disabled"),
                }
            }
        }

        let file = self.file.as_ref().map(|f| f.path.as_str()).unwrap_or("");
        self.ctx.status.update(STATUS_SERVICE, "log-file", file);
        self.ctx
            .status
            .update(STATUS_SERVICE, "log-level", cfg.level.as_str());
        info!(level = %cfg.level, file, offline = cfg.offline, "log config applied");
    }

    fn relay(&mut self, entry: LogEntry) {
        let cfg = self.config.borrow();
        if entry.level < cfg.level {
            return;
        }
        let remote = !cfg.offline && !entry.offline && self.link_tx.is_some();
        drop(cfg);

        self.write_file(&entry);

        if !remote {
            return;
        }

        if self.buffer.is_empty() && self.is_connected() {
            if let Some(tx) = &self.link_tx {
                match tx.try_send(entry) {
                    Ok(()) => return,
                    Err(mpsc::error::TrySendError::Full(entry))
                    | Err(mpsc::error::TrySendError::Closed(entry)) => self.buffer.push(entry),
                }
            }
        } else {
            self.buffer.push(entry);
        }

        self.set_status("Running");
    }

    fn write_file(&mut self, entry: &LogEntry) {
        let Some(open) = self.file.as_mut() else {
            return;
        };

        if let Err(e) = writeln!(open.file, "{entry}") {
            let path = open.path.clone();
            self.file = None;
            self.ctx.status.update(STATUS_SERVICE, "log-file", "");
            warn!(file = %path, error = %e, offline = true, "log file write failed, file output disabled");
        }
    }

    /// Push buffered entries to the link while it accepts them; the rest
    /// stays buffered.
    fn flush(&mut self) {
        if self.buffer.is_empty() || !self.is_connected() {
            return;
        }
        let Some(tx) = self.link_tx.clone() else {
            return;
        };

        let lost = self.buffer.lost();
        self.buffer.deliver(|entry| match tx.try_send(entry) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(entry))
            | Err(mpsc::error::TrySendError::Closed(entry)) => Err(entry),
        });
        if lost > 0 && self.buffer.lost() == 0 {
            self.ctx.health.log_entries_lost.inc_by(lost as f64);
        }

        self.set_status("Running");
    }
}

/// Next link state change, or pending forever without a link.
async fn wait_connect(connected: &mut Option<watch::Receiver<bool>>) -> Option<bool> {
    match connected {
        Some(rx) => match rx.changed().await {
            Ok(()) => Some(*rx.borrow_and_update()),
            Err(_) => {
                *connected = None;
                None
            }
        },
        None => std::future::pending().await,
    }
}

fn open_log_file(path: &str) -> Result<File> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("opening log file {path}"))
}

#[cfg(test)]
mod tests {
    use tokio::time::timeout;

    use super::*;
    use crate::client::MockLink;
    use crate::proto::Level;

    const WAIT: Duration = Duration::from_secs(5);

    fn relay(dir: &std::path::Path, link: Arc<MockLink<IgnoredAny, LogEntry>>, cfg: LogConfig) -> Relay {
        let ctx = AgentContext::for_tests(dir);
        Relay::new(ctx, Some(link as Arc<LogLink>), cfg)
    }

    async fn recv(rx: &mut mpsc::Receiver<LogEntry>) -> LogEntry {
        timeout(WAIT, rx.recv())
            .await
            .expect("entry in time")
            .expect("channel open")
    }

    #[tokio::test]
    async fn test_buffers_while_offline_then_flushes_in_order() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let link = Arc::new(MockLink::new());
        let mut sent = link.sent().expect("sent");
        let relay = relay(tmp.path(), Arc::clone(&link), LogConfig::default());

        relay.start().expect("start");
        // MockLink::connect flips the state; start from disconnected.
        link.set_connected(false);

        let tx = relay.sender();
        for n in 0..3 {
            tx.send(LogEntry::new(Level::Info, "test", n.to_string()))
                .await
                .expect("send");
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(sent.try_recv().is_err());

        link.set_connected(true);
        for n in 0..3 {
            assert_eq!(recv(&mut sent).await.msg, n.to_string());
        }

        relay.stop().await;
    }

    #[tokio::test]
    async fn test_level_threshold_and_file_output() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let path = tmp.path().join("agent.log");
        let link = Arc::new(MockLink::new());
        let mut sent = link.sent().expect("sent");
        let cfg = LogConfig {
            level: Level::Warning,
            file: path.display().to_string(),
            offline: false,
        };
        let relay = relay(tmp.path(), Arc::clone(&link), cfg);
        relay.start().expect("start");

        let tx = relay.sender();
        tx.send(LogEntry::new(Level::Info, "test", "quiet")).await.expect("send");
        tx.send(LogEntry::new(Level::Error, "test", "loud")).await.expect("send");

        assert_eq!(recv(&mut sent).await.msg, "loud");
        relay.stop().await;

        let written = std::fs::read_to_string(&path).expect("log file");
        assert!(written.contains("loud"));
        assert!(!written.contains("quiet"));
    }

    #[tokio::test]
    async fn test_offline_entries_stay_local() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let link = Arc::new(MockLink::new());
        let mut sent = link.sent().expect("sent");
        let relay = relay(tmp.path(), Arc::clone(&link), LogConfig::default());
        relay.start().expect("start");

        let tx = relay.sender();
        let mut local = LogEntry::new(Level::Error, "test", "local");
        local.offline = true;
        tx.send(local).await.expect("send");
        tx.send(LogEntry::new(Level::Error, "test", "remote")).await.expect("send");

        assert_eq!(recv(&mut sent).await.msg, "remote");
        relay.stop().await;
        assert!(sent.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_overflow_reports_lost_entries() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let link = Arc::new(MockLink::new());
        let mut sent = link.sent().expect("sent");
        let relay = relay(tmp.path(), Arc::clone(&link), LogConfig::default());
        relay.start().expect("start");
        link.set_connected(false);

        let total = 2 * BUFFER_SIZE + 10;
        let tx = relay.sender();
        for n in 0..total {
            tx.send(LogEntry::new(Level::Info, "test", n.to_string()))
                .await
                .expect("send");
        }
        tokio::time::sleep(Duration::from_millis(100)).await;

        link.set_connected(true);
        let mut msgs = Vec::new();
        for _ in 0..(BUFFER_SIZE + 1 + 10) {
            msgs.push(recv(&mut sent).await.msg);
        }

        assert_eq!(msgs[0], "0");
        assert_eq!(msgs[BUFFER_SIZE - 1], (BUFFER_SIZE - 1).to_string());
        assert_eq!(msgs[BUFFER_SIZE], format!("Lost {BUFFER_SIZE} log entries"));
        assert_eq!(msgs.last().map(String::as_str), Some((total - 1).to_string().as_str()));

        relay.stop().await;
    }

    #[tokio::test]
    async fn test_restart_after_stop() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let ctx = AgentContext::for_tests(tmp.path());
        let relay = Relay::new(ctx, None, LogConfig::default());

        relay.start().expect("start");
        assert!(relay.start().is_err());
        relay.stop().await;
        relay.start().expect("restart");
        relay.stop().await;
    }
}
