use std::os::unix::fs::MetadataExt;
use std::sync::Arc;
use std::time::SystemTime;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::ticker::{Clock, Subscriber};

/// Resolves the current slow log path.
pub type FilenameFn = Arc<dyn Fn() -> BoxFuture<'static, Result<String>> + Send + Sync>;

/// One unit of work: a time range and, for slow logs, a byte range.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Interval {
    pub number: u64,
    pub start_time: DateTime<Utc>,
    pub stop_time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub filename: String,
    #[serde(default)]
    pub start_offset: u64,
    #[serde(default)]
    pub end_offset: u64,
}

/// Identity and size of the slow log at one tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileInfo {
    pub path: String,
    pub inode: u64,
    pub size: u64,
}

impl FileInfo {
    pub async fn stat(path: &str) -> Result<Self> {
        let meta = tokio::fs::metadata(path)
            .await
            .with_context(|| format!("stat {path}"))?;
        Ok(Self {
            path: path.to_string(),
            inode: meta.ino(),
            size: meta.len(),
        })
    }
}

/// Turns ticks into contiguous intervals.
///
/// The first tick only records the starting point. Each following tick
/// yields an interval from the previous tick; for slow logs its byte range
/// starts where the previous one ended, or at 0 if the file was replaced.
#[derive(Debug, Default)]
pub struct IntervalState {
    number: u64,
    last_tick: Option<DateTime<Utc>>,
    last_file: Option<FileInfo>,
}

impl IntervalState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Time-only interval, for performance schema collection.
    pub fn next_time(&mut self, tick: DateTime<Utc>) -> Option<Interval> {
        let start = self.last_tick.replace(tick)?;

        self.number += 1;
        Some(Interval {
            number: self.number,
            start_time: start,
            stop_time: tick,
            filename: String::new(),
            start_offset: 0,
            end_offset: 0,
        })
    }

    /// Slow log interval ending at the file's current size.
    pub fn next_file(&mut self, tick: DateTime<Utc>, file: FileInfo) -> Option<Interval> {
        let prev = self.last_file.replace(file.clone());
        let start = self.last_tick.replace(tick)?;

        let start_offset = match prev {
            Some(prev) if prev.path == file.path && prev.inode == file.inode => prev.size,
            Some(prev) => {
                debug!(old = %prev.path, new = %file.path, "slow log replaced, reading from start");
                0
            }
            None => 0,
        };

        self.number += 1;
        Some(Interval {
            number: self.number,
            start_time: start,
            stop_time: tick,
            filename: file.path,
            start_offset,
            end_offset: file.size,
        })
    }
}

/// Tick-driven interval producer of one analyzer.
pub struct Iter {
    clock: Arc<Clock>,
    subscriber: Subscriber,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl Iter {
    /// Subscribe to `interval` second ticks and emit intervals on `out`.
    /// With `filename`, intervals cover the slow log; otherwise time only.
    pub fn start(
        clock: Arc<Clock>,
        interval: u64,
        filename: Option<FilenameFn>,
        out: mpsc::Sender<Interval>,
    ) -> Result<Self> {
        let (subscriber, mut ticks) = mpsc::channel::<SystemTime>(1);
        clock.add(subscriber.clone(), interval)?;

        let cancel = CancellationToken::new();
        let token = cancel.clone();

        let handle = tokio::spawn(async move {
            let mut state = IntervalState::new();

            loop {
                let tick = tokio::select! {
                    _ = token.cancelled() => break,
                    tick = ticks.recv() => match tick {
                        Some(tick) => DateTime::<Utc>::from(tick),
                        None => break,
                    },
                };

                let next = match &filename {
                    None => state.next_time(tick),
                    Some(filename) => match current_file(filename).await {
                        Ok(file) => state.next_file(tick, file),
                        Err(e) => {
                            warn!(error = %format!("{e:#}"), "cannot stat slow log, skipping tick");
                            None
                        }
                    },
                };

                let Some(interval) = next else {
                    continue;
                };

                debug!(
                    number = interval.number,
                    start_offset = interval.start_offset,
                    end_offset = interval.end_offset,
                    "interval"
                );

                if out.try_send(interval).is_err() {
                    warn!("interval queue full, interval dropped");
                }
            }
        });

        Ok(Self {
            clock,
            subscriber,
            cancel,
            handle,
        })
    }

    /// Seconds until the next interval closes.
    pub fn eta(&self) -> Option<f64> {
        self.clock.eta(&self.subscriber)
    }

    pub async fn stop(self) {
        self.clock.remove(&self.subscriber);
        self.cancel.cancel();
        let _ = self.handle.await;
    }
}

async fn current_file(filename: &FilenameFn) -> Result<FileInfo> {
    let path = filename().await?;
    FileInfo::stat(&path).await
}
