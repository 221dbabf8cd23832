use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use chrono::Utc;
use futures::future::BoxFuture;
use reqwest::header::{CONTENT_ENCODING, CONTENT_TYPE};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use super::manager::{usage_string, USAGE_FIELD};
use super::stats::{SenderStats, SentInfo, SentReport};
use super::Spooler;
use crate::backoff::Backoff;
use crate::config::API_KEY_HEADER;
use crate::health::HealthMetrics;
use crate::status::Status;

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];
const STATUS_SERVICE: &str = "data";

/// Why a spool entry was not acknowledged.
#[derive(Debug, Error)]
pub enum SendError {
    #[error("API returned status {0}")]
    Api(u16),

    #[error("request timed out")]
    Timeout,

    #[error("transport error: {0}")]
    Transport(String),
}

/// Destination of spool entries.
pub trait Transport: Send + Sync {
    /// Deliver one entry; `Ok` only on acknowledgment.
    fn post<'a>(&'a self, body: &'a [u8], gzip: bool) -> BoxFuture<'a, Result<(), SendError>>;
}

/// Posts entries to the agent's data link.
pub struct HttpTransport {
    http: reqwest::Client,
    url: Url,
    api_key: String,
}

impl HttpTransport {
    pub fn new(url: Url, api_key: &str, timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("building HTTP client")?;

        Ok(Self {
            http,
            url,
            api_key: api_key.to_string(),
        })
    }
}

impl Transport for HttpTransport {
    fn post<'a>(&'a self, body: &'a [u8], gzip: bool) -> BoxFuture<'a, Result<(), SendError>> {
        Box::pin(async move {
            let mut req = self
                .http
                .post(self.url.clone())
                .header(CONTENT_TYPE, "application/json")
                .header(API_KEY_HEADER, &self.api_key)
                .body(body.to_vec());

            if gzip {
                req = req.header(CONTENT_ENCODING, "gzip");
            }

            let resp = req.send().await.map_err(|e| {
                if e.is_timeout() {
                    SendError::Timeout
                } else {
                    SendError::Transport(e.to_string())
                }
            })?;

            let status = resp.status();
            if !status.is_success() {
                return Err(SendError::Api(status.as_u16()));
            }

            Ok(())
        })
    }
}

/// Appends entries to a local file instead of sending them.
pub struct BlackholeTransport {
    path: PathBuf,
}

impl BlackholeTransport {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }
}

impl Transport for BlackholeTransport {
    fn post<'a>(&'a self, body: &'a [u8], _gzip: bool) -> BoxFuture<'a, Result<(), SendError>> {
        Box::pin(async move {
            let mut line = Vec::with_capacity(body.len() + 1);
            line.extend_from_slice(body);
            line.push(b'\n');

            let mut file = tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.path)
                .await
                .map_err(|e| SendError::Transport(e.to_string()))?;
            file.write_all(&line)
                .await
                .map_err(|e| SendError::Transport(e.to_string()))
        })
    }
}

/// Ships spool entries oldest-first on its own ticker.
///
/// A pass stops at the first entry that is not acknowledged so the next
/// pass retries it first; entries are removed only after acknowledgment.
/// Consecutive failing passes back off before the next attempt.
pub struct Sender {
    spool: Arc<Spooler>,
    transport: Arc<dyn Transport>,
    interval: Duration,
    stats: Arc<parking_lot::Mutex<SenderStats>>,
    status: Arc<Status>,
    health: Arc<HealthMetrics>,
    cancel: CancellationToken,
    handle: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl Sender {
    pub fn new(
        spool: Arc<Spooler>,
        transport: Arc<dyn Transport>,
        interval: Duration,
        stats_window: Duration,
        status: Arc<Status>,
        health: Arc<HealthMetrics>,
    ) -> Self {
        Self {
            spool,
            transport,
            interval,
            stats: Arc::new(parking_lot::Mutex::new(SenderStats::new(stats_window))),
            status,
            health,
            cancel: CancellationToken::new(),
            handle: parking_lot::Mutex::new(None),
        }
    }

    /// Start the background shipping loop.
    pub fn start(self: &Arc<Self>) {
        let this = Arc::clone(self);
        let cancel = self.cancel.clone();

        info!(interval = ?self.interval, "data sender started");
        self.status.update(STATUS_SERVICE, "data-sender", "Idle");

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(this.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            let mut backoff = Backoff::new();

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }

                match this.send_all().await {
                    Ok(_) => backoff.success(),
                    Err(e) => {
                        let wait = backoff.wait_time();
                        warn!(error = %e, retry_in = ?wait, "data send failed");
                        this.status.update(
                            STATUS_SERVICE,
                            "data-sender",
                            format!("Waiting {}s to retry after error: {e}", wait.as_secs()),
                        );

                        tokio::select! {
                            _ = cancel.cancelled() => break,
                            _ = tokio::time::sleep(wait) => {}
                        }
                    }
                }

                this.publish_usage().await;
                this.status.update(STATUS_SERVICE, "data-sender", "Idle");
            }

            this.status.update(STATUS_SERVICE, "data-sender", "Stopped");
            debug!("data sender stopped");
        });

        *self.handle.lock() = Some(handle);
    }

    pub async fn stop(&self) {
        self.cancel.cancel();
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    /// One pass over the spool. Returns the number of entries shipped, or
    /// the error of the first entry that was not acknowledged.
    pub async fn send_all(&self) -> Result<u64, SendError> {
        let files = self
            .spool
            .files()
            .await
            .map_err(|e| SendError::Transport(format!("{e:#}")))?;

        if files.is_empty() {
            return Ok(0);
        }

        let begin = Utc::now();
        let started = Instant::now();
        let mut info = SentInfo {
            begin,
            ..Default::default()
        };
        let mut result = Ok(());

        for name in files {
            if self.cancel.is_cancelled() {
                break;
            }

            self.status
                .update(STATUS_SERVICE, "data-sender", format!("Sending {name}"));

            let body = match self.spool.read(&name).await {
                Ok(body) => body,
                Err(e) => {
                    warn!(file = %name, error = %format!("{e:#}"), "unreadable spool file, moving to trash");
                    info.bad_files += 1;
                    if let Err(e) = self.spool.trash(&name).await {
                        warn!(file = %name, error = %format!("{e:#}"), "failed to trash spool file");
                    }
                    continue;
                }
            };

            let gzip = body.starts_with(&GZIP_MAGIC);

            match self.transport.post(&body, gzip).await {
                Ok(()) => {
                    info.files += 1;
                    info.bytes += body.len() as u64;
                    self.health.spool_files_sent.inc();
                    self.health.spool_bytes_sent.inc_by(body.len() as f64);

                    if let Err(e) = self.spool.remove(&name).await {
                        warn!(file = %name, error = %format!("{e:#}"), "sent file not removed");
                    }
                }
                Err(e) => {
                    match e {
                        SendError::Api(_) => info.api_errs += 1,
                        SendError::Timeout => info.timeouts += 1,
                        SendError::Transport(_) => info.errs += 1,
                    }
                    self.health.spool_send_errors.inc();
                    result = Err(e);
                    break;
                }
            }
        }

        info.end = begin
            + chrono::Duration::from_std(started.elapsed()).unwrap_or(chrono::Duration::zero());
        let sent = info.files;
        self.stats.lock().sent(info);

        result.map(|()| sent)
    }

    async fn publish_usage(&self) {
        match self.spool.usage().await {
            Ok(usage) => self.status.update(STATUS_SERVICE, USAGE_FIELD, usage_string(usage)),
            Err(e) => debug!(error = %format!("{e:#}"), "cannot measure spool"),
        }
    }

    pub fn report(&self) -> SentReport {
        self.stats.lock().report()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spool::tests::{spooler, wait_for_files};

    struct FailOn(&'static str);

    impl Transport for FailOn {
        fn post<'a>(&'a self, body: &'a [u8], _gzip: bool) -> BoxFuture<'a, Result<(), SendError>> {
            Box::pin(async move {
                if String::from_utf8_lossy(body).contains(self.0) {
                    Err(SendError::Api(500))
                } else {
                    Ok(())
                }
            })
        }
    }

    #[tokio::test]
    async fn test_unreadable_file_goes_to_trash() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let spool = Arc::new(spooler(tmp.path(), false));
        spool.start().expect("start");
        spool.write("qan", &"ok").expect("write");
        let files = wait_for_files(&spool, 1).await;

        // A directory under an entry name cannot be read as a file.
        std::fs::create_dir(tmp.path().join("data").join("1")).expect("mkdir");

        let sender = Sender::new(
            Arc::clone(&spool),
            Arc::new(FailOn("never")),
            Duration::from_secs(60),
            Duration::from_secs(60),
            Arc::new(Status::new(&["data"])),
            Arc::new(HealthMetrics::new("").expect("metrics")),
        );

        assert_eq!(sender.send_all().await.expect("pass"), 1);
        assert!(spool.files().await.expect("files").is_empty());
        assert!(!tmp.path().join("data").join(&files[0]).exists());

        let report = sender.report();
        assert_eq!(report.bad_files, 1);
        assert_eq!(report.files, 1);
        spool.stop().await;
    }

    #[tokio::test]
    async fn test_api_error_is_counted() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let spool = Arc::new(spooler(tmp.path(), false));
        spool.start().expect("start");
        spool.write("qan", &"bad").expect("write");
        wait_for_files(&spool, 1).await;

        let sender = Sender::new(
            Arc::clone(&spool),
            Arc::new(FailOn("bad")),
            Duration::from_secs(60),
            Duration::from_secs(60),
            Arc::new(Status::new(&["data"])),
            Arc::new(HealthMetrics::new("").expect("metrics")),
        );

        let err = sender.send_all().await.expect_err("api error");
        assert!(matches!(err, SendError::Api(500)));
        assert_eq!(spool.files().await.expect("files").len(), 1);
        assert_eq!(sender.report().api_errs, 1);
        spool.stop().await;
    }

    #[tokio::test]
    async fn test_blackhole_appends() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let path = tmp.path().join("blackhole");
        let transport = BlackholeTransport::new(path.clone());
        transport.post(b"one", false).await.expect("post");
        transport.post(b"two", false).await.expect("post");
        assert_eq!(std::fs::read_to_string(path).expect("read"), "one\ntwo\n");
    }
}
