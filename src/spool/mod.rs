pub mod manager;
pub mod sender;
pub mod stats;

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::health::HealthMetrics;
use crate::status::Status;

pub use manager::Manager;
pub use sender::{HttpTransport, SendError, Sender, Transport};
pub use stats::{SentReport, SenderStats};

/// Pending writes held in memory before producers start losing data.
pub const WRITE_QUEUE_SIZE: usize = 100;

const STATUS_SERVICE: &str = "data";

/// Envelope written for every spooled report.
#[derive(Debug, Serialize)]
struct Record<'a, T: Serialize> {
    service: &'a str,
    created: DateTime<Utc>,
    data: &'a T,
}

struct Entry {
    service: String,
    body: Vec<u8>,
}

/// Durable FIFO of opaque report blobs.
///
/// Producers call [`Spooler::write`], which never blocks: the encoded
/// report goes to a bounded queue drained by a single writer task that
/// persists it under a strictly increasing nanosecond key. Keys continue
/// past the largest entry already on disk. The data dir holds nothing but
/// entries; partial writes are staged in the trash dir.
pub struct Spooler {
    data_dir: PathBuf,
    gzip: AtomicBool,
    tx: mpsc::Sender<Entry>,
    rx: Arc<parking_lot::Mutex<Option<mpsc::Receiver<Entry>>>>,
    writer: Arc<Writer>,
    health: Arc<HealthMetrics>,
    cancel: parking_lot::Mutex<CancellationToken>,
    handle: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for Spooler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Spooler")
            .field("data_dir", &self.data_dir)
            .field("gzip", &self.gzip())
            .finish()
    }
}

impl Spooler {
    pub fn new(
        data_dir: PathBuf,
        trash_dir: PathBuf,
        gzip: bool,
        status: Arc<Status>,
        health: Arc<HealthMetrics>,
    ) -> Self {
        let (tx, rx) = mpsc::channel(WRITE_QUEUE_SIZE);

        Self {
            data_dir: data_dir.clone(),
            gzip: AtomicBool::new(gzip),
            tx,
            rx: Arc::new(parking_lot::Mutex::new(Some(rx))),
            writer: Arc::new(Writer {
                data_dir,
                trash_dir,
                last_key: parking_lot::Mutex::new(0),
                status,
                health: Arc::clone(&health),
            }),
            health,
            cancel: parking_lot::Mutex::new(CancellationToken::new()),
            handle: parking_lot::Mutex::new(None),
        }
    }

    /// Verify the data dir is writable and start the writer task.
    pub fn start(&self) -> Result<()> {
        let Some(mut rx) = self.rx.lock().take() else {
            bail!("spooler already started");
        };

        let cancel = CancellationToken::new();
        *self.cancel.lock() = cancel.clone();
        let rx_slot = Arc::clone(&self.rx);

        if let Err(e) = self.check_dirs() {
            *self.rx.lock() = Some(rx);
            return Err(e);
        }

        let writer = Arc::clone(&self.writer);

        info!(dir = %self.data_dir.display(), gzip = self.gzip(), "spooler started");
        writer.status.update(STATUS_SERVICE, "data-spooler", "Idle");

        let handle = tokio::spawn(async move {
            writer.seed_last_key().await;

            loop {
                let entry = tokio::select! {
                    _ = cancel.cancelled() => break,
                    entry = rx.recv() => match entry {
                        Some(entry) => entry,
                        None => break,
                    },
                };

                writer.persist(entry).await;
            }

            // Drain what is already queued.
            while let Ok(entry) = rx.try_recv() {
                writer.persist(entry).await;
            }

            *rx_slot.lock() = Some(rx);
            writer.status.update(STATUS_SERVICE, "data-spooler", "Stopped");
            debug!("spooler stopped");
        });

        *self.handle.lock() = Some(handle);

        Ok(())
    }

    fn check_dirs(&self) -> Result<()> {
        let trash_dir = &self.writer.trash_dir;
        fs::create_dir_all(&self.data_dir)
            .with_context(|| format!("creating {}", self.data_dir.display()))?;
        fs::create_dir_all(trash_dir)
            .with_context(|| format!("creating {}", trash_dir.display()))?;
        check_writable(trash_dir)?;
        check_writable(&self.data_dir)
    }

    /// Stop the writer after flushing queued entries.
    pub async fn stop(&self) {
        self.cancel.lock().cancel();
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    /// Encode and enqueue a report. Fails without blocking when the queue is
    /// full; the report is then lost.
    pub fn write<T: Serialize>(&self, service: &str, data: &T) -> Result<()> {
        let record = Record {
            service,
            created: Utc::now(),
            data,
        };

        let body = self.encode(&record)?;

        if self
            .tx
            .try_send(Entry {
                service: service.to_string(),
                body,
            })
            .is_err()
        {
            self.health.spool_dropped.inc();
            bail!("spool queue full, {service} data dropped");
        }

        Ok(())
    }

    fn encode<T: Serialize>(&self, record: &T) -> Result<Vec<u8>> {
        let json = serde_json::to_vec(record).context("encoding spool record")?;

        if !self.gzip() {
            return Ok(json);
        }

        let mut encoder = GzEncoder::new(Vec::with_capacity(json.len() / 4), Compression::default());
        encoder.write_all(&json).context("gzip compressing")?;
        encoder.finish().context("finishing gzip stream")
    }

    pub fn gzip(&self) -> bool {
        self.gzip.load(Ordering::Relaxed)
    }

    /// Change the encoding of entries written from now on.
    pub fn set_gzip(&self, gzip: bool) {
        self.gzip.store(gzip, Ordering::Relaxed);
    }

    pub fn is_running(&self) -> bool {
        self.handle.lock().as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Entry names, oldest first.
    pub async fn files(&self) -> Result<Vec<String>> {
        let dir = self.data_dir.clone();
        let keys = tokio::task::spawn_blocking(move || scan(&dir))
            .await
            .context("spool scan task failed")??;
        Ok(keys.into_iter().map(|(_, name)| name).collect())
    }

    pub async fn read(&self, name: &str) -> Result<Vec<u8>> {
        let path = self.data_dir.join(name);
        tokio::fs::read(&path)
            .await
            .with_context(|| format!("reading spool file {}", path.display()))
    }

    pub async fn remove(&self, name: &str) -> Result<()> {
        let path = self.data_dir.join(name);
        tokio::fs::remove_file(&path)
            .await
            .with_context(|| format!("removing spool file {}", path.display()))
    }

    /// Move an entry that cannot be shipped out of the data dir.
    pub async fn trash(&self, name: &str) -> Result<()> {
        let from = self.data_dir.join(name);
        let to = self.writer.trash_dir.join(name);
        tokio::fs::rename(&from, &to)
            .await
            .with_context(|| format!("moving {} to {}", from.display(), to.display()))
    }

    /// Total number and size of spooled entries.
    pub async fn usage(&self) -> Result<(usize, u64)> {
        let dir = self.data_dir.clone();
        tokio::task::spawn_blocking(move || {
            let keys = scan(&dir)?;
            let bytes: u64 = keys
                .iter()
                .filter_map(|(_, name)| fs::metadata(dir.join(name)).ok())
                .map(|meta| meta.len())
                .sum();
            Ok::<_, anyhow::Error>((keys.len(), bytes))
        })
        .await
        .context("spool usage task failed")?
    }
}

/// Single writer behind the spool queue. File operations run on the
/// blocking pool.
struct Writer {
    data_dir: PathBuf,
    trash_dir: PathBuf,
    last_key: parking_lot::Mutex<u128>,
    status: Arc<Status>,
    health: Arc<HealthMetrics>,
}

impl Writer {
    async fn seed_last_key(&self) {
        let dir = self.data_dir.clone();
        match tokio::task::spawn_blocking(move || scan(&dir)).await {
            Ok(Ok(keys)) => {
                if let Some((newest, _)) = keys.last() {
                    let mut last = self.last_key.lock();
                    *last = (*last).max(*newest);
                    debug!(entries = keys.len(), last_key = %*last, "spool resumed");
                }
            }
            Ok(Err(e)) => warn!(error = %format!("{e:#}"), "cannot scan spool"),
            Err(e) => warn!(error = %e, "spool scan task failed"),
        }
    }

    async fn persist(self: &Arc<Self>, entry: Entry) {
        let this = Arc::clone(self);
        if let Err(e) = tokio::task::spawn_blocking(move || this.persist_blocking(entry)).await {
            error!(critical = true, error = %e, "spool write task failed");
        }
    }

    fn persist_blocking(&self, entry: Entry) {
        let key = next_key(&self.last_key).to_string();
        let staged = self.trash_dir.join(format!("{key}.tmp"));
        let target = self.data_dir.join(&key);

        self.status
            .update(STATUS_SERVICE, "data-spooler", format!("Writing {}", entry.service));

        let res = fs::write(&staged, &entry.body)
            .with_context(|| format!("writing {}", staged.display()))
            .and_then(|()| {
                fs::rename(&staged, &target)
                    .with_context(|| format!("moving {} into spool", staged.display()))
            });

        match res {
            Ok(()) => {
                self.health.spool_files_written.inc();
                debug!(service = %entry.service, file = %key, bytes = entry.body.len(), "spooled");
            }
            Err(e) => {
                let _ = fs::remove_file(&staged);
                error!(service = %entry.service, error = %format!("{e:#}"), "failed to spool data");
            }
        }

        self.status.update(STATUS_SERVICE, "data-spooler", "Idle");
    }
}

/// Numeric entry names in `dir` with their keys, oldest first.
fn scan(dir: &Path) -> Result<Vec<(u128, String)>> {
    let mut keys = Vec::new();

    for entry in fs::read_dir(dir).with_context(|| format!("reading {}", dir.display()))? {
        let name = entry?.file_name();
        let Some(name) = name.to_str() else {
            continue;
        };
        if let Ok(key) = name.parse::<u128>() {
            keys.push((key, name.to_string()));
        }
    }

    keys.sort_unstable();
    Ok(keys)
}

/// Next key: current time in nanoseconds, bumped past the previous key.
fn next_key(last_key: &parking_lot::Mutex<u128>) -> u128 {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);

    let mut last = last_key.lock();
    let key = now.max(*last + 1);
    *last = key;
    key
}

fn check_writable(dir: &Path) -> Result<()> {
    let probe = dir.join(".probe");
    fs::write(&probe, b"").with_context(|| format!("{} is not writable", dir.display()))?;
    fs::remove_file(&probe).with_context(|| format!("removing {}", probe.display()))?;
    Ok(())
}

#[cfg(test)]
pub(crate) mod tests {
    use std::io::Read;
    use std::time::Duration;

    use flate2::read::GzDecoder;

    use super::*;

    pub(crate) fn spooler(dir: &Path, gzip: bool) -> Spooler {
        Spooler::new(
            dir.join("data"),
            dir.join("trash"),
            gzip,
            Arc::new(Status::new(&["data"])),
            Arc::new(HealthMetrics::new("").expect("metrics")),
        )
    }

    pub(crate) async fn wait_for_files(spool: &Spooler, n: usize) -> Vec<String> {
        for _ in 0..200 {
            let files = spool.files().await.expect("files");
            if files.len() >= n {
                return files;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("spool never reached {n} files");
    }

    #[test]
    fn test_next_key_is_strictly_increasing() {
        let last = parking_lot::Mutex::new(0);
        let mut prev = 0;
        for _ in 0..1000 {
            let key = next_key(&last);
            assert!(key > prev);
            prev = key;
        }
    }

    #[tokio::test]
    async fn test_write_read_plain() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let spool = spooler(tmp.path(), false);
        spool.start().expect("start");

        spool
            .write("qan", &serde_json::json!({"n": 1}))
            .expect("write");

        let files = wait_for_files(&spool, 1).await;
        let body = spool.read(&files[0]).await.expect("read");
        let value: serde_json::Value = serde_json::from_slice(&body).expect("json");
        assert_eq!(value["service"], "qan");
        assert_eq!(value["data"]["n"], 1);

        spool.remove(&files[0]).await.expect("remove");
        assert!(spool.files().await.expect("files").is_empty());
        spool.stop().await;
    }

    #[tokio::test]
    async fn test_write_gzip() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let spool = spooler(tmp.path(), true);
        spool.start().expect("start");

        spool.write("qan", &"hello").expect("write");
        let files = wait_for_files(&spool, 1).await;
        let body = spool.read(&files[0]).await.expect("read");
        assert_eq!(&body[..2], &[0x1f, 0x8b]);

        let mut json = String::new();
        GzDecoder::new(&body[..])
            .read_to_string(&mut json)
            .expect("gunzip");
        assert!(json.contains(r#""data":"hello""#));
        spool.stop().await;
    }

    #[tokio::test]
    async fn test_files_are_ordered_and_data_dir_is_clean() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let spool = spooler(tmp.path(), false);
        spool.start().expect("start");

        for n in 0..5 {
            spool.write("qan", &n).expect("write");
        }

        let files = wait_for_files(&spool, 5).await;
        for (n, name) in files.iter().enumerate() {
            let value: serde_json::Value =
                serde_json::from_slice(&spool.read(name).await.expect("read")).expect("json");
            assert_eq!(value["data"], n);
        }

        let stray = fs::read_dir(tmp.path().join("data"))
            .expect("read_dir")
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().parse::<u128>().is_err())
            .count();
        assert_eq!(stray, 0);
        spool.stop().await;
    }

    #[tokio::test]
    async fn test_write_never_blocks_when_full() {
        let tmp = tempfile::tempdir().expect("tempdir");
        // Not started: nothing drains the queue.
        let spool = spooler(tmp.path(), false);

        for n in 0..WRITE_QUEUE_SIZE {
            spool.write("qan", &n).expect("queued");
        }

        let err = spool.write("qan", &"overflow").expect_err("queue full");
        assert!(err.to_string().contains("dropped"));
    }

    #[tokio::test]
    async fn test_restart_after_stop() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let spool = spooler(tmp.path(), false);
        spool.start().expect("start");
        assert!(spool.start().is_err());
        spool.stop().await;
        assert!(!spool.is_running());

        spool.start().expect("restart");
        spool.set_gzip(true);
        spool.write("qan", &1).expect("write");
        let files = wait_for_files(&spool, 1).await;
        assert!(spool.read(&files[0]).await.expect("read").starts_with(&[0x1f, 0x8b]));
        spool.stop().await;
    }

    #[tokio::test]
    async fn test_trash_moves_entry() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let spool = spooler(tmp.path(), false);
        spool.start().expect("start");

        spool.write("qan", &1).expect("write");
        let files = wait_for_files(&spool, 1).await;
        spool.trash(&files[0]).await.expect("trash");
        assert!(spool.files().await.expect("files").is_empty());
        assert!(tmp.path().join("trash").join(&files[0]).exists());
        spool.stop().await;
    }

    #[tokio::test]
    async fn test_keys_continue_past_existing_entries() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let data = tmp.path().join("data");
        fs::create_dir_all(&data).expect("mkdir");

        // Left by a previous run whose clock was far ahead of ours.
        let old_key: u128 = 9_000_000_000_000_000_000_000;
        fs::write(data.join(old_key.to_string()), b"{\"data\":\"old\"}").expect("seed");

        let spool = spooler(tmp.path(), false);
        spool.start().expect("start");
        spool.write("qan", &"new").expect("write");

        let files = wait_for_files(&spool, 2).await;
        assert_eq!(files[0], old_key.to_string());
        assert!(files[1].parse::<u128>().expect("key") > old_key);

        let newest: serde_json::Value =
            serde_json::from_slice(&spool.read(&files[1]).await.expect("read")).expect("json");
        assert_eq!(newest["data"], "new");

        let (count, bytes) = spool.usage().await.expect("usage");
        assert_eq!(count, 2);
        assert!(bytes > 0);
        spool.stop().await;
    }
}
