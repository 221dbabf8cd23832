//! Slow log worker: parses one interval's byte range of the slow log.

pub mod parser;

use std::fs::File;
use std::io::{BufReader, Seek, SeekFrom};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::mysql::Connector;
use crate::qan::aggregator::Aggregator;
use crate::qan::config::QanConfig;
use crate::qan::fingerprint::{class_id, fingerprint};
use crate::qan::iter::Interval;
use crate::qan::worker::WorkerResult;
use crate::status::Status;

pub use parser::SlowLogParser;

/// Outcome of one blocking parse pass.
struct Parsed {
    aggregator: Aggregator,
    stop_offset: u64,
    events: u64,
}

pub struct SlowLogWorker {
    name: String,
    config: QanConfig,
    conn: Arc<dyn Connector>,
    status: Arc<Status>,
    /// Rotated files to delete once parsed.
    old_files: Vec<String>,
    cancel: CancellationToken,
}

impl SlowLogWorker {
    pub fn new(config: QanConfig, conn: Arc<dyn Connector>, status: Arc<Status>) -> Self {
        Self {
            name: config.uuid.clone(),
            config,
            conn,
            status,
            old_files: Vec::new(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn stop_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Last progress published for this worker.
    pub fn status(&self) -> Option<String> {
        self.status.get("qan", &format!("qan-worker-{}", self.name))
    }

    fn set_status(&self, value: &str) {
        self.status
            .update("qan", &format!("qan-worker-{}", self.name), value);
    }

    /// Rotate the slow log when the interval reaches the size limit. The
    /// interval is then redirected to the rotated file, read to its end.
    pub async fn setup(&mut self, interval: &mut Interval) -> Result<()> {
        let max = self.config.max_slow_log_size;
        if max == 0 || interval.end_offset < max || interval.filename.is_empty() {
            return Ok(());
        }

        self.set_status("Rotating slow log");
        let rotated = format!("{}-{}", interval.filename, Utc::now().timestamp());

        self.conn
            .exec(&self.config.stop)
            .await
            .context("running stop queries before rotation")?;

        let renamed = tokio::fs::rename(&interval.filename, &rotated)
            .await
            .with_context(|| format!("renaming {} to {rotated}", interval.filename));

        // Logging resumes even if the rename failed.
        self.conn
            .exec(&self.config.start)
            .await
            .context("running start queries after rotation")?;
        renamed?;

        let size = tokio::fs::metadata(&rotated)
            .await
            .with_context(|| format!("stat {rotated}"))?
            .len();

        info!(file = %rotated, size, "slow log rotated");

        interval.filename = rotated.clone();
        interval.end_offset = size;

        if self.config.remove_old_slow_logs {
            self.old_files.push(rotated);
        }

        Ok(())
    }

    /// Parse `[start_offset, end_offset)` of the interval's file, bounded by
    /// `worker_run_time`.
    pub async fn run(&mut self, interval: &Interval) -> Result<Option<WorkerResult>> {
        let started = Instant::now();
        self.set_status(&format!(
            "Parsing {} {}-{}",
            interval.filename, interval.start_offset, interval.end_offset
        ));

        let path = interval.filename.clone();
        let (start, end) = (interval.start_offset, interval.end_offset);
        let deadline = started + self.config.worker_run_time;
        let cancel = self.cancel.clone();
        let example_queries = self.config.example_queries;

        let parsed = tokio::task::spawn_blocking(move || {
            parse_range(&path, start, end, deadline, &cancel, example_queries)
        })
        .await
        .context("slow log parser panicked")??;

        let res = parsed.aggregator.finalize()?;

        debug!(
            file = %interval.filename,
            events = parsed.events,
            stop_offset = parsed.stop_offset,
            "slow log interval parsed"
        );
        self.set_status("Idle");

        Ok(Some(WorkerResult {
            global: res.global,
            classes: res.classes,
            rate_limit: res.rate_limit,
            stop_offset: parsed.stop_offset,
            run_time: started.elapsed(),
        }))
    }

    /// Delete rotated files that have been parsed.
    pub async fn cleanup(&mut self) -> Result<()> {
        for file in self.old_files.drain(..) {
            tokio::fs::remove_file(&file)
                .await
                .with_context(|| format!("removing old slow log {file}"))?;
            info!(file = %file, "old slow log removed");
        }
        Ok(())
    }
}

fn parse_range(
    path: &str,
    start: u64,
    end: u64,
    deadline: Instant,
    cancel: &CancellationToken,
    example_queries: bool,
) -> Result<Parsed> {
    let mut file = File::open(path).with_context(|| format!("opening {path}"))?;
    let size = file.metadata().with_context(|| format!("stat {path}"))?.len();

    let mut parsed = Parsed {
        aggregator: Aggregator::new(example_queries),
        stop_offset: size,
        events: 0,
    };

    if end < start {
        warn!(file = %path, start, end, "slow log shrank, interval skipped");
        return Ok(parsed);
    }

    file.seek(SeekFrom::Start(start))
        .with_context(|| format!("seeking {path} to {start}"))?;
    let mut parser = SlowLogParser::new(BufReader::new(file), start);

    loop {
        if cancel.is_cancelled() {
            debug!("slow log worker stopped");
            break;
        }
        if Instant::now() >= deadline {
            warn!(file = %path, offset = parser.offset(), "worker run time exceeded, interval cut short");
            break;
        }

        let Some(event) = parser.next_event()? else {
            break;
        };
        if event.offset >= end {
            parsed.stop_offset = event.offset;
            return Ok(parsed);
        }

        let fp = match panic::catch_unwind(AssertUnwindSafe(|| fingerprint(&event.query))) {
            Ok(fp) => fp,
            Err(_) => {
                warn!(offset = event.offset, "cannot fingerprint query, event skipped");
                continue;
            }
        };

        parsed.events += 1;
        parsed.aggregator.add_event(&event, &fp, &class_id(&fp));
    }

    parsed.stop_offset = parser.offset();
    Ok(parsed)
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;
    use crate::mysql::MockConnector;
    use crate::qan::config::CollectFrom;

    const LOG: &str = "# Time: 2023-03-01T10:00:00.000000Z\n\
# User@Host: app[app] @ web1 [10.0.0.5]  Id:     8\n\
# Query_time: 0.500000  Lock_time: 0.000100 Rows_sent: 1  Rows_examined: 1000\n\
SET timestamp=1677664800;\n\
SELECT * FROM orders WHERE id = 42;\n\
# Time: 2023-03-01T10:00:05.000000Z\n\
# User@Host: app[app] @ web1 [10.0.0.5]  Id:     8\n\
# Query_time: 1.250000  Lock_time: 0.000000 Rows_sent: 0  Rows_examined: 5\n\
SET timestamp=1677664805;\n\
SELECT * FROM orders WHERE id = 7;\n";

    fn write_log(dir: &std::path::Path, body: &str) -> String {
        let path = dir.join("slow.log");
        let mut f = File::create(&path).expect("create");
        f.write_all(body.as_bytes()).expect("write");
        path.display().to_string()
    }

    fn worker(conn: Arc<MockConnector>, max_size: u64) -> SlowLogWorker {
        let mut cfg = QanConfig::new("mysql-1", CollectFrom::Slowlog);
        cfg.max_slow_log_size = max_size;
        cfg.start = vec!["SET GLOBAL slow_query_log = ON".into()];
        cfg.stop = vec!["SET GLOBAL slow_query_log = OFF".into()];
        SlowLogWorker::new(cfg, conn, Arc::new(Status::default()))
    }

    fn interval(file: &str, start: u64, end: u64) -> Interval {
        Interval {
            number: 1,
            start_time: Utc::now(),
            stop_time: Utc::now(),
            filename: file.to_string(),
            start_offset: start,
            end_offset: end,
        }
    }

    #[tokio::test]
    async fn test_same_class_aggregates() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let file = write_log(tmp.path(), LOG);
        let conn = Arc::new(MockConnector::new("mysql://localhost/"));

        let mut w = worker(conn, 0);
        let mut i = interval(&file, 0, LOG.len() as u64);
        w.setup(&mut i).await.expect("setup");
        let res = w.run(&i).await.expect("run").expect("result");

        assert_eq!(res.global.total_queries, 2);
        assert_eq!(res.classes.len(), 1);
        assert_eq!(res.classes[0].fingerprint, "select * from orders where id = ?");
        assert_eq!(res.stop_offset, LOG.len() as u64);
    }

    #[tokio::test]
    async fn test_events_at_or_past_end_are_left() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let file = write_log(tmp.path(), LOG);
        let second = LOG.find("# Time: 2023-03-01T10:00:05").expect("second") as u64;
        let conn = Arc::new(MockConnector::new("mysql://localhost/"));

        let mut w = worker(conn, 0);
        let res = w
            .run(&interval(&file, 0, second))
            .await
            .expect("run")
            .expect("result");

        assert_eq!(res.global.total_queries, 1);
        assert_eq!(res.stop_offset, second);
    }

    #[tokio::test]
    async fn test_inverted_range_yields_nothing() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let file = write_log(tmp.path(), LOG);
        let conn = Arc::new(MockConnector::new("mysql://localhost/"));

        let mut w = worker(conn, 0);
        let res = w
            .run(&interval(&file, 5000, 10))
            .await
            .expect("run")
            .expect("result");

        assert_eq!(res.global.total_queries, 0);
        assert!(res.classes.is_empty());
        assert_eq!(res.stop_offset, LOG.len() as u64);
    }

    #[tokio::test]
    async fn test_rotation_renames_and_removes() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let file = write_log(tmp.path(), LOG);
        let conn = Arc::new(MockConnector::new("mysql://localhost/"));

        let mut w = worker(Arc::clone(&conn), 100);
        let mut i = interval(&file, 0, LOG.len() as u64);
        w.setup(&mut i).await.expect("setup");

        assert_ne!(i.filename, file);
        assert!(i.filename.starts_with(&format!("{file}-")));
        assert!(!std::path::Path::new(&file).exists());
        assert_eq!(
            conn.executed(),
            vec!["SET GLOBAL slow_query_log = OFF", "SET GLOBAL slow_query_log = ON"]
        );

        let res = w.run(&i).await.expect("run").expect("result");
        assert_eq!(res.global.total_queries, 2);

        w.cleanup().await.expect("cleanup");
        assert!(!std::path::Path::new(&i.filename).exists());
    }

    #[tokio::test]
    async fn test_stopped_worker_parses_nothing() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let file = write_log(tmp.path(), LOG);
        let conn = Arc::new(MockConnector::new("mysql://localhost/"));

        let mut w = worker(conn, 0);
        w.stop_token().cancel();
        let res = w
            .run(&interval(&file, 0, LOG.len() as u64))
            .await
            .expect("run")
            .expect("result");
        assert_eq!(res.global.total_queries, 0);
        assert_eq!(res.stop_offset, 0);
    }
}
