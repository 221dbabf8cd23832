//! Query metrics from `performance_schema.events_statements_summary_by_digest`.
//!
//! The table holds cumulative counters, so each run diffs the current
//! snapshot against the previous one. The first run only records.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::mysql::{Connector, DigestRow};
use crate::qan::class::{Class, Stats};
use crate::qan::iter::Interval;
use crate::qan::worker::WorkerResult;
use crate::status::Status;

/// Rows handled between two cancellation checks.
const ROW_BATCH: usize = 100;

const PICOSECONDS: f64 = 1e12;

type Snapshot = HashMap<(String, String), DigestRow>;

pub struct PerfSchemaWorker {
    name: String,
    conn: Arc<dyn Connector>,
    status: Arc<Status>,
    prev: Option<Snapshot>,
    cancel: CancellationToken,
}

impl PerfSchemaWorker {
    pub fn new(name: &str, conn: Arc<dyn Connector>, status: Arc<Status>) -> Self {
        Self {
            name: name.to_string(),
            conn,
            status,
            prev: None,
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

    /// Diff the current snapshot against the previous run's. `None` on the
    /// first run or when stopped.
    pub async fn run(&mut self, interval: &Interval) -> Result<Option<WorkerResult>> {
        let started = Instant::now();
        self.set_status(&format!("Reading digests for interval {}", interval.number));

        let rows = tokio::select! {
            _ = self.cancel.cancelled() => {
                debug!("perfschema worker stopped");
                self.set_status("Idle");
                return Ok(None);
            }
            rows = self.conn.digest_rows() => rows.context("reading performance schema digests")?,
        };

        let curr: Snapshot = rows
            .into_iter()
            .map(|r| ((r.schema.clone(), r.digest.clone()), r))
            .collect();

        let Some(prev) = self.prev.replace(curr) else {
            debug!(digests = self.prev.as_ref().map_or(0, HashMap::len), "first snapshot recorded");
            self.set_status("Idle");
            return Ok(None);
        };

        let curr: Vec<&DigestRow> = self
            .prev
            .as_ref()
            .map(|c| c.values().collect())
            .unwrap_or_default();

        let mut by_digest: BTreeMap<&str, Vec<DigestRow>> = BTreeMap::new();
        for batch in curr.chunks(ROW_BATCH) {
            if self.cancel.is_cancelled() {
                debug!("perfschema worker stopped");
                self.set_status("Idle");
                return Ok(None);
            }

            for row in batch {
                let Some(old) = prev.get(&(row.schema.clone(), row.digest.clone())) else {
                    continue;
                };
                if let Some(delta) = row_delta(old, row) {
                    by_digest.entry(row.digest.as_str()).or_default().push(delta);
                }
            }
        }

        let mut global = Class::default();
        let classes: Vec<Class> = by_digest
            .values()
            .map(|rows| digest_class(rows))
            .inspect(|c| global.merge(c))
            .collect();

        self.set_status("Idle");

        Ok(Some(WorkerResult {
            global,
            classes,
            rate_limit: 0,
            stop_offset: 0,
            run_time: started.elapsed(),
        }))
    }
}

/// Per-interval counters of one `(schema, digest)` row; `None` when the
/// statement did not run.
fn row_delta(prev: &DigestRow, curr: &DigestRow) -> Option<DigestRow> {
    if curr.count_star <= prev.count_star {
        return None;
    }

    let d = |c: u64, p: u64| c.saturating_sub(p);

    Some(DigestRow {
        schema: curr.schema.clone(),
        digest: curr.digest.clone(),
        digest_text: curr.digest_text.clone(),
        count_star: d(curr.count_star, prev.count_star),
        sum_timer_wait: d(curr.sum_timer_wait, prev.sum_timer_wait),
        // Extremes and averages are not windowed by the server.
        min_timer_wait: curr.min_timer_wait,
        avg_timer_wait: curr.avg_timer_wait,
        max_timer_wait: curr.max_timer_wait,
        sum_lock_time: d(curr.sum_lock_time, prev.sum_lock_time),
        sum_errors: d(curr.sum_errors, prev.sum_errors),
        sum_warnings: d(curr.sum_warnings, prev.sum_warnings),
        sum_rows_affected: d(curr.sum_rows_affected, prev.sum_rows_affected),
        sum_rows_sent: d(curr.sum_rows_sent, prev.sum_rows_sent),
        sum_rows_examined: d(curr.sum_rows_examined, prev.sum_rows_examined),
        sum_created_tmp_disk_tables: d(
            curr.sum_created_tmp_disk_tables,
            prev.sum_created_tmp_disk_tables,
        ),
        sum_created_tmp_tables: d(curr.sum_created_tmp_tables, prev.sum_created_tmp_tables),
        sum_select_full_join: d(curr.sum_select_full_join, prev.sum_select_full_join),
        sum_select_scan: d(curr.sum_select_scan, prev.sum_select_scan),
        sum_sort_merge_passes: d(curr.sum_sort_merge_passes, prev.sum_sort_merge_passes),
        sum_no_index_used: d(curr.sum_no_index_used, prev.sum_no_index_used),
        sum_no_good_index_used: d(curr.sum_no_good_index_used, prev.sum_no_good_index_used),
    })
}

/// Class id of a digest: its first 16 hex digits, upper case.
pub fn digest_class_id(digest: &str) -> String {
    digest.get(..16).unwrap_or(digest).to_ascii_uppercase()
}

/// One class from the deltas of every schema that ran the digest.
///
/// Sums add; the min is the smallest min, the max the largest max and the
/// average the mean of the per-schema averages.
fn digest_class(rows: &[DigestRow]) -> Class {
    let first = &rows[0];
    let mut class = Class::new(&digest_class_id(&first.digest), &first.digest_text);
    class.total_queries = rows.len() as u64;

    let cnt: u64 = rows.iter().map(|r| r.count_star).sum();
    class.query_count = cnt;

    let sum = |f: fn(&DigestRow) -> u64| rows.iter().map(f).sum::<u64>();

    let mut qt = Stats::from_total(cnt, sum(|r| r.sum_timer_wait) as f64 / PICOSECONDS);
    qt.min = rows.iter().map(|r| r.min_timer_wait).min().unwrap_or(0) as f64 / PICOSECONDS;
    qt.max = rows.iter().map(|r| r.max_timer_wait).max().unwrap_or(0) as f64 / PICOSECONDS;
    qt.avg = rows.iter().map(|r| r.avg_timer_wait as f64).sum::<f64>()
        / rows.len() as f64
        / PICOSECONDS;

    let m = &mut class.metrics;
    m.time_metrics.insert("Query_time".into(), qt);
    m.time_metrics.insert(
        "Lock_time".into(),
        Stats::from_total(cnt, sum(|r| r.sum_lock_time) as f64 / PICOSECONDS),
    );

    let numbers: [(&str, fn(&DigestRow) -> u64); 12] = [
        ("Errors", |r| r.sum_errors),
        ("Warnings", |r| r.sum_warnings),
        ("Rows_affected", |r| r.sum_rows_affected),
        ("Rows_sent", |r| r.sum_rows_sent),
        ("Rows_examined", |r| r.sum_rows_examined),
        ("Tmp_disk_tables", |r| r.sum_created_tmp_disk_tables),
        ("Tmp_tables", |r| r.sum_created_tmp_tables),
        ("Full_join", |r| r.sum_select_full_join),
        ("Full_scan", |r| r.sum_select_scan),
        ("Merge_passes", |r| r.sum_sort_merge_passes),
        ("No_index_used", |r| r.sum_no_index_used),
        ("No_good_index_used", |r| r.sum_no_good_index_used),
    ];
    for (name, f) in numbers {
        m.number_metrics
            .insert(name.to_string(), Stats::from_total(cnt, sum(f) as f64));
    }

    class
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::mysql::MockConnector;

    fn row(schema: &str, digest: &str, count: u64) -> DigestRow {
        DigestRow {
            schema: schema.into(),
            digest: digest.into(),
            digest_text: format!("SELECT `{digest}`"),
            count_star: count,
            sum_timer_wait: count * 2_000_000_000,
            min_timer_wait: 1_000_000_000,
            avg_timer_wait: 2_000_000_000,
            max_timer_wait: 3_000_000_000,
            sum_rows_examined: count * 10,
            ..Default::default()
        }
    }

    fn interval() -> Interval {
        Interval {
            number: 1,
            start_time: Utc::now(),
            stop_time: Utc::now(),
            filename: String::new(),
            start_offset: 0,
            end_offset: 0,
        }
    }

    fn worker(conn: &Arc<MockConnector>) -> PerfSchemaWorker {
        let conn: Arc<dyn Connector> = Arc::clone(conn) as Arc<dyn Connector>;
        PerfSchemaWorker::new("mysql-1", conn, Arc::new(Status::default()))
    }

    #[tokio::test]
    async fn test_first_run_has_no_result() {
        let conn = Arc::new(MockConnector::new("mysql://localhost/"));
        conn.push_snapshot(vec![row("s", "d1", 10), row("s", "d2", 5), row("s", "d3", 1)]);

        let mut w = worker(&conn);
        assert!(w.run(&interval()).await.expect("run").is_none());
    }

    #[tokio::test]
    async fn test_delta_between_snapshots() {
        let conn = Arc::new(MockConnector::new("mysql://localhost/"));
        conn.push_snapshot(vec![row("s", "d1", 10)]);
        conn.push_snapshot(vec![row("s", "d1", 12)]);

        let mut w = worker(&conn);
        w.run(&interval()).await.expect("first run");
        let res = w.run(&interval()).await.expect("second run").expect("result");

        assert_eq!(res.classes.len(), 1);
        let c = &res.classes[0];
        assert_eq!(c.total_queries, 1);
        assert_eq!(c.query_count, 2);
        let qt = &c.metrics.time_metrics["Query_time"];
        assert_eq!(qt.cnt, 2);
        assert!((qt.sum - 0.004).abs() < 1e-12);
        assert_eq!(c.metrics.number_metrics["Rows_examined"].sum, 20.0);
        assert_eq!(res.global.query_count, 2);
    }

    #[tokio::test]
    async fn test_unchanged_and_new_rows_are_skipped() {
        let conn = Arc::new(MockConnector::new("mysql://localhost/"));
        conn.push_snapshot(vec![row("s", "d1", 10), row("s", "d2", 4)]);
        conn.push_snapshot(vec![row("s", "d1", 10), row("s", "d2", 6), row("s", "d9", 3)]);

        let mut w = worker(&conn);
        w.run(&interval()).await.expect("first run");
        let res = w.run(&interval()).await.expect("second run").expect("result");

        assert_eq!(res.classes.len(), 1);
        assert_eq!(res.classes[0].fingerprint, "SELECT `d2`");
    }

    #[test]
    fn test_cross_schema_aggregation() {
        let mut a = row("s1", "0123456789abcdef0123", 2);
        a.min_timer_wait = 500_000_000;
        a.avg_timer_wait = 1_000_000_000;
        let mut b = row("s2", "0123456789abcdef0123", 4);
        b.max_timer_wait = 9_000_000_000;
        b.avg_timer_wait = 3_000_000_000;

        let c = digest_class(&[a, b]);
        assert_eq!(c.id, "0123456789ABCDEF");
        assert_eq!(c.total_queries, 2);
        assert_eq!(c.query_count, 6);

        let qt = &c.metrics.time_metrics["Query_time"];
        assert_eq!(qt.min, 0.0005);
        assert_eq!(qt.max, 0.009);
        assert_eq!(qt.avg, 0.002);
        assert!((qt.sum - 0.012).abs() < 1e-12);
    }
}
