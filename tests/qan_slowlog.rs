use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use percona_agent::mysql::{Connector, MockConnector};
use percona_agent::qan::{make_report, CollectFrom, Interval, QanConfig, SlowLogWorker};
use percona_agent::status::Status;

const FIXTURE_SIZE: u64 = 524;
const SECOND_EVENT: u64 = 359;

fn fixture() -> String {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("tests/fixtures/slow001.log")
        .display()
        .to_string()
}

fn config() -> QanConfig {
    let mut cfg = QanConfig::new("mysql-1", CollectFrom::Slowlog);
    cfg.example_queries = true;
    cfg
}

fn interval(start: u64, end: u64) -> Interval {
    Interval {
        number: 1,
        start_time: Utc::now(),
        stop_time: Utc::now(),
        filename: fixture(),
        start_offset: start,
        end_offset: end,
    }
}

fn worker(cfg: &QanConfig) -> SlowLogWorker {
    let conn: Arc<dyn Connector> = Arc::new(MockConnector::new("mysql://localhost/"));
    SlowLogWorker::new(cfg.clone(), conn, Arc::new(Status::default()))
}

#[test]
fn test_fixture_layout() {
    let raw = std::fs::read(fixture()).expect("fixture");
    assert_eq!(raw.len() as u64, FIXTURE_SIZE);
    assert!(raw[SECOND_EVENT as usize..].starts_with(b"# Time:"));
}

#[tokio::test]
async fn test_single_interval_parses_whole_file() {
    let cfg = config();
    let mut w = worker(&cfg);
    let mut i = interval(0, FIXTURE_SIZE);

    w.setup(&mut i).await.expect("setup");
    let res = w.run(&i).await.expect("run").expect("result");
    assert_eq!(res.global.total_queries, 2);
    assert_eq!(res.classes.len(), 2);

    let report = make_report(&cfg, &i, res);
    assert_eq!(report.stop_offset, FIXTURE_SIZE);
    assert_eq!(report.global.total_queries, 2);
    assert_eq!(report.class.len(), 2);
    assert!(report
        .class
        .iter()
        .all(|c| c.example.as_ref().is_some_and(|e| !e.query.is_empty())));
}

#[tokio::test]
async fn test_resume_at_second_event() {
    let cfg = config();
    let mut w = worker(&cfg);

    let res = w
        .run(&interval(SECOND_EVENT, FIXTURE_SIZE))
        .await
        .expect("run")
        .expect("result");

    assert_eq!(res.global.total_queries, 1);
    assert_eq!(res.classes.len(), 1);
    assert_eq!(res.classes[0].fingerprint, "select sleep(?) from test.n where a=?");
    assert_eq!(res.stop_offset, FIXTURE_SIZE);
}

#[tokio::test]
async fn test_first_interval_stops_at_second_event() {
    let cfg = config();
    let mut w = worker(&cfg);

    let res = w
        .run(&interval(0, SECOND_EVENT))
        .await
        .expect("run")
        .expect("result");

    assert_eq!(res.global.total_queries, 1);
    assert_eq!(res.classes[0].fingerprint, "select sleep(?) from n");
    assert_eq!(res.stop_offset, SECOND_EVENT);
}
