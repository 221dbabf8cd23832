use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use percona_agent::health::HealthMetrics;
use percona_agent::spool::{SendError, Sender, Spooler, Transport};
use percona_agent::status::Status;

/// Acknowledges everything except entries containing `fail_on`, until
/// healed. Records every body it was offered.
struct Flaky {
    fail_on: &'static str,
    healed: AtomicBool,
    seen: parking_lot::Mutex<Vec<String>>,
}

impl Transport for Flaky {
    fn post<'a>(&'a self, body: &'a [u8], _gzip: bool) -> BoxFuture<'a, Result<(), SendError>> {
        Box::pin(async move {
            let body = String::from_utf8_lossy(body).to_string();
            let fail = !self.healed.load(Ordering::SeqCst) && body.contains(self.fail_on);
            self.seen.lock().push(body);
            if fail {
                Err(SendError::Api(503))
            } else {
                Ok(())
            }
        })
    }
}

fn data_of(body: &str) -> String {
    let value: serde_json::Value = serde_json::from_str(body).expect("json");
    value["data"].as_str().expect("string data").to_string()
}

async fn wait_for_files(spool: &Spooler, n: usize) -> Vec<String> {
    for _ in 0..200 {
        let files = spool.files().await.expect("files");
        if files.len() >= n {
            return files;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("spool never reached {n} files");
}

#[tokio::test]
async fn test_failed_entry_blocks_later_ones_and_is_retried_first() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let status = Arc::new(Status::new(&["data"]));
    let health = Arc::new(HealthMetrics::new("").expect("metrics"));
    let spool = Arc::new(Spooler::new(
        tmp.path().join("data"),
        tmp.path().join("trash"),
        false,
        Arc::clone(&status),
        Arc::clone(&health),
    ));
    spool.start().expect("start");

    for name in ["A", "B", "C"] {
        spool.write("qan", &name).expect("write");
    }
    let files = wait_for_files(&spool, 3).await;

    let transport = Arc::new(Flaky {
        fail_on: r#""data":"B""#,
        healed: AtomicBool::new(false),
        seen: parking_lot::Mutex::new(Vec::new()),
    });
    let sender = Sender::new(
        Arc::clone(&spool),
        transport.clone(),
        Duration::from_secs(60),
        Duration::from_secs(3600),
        status,
        Arc::clone(&health),
    );

    let err = sender.send_all().await.expect_err("B fails");
    assert!(matches!(err, SendError::Api(503)));
    assert_eq!(spool.files().await.expect("files"), files[1..].to_vec());

    transport.healed.store(true, Ordering::SeqCst);
    assert_eq!(sender.send_all().await.expect("retry"), 2);
    assert!(spool.files().await.expect("files").is_empty());

    let order: Vec<String> = transport.seen.lock().iter().map(|b| data_of(b)).collect();
    assert_eq!(order, ["A", "B", "B", "C"]);
    assert_eq!(health.spool_files_sent.get(), 3.0);
    assert_eq!(health.spool_send_errors.get(), 1.0);

    spool.stop().await;
}
