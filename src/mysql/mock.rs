use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::{anyhow, bail, Result};
use futures::future::BoxFuture;
use parking_lot::Mutex;

use super::{ConnectionFactory, Connector, DigestRow};

/// Scripted [`Connector`] for tests.
///
/// Uptimes and digest snapshots are served in the order they were queued;
/// the last uptime repeats once the queue runs dry. Executed statements are
/// recorded.
#[derive(Default)]
pub struct MockConnector {
    dsn: String,
    uptimes: Mutex<VecDeque<u64>>,
    last_uptime: Mutex<Option<u64>>,
    snapshots: Mutex<VecDeque<Vec<DigestRow>>>,
    globals: Mutex<HashMap<String, String>>,
    executed: Mutex<Vec<String>>,
    connect_failures: AtomicUsize,
    exec_failures: AtomicUsize,
    connects: AtomicUsize,
    stall_digests: AtomicBool,
    panic_digests: AtomicBool,
}

impl MockConnector {
    pub fn new(dsn: &str) -> Self {
        Self {
            dsn: dsn.to_string(),
            ..Default::default()
        }
    }

    pub fn push_uptime(&self, uptime: u64) {
        self.uptimes.lock().push_back(uptime);
    }

    pub fn push_snapshot(&self, rows: Vec<DigestRow>) {
        self.snapshots.lock().push_back(rows);
    }

    pub fn set_global(&self, name: &str, value: &str) {
        self.globals
            .lock()
            .insert(name.to_string(), value.to_string());
    }

    pub fn global(&self, name: &str) -> Option<String> {
        self.globals.lock().get(name).cloned()
    }

    /// Fail the next `n` connection attempts.
    pub fn fail_connects(&self, n: usize) {
        self.connect_failures.store(n, Ordering::SeqCst);
    }

    /// Fail the next `n` `exec` calls.
    pub fn fail_execs(&self, n: usize) {
        self.exec_failures.store(n, Ordering::SeqCst);
    }

    /// Make digest reads hang until cancelled.
    pub fn stall_digests(&self, stall: bool) {
        self.stall_digests.store(stall, Ordering::SeqCst);
    }

    /// Make digest reads panic.
    pub fn panic_digests(&self, panic: bool) {
        self.panic_digests.store(panic, Ordering::SeqCst);
    }

    pub fn executed(&self) -> Vec<String> {
        self.executed.lock().clone()
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    fn take_failure(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn do_connect(&self) -> Result<()> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        if Self::take_failure(&self.connect_failures) {
            bail!("connection refused");
        }
        Ok(())
    }

    /// Apply `SET GLOBAL name = value` to the scripted globals.
    fn apply_set(&self, query: &str) {
        let lower = query.trim().to_ascii_lowercase();
        let Some(rest) = lower.strip_prefix("set global ") else {
            return;
        };
        if let Some((name, value)) = rest.split_once('=') {
            self.set_global(
                name.trim(),
                value.trim().trim_end_matches(';').trim_matches('\''),
            );
        }
    }
}

impl Connector for MockConnector {
    fn dsn(&self) -> &str {
        &self.dsn
    }

    fn connect(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move { self.do_connect() })
    }

    fn close(&self) -> BoxFuture<'_, ()> {
        Box::pin(async {})
    }

    fn exec<'a>(&'a self, queries: &'a [String]) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            self.do_connect()?;
            if Self::take_failure(&self.exec_failures) {
                bail!("access denied");
            }
            for q in queries {
                self.executed.lock().push(q.clone());
                self.apply_set(q);
            }
            Ok(())
        })
    }

    fn uptime(&self) -> BoxFuture<'_, Result<u64>> {
        Box::pin(async move {
            self.do_connect()?;
            let next = self.uptimes.lock().pop_front();
            let mut last = self.last_uptime.lock();
            if let Some(u) = next {
                *last = Some(u);
            }
            last.ok_or_else(|| anyhow!("no uptime scripted"))
        })
    }

    fn global_var<'a>(&'a self, name: &'a str) -> BoxFuture<'a, Result<Option<String>>> {
        Box::pin(async move {
            self.do_connect()?;
            Ok(self.global(name))
        })
    }

    fn digest_rows(&self) -> BoxFuture<'_, Result<Vec<DigestRow>>> {
        Box::pin(async move {
            self.do_connect()?;
            if self.panic_digests.load(Ordering::SeqCst) {
                panic!("digest read on {} crashed", self.dsn);
            }
            if self.stall_digests.load(Ordering::SeqCst) {
                std::future::pending::<()>().await;
            }
            self.snapshots
                .lock()
                .pop_front()
                .ok_or_else(|| anyhow!("no snapshot scripted"))
        })
    }
}

/// Factory handing out the same [`MockConnector`] per DSN.
#[derive(Default)]
pub struct MockConnectionFactory {
    conns: Mutex<HashMap<String, Arc<MockConnector>>>,
}

impl MockConnectionFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// The connector for `dsn`, created on first use.
    pub fn get(&self, dsn: &str) -> Arc<MockConnector> {
        Arc::clone(
            self.conns
                .lock()
                .entry(dsn.to_string())
                .or_insert_with(|| Arc::new(MockConnector::new(dsn))),
        )
    }
}

impl ConnectionFactory for MockConnectionFactory {
    fn make(&self, dsn: &str) -> Arc<dyn Connector> {
        self.get(dsn)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_scripted_uptime_repeats_last() {
        let conn = MockConnector::new("mysql://localhost/");
        conn.push_uptime(10);
        conn.push_uptime(11);
        assert_eq!(conn.uptime().await.expect("first"), 10);
        assert_eq!(conn.uptime().await.expect("second"), 11);
        assert_eq!(conn.uptime().await.expect("repeat"), 11);
    }

    #[tokio::test]
    async fn test_exec_records_and_applies_set_global() {
        let conn = MockConnector::new("mysql://localhost/");
        let queries = vec![
            "SET GLOBAL slow_query_log=OFF".to_string(),
            "SET GLOBAL max_slowlog_size = 0".to_string(),
        ];
        conn.exec(&queries).await.expect("exec");
        assert_eq!(conn.executed(), queries);
        assert_eq!(conn.global("max_slowlog_size").as_deref(), Some("0"));
        assert_eq!(conn.global("slow_query_log").as_deref(), Some("off"));
    }

    #[tokio::test]
    async fn test_connect_failures_are_consumed() {
        let conn = MockConnector::new("mysql://localhost/");
        conn.fail_connects(1);
        assert!(conn.connect().await.is_err());
        conn.connect().await.expect("second attempt");
        assert_eq!(conn.connects(), 2);
    }
}
