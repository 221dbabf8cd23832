use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio_util::sync::CancellationToken;

use crate::mysql::Connector;
use crate::qan::class::Class;
use crate::qan::config::{CollectFrom, QanConfig};
use crate::qan::iter::Interval;
use crate::qan::perfschema::PerfSchemaWorker;
use crate::qan::slowlog::SlowLogWorker;
use crate::status::Status;

/// What one worker run produced.
#[derive(Debug, Clone, Default)]
pub struct WorkerResult {
    pub global: Class,
    pub classes: Vec<Class>,
    pub rate_limit: u32,
    /// Slow log offset where parsing stopped.
    pub stop_offset: u64,
    pub run_time: Duration,
}

/// Processes one interval at a time for an analyzer. Progress is published
/// in the status registry as `qan-worker-<uuid>`.
pub enum Worker {
    SlowLog(SlowLogWorker),
    PerfSchema(PerfSchemaWorker),
}

impl Worker {
    pub fn new(config: &QanConfig, conn: Arc<dyn Connector>, status: Arc<Status>) -> Self {
        match config.collect_from {
            CollectFrom::Slowlog => Self::SlowLog(SlowLogWorker::new(config.clone(), conn, status)),
            CollectFrom::Perfschema => {
                Self::PerfSchema(PerfSchemaWorker::new(&config.uuid, conn, status))
            }
        }
    }

    /// Prepare for `interval`; may rewrite it (slow log rotation).
    pub async fn setup(&mut self, interval: &mut Interval) -> Result<()> {
        match self {
            Self::SlowLog(w) => w.setup(interval).await,
            Self::PerfSchema(_) => Ok(()),
        }
    }

    pub async fn run(&mut self, interval: &Interval) -> Result<Option<WorkerResult>> {
        match self {
            Self::SlowLog(w) => w.run(interval).await,
            Self::PerfSchema(w) => w.run(interval).await,
        }
    }

    pub async fn cleanup(&mut self) -> Result<()> {
        match self {
            Self::SlowLog(w) => w.cleanup().await,
            Self::PerfSchema(_) => Ok(()),
        }
    }

    /// Token that makes a running [`Worker::run`] return early.
    pub fn stop_token(&self) -> CancellationToken {
        match self {
            Self::SlowLog(w) => w.stop_token(),
            Self::PerfSchema(w) => w.stop_token(),
        }
    }

    /// Current progress, e.g. `Idle` or `Parsing slow.log`.
    pub fn status(&self) -> Option<String> {
        match self {
            Self::SlowLog(w) => w.status(),
            Self::PerfSchema(w) => w.status(),
        }
    }

    pub fn stop(&self) {
        self.stop_token().cancel();
    }
}
