//! Per-instance QAN analyzer.
//!
//! One supervisor task per MySQL instance moves through
//! `Configuring -> Idle <-> RunningWorker` until stopped. A server restart
//! sends it back to `Configuring`, since the server forgets the global
//! variables the start queries set.

use std::fmt;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::backoff::Backoff;
use crate::context::AgentContext;
use crate::mrms::Monitor;
use crate::mysql::{global_var_u64, redact, ConnectionFactory, Connector};
use crate::qan::config::{CollectFrom, QanConfig, MIN_SERVER_ROTATION_SIZE};
use crate::qan::iter::{FilenameFn, Interval, Iter};
use crate::qan::report::make_report;
use crate::qan::worker::{Worker, WorkerResult};
use crate::spool::Spooler;
use crate::ticker::Clock;

const SERVICE: &str = "qan";

/// Intervals waiting for the analyzer loop.
const INTERVAL_QUEUE_SIZE: usize = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Init,
    Configuring,
    Idle,
    RunningWorker,
    Stopping,
    Stopped,
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Init => "Init",
            Self::Configuring => "Configuring",
            Self::Idle => "Idle",
            Self::RunningWorker => "Running worker",
            Self::Stopping => "Stopping",
            Self::Stopped => "Stopped",
        })
    }
}

/// Shared collaborators of every analyzer.
#[derive(Clone)]
pub struct AnalyzerDeps {
    pub ctx: AgentContext,
    pub clock: Arc<Clock>,
    pub spool: Arc<Spooler>,
    pub mrms: Arc<Monitor>,
    pub factory: Arc<dyn ConnectionFactory>,
}

/// Handle of one running analyzer.
pub struct Analyzer {
    config: QanConfig,
    ctx: AgentContext,
    state: Arc<parking_lot::Mutex<State>>,
    cancel: CancellationToken,
    handle: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

type WorkerOutput = (Worker, Interval, Result<Option<WorkerResult>>);
type WorkerTask = (JoinHandle<WorkerOutput>, CancellationToken);

impl Analyzer {
    /// Start analyzing the instance at `dsn`.
    pub fn start(config: QanConfig, dsn: &str, deps: AnalyzerDeps) -> Self {
        let state = Arc::new(parking_lot::Mutex::new(State::Init));
        let cancel = CancellationToken::new();
        let ctx = deps.ctx.clone();

        let task = AnalyzerTask {
            name: config.uuid.clone(),
            config: config.clone(),
            dsn: dsn.to_string(),
            conn: deps.factory.make(dsn),
            worker_conn: deps.factory.make(dsn),
            deps,
            state: Arc::clone(&state),
            cancel: cancel.clone(),
            server_rotation: None,
        };

        ctx.health.qan_analyzers.inc();
        info!(uuid = %config.uuid, collect_from = %config.collect_from, "qan analyzer started");

        Self {
            config,
            ctx,
            state,
            cancel,
            handle: tokio::sync::Mutex::new(Some(tokio::spawn(task.run()))),
        }
    }

    pub fn config(&self) -> &QanConfig {
        &self.config
    }

    pub fn state(&self) -> State {
        *self.state.lock()
    }

    /// Stop the worker and the iterator and run the stop queries.
    pub async fn stop(&self) {
        self.cancel.cancel();
        let handle = self.handle.lock().await.take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!(uuid = %self.config.uuid, error = %e, "qan analyzer task failed");
                *self.state.lock() = State::Stopped;
            }
            self.ctx.health.qan_analyzers.dec();
        }
    }
}

struct AnalyzerTask {
    name: String,
    config: QanConfig,
    dsn: String,
    conn: Arc<dyn Connector>,
    worker_conn: Arc<dyn Connector>,
    deps: AnalyzerDeps,
    state: Arc<parking_lot::Mutex<State>>,
    cancel: CancellationToken,
    /// Server `max_slowlog_size` captured when taking over rotation.
    server_rotation: Option<u64>,
}

impl AnalyzerTask {
    fn set_state(&self, state: State) {
        *self.state.lock() = state;
        self.deps.ctx.status.update(
            SERVICE,
            &format!("qan-analyzer-{}", self.name),
            state.to_string(),
        );
    }

    async fn run(mut self) {
        let sub = self.deps.mrms.add(&self.dsn);
        let mut restarts = sub.rx;
        let (tx, mut rx) = mpsc::channel::<Interval>(INTERVAL_QUEUE_SIZE);

        let mut iter: Option<Iter> = None;
        let mut running: Option<WorkerTask> = None;

        'configure: loop {
            self.set_state(State::Configuring);
            if let Some(it) = iter.take() {
                it.stop().await;
            }

            let Some(it) = self.configure(&tx).await else {
                break 'configure;
            };
            iter = Some(it);

            // Intervals of the previous iterator.
            while let Ok(stale) = rx.try_recv() {
                debug!(uuid = %self.name, number = stale.number, "interval while not configured, dropped");
            }

            // A fresh worker also resets the perfschema snapshot.
            let mut worker: Option<Worker> = None;
            self.set_state(State::Idle);

            loop {
                tokio::select! {
                    _ = self.cancel.cancelled() => break 'configure,

                    Some(dsn) = restarts.recv() => {
                        info!(uuid = %self.name, dsn = %redact(&dsn), "mysql restarted, reconfiguring");
                        if let Some((mut handle, token)) = running.take() {
                            let joined = tokio::select! {
                                joined = &mut handle => joined,
                                _ = self.cancel.cancelled() => {
                                    token.cancel();
                                    handle.await
                                }
                            };
                            self.finish_worker(joined);
                        }
                        if self.cancel.is_cancelled() {
                            break 'configure;
                        }
                        continue 'configure;
                    }

                    Some(interval) = rx.recv() => {
                        self.deps.ctx.health.qan_intervals.inc();

                        if running.is_some() {
                            warn!(uuid = %self.name, number = interval.number, "worker still running, interval dropped");
                            self.deps.ctx.health.qan_intervals_dropped.inc();
                            continue;
                        }

                        let w = match worker.take() {
                            Some(w) => w,
                            None => Worker::new(
                                &self.config,
                                Arc::clone(&self.worker_conn),
                                Arc::clone(&self.deps.ctx.status),
                            ),
                        };
                        let token = w.stop_token();
                        running = Some((tokio::spawn(run_worker(w, interval)), token));
                        self.set_state(State::RunningWorker);
                    }

                    joined = async {
                        match running.as_mut() {
                            Some((handle, _)) => handle.await,
                            None => std::future::pending().await,
                        }
                    }, if running.is_some() => {
                        running = None;
                        worker = self.finish_worker(joined);
                        self.set_state(State::Idle);
                    }
                }
            }
        }

        self.set_state(State::Stopping);

        if let Some((handle, token)) = running.take() {
            token.cancel();
            let _ = handle.await;
        }
        if let Some(it) = iter.take() {
            it.stop().await;
        }
        self.deps.mrms.remove(&self.dsn, sub.id);

        self.stop_collection().await;
        self.conn.close().await;
        self.worker_conn.close().await;

        self.set_state(State::Stopped);
        info!(uuid = %self.name, "qan analyzer stopped");
    }

    /// Connect and run the start queries until it works or the analyzer is
    /// stopped.
    async fn configure(&mut self, tx: &mpsc::Sender<Interval>) -> Option<Iter> {
        let mut backoff = Backoff::new();

        loop {
            match self.try_configure(tx).await {
                Ok(iter) => {
                    backoff.success();
                    info!(uuid = %self.name, dsn = %redact(&self.dsn), "qan analyzer configured");
                    return Some(iter);
                }
                Err(e) => {
                    warn!(uuid = %self.name, error = %format!("{e:#}"), "cannot configure mysql, retrying");
                    self.deps.ctx.status.update(
                        SERVICE,
                        &format!("qan-analyzer-{}-error", self.name),
                        format!("{e:#}"),
                    );
                    if !backoff.sleep(&self.cancel).await {
                        return None;
                    }
                }
            }
        }
    }

    async fn try_configure(&mut self, tx: &mpsc::Sender<Interval>) -> Result<Iter> {
        self.conn.connect().await.context("connecting to mysql")?;
        self.conn
            .exec(&self.config.start)
            .await
            .context("running start queries")?;

        let filename = match self.config.collect_from {
            CollectFrom::Slowlog => {
                self.take_over_rotation().await;
                Some(slow_log_path(Arc::clone(&self.conn)))
            }
            CollectFrom::Perfschema => None,
        };

        self.deps
            .ctx
            .status
            .remove(SERVICE, &format!("qan-analyzer-{}-error", self.name));

        Iter::start(
            Arc::clone(&self.deps.clock),
            self.config.interval_secs(),
            filename,
            tx.clone(),
        )
    }

    /// Stop the server from rotating the slow log; the worker rotates it
    /// once it has been parsed.
    async fn take_over_rotation(&mut self) {
        let size = match global_var_u64(self.conn.as_ref(), "max_slowlog_size").await {
            Ok(size) => size,
            Err(e) => {
                debug!(uuid = %self.name, error = %format!("{e:#}"), "server does not rotate slow log");
                return;
            }
        };

        if size < MIN_SERVER_ROTATION_SIZE {
            return;
        }

        let disable = ["SET GLOBAL max_slowlog_size = 0".to_string()];
        if let Err(e) = self.conn.exec(&disable).await {
            warn!(uuid = %self.name, error = %format!("{e:#}"), "cannot disable server slow log rotation");
            return;
        }

        info!(uuid = %self.name, max_slowlog_size = size, "took over slow log rotation");
        self.config.max_slow_log_size = size;
        self.server_rotation = Some(size);
    }

    /// Restore server rotation and run the stop queries, best effort.
    async fn stop_collection(&mut self) {
        if let Some(size) = self.server_rotation.take() {
            let restore = [format!("SET GLOBAL max_slowlog_size = {size}")];
            if let Err(e) = self.conn.exec(&restore).await {
                warn!(uuid = %self.name, error = %format!("{e:#}"), "cannot restore server slow log rotation");
            }
        }

        if let Err(e) = self.conn.exec(&self.config.stop).await {
            warn!(uuid = %self.name, error = %format!("{e:#}"), "stop queries failed");
        }
    }

    /// Handle a finished worker task; returns the worker if it survived.
    fn finish_worker(
        &self,
        joined: std::result::Result<WorkerOutput, tokio::task::JoinError>,
    ) -> Option<Worker> {
        match joined {
            Ok((worker, interval, res)) => {
                match res {
                    Ok(Some(result)) => self.spool_report(&interval, result),
                    Ok(None) => debug!(uuid = %self.name, number = interval.number, "no result for interval"),
                    Err(e) => {
                        self.deps.ctx.health.qan_worker_errors.inc();
                        warn!(uuid = %self.name, number = interval.number, error = %format!("{e:#}"), "worker failed");
                    }
                }
                Some(worker)
            }
            Err(e) => {
                self.deps.ctx.health.qan_worker_errors.inc();
                error!(uuid = %self.name, error = %e, critical = true, "qan worker crashed, interval dropped");
                None
            }
        }
    }

    fn spool_report(&self, interval: &Interval, result: WorkerResult) {
        if result.global.total_queries == 0 {
            debug!(uuid = %self.name, number = interval.number, "no queries in interval");
            return;
        }

        let report = make_report(&self.config, interval, result);
        let queries = report.global.total_queries;

        match self.deps.spool.write(SERVICE, &report) {
            Ok(()) => {
                self.deps.ctx.health.qan_reports.inc();
                self.deps.ctx.status.update(
                    SERVICE,
                    &format!("qan-analyzer-{}-last-interval", self.name),
                    format!(
                        "{} to {}: {queries} queries, {} classes",
                        report.start_ts.format("%Y-%m-%d %H:%M:%S"),
                        report.end_ts.format("%Y-%m-%d %H:%M:%S"),
                        report.class.len()
                    ),
                );
            }
            Err(e) => {
                warn!(uuid = %self.name, number = interval.number, error = %format!("{e:#}"), "qan report lost");
            }
        }
    }
}

async fn run_worker(mut worker: Worker, mut interval: Interval) -> WorkerOutput {
    let res = match worker.setup(&mut interval).await {
        Ok(()) => worker.run(&interval).await,
        Err(e) => Err(e.context("worker setup")),
    };

    if let Err(e) = worker.cleanup().await {
        warn!(error = %format!("{e:#}"), "worker cleanup failed");
    }

    (worker, interval, res)
}

/// Resolves `@@GLOBAL.slow_query_log_file`, relative paths against the
/// data dir.
fn slow_log_path(conn: Arc<dyn Connector>) -> FilenameFn {
    Arc::new(move || {
        let conn = Arc::clone(&conn);
        Box::pin(async move {
            let file = conn
                .global_var("slow_query_log_file")
                .await?
                .context("slow_query_log_file is not set")?;

            if Path::new(&file).is_absolute() {
                return Ok(file);
            }

            let datadir = conn.global_var("datadir").await?.unwrap_or_default();
            Ok(Path::new(&datadir).join(&file).display().to_string())
        })
    })
}
