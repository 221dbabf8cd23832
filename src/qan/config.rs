use std::time::Duration;

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};

/// Minimum `max_slowlog_size` the server accepts; smaller values mean the
/// server does not rotate.
pub const MIN_SERVER_ROTATION_SIZE: u64 = 4096;

/// Where query metrics come from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CollectFrom {
    #[default]
    Slowlog,
    Perfschema,
}

impl std::fmt::Display for CollectFrom {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Slowlog => "slowlog",
            Self::Perfschema => "perfschema",
        })
    }
}

/// Per-instance analyzer configuration, persisted as
/// `config/qan-<UUID>.conf`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QanConfig {
    /// UUID of the MySQL instance in the system tree.
    pub uuid: String,

    /// Statements run when collection starts (and after a server restart).
    #[serde(default)]
    pub start: Vec<String>,

    /// Statements run when collection stops.
    #[serde(default)]
    pub stop: Vec<String>,

    /// Report interval, whole seconds. Default: 1m.
    #[serde(default = "default_interval", with = "humantime_serde")]
    pub interval: Duration,

    /// Upper bound on one worker run. Default: 55s.
    #[serde(default = "default_worker_run_time", with = "humantime_serde")]
    pub worker_run_time: Duration,

    /// Rotate the slow log once it reaches this size; 0 disables rotation.
    /// Default: 1 GiB.
    #[serde(default = "default_max_slow_log_size")]
    pub max_slow_log_size: u64,

    /// Delete rotated slow logs after parsing them. Default: true.
    #[serde(default = "default_true")]
    pub remove_old_slow_logs: bool,

    /// Keep the slowest sample query per class.
    #[serde(default = "default_true")]
    pub example_queries: bool,

    #[serde(default)]
    pub collect_from: CollectFrom,

    /// Keep this many top classes and fold the rest; 0 keeps all.
    /// Default: 200.
    #[serde(default = "default_report_limit")]
    pub report_limit: usize,
}

fn default_interval() -> Duration {
    Duration::from_secs(60)
}

fn default_worker_run_time() -> Duration {
    Duration::from_secs(55)
}

fn default_max_slow_log_size() -> u64 {
    1 << 30
}

fn default_true() -> bool {
    true
}

fn default_report_limit() -> usize {
    200
}

impl QanConfig {
    /// Defaults for `uuid` with the usual start/stop statements.
    pub fn new(uuid: &str, collect_from: CollectFrom) -> Self {
        let (start, stop) = default_queries(collect_from);
        Self {
            uuid: uuid.to_string(),
            start,
            stop,
            interval: default_interval(),
            worker_run_time: default_worker_run_time(),
            max_slow_log_size: default_max_slow_log_size(),
            remove_old_slow_logs: true,
            example_queries: true,
            collect_from,
            report_limit: default_report_limit(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.uuid.is_empty() {
            bail!("uuid is required");
        }

        let secs = self.interval.as_secs();
        if secs == 0 || self.interval.subsec_nanos() != 0 {
            bail!("interval must be a whole number of seconds >= 1s");
        }

        if self.worker_run_time.is_zero() {
            bail!("worker_run_time must be positive");
        }

        if self.worker_run_time > self.interval {
            bail!(
                "worker_run_time ({}s) must not exceed interval ({secs}s)",
                self.worker_run_time.as_secs()
            );
        }

        if self.max_slow_log_size != 0 && self.max_slow_log_size < MIN_SERVER_ROTATION_SIZE {
            bail!("max_slow_log_size must be 0 or at least {MIN_SERVER_ROTATION_SIZE}");
        }

        Ok(())
    }

    /// Interval in whole seconds, as the tick scheduler takes it.
    pub fn interval_secs(&self) -> u64 {
        self.interval.as_secs()
    }
}

/// Start and stop statements for a collection source.
pub fn default_queries(collect_from: CollectFrom) -> (Vec<String>, Vec<String>) {
    match collect_from {
        CollectFrom::Slowlog => (
            vec![
                "SET GLOBAL slow_query_log=OFF".to_string(),
                "SET GLOBAL log_output='file'".to_string(),
                "SET GLOBAL long_query_time=0".to_string(),
                "SET GLOBAL slow_query_log=ON".to_string(),
            ],
            vec![
                "SET GLOBAL slow_query_log=OFF".to_string(),
                "SET GLOBAL long_query_time=10".to_string(),
            ],
        ),
        CollectFrom::Perfschema => (
            vec![
                "UPDATE performance_schema.setup_consumers SET ENABLED = 'YES' \
                 WHERE NAME = 'statements_digest'"
                    .to_string(),
            ],
            Vec::new(),
        ),
    }
}
