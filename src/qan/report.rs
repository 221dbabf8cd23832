use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::qan::class::Class;
use crate::qan::config::QanConfig;
use crate::qan::iter::Interval;
use crate::qan::worker::WorkerResult;

/// Id and fingerprint of the class the tail of a limited report folds into.
pub const LOW_RANKED_ID: &str = "0";
pub const LOW_RANKED_FINGERPRINT: &str = "low-ranked queries";

/// One interval's query analytics, as spooled for the data service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Report {
    pub uuid: String,
    pub start_ts: DateTime<Utc>,
    pub end_ts: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub slow_log_file: String,
    #[serde(default)]
    pub start_offset: u64,
    #[serde(default)]
    pub end_offset: u64,
    #[serde(default)]
    pub stop_offset: u64,
    /// Worker run time in seconds.
    pub run_time: f64,
    pub global: Class,
    pub class: Vec<Class>,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub rate_limit: u32,
}

fn is_zero(v: &u32) -> bool {
    *v == 0
}

/// Build the report of `interval`: classes ranked by total query time,
/// the tail beyond `report_limit` folded into one class.
pub fn make_report(config: &QanConfig, interval: &Interval, result: WorkerResult) -> Report {
    let mut classes = result.classes;
    classes.sort_by(|a, b| {
        b.metrics
            .query_time_sum()
            .total_cmp(&a.metrics.query_time_sum())
            .then_with(|| a.id.cmp(&b.id))
    });

    if config.report_limit > 0 && classes.len() > config.report_limit {
        let tail = classes.split_off(config.report_limit);
        let mut low = Class::new(LOW_RANKED_ID, LOW_RANKED_FINGERPRINT);
        for c in &tail {
            low.merge(c);
        }
        classes.push(low);
    }

    Report {
        uuid: config.uuid.clone(),
        start_ts: interval.start_time,
        end_ts: interval.stop_time,
        slow_log_file: interval.filename.clone(),
        start_offset: interval.start_offset,
        end_offset: interval.end_offset,
        stop_offset: result.stop_offset,
        run_time: result.run_time.as_secs_f64(),
        global: result.global,
        class: classes,
        rate_limit: result.rate_limit,
    }
}
