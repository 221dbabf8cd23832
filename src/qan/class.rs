use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Distribution of one metric over a class.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Stats {
    pub cnt: u64,
    pub sum: f64,
    pub min: f64,
    pub avg: f64,
    pub med: f64,
    pub p95: f64,
    pub max: f64,
    #[serde(skip)]
    vals: Vec<f64>,
}

impl Stats {
    /// Stats known only by count and total, as summary tables report them.
    pub fn from_total(cnt: u64, sum: f64) -> Self {
        Self {
            cnt,
            sum,
            avg: if cnt > 0 { sum / cnt as f64 } else { 0.0 },
            ..Default::default()
        }
    }

    pub fn add(&mut self, v: f64) {
        if self.cnt == 0 || v < self.min {
            self.min = v;
        }
        if self.cnt == 0 || v > self.max {
            self.max = v;
        }
        self.cnt += 1;
        self.sum += v;
        self.vals.push(v);
    }

    /// Compute avg/med/p95 from the collected values, then scale counts and
    /// sums by the slow log sampling `rate`.
    pub fn finalize(&mut self, rate: u64) {
        if !self.vals.is_empty() {
            self.vals.sort_by(f64::total_cmp);
            let n = self.vals.len();
            self.avg = self.sum / n as f64;
            self.med = self.vals[(n - 1) / 2];
            self.p95 = self.vals[percentile_index(n, 0.95)];
            self.vals = Vec::new();
        }

        if rate > 1 {
            self.cnt *= rate;
            self.sum *= rate as f64;
        }
    }

    /// Fold `other` in: counts and sums add, extremes widen. Percentiles
    /// cannot be merged exactly; the larger one is kept.
    pub fn merge(&mut self, other: &Stats) {
        if other.cnt == 0 {
            return;
        }
        if self.cnt == 0 {
            *self = other.clone();
            return;
        }

        self.min = self.min.min(other.min);
        self.max = self.max.max(other.max);
        self.med = self.med.max(other.med);
        self.p95 = self.p95.max(other.p95);
        self.cnt += other.cnt;
        self.sum += other.sum;
        self.avg = self.sum / self.cnt as f64;
    }
}

/// Nearest-rank index of percentile `p` in `n` sorted values.
fn percentile_index(n: usize, p: f64) -> usize {
    let rank = (n as f64 * p).ceil() as usize;
    rank.clamp(1, n) - 1
}

/// Count of true values of a boolean metric.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BoolStats {
    pub sum: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Metrics {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub time_metrics: BTreeMap<String, Stats>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub number_metrics: BTreeMap<String, Stats>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub bool_metrics: BTreeMap<String, BoolStats>,
}

impl Metrics {
    pub fn finalize(&mut self, rate: u64) {
        for s in self
            .time_metrics
            .values_mut()
            .chain(self.number_metrics.values_mut())
        {
            s.finalize(rate);
        }
        if rate > 1 {
            for b in self.bool_metrics.values_mut() {
                b.sum *= rate;
            }
        }
    }

    pub fn merge(&mut self, other: &Metrics) {
        for (k, s) in &other.time_metrics {
            self.time_metrics.entry(k.clone()).or_default().merge(s);
        }
        for (k, s) in &other.number_metrics {
            self.number_metrics.entry(k.clone()).or_default().merge(s);
        }
        for (k, b) in &other.bool_metrics {
            self.bool_metrics.entry(k.clone()).or_default().sum += b.sum;
        }
    }

    /// Total `Query_time`, the report ranking key.
    pub fn query_time_sum(&self) -> f64 {
        self.time_metrics
            .get("Query_time")
            .map(|s| s.sum)
            .unwrap_or(0.0)
    }
}

/// The slowest sample of a class.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Example {
    pub query: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub db: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ts: Option<DateTime<Utc>>,
    pub query_time: f64,
}

/// Aggregated statistics of one query class, or of all queries when used
/// as the report's global class.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Class {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub fingerprint: String,
    pub metrics: Metrics,
    /// Slow log: queries seen. Performance schema: schemas contributing.
    pub total_queries: u64,
    /// Executions counted, after sampling and `count_star` deltas.
    pub query_count: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub example: Option<Example>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_seen: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_seen: Option<DateTime<Utc>>,
}

impl Class {
    pub fn new(id: &str, fingerprint: &str) -> Self {
        Self {
            id: id.to_string(),
            fingerprint: fingerprint.to_string(),
            ..Default::default()
        }
    }

    pub fn seen(&mut self, ts: Option<DateTime<Utc>>) {
        let Some(ts) = ts else {
            return;
        };
        if self.first_seen.map_or(true, |f| ts < f) {
            self.first_seen = Some(ts);
        }
        if self.last_seen.map_or(true, |l| ts > l) {
            self.last_seen = Some(ts);
        }
    }

    /// Fold another class in; used for the low-ranked remainder.
    pub fn merge(&mut self, other: &Class) {
        self.metrics.merge(&other.metrics);
        self.total_queries += other.total_queries;
        self.query_count += other.query_count;
        self.seen(other.first_seen);
        self.seen(other.last_seen);
    }
}
