use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};

/// One slow log entry.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Event {
    /// Byte offset of the first line of the event.
    pub offset: u64,
    pub ts: Option<DateTime<Utc>>,
    /// `# administrator command:` entries carry no SQL.
    pub admin: bool,
    pub query: String,
    pub user: String,
    pub host: String,
    pub db: String,
    pub time_metrics: BTreeMap<String, f64>,
    pub number_metrics: BTreeMap<String, u64>,
    pub bool_metrics: BTreeMap<String, bool>,
    /// Percona Server `Log_slow_rate_type`/`Log_slow_rate_limit`.
    pub rate_type: String,
    pub rate_limit: u32,
}

/// Header keys that are identifiers rather than metrics.
const IGNORED_KEYS: &[&str] = &["Thread_id", "Id", "Last_errno", "Killed", "InnoDB_trx_id"];

impl Event {
    /// Classify one `Key: value` header pair.
    pub fn add_header(&mut self, key: &str, value: &str) {
        if IGNORED_KEYS.contains(&key) {
            return;
        }

        match key {
            "Schema" => {
                if !value.is_empty() {
                    self.db = value.to_string();
                }
            }
            "Log_slow_rate_type" => self.rate_type = value.to_string(),
            "Log_slow_rate_limit" => self.rate_limit = value.parse().unwrap_or(0),
            _ if is_time_metric(key) => {
                if let Ok(v) = value.parse::<f64>() {
                    self.time_metrics.insert(key.to_string(), v);
                }
            }
            _ => match value {
                "Yes" => {
                    self.bool_metrics.insert(key.to_string(), true);
                }
                "No" => {
                    self.bool_metrics.insert(key.to_string(), false);
                }
                _ => {
                    if let Ok(v) = value.parse::<u64>() {
                        self.number_metrics.insert(key.to_string(), v);
                    }
                }
            },
        }
    }

    pub fn query_time(&self) -> f64 {
        self.time_metrics.get("Query_time").copied().unwrap_or(0.0)
    }
}

fn is_time_metric(key: &str) -> bool {
    key.ends_with("_time") || key.ends_with("_wait")
}

/// Parse a `# Time:` value: `2018-02-14T16:17:48.123456Z` (MySQL 5.7+) or
/// `071015 21:43:52` (older servers, UTC assumed).
pub fn parse_time(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();

    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }

    let compact = raw.split_whitespace().collect::<Vec<_>>().join(" ");
    NaiveDateTime::parse_from_str(&compact, "%y%m%d %H:%M:%S")
        .ok()
        .map(|naive| Utc.from_utc_datetime(&naive))
}
