use std::collections::VecDeque;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Outcome of one shipper pass.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SentInfo {
    pub begin: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub bytes: u64,
    pub files: u64,
    pub errs: u64,
    pub api_errs: u64,
    pub timeouts: u64,
    pub bad_files: u64,
}

/// Summary of shipper activity over the stats window.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SentReport {
    pub begin: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    pub bytes: u64,
    /// Seconds spent sending.
    pub duration: f64,
    pub files: u64,
    pub errs: u64,
    pub api_errs: u64,
    pub timeouts: u64,
    pub bad_files: u64,
    /// Effective throughput while sending.
    pub mbps: f64,
    /// Percent of the window spent sending.
    pub utilization: f64,
}

/// Sliding window of [`SentInfo`].
#[derive(Debug)]
pub struct SenderStats {
    window: Duration,
    sent: VecDeque<SentInfo>,
}

impl SenderStats {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            sent: VecDeque::new(),
        }
    }

    pub fn sent(&mut self, info: SentInfo) {
        self.prune(info.end);
        self.sent.push_back(info);
    }

    fn prune(&mut self, now: DateTime<Utc>) {
        let Ok(window) = chrono::Duration::from_std(self.window) else {
            return;
        };
        let cutoff = now - window;

        while self.sent.front().is_some_and(|s| s.end < cutoff) {
            self.sent.pop_front();
        }
    }

    pub fn report(&mut self) -> SentReport {
        self.report_at(Utc::now())
    }

    pub fn report_at(&mut self, now: DateTime<Utc>) -> SentReport {
        self.prune(now);

        let mut report = SentReport::default();
        let mut busy = Duration::ZERO;

        for s in &self.sent {
            report.begin = Some(report.begin.map_or(s.begin, |b| b.min(s.begin)));
            report.end = Some(report.end.map_or(s.end, |e| e.max(s.end)));
            report.bytes += s.bytes;
            report.files += s.files;
            report.errs += s.errs;
            report.api_errs += s.api_errs;
            report.timeouts += s.timeouts;
            report.bad_files += s.bad_files;
            busy += (s.end - s.begin).to_std().unwrap_or(Duration::ZERO);
        }

        report.duration = busy.as_secs_f64();

        if report.duration > 0.0 {
            report.mbps = (report.bytes as f64 * 8.0) / report.duration / 1_000_000.0;
        }

        if let (Some(begin), Some(end)) = (report.begin, report.end) {
            let span = (end - begin).to_std().unwrap_or(Duration::ZERO).as_secs_f64();
            if span > 0.0 {
                report.utilization = (report.duration / span * 100.0).min(100.0);
            }
        }

        report
    }
}
