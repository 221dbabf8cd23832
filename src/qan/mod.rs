//! Query analytics: turns the slow log or the performance schema into
//! per-interval query class reports.

pub mod aggregator;
pub mod analyzer;
pub mod class;
pub mod config;
pub mod event;
pub mod fingerprint;
pub mod iter;
pub mod manager;
pub mod perfschema;
pub mod report;
pub mod slowlog;
pub mod worker;

pub use aggregator::{AggregateResult, Aggregator};
pub use analyzer::{Analyzer, AnalyzerDeps, State};
pub use class::{Class, Metrics, Stats};
pub use config::{CollectFrom, QanConfig};
pub use event::Event;
pub use fingerprint::{class_id, fingerprint};
pub use iter::{Interval, IntervalState, Iter};
pub use manager::Manager;
pub use report::{make_report, Report};
pub use slowlog::{SlowLogParser, SlowLogWorker};
pub use worker::{Worker, WorkerResult};
