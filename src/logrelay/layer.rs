use std::fmt::{self, Write as _};
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::mpsc;
use tracing::field::{Field, Visit};
use tracing::{Event, Subscriber};
use tracing_subscriber::layer::Context;
use tracing_subscriber::Layer;

use crate::health::HealthMetrics;
use crate::proto::{Level, LogEntry};

const CRATE_TARGET: &str = "percona_agent";

/// Bridges `tracing` events of this crate into the log relay.
///
/// Recognised fields: `service` overrides the service name derived from the
/// module path, `cmd_id` correlates the entry with a command, `offline`
/// keeps it local and `critical` raises it to critical. Other fields are
/// appended to the message as `key=value`. Never blocks: a full relay queue
/// drops the entry.
pub struct RelayLayer {
    tx: mpsc::Sender<LogEntry>,
    health: Option<Arc<HealthMetrics>>,
}

impl RelayLayer {
    pub fn new(tx: mpsc::Sender<LogEntry>) -> Self {
        Self { tx, health: None }
    }

    pub fn with_health(mut self, health: Arc<HealthMetrics>) -> Self {
        self.health = Some(health);
        self
    }
}

#[derive(Default)]
struct EntryVisitor {
    message: String,
    extra: String,
    service: Option<String>,
    cmd_id: Option<String>,
    offline: bool,
    critical: bool,
}

impl EntryVisitor {
    fn push_extra(&mut self, field: &Field, value: fmt::Arguments<'_>) {
        if !self.extra.is_empty() {
            self.extra.push(' ');
        }
        let _ = write!(self.extra, "{}={}", field.name(), value);
    }
}

impl Visit for EntryVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        match field.name() {
            "message" => self.message = value.to_string(),
            "service" => self.service = Some(value.to_string()),
            "cmd_id" => self.cmd_id = Some(value.to_string()),
            _ => self.push_extra(field, format_args!("{value}")),
        }
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        match field.name() {
            "offline" => self.offline = value,
            "critical" => self.critical = value,
            _ => self.push_extra(field, format_args!("{value}")),
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        match field.name() {
            "message" => self.message = format!("{value:?}"),
            "service" => self.service = Some(format!("{value:?}").trim_matches('"').to_string()),
            "cmd_id" => self.cmd_id = Some(format!("{value:?}").trim_matches('"').to_string()),
            _ => self.push_extra(field, format_args!("{value:?}")),
        }
    }
}

/// Service name from a module path: `percona_agent::qan::analyzer` → `qan`.
fn service_from_target(target: &str) -> &str {
    target.split("::").nth(1).unwrap_or("agent")
}

impl<S: Subscriber> Layer<S> for RelayLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let meta = event.metadata();
        if !meta.target().starts_with(CRATE_TARGET) {
            return;
        }

        let mut visitor = EntryVisitor::default();
        event.record(&mut visitor);

        let level = if visitor.critical {
            Level::Critical
        } else {
            Level::from(meta.level())
        };

        let mut msg = visitor.message;
        if !visitor.extra.is_empty() {
            if !msg.is_empty() {
                msg.push(' ');
            }
            msg.push_str(&visitor.extra);
        }

        let entry = LogEntry {
            ts: Utc::now(),
            level,
            service: visitor
                .service
                .unwrap_or_else(|| service_from_target(meta.target()).to_string()),
            msg,
            cmd_id: visitor.cmd_id,
            offline: visitor.offline,
        };

        if self.tx.try_send(entry).is_err() {
            if let Some(health) = &self.health {
                health.log_entries_dropped.inc();
            }
        }
    }
}
