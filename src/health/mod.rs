use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use prometheus::{Counter, Encoder, Gauge, GaugeVec, Opts, Registry, TextEncoder};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

const NAMESPACE: &str = "percona_agent";

/// Prometheus metrics describing the agent itself.
///
/// Always registered; served over HTTP only when an address is configured.
pub struct HealthMetrics {
    registry: Registry,
    addr: String,
    shutdown: parking_lot::Mutex<Option<CancellationToken>>,

    // Control link
    /// Commands received on the control link.
    pub cmds_received: Counter,
    /// Replies handed to the control link.
    pub replies_sent: Counter,
    /// Command handlers that panicked.
    pub cmd_panics: Counter,
    /// Link state per link name (1=connected).
    pub link_connected: GaugeVec,

    // Log relay
    /// Log entries lost while the log link was down.
    pub log_entries_lost: Counter,
    /// Log entries dropped because the relay queue was full.
    pub log_entries_dropped: Counter,

    // Spool
    pub spool_files_written: Counter,
    pub spool_files_sent: Counter,
    pub spool_bytes_sent: Counter,
    pub spool_send_errors: Counter,
    /// Reports dropped because the spool queue was full.
    pub spool_dropped: Counter,

    // QAN
    pub qan_intervals: Counter,
    /// Intervals skipped because a worker was still running.
    pub qan_intervals_dropped: Counter,
    pub qan_reports: Counter,
    pub qan_worker_errors: Counter,
    /// Number of running analyzers.
    pub qan_analyzers: Gauge,

    // MySQL
    pub mysql_restarts: Counter,
}

fn counter(registry: &Registry, name: &str, help: &str) -> Result<Counter> {
    let c = Counter::with_opts(Opts::new(name, help).namespace(NAMESPACE))?;
    registry.register(Box::new(c.clone()))?;
    Ok(c)
}

impl HealthMetrics {
    /// Creates the metric set. `addr` is the listen address, empty to disable.
    pub fn new(addr: &str) -> Result<Self> {
        let registry = Registry::new();

        let link_connected = GaugeVec::new(
            Opts::new("link_connected", "Link state per link (1=connected).").namespace(NAMESPACE),
            &["link"],
        )?;
        registry.register(Box::new(link_connected.clone()))?;

        let qan_analyzers = Gauge::with_opts(
            Opts::new("qan_analyzers", "Number of running QAN analyzers.").namespace(NAMESPACE),
        )?;
        registry.register(Box::new(qan_analyzers.clone()))?;

        Ok(Self {
            cmds_received: counter(&registry, "cmds_received_total", "Commands received.")?,
            replies_sent: counter(&registry, "replies_sent_total", "Replies sent.")?,
            cmd_panics: counter(&registry, "cmd_panics_total", "Command handlers that panicked.")?,
            link_connected,
            log_entries_lost: counter(
                &registry,
                "log_entries_lost_total",
                "Log entries lost while the log link was down.",
            )?,
            log_entries_dropped: counter(
                &registry,
                "log_entries_dropped_total",
                "Log entries dropped because the relay queue was full.",
            )?,
            spool_files_written: counter(
                &registry,
                "spool_files_written_total",
                "Spool entries written.",
            )?,
            spool_files_sent: counter(&registry, "spool_files_sent_total", "Spool entries sent.")?,
            spool_bytes_sent: counter(&registry, "spool_bytes_sent_total", "Spool bytes sent.")?,
            spool_send_errors: counter(
                &registry,
                "spool_send_errors_total",
                "Spool entries not acknowledged.",
            )?,
            spool_dropped: counter(
                &registry,
                "spool_dropped_total",
                "Reports dropped because the spool queue was full.",
            )?,
            qan_intervals: counter(&registry, "qan_intervals_total", "QAN intervals received.")?,
            qan_intervals_dropped: counter(
                &registry,
                "qan_intervals_dropped_total",
                "QAN intervals skipped while a worker was running.",
            )?,
            qan_reports: counter(&registry, "qan_reports_total", "QAN reports spooled.")?,
            qan_worker_errors: counter(
                &registry,
                "qan_worker_errors_total",
                "QAN worker runs that failed or panicked.",
            )?,
            qan_analyzers,
            mysql_restarts: counter(
                &registry,
                "mysql_restarts_total",
                "MySQL restarts detected.",
            )?,
            registry,
            addr: addr.to_string(),
            shutdown: parking_lot::Mutex::new(None),
        })
    }

    /// Starts the HTTP server serving /metrics and /healthz. No-op when no
    /// address is configured.
    pub async fn start(&self) -> Result<()> {
        if self.addr.is_empty() {
            return Ok(());
        }

        // ":port" shorthand binds every interface.
        let bind_addr = if self.addr.starts_with(':') {
            format!("0.0.0.0{}", self.addr)
        } else {
            self.addr.clone()
        };

        let app_state = Arc::new(AppState {
            registry: self.registry.clone(),
        });

        let app = Router::new()
            .route("/metrics", get(metrics_handler))
            .route("/healthz", get(healthz_handler))
            .with_state(app_state);

        let listener = TcpListener::bind(&bind_addr)
            .await
            .with_context(|| format!("listening on {bind_addr}"))?;

        let local_addr = listener.local_addr().context("getting local address")?;

        let cancel = CancellationToken::new();
        *self.shutdown.lock() = Some(cancel.clone());

        tokio::spawn(async move {
            tracing::info!(addr = %local_addr, "health metrics server started");

            let result = axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(async move {
                cancel.cancelled().await;
            })
            .await;

            if let Err(e) = result {
                tracing::error!(error = %e, "health metrics server error");
            }
        });

        Ok(())
    }

    /// Gracefully shuts down the server.
    pub fn stop(&self) {
        if let Some(cancel) = self.shutdown.lock().take() {
            cancel.cancel();
        }
    }

    /// Prometheus text exposition of every metric.
    pub fn encode(&self) -> Result<String> {
        encode_registry(&self.registry)
    }
}

struct AppState {
    registry: Registry,
}

fn encode_registry(registry: &Registry) -> Result<String> {
    let mut buffer = Vec::new();
    TextEncoder::new()
        .encode(&registry.gather(), &mut buffer)
        .context("encoding metrics")?;
    String::from_utf8(buffer).context("converting metrics to string")
}

/// GET /metrics
async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match encode_registry(&state.registry) {
        Ok(text) => (StatusCode::OK, text),
        Err(e) => {
            tracing::error!(error = %e, "encoding metrics");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "encoding error".to_string(),
            )
        }
    }
}

/// GET /healthz
async fn healthz_handler() -> &'static str {
    "ok"
}
