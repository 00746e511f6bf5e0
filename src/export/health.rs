use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use prometheus::{
    CounterVec, Encoder, Gauge, GaugeVec, HistogramOpts, HistogramVec, Opts, Registry,
    TextEncoder,
};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::http::MetricsCallback;

const NAMESPACE: &str = "latency_indexer";

/// Prometheus metrics for indexer health and observability.
///
/// All metrics use the "latency_indexer" namespace.
pub struct HealthMetrics {
    registry: Registry,
    addr: String,
    shutdown: parking_lot::Mutex<Option<CancellationToken>>,

    // === Refresh ===
    /// Refresh and backfill cycles by kind and status.
    pub refresh_cycles: CounterVec,
    /// Cycle duration by kind.
    pub refresh_cycle_duration: HistogramVec,
    /// Samples appended by kind.
    pub samples_appended: CounterVec,
    /// Circuits in the latest topology snapshot by kind.
    pub circuits_tracked: GaugeVec,
    /// Current ledger epoch.
    pub current_epoch: Gauge,

    // === Remote sources ===
    /// Sample fetches by kind and outcome (success/not_found/error/cancelled).
    pub remote_fetches: CounterVec,
    /// Sample fetch duration by kind.
    pub remote_fetch_duration: HistogramVec,
    /// Sample fetches currently in flight by kind.
    pub fetches_in_flight: GaugeVec,
    /// HTTP requests by endpoint and status.
    pub remote_requests_total: CounterVec,
    /// HTTP request duration by endpoint.
    pub remote_request_duration: HistogramVec,

    // === ClickHouse ===
    /// Whether ClickHouse connection is established (1=yes, 0=no).
    pub clickhouse_connected: Gauge,
    /// ClickHouse operation duration by operation.
    pub clickhouse_batch_duration: HistogramVec,
    /// Failed batch inserts by table.
    pub clickhouse_batch_errors: CounterVec,
}

impl HealthMetrics {
    /// Creates a new health metrics instance with all metrics registered.
    pub fn new(addr: &str) -> Result<Self> {
        let registry = Registry::new();

        let refresh_cycles = CounterVec::new(
            Opts::new(
                "refresh_cycles_total",
                "Total refresh and backfill cycles by kind and status.",
            )
            .namespace(NAMESPACE),
            &["kind", "status"],
        )?;
        let refresh_cycle_duration = HistogramVec::new(
            HistogramOpts::new(
                "refresh_cycle_duration_seconds",
                "Refresh cycle duration by kind.",
            )
            .namespace(NAMESPACE)
            .buckets(vec![0.1, 0.5, 1.0, 5.0, 10.0, 30.0, 60.0, 120.0]),
            &["kind"],
        )?;
        let samples_appended = CounterVec::new(
            Opts::new(
                "samples_appended_total",
                "Total latency samples appended by kind.",
            )
            .namespace(NAMESPACE),
            &["kind"],
        )?;
        let circuits_tracked = GaugeVec::new(
            Opts::new(
                "circuits_tracked",
                "Circuits in the latest topology snapshot by kind.",
            )
            .namespace(NAMESPACE),
            &["kind"],
        )?;
        let current_epoch = Gauge::with_opts(
            Opts::new("current_epoch", "Current ledger epoch.").namespace(NAMESPACE),
        )?;

        let remote_fetches = CounterVec::new(
            Opts::new(
                "remote_fetches_total",
                "Total telemetry sample fetches by kind and outcome.",
            )
            .namespace(NAMESPACE),
            &["kind", "outcome"],
        )?;
        let remote_fetch_duration = HistogramVec::new(
            HistogramOpts::new(
                "remote_fetch_duration_seconds",
                "Telemetry sample fetch duration by kind.",
            )
            .namespace(NAMESPACE)
            .buckets(vec![0.01, 0.05, 0.1, 0.5, 1.0, 5.0]),
            &["kind"],
        )?;
        let fetches_in_flight = GaugeVec::new(
            Opts::new(
                "fetches_in_flight",
                "Telemetry sample fetches currently in flight by kind.",
            )
            .namespace(NAMESPACE),
            &["kind"],
        )?;
        let remote_requests_total = CounterVec::new(
            Opts::new(
                "remote_requests_total",
                "Total HTTP requests to remote sources by endpoint and status.",
            )
            .namespace(NAMESPACE),
            &["endpoint", "status"],
        )?;
        let remote_request_duration = HistogramVec::new(
            HistogramOpts::new(
                "remote_request_duration_seconds",
                "HTTP request duration to remote sources by endpoint.",
            )
            .namespace(NAMESPACE)
            .buckets(vec![0.01, 0.05, 0.1, 0.5, 1.0, 5.0]),
            &["endpoint"],
        )?;

        let clickhouse_connected = Gauge::with_opts(
            Opts::new(
                "clickhouse_connected",
                "Whether ClickHouse connection is established (1=yes, 0=no).",
            )
            .namespace(NAMESPACE),
        )?;
        let clickhouse_batch_duration = HistogramVec::new(
            HistogramOpts::new(
                "clickhouse_batch_duration_seconds",
                "Time spent in ClickHouse by operation.",
            )
            .namespace(NAMESPACE)
            .buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0]),
            &["operation"],
        )?;
        let clickhouse_batch_errors = CounterVec::new(
            Opts::new(
                "clickhouse_batch_errors_total",
                "Total failed ClickHouse batch inserts by table.",
            )
            .namespace(NAMESPACE),
            &["table"],
        )?;

        registry.register(Box::new(refresh_cycles.clone()))?;
        registry.register(Box::new(refresh_cycle_duration.clone()))?;
        registry.register(Box::new(samples_appended.clone()))?;
        registry.register(Box::new(circuits_tracked.clone()))?;
        registry.register(Box::new(current_epoch.clone()))?;
        registry.register(Box::new(remote_fetches.clone()))?;
        registry.register(Box::new(remote_fetch_duration.clone()))?;
        registry.register(Box::new(fetches_in_flight.clone()))?;
        registry.register(Box::new(remote_requests_total.clone()))?;
        registry.register(Box::new(remote_request_duration.clone()))?;
        registry.register(Box::new(clickhouse_connected.clone()))?;
        registry.register(Box::new(clickhouse_batch_duration.clone()))?;
        registry.register(Box::new(clickhouse_batch_errors.clone()))?;

        Ok(Self {
            registry,
            addr: addr.to_string(),
            shutdown: parking_lot::Mutex::new(None),
            refresh_cycles,
            refresh_cycle_duration,
            samples_appended,
            circuits_tracked,
            current_epoch,
            remote_fetches,
            remote_fetch_duration,
            fetches_in_flight,
            remote_requests_total,
            remote_request_duration,
            clickhouse_connected,
            clickhouse_batch_duration,
            clickhouse_batch_errors,
        })
    }

    /// Builds a request callback for the remote source clients.
    pub fn request_callback(self: &Arc<Self>) -> MetricsCallback {
        let health = Arc::clone(self);
        Box::new(move |endpoint: &str, status: &str, duration: Duration| {
            health
                .remote_requests_total
                .with_label_values(&[endpoint, status])
                .inc();
            health
                .remote_request_duration
                .with_label_values(&[endpoint])
                .observe(duration.as_secs_f64());
        })
    }

    /// Renders the registry in Prometheus text format.
    pub fn render(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder
            .encode(&self.registry.gather(), &mut buffer)
            .context("encoding metrics")?;
        String::from_utf8(buffer).context("converting metrics to string")
    }

    /// Starts the HTTP server serving /metrics and /healthz.
    pub async fn start(&self) -> Result<()> {
        let addr = if self.addr.is_empty() {
            ":9090"
        } else {
            &self.addr
        };

        // Parse address, handling ":port" shorthand.
        let bind_addr = if addr.starts_with(':') {
            format!("0.0.0.0{addr}")
        } else {
            addr.to_string()
        };

        let registry = self.registry.clone();
        let app_state = Arc::new(AppState { registry });

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

    /// Gracefully shuts down the health metrics server.
    pub async fn stop(&self) -> Result<()> {
        if let Some(cancel) = self.shutdown.lock().take() {
            cancel.cancel();
        }

        Ok(())
    }
}

/// Shared state for axum handlers.
struct AppState {
    registry: Registry,
}

/// GET /metrics - Prometheus text format.
async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = state.registry.gather();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::error!(error = %e, "encoding metrics");
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            "encoding error".to_string(),
        );
    }

    match String::from_utf8(buffer) {
        Ok(text) => (StatusCode::OK, text),
        Err(e) => {
            tracing::error!(error = %e, "converting metrics to string");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "encoding error".to_string(),
            )
        }
    }
}

/// GET /healthz - Simple health check.
async fn healthz_handler() -> &'static str {
    "ok"
}
