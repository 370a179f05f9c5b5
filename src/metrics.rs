// Prometheus metrics for the signal executor.
//
// One global registry behind a Lazy, served over a small axum app on its own
// port. Call init() at startup and get() everywhere else.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get as axum_get,
    Router,
};
use log::{error, info};
use prometheus::{Histogram, HistogramOpts, IntCounter, Opts, Registry};
use std::sync::Arc;
use tokio::net::TcpListener;

static METRICS: once_cell::sync::Lazy<Arc<ExecutorMetrics>> =
    once_cell::sync::Lazy::new(|| Arc::new(ExecutorMetrics::new()));

pub struct ExecutorMetrics {
    registry: Registry,

    // Signal intake
    pub signals_received: IntCounter,
    pub signals_rejected: IntCounter,
    pub signals_duplicate: IntCounter,

    // Trade outcomes
    pub trades_success: IntCounter,
    pub trades_failed: IntCounter,
    pub attempts_total: IntCounter,

    // Broadcast / confirmation
    pub broadcast_channel_errors: IntCounter,
    pub confirmations_timed_out: IntCounter,

    // Latency
    pub execution_seconds: Histogram,
    pub confirmation_seconds: Histogram,

    // Persistence
    pub db_errors: IntCounter,
}

impl ExecutorMetrics {
    fn new() -> Self {
        let registry = Registry::new();

        let counter = |name: &str, help: &str| {
            let c = IntCounter::with_opts(Opts::new(name, help)).unwrap();
            registry.register(Box::new(c.clone())).unwrap();
            c
        };

        let signals_received = counter("executor_signals_received", "Webhook signals accepted");
        let signals_rejected = counter(
            "executor_signals_rejected",
            "Webhook payloads rejected at normalization",
        );
        let signals_duplicate = counter(
            "executor_signals_duplicate",
            "Signals dropped by the idempotency claim",
        );
        let trades_success = counter("executor_trades_success", "Signals that confirmed on-chain");
        let trades_failed = counter("executor_trades_failed", "Signals that failed terminally");
        let attempts_total = counter("executor_attempts_total", "Execution attempts started");
        let broadcast_channel_errors = counter(
            "executor_broadcast_channel_errors",
            "Individual broadcast channel send failures",
        );
        let confirmations_timed_out = counter(
            "executor_confirmations_timed_out",
            "Attempts that hit the confirmation deadline",
        );
        let db_errors = counter("executor_db_errors", "Outcome store write failures");

        let execution_seconds = Histogram::with_opts(
            HistogramOpts::new(
                "executor_execution_seconds",
                "End-to-end signal execution latency",
            )
            .buckets(vec![0.5, 1.0, 2.5, 5.0, 10.0, 20.0, 40.0, 80.0]),
        )
        .unwrap();
        registry
            .register(Box::new(execution_seconds.clone()))
            .unwrap();

        let confirmation_seconds = Histogram::with_opts(
            HistogramOpts::new(
                "executor_confirmation_seconds",
                "Broadcast-to-confirmation latency",
            )
            .buckets(vec![0.5, 1.0, 2.0, 5.0, 10.0, 15.0, 30.0]),
        )
        .unwrap();
        registry
            .register(Box::new(confirmation_seconds.clone()))
            .unwrap();

        Self {
            registry,
            signals_received,
            signals_rejected,
            signals_duplicate,
            trades_success,
            trades_failed,
            attempts_total,
            broadcast_channel_errors,
            confirmations_timed_out,
            execution_seconds,
            confirmation_seconds,
            db_errors,
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}

pub fn get() -> Arc<ExecutorMetrics> {
    METRICS.clone()
}

/// Force initialization of the lazy static at startup.
pub fn init() {
    let _ = METRICS.clone();
    info!("📊 Metrics system initialized");
}

pub async fn start_metrics_server(port: u16) -> anyhow::Result<()> {
    let addr = format!("0.0.0.0:{}", port);
    let app = Router::new()
        .route("/metrics", axum_get(metrics_handler))
        .route("/health", axum_get(health_handler));

    let listener = TcpListener::bind(&addr).await?;
    info!("✓ Metrics server listening on http://{}/metrics", addr);
    axum::serve(listener, app).await?;
    Ok(())
}

async fn metrics_handler() -> Response {
    let metrics = METRICS.clone();
    let encoder = prometheus::TextEncoder::new();
    match encoder.encode_to_string(&metrics.registry().gather()) {
        Ok(body) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4")],
            body,
        )
            .into_response(),
        Err(e) => {
            error!("Failed to encode metrics: {}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, "encode error").into_response()
        }
    }
}

async fn health_handler() -> &'static str {
    "ok"
}
