//! Prometheus metrics and the `/healthz` + `/metrics` observability server.
//!
//! Trimmed from the teacher's `prom_metrics.rs`: same `Registry` +
//! `Family`/`Gauge` shape, scoped down to the counters and gauges a
//! reconciliation loop actually needs instead of a whole coordinator's
//! worth. No operator-facing routes — those belong to the external front
//! end, out of scope here.

use std::sync::atomic::AtomicU64;
use std::sync::Arc;

use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use prometheus_client::encoding::text::encode;
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::registry::Registry;
use tower_http::trace::TraceLayer;

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct CommandLabel {
    pub command: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ErrorLabel {
    pub error_type: String,
}

/// Thread-safe metrics registry for the dispatcher. Every field is cheap to
/// clone (the `Family`/`Gauge`/`Counter` types are themselves `Arc`-backed),
/// so the whole struct is handed out behind one `Arc` to both the
/// reconciliation loop and the `axum` handlers.
pub struct Metrics {
    pub registry: Registry,
    pub ticks_run: Counter,
    pub commands_sent: Family<CommandLabel, Counter>,
    pub aggregation_errors: Family<ErrorLabel, Counter>,
    pub queue_depth: Gauge,
    pub detectors_tracked: Gauge,
    pub tick_duration_ms: Gauge<f64, AtomicU64>,
}

impl Metrics {
    pub fn new() -> Self {
        let mut registry = Registry::default();

        let ticks_run = Counter::default();
        registry.register(
            "dispatcher_ticks",
            "Total reconciliation ticks run",
            ticks_run.clone(),
        );

        let commands_sent = Family::<CommandLabel, Counter>::default();
        registry.register(
            "dispatcher_commands_sent",
            "Total commands published by kind",
            commands_sent.clone(),
        );

        let aggregation_errors = Family::<ErrorLabel, Counter>::default();
        registry.register(
            "dispatcher_aggregation_errors",
            "Total errors encountered during aggregation or control, by type",
            aggregation_errors.clone(),
        );

        let queue_depth = Gauge::default();
        registry.register(
            "dispatcher_queue_depth",
            "Number of commands currently pending in the command pipeline",
            queue_depth.clone(),
        );

        let detectors_tracked = Gauge::default();
        registry.register(
            "dispatcher_detectors_tracked",
            "Number of logical detectors covered by the most recent tick",
            detectors_tracked.clone(),
        );

        let tick_duration_ms = Gauge::<f64, AtomicU64>::default();
        registry.register(
            "dispatcher_tick_duration_ms",
            "Wall-clock duration of the most recent reconciliation tick, in milliseconds",
            tick_duration_ms.clone(),
        );

        Self {
            registry,
            ticks_run,
            commands_sent,
            aggregation_errors,
            queue_depth,
            detectors_tracked,
            tick_duration_ms,
        }
    }

    pub fn encode(&self) -> String {
        let mut buf = String::new();
        encode(&mut buf, &self.registry).expect("encoding metrics should not fail");
        buf
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

async fn handler_healthz() -> impl IntoResponse {
    "ok"
}

async fn handler_metrics(State(metrics): State<Arc<Metrics>>) -> impl IntoResponse {
    (
        [("content-type", "application/openmetrics-text; version=1.0.0; charset=utf-8")],
        metrics.encode(),
    )
}

pub fn build_router(metrics: Arc<Metrics>) -> Router {
    Router::new()
        .route("/healthz", get(handler_healthz))
        .route("/metrics", get(handler_metrics))
        .with_state(metrics)
        .layer(TraceLayer::new_for_http())
}

/// Serve `/healthz` and `/metrics` on `port` until `shutdown` resolves.
/// Mirrors the teacher's `dashboard.rs` serve loop: bind, `axum::serve`,
/// graceful shutdown, nothing fancier.
pub async fn run_server(
    metrics: Arc<Metrics>,
    port: u16,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    let app = build_router(metrics);
    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, "metrics server listening");
    axum::serve(listener, app).with_graceful_shutdown(shutdown).await?;
    Ok(())
}
