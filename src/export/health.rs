use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use prometheus::{Counter, CounterVec, Encoder, Gauge, Opts, Registry, TextEncoder};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

/// Prometheus metrics for daemon health and observability.
///
/// All metrics use the "cemond" namespace.
pub struct HealthMetrics {
    registry: Registry,
    addr: String,
    shutdown: parking_lot::Mutex<Option<CancellationToken>>,

    /// Total decoded events received on the control socket.
    pub events_received: Counter,
    /// Events dropped by the pre-filters (no valid address, uncorrected,
    /// model dedup, mode off).
    pub events_filtered: Counter,
    /// Events that failed to parse as a decoded record.
    pub events_unparsable: Counter,
    /// Per-page threshold crossings that ran the trigger/offline path.
    pub thresholds_fired: Counter,
    /// Offline attempts by outcome (ok / failed).
    pub offline_attempts: CounterVec,
    /// Pages currently tracked in the accounting table.
    pub pages_tracked: Gauge,
    /// Counter replacements since startup.
    pub counter_replacements: Gauge,
}

impl HealthMetrics {
    /// Creates a new health metrics instance with all metrics registered.
    pub fn new(addr: &str) -> Result<Self> {
        let registry = Registry::new();

        let events_received = Counter::with_opts(
            Opts::new(
                "events_received_total",
                "Total decoded events received on the control socket.",
            )
            .namespace("cemond"),
        )?;
        let events_filtered = Counter::with_opts(
            Opts::new(
                "events_filtered_total",
                "Total events dropped by the accounting pre-filters.",
            )
            .namespace("cemond"),
        )?;
        let events_unparsable = Counter::with_opts(
            Opts::new(
                "events_unparsable_total",
                "Total lines that failed to parse as decoded records.",
            )
            .namespace("cemond"),
        )?;
        let thresholds_fired = Counter::with_opts(
            Opts::new(
                "thresholds_fired_total",
                "Total per-page threshold crossings that ran the action path.",
            )
            .namespace("cemond"),
        )?;
        let offline_attempts = CounterVec::new(
            Opts::new(
                "offline_attempts_total",
                "Total kernel page offline attempts by outcome.",
            )
            .namespace("cemond"),
            &["outcome"],
        )?;
        let pages_tracked = Gauge::with_opts(
            Opts::new(
                "pages_tracked",
                "Pages currently tracked in the accounting table.",
            )
            .namespace("cemond"),
        )?;
        let counter_replacements = Gauge::with_opts(
            Opts::new(
                "counter_replacements_total",
                "Tracked-page counter replacements since startup.",
            )
            .namespace("cemond"),
        )?;

        registry.register(Box::new(events_received.clone()))?;
        registry.register(Box::new(events_filtered.clone()))?;
        registry.register(Box::new(events_unparsable.clone()))?;
        registry.register(Box::new(thresholds_fired.clone()))?;
        registry.register(Box::new(offline_attempts.clone()))?;
        registry.register(Box::new(pages_tracked.clone()))?;
        registry.register(Box::new(counter_replacements.clone()))?;

        Ok(Self {
            registry,
            addr: addr.to_string(),
            shutdown: parking_lot::Mutex::new(None),
            events_received,
            events_filtered,
            events_unparsable,
            thresholds_fired,
            offline_attempts,
            pages_tracked,
            counter_replacements,
        })
    }

    /// Starts the HTTP server serving /metrics and /healthz.
    pub async fn start(&self) -> Result<()> {
        if self.addr.is_empty() {
            tracing::info!("health metrics server disabled");
            return Ok(());
        }

        // Parse address, handling ":port" shorthand.
        let bind_addr = if self.addr.starts_with(':') {
            format!("0.0.0.0{}", self.addr)
        } else {
            self.addr.clone()
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
    pub fn stop(&self) {
        if let Some(cancel) = self.shutdown.lock().take() {
            cancel.cancel();
        }
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
