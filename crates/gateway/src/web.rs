//! HTTP surface: `/healthz`, `/readyz`, `/metrics`, the `/api/*` operator
//! introspection endpoints, and the `/v1/stream` WebSocket upgrade. Follows
//! the teacher's `web.rs` router-construction style
//! (`Router::new().route(...).with_state(...)`); unlike the teacher this
//! gateway serves no UI assets (out of scope per §1).

use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json};
use axum::routing::{get, post};
use axum::Router;
use metrics_exporter_prometheus::PrometheusHandle;
use tokio::net::TcpListener;
use tracing::info;

use crate::alerts::AlertEngine;
use crate::hub::{ws_handler, SubscriberHub};
use crate::ingest::http::{ingest_handler, IngestState};
use crate::registry::Registry;
use crate::sink::DurableSink;
use crate::state::SharedState;

#[derive(Clone)]
pub struct AppState {
    pub shared: SharedState,
    pub registry: Arc<Registry>,
    pub sink: Arc<dyn DurableSink>,
    pub alerts: Arc<AlertEngine>,
    pub hub: Arc<SubscriberHub>,
    pub ingest: Arc<IngestState>,
    pub metrics_handle: Arc<PrometheusHandle>,
    pub mqtt_connected: Arc<std::sync::atomic::AtomicBool>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics))
        .route("/api/status", get(api_status))
        .route("/api/devices", get(api_devices))
        .route("/v1/ingest", post(ingest_handler).with_state(state.ingest.clone()))
        .route("/v1/stream", get(ws_handler).with_state(state.hub.clone()))
        .with_state(state)
}

/// Liveness: OK unless the Supervisor has begun shutdown (§4.8).
async fn healthz(State(state): State<AppState>) -> impl IntoResponse {
    let st = state.shared.read().await;
    if st.shutting_down {
        (StatusCode::SERVICE_UNAVAILABLE, "shutting down").into_response()
    } else {
        (StatusCode::OK, "ok").into_response()
    }
}

/// Readiness: OK only when MQTT is connected AND the durable sink's last
/// write is recent (§4.8).
async fn readyz(State(state): State<AppState>) -> impl IntoResponse {
    let mqtt_ok = state.mqtt_connected.load(Ordering::Relaxed);
    let sink_fresh = state.sink.last_write_age_secs() < 60;
    if mqtt_ok && sink_fresh {
        (StatusCode::OK, "ready").into_response()
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            format!("mqtt_connected={mqtt_ok} sink_fresh={sink_fresh}"),
        )
            .into_response()
    }
}

async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    ([(axum::http::header::CONTENT_TYPE, "text/plain; version=0.0.4")], state.metrics_handle.render())
}

async fn api_status(State(state): State<AppState>) -> impl IntoResponse {
    let st = state.shared.read().await;
    let devices_known = state.registry.len().await;
    let alerts_open = state.alerts.open_alert_count().await;
    let subscribers_connected = state.hub.connected_count();
    let durable_wab_depth = state.sink.wab_depth();
    Json(st.to_status(devices_known, alerts_open, subscribers_connected, durable_wab_depth))
}

async fn api_devices(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.registry.list().await)
}

pub async fn serve(bind: &str, state: AppState, shutdown: tokio_util::sync::CancellationToken) {
    let addr: SocketAddr = bind.parse().expect("invalid http bind address");
    let listener = TcpListener::bind(addr).await.expect("failed to bind http port");
    info!(%addr, "http listening");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .expect("http server error");
}
