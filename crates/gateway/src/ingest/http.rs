//! HTTP ingest: `POST /v1/ingest` accepts a JSON array of device frames,
//! authenticates via bearer token, and enqueues each frame's readings into
//! the Pipeline. Follows the teacher's `web.rs` router-construction style.

use std::sync::Arc;

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::codec::decode_frame;
use crate::ingest::KeyedRateLimiter;
use crate::pipeline::PipelineHandle;
use crate::registry::Registry;
use crate::state::SharedState;

const DEFAULT_MAX_CLOCK_SKEW_SECS: i64 = 24 * 3600;

pub struct IngestState {
    pub registry: Arc<Registry>,
    pub pipeline: PipelineHandle,
    pub limiter: Arc<KeyedRateLimiter>,
    pub auth_token: String,
    pub shared: SharedState,
}

#[derive(Serialize)]
pub struct IngestResponse {
    pub accepted: usize,
    pub rejected: usize,
    pub batch_id: String,
}

/// Returned on a `503` instead of a flat "pipeline backpressure" body so a
/// retrying client resends only the frames that never made it durable — the
/// frames before `retry_from_frame_index` were already accepted into the
/// write-ahead buffer and resending them would duplicate-process (§5).
#[derive(Serialize, serde::Deserialize)]
pub struct BackpressureResponse {
    pub accepted_frame_indices: Vec<usize>,
    pub rejected_frame_indices: Vec<usize>,
    pub retry_from_frame_index: usize,
    pub batch_size: usize,
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
}

/// `POST /v1/ingest` — body is a JSON array of device frames (§6).
pub async fn ingest_handler(
    State(state): State<Arc<IngestState>>,
    headers: HeaderMap,
    body: axum::body::Bytes,
) -> Response {
    let Some(token) = bearer_token(&headers) else {
        return (StatusCode::UNAUTHORIZED, "missing bearer token").into_response();
    };
    if token != state.auth_token {
        return (StatusCode::UNAUTHORIZED, "invalid bearer token").into_response();
    }

    let frames: Vec<serde_json::Value> = match serde_json::from_slice(&body) {
        Ok(f) => f,
        Err(_) => return (StatusCode::BAD_REQUEST, "body must be a JSON array").into_response(),
    };

    let batch_id = Uuid::new_v4().to_string();
    let batch_size = frames.len();
    let mut accepted_frame_indices = Vec::new();
    let mut rejected_frame_indices = Vec::new();
    let now = OffsetDateTime::now_utc();

    for (idx, frame_value) in frames.iter().enumerate() {
        let raw = match serde_json::to_vec(frame_value) {
            Ok(r) => r,
            Err(_) => {
                rejected_frame_indices.push(idx);
                continue;
            }
        };

        let decoded = match decode_frame(&raw, now, DEFAULT_MAX_CLOCK_SKEW_SECS) {
            Ok(d) => d,
            Err(e) => {
                crate::metrics::record_ingest_rejected("decode");
                state
                    .shared
                    .write()
                    .await
                    .record_error(format!("http ingest frame {idx} rejected: decode: {e}"));
                rejected_frame_indices.push(idx);
                continue;
            }
        };

        if !state.limiter.admit(&decoded.device_id).await {
            crate::metrics::record_ingest_rejected("rate_limited");
            rejected_frame_indices.push(idx);
            continue;
        }

        if state
            .registry
            .resolve_or_err(&decoded.device_id, None)
            .await
            .is_err()
        {
            crate::metrics::record_ingest_rejected("auth");
            state.shared.write().await.record_error(format!(
                "http ingest frame {idx} rejected: auth ({})",
                decoded.device_id
            ));
            rejected_frame_indices.push(idx);
            continue;
        }

        // Non-blocking enqueue: a full shard queue means the gateway is at
        // capacity, and the HTTP endpoint answers 503 rather than stalling
        // the whole batch (§4.3, §5). On a mid-batch failure we report
        // exactly which frames already made it durable so a retry doesn't
        // resend them.
        let reading_count = decoded.readings.len();
        let mut batch_ok = true;
        for reading in decoded.readings {
            if state.pipeline.try_enqueue(reading).is_err() {
                batch_ok = false;
                break;
            }
        }
        if batch_ok {
            crate::metrics::record_ingest_frame("http");
            state
                .shared
                .write()
                .await
                .record_reading(&decoded.device_id, reading_count);
            accepted_frame_indices.push(idx);
        } else {
            return backpressure_response(
                accepted_frame_indices,
                rejected_frame_indices,
                idx,
                batch_size,
            );
        }
    }

    (
        StatusCode::ACCEPTED,
        Json(IngestResponse {
            accepted: accepted_frame_indices.len(),
            rejected: rejected_frame_indices.len(),
            batch_id,
        }),
    )
        .into_response()
}

fn backpressure_response(
    accepted_frame_indices: Vec<usize>,
    rejected_frame_indices: Vec<usize>,
    retry_from_frame_index: usize,
    batch_size: usize,
) -> Response {
    let mut response = (
        StatusCode::SERVICE_UNAVAILABLE,
        Json(BackpressureResponse {
            accepted_frame_indices,
            rejected_frame_indices,
            retry_from_frame_index,
            batch_size,
        }),
    )
        .into_response();
    response
        .headers_mut()
        .insert("Retry-After", axum::http::HeaderValue::from_static("1"));
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alerts::AlertEngine;
    use crate::hub::SubscriberHub;
    use crate::ingest::KeyedRateLimiter;
    use crate::pipeline;
    use crate::registry::{Registry, UnknownDevicePolicy};
    use crate::sink::NullSink;
    use axum::body::Body;
    use axum::http::Request;
    use axum::routing::post;
    use axum::Router;
    use tower::ServiceExt;

    async fn router() -> Router {
        let registry = Arc::new(Registry::new(4, UnknownDevicePolicy::AutoProvision));
        let sink: Arc<dyn crate::sink::DurableSink> = Arc::new(NullSink::new());
        let hub = Arc::new(SubscriberHub::new(16, "slow_drop"));
        let alerts = Arc::new(AlertEngine::new(Vec::new()));
        let (pipeline, _tasks) = pipeline::spawn(4, 16, Arc::clone(&registry), sink, hub, alerts);
        let state = Arc::new(IngestState {
            registry,
            pipeline,
            limiter: Arc::new(KeyedRateLimiter::new(4, 1000.0, 1000.0)),
            auth_token: "test-token".into(),
            shared: Arc::new(tokio::sync::RwLock::new(crate::state::SystemState::new())),
        });
        Router::new()
            .route("/v1/ingest", post(ingest_handler))
            .with_state(state)
    }

    #[tokio::test]
    async fn accepts_valid_batch() {
        let app = router().await;
        let body = serde_json::json!([{
            "device_id": "HK_000001",
            "timestamp": "2024-01-26T14:30:25Z",
            "sensors": {"tires": [{"position": "FL", "pressure_kpa": 220.0}]}
        }]);
        let req = Request::builder()
            .method("POST")
            .uri("/v1/ingest")
            .header("Authorization", "Bearer test-token")
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::ACCEPTED);
    }

    #[tokio::test]
    async fn rejects_missing_bearer_token() {
        let app = router().await;
        let req = Request::builder()
            .method("POST")
            .uri("/v1/ingest")
            .body(Body::from("[]"))
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn rejects_wrong_bearer_token() {
        let app = router().await;
        let req = Request::builder()
            .method("POST")
            .uri("/v1/ingest")
            .header("Authorization", "Bearer wrong")
            .body(Body::from("[]"))
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn backpressure_reports_only_the_unaccepted_frames() {
        let registry = Arc::new(Registry::new(4, UnknownDevicePolicy::AutoProvision));
        // FailingSink(1) blocks the shard worker retrying its first item
        // forever, so exactly `queue_depth + 1` frames can ever be accepted
        // before try_enqueue starts failing.
        let sink: Arc<dyn crate::sink::DurableSink> = Arc::new(crate::sink::FailingSink::new(1));
        let hub = Arc::new(SubscriberHub::new(16, "slow_drop"));
        let alerts = Arc::new(AlertEngine::new(Vec::new()));
        let (pipeline, _tasks) = pipeline::spawn(1, 2, Arc::clone(&registry), sink, hub, alerts);
        let state = Arc::new(IngestState {
            registry,
            pipeline,
            limiter: Arc::new(KeyedRateLimiter::new(4, 1000.0, 1000.0)),
            auth_token: "test-token".into(),
            shared: Arc::new(tokio::sync::RwLock::new(crate::state::SystemState::new())),
        });
        let app = Router::new()
            .route("/v1/ingest", post(ingest_handler))
            .with_state(state);

        let frame = |id: &str| {
            serde_json::json!({
                "device_id": id,
                "timestamp": "2024-01-26T14:30:25Z",
                "sensors": {"tires": [{"position": "FL", "pressure_kpa": 220.0}]}
            })
        };
        let body = serde_json::json!([frame("HK_1"), frame("HK_2"), frame("HK_3"), frame("HK_4"), frame("HK_5")]);
        let req = Request::builder()
            .method("POST")
            .uri("/v1/ingest")
            .header("Authorization", "Bearer test-token")
            .body(Body::from(body.to_string()))
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);

        let body = http_body_util::BodyExt::collect(resp.into_body())
            .await
            .unwrap()
            .to_bytes();
        let parsed: BackpressureResponse = serde_json::from_slice(&body).unwrap();
        assert_eq!(parsed.batch_size, 5);
        assert!(parsed.retry_from_frame_index < parsed.batch_size);
        assert_eq!(parsed.accepted_frame_indices.len(), parsed.retry_from_frame_index);
        assert!(parsed.accepted_frame_indices.len() < parsed.batch_size);
    }

    #[tokio::test]
    async fn malformed_frame_counted_as_rejected_not_500() {
        let app = router().await;
        let body = serde_json::json!([{"timestamp": "2024-01-26T14:30:25Z"}]);
        let req = Request::builder()
            .method("POST")
            .uri("/v1/ingest")
            .header("Authorization", "Bearer test-token")
            .body(Body::from(body.to_string()))
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::ACCEPTED);
    }
}
