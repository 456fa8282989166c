//! The ingest gateway's HTTP surface (spec §4.D / §6): `POST /ingest`,
//! `GET /health`, `GET /metrics`.

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::Json;
use chrono::Utc;
use constant_time_eq::constant_time_eq;
use mutt_types::event::Event;
use serde_json::json;
use tracing::{info, warn};

use crate::errors::{AppError, AppResult};
use crate::state::IngestState;

pub const INGEST_QUEUE: &str = "mutt:ingest_queue";
const INGEST_RATE_LIMIT_KEY: &str = "mutt:ratelimit:ingest";

fn authenticate(state: &IngestState, headers: &HeaderMap) -> AppResult<()> {
    let provided = headers
        .get("X-API-Key")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| AppError::unauthorized("missing X-API-Key header"))?;

    let candidates = state.static_config.api_key.candidates();
    let provided_bytes = provided.as_bytes();
    let matched = candidates
        .iter()
        .any(|candidate| constant_time_eq(candidate.as_bytes(), provided_bytes));

    if matched {
        Ok(())
    } else {
        Err(AppError::unauthorized("invalid API key"))
    }
}

/// `POST /ingest` (spec §4.D). Authenticate, parse/validate, rate-limit,
/// check backpressure, stamp metadata, and enqueue.
pub async fn ingest(
    State(state): State<IngestState>,
    headers: HeaderMap,
    body: axum::body::Bytes,
) -> AppResult<impl IntoResponse> {
    authenticate(&state, &headers)?;

    let max_body_bytes = state.static_config.ingest_max_body_bytes;
    if body.len() > max_body_bytes {
        return Err(AppError::oversize(format!(
            "payload of {} bytes exceeds cap of {max_body_bytes}",
            body.len()
        )));
    }

    let mut event: Event = serde_json::from_slice(&body)
        .map_err(|e| AppError::validation(format!("invalid event payload: {e}")))?;
    event.validate()?;

    let rate_limit = state.dyn_config.get_u64("ingest_rate_limit", 1000).await;
    let rate_period = state.dyn_config.get_u64("ingest_rate_period_s", 1).await;
    let decision = state
        .rate_limiter
        .check(INGEST_RATE_LIMIT_KEY, rate_period, rate_limit)
        .await?;
    if !decision.allowed {
        return Err(AppError::rate_limited("ingest rate limit exceeded"));
    }

    let cap = state.dyn_config.get_u64("ingest_queue_cap", 10_000).await;
    let depth = state.queue.length(INGEST_QUEUE).await?;
    if depth >= cap {
        return Err(AppError::backpressure("ingest queue at capacity"));
    }

    event.stamp_received(Utc::now());
    let correlation_id = event.correlation_id;
    let event_json = serde_json::to_string(&event)
        .map_err(|e| AppError::internal(format!("failed to serialize event: {e}")))?;

    state.queue.push(INGEST_QUEUE, &event_json).await?;

    info!(%correlation_id, hostname = %event.hostname, "event accepted");
    Ok((
        StatusCode::ACCEPTED,
        Json(json!({"status": "accepted", "correlation_id": correlation_id})),
    ))
}

/// `GET /health` (spec §6): liveness/readiness, gated on queue substrate
/// reachability.
pub async fn health(State(state): State<IngestState>) -> impl IntoResponse {
    match state.queue.length(INGEST_QUEUE).await {
        Ok(depth) => (
            StatusCode::OK,
            Json(json!({"status": "ok", "ingest_queue_depth": depth})),
        ),
        Err(e) => {
            warn!(error = %e, "health check failed: queue substrate unreachable");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({"status": "unreachable", "error": e.to_string()})),
            )
        }
    }
}

/// `GET /metrics` (spec §6): standard text exposition format. This process
/// tracks counters in-memory only; a full Prometheus registry is out of
/// scope (spec §1), so this hands back the minimal gauges the rest of the
/// pipeline already has cheap access to.
pub async fn metrics(State(state): State<IngestState>) -> impl IntoResponse {
    let depth = state.queue.length(INGEST_QUEUE).await.unwrap_or(0);
    let body = format!(
        "# TYPE mutt_ingest_queue_depth gauge\nmutt_ingest_queue_depth {depth}\n"
    );
    (StatusCode::OK, body)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    use axum::body::Body;
    use axum::http::Request;
    use axum::Router;
    use mutt_config::{DynConfig, RotatingSecret, StaticConfig};
    use mutt_contracts::queue::{MockQueueSubstrate, QueueError, ScriptReply};
    use mutt_core::ratelimit::SlidingWindowRateLimiter;
    use tower::ServiceExt;

    fn static_config() -> StaticConfig {
        StaticConfig {
            server_host: "0.0.0.0".to_string(),
            server_port: 8080,
            queue_url: "redis://127.0.0.1:6379".to_string(),
            database_url: "postgres://localhost/mutt".to_string(),
            sink_url: "https://example.invalid/webhook".to_string(),
            pod_id: "test-pod".to_string(),
            api_key: RotatingSecret {
                current: "secret-current".to_string(),
                next: Some("secret-next".to_string()),
            },
            sink_auth_token: RotatingSecret {
                current: "sink-secret".to_string(),
                next: None,
            },
            ingest_max_body_bytes: 1024,
            queue_pop_timeout: Duration::from_secs(5),
            sink_http_timeout: Duration::from_secs(10),
            audit_db_timeout: Duration::from_secs(5),
            config_read_timeout: Duration::from_secs(2),
            heartbeat_interval: Duration::from_secs(10),
            shutdown_grace_period: Duration::from_secs(30),
            pool_min_connections: 2,
            pool_max_connections: 10,
        }
    }

    fn app(mock: MockQueueSubstrate) -> Router {
        let queue: Arc<dyn mutt_contracts::queue::QueueSubstrate> = Arc::new(mock);
        let state = IngestState {
            rate_limiter: Arc::new(SlidingWindowRateLimiter::new(queue.clone())),
            dyn_config: DynConfig::new(queue.clone(), "test-pod", Duration::from_secs(5)),
            queue,
            static_config: Arc::new(static_config()),
        };
        Router::new()
            .route("/ingest", axum::routing::post(ingest))
            .route("/health", axum::routing::get(health))
            .route("/metrics", axum::routing::get(metrics))
            .with_state(state)
    }

    fn sample_event_body() -> String {
        serde_json::json!({
            "source_type": "syslog",
            "hostname": "core-01",
            "timestamp": "2026-01-01T00:00:00Z",
            "message": "Interface down on Gi0/1",
        })
        .to_string()
    }

    fn post_ingest(body: String, api_key: Option<&str>) -> Request<Body> {
        let mut builder = Request::builder()
            .method("POST")
            .uri("/ingest")
            .header("content-type", "application/json");
        if let Some(key) = api_key {
            builder = builder.header("X-API-Key", key);
        }
        builder.body(Body::from(body)).unwrap()
    }

    #[tokio::test]
    async fn accepts_a_valid_event_with_a_correct_api_key() {
        let mut mock = MockQueueSubstrate::new();
        mock.expect_kv_get().returning(|_| Ok(None));
        mock.expect_eval_script()
            .returning(|_, _, _| Ok(ScriptReply(serde_json::json!([1, 1]))));
        mock.expect_length().returning(|_| Ok(0));
        mock.expect_push()
            .withf(|list: &str, _item: &str| list == INGEST_QUEUE)
            .returning(|_, _| Ok(()));

        let response = app(mock)
            .oneshot(post_ingest(sample_event_body(), Some("secret-current")))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::ACCEPTED);
    }

    #[tokio::test]
    async fn accepts_the_rotated_next_api_key() {
        let mut mock = MockQueueSubstrate::new();
        mock.expect_kv_get().returning(|_| Ok(None));
        mock.expect_eval_script()
            .returning(|_, _, _| Ok(ScriptReply(serde_json::json!([1, 1]))));
        mock.expect_length().returning(|_| Ok(0));
        mock.expect_push().returning(|_, _| Ok(()));

        let response = app(mock)
            .oneshot(post_ingest(sample_event_body(), Some("secret-next")))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::ACCEPTED);
    }

    #[tokio::test]
    async fn rejects_missing_api_key() {
        let mock = MockQueueSubstrate::new();
        let response = app(mock)
            .oneshot(post_ingest(sample_event_body(), None))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn rejects_an_unknown_api_key() {
        let mock = MockQueueSubstrate::new();
        let response = app(mock)
            .oneshot(post_ingest(sample_event_body(), Some("not-a-real-key")))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn rejects_an_invalid_event_payload() {
        let mock = MockQueueSubstrate::new();
        let body = serde_json::json!({
            "source_type": "syslog",
            "hostname": "",
            "timestamp": "2026-01-01T00:00:00Z",
            "message": "should fail validation",
        })
        .to_string();

        let response = app(mock)
            .oneshot(post_ingest(body, Some("secret-current")))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn rejects_oversize_payload_before_parsing() {
        let mock = MockQueueSubstrate::new();
        let oversized = "x".repeat(2048);

        let response = app(mock)
            .oneshot(post_ingest(oversized, Some("secret-current")))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
    }

    #[tokio::test]
    async fn rate_limited_requests_get_429() {
        let mut mock = MockQueueSubstrate::new();
        mock.expect_kv_get().returning(|_| Ok(None));
        mock.expect_eval_script()
            .returning(|_, _, _| Ok(ScriptReply(serde_json::json!([0, 1000, 0.5]))));

        let response = app(mock)
            .oneshot(post_ingest(sample_event_body(), Some("secret-current")))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    }

    #[tokio::test]
    async fn queue_at_capacity_returns_503() {
        let mut mock = MockQueueSubstrate::new();
        mock.expect_kv_get().returning(|_| Ok(None));
        mock.expect_eval_script()
            .returning(|_, _, _| Ok(ScriptReply(serde_json::json!([1, 1]))));
        mock.expect_length().returning(|_| Ok(10_000));

        let response = app(mock)
            .oneshot(post_ingest(sample_event_body(), Some("secret-current")))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn health_reports_ok_with_queue_depth() {
        let mut mock = MockQueueSubstrate::new();
        mock.expect_length().returning(|_| Ok(3));

        let response = app(mock)
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn health_reports_unavailable_when_queue_is_unreachable() {
        let mut mock = MockQueueSubstrate::new();
        mock.expect_length()
            .returning(|_| Err(QueueError::Unavailable("connection refused".to_string())));

        let response = app(mock)
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn metrics_exposes_ingest_queue_depth_gauge() {
        let mut mock = MockQueueSubstrate::new();
        mock.expect_length().returning(|_| Ok(7));

        let response = app(mock)
            .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let text = String::from_utf8(bytes.to_vec()).unwrap();
        assert!(text.contains("mutt_ingest_queue_depth 7"));
    }
}
