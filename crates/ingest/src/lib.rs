#![deny(
    trivial_numeric_casts,
    missing_docs,
    unsafe_code,
    unstable_features,
    unused_import_braces,
    unused_qualifications,
    unused_extern_crates,
    unused_results
)]
#![warn(rust_2021_compatibility, unreachable_pub)]

//! The ingest boundary (C4): terminates probe submissions, authenticates,
//! rate-limits, validates, and durably enqueues events to the queue adapter.

use std::{
    collections::HashSet,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    routing::{get, post},
    Json, Router,
};
use model::Event;
use queue::Queue;
use serde::Serialize;
use tracing::{info, warn};

pub mod rate_limit;
pub mod validate;

use rate_limit::RateLimiter;
pub use validate::SchemaValidationMode;

/// Static configuration for the ingest boundary, drawn from §6's
/// configuration surface.
#[derive(Debug, Clone)]
pub struct IngestConfig {
    /// Accepted bearer credentials.
    pub auth_tokens: HashSet<String>,
    /// Sustained requests/sec allowed per `client_id`.
    pub rate_limit_per_client: f64,
    /// Token-bucket burst capacity per `client_id`.
    pub rate_burst_per_client: u32,
    /// Schema versions accepted without a lenient-mode tag.
    pub known_schema_versions: HashSet<String>,
    /// Unknown-version handling policy.
    pub schema_validation_mode: SchemaValidationMode,
}

/// Running counts of ingest outcomes, exposed for observability per §4.1.
#[derive(Debug, Default)]
pub struct IngestMetrics {
    auth_failures: AtomicU64,
    rate_limited: AtomicU64,
    validation_failures: AtomicU64,
    schema_version_rejected: AtomicU64,
    schema_version_lenient: AtomicU64,
    publish_failures: AtomicU64,
    published: AtomicU64,
}

impl IngestMetrics {
    /// Snapshot of every counter, for tests and admin endpoints.
    pub fn snapshot(&self) -> IngestMetricsSnapshot {
        IngestMetricsSnapshot {
            auth_failures: self.auth_failures.load(Ordering::Relaxed),
            rate_limited: self.rate_limited.load(Ordering::Relaxed),
            validation_failures: self.validation_failures.load(Ordering::Relaxed),
            schema_version_rejected: self.schema_version_rejected.load(Ordering::Relaxed),
            schema_version_lenient: self.schema_version_lenient.load(Ordering::Relaxed),
            publish_failures: self.publish_failures.load(Ordering::Relaxed),
            published: self.published.load(Ordering::Relaxed),
        }
    }
}

/// A point-in-time copy of [`IngestMetrics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngestMetricsSnapshot {
    /// Requests rejected for missing/unknown bearer credential.
    pub auth_failures: u64,
    /// Requests rejected by the per-client token bucket.
    pub rate_limited: u64,
    /// Requests rejected by field validation.
    pub validation_failures: u64,
    /// Requests rejected for an unknown schema version in strict mode.
    pub schema_version_rejected: u64,
    /// Requests accepted with an unknown schema version in lenient mode.
    pub schema_version_lenient: u64,
    /// Events that failed to publish to the queue.
    pub publish_failures: u64,
    /// Events successfully published.
    pub published: u64,
}

/// Shared state behind every ingest handler.
#[derive(Clone)]
pub struct AppState {
    config: Arc<IngestConfig>,
    queue: Arc<dyn Queue>,
    limiter: Arc<RateLimiter>,
    metrics: Arc<IngestMetrics>,
}

impl AppState {
    /// Builds ingest state backed by `queue`, per `config`.
    pub fn new(config: IngestConfig, queue: Arc<dyn Queue>) -> Self {
        let limiter = RateLimiter::new(config.rate_limit_per_client, config.rate_burst_per_client);
        Self {
            config: Arc::new(config),
            queue,
            limiter: Arc::new(limiter),
            metrics: Arc::new(IngestMetrics::default()),
        }
    }

    /// A snapshot of this instance's ingest counters.
    pub fn metrics(&self) -> IngestMetricsSnapshot {
        self.metrics.snapshot()
    }
}

/// Builds the ingest router: `POST /events`, `POST /events/batch`,
/// `GET /healthz`.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/events", post(post_event))
        .route("/events/batch", post(post_event_batch))
        .route("/healthz", get(healthz))
        .with_state(state)
}

/// Per-event outcome reported back on the batch endpoint.
#[derive(Debug, Serialize)]
pub struct EventOutcome {
    index: usize,
    status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    reason: Option<String>,
}

#[derive(Debug, Serialize)]
struct BatchResponse {
    outcomes: Vec<EventOutcome>,
}

async fn healthz() -> &'static str {
    "ok"
}

async fn post_event(State(state): State<AppState>, headers: HeaderMap, Json(event): Json<Event>) -> (StatusCode, &'static str) {
    let client_id = event.client_id.clone();
    match accept(&state, &headers, &client_id, event).await {
        Ok(()) => (StatusCode::OK, "ok"),
        Err(outcome) => (outcome.status, outcome.reason),
    }
}

async fn post_event_batch(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(events): Json<Vec<Event>>,
) -> (StatusCode, Json<BatchResponse>) {
    if !authenticate(&state, &headers) {
        let _ = state.metrics.auth_failures.fetch_add(1, Ordering::Relaxed);
        let outcomes = events
            .iter()
            .enumerate()
            .map(|(index, _)| EventOutcome {
                index,
                status: "error",
                reason: Some("auth".into()),
            })
            .collect();
        return (StatusCode::UNAUTHORIZED, Json(BatchResponse { outcomes }));
    }

    let mut outcomes = Vec::with_capacity(events.len());
    for (index, event) in events.into_iter().enumerate() {
        let client_id = event.client_id.clone();
        match accept_validated(&state, &client_id, event).await {
            Ok(()) => outcomes.push(EventOutcome {
                index,
                status: "ok",
                reason: None,
            }),
            Err(outcome) => outcomes.push(EventOutcome {
                index,
                status: "error",
                reason: Some(outcome.reason.to_string()),
            }),
        }
    }

    (StatusCode::OK, Json(BatchResponse { outcomes }))
}

struct Outcome {
    status: StatusCode,
    reason: &'static str,
}

fn authenticate(state: &AppState, headers: &HeaderMap) -> bool {
    let presented = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "));

    match presented {
        Some(token) => state.config.auth_tokens.contains(token),
        None => false,
    }
}

async fn accept(state: &AppState, headers: &HeaderMap, client_id: &str, event: Event) -> Result<(), Outcome> {
    if !authenticate(state, headers) {
        let _ = state.metrics.auth_failures.fetch_add(1, Ordering::Relaxed);
        return Err(Outcome {
            status: StatusCode::UNAUTHORIZED,
            reason: "auth",
        });
    }

    accept_validated(state, client_id, event).await
}

async fn accept_validated(state: &AppState, client_id: &str, event: Event) -> Result<(), Outcome> {
    let now_ms = now_ms();

    if !state.limiter.check(client_id, now_ms) {
        let _ = state.metrics.rate_limited.fetch_add(1, Ordering::Relaxed);
        return Err(Outcome {
            status: StatusCode::TOO_MANY_REQUESTS,
            reason: "rate_limited",
        });
    }

    if let Err(rejection) = validate::validate(
        &event,
        now_ms,
        &state.config.known_schema_versions,
        state.config.schema_validation_mode,
    ) {
        return match rejection {
            validate::Rejection::Validation(reason) => {
                let _ = state.metrics.validation_failures.fetch_add(1, Ordering::Relaxed);
                warn!(client_id, reason, "event failed validation");
                Err(Outcome {
                    status: StatusCode::BAD_REQUEST,
                    reason: "validation",
                })
            }
            validate::Rejection::UnknownSchemaVersion(version) => {
                let _ = state.metrics.schema_version_rejected.fetch_add(1, Ordering::Relaxed);
                warn!(client_id, version, "unknown schema version rejected");
                Err(Outcome {
                    status: StatusCode::BAD_REQUEST,
                    reason: "unknown_schema_version",
                })
            }
        };
    }

    if !state.config.known_schema_versions.is_empty() && !state.config.known_schema_versions.contains(&event.schema_version) {
        let _ = state.metrics.schema_version_lenient.fetch_add(1, Ordering::Relaxed);
        info!(client_id, version = %event.schema_version, "accepted unknown schema version under lenient policy");
    }

    let mut event = event;
    event.recv_ts_ms = Some(now_ms);

    match state.queue.publish(&event).await {
        Ok(()) => {
            let _ = state.metrics.published.fetch_add(1, Ordering::Relaxed);
            Ok(())
        }
        Err(err) => {
            let _ = state.metrics.publish_failures.fetch_add(1, Ordering::Relaxed);
            warn!(client_id, error = %err, "publish to queue failed");
            Err(Outcome {
                status: StatusCode::SERVICE_UNAVAILABLE,
                reason: "queue_unavailable",
            })
        }
    }
}

fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("system clock before unix epoch")
        .as_millis() as i64
}

#[cfg(test)]
mod test {
    use std::sync::Arc;

    use axum::{body::Body, http::Request};
    use model::{NetworkContext, Timings};
    use queue::memory::MemoryQueue;
    use tower::ServiceExt;

    use super::*;

    fn config() -> IngestConfig {
        let mut auth_tokens = HashSet::new();
        let _ = auth_tokens.insert("secret".to_string());
        IngestConfig {
            auth_tokens,
            rate_limit_per_client: 1_000.0,
            rate_burst_per_client: 1_000,
            known_schema_versions: HashSet::new(),
            schema_validation_mode: SchemaValidationMode::Strict,
        }
    }

    fn sample_event() -> Event {
        Event {
            event_id: "e1".into(),
            client_id: "c1".into(),
            target: "t1".into(),
            ts_ms: 1_000,
            recv_ts_ms: None,
            schema_version: "1".into(),
            network_context: NetworkContext {
                interface_type: "wifi".into(),
                vpn_enabled: false,
                user_label: None,
            },
            timings: Timings {
                dns_ms: 1.0,
                tcp_ms: 1.0,
                tls_ms: 1.0,
                http_ttfb_ms: 1.0,
            },
            throughput_kbps: 100.0,
            error_stage: None,
        }
    }

    #[tokio::test]
    async fn accepts_a_valid_authenticated_event() {
        let queue: Arc<dyn Queue> = Arc::new(MemoryQueue::default());
        let state = AppState::new(config(), queue.clone());
        let app = router(state.clone());

        let request = Request::builder()
            .method("POST")
            .uri("/events")
            .header("authorization", "Bearer secret")
            .header("content-type", "application/json")
            .body(Body::from(serde_json::to_vec(&sample_event()).unwrap()))
            .unwrap();

        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(state.metrics().published, 1);

        let receiver = queue.consume().await.unwrap();
        let delivery = receiver.try_recv().unwrap();
        assert_eq!(delivery.event.event_id, "e1");
        assert!(delivery.event.recv_ts_ms.is_some());
    }

    #[tokio::test]
    async fn rejects_missing_bearer_token() {
        let queue: Arc<dyn Queue> = Arc::new(MemoryQueue::default());
        let app = router(AppState::new(config(), queue));

        let request = Request::builder()
            .method("POST")
            .uri("/events")
            .header("content-type", "application/json")
            .body(Body::from(serde_json::to_vec(&sample_event()).unwrap()))
            .unwrap();

        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn rejects_invalid_event_with_400() {
        let queue: Arc<dyn Queue> = Arc::new(MemoryQueue::default());
        let app = router(AppState::new(config(), queue));

        let mut event = sample_event();
        event.event_id = String::new();

        let request = Request::builder()
            .method("POST")
            .uri("/events")
            .header("authorization", "Bearer secret")
            .header("content-type", "application/json")
            .body(Body::from(serde_json::to_vec(&event).unwrap()))
            .unwrap();

        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn batch_endpoint_reports_per_element_outcomes() {
        let queue: Arc<dyn Queue> = Arc::new(MemoryQueue::default());
        let app = router(AppState::new(config(), queue));

        let mut bad = sample_event();
        bad.event_id = "e2".into();
        bad.client_id = String::new();
        let batch = vec![sample_event(), bad];

        let request = Request::builder()
            .method("POST")
            .uri("/events/batch")
            .header("authorization", "Bearer secret")
            .header("content-type", "application/json")
            .body(Body::from(serde_json::to_vec(&batch).unwrap()))
            .unwrap();

        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let parsed: BatchResponse = serde_json::from_slice(&body).unwrap();
        assert_eq!(parsed.outcomes[0].status, "ok");
        assert_eq!(parsed.outcomes[1].status, "error");
    }

    #[tokio::test]
    async fn healthz_reports_ok() {
        let queue: Arc<dyn Queue> = Arc::new(MemoryQueue::default());
        let app = router(AppState::new(config(), queue));

        let request = Request::builder().uri("/healthz").body(Body::empty()).unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
