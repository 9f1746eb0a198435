//! End-to-end coverage of the wired pipeline: the ingest HTTP boundary, the
//! queue adapter, the window aggregator, the aggregate store, and the
//! diagnosis engine, composed the way [`engine::run`] composes them but
//! against the in-memory fakes instead of Postgres/NATS.

#[path = "common/mod.rs"]
mod common;

use std::{collections::HashSet, sync::Arc, time::Duration};

use aggregator::{AggregatorConfig, AggregatorMetrics};
use axum::{body::Body, http::{Request, StatusCode}};
use ingest::{AppState, IngestConfig, SchemaValidationMode};
use model::{DiagnosisLabel, Event, NetworkContext, Timings};
use queue::{memory::MemoryQueue, Queue};
use store::memory::MemoryStore;
use tokio::sync::watch;
use tower::ServiceExt;

use common::{wait_until, AUTH_TOKEN};

fn ingest_config() -> IngestConfig {
    let mut auth_tokens = HashSet::new();
    let _ = auth_tokens.insert(AUTH_TOKEN.to_string());
    IngestConfig {
        auth_tokens,
        rate_limit_per_client: 1_000.0,
        rate_burst_per_client: 1_000,
        known_schema_versions: HashSet::new(),
        schema_validation_mode: SchemaValidationMode::Strict,
    }
}

fn event(event_id: &str, window_start_ms: i64, offset_ms: i64, dns_ms: f64) -> Event {
    Event {
        event_id: event_id.into(),
        client_id: "probe-1".into(),
        target: "https://example.test".into(),
        ts_ms: window_start_ms + offset_ms,
        recv_ts_ms: None,
        schema_version: "1".into(),
        network_context: NetworkContext {
            interface_type: "wifi".into(),
            vpn_enabled: false,
            user_label: None,
        },
        timings: Timings {
            dns_ms,
            tcp_ms: 30.0,
            tls_ms: 20.0,
            http_ttfb_ms: 50.0,
        },
        throughput_kbps: 5_000.0,
        error_stage: None,
    }
}

/// Publishes `events` into `queue`, runs the aggregator against `store` until
/// every publish has cleared dedup (so shutdown never races the channel
/// drain), then shuts it down with an unconditional drain-flush and waits for
/// it to exit.
async fn run_round(queue: Arc<dyn Queue>, store: Arc<MemoryStore>, events: &[Event]) {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let metrics = Arc::new(AggregatorMetrics::default());

    let handle = tokio::spawn(aggregator::run(
        queue.clone(),
        store.clone(),
        AggregatorConfig::default(),
        metrics,
        shutdown_rx,
    ));

    let dedup_len_before = store.dedup_len();
    for event in events {
        queue.publish(event).await.expect("publish into memory queue cannot fail");
    }

    let store_for_poll = store.clone();
    let expected = dedup_len_before + events.len();
    let drained = wait_until(Duration::from_secs(2), move || store_for_poll.dedup_len() >= expected).await;
    assert!(drained, "aggregator did not dequeue all published events in time");

    shutdown_tx.send(true).expect("aggregator shutdown receiver still live");
    handle
        .await
        .expect("aggregator task did not panic")
        .expect("aggregator run exited cleanly");
}

#[tokio::test]
async fn http_ingest_request_flows_through_queue_and_aggregator_into_the_store() {
    let queue: Arc<dyn Queue> = Arc::new(MemoryQueue::default());
    let store = Arc::new(MemoryStore::new());
    let state = AppState::new(ingest_config(), queue.clone());
    let app = ingest::router(state.clone());

    let window_start_ms = 0;
    for i in 0..5 {
        let probe_event = event(&format!("e{i}"), window_start_ms, i * 1_000, 20.0);
        let request = Request::builder()
            .method("POST")
            .uri("/events")
            .header("authorization", format!("Bearer {AUTH_TOKEN}"))
            .header("content-type", "application/json")
            .body(Body::from(serde_json::to_vec(&probe_event).unwrap()))
            .unwrap();

        let response = app.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
    assert_eq!(state.metrics().published, 5);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let metrics = Arc::new(AggregatorMetrics::default());
    let handle = tokio::spawn(aggregator::run(
        queue.clone(),
        store.clone(),
        AggregatorConfig::default(),
        metrics,
        shutdown_rx,
    ));

    let store_for_poll = store.clone();
    let drained = wait_until(Duration::from_secs(2), move || store_for_poll.dedup_len() >= 5).await;
    assert!(drained, "aggregator did not dequeue all ingested events in time");

    shutdown_tx.send(true).unwrap();
    handle.await.unwrap().unwrap();

    let history = store.recent_history("probe-1", "https://example.test", 10).await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].count_success, 5);
    assert_eq!(history[0].diagnosis_label, None, "a single window has no baseline yet");
}

#[tokio::test]
async fn dns_bound_diagnosis_is_produced_end_to_end_after_a_baseline_accumulates() {
    let queue: Arc<dyn Queue> = Arc::new(MemoryQueue::default());
    let store = Arc::new(MemoryStore::new());

    // Five quiet baseline windows, 60s apart, each with 5 samples of steady
    // DNS time.
    for round in 0..5i64 {
        let window_start_ms = round * 60_000;
        let events: Vec<Event> = (0..5)
            .map(|i| event(&format!("baseline-{round}-{i}"), window_start_ms, i * 1_000, 100.0))
            .collect();
        run_round(queue.clone(), store.clone(), &events).await;
    }

    // A sixth window with DNS time far above the baseline mean.
    let current_window_start_ms = 5 * 60_000;
    let current_events: Vec<Event> = (0..5)
        .map(|i| event(&format!("current-{i}"), current_window_start_ms, i * 1_000, 400.0))
        .collect();
    run_round(queue.clone(), store.clone(), &current_events).await;

    let history = store.recent_history("probe-1", "https://example.test", 10).await.unwrap();
    assert_eq!(history.len(), 6);

    let current = history
        .iter()
        .find(|record| record.key.window_start_ms == current_window_start_ms)
        .expect("current window was upserted");
    assert_eq!(current.diagnosis_label, Some(DiagnosisLabel::DnsBound));

    let earliest = history
        .iter()
        .find(|record| record.key.window_start_ms == 0)
        .expect("first baseline window was upserted");
    assert_eq!(earliest.diagnosis_label, None, "too few prior windows existed to baseline against");
}
