//! Shared helpers for the end-to-end pipeline tests: a probe event builder
//! and a small poll loop for waiting on the aggregator's background flush.

use std::time::Duration;

use model::{Event, NetworkContext, Timings};

pub const AUTH_TOKEN: &str = "test-token";

/// Builds a well-formed probe event for `client_id`/`target` at `ts_ms`.
pub fn sample_event(event_id: &str, client_id: &str, target: &str, ts_ms: i64) -> Event {
    Event {
        event_id: event_id.into(),
        client_id: client_id.into(),
        target: target.into(),
        ts_ms,
        recv_ts_ms: None,
        schema_version: "1".into(),
        network_context: NetworkContext {
            interface_type: "wifi".into(),
            vpn_enabled: false,
            user_label: None,
        },
        timings: Timings {
            dns_ms: 20.0,
            tcp_ms: 15.0,
            tls_ms: 15.0,
            http_ttfb_ms: 40.0,
        },
        throughput_kbps: 5_000.0,
        error_stage: None,
    }
}

/// Polls `condition` every 20ms until it returns `true` or `timeout` elapses,
/// returning whether it succeeded. Used to wait on the aggregator's
/// background flush without depending on its exact timer cadence.
pub async fn wait_until<F: Fn() -> bool>(timeout: Duration, condition: F) -> bool {
    let started = tokio::time::Instant::now();
    loop {
        if condition() {
            return true;
        }
        if started.elapsed() > timeout {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
