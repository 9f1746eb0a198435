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

//! Wire and persistence types shared by the ingest boundary, the queue
//! adapter, the window aggregator, and the diagnosis engine.

use serde::{Deserialize, Serialize};

pub mod percentile;

/// Length of a window in milliseconds. Fixed at the spec's default; exposed
/// as a constant rather than a config knob consumed this deep in the model,
/// the aggregator reads the configured value and uses [`window_start_ms`]
/// with it directly.
pub const DEFAULT_WINDOW_SIZE_MS: i64 = 60_000;

/// The stage at which a probe measurement failed, if any.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
#[non_exhaustive]
pub enum ErrorStage {
    /// DNS resolution failed.
    Dns,
    /// TCP connect failed.
    Tcp,
    /// TLS handshake failed.
    Tls,
    /// HTTP request failed before a first byte was observed.
    Http,
    /// The bulk-download throughput probe failed.
    Throughput,
}

impl ErrorStage {
    /// Returns a short, stable name used for per-stage counters.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorStage::Dns => "dns",
            ErrorStage::Tcp => "tcp",
            ErrorStage::Tls => "tls",
            ErrorStage::Http => "http",
            ErrorStage::Throughput => "throughput",
        }
    }
}

/// Interface and VPN context reported alongside a measurement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkContext {
    /// e.g. `"wifi"`, `"wired"`, `"cellular"`.
    pub interface_type: String,
    /// Whether the probe host had an active VPN connection.
    pub vpn_enabled: bool,
    /// Optional free-form label set by the probe operator.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_label: Option<String>,
}

/// The four latency measurements taken per event.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Timings {
    /// DNS resolution time, milliseconds.
    pub dns_ms: f64,
    /// TCP connect time, milliseconds.
    pub tcp_ms: f64,
    /// TLS handshake time, milliseconds.
    pub tls_ms: f64,
    /// Time to first byte of the HTTP response, milliseconds.
    pub http_ttfb_ms: f64,
}

/// A single probe measurement, as received from the wire (post-validation
/// fields like `recv_ts_ms` are filled in by the ingest boundary).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Opaque, probe-generated unique identifier; the dedup primary key.
    pub event_id: String,
    /// Opaque, stable identifier of the probe installation.
    pub client_id: String,
    /// Opaque identifier (e.g. URL) of the measured endpoint.
    pub target: String,
    /// Probe-local event time, milliseconds since the epoch.
    pub ts_ms: i64,
    /// Receive time stamped by the ingest boundary. Absent on the wire;
    /// always present once C4 has processed the event.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recv_ts_ms: Option<i64>,
    /// Forward-compatibility version string.
    pub schema_version: String,
    /// Interface/VPN context.
    pub network_context: NetworkContext,
    /// The four timing measurements.
    pub timings: Timings,
    /// Bulk-download throughput, kbps.
    pub throughput_kbps: f64,
    /// The stage at which the measurement failed, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_stage: Option<ErrorStage>,
}

impl Event {
    /// Returns the window this event belongs to, given a window size.
    pub fn window_start_ms(&self, window_size_ms: i64) -> i64 {
        window_start_ms(self.ts_ms, window_size_ms)
    }

    /// The [`WindowKey`] this event contributes to.
    pub fn window_key(&self, window_size_ms: i64) -> WindowKey {
        WindowKey {
            client_id: self.client_id.clone(),
            target: self.target.clone(),
            window_start_ms: self.window_start_ms(window_size_ms),
        }
    }
}

/// Floors `ts_ms` to the start of its window.
pub fn window_start_ms(ts_ms: i64, window_size_ms: i64) -> i64 {
    (ts_ms.div_euclid(window_size_ms)) * window_size_ms
}

/// Identifies a single (client, target, window) bucket.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WindowKey {
    /// The client that produced the samples in this window.
    pub client_id: String,
    /// The target endpoint measured.
    pub target: String,
    /// Start of the window, milliseconds since the epoch.
    pub window_start_ms: i64,
}

/// The four bottleneck categories the diagnosis engine may emit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
#[non_exhaustive]
pub enum DiagnosisLabel {
    /// DNS resolution dominates total latency.
    DnsBound,
    /// TCP+TLS handshake time dominates relative to baseline.
    HandshakeBound,
    /// Time-to-first-byte is elevated while handshake is normal.
    ServerBound,
    /// Throughput has regressed relative to baseline.
    ThroughputBound,
}

impl DiagnosisLabel {
    /// The stable wire/storage string for this label.
    pub fn as_str(&self) -> &'static str {
        match self {
            DiagnosisLabel::DnsBound => "DNS-bound",
            DiagnosisLabel::HandshakeBound => "Handshake-bound",
            DiagnosisLabel::ServerBound => "Server-bound",
            DiagnosisLabel::ThroughputBound => "Throughput-bound",
        }
    }
}

/// Nullable P50/P95 pair for one metric.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct PercentilePair {
    /// 50th percentile, or `None` when no successful samples exist.
    pub p50: Option<f64>,
    /// 95th percentile, or `None` when no successful samples exist.
    pub p95: Option<f64>,
}

/// A finalized, durable aggregate for one (client, target, window).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateRecord {
    /// The key this record is stored under.
    pub key: WindowKey,
    /// Total events folded into this window, successes and errors.
    pub count_total: u64,
    /// Events with no `error_stage`.
    pub count_success: u64,
    /// Events with an `error_stage` set.
    pub count_error: u64,
    /// Error counters broken down by stage.
    pub stage_errors: StageErrorCounters,
    /// DNS latency percentiles over successful samples.
    pub dns_ms: PercentilePair,
    /// TCP connect latency percentiles over successful samples.
    pub tcp_ms: PercentilePair,
    /// TLS handshake latency percentiles over successful samples.
    pub tls_ms: PercentilePair,
    /// HTTP time-to-first-byte percentiles over successful samples.
    pub ttfb_ms: PercentilePair,
    /// Bulk-download throughput percentiles over successful samples.
    pub throughput_kbps: PercentilePair,
    /// The emitted diagnosis, if the baseline was sufficient.
    pub diagnosis_label: Option<DiagnosisLabel>,
    /// Last mutation time, milliseconds since the epoch.
    pub updated_at: i64,
}

/// Per-stage error counters, mirroring `error_stage`'s closed set.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct StageErrorCounters {
    /// Count of `error_stage = DNS`.
    pub dns: u64,
    /// Count of `error_stage = TCP`.
    pub tcp: u64,
    /// Count of `error_stage = TLS`.
    pub tls: u64,
    /// Count of `error_stage = HTTP`.
    pub http: u64,
    /// Count of `error_stage = throughput`.
    pub throughput: u64,
}

impl StageErrorCounters {
    /// Increments the counter for `stage`.
    pub fn increment(&mut self, stage: ErrorStage) {
        match stage {
            ErrorStage::Dns => self.dns += 1,
            ErrorStage::Tcp => self.tcp += 1,
            ErrorStage::Tls => self.tls += 1,
            ErrorStage::Http => self.http += 1,
            ErrorStage::Throughput => self.throughput += 1,
        }
    }

    /// Sum of all per-stage counters; must equal `count_error` (P3).
    pub fn total(&self) -> u64 {
        self.dns + self.tcp + self.tls + self.http + self.throughput
    }
}

/// A dedup row: the fact that `event_id` has been observed at least once.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DedupRecord {
    /// The event identifier, primary key.
    pub event_id: String,
    /// The client that produced the event, kept for diagnostics.
    pub client_id: String,
    /// The event's own timestamp, kept for diagnostics.
    pub ts_ms: i64,
    /// When this dedup row was inserted.
    pub created_at: i64,
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn window_start_floors_to_the_window_size() {
        assert_eq!(window_start_ms(60_000, 60_000), 60_000);
        assert_eq!(window_start_ms(119_999, 60_000), 60_000);
        assert_eq!(window_start_ms(120_000, 60_000), 120_000);
        assert_eq!(window_start_ms(0, 60_000), 0);
    }

    #[test]
    fn stage_error_counters_sum_matches_total() {
        let mut counters = StageErrorCounters::default();
        counters.increment(ErrorStage::Dns);
        counters.increment(ErrorStage::Dns);
        counters.increment(ErrorStage::Tls);
        assert_eq!(counters.total(), 3);
        assert_eq!(counters.dns, 2);
        assert_eq!(counters.tls, 1);
    }

    #[test]
    fn event_window_key_groups_by_client_target_and_window() {
        let event = Event {
            event_id: "e1".into(),
            client_id: "c1".into(),
            target: "t1".into(),
            ts_ms: 65_000,
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
            throughput_kbps: 1000.0,
            error_stage: None,
        };

        let key = event.window_key(DEFAULT_WINDOW_SIZE_MS);
        assert_eq!(key.client_id, "c1");
        assert_eq!(key.target, "t1");
        assert_eq!(key.window_start_ms, 60_000);
    }
}
