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

//! The diagnosis engine (C6): a pure function from a finalized window and a
//! rolling baseline to a single bottleneck label, or none. No I/O, no
//! side effects — [`classify`] never touches the aggregate store or the
//! in-memory aggregator; both are read by the caller beforehand.

use model::{AggregateRecord, DiagnosisLabel};

/// Minimum successful samples a historical window needs to count toward
/// the baseline.
const MIN_SUCCESS_FOR_BASELINE: u64 = 5;

/// Minimum qualifying historical windows required before any diagnosis is
/// emitted.
const MIN_QUALIFYING_WINDOWS: usize = 3;

/// Maximum historical windows folded into the baseline.
const MAX_BASELINE_WINDOWS: usize = 10;

/// The rolling baseline for one (client, target) pair, derived from its most
/// recent qualifying historical windows.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Baseline {
    /// Mean of `dns_p95` across qualifying windows.
    pub dns_p95_mean: f64,
    /// Mean of `tcp_p95 + tls_p95` across qualifying windows.
    pub handshake_p95_mean: f64,
    /// Mean of `ttfb_p95` across qualifying windows.
    pub ttfb_p95_mean: f64,
    /// Mean of `throughput_p50` across qualifying windows.
    pub throughput_p50_mean: f64,
    /// Population standard deviation of `tcp_p95`.
    pub sigma_tcp_p95: f64,
    /// Population standard deviation of `tls_p95`.
    pub sigma_tls_p95: f64,
    /// Population standard deviation of `ttfb_p95`.
    pub sigma_ttfb_p95: f64,
    /// Number of historical windows that qualified.
    pub qualifying_windows: usize,
}

impl Baseline {
    /// `σ_handshake = sqrt(σ_tcp² + σ_tls²)`, per §4.4.
    pub fn sigma_handshake(&self) -> f64 {
        (self.sigma_tcp_p95.powi(2) + self.sigma_tls_p95.powi(2)).sqrt()
    }
}

/// Computes the baseline from a set of historical windows for a single
/// (client, target). `history` need not be pre-filtered or pre-sorted; this
/// function applies the qualification filter, caps at the most recent
/// [`MAX_BASELINE_WINDOWS`] (assuming `history` is given newest-first, as the
/// store's `recent_history` query returns it), and returns `None` if fewer
/// than [`MIN_QUALIFYING_WINDOWS`] windows qualify.
pub fn compute_baseline(history: &[AggregateRecord]) -> Option<Baseline> {
    let qualifying: Vec<&AggregateRecord> = history
        .iter()
        .filter(|w| w.count_success >= MIN_SUCCESS_FOR_BASELINE)
        .take(MAX_BASELINE_WINDOWS)
        .collect();

    if qualifying.len() < MIN_QUALIFYING_WINDOWS {
        return None;
    }

    let dns_p95: Vec<f64> = qualifying.iter().filter_map(|w| w.dns_ms.p95).collect();
    let tcp_p95: Vec<f64> = qualifying.iter().filter_map(|w| w.tcp_ms.p95).collect();
    let tls_p95: Vec<f64> = qualifying.iter().filter_map(|w| w.tls_ms.p95).collect();
    let ttfb_p95: Vec<f64> = qualifying.iter().filter_map(|w| w.ttfb_ms.p95).collect();
    let throughput_p50: Vec<f64> = qualifying.iter().filter_map(|w| w.throughput_kbps.p50).collect();
    let handshake: Vec<f64> = qualifying
        .iter()
        .filter_map(|w| Some(w.tcp_ms.p95? + w.tls_ms.p95?))
        .collect();

    Some(Baseline {
        dns_p95_mean: mean(&dns_p95),
        handshake_p95_mean: mean(&handshake),
        ttfb_p95_mean: mean(&ttfb_p95),
        throughput_p50_mean: mean(&throughput_p50),
        sigma_tcp_p95: population_stddev(&tcp_p95),
        sigma_tls_p95: population_stddev(&tls_p95),
        sigma_ttfb_p95: population_stddev(&ttfb_p95),
        qualifying_windows: qualifying.len(),
    })
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        0.0
    } else {
        values.iter().sum::<f64>() / values.len() as f64
    }
}

fn population_stddev(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let m = mean(values);
    let variance = values.iter().map(|v| (v - m).powi(2)).sum::<f64>() / values.len() as f64;
    variance.sqrt()
}

/// Classifies a finalized window against its baseline, in strict priority
/// order per §4.4. Pure: no I/O, no mutation, same inputs always produce the
/// same output (P8).
pub fn classify(window: &AggregateRecord, baseline: &Baseline) -> Option<DiagnosisLabel> {
    if window.count_success < MIN_SUCCESS_FOR_BASELINE {
        return None;
    }

    let dns_p95 = window.dns_ms.p95?;
    let tcp_p95 = window.tcp_ms.p95?;
    let tls_p95 = window.tls_ms.p95?;
    let ttfb_p95 = window.ttfb_ms.p95?;
    let throughput_p50 = window.throughput_kbps.p50?;

    let total_latency_p95 = dns_p95 + tcp_p95 + tls_p95 + ttfb_p95;
    let handshake_p95 = tcp_p95 + tls_p95;
    let sigma_handshake = baseline.sigma_handshake();

    if total_latency_p95 > 0.0
        && dns_p95 / total_latency_p95 >= 0.60
        && dns_p95 >= 1.50 * baseline.dns_p95_mean
    {
        return Some(DiagnosisLabel::DnsBound);
    }

    if handshake_p95 > baseline.handshake_p95_mean + 2.0 * sigma_handshake
        || handshake_p95 >= 2.0 * baseline.handshake_p95_mean
    {
        return Some(DiagnosisLabel::HandshakeBound);
    }

    if ttfb_p95 > baseline.ttfb_p95_mean + 2.0 * baseline.sigma_ttfb_p95
        && handshake_p95 <= baseline.handshake_p95_mean + sigma_handshake
    {
        return Some(DiagnosisLabel::ServerBound);
    }

    if baseline.throughput_p50_mean > 0.0
        && (baseline.throughput_p50_mean - throughput_p50) / baseline.throughput_p50_mean >= 0.30
    {
        return Some(DiagnosisLabel::ThroughputBound);
    }

    None
}
