//! The in-memory per-window aggregator: five bounded sample buffers, three
//! top-level counters, per-stage error counts, last-update timestamp (§3).

use model::{percentile, AggregateRecord, Event, PercentilePair, StageErrorCounters, WindowKey};

/// Samples and counters accumulated for one open window. Created lazily on
/// the first non-duplicate event into a `WindowKey`; destroyed on flush.
#[derive(Debug, Default)]
pub struct WindowBuffers {
    count_total: u64,
    count_success: u64,
    count_error: u64,
    stage_errors: StageErrorCounters,
    dns_ms: Vec<f64>,
    tcp_ms: Vec<f64>,
    tls_ms: Vec<f64>,
    ttfb_ms: Vec<f64>,
    throughput_kbps: Vec<f64>,
    last_update_ms: i64,
}

impl WindowBuffers {
    /// Folds one event's measurements into this window, per §4.3 step 3c.
    pub fn fold(&mut self, event: &Event, now_ms: i64) {
        self.count_total += 1;
        self.last_update_ms = now_ms;

        match event.error_stage {
            Some(stage) => {
                self.count_error += 1;
                self.stage_errors.increment(stage);
            }
            None => {
                self.count_success += 1;
                self.dns_ms.push(event.timings.dns_ms);
                self.tcp_ms.push(event.timings.tcp_ms);
                self.tls_ms.push(event.timings.tls_ms);
                self.ttfb_ms.push(event.timings.http_ttfb_ms);
                self.throughput_kbps.push(event.throughput_kbps);
            }
        }
    }

    /// Converts this window into a finalized, storable record (§4.3.1). The
    /// `diagnosis_label` is left `None`; the caller attaches it after
    /// consulting the diagnosis engine.
    pub fn finalize(self, key: WindowKey, sample_cap: usize, now_ms: i64) -> AggregateRecord {
        AggregateRecord {
            key,
            count_total: self.count_total,
            count_success: self.count_success,
            count_error: self.count_error,
            stage_errors: self.stage_errors,
            dns_ms: percentile_pair(&self.dns_ms, sample_cap),
            tcp_ms: percentile_pair(&self.tcp_ms, sample_cap),
            tls_ms: percentile_pair(&self.tls_ms, sample_cap),
            ttfb_ms: percentile_pair(&self.ttfb_ms, sample_cap),
            throughput_kbps: percentile_pair(&self.throughput_kbps, sample_cap),
            diagnosis_label: None,
            updated_at: now_ms,
        }
    }
}

fn percentile_pair(samples: &[f64], sample_cap: usize) -> PercentilePair {
    PercentilePair {
        p50: percentile::compute(samples, 50.0, sample_cap),
        p95: percentile::compute(samples, 95.0, sample_cap),
    }
}

#[cfg(test)]
mod test {
    use model::{ErrorStage, NetworkContext, Timings};

    use super::*;

    fn event(dns: f64, error_stage: Option<ErrorStage>) -> Event {
        Event {
            event_id: "e1".into(),
            client_id: "c1".into(),
            target: "t1".into(),
            ts_ms: 1_000,
            recv_ts_ms: Some(1_000),
            schema_version: "1".into(),
            network_context: NetworkContext {
                interface_type: "wifi".into(),
                vpn_enabled: false,
                user_label: None,
            },
            timings: Timings {
                dns_ms: dns,
                tcp_ms: 1.0,
                tls_ms: 1.0,
                http_ttfb_ms: 1.0,
            },
            throughput_kbps: 1000.0,
            error_stage,
        }
    }

    #[test]
    fn success_events_contribute_samples_and_error_events_do_not() {
        let mut buffers = WindowBuffers::default();
        buffers.fold(&event(10.0, None), 0);
        buffers.fold(&event(20.0, Some(ErrorStage::Dns)), 0);

        assert_eq!(buffers.count_total, 2);
        assert_eq!(buffers.count_success, 1);
        assert_eq!(buffers.count_error, 1);
        assert_eq!(buffers.stage_errors.dns, 1);
        assert_eq!(buffers.dns_ms, vec![10.0]);
    }

    #[test]
    fn finalize_computes_percentiles_over_success_samples_only() {
        let mut buffers = WindowBuffers::default();
        buffers.fold(&event(10.0, None), 0);
        buffers.fold(&event(20.0, None), 0);

        let key = WindowKey {
            client_id: "c1".into(),
            target: "t1".into(),
            window_start_ms: 0,
        };
        let record = buffers.finalize(key, 10_000, 5_000);
        assert_eq!(record.dns_ms.p50, Some(15.0));
        assert_eq!(record.updated_at, 5_000);
    }

    #[test]
    fn finalize_with_no_success_samples_yields_null_percentiles() {
        let mut buffers = WindowBuffers::default();
        buffers.fold(&event(10.0, Some(ErrorStage::Tcp)), 0);

        let key = WindowKey {
            client_id: "c1".into(),
            target: "t1".into(),
            window_start_ms: 0,
        };
        let record = buffers.finalize(key, 10_000, 0);
        assert_eq!(record.dns_ms.p50, None);
        assert_eq!(record.dns_ms.p95, None);
    }
}
