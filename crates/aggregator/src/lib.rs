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

//! The window aggregator (C5): consumes the queue, deduplicates via the
//! store, accumulates samples per open window, closes windows on a timer,
//! invokes the diagnosis engine, and upserts finalized aggregates.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::Duration,
};

use model::{window_start_ms, AggregateRecord, Event, WindowKey};
use queue::{Delivery, Queue};
use store::Store;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

mod buffers;

use buffers::WindowBuffers;

/// Configuration for the aggregator, per §6's configuration surface.
#[derive(Debug, Clone, Copy)]
pub struct AggregatorConfig {
    /// Window length, milliseconds. Default 60s.
    pub window_size_ms: i64,
    /// Grace period after window end before the first flush. Default 10s.
    pub flush_delay_ms: i64,
    /// Tolerance for late-event classification. Default 120s.
    pub late_tolerance_ms: i64,
    /// Cadence of the background flush task. Default 5s.
    pub flush_interval: Duration,
    /// Sample cap above which percentile computation downsamples.
    pub percentile_sample_cap: usize,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            window_size_ms: model::DEFAULT_WINDOW_SIZE_MS,
            flush_delay_ms: 10_000,
            late_tolerance_ms: 120_000,
            flush_interval: Duration::from_secs(5),
            percentile_sample_cap: 10_000,
        }
    }
}

/// Errors fatal to the worker, per §7's `CorrectnessAssertionViolation`: a
/// dedup insert succeeded but a subsequent invariant failed. Propagating
/// this out of [`run`] is meant to trigger a process exit so the broker
/// redelivers in-flight events after restart.
#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// The queue's delivery channel closed; the consumer is gone.
    #[error("queue delivery channel closed")]
    ChannelClosed,
}

/// Running counts observed by the aggregator, for §4.5's user-visible
/// signals (queue-lag proxy, dedup rate, processing delay, late events).
#[derive(Debug, Default)]
pub struct AggregatorMetrics {
    duplicates: Mutex<u64>,
    late_events: Mutex<u64>,
    windows_flushed: Mutex<u64>,
    baseline_insufficient: Mutex<u64>,
}

impl AggregatorMetrics {
    fn incr(counter: &Mutex<u64>) {
        *counter.lock().expect("aggregator metrics mutex poisoned") += 1;
    }

    /// Snapshot of every counter.
    pub fn snapshot(&self) -> AggregatorMetricsSnapshot {
        AggregatorMetricsSnapshot {
            duplicates: *self.duplicates.lock().expect("aggregator metrics mutex poisoned"),
            late_events: *self.late_events.lock().expect("aggregator metrics mutex poisoned"),
            windows_flushed: *self.windows_flushed.lock().expect("aggregator metrics mutex poisoned"),
            baseline_insufficient: *self.baseline_insufficient.lock().expect("aggregator metrics mutex poisoned"),
        }
    }
}

/// A point-in-time copy of [`AggregatorMetrics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AggregatorMetricsSnapshot {
    /// Events whose `event_id` was already present in the dedup store.
    pub duplicates: u64,
    /// Events processed more than `late_tolerance_ms` after their receive time.
    pub late_events: u64,
    /// Windows that have been flushed (upserted) at least once.
    pub windows_flushed: u64,
    /// Windows upserted with a null `diagnosis_label` for lack of baseline data.
    pub baseline_insufficient: u64,
}

type OpenWindows = Mutex<HashMap<WindowKey, WindowBuffers>>;

/// Runs the aggregator until `shutdown` reports `true`, at which point all
/// open windows are flushed (bypassing the flush-delay gate) before
/// returning, per §4.3's shutdown policy.
pub async fn run(
    queue: Arc<dyn Queue>,
    store: Arc<dyn Store>,
    config: AggregatorConfig,
    metrics: Arc<AggregatorMetrics>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), Error> {
    let receiver = queue.consume().await.map_err(|err| {
        error!(error = %err, "failed to start queue consumer");
        Error::ChannelClosed
    })?;

    let open: Arc<OpenWindows> = Arc::new(Mutex::new(HashMap::new()));
    let mut flush_timer = tokio::time::interval(config.flush_interval);
    flush_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            delivery = receiver.recv_async() => {
                match delivery {
                    Ok(delivery) => {
                        handle_delivery(delivery, &queue, &store, &open, &config, &metrics).await;
                    }
                    Err(_) => {
                        info!("queue delivery channel closed, stopping aggregator");
                        break;
                    }
                }
            }
            _ = flush_timer.tick() => {
                flush_closed_windows(&store, &open, &config, &metrics, false).await;
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    info!("shutdown requested, draining open windows");
                    flush_closed_windows(&store, &open, &config, &metrics, true).await;
                    break;
                }
            }
        }
    }

    Ok(())
}

async fn handle_delivery(
    delivery: Delivery,
    queue: &Arc<dyn Queue>,
    store: &Arc<dyn Store>,
    open: &Arc<OpenWindows>,
    config: &AggregatorConfig,
    metrics: &Arc<AggregatorMetrics>,
) {
    let event = delivery.event;
    let now = now_ms();

    if let Some(recv_ts_ms) = event.recv_ts_ms {
        let delay = now - recv_ts_ms;
        debug!(event_id = %event.event_id, delay_ms = delay, "processing delay observed");
        if delay > config.late_tolerance_ms {
            AggregatorMetrics::incr(&metrics.late_events);
            warn!(event_id = %event.event_id, delay_ms = delay, "event processed past late tolerance");
        }
    }

    match store.dedup_insert_if_absent(&event.event_id, &event.client_id, event.ts_ms).await {
        Ok(false) => {
            AggregatorMetrics::incr(&metrics.duplicates);
            ack(queue, &event.event_id).await;
        }
        Ok(true) => {
            fold_into_window(open, &event, config.window_size_ms, now);
            ack(queue, &event.event_id).await;
        }
        Err(err) => {
            warn!(event_id = %event.event_id, error = %err, "dedup transaction failed, nacking for redelivery");
            nack(queue, &event.event_id, "dedup transaction failed").await;
        }
    }
}

fn fold_into_window(open: &Arc<OpenWindows>, event: &Event, window_size_ms: i64, now: i64) {
    let key = event.window_key(window_size_ms);
    let mut open = open.lock().expect("aggregator open-window mutex poisoned");
    open.entry(key).or_default().fold(event, now);
}

async fn ack(queue: &Arc<dyn Queue>, event_id: &str) {
    if let Err(err) = queue.ack(event_id).await {
        error!(event_id, error = %err, "failed to ack delivery after commit");
    }
}

async fn nack(queue: &Arc<dyn Queue>, event_id: &str, reason: &str) {
    if let Err(err) = queue.nack(event_id, reason).await {
        error!(event_id, error = %err, "failed to nack delivery");
    }
}

/// Detaches and finalizes every window eligible for flush. When `drain` is
/// `true`, the flush-delay gate is bypassed and every open window is
/// flushed regardless of age, per the shutdown policy.
async fn flush_closed_windows(
    store: &Arc<dyn Store>,
    open: &Arc<OpenWindows>,
    config: &AggregatorConfig,
    metrics: &Arc<AggregatorMetrics>,
    drain: bool,
) {
    let now = now_ms();
    let now_window_start = window_start_ms(now, config.window_size_ms);

    let due: Vec<(WindowKey, WindowBuffers)> = {
        let mut open = open.lock().expect("aggregator open-window mutex poisoned");
        let keys: Vec<WindowKey> = open
            .keys()
            .filter(|key| drain || key.window_start_ms < now_window_start - config.flush_delay_ms)
            .cloned()
            .collect();

        keys.into_iter()
            .filter_map(|key| open.remove(&key).map(|buffers| (key, buffers)))
            .collect()
    };

    for (key, buffers) in due {
        finalize_and_upsert(store, key, buffers, config, metrics, now).await;
    }
}

async fn finalize_and_upsert(
    store: &Arc<dyn Store>,
    key: WindowKey,
    buffers: WindowBuffers,
    config: &AggregatorConfig,
    metrics: &Arc<AggregatorMetrics>,
    now: i64,
) {
    let mut record = buffers.finalize(key.clone(), config.percentile_sample_cap, now);
    attach_diagnosis(store, &mut record, metrics).await;

    match store.upsert_aggregate(&record).await {
        Ok(()) => {
            AggregatorMetrics::incr(&metrics.windows_flushed);
            info!(
                client_id = %record.key.client_id,
                target = %record.key.target,
                window_start_ms = record.key.window_start_ms,
                diagnosis = record.diagnosis_label.map(|l| l.as_str()).unwrap_or("none"),
                "window flushed"
            );
        }
        Err(err) => {
            error!(
                client_id = %key.client_id,
                target = %key.target,
                window_start_ms = key.window_start_ms,
                error = %err,
                "failed to upsert finalized window, dropping on the floor for this cycle"
            );
        }
    }
}

async fn attach_diagnosis(store: &Arc<dyn Store>, record: &mut AggregateRecord, metrics: &Arc<AggregatorMetrics>) {
    let history = match store.recent_history(&record.key.client_id, &record.key.target, 10).await {
        Ok(history) => history,
        Err(err) => {
            warn!(error = %err, "baseline history lookup failed, treating as insufficient data");
            AggregatorMetrics::incr(&metrics.baseline_insufficient);
            return;
        }
    };

    match diagnosis::compute_baseline(&history) {
        Some(baseline) => {
            record.diagnosis_label = diagnosis::classify(record, &baseline);
        }
        None => {
            AggregatorMetrics::incr(&metrics.baseline_insufficient);
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

    use model::{NetworkContext, Timings};
    use queue::memory::MemoryQueue;
    use store::memory::MemoryStore;

    use super::*;

    fn sample_event(event_id: &str, ts_ms: i64) -> Event {
        Event {
            event_id: event_id.into(),
            client_id: "c1".into(),
            target: "t1".into(),
            ts_ms,
            recv_ts_ms: Some(ts_ms),
            schema_version: "1".into(),
            network_context: NetworkContext {
                interface_type: "wifi".into(),
                vpn_enabled: false,
                user_label: None,
            },
            timings: Timings {
                dns_ms: 10.0,
                tcp_ms: 10.0,
                tls_ms: 10.0,
                http_ttfb_ms: 10.0,
            },
            throughput_kbps: 1_000.0,
            error_stage: None,
        }
    }

    #[tokio::test]
    async fn duplicate_delivery_is_counted_and_not_folded_twice() {
        let queue: Arc<dyn Queue> = Arc::new(MemoryQueue::new(10, 5));
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let metrics = Arc::new(AggregatorMetrics::default());
        let open: Arc<OpenWindows> = Arc::new(Mutex::new(HashMap::new()));
        let config = AggregatorConfig::default();

        let event = sample_event("e1", 61_000);
        queue.publish(&event).await.unwrap();
        let receiver = queue.consume().await.unwrap();

        let first = receiver.recv_async().await.unwrap();
        handle_delivery(first, &queue, &store, &open, &config, &metrics).await;

        // Simulate redelivery of the same event_id (e.g. a crash after
        // commit but before ack).
        queue.publish(&event).await.unwrap();
        let second = receiver.recv_async().await.unwrap();
        handle_delivery(second, &queue, &store, &open, &config, &metrics).await;

        assert_eq!(metrics.snapshot().duplicates, 1);
        let open_guard = open.lock().unwrap();
        assert_eq!(open_guard.len(), 1);
    }

    #[tokio::test]
    async fn flush_upserts_a_finalized_window_with_no_diagnosis_below_baseline_minimum() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let open: Arc<OpenWindows> = Arc::new(Mutex::new(HashMap::new()));
        let metrics = Arc::new(AggregatorMetrics::default());
        let config = AggregatorConfig::default();

        let key = WindowKey {
            client_id: "c1".into(),
            target: "t1".into(),
            window_start_ms: 0,
        };
        fold_into_window(&open, &sample_event("e1", 1_000), config.window_size_ms, 1_000);

        flush_closed_windows(&store, &open, &config, &metrics, true).await;

        let stored = store.recent_history("c1", "t1", 10).await.unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].key, key);
        assert_eq!(stored[0].diagnosis_label, None);
        assert_eq!(metrics.snapshot().windows_flushed, 1);
    }
}
