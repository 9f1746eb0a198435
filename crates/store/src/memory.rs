//! An in-memory [`Store`] used by aggregator and ingest tests, the same way
//! this codebase's other crates use hand-written fakes behind the real
//! trait instead of mocking.

use std::{
    collections::HashMap,
    sync::Mutex,
};

use async_trait::async_trait;
use model::AggregateRecord;

use crate::{Error, RetentionReport, Store};

/// A `Store` backed by two in-process maps, guarded by a single mutex.
/// Intended for tests only; it has no durability and no concurrency tuning.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    dedup: HashMap<String, (String, i64, i64)>,
    aggregates: HashMap<(String, String, i64), AggregateRecord>,
}

impl MemoryStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of dedup rows currently stored, for assertions.
    pub fn dedup_len(&self) -> usize {
        self.inner.lock().expect("memory store mutex poisoned").dedup.len()
    }

    /// Returns a clone of the stored aggregate for a key, for assertions.
    pub fn get_aggregate(&self, client_id: &str, target: &str, window_start_ms: i64) -> Option<AggregateRecord> {
        self.inner
            .lock()
            .expect("memory store mutex poisoned")
            .aggregates
            .get(&(client_id.to_string(), target.to_string(), window_start_ms))
            .cloned()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn dedup_insert_if_absent(&self, event_id: &str, client_id: &str, ts_ms: i64) -> Result<bool, Error> {
        let mut inner = self.inner.lock().expect("memory store mutex poisoned");
        if inner.dedup.contains_key(event_id) {
            return Ok(false);
        }
        let _ = inner
            .dedup
            .insert(event_id.to_string(), (client_id.to_string(), ts_ms, now_ms()));
        Ok(true)
    }

    async fn upsert_aggregate(&self, record: &AggregateRecord) -> Result<(), Error> {
        let mut inner = self.inner.lock().expect("memory store mutex poisoned");
        let _ = inner.aggregates.insert(
            (
                record.key.client_id.clone(),
                record.key.target.clone(),
                record.key.window_start_ms,
            ),
            record.clone(),
        );
        Ok(())
    }

    async fn recent_history(&self, client_id: &str, target: &str, limit: usize) -> Result<Vec<AggregateRecord>, Error> {
        let inner = self.inner.lock().expect("memory store mutex poisoned");
        let mut matching: Vec<AggregateRecord> = inner
            .aggregates
            .values()
            .filter(|record| record.key.client_id == client_id && record.key.target == target)
            .cloned()
            .collect();

        matching.sort_by(|a, b| b.key.window_start_ms.cmp(&a.key.window_start_ms));
        matching.truncate(limit);
        Ok(matching)
    }

    async fn retention_sweep(&self, dedup_cutoff_ms: i64, aggregate_cutoff_ms: i64) -> Result<RetentionReport, Error> {
        let mut inner = self.inner.lock().expect("memory store mutex poisoned");

        let before_dedup = inner.dedup.len();
        inner.dedup.retain(|_, (_, _, created_at)| *created_at >= dedup_cutoff_ms);
        let dedup_rows_deleted = (before_dedup - inner.dedup.len()) as u64;

        let before_aggregates = inner.aggregates.len();
        inner.aggregates.retain(|_, record| record.updated_at >= aggregate_cutoff_ms);
        let aggregate_rows_deleted = (before_aggregates - inner.aggregates.len()) as u64;

        Ok(RetentionReport {
            dedup_rows_deleted,
            aggregate_rows_deleted,
        })
    }
}

fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("system clock before unix epoch")
        .as_millis() as i64
}
