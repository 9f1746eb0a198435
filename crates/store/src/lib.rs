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

//! The persistence contract shared by the dedup store (C1) and the
//! aggregate store (C2). Per the spec's own design notes, these are one
//! narrow contract of typed operations rather than two separate traits:
//! `dedup_insert_if_absent`, `upsert_aggregate`, `recent_history`.

use async_trait::async_trait;
use model::AggregateRecord;

pub mod memory;
pub mod postgres;

/// Errors raised by a [`Store`] implementation.
#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// The underlying connection pool could not be reached.
    #[error("store unavailable: {reason}")]
    Unavailable {
        /// Driver-reported reason.
        reason: String,
    },

    /// A query executed but failed (constraint violation other than the
    /// dedup conflict, serialization failure, etc).
    #[error("store query '{operation}' failed: {reason}")]
    Query {
        /// Name of the operation that failed, for logging.
        operation: &'static str,
        /// Driver-reported reason.
        reason: String,
    },
}

/// Outcome of a [`Store::retention_sweep`] call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetentionReport {
    /// Rows deleted from the dedup store.
    pub dedup_rows_deleted: u64,
    /// Rows deleted from the aggregate store.
    pub aggregate_rows_deleted: u64,
}

/// The persistence contract the window aggregator (C5) and diagnosis engine
/// (C6) depend on. A single transactional critical section in the
/// aggregator calls `dedup_insert_if_absent` then, on first-insert,
/// eventually `upsert_aggregate`; `recent_history` is read-only and used to
/// build the diagnosis baseline.
#[async_trait]
pub trait Store: Send + Sync {
    /// Inserts `(event_id, client_id, ts_ms)` into the dedup store with
    /// "ignore on conflict" semantics. Returns `true` if the row was newly
    /// inserted, `false` if `event_id` already existed (a duplicate).
    async fn dedup_insert_if_absent(&self, event_id: &str, client_id: &str, ts_ms: i64) -> Result<bool, Error>;

    /// Upserts a finalized aggregate, keyed by `(client_id, target,
    /// window_start_ms)`. On conflict, all counters, percentiles,
    /// `diagnosis_label`, and `updated_at` are overwritten.
    async fn upsert_aggregate(&self, record: &AggregateRecord) -> Result<(), Error>;

    /// Returns up to `limit` most recent historical windows for
    /// `(client_id, target)`, newest first, for baseline computation.
    async fn recent_history(&self, client_id: &str, target: &str, limit: usize) -> Result<Vec<AggregateRecord>, Error>;

    /// Deletes dedup rows older than `dedup_cutoff_ms` and aggregate rows
    /// older than `aggregate_cutoff_ms` (both epoch milliseconds).
    async fn retention_sweep(&self, dedup_cutoff_ms: i64, aggregate_cutoff_ms: i64) -> Result<RetentionReport, Error>;
}
