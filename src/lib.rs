#![deny(
    trivial_numeric_casts,
    missing_docs,
    unsafe_code,
    unstable_features,
    unused_import_braces,
    unused_qualifications,
    unused_extern_crates,
    unused_results,
    variant_size_differences
)]
#![warn(rust_2021_compatibility, unreachable_pub)]

//! A network quality-of-experience telemetry pipeline: probes report
//! per-request DNS/TCP/TLS/HTTP latencies and bulk-download throughput; the
//! service ingests those events, deduplicates and aggregates them into
//! 1-minute windows per (client, target), and labels each window with the
//! dominant performance bottleneck against a rolling baseline.
//!
//! The data path is three components wired together by [`engine::run`]:
//! [`ingest`] terminates and validates probe submissions and publishes to
//! [`queue`]; the [`aggregator`] consumes the queue, deduplicates and
//! accumulates samples via [`store`], and invokes [`diagnosis`] on window
//! close.

pub use aggregator;
pub use config;
pub use diagnosis;
pub use engine;
pub use ingest;
pub use model;
pub use queue;
pub use store;
pub use task;
