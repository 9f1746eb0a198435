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

//! The queue adapter (C3): an at-least-once event stream with explicit ack,
//! bounded redeliveries, and a companion dead-letter stream. Deliveries are
//! handed to the caller through a `flume` channel rather than a callback, so
//! the aggregator can race it against its flush timer using the same
//! `Signal`/`SignalReceiver` racing primitive this codebase already uses
//! between a processor and an exporter.

use async_trait::async_trait;
use model::Event;

pub mod memory;
pub mod nats;

/// Errors raised by a [`Queue`] implementation.
#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// The broker connection could not be established or was lost.
    #[error("queue unavailable: {reason}")]
    Unavailable {
        /// Driver-reported reason.
        reason: String,
    },

    /// A publish failed after the connection was otherwise healthy.
    #[error("publish failed: {reason}")]
    PublishFailed {
        /// Driver-reported reason.
        reason: String,
    },

    /// An ack/nack referenced a delivery the adapter no longer tracks
    /// (already resolved, or never delivered).
    #[error("unknown delivery for event '{event_id}'")]
    UnknownDelivery {
        /// The event id the caller tried to ack or nack.
        event_id: String,
    },
}

/// A single delivery of an event to the consumer, with the bookkeeping the
/// aggregator needs to apply late-tolerance (§4.3 step 1-2) and to drive the
/// ack/nack decision (§4.3 step 4-5).
#[derive(Debug, Clone)]
pub struct Delivery {
    /// The event payload.
    pub event: Event,
    /// How many times this message (by underlying broker identity) has been
    /// delivered, including this delivery. Starts at 1.
    pub delivery_count: u32,
    /// Wall-clock time the adapter received this delivery from the broker,
    /// milliseconds since the epoch.
    pub received_at_ms: i64,
}

/// The queue contract: durable publish, a single durable consumer, and
/// explicit ack/nack keyed by `event_id`, per §4.2.
#[async_trait]
pub trait Queue: Send + Sync {
    /// Durably appends `event`; resolves only after broker acknowledgment.
    async fn publish(&self, event: &Event) -> Result<(), Error>;

    /// Starts (or returns the already-started) durable consumer and returns
    /// the channel deliveries arrive on. Calling this more than once returns
    /// the same channel's receiving end cloned, per implementation.
    async fn consume(&self) -> Result<flume::Receiver<Delivery>, Error>;

    /// Positively acknowledges the delivery most recently handed to the
    /// consumer for `event_id`. Per P7, this must only be called after the
    /// caller's transaction has committed.
    async fn ack(&self, event_id: &str) -> Result<(), Error>;

    /// Negatively acknowledges the delivery for `event_id` with a reason
    /// recorded for dead-letter routing. Below `max_deliver`, the broker
    /// redelivers. At `max_deliver`, the adapter publishes the original
    /// event plus `reason` and the receive time to the dead-letter stream,
    /// then acks the original off the primary stream.
    async fn nack(&self, event_id: &str, reason: &str) -> Result<(), Error>;

    /// Stops accepting new deliveries and releases broker resources. Does
    /// not drain in-flight deliveries; callers drain before calling this.
    async fn close(&self) -> Result<(), Error>;
}

pub(crate) fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("system clock before unix epoch")
        .as_millis() as i64
}
