//! An in-memory [`Queue`] used by aggregator and ingest tests to exercise
//! redelivery, nack, and dead-letter routing deterministically, without a
//! broker.

use std::{collections::HashMap, sync::Mutex};

use async_trait::async_trait;
use model::Event;

use crate::{now_ms, Delivery, Error, Queue};

/// A dead-lettered event, as recorded by [`MemoryQueue`].
#[derive(Debug, Clone)]
pub struct DlqEntry {
    /// The original event payload.
    pub event: Event,
    /// The failure reason supplied by the last `nack`.
    pub reason: String,
    /// When the adapter first received this event.
    pub received_at_ms: i64,
}

struct InFlight {
    event: Event,
    delivery_count: u32,
    received_at_ms: i64,
}

/// In-memory `Queue` backed by a bounded `flume` channel. `publish` delivers
/// immediately to the single consumer channel, simulating a broker with no
/// queueing delay; redelivery and dead-lettering follow the same
/// delivery-count-vs-`max_deliver` rule as the NATS implementation.
pub struct MemoryQueue {
    max_deliver: u32,
    sender: flume::Sender<Delivery>,
    receiver: flume::Receiver<Delivery>,
    in_flight: Mutex<HashMap<String, InFlight>>,
    dlq: Mutex<Vec<DlqEntry>>,
}

impl MemoryQueue {
    /// Creates a queue with the given in-flight channel capacity and
    /// maximum delivery count before dead-lettering.
    pub fn new(channel_capacity: usize, max_deliver: u32) -> Self {
        let (sender, receiver) = flume::bounded(channel_capacity);
        Self {
            max_deliver,
            sender,
            receiver,
            in_flight: Mutex::new(HashMap::new()),
            dlq: Mutex::new(Vec::new()),
        }
    }

    /// Returns a snapshot of the dead-letter stream, for assertions.
    pub fn dlq_snapshot(&self) -> Vec<DlqEntry> {
        self.dlq.lock().expect("memory queue mutex poisoned").clone()
    }
}

impl Default for MemoryQueue {
    fn default() -> Self {
        Self::new(100, 5)
    }
}

#[async_trait]
impl Queue for MemoryQueue {
    async fn publish(&self, event: &Event) -> Result<(), Error> {
        let delivery = Delivery {
            event: event.clone(),
            delivery_count: 1,
            received_at_ms: now_ms(),
        };

        let mut in_flight = self.in_flight.lock().expect("memory queue mutex poisoned");
        let _ = in_flight.insert(
            event.event_id.clone(),
            InFlight {
                event: event.clone(),
                delivery_count: 1,
                received_at_ms: delivery.received_at_ms,
            },
        );
        drop(in_flight);

        self.sender
            .send_async(delivery)
            .await
            .map_err(|err| Error::PublishFailed { reason: err.to_string() })
    }

    async fn consume(&self) -> Result<flume::Receiver<Delivery>, Error> {
        Ok(self.receiver.clone())
    }

    async fn ack(&self, event_id: &str) -> Result<(), Error> {
        let mut in_flight = self.in_flight.lock().expect("memory queue mutex poisoned");
        in_flight
            .remove(event_id)
            .map(|_| ())
            .ok_or_else(|| Error::UnknownDelivery { event_id: event_id.to_string() })
    }

    async fn nack(&self, event_id: &str, reason: &str) -> Result<(), Error> {
        let mut in_flight = self.in_flight.lock().expect("memory queue mutex poisoned");
        let entry = in_flight
            .get_mut(event_id)
            .ok_or_else(|| Error::UnknownDelivery { event_id: event_id.to_string() })?;

        entry.delivery_count += 1;

        if entry.delivery_count > self.max_deliver {
            let dlq_entry = DlqEntry {
                event: entry.event.clone(),
                reason: reason.to_string(),
                received_at_ms: entry.received_at_ms,
            };
            let _ = in_flight.remove(event_id);
            drop(in_flight);

            self.dlq.lock().expect("memory queue mutex poisoned").push(dlq_entry);
            return Ok(());
        }

        let redelivery = Delivery {
            event: entry.event.clone(),
            delivery_count: entry.delivery_count,
            received_at_ms: entry.received_at_ms,
        };
        drop(in_flight);

        self.sender
            .send_async(redelivery)
            .await
            .map_err(|err| Error::PublishFailed { reason: err.to_string() })
    }

    async fn close(&self) -> Result<(), Error> {
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use model::{NetworkContext, Timings};

    use super::*;

    fn sample_event(event_id: &str) -> Event {
        Event {
            event_id: event_id.into(),
            client_id: "c1".into(),
            target: "t1".into(),
            ts_ms: 61_000,
            recv_ts_ms: Some(61_001),
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
            throughput_kbps: 1000.0,
            error_stage: None,
        }
    }

    #[tokio::test]
    async fn publish_then_ack_clears_in_flight() {
        let queue = MemoryQueue::default();
        queue.publish(&sample_event("e1")).await.unwrap();

        let receiver = queue.consume().await.unwrap();
        let delivery = receiver.recv_async().await.unwrap();
        assert_eq!(delivery.delivery_count, 1);

        queue.ack("e1").await.unwrap();
        assert!(queue.ack("e1").await.is_err());
    }

    #[tokio::test]
    async fn nack_redelivers_with_incremented_count() {
        let queue = MemoryQueue::new(10, 5);
        queue.publish(&sample_event("e1")).await.unwrap();

        let receiver = queue.consume().await.unwrap();
        let first = receiver.recv_async().await.unwrap();
        assert_eq!(first.delivery_count, 1);

        queue.nack("e1", "transient failure").await.unwrap();

        let second = receiver.recv_async().await.unwrap();
        assert_eq!(second.delivery_count, 2);
    }

    #[tokio::test]
    async fn nack_at_max_deliver_routes_to_dlq_instead_of_redelivering() {
        let queue = MemoryQueue::new(10, 2);
        queue.publish(&sample_event("e1")).await.unwrap();

        let receiver = queue.consume().await.unwrap();
        let _first = receiver.recv_async().await.unwrap();
        queue.nack("e1", "still failing").await.unwrap();

        let _second = receiver.recv_async().await.unwrap();
        queue.nack("e1", "still failing").await.unwrap();

        assert!(receiver.try_recv().is_err(), "no further redelivery past max_deliver");
        let dlq = queue.dlq_snapshot();
        assert_eq!(dlq.len(), 1);
        assert_eq!(dlq[0].reason, "still failing");
    }
}
