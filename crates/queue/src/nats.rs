//! NATS JetStream-backed implementation of [`Queue`]: the primary stream
//! `telemetry-events` (subject `telemetry.events`) and the dead-letter
//! stream `telemetry-events-dlq` (subject `telemetry.dlq`) of §6.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::Duration,
};

use async_nats::jetstream::{
    self,
    consumer::{pull::Config as PullConfig, AckPolicy},
    stream::Config as StreamConfig,
    AckKind, Message,
};
use async_trait::async_trait;
use model::Event;
use tracing::{error, warn};

use crate::{now_ms, Delivery, Error, Queue};

/// Connection and consumer parameters for the JetStream adapter, mirroring
/// §6's configuration surface (`max_in_flight`, `ack_wait`, `max_deliver`).
#[derive(Debug, Clone)]
pub struct NatsQueueConfig {
    /// NATS server URL.
    pub server_url: String,
    /// Primary stream name.
    pub stream_name: String,
    /// Primary stream subject.
    pub subject: String,
    /// Dead-letter stream name.
    pub dlq_stream_name: String,
    /// Dead-letter stream subject.
    pub dlq_subject: String,
    /// Durable consumer name.
    pub durable_name: String,
    /// Maximum unacknowledged deliveries outstanding at once.
    pub max_in_flight: usize,
    /// Broker-side ack wait before a delivery is considered timed out.
    pub ack_wait: Duration,
    /// Maximum delivery attempts before dead-lettering.
    pub max_deliver: i64,
}

impl Default for NatsQueueConfig {
    fn default() -> Self {
        Self {
            server_url: "nats://127.0.0.1:4222".to_string(),
            stream_name: "telemetry-events".to_string(),
            subject: "telemetry.events".to_string(),
            dlq_stream_name: "telemetry-events-dlq".to_string(),
            dlq_subject: "telemetry.dlq".to_string(),
            durable_name: "aggregator".to_string(),
            max_in_flight: 100,
            ack_wait: Duration::from_secs(30),
            max_deliver: 5,
        }
    }
}

/// A `Queue` backed by a JetStream pull consumer. Deliveries that parse as
/// [`Event`] are forwarded to the caller's channel; deliveries that fail to
/// parse never reach the caller and are nacked/dead-lettered internally
/// using the message's own JetStream delivery count, per §4.2.
pub struct NatsQueue {
    config: NatsQueueConfig,
    context: jetstream::Context,
    sender: flume::Sender<Delivery>,
    receiver: flume::Receiver<Delivery>,
    in_flight: Arc<Mutex<HashMap<String, Message>>>,
}

impl NatsQueue {
    /// Connects to NATS, ensures both streams and the durable consumer
    /// exist, and prepares (but does not yet start) the delivery loop.
    pub async fn connect(config: NatsQueueConfig) -> Result<Self, Error> {
        let client = async_nats::connect(&config.server_url)
            .await
            .map_err(|err| Error::Unavailable { reason: err.to_string() })?;
        let context = jetstream::new(client);

        let _ = context
            .get_or_create_stream(StreamConfig {
                name: config.stream_name.clone(),
                subjects: vec![config.subject.clone()],
                ..Default::default()
            })
            .await
            .map_err(|err| Error::Unavailable { reason: err.to_string() })?;

        let _ = context
            .get_or_create_stream(StreamConfig {
                name: config.dlq_stream_name.clone(),
                subjects: vec![config.dlq_subject.clone()],
                ..Default::default()
            })
            .await
            .map_err(|err| Error::Unavailable { reason: err.to_string() })?;

        let (sender, receiver) = flume::bounded(config.max_in_flight);

        Ok(Self {
            config,
            context,
            sender,
            receiver,
            in_flight: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    async fn durable_consumer(&self) -> Result<jetstream::consumer::Consumer<PullConfig>, Error> {
        let stream = self
            .context
            .get_stream(&self.config.stream_name)
            .await
            .map_err(|err| Error::Unavailable { reason: err.to_string() })?;

        stream
            .get_or_create_consumer(
                &self.config.durable_name,
                PullConfig {
                    durable_name: Some(self.config.durable_name.clone()),
                    ack_policy: AckPolicy::Explicit,
                    ack_wait: self.config.ack_wait,
                    max_deliver: self.config.max_deliver,
                    ..Default::default()
                },
            )
            .await
            .map_err(|err| Error::Unavailable { reason: err.to_string() })
    }

    async fn dead_letter(&self, payload: &[u8], reason: &str, received_at_ms: i64) {
        let envelope = serde_json::json!({
            "payload": String::from_utf8_lossy(payload),
            "reason": reason,
            "received_at_ms": received_at_ms,
        });

        if let Ok(bytes) = serde_json::to_vec(&envelope) {
            if let Err(err) = self.context.publish(self.config.dlq_subject.clone(), bytes.into()).await {
                error!(error = %err, "failed to publish to dead-letter stream");
            }
        }
    }
}

#[async_trait]
impl Queue for NatsQueue {
    async fn publish(&self, event: &Event) -> Result<(), Error> {
        let bytes = serde_json::to_vec(event).map_err(|err| Error::PublishFailed { reason: err.to_string() })?;

        let ack = self
            .context
            .publish(self.config.subject.clone(), bytes.into())
            .await
            .map_err(|err| Error::PublishFailed { reason: err.to_string() })?;

        ack.await.map_err(|err| Error::PublishFailed { reason: err.to_string() })?;

        Ok(())
    }

    async fn consume(&self) -> Result<flume::Receiver<Delivery>, Error> {
        let consumer = self.durable_consumer().await?;
        let sender = self.sender.clone();
        let in_flight = self.in_flight.clone();

        let mut messages = consumer
            .messages()
            .await
            .map_err(|err| Error::Unavailable { reason: err.to_string() })?;

        tokio::spawn(async move {
            use futures::StreamExt;

            while let Some(next) = messages.next().await {
                let message = match next {
                    Ok(message) => message,
                    Err(err) => {
                        warn!(error = %err, "jetstream pull error");
                        continue;
                    }
                };

                let received_at_ms = now_ms();
                let delivery_count = message
                    .info()
                    .map(|info| info.delivered as u32)
                    .unwrap_or(1);

                match serde_json::from_slice::<Event>(&message.payload) {
                    Ok(event) => {
                        let event_id = event.event_id.clone();
                        let delivery = Delivery {
                            event,
                            delivery_count,
                            received_at_ms,
                        };

                        // The caller correlates a later ack/nack by
                        // event_id; stash the raw message so those calls
                        // can reach it. This happens only on the consumer
                        // side, since only it holds a JetStream `Message`.
                        let _ = in_flight.lock().expect("nats queue mutex poisoned").insert(event_id, message);

                        if sender.send_async(delivery).await.is_err() {
                            break;
                        }
                    }
                    Err(err) => {
                        warn!(error = %err, "unparseable delivery, handled internally");
                        if delivery_count as i64 >= 5 {
                            if let Err(ack_err) = message.ack_with(AckKind::Term).await {
                                error!(error = %ack_err, "failed to terminate unparseable delivery");
                            }
                        } else if let Err(nack_err) = message.ack_with(AckKind::Nak(None)).await {
                            error!(error = %nack_err, "failed to nack unparseable delivery");
                        }
                    }
                }
            }
        });

        Ok(self.receiver.clone())
    }

    async fn ack(&self, event_id: &str) -> Result<(), Error> {
        let message = self
            .in_flight
            .lock()
            .expect("nats queue mutex poisoned")
            .remove(event_id)
            .ok_or_else(|| Error::UnknownDelivery { event_id: event_id.to_string() })?;

        message
            .ack()
            .await
            .map_err(|err| Error::PublishFailed { reason: err.to_string() })
    }

    async fn nack(&self, event_id: &str, reason: &str) -> Result<(), Error> {
        let message = {
            let mut in_flight = self.in_flight.lock().expect("nats queue mutex poisoned");
            in_flight
                .remove(event_id)
                .ok_or_else(|| Error::UnknownDelivery { event_id: event_id.to_string() })?
        };

        let delivered = message.info().map(|info| info.delivered).unwrap_or(1);

        if delivered as i64 >= self.config.max_deliver {
            self.dead_letter(&message.payload, reason, now_ms()).await;
            message
                .ack()
                .await
                .map_err(|err| Error::PublishFailed { reason: err.to_string() })
        } else {
            message
                .ack_with(AckKind::Nak(None))
                .await
                .map_err(|err| Error::PublishFailed { reason: err.to_string() })
        }
    }

    async fn close(&self) -> Result<(), Error> {
        Ok(())
    }
}
