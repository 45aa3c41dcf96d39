/// Kafka transport for user events
///
/// All user events share one topic. The message key is the user id so that
/// every event of a user lands on the same partition, and the `subject`
/// header carries the routing subject used for decoding.
use std::sync::Arc;
use std::time::Duration;

use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::message::{BorrowedMessage, Header, Headers, Message, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use tokio::sync::watch;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use super::projection::{ProjectionHandler, RetryConfig};
use crate::domain::events::parse_subject;
use crate::domain::{EventSink, PublishError};
use crate::error::{IdentityError, Result};

pub const SUBJECT_HEADER: &str = "subject";
const FLUSH_TIMEOUT: Duration = Duration::from_secs(10);
const RECV_RETRY_DELAY: Duration = Duration::from_secs(5);

/// Fire-and-forget Kafka producer behind [`EventSink`]
#[derive(Clone)]
pub struct KafkaEventSink {
    producer: FutureProducer,
    topic: String,
}

impl KafkaEventSink {
    /// Create a new Kafka event sink
    ///
    /// ## Arguments
    ///
    /// * `brokers` - Comma-separated list of Kafka brokers
    /// * `topic` - Topic every user event is written to
    pub fn new(brokers: &str, topic: &str) -> Result<Self> {
        let producer = ClientConfig::new()
            .set("bootstrap.servers", brokers)
            .set("client.id", "identity-service")
            .set("enable.idempotence", "true")
            .create::<FutureProducer>()
            .map_err(|e| {
                IdentityError::Internal(format!("Failed to create Kafka producer: {}", e))
            })?;

        Ok(Self {
            producer,
            topic: topic.to_string(),
        })
    }

    /// Wait for in-flight messages before shutdown
    pub fn flush(&self) {
        if let Err(e) = self.producer.flush(FLUSH_TIMEOUT) {
            warn!("Failed to flush Kafka producer: {}", e);
        }
    }
}

impl EventSink for KafkaEventSink {
    fn publish(&self, subject: &str, payload: &[u8]) -> std::result::Result<(), PublishError> {
        let (user_id, _) =
            parse_subject(subject).map_err(|e| PublishError::Transport(e.to_string()))?;
        let key = user_id.to_string();

        let headers = OwnedHeaders::new().insert(Header {
            key: SUBJECT_HEADER,
            value: Some(subject),
        });
        let record = FutureRecord::to(&self.topic)
            .key(&key)
            .payload(payload)
            .headers(headers);

        let delivery = self
            .producer
            .send_result(record)
            .map_err(|(e, _)| PublishError::Transport(e.to_string()))?;

        // Delivery is reported asynchronously when a runtime is available
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            let subject = subject.to_string();
            runtime.spawn(async move {
                match delivery.await {
                    Ok(Ok((partition, offset))) => {
                        debug!(subject = %subject, partition, offset, "Event delivered");
                    }
                    Ok(Err((e, _))) => {
                        error!(subject = %subject, "Failed to deliver event: {}", e);
                    }
                    Err(_) => warn!(subject = %subject, "Delivery report dropped"),
                }
            });
        }

        Ok(())
    }
}

/// Kafka projection consumer configuration
#[derive(Debug, Clone)]
pub struct ProjectionConsumerConfig {
    /// Kafka broker addresses (comma-separated)
    pub brokers: String,
    /// Consumer group ID
    pub group_id: String,
    /// Topic to consume from
    pub topic: String,
}

/// Applies user events from Kafka to the repository.
///
/// Offsets are committed only after the handler succeeds. Transient
/// failures are retried in place, so no later offset is committed past a
/// message that has not been applied. A message still failing at shutdown
/// stays uncommitted and is redelivered on restart.
pub struct KafkaProjectionConsumer {
    consumer: StreamConsumer,
    handler: ProjectionHandler,
    config: ProjectionConsumerConfig,
    retry: RetryConfig,
}

impl KafkaProjectionConsumer {
    pub fn new(config: ProjectionConsumerConfig, handler: ProjectionHandler) -> Result<Self> {
        info!(
            "Initializing KafkaProjectionConsumer: brokers={}, group_id={}, topic={}",
            config.brokers, config.group_id, config.topic
        );

        let consumer: StreamConsumer = ClientConfig::new()
            .set("bootstrap.servers", &config.brokers)
            .set("group.id", &config.group_id)
            .set("enable.auto.commit", "false")
            .set("auto.offset.reset", "earliest")
            .set("session.timeout.ms", "30000")
            .set("enable.partition.eof", "false")
            .create()
            .map_err(|e| {
                IdentityError::Internal(format!("Failed to create Kafka consumer: {}", e))
            })?;

        consumer.subscribe(&[&config.topic]).map_err(|e| {
            IdentityError::Internal(format!("Failed to subscribe to topic: {}", e))
        })?;

        info!("Subscribed to Kafka topic: {}", config.topic);

        Ok(Self {
            consumer,
            handler,
            config,
            retry: RetryConfig::unbounded(),
        })
    }

    /// Consume until `shutdown` flips to `true`
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!("Starting projection consumer loop");

        loop {
            let received = tokio::select! {
                _ = shutdown_requested(&mut shutdown) => break,
                received = self.consumer.recv() => received,
            };

            match received {
                Ok(message) => {
                    if !self.process(&message, &mut shutdown).await {
                        break;
                    }
                }
                Err(e) => {
                    error!("Kafka recv error: {}, retrying in 5s", e);
                    sleep(RECV_RETRY_DELAY).await;
                }
            }
        }

        info!("Projection consumer stopped");
    }

    /// Returns `false` when shutdown interrupted a message before it was
    /// applied
    async fn process(
        &self,
        message: &BorrowedMessage<'_>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> bool {
        let Some(subject) = header_value(message, SUBJECT_HEADER) else {
            warn!(
                topic = %self.config.topic,
                offset = message.offset(),
                "Skipping message without subject header"
            );
            self.commit(message);
            return true;
        };
        let payload = message.payload().unwrap_or_default();

        let result = tokio::select! {
            _ = shutdown_requested(shutdown) => {
                warn!(
                    subject,
                    partition = message.partition(),
                    offset = message.offset(),
                    "Shutdown before event was applied, leaving offset uncommitted"
                );
                return false;
            }
            result = self.handler.handle_message_with_retry(subject, payload, &self.retry) => result,
        };

        match result {
            Ok(()) => {}
            Err(IdentityError::InvalidEvent(reason)) => {
                // Undecodable messages would be redelivered forever
                warn!(subject, "Skipping invalid event: {}", reason);
            }
            Err(e) => {
                error!(
                    subject,
                    partition = message.partition(),
                    offset = message.offset(),
                    "Skipping event that cannot be applied: {}",
                    e
                );
            }
        }
        self.commit(message);
        true
    }

    fn commit(&self, message: &BorrowedMessage<'_>) {
        if let Err(e) = self.consumer.commit_message(message, CommitMode::Async) {
            warn!("Failed to commit Kafka offset: {}", e);
        }
    }
}

/// Resolves once `shutdown` reads `true` or its sender is gone
async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow_and_update() {
            return;
        }
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}

fn header_value<'a>(message: &'a BorrowedMessage<'a>, key: &str) -> Option<&'a str> {
    message
        .headers()
        .and_then(|headers| {
            headers
                .iter()
                .find(|header| header.key == key)
                .and_then(|header| header.value)
        })
        .and_then(|value| std::str::from_utf8(value).ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{User, UserEvent};

    #[test]
    fn test_kafka_sink_creation() {
        // librdkafka connects lazily, so creation succeeds without a broker
        let result = KafkaEventSink::new("localhost:9092", "identity.users");
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_kafka_sink_rejects_malformed_subject() {
        let sink = KafkaEventSink::new("localhost:9092", "identity.users").unwrap();
        assert!(matches!(
            sink.publish("users.not-an-id", b"{}"),
            Err(PublishError::Transport(_))
        ));
    }

    #[tokio::test]
    async fn test_shutdown_requested_waits_for_signal() {
        let (tx, mut rx) = watch::channel(false);
        let waiter = tokio::spawn(async move { shutdown_requested(&mut rx).await });

        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        tx.send(true).unwrap();
        waiter.await.unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_requested_on_dropped_sender() {
        let (tx, mut rx) = watch::channel(false);
        drop(tx);
        shutdown_requested(&mut rx).await;

        let (_tx, mut already) = watch::channel(true);
        shutdown_requested(&mut already).await;
    }

    #[tokio::test]
    #[ignore = "Requires Kafka broker"]
    async fn test_kafka_sink_enqueues_event() {
        let sink = KafkaEventSink::new("localhost:9092", "identity.users").unwrap();
        let mut user = User::new("mirror", "Lin", "mirror@x.com");
        user.register();
        let event: UserEvent = user.take_events().remove(0);

        sink.publish(&event.subject(), &event.encode().unwrap())
            .unwrap();
        sink.flush();
    }
}
