//! Kafka backend.
//!
//! Log semantics: there is no per-message ack. Acknowledging commits the
//! offset after the message; requeuing seeks the partition back to the
//! message so the next poll reads it again. Offsets are never committed
//! automatically.

use std::{collections::HashMap, sync::Arc, time::Duration};

use async_trait::async_trait;
use rdkafka::{
    ClientConfig, Message, Offset, TopicPartitionList,
    consumer::{CommitMode, Consumer, StreamConsumer},
    error::{KafkaError, RDKafkaErrorCode},
    message::{Header, OwnedHeaders},
    producer::{FutureProducer, FutureRecord},
};
use tokio_util::sync::CancellationToken;

use crate::{
    envelope::Frame,
    transport::{Broker, Delivery, Receiver, Sender, TransportError},
};

/// Kafka broker for one topic and consumer group.
#[derive(Debug, Clone)]
pub struct Kafka {
    brokers: String,
    topic: String,
    group_id: String,
    send_timeout: Duration,
    seek_timeout: Duration,
    overrides: Vec<(String, String)>,
}

impl Kafka {
    /// `brokers` is a comma-separated bootstrap list such as
    /// `kafka1:9092,kafka2:9092`.
    pub fn new(
        brokers: impl Into<String>,
        topic: impl Into<String>,
        group_id: impl Into<String>,
    ) -> Self {
        Self {
            brokers: brokers.into(),
            topic: topic.into(),
            group_id: group_id.into(),
            send_timeout: Duration::from_secs(5),
            seek_timeout: Duration::from_secs(5),
            overrides: Vec::new(),
        }
    }

    /// How long a send may wait in the producer queue. Default 5 seconds.
    pub fn with_send_timeout(mut self, timeout: Duration) -> Self {
        self.send_timeout = timeout;
        self
    }

    /// Set an extra librdkafka property on both producer and consumer, for
    /// TLS or SASL settings.
    pub fn with_config(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.overrides.push((key.into(), value.into()));
        self
    }

    fn client_config(&self) -> ClientConfig {
        let mut config = ClientConfig::new();
        config.set("bootstrap.servers", &self.brokers);
        for (key, value) in &self.overrides {
            config.set(key, value);
        }
        config
    }
}

#[async_trait]
impl Broker for Kafka {
    type Sender = KafkaSender;
    type Receiver = KafkaReceiver;

    fn destination(&self) -> &str {
        &self.topic
    }

    #[tracing::instrument(skip(self), fields(topic = %self.topic))]
    async fn open_sender(&self) -> Result<Self::Sender, TransportError> {
        let producer: FutureProducer = self
            .client_config()
            .set("message.timeout.ms", self.send_timeout.as_millis().to_string())
            .create()
            .map_err(classify)?;

        Ok(KafkaSender {
            producer,
            topic: Arc::from(self.topic.as_str()),
            timeout: self.send_timeout,
        })
    }

    #[tracing::instrument(skip(self), fields(topic = %self.topic, group = %self.group_id))]
    async fn open_receiver(&self) -> Result<Self::Receiver, TransportError> {
        let consumer: StreamConsumer = self
            .client_config()
            .set("group.id", &self.group_id)
            .set("enable.auto.commit", "false")
            .set("enable.auto.offset.store", "false")
            .set("auto.offset.reset", "earliest")
            .set("session.timeout.ms", "30000")
            .set("heartbeat.interval.ms", "3000")
            .create()
            .map_err(classify)?;

        consumer.subscribe(&[&self.topic]).map_err(classify)?;

        Ok(KafkaReceiver {
            consumer,
            topic: self.topic.clone(),
            seek_timeout: self.seek_timeout,
            positions: Positions::default(),
        })
    }
}

/// Kafka transport sender.
///
/// Messages are keyed by envelope id and carry the content type as a header.
#[derive(Clone)]
pub struct KafkaSender {
    producer: FutureProducer,
    topic: Arc<str>,
    timeout: Duration,
}

#[async_trait]
impl Sender for KafkaSender {
    #[tracing::instrument(skip_all, fields(message_id = %frame.id(), topic = %self.topic))]
    async fn send(&mut self, frame: Frame) -> Result<(), TransportError> {
        let key = frame.id().to_string();
        let headers = OwnedHeaders::new().insert(Header {
            key: "content-type",
            value: Some(frame.content_type()),
        });
        let record = FutureRecord::to(&self.topic)
            .key(key.as_str())
            .payload(frame.body())
            .headers(headers);

        let (partition, offset) = self
            .producer
            .send(record, self.timeout)
            .await
            .map_err(|(err, _)| classify(err))?;

        tracing::debug!(partition, offset, "Frame written to log");
        Ok(())
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        use rdkafka::producer::Producer as _;

        self.producer.flush(self.timeout).map_err(classify)
    }
}

/// Position of a consumed message.
#[derive(Debug)]
pub struct KafkaHandle {
    partition: i32,
    offset: i64,
}

impl KafkaHandle {
    pub fn partition(&self) -> i32 {
        self.partition
    }

    pub fn offset(&self) -> i64 {
        self.offset
    }
}

/// Where a settlement moves the consumer in a partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Reposition {
    /// Commit this offset, the next one to read.
    Commit { partition: i32, offset: i64 },
    /// Move the fetch position back without committing.
    Seek { partition: i32, offset: i64 },
}

/// Per-receiver bookkeeping of requeued positions.
///
/// Kafka has no delivery counter, so the receiver counts how many times it
/// sent each position back itself. Counts do not survive a rebalance.
#[derive(Debug, Default)]
struct Positions {
    redeliveries: HashMap<(i32, i64), u32>,
}

impl Positions {
    fn delivery_count(&self, handle: &KafkaHandle) -> u32 {
        1 + self
            .redeliveries
            .get(&(handle.partition, handle.offset))
            .copied()
            .unwrap_or(0)
    }

    /// Ack and discard both move the committed position past the message.
    fn complete(&mut self, handle: &KafkaHandle) -> Reposition {
        self.redeliveries.remove(&(handle.partition, handle.offset));
        Reposition::Commit {
            partition: handle.partition,
            offset: handle.offset + 1,
        }
    }

    fn requeue(&self, handle: &KafkaHandle) -> Reposition {
        Reposition::Seek {
            partition: handle.partition,
            offset: handle.offset,
        }
    }

    /// Record a requeue once the seek went through.
    fn requeued(&mut self, handle: &KafkaHandle) {
        *self
            .redeliveries
            .entry((handle.partition, handle.offset))
            .or_default() += 1;
    }

    fn clear(&mut self) {
        self.redeliveries.clear();
    }
}

/// Kafka receiver subscribed to one topic.
pub struct KafkaReceiver {
    consumer: StreamConsumer,
    topic: String,
    seek_timeout: Duration,
    positions: Positions,
}

impl KafkaReceiver {
    fn apply(&self, reposition: Reposition) -> Result<(), TransportError> {
        match reposition {
            Reposition::Commit { partition, offset } => {
                let mut positions = TopicPartitionList::new();
                positions
                    .add_partition_offset(&self.topic, partition, Offset::Offset(offset))
                    .map_err(classify)?;
                self.consumer
                    .commit(&positions, CommitMode::Async)
                    .map_err(classify)
            }
            Reposition::Seek { partition, offset } => self
                .consumer
                .seek(&self.topic, partition, Offset::Offset(offset), self.seek_timeout)
                .map_err(classify),
        }
    }
}

#[async_trait]
impl Receiver for KafkaReceiver {
    type Handle = KafkaHandle;

    async fn receive(
        &mut self,
        cancel: &CancellationToken,
    ) -> Result<Option<Delivery<Self::Handle>>, TransportError> {
        let (body, handle) = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(None),
            message = self.consumer.recv() => {
                let message = message.map_err(classify)?;
                let body = message.payload().map(<[u8]>::to_vec).unwrap_or_default();
                let handle = KafkaHandle {
                    partition: message.partition(),
                    offset: message.offset(),
                };
                (body, handle)
            }
        };

        let delivery_count = self.positions.delivery_count(&handle);
        Ok(Some(Delivery::new(body, handle, delivery_count)))
    }

    async fn ack(&mut self, handle: Self::Handle) -> Result<(), TransportError> {
        let reposition = self.positions.complete(&handle);
        self.apply(reposition)
    }

    /// Requeue seeks back so the same offset is polled next; discard commits
    /// past it.
    async fn nack(&mut self, handle: Self::Handle, requeue: bool) -> Result<(), TransportError> {
        if !requeue {
            let reposition = self.positions.complete(&handle);
            return self.apply(reposition);
        }

        self.apply(self.positions.requeue(&handle))?;
        self.positions.requeued(&handle);
        Ok(())
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.positions.clear();
        self.consumer.unsubscribe();
        Ok(())
    }
}

/// Broker unavailability and timeouts are transient. A failed commit or seek
/// means the partition moved to another member, so the position can no
/// longer be resolved here.
fn classify(err: KafkaError) -> TransportError {
    if matches!(err, KafkaError::ConsumerCommit(_) | KafkaError::Seek(_)) {
        return TransportError::settlement(err);
    }

    let transient = matches!(
        err.rdkafka_error_code(),
        Some(
            RDKafkaErrorCode::MessageTimedOut
                | RDKafkaErrorCode::QueueFull
                | RDKafkaErrorCode::BrokerTransportFailure
                | RDKafkaErrorCode::AllBrokersDown
                | RDKafkaErrorCode::RequestTimedOut
                | RDKafkaErrorCode::NetworkException
                | RDKafkaErrorCode::LeaderNotAvailable
                | RDKafkaErrorCode::NotLeaderForPartition
                | RDKafkaErrorCode::NotEnoughReplicas
        )
    );

    if transient {
        TransportError::connection(err)
    } else {
        TransportError::rejected(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resilience::Transient;

    #[test]
    fn broker_outages_are_transient() {
        let err = classify(KafkaError::MessageProduction(RDKafkaErrorCode::QueueFull));
        assert!(err.is_transient());

        let err = classify(KafkaError::MessageProduction(
            RDKafkaErrorCode::MessageSizeTooLarge,
        ));
        assert!(!err.is_transient());
    }

    #[test]
    fn failed_commits_and_seeks_are_settlement_errors() {
        let err = classify(KafkaError::ConsumerCommit(
            RDKafkaErrorCode::RebalanceInProgress,
        ));
        assert!(err.is_settlement());

        let err = classify(KafkaError::Seek("partition not assigned".to_owned()));
        assert!(err.is_settlement());
        assert!(!err.is_transient());
    }

    fn handle(partition: i32, offset: i64) -> KafkaHandle {
        KafkaHandle { partition, offset }
    }

    #[test]
    fn ack_commits_the_next_offset() {
        let mut positions = Positions::default();

        assert_eq!(
            positions.complete(&handle(2, 41)),
            Reposition::Commit {
                partition: 2,
                offset: 42
            }
        );
    }

    #[test]
    fn requeue_seeks_back_without_committing() {
        let positions = Positions::default();

        assert_eq!(
            positions.requeue(&handle(0, 7)),
            Reposition::Seek {
                partition: 0,
                offset: 7
            }
        );
    }

    #[test]
    fn delivery_count_grows_only_with_completed_requeues() {
        let mut positions = Positions::default();
        let message = handle(1, 10);
        assert_eq!(positions.delivery_count(&message), 1);

        // A seek that failed never reaches `requeued`.
        let _ = positions.requeue(&message);
        assert_eq!(positions.delivery_count(&message), 1);

        positions.requeued(&message);
        positions.requeued(&message);
        assert_eq!(positions.delivery_count(&message), 3);
        assert_eq!(positions.delivery_count(&handle(1, 11)), 1);
    }

    #[test]
    fn discard_commits_past_a_requeued_message_and_forgets_it() {
        let mut positions = Positions::default();
        let message = handle(3, 5);
        positions.requeued(&message);

        assert_eq!(
            positions.complete(&message),
            Reposition::Commit {
                partition: 3,
                offset: 6
            }
        );
        assert_eq!(positions.delivery_count(&message), 1);
    }

    #[test]
    fn clearing_drops_counts_for_every_partition() {
        let mut positions = Positions::default();
        positions.requeued(&handle(0, 1));
        positions.requeued(&handle(4, 9));

        positions.clear();

        assert_eq!(positions.delivery_count(&handle(0, 1)), 1);
        assert_eq!(positions.delivery_count(&handle(4, 9)), 1);
    }

    #[test]
    fn overrides_reach_the_client_config() {
        let broker = Kafka::new("localhost:9092", "orders", "billing")
            .with_config("security.protocol", "ssl");
        let config = broker.client_config();

        assert_eq!(config.get("bootstrap.servers"), Some("localhost:9092"));
        assert_eq!(config.get("security.protocol"), Some("ssl"));
    }
}
