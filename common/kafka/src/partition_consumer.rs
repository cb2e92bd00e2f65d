//! Per-partition consumption.
//!
//! A [`PartitionSource`] is the shared broker connection: it is used for partition discovery
//! and to open one exclusive [`PartitionSubscription`] per (topic, partition). Subscriptions
//! are manually assigned and never commit offsets, so every start replays from the configured
//! reset position.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rdkafka::{
    consumer::{BaseConsumer, Consumer, StreamConsumer},
    error::KafkaError,
    types::RDKafkaErrorCode,
    ClientConfig, Message, Offset, TopicPartitionList,
};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::config::{ConsumerConfig, KafkaConfig};

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Kafka error: {0}")]
    Kafka(#[from] KafkaError),
    #[error("Topic {topic} is unavailable: {reason}")]
    TopicUnavailable { topic: String, reason: String },
}

/// A single message pulled from a partition, detached from the client's buffers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub payload: Option<Vec<u8>>,
}

#[async_trait]
pub trait PartitionSource: Send + Sync + 'static {
    type Subscription: PartitionSubscription;

    /// List the partition ids of `topic`.
    async fn partitions(&self, topic: &str) -> Result<Vec<i32>, TransportError>;

    /// Open an exclusive, ordered subscription to one partition.
    async fn subscribe(
        &self,
        topic: &str,
        partition: i32,
    ) -> Result<Self::Subscription, TransportError>;

    /// Release the shared connection. Called once all subscriptions are closed.
    async fn close(&self);
}

#[async_trait]
pub trait PartitionSubscription: Send + 'static {
    /// Wait for the next delivery or transport error. `None` means the subscription can no
    /// longer produce anything. Must be cancel safe, since callers race it against shutdown.
    async fn recv(&mut self) -> Option<Result<Delivery, TransportError>>;

    fn close(self)
    where
        Self: Sized;
}

pub struct KafkaPartitionSource {
    client_config: ClientConfig,
    // Taken on close, which disconnects the metadata client once in-flight lookups finish
    metadata: Mutex<Option<Arc<BaseConsumer>>>,
    metadata_timeout: Duration,
    start_offset: Offset,
}

impl KafkaPartitionSource {
    /// Connect to the brokers. Fails if no broker answers a metadata request, which callers
    /// treat as a fatal start-up error.
    pub fn new(
        common_config: &KafkaConfig,
        consumer_config: &ConsumerConfig,
    ) -> Result<Self, KafkaError> {
        let (reset, start_offset) = if consumer_config.start_from_latest() {
            ("latest", Offset::End)
        } else {
            ("earliest", Offset::Beginning)
        };

        let mut client_config = ClientConfig::new();
        client_config
            .set("bootstrap.servers", &common_config.kafka_hosts)
            .set("statistics.interval.ms", "10000")
            .set("group.id", &consumer_config.kafka_consumer_group)
            .set("enable.auto.commit", "false")
            .set("enable.auto.offset.store", "false")
            .set("enable.partition.eof", "false")
            .set("auto.offset.reset", reset);

        if common_config.kafka_tls {
            client_config
                .set("security.protocol", "ssl")
                .set("enable.ssl.certificate.verification", "false");
        };

        debug!("rdkafka configuration: {:?}", client_config);
        let metadata: BaseConsumer = client_config.create()?;
        let metadata_timeout = Duration::from_millis(common_config.kafka_metadata_timeout_ms);

        // "Ping" the Kafka brokers by requesting metadata
        match metadata.fetch_metadata(None, metadata_timeout) {
            Ok(cluster) => {
                info!(
                    "Successfully connected to Kafka brokers. Found {} topics.",
                    cluster.topics().len()
                );
            }
            Err(error) => {
                error!("Failed to fetch metadata from Kafka brokers: {:?}", error);
                return Err(error);
            }
        }

        Ok(Self {
            client_config,
            metadata: Mutex::new(Some(Arc::new(metadata))),
            metadata_timeout,
            start_offset,
        })
    }
}

#[async_trait]
impl PartitionSource for KafkaPartitionSource {
    type Subscription = KafkaSubscription;

    async fn partitions(&self, topic: &str) -> Result<Vec<i32>, TransportError> {
        let Some(metadata) = self.metadata.lock().await.clone() else {
            return Err(TransportError::TopicUnavailable {
                topic: topic.to_owned(),
                reason: "connection closed".to_owned(),
            });
        };
        let timeout = self.metadata_timeout;
        let requested = topic.to_owned();

        // fetch_metadata blocks the calling thread until the broker answers
        let cluster = tokio::task::spawn_blocking(move || {
            metadata.fetch_metadata(Some(requested.as_str()), timeout)
        })
        .await
        .map_err(|e| TransportError::TopicUnavailable {
            topic: topic.to_owned(),
            reason: format!("metadata request aborted: {e}"),
        })??;

        let Some(found) = cluster.topics().iter().find(|t| t.name() == topic) else {
            return Err(TransportError::TopicUnavailable {
                topic: topic.to_owned(),
                reason: "topic missing from metadata".to_owned(),
            });
        };

        if let Some(err) = found.error() {
            return Err(TransportError::TopicUnavailable {
                topic: topic.to_owned(),
                reason: format!("{:?}", RDKafkaErrorCode::from(err)),
            });
        }

        let mut partitions: Vec<i32> = found.partitions().iter().map(|p| p.id()).collect();
        partitions.sort_unstable();
        Ok(partitions)
    }

    async fn subscribe(
        &self,
        topic: &str,
        partition: i32,
    ) -> Result<KafkaSubscription, TransportError> {
        let consumer: StreamConsumer = self.client_config.create()?;

        let mut assignment = TopicPartitionList::new();
        assignment.add_partition_offset(topic, partition, self.start_offset)?;
        consumer.assign(&assignment)?;

        Ok(KafkaSubscription {
            consumer,
            topic: topic.to_owned(),
            partition,
        })
    }

    async fn close(&self) {
        if self.metadata.lock().await.take().is_some() {
            info!("Closed Kafka metadata connection");
        }
    }
}

pub struct KafkaSubscription {
    consumer: StreamConsumer,
    topic: String,
    partition: i32,
}

#[async_trait]
impl PartitionSubscription for KafkaSubscription {
    async fn recv(&mut self) -> Option<Result<Delivery, TransportError>> {
        let received = self.consumer.recv().await.map(|message| Delivery {
            topic: message.topic().to_owned(),
            partition: message.partition(),
            offset: message.offset(),
            payload: message.payload().map(|p| p.to_vec()),
        });
        Some(received.map_err(TransportError::from))
    }

    fn close(self) {
        if let Err(e) = self.consumer.unassign() {
            warn!(
                topic = self.topic.as_str(),
                partition = self.partition,
                "Failed to release partition assignment: {:?}",
                e
            );
        }
    }
}
