use anyhow::{Context, Result};
use async_trait::async_trait;
use rdkafka::Message;
use rdkafka::consumer::{BaseConsumer, CommitMode, Consumer, StreamConsumer};
use rdkafka::message::{Header, Headers, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::util::Timeout;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use super::config::create_client_config;
use crate::config::KafkaConfig;

/// A record about to be written to a topic
#[derive(Debug, Clone, Copy)]
pub struct OutboundRecord<'a> {
    /// Delivery/ordering key
    pub key: &'a str,
    pub headers: &'a [(&'static str, String)],
    pub payload: &'a [u8],
}

/// Where the broker stored a record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordPosition {
    pub partition: i32,
    pub offset: i64,
}

/// A record read from a topic
#[derive(Debug, Clone)]
pub struct InboundRecord {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Option<String>,
    pub headers: Vec<(String, String)>,
    pub payload: Option<Vec<u8>>,
}

/// Write side of one topic
#[async_trait]
pub trait TopicWriter: Send + Sync {
    /// Send one record and wait for the broker's acknowledgment
    async fn send(&self, record: OutboundRecord<'_>) -> Result<RecordPosition>;

    /// Flush in-flight records and release the writer
    async fn close(&self) -> Result<()>;
}

/// Read side of one topic, bound to a consumer group
#[async_trait]
pub trait TopicReader: Send + Sync {
    /// Wait for the next record. Must be cancel-safe.
    async fn recv(&self) -> Result<InboundRecord>;

    /// Commit the position of every record returned so far
    async fn commit(&self) -> Result<()>;

    async fn close(&self) -> Result<()>;
}

/// Factory for topic resources plus a reachability probe.
///
/// Implemented on Kafka for production; tests plug in an in-memory broker.
#[async_trait]
pub trait Broker: Send + Sync {
    fn writer(&self, topic: &str) -> Result<Arc<dyn TopicWriter>>;

    fn reader(&self, topic: &str, group_id: &str) -> Result<Arc<dyn TopicReader>>;

    /// Open a throwaway connection and verify the cluster answers
    async fn ping(&self) -> Result<()>;
}

// ============================================================================
// Kafka implementation
// ============================================================================

pub struct KafkaBroker {
    config: KafkaConfig,
}

impl KafkaBroker {
    pub fn new(config: KafkaConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Broker for KafkaBroker {
    fn writer(&self, topic: &str) -> Result<Arc<dyn TopicWriter>> {
        let producer: FutureProducer = create_client_config(&self.config)?
            // Reliability settings
            .set("acks", "all")
            .set("enable.idempotence", "true")
            .set("max.in.flight.requests.per.connection", "5")
            // Performance settings
            .set("compression.type", &self.config.producer_compression)
            .set("linger.ms", "10")
            // librdkafka retries internally; bound it by the per-attempt deadline
            .set("message.timeout.ms", self.config.write_timeout_ms.to_string())
            .create()
            .context("Failed to create Kafka producer")?;

        info!(topic = %topic, "Kafka writer created");

        Ok(Arc::new(KafkaTopicWriter {
            topic: topic.to_string(),
            producer,
            timeout: self.config.write_timeout(),
        }))
    }

    fn reader(&self, topic: &str, group_id: &str) -> Result<Arc<dyn TopicReader>> {
        let consumer: StreamConsumer = create_client_config(&self.config)?
            .set("group.id", group_id)
            // Offsets are committed by the bus on a fixed interval
            .set("enable.auto.commit", "false")
            .set("auto.offset.reset", "earliest")
            .set("allow.auto.create.topics", "true")
            .set("fetch.wait.max.ms", "500")
            .set("session.timeout.ms", "30000")
            .set("heartbeat.interval.ms", "3000")
            .create()
            .context("Failed to create Kafka consumer")?;

        consumer
            .subscribe(&[topic])
            .with_context(|| format!("Failed to subscribe to Kafka topic '{}'", topic))?;

        info!(topic = %topic, group_id = %group_id, "Kafka reader created");

        Ok(Arc::new(KafkaTopicReader {
            topic: topic.to_string(),
            consumer,
        }))
    }

    async fn ping(&self) -> Result<()> {
        let consumer: BaseConsumer = create_client_config(&self.config)?
            .create()
            .context("Failed to create Kafka health-check client")?;
        let timeout = self.config.health_timeout();

        let metadata = tokio::task::spawn_blocking(move || {
            consumer.fetch_metadata(None, Timeout::After(timeout))
        })
        .await
        .context("Kafka health-check task failed")?
        .context("Kafka broker unreachable")?;

        debug!(brokers = metadata.brokers().len(), "Kafka health check passed");
        Ok(())
    }
}

struct KafkaTopicWriter {
    topic: String,
    producer: FutureProducer,
    timeout: Duration,
}

#[async_trait]
impl TopicWriter for KafkaTopicWriter {
    async fn send(&self, record: OutboundRecord<'_>) -> Result<RecordPosition> {
        let headers = record
            .headers
            .iter()
            .fold(OwnedHeaders::new(), |headers, (key, value)| {
                headers.insert(Header {
                    key: *key,
                    value: Some(value.as_str()),
                })
            });

        let kafka_record = FutureRecord::to(&self.topic)
            .key(record.key)
            .payload(record.payload)
            .headers(headers);

        match self
            .producer
            .send(kafka_record, Timeout::After(self.timeout))
            .await
        {
            Ok((partition, offset)) => Ok(RecordPosition { partition, offset }),
            Err((kafka_err, _)) => Err(anyhow::anyhow!(
                "Kafka send to '{}' failed: {}",
                self.topic,
                kafka_err
            )),
        }
    }

    async fn close(&self) -> Result<()> {
        let producer = self.producer.clone();
        let timeout = self.timeout;
        tokio::task::spawn_blocking(move || producer.flush(Timeout::After(timeout)))
            .await
            .context("Kafka flush task failed")?
            .with_context(|| format!("Failed to flush Kafka writer for '{}'", self.topic))?;
        info!(topic = %self.topic, "Kafka writer flushed");
        Ok(())
    }
}

struct KafkaTopicReader {
    topic: String,
    consumer: StreamConsumer,
}

#[async_trait]
impl TopicReader for KafkaTopicReader {
    async fn recv(&self) -> Result<InboundRecord> {
        let message = self
            .consumer
            .recv()
            .await
            .with_context(|| format!("Kafka consumer error on '{}'", self.topic))?;

        let headers = message
            .headers()
            .map(|headers| {
                headers
                    .iter()
                    .map(|h| {
                        (
                            h.key.to_string(),
                            h.value
                                .map(|v| String::from_utf8_lossy(v).into_owned())
                                .unwrap_or_default(),
                        )
                    })
                    .collect()
            })
            .unwrap_or_default();

        Ok(InboundRecord {
            topic: message.topic().to_string(),
            partition: message.partition(),
            offset: message.offset(),
            key: message
                .key()
                .map(|k| String::from_utf8_lossy(k).into_owned()),
            headers,
            payload: message.payload().map(|p| p.to_vec()),
        })
    }

    async fn commit(&self) -> Result<()> {
        self.consumer
            .commit_consumer_state(CommitMode::Async)
            .with_context(|| format!("Failed to commit offsets for '{}'", self.topic))
    }

    async fn close(&self) -> Result<()> {
        self.consumer.unsubscribe();
        info!(topic = %self.topic, "Kafka reader closed");
        Ok(())
    }
}
