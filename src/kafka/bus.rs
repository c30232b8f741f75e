// ============================================================================
// Event Bus Client
// ============================================================================
//
// Publish:   prepare → validate → serialize → send keyed by envelope id,
//            retried with linear backoff, error surfaced to the caller.
// Subscribe: one task per topic under the service's consumer group; decode,
//            dispatch, log. No redelivery of failed handler calls. Offsets are
//            committed on a timer, so a crash between commits replays records.
//
// ============================================================================

use async_trait::async_trait;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::broker::{Broker, InboundRecord, KafkaBroker, OutboundRecord, TopicReader, TopicWriter};
use super::metrics;
use crate::config::KafkaConfig;
use crate::envelope::EventEnvelope;
use crate::error::BusError;

/// Pause after a broker read error before polling again
const READ_ERROR_BACKOFF: Duration = Duration::from_millis(500);
/// Floor for the commit ticker; a zero period is not a valid interval
const MIN_COMMIT_INTERVAL: Duration = Duration::from_millis(1);

/// Tunables for one bus client
#[derive(Debug, Clone)]
pub struct BusOptions {
    /// Stable service identity: default envelope source and consumer group id
    pub service_name: String,
    pub publish_attempts: u32,
    pub retry_backoff: Duration,
    pub commit_interval: Duration,
}

impl BusOptions {
    pub fn from_config(service_name: impl Into<String>, config: &KafkaConfig) -> Self {
        Self {
            service_name: service_name.into(),
            publish_attempts: config.publish_attempts.max(1),
            retry_backoff: config.retry_backoff(),
            commit_interval: config.commit_interval(),
        }
    }
}

/// Result of a successful publish
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishReceipt {
    pub event_id: String,
    pub partition: i32,
    pub offset: i64,
    /// Attempts used, 1 when the first send succeeded
    pub attempts: u32,
}

/// What happened to one consumed record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumeOutcome {
    Handled,
    /// Undecodable payload, dropped
    Malformed,
    /// Handler returned an error; the record still counts as delivered
    HandlerFailed,
}

/// Reacts to events from one topic
#[async_trait]
pub trait EventHandler: Send + Sync + 'static {
    async fn handle(&self, envelope: EventEnvelope) -> anyhow::Result<()>;
}

#[async_trait]
impl<F, Fut> EventHandler for F
where
    F: Fn(EventEnvelope) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    async fn handle(&self, envelope: EventEnvelope) -> anyhow::Result<()> {
        (self)(envelope).await
    }
}

/// Event bus client shared by every producer and consumer in one service
pub struct EventBus {
    broker: Arc<dyn Broker>,
    options: BusOptions,
    writers: RwLock<HashMap<String, Arc<dyn TopicWriter>>>,
    readers: RwLock<HashMap<String, Arc<dyn TopicReader>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    cancel: CancellationToken,
}

impl EventBus {
    pub fn new(broker: Arc<dyn Broker>, mut options: BusOptions) -> Self {
        options.commit_interval = options.commit_interval.max(MIN_COMMIT_INTERVAL);
        Self {
            broker,
            options,
            writers: RwLock::new(HashMap::new()),
            readers: RwLock::new(HashMap::new()),
            tasks: Mutex::new(Vec::new()),
            cancel: CancellationToken::new(),
        }
    }

    /// Bus backed by the Kafka cluster described in `config`
    pub fn kafka(service_name: impl Into<String>, config: &KafkaConfig) -> Self {
        let options = BusOptions::from_config(service_name, config);
        info!(
            service = %options.service_name,
            brokers = %config.brokers,
            attempts = options.publish_attempts,
            "Event bus configured"
        );
        Self::new(Arc::new(KafkaBroker::new(config.clone())), options)
    }

    pub fn service_name(&self) -> &str {
        &self.options.service_name
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Publish `envelope` to `topic`.
    ///
    /// Missing `id`/`timestamp`/`version`/`source` are filled in once, before
    /// the first attempt; every retry reuses the same id as the record key.
    /// Blocks the caller for at most `attempts` sends plus the backoff between
    /// them.
    pub async fn publish(
        &self,
        topic: &str,
        mut envelope: EventEnvelope,
    ) -> Result<PublishReceipt, BusError> {
        if self.is_closed() {
            return Err(BusError::Closed);
        }

        envelope.prepare(&self.options.service_name);
        envelope
            .validate()
            .map_err(|e| BusError::Validation(e.to_string()))?;

        let payload = serde_json::to_vec(&envelope)?;
        let headers = envelope.headers();
        let writer = self.writer(topic).await?;
        let attempts = self.options.publish_attempts.max(1);

        let mut last_error = None;
        for attempt in 1..=attempts {
            debug!(
                topic = %topic,
                event_id = %envelope.id,
                event_type = %envelope.event_type,
                attempt = attempt,
                "Publishing event"
            );

            let start = Instant::now();
            let record = OutboundRecord {
                key: &envelope.id,
                headers: &headers,
                payload: &payload,
            };

            match writer.send(record).await {
                Ok(position) => {
                    let latency = start.elapsed();
                    metrics::PUBLISH_SUCCESS.inc();
                    metrics::PUBLISH_LATENCY.observe(latency.as_secs_f64());

                    info!(
                        topic = %topic,
                        event_id = %envelope.id,
                        event_type = %envelope.event_type,
                        partition = position.partition,
                        offset = position.offset,
                        attempt = attempt,
                        latency_ms = latency.as_millis(),
                        "Event published"
                    );

                    return Ok(PublishReceipt {
                        event_id: envelope.id,
                        partition: position.partition,
                        offset: position.offset,
                        attempts: attempt,
                    });
                }
                Err(e) => {
                    metrics::PUBLISH_ATTEMPT_FAILURE.inc();
                    warn!(
                        topic = %topic,
                        event_id = %envelope.id,
                        attempt = attempt,
                        max_attempts = attempts,
                        error = %e,
                        "Publish attempt failed"
                    );
                    last_error = Some(e);

                    if attempt < attempts {
                        tokio::time::sleep(self.options.retry_backoff * attempt).await;
                    }
                }
            }
        }

        metrics::PUBLISH_EXHAUSTED.inc();
        error!(
            topic = %topic,
            event_id = %envelope.id,
            attempts = attempts,
            "Event could not be published"
        );

        Err(BusError::Delivery {
            topic: topic.to_string(),
            event_id: envelope.id,
            attempts,
            source: last_error.unwrap_or_else(|| anyhow::anyhow!("no publish attempt was made")),
        })
    }

    /// Start consuming `topic` under this service's consumer group.
    ///
    /// Returns once the consumption task is running. A topic can be
    /// subscribed at most once per client.
    pub async fn subscribe<H: EventHandler>(&self, topic: &str, handler: H) -> Result<(), BusError> {
        if self.is_closed() {
            return Err(BusError::Closed);
        }

        if self.readers.read().await.contains_key(topic) {
            return Err(BusError::AlreadySubscribed(topic.to_string()));
        }

        let reader = {
            let mut readers = self.readers.write().await;
            if readers.contains_key(topic) {
                return Err(BusError::AlreadySubscribed(topic.to_string()));
            }
            let reader = self
                .broker
                .reader(topic, &self.options.service_name)
                .map_err(BusError::Broker)?;
            readers.insert(topic.to_string(), Arc::clone(&reader));
            reader
        };

        let task = tokio::spawn(consume_loop(
            topic.to_string(),
            reader,
            Arc::new(handler),
            self.options.commit_interval,
            self.cancel.child_token(),
        ));
        self.tasks.lock().await.push(task);

        info!(
            topic = %topic,
            group_id = %self.options.service_name,
            "Subscribed to topic"
        );
        Ok(())
    }

    /// Verify the broker is reachable
    pub async fn health(&self) -> Result<(), BusError> {
        self.broker.ping().await.map_err(BusError::Broker)
    }

    /// Stop every subscription and release all topic resources.
    ///
    /// Consumption tasks exit without a final commit; an event whose handler
    /// is still running is abandoned and stays uncommitted. Every close
    /// failure is collected; the first one does not stop the rest from
    /// closing.
    pub async fn close(&self) -> Result<(), BusError> {
        self.cancel.cancel();

        let mut errors = Vec::new();

        let tasks = std::mem::take(&mut *self.tasks.lock().await);
        for task in tasks {
            if let Err(e) = task.await {
                errors.push(format!("subscription task: {}", e));
            }
        }

        let writers: Vec<_> = self.writers.write().await.drain().collect();
        for (topic, writer) in writers {
            if let Err(e) = writer.close().await {
                errors.push(format!("writer '{}': {:#}", topic, e));
            }
        }

        let readers: Vec<_> = self.readers.write().await.drain().collect();
        for (topic, reader) in readers {
            if let Err(e) = reader.close().await {
                errors.push(format!("reader '{}': {:#}", topic, e));
            }
        }

        if errors.is_empty() {
            info!(service = %self.options.service_name, "Event bus closed");
            Ok(())
        } else {
            error!(failures = errors.len(), "Event bus closed with errors");
            Err(BusError::Close(errors))
        }
    }

    /// Writer for `topic`, created on first use
    async fn writer(&self, topic: &str) -> Result<Arc<dyn TopicWriter>, BusError> {
        if let Some(writer) = self.writers.read().await.get(topic) {
            return Ok(Arc::clone(writer));
        }

        let mut writers = self.writers.write().await;
        // close() may have drained the map since the caller checked
        if self.is_closed() {
            return Err(BusError::Closed);
        }
        if let Some(writer) = writers.get(topic) {
            return Ok(Arc::clone(writer));
        }

        let writer = self.broker.writer(topic).map_err(BusError::Broker)?;
        writers.insert(topic.to_string(), Arc::clone(&writer));
        Ok(writer)
    }
}

/// Decode one record and hand it to `handler`
pub async fn process_record(record: &InboundRecord, handler: &dyn EventHandler) -> ConsumeOutcome {
    let envelope = match record
        .payload
        .as_deref()
        .map(serde_json::from_slice::<EventEnvelope>)
    {
        Some(Ok(envelope)) => envelope,
        Some(Err(e)) => {
            metrics::CONSUME_MALFORMED.inc();
            warn!(
                topic = %record.topic,
                partition = record.partition,
                offset = record.offset,
                error = %e,
                "Dropping undecodable event"
            );
            return ConsumeOutcome::Malformed;
        }
        None => {
            metrics::CONSUME_MALFORMED.inc();
            warn!(
                topic = %record.topic,
                partition = record.partition,
                offset = record.offset,
                "Dropping event with empty payload"
            );
            return ConsumeOutcome::Malformed;
        }
    };

    let event_id = envelope.id.clone();
    let event_type = envelope.event_type.clone();

    match handler.handle(envelope).await {
        Ok(()) => {
            metrics::CONSUME_HANDLED.inc();
            debug!(
                topic = %record.topic,
                event_id = %event_id,
                event_type = %event_type,
                "Event handled"
            );
            ConsumeOutcome::Handled
        }
        Err(e) => {
            metrics::CONSUME_HANDLER_FAILURE.inc();
            error!(
                topic = %record.topic,
                event_id = %event_id,
                event_type = %event_type,
                offset = record.offset,
                error = ?e,
                "Event handler failed; event will not be redelivered"
            );
            ConsumeOutcome::HandlerFailed
        }
    }
}

async fn consume_loop(
    topic: String,
    reader: Arc<dyn TopicReader>,
    handler: Arc<dyn EventHandler>,
    commit_interval: Duration,
    cancel: CancellationToken,
) {
    let mut commit_ticker = tokio::time::interval(commit_interval);
    commit_ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // First tick fires immediately
    commit_ticker.tick().await;

    let mut uncommitted = 0usize;

    loop {
        tokio::select! {
            biased;

            _ = cancel.cancelled() => {
                info!(topic = %topic, uncommitted = uncommitted, "Subscription stopping");
                break;
            }

            _ = commit_ticker.tick() => {
                if uncommitted == 0 {
                    continue;
                }
                match reader.commit().await {
                    Ok(()) => {
                        debug!(topic = %topic, records = uncommitted, "Offsets committed");
                        uncommitted = 0;
                    }
                    Err(e) => {
                        metrics::COMMIT_FAILURE.inc();
                        warn!(topic = %topic, error = %e, "Offset commit failed");
                    }
                }
            }

            received = reader.recv() => match received {
                Ok(record) => {
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => {
                            info!(
                                topic = %topic,
                                offset = record.offset,
                                "Subscription stopping with an event in flight"
                            );
                            break;
                        }
                        _ = process_record(&record, handler.as_ref()) => uncommitted += 1,
                    }
                }
                Err(e) => {
                    metrics::CONSUME_ERRORS.inc();
                    warn!(topic = %topic, error = %e, "Failed to read from topic");
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(READ_ERROR_BACKOFF) => {}
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};

    use crate::kafka::broker::RecordPosition;

    /// Writer that fails the first `failures` sends and records every key
    struct FlakyWriter {
        failures: u32,
        calls: AtomicU32,
        keys: std::sync::Mutex<Vec<String>>,
    }

    #[async_trait]
    impl TopicWriter for FlakyWriter {
        async fn send(&self, record: OutboundRecord<'_>) -> Result<RecordPosition> {
            self.keys.lock().unwrap().push(record.key.to_string());
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if call <= self.failures {
                anyhow::bail!("broker unavailable");
            }
            Ok(RecordPosition {
                partition: 0,
                offset: i64::from(call),
            })
        }

        async fn close(&self) -> Result<()> {
            Ok(())
        }
    }

    struct FlakyBroker {
        writer: Arc<FlakyWriter>,
        writers_created: AtomicU32,
    }

    impl FlakyBroker {
        fn new(failures: u32) -> Arc<Self> {
            Arc::new(Self {
                writer: Arc::new(FlakyWriter {
                    failures,
                    calls: AtomicU32::new(0),
                    keys: std::sync::Mutex::new(Vec::new()),
                }),
                writers_created: AtomicU32::new(0),
            })
        }
    }

    #[async_trait]
    impl Broker for FlakyBroker {
        fn writer(&self, _topic: &str) -> Result<Arc<dyn TopicWriter>> {
            self.writers_created.fetch_add(1, Ordering::SeqCst);
            Ok(self.writer.clone() as Arc<dyn TopicWriter>)
        }

        fn reader(&self, _topic: &str, _group_id: &str) -> Result<Arc<dyn TopicReader>> {
            anyhow::bail!("reads not supported")
        }

        async fn ping(&self) -> Result<()> {
            Ok(())
        }
    }

    fn options(attempts: u32) -> BusOptions {
        BusOptions {
            service_name: "wallet-service".to_string(),
            publish_attempts: attempts,
            retry_backoff: Duration::from_millis(100),
            commit_interval: Duration::from_secs(1),
        }
    }

    fn debit() -> EventEnvelope {
        EventEnvelope::new("wallet.debited", "", json!({"user_id": "u1", "amount": 10}))
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_reuses_event_id() {
        let broker = FlakyBroker::new(2);
        let bus = EventBus::new(broker.clone(), options(3));

        let receipt = bus.publish("wallet.events", debit()).await.unwrap();

        assert_eq!(receipt.attempts, 3);
        let keys = broker.writer.keys.lock().unwrap().clone();
        assert_eq!(keys.len(), 3);
        assert!(keys.iter().all(|k| *k == receipt.event_id));
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_grows_linearly() {
        let broker = FlakyBroker::new(2);
        let bus = EventBus::new(broker, options(3));

        let start = tokio::time::Instant::now();
        bus.publish("wallet.events", debit()).await.unwrap();

        // 100ms after attempt 1, 200ms after attempt 2
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(300));
        assert!(elapsed < Duration::from_millis(400));
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_retries_surface_delivery_error() {
        let broker = FlakyBroker::new(u32::MAX);
        let bus = EventBus::new(broker.clone(), options(3));

        let err = bus.publish("wallet.events", debit()).await.unwrap_err();

        match err {
            BusError::Delivery {
                topic, attempts, ..
            } => {
                assert_eq!(topic, "wallet.events");
                assert_eq!(attempts, 3);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(broker.writer.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_invalid_envelope_is_not_sent() {
        let broker = FlakyBroker::new(0);
        let bus = EventBus::new(broker.clone(), options(3));

        let err = bus
            .publish("wallet.events", EventEnvelope::new("", "", json!({})))
            .await
            .unwrap_err();

        assert!(matches!(err, BusError::Validation(_)));
        assert_eq!(broker.writer.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_null_data_is_not_sent() {
        let broker = FlakyBroker::new(0);
        let bus = EventBus::new(broker.clone(), options(3));

        let err = bus
            .publish(
                "wallet.events",
                EventEnvelope::new("wallet.debited", "", serde_json::Value::Null),
            )
            .await
            .unwrap_err();

        match err {
            BusError::Validation(msg) => assert_eq!(msg, "data is required"),
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(broker.writer.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_writer_created_once_per_topic() {
        let broker = FlakyBroker::new(0);
        let bus = Arc::new(EventBus::new(broker.clone(), options(1)));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let bus = bus.clone();
            handles.push(tokio::spawn(async move {
                bus.publish("wallet.events", debit()).await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        assert_eq!(broker.writers_created.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_publish_after_close_is_rejected() {
        let bus = EventBus::new(FlakyBroker::new(0), options(1));
        bus.close().await.unwrap();

        assert!(matches!(
            bus.publish("wallet.events", debit()).await,
            Err(BusError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_writer_not_created_after_close() {
        let broker = FlakyBroker::new(0);
        let bus = EventBus::new(broker.clone(), options(1));
        bus.close().await.unwrap();

        assert!(matches!(
            bus.writer("wallet.events").await,
            Err(BusError::Closed)
        ));
        assert_eq!(broker.writers_created.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_zero_commit_interval_is_clamped() {
        let bus = EventBus::new(
            FlakyBroker::new(0),
            BusOptions {
                commit_interval: Duration::ZERO,
                ..options(1)
            },
        );
        assert_eq!(bus.options.commit_interval, MIN_COMMIT_INTERVAL);
    }

    /// Writer and reader whose close always fails
    struct BrokenWriter;

    #[async_trait]
    impl TopicWriter for BrokenWriter {
        async fn send(&self, _record: OutboundRecord<'_>) -> Result<RecordPosition> {
            Ok(RecordPosition {
                partition: 0,
                offset: 0,
            })
        }

        async fn close(&self) -> Result<()> {
            anyhow::bail!("flush timed out")
        }
    }

    struct BrokenReader;

    #[async_trait]
    impl TopicReader for BrokenReader {
        async fn recv(&self) -> Result<InboundRecord> {
            std::future::pending().await
        }

        async fn commit(&self) -> Result<()> {
            Ok(())
        }

        async fn close(&self) -> Result<()> {
            anyhow::bail!("group leave failed")
        }
    }

    struct BrokenBroker;

    #[async_trait]
    impl Broker for BrokenBroker {
        fn writer(&self, _topic: &str) -> Result<Arc<dyn TopicWriter>> {
            Ok(Arc::new(BrokenWriter))
        }

        fn reader(&self, _topic: &str, _group_id: &str) -> Result<Arc<dyn TopicReader>> {
            Ok(Arc::new(BrokenReader))
        }

        async fn ping(&self) -> Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_close_collects_every_failure() {
        let bus = EventBus::new(Arc::new(BrokenBroker), options(1));
        bus.publish("wallet.events", debit()).await.unwrap();
        bus.subscribe("ledger.events", |_: EventEnvelope| async {
            Ok::<(), anyhow::Error>(())
        })
        .await
        .unwrap();

        match bus.close().await {
            Err(BusError::Close(failures)) => {
                assert_eq!(failures.len(), 2);
                assert!(failures.iter().any(|f| f.contains("writer 'wallet.events'")));
                assert!(failures.iter().any(|f| f.contains("reader 'ledger.events'")));
            }
            other => panic!("unexpected close result: {other:?}"),
        }

        assert!(matches!(
            bus.publish("wallet.events", debit()).await,
            Err(BusError::Closed)
        ));
        let resubscribe = bus
            .subscribe("ledger.events", |_: EventEnvelope| async {
                Ok::<(), anyhow::Error>(())
            })
            .await;
        assert!(matches!(resubscribe, Err(BusError::Closed)));
    }

    #[tokio::test]
    async fn test_process_record_classifies_outcomes() {
        let ok = |_: EventEnvelope| async { Ok::<(), anyhow::Error>(()) };
        let failing =
            |_: EventEnvelope| async { Err::<(), _>(anyhow::anyhow!("insufficient funds")) };

        let mut record = InboundRecord {
            topic: "wallet.events".to_string(),
            partition: 0,
            offset: 7,
            key: None,
            headers: Vec::new(),
            payload: Some(br#"{"type":"wallet.debited","data":{}}"#.to_vec()),
        };

        assert_eq!(process_record(&record, &ok).await, ConsumeOutcome::Handled);
        assert_eq!(
            process_record(&record, &failing).await,
            ConsumeOutcome::HandlerFailed
        );

        record.payload = Some(b"not json".to_vec());
        assert_eq!(process_record(&record, &ok).await, ConsumeOutcome::Malformed);

        record.payload = None;
        assert_eq!(process_record(&record, &ok).await, ConsumeOutcome::Malformed);
    }
}
