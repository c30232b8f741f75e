#![allow(dead_code)]

use anyhow::Result;
use async_trait::async_trait;
use messaging_substrate::kafka::{
    Broker, InboundRecord, OutboundRecord, RecordPosition, TopicReader, TopicWriter,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

#[derive(Debug, Clone)]
pub struct StoredRecord {
    pub key: String,
    pub headers: Vec<(String, String)>,
    pub payload: Vec<u8>,
}

#[derive(Default)]
struct State {
    topics: HashMap<String, Vec<StoredRecord>>,
    /// Next offset to read, per (topic, group)
    committed: HashMap<(String, String), usize>,
}

/// In-process stand-in for a Kafka cluster: append-only topics and
/// per-group committed offsets. Readers resume from the committed offset,
/// so anything consumed but not committed is redelivered to the next reader
/// of the same group.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    state: Arc<Mutex<State>>,
    appended: Arc<Notify>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self, topic: &str) -> Vec<StoredRecord> {
        let state = self.state.lock().unwrap();
        state.topics.get(topic).cloned().unwrap_or_default()
    }

    pub fn committed(&self, topic: &str, group_id: &str) -> usize {
        let state = self.state.lock().unwrap();
        state
            .committed
            .get(&(topic.to_string(), group_id.to_string()))
            .copied()
            .unwrap_or(0)
    }

    /// Append bytes that did not come through the bus
    pub fn append_raw(&self, topic: &str, payload: &[u8]) {
        self.append(
            topic,
            StoredRecord {
                key: String::new(),
                headers: Vec::new(),
                payload: payload.to_vec(),
            },
        );
    }

    fn append(&self, topic: &str, record: StoredRecord) -> usize {
        let offset = {
            let mut state = self.state.lock().unwrap();
            let log = state.topics.entry(topic.to_string()).or_default();
            log.push(record);
            log.len() - 1
        };
        self.appended.notify_waiters();
        offset
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    fn writer(&self, topic: &str) -> Result<Arc<dyn TopicWriter>> {
        Ok(Arc::new(MemoryWriter {
            broker: self.clone(),
            topic: topic.to_string(),
        }))
    }

    fn reader(&self, topic: &str, group_id: &str) -> Result<Arc<dyn TopicReader>> {
        let start = self.committed(topic, group_id);
        Ok(Arc::new(MemoryReader {
            broker: self.clone(),
            topic: topic.to_string(),
            group_id: group_id.to_string(),
            position: AtomicUsize::new(start),
        }))
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}

struct MemoryWriter {
    broker: MemoryBroker,
    topic: String,
}

#[async_trait]
impl TopicWriter for MemoryWriter {
    async fn send(&self, record: OutboundRecord<'_>) -> Result<RecordPosition> {
        let offset = self.broker.append(
            &self.topic,
            StoredRecord {
                key: record.key.to_string(),
                headers: record
                    .headers
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.clone()))
                    .collect(),
                payload: record.payload.to_vec(),
            },
        );
        Ok(RecordPosition {
            partition: 0,
            offset: offset as i64,
        })
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

struct MemoryReader {
    broker: MemoryBroker,
    topic: String,
    group_id: String,
    position: AtomicUsize,
}

#[async_trait]
impl TopicReader for MemoryReader {
    async fn recv(&self) -> Result<InboundRecord> {
        loop {
            // Register interest before looking, so an append in between is not missed
            let appended = self.broker.appended.notified();

            let position = self.position.load(Ordering::SeqCst);
            let next = {
                let state = self.broker.state.lock().unwrap();
                state
                    .topics
                    .get(&self.topic)
                    .and_then(|log| log.get(position))
                    .cloned()
            };

            if let Some(record) = next {
                self.position.store(position + 1, Ordering::SeqCst);
                return Ok(InboundRecord {
                    topic: self.topic.clone(),
                    partition: 0,
                    offset: position as i64,
                    key: Some(record.key),
                    headers: record.headers,
                    payload: Some(record.payload),
                });
            }

            appended.await;
        }
    }

    async fn commit(&self) -> Result<()> {
        let position = self.position.load(Ordering::SeqCst);
        let mut state = self.broker.state.lock().unwrap();
        state
            .committed
            .insert((self.topic.clone(), self.group_id.clone()), position);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// Poll `condition` every 10ms until it holds or `timeout` passes
pub async fn eventually<F>(timeout: std::time::Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    condition()
}
