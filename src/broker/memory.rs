//! In-memory broker used by tests and local development.
//!
//! Models a single-partition log: appended messages are handed to exactly
//! one of the consuming runners, and the committed offset only moves when a
//! consumer says so. Response-topic publishes are captured for inspection.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::{Broker, BrokerError, InboundMessage, TopicSpec};

const POLL_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Debug, Clone)]
struct StoredMessage {
    key: Option<String>,
    payload: Vec<u8>,
}

#[derive(Default)]
struct LogState {
    topics: HashMap<String, Vec<StoredMessage>>,
    /// Index of the next unit-topic message to hand out.
    cursor: usize,
    /// High-water mark of committed unit-topic offsets.
    committed: i64,
}

#[derive(Clone)]
pub struct MemoryBroker {
    unit_topic: String,
    state: Arc<Mutex<LogState>>,
}

impl MemoryBroker {
    pub fn new(unit_topic: impl Into<String>) -> Self {
        Self {
            unit_topic: unit_topic.into(),
            state: Arc::new(Mutex::new(LogState::default())),
        }
    }

    /// Append a raw message to the unit topic, as an enqueuing service would.
    pub async fn enqueue(&self, key: Option<&str>, payload: &[u8]) {
        let mut state = self.state.lock().await;
        let topic = self.unit_topic.clone();
        state.topics.entry(topic).or_default().push(StoredMessage {
            key: key.map(str::to_string),
            payload: payload.to_vec(),
        });
    }

    /// Messages published to `topic`, as `(key, payload)` pairs.
    pub async fn published(&self, topic: &str) -> Vec<(Option<String>, Vec<u8>)> {
        let state = self.state.lock().await;
        state
            .topics
            .get(topic)
            .map(|messages| {
                messages
                    .iter()
                    .map(|m| (m.key.clone(), m.payload.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Next uncommitted unit-topic offset.
    pub async fn committed_offset(&self) -> i64 {
        self.state.lock().await.committed
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn ensure_topics(&self, topics: &[TopicSpec]) -> Result<(), BrokerError> {
        let mut state = self.state.lock().await;
        for spec in topics {
            state.topics.entry(spec.name.clone()).or_default();
        }
        Ok(())
    }

    async fn next_message(&self) -> Result<InboundMessage, BrokerError> {
        loop {
            {
                let mut state = self.state.lock().await;
                let offset = state.cursor;
                let next = state
                    .topics
                    .get(&self.unit_topic)
                    .and_then(|log| log.get(offset))
                    .cloned();
                if let Some(message) = next {
                    state.cursor += 1;
                    return Ok(InboundMessage {
                        topic: self.unit_topic.clone(),
                        partition: 0,
                        offset: offset as i64,
                        key: message.key,
                        payload: message.payload,
                    });
                }
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    async fn commit(&self, message: &InboundMessage) -> Result<(), BrokerError> {
        let mut state = self.state.lock().await;
        state.committed = state.committed.max(message.offset + 1);
        Ok(())
    }

    async fn publish(&self, topic: &str, key: &str, payload: &[u8]) -> Result<(), BrokerError> {
        let mut state = self.state.lock().await;
        state
            .topics
            .entry(topic.to_string())
            .or_default()
            .push(StoredMessage {
                key: Some(key.to_string()),
                payload: payload.to_vec(),
            });
        Ok(())
    }
}
