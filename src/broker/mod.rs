//! Message log seam.
//!
//! The runner fleet pulls unit requests from a partitioned log and pushes
//! terminal reports back to per-caller response topics. Offset commits are
//! always explicit; nothing here auto-commits.

pub mod kafka;
pub mod memory;

use async_trait::async_trait;
use thiserror::Error;

pub use kafka::KafkaBroker;
pub use memory::MemoryBroker;

#[derive(Error, Debug)]
pub enum BrokerError {
    /// Topic provisioning failed for a reason other than "already exists".
    /// Fatal at startup.
    #[error("topic provisioning failed: {0}")]
    Provision(String),

    #[error("consume failed: {0}")]
    Consume(String),

    #[error("offset commit failed: {0}")]
    Commit(String),

    #[error("publish to {topic} failed: {reason}")]
    Publish { topic: String, reason: String },

    #[error("broker client error: {0}")]
    Client(String),
}

/// Topic to create if absent during startup bootstrap.
#[derive(Debug, Clone)]
pub struct TopicSpec {
    pub name: String,
    pub partitions: i32,
    pub replication: i32,
}

/// One message pulled from the unit topic.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Option<String>,
    pub payload: Vec<u8>,
}

#[async_trait]
pub trait Broker: Send + Sync {
    /// Create the given topics, treating "already exists" as success.
    async fn ensure_topics(&self, topics: &[TopicSpec]) -> Result<(), BrokerError>;

    /// Pull the next message from the unit topic. Waits until one arrives.
    async fn next_message(&self) -> Result<InboundMessage, BrokerError>;

    /// Mark everything up to and including `message` as processed.
    async fn commit(&self, message: &InboundMessage) -> Result<(), BrokerError>;

    /// Publish a keyed payload to an arbitrary topic.
    async fn publish(&self, topic: &str, key: &str, payload: &[u8]) -> Result<(), BrokerError>;
}
