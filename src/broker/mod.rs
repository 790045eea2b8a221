//! Abstract binding to a durable, at-least-once message bus.
//!
//! The pipeline is written against the [`MessageBus`] / [`BusSubscription`]
//! capability pair rather than any vendor SDK. A conforming binding must
//! provide durable storage of published messages, independent fan-out to
//! every subscription on a topic, per-message ack, and redelivery of any
//! message whose lease expires without an ack.
//!
//! [`InMemoryBus`] is the reference binding used by the dry-run mode and the
//! test suite.

mod memory;

pub use memory::InMemoryBus;

use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use uuid::Uuid;

/// Named topic a publisher pushes envelopes onto.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TopicName(String);

impl TopicName {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TopicName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Named subscription; each subscription receives its own copy of every
/// message published to its topic.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionName(String);

impl SubscriptionName {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SubscriptionName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Broker-assigned message identity. Observability only: a republished
/// logical event gets a fresh broker id, so dedup must key on the
/// envelope's `event_id`, never on this.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BrokerMessageId(Uuid);

impl BrokerMessageId {
    pub(crate) fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for BrokerMessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// One delivery of a message to one subscription. Redelivery of the same
/// message yields a new `Delivery` with an incremented attempt count.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub message_id: BrokerMessageId,
    pub payload: Vec<u8>,
    /// 1-based count of delivery attempts, including this one.
    pub attempt: u32,
    /// The consumer must ack before this instant or the message becomes
    /// eligible for redelivery.
    pub lease_deadline: Instant,
}

#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("unknown topic: {0}")]
    UnknownTopic(String),
    #[error("unknown subscription {subscription} on topic {topic}")]
    UnknownSubscription { topic: String, subscription: String },
    #[error("lease already expired for message {0}")]
    LeaseExpired(BrokerMessageId),
    #[error("transport failure: {0}")]
    Transport(String),
}

#[async_trait]
pub trait MessageBus: Send + Sync {
    /// Creates the topic if it does not exist. Idempotent.
    async fn create_topic(&self, topic: &TopicName) -> Result<(), BrokerError>;

    /// Durably stores `payload` and fans it out to every existing
    /// subscription on `topic`.
    async fn publish(&self, topic: &TopicName, payload: Vec<u8>)
    -> Result<BrokerMessageId, BrokerError>;

    /// Attaches to (creating if absent) a named subscription on `topic`.
    /// A new subscription sees only messages published after it exists.
    async fn subscribe(
        &self,
        topic: &TopicName,
        subscription: &SubscriptionName,
    ) -> Result<Arc<dyn BusSubscription>, BrokerError>;
}

#[async_trait]
pub trait BusSubscription: Send + Sync {
    /// Pulls up to `max_messages` available messages, leasing each one.
    /// Messages whose previous lease expired are redelivered here, ahead of
    /// never-delivered messages.
    async fn pull(&self, max_messages: usize) -> Result<Vec<Delivery>, BrokerError>;

    /// Permanently removes the message from this subscription. Idempotent;
    /// acking after lease expiry still removes the message if it has not
    /// been redelivered yet.
    async fn ack(&self, message_id: BrokerMessageId) -> Result<(), BrokerError>;

    /// Gives up the current lease, making the message immediately eligible
    /// for redelivery.
    async fn nack(&self, message_id: BrokerMessageId) -> Result<(), BrokerError>;

    /// Extends the lease to `now + extension`. Must be called before the
    /// current lease expires.
    async fn extend_lease(
        &self,
        message_id: BrokerMessageId,
        extension: Duration,
    ) -> Result<(), BrokerError>;
}
