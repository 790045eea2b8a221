//! In-process reference binding of the bus capability.
//!
//! Messages live in per-subscription queues guarded by one mutex; leases are
//! checked lazily on `pull`, so no timer task is needed. The lock is never
//! held across an await point.

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, trace};

use super::{
    BrokerError, BrokerMessageId, BusSubscription, Delivery, MessageBus, SubscriptionName,
    TopicName,
};

/// Default lease granted on each delivery.
pub const DEFAULT_LEASE: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
struct QueuedMessage {
    id: BrokerMessageId,
    payload: Arc<Vec<u8>>,
    /// Completed delivery attempts so far.
    attempts: u32,
}

#[derive(Debug)]
struct LeasedMessage {
    message: QueuedMessage,
    lease_deadline: Instant,
}

#[derive(Debug, Default)]
struct SubscriptionState {
    pending: VecDeque<QueuedMessage>,
    in_flight: HashMap<BrokerMessageId, LeasedMessage>,
}

impl SubscriptionState {
    /// Returns expired in-flight messages to the front of the pending queue
    /// so redeliveries go out before never-delivered messages.
    fn reclaim_expired(&mut self, now: Instant) {
        let expired: Vec<BrokerMessageId> = self
            .in_flight
            .iter()
            .filter(|(_, leased)| leased.lease_deadline <= now)
            .map(|(id, _)| *id)
            .collect();

        for id in expired {
            if let Some(leased) = self.in_flight.remove(&id) {
                trace!(message_id = %id, "lease expired, message eligible for redelivery");
                self.pending.push_front(leased.message);
            }
        }
    }
}

#[derive(Debug, Default)]
struct TopicState {
    subscriptions: HashMap<SubscriptionName, SubscriptionState>,
}

#[derive(Debug, Default)]
struct BusState {
    topics: HashMap<TopicName, TopicState>,
}

/// In-process at-least-once bus with per-message leases and redelivery.
#[derive(Debug, Clone)]
pub struct InMemoryBus {
    state: Arc<Mutex<BusState>>,
    lease: Duration,
}

impl InMemoryBus {
    pub fn new(lease: Duration) -> Self {
        Self {
            state: Arc::new(Mutex::new(BusState::default())),
            lease,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BusState> {
        self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl Default for InMemoryBus {
    fn default() -> Self {
        Self::new(DEFAULT_LEASE)
    }
}

#[async_trait]
impl MessageBus for InMemoryBus {
    async fn create_topic(&self, topic: &TopicName) -> Result<(), BrokerError> {
        self.lock().topics.entry(topic.clone()).or_default();
        Ok(())
    }

    async fn publish(
        &self,
        topic: &TopicName,
        payload: Vec<u8>,
    ) -> Result<BrokerMessageId, BrokerError> {
        let mut state = self.lock();
        let topic_state = state
            .topics
            .get_mut(topic)
            .ok_or_else(|| BrokerError::UnknownTopic(topic.to_string()))?;

        let id = BrokerMessageId::generate();
        let payload = Arc::new(payload);
        for subscription in topic_state.subscriptions.values_mut() {
            subscription.pending.push_back(QueuedMessage {
                id,
                payload: payload.clone(),
                attempts: 0,
            });
        }

        trace!(%topic, message_id = %id, "message fanned out");
        Ok(id)
    }

    async fn subscribe(
        &self,
        topic: &TopicName,
        subscription: &SubscriptionName,
    ) -> Result<Arc<dyn BusSubscription>, BrokerError> {
        let mut state = self.lock();
        let topic_state = state
            .topics
            .get_mut(topic)
            .ok_or_else(|| BrokerError::UnknownTopic(topic.to_string()))?;

        topic_state
            .subscriptions
            .entry(subscription.clone())
            .or_default();

        debug!(%topic, %subscription, "subscription attached");
        Ok(Arc::new(MemorySubscription {
            topic: topic.clone(),
            name: subscription.clone(),
            state: self.state.clone(),
            lease: self.lease,
        }))
    }
}

struct MemorySubscription {
    topic: TopicName,
    name: SubscriptionName,
    state: Arc<Mutex<BusState>>,
    lease: Duration,
}

impl MemorySubscription {
    fn with_subscription<T>(
        &self,
        f: impl FnOnce(&mut SubscriptionState) -> T,
    ) -> Result<T, BrokerError> {
        let mut state = self
            .state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);

        let subscription = state
            .topics
            .get_mut(&self.topic)
            .ok_or_else(|| BrokerError::UnknownTopic(self.topic.to_string()))?
            .subscriptions
            .get_mut(&self.name)
            .ok_or_else(|| BrokerError::UnknownSubscription {
                topic: self.topic.to_string(),
                subscription: self.name.to_string(),
            })?;

        Ok(f(subscription))
    }
}

#[async_trait]
impl BusSubscription for MemorySubscription {
    async fn pull(&self, max_messages: usize) -> Result<Vec<Delivery>, BrokerError> {
        let lease = self.lease;
        self.with_subscription(|subscription| {
            let now = Instant::now();
            subscription.reclaim_expired(now);

            let mut deliveries = Vec::new();
            while deliveries.len() < max_messages {
                let Some(mut message) = subscription.pending.pop_front() else {
                    break;
                };

                message.attempts += 1;
                let lease_deadline = now + lease;
                deliveries.push(Delivery {
                    message_id: message.id,
                    payload: message.payload.as_ref().clone(),
                    attempt: message.attempts,
                    lease_deadline,
                });
                subscription.in_flight.insert(
                    message.id,
                    LeasedMessage {
                        message,
                        lease_deadline,
                    },
                );
            }

            deliveries
        })
    }

    async fn ack(&self, message_id: BrokerMessageId) -> Result<(), BrokerError> {
        self.with_subscription(|subscription| {
            if subscription.in_flight.remove(&message_id).is_none() {
                // Late ack after lease expiry: the consumer did finish, so
                // the reclaimed copy must not be redelivered.
                subscription.pending.retain(|message| message.id != message_id);
            }
        })
    }

    async fn nack(&self, message_id: BrokerMessageId) -> Result<(), BrokerError> {
        self.with_subscription(|subscription| {
            if let Some(leased) = subscription.in_flight.remove(&message_id) {
                subscription.pending.push_back(leased.message);
            }
        })
    }

    async fn extend_lease(
        &self,
        message_id: BrokerMessageId,
        extension: Duration,
    ) -> Result<(), BrokerError> {
        self.with_subscription(|subscription| {
            match subscription.in_flight.get_mut(&message_id) {
                Some(leased) => {
                    leased.lease_deadline = Instant::now() + extension;
                    Ok(())
                }
                None => Err(BrokerError::LeaseExpired(message_id)),
            }
        })?
    }
}
