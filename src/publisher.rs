//! Topic publisher with bounded retry.
//!
//! The domain layer assigns `event_id` and `stream_position` before handing
//! an envelope here, so a retried publish carries the same identity and can
//! never create a semantic duplicate downstream. On exhaustion the error is
//! surfaced to the caller, which owns durable tracking of the unpublished
//! event; nothing is dropped silently.

use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::broker::{BrokerError, BrokerMessageId, MessageBus, TopicName};
use crate::envelope::{Envelope, EnvelopeError, EventId};

/// Proof of a successful publish. The broker id is for observability only;
/// a republished logical event gets a fresh broker id, so downstream dedup
/// keys on the envelope's `event_id`.
#[derive(Debug, Clone)]
pub struct PublishReceipt {
    pub broker_message_id: BrokerMessageId,
}

#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    #[error("failed to encode event {event_id}: {source}")]
    Encode {
        event_id: EventId,
        #[source]
        source: EnvelopeError,
    },
    #[error("publish of event {event_id} to {topic} failed after {attempts} attempt(s): {source}")]
    Failed {
        topic: TopicName,
        event_id: EventId,
        attempts: u32,
        #[source]
        source: BrokerError,
    },
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    fn backoff_for(&self, attempt: u32) -> Duration {
        let doublings = attempt.saturating_sub(1).min(16);
        self.initial_backoff
            .saturating_mul(1 << doublings)
            .min(self.max_backoff)
    }
}

#[derive(Clone)]
pub struct Publisher {
    bus: Arc<dyn MessageBus>,
    policy: RetryPolicy,
}

impl Publisher {
    pub fn new(bus: Arc<dyn MessageBus>, policy: RetryPolicy) -> Self {
        Self { bus, policy }
    }

    #[tracing::instrument(
        skip(self, envelope),
        fields(event_id = %envelope.event_id, position = %envelope.position),
        level = tracing::Level::DEBUG
    )]
    pub async fn publish(
        &self,
        topic: &TopicName,
        envelope: &Envelope,
    ) -> Result<PublishReceipt, PublishError> {
        let bytes = envelope.encode().map_err(|source| PublishError::Encode {
            event_id: envelope.event_id.clone(),
            source,
        })?;

        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.bus.publish(topic, bytes.clone()).await {
                Ok(broker_message_id) => {
                    debug!(%topic, %broker_message_id, attempt, "event published");
                    return Ok(PublishReceipt { broker_message_id });
                }
                Err(error) if attempt < self.policy.max_attempts && is_transient(&error) => {
                    let backoff = self.policy.backoff_for(attempt);
                    warn!(
                        %topic,
                        event_id = %envelope.event_id,
                        attempt,
                        ?backoff,
                        "transient publish failure, retrying: {error}"
                    );
                    sleep(backoff).await;
                }
                Err(source) => {
                    return Err(PublishError::Failed {
                        topic: topic.clone(),
                        event_id: envelope.event_id.clone(),
                        attempts: attempt,
                        source,
                    });
                }
            }
        }
    }
}

/// Misconfiguration (unknown topic/subscription) cannot be fixed by
/// retrying; only transport faults are.
fn is_transient(error: &BrokerError) -> bool {
    matches!(error, BrokerError::Transport(_))
}
