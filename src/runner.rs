//! The long-lived pull loop for one subscription.
//!
//! Per-message state machine: received → handler invoked → ack on success,
//! no-ack (redelivery) on failure. Terminal states are `acked` or parked in
//! the dead-letter store once the configured delivery attempt budget is
//! spent, so a poison message can never loop forever.
//!
//! The handler's side effect, the idempotency record, and the checkpoint
//! advance commit in one SQLite transaction; the broker ack follows the
//! commit. A crash between commit and ack is safe: the redelivered message
//! hits the idempotency fast path and is acked without re-running the
//! handler.

use futures_util::stream::{self, StreamExt};
use sqlx::SqlitePool;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{Instant, sleep, sleep_until, timeout};
use tracing::{debug, error, info, warn};

use crate::broker::{BusSubscription, Delivery};
use crate::checkpoint::{CheckpointScope, CheckpointStore};
use crate::dead_letter::DeadLetterStore;
use crate::envelope::Envelope;
use crate::error::PipelineError;
use crate::idempotency::{Claim, ConsumerGroup, IdempotencyGuard};
use crate::registry::{EventHandler, HandlerError, HandlerRegistry};

#[derive(Debug, Clone)]
pub struct RunnerLimits {
    /// Messages processed concurrently within this runner.
    pub max_in_flight: usize,
    /// Delivery attempts before a message is dead-lettered.
    pub max_delivery_attempts: u32,
    /// Hard deadline per handler invocation; expiry counts as failure.
    pub handler_deadline: Duration,
    /// Lease granted on each proactive renewal while a handler runs.
    pub lease_extension: Duration,
    /// Sleep between empty pulls.
    pub idle_backoff: Duration,
}

impl Default for RunnerLimits {
    fn default() -> Self {
        Self {
            max_in_flight: 8,
            max_delivery_attempts: 5,
            handler_deadline: Duration::from_secs(25),
            lease_extension: Duration::from_secs(30),
            idle_backoff: Duration::from_millis(100),
        }
    }
}

/// Terminal disposition of one delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Disposition {
    /// Handler ran, unit committed, message acked.
    Completed,
    /// Idempotency short-circuit: already processed, acked without the
    /// handler running.
    Duplicate,
    /// Parked in the dead-letter store and acked.
    DeadLettered,
    /// No handler registered for the kind; acked.
    Unhandled,
    /// Not acked; the broker will redeliver.
    Retrying,
}

enum Executed {
    Completed,
    Duplicate,
}

enum ExecutionFailure {
    Permanent(String),
    Transient(anyhow::Error),
    DeadlineExceeded,
}

impl From<sqlx::Error> for ExecutionFailure {
    fn from(error: sqlx::Error) -> Self {
        Self::Transient(error.into())
    }
}

impl From<crate::checkpoint::CheckpointError> for ExecutionFailure {
    fn from(error: crate::checkpoint::CheckpointError) -> Self {
        Self::Transient(error.into())
    }
}

pub struct SubscriptionRunner {
    group: ConsumerGroup,
    subscription: Arc<dyn BusSubscription>,
    registry: Arc<HandlerRegistry>,
    pool: SqlitePool,
    guard: IdempotencyGuard,
    dead_letters: DeadLetterStore,
    scope: CheckpointScope,
    limits: RunnerLimits,
    shutdown: watch::Receiver<bool>,
}

impl SubscriptionRunner {
    pub fn new(
        group: ConsumerGroup,
        subscription: Arc<dyn BusSubscription>,
        registry: Arc<HandlerRegistry>,
        pool: SqlitePool,
        limits: RunnerLimits,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let guard = IdempotencyGuard::new(pool.clone());
        let dead_letters = DeadLetterStore::new(pool.clone());
        let scope = CheckpointScope::consumer(&group);
        Self {
            group,
            subscription,
            registry,
            pool,
            guard,
            dead_letters,
            scope,
            limits,
            shutdown,
        }
    }

    /// Pulls and processes until the shutdown signal flips. Messages already
    /// in flight when the signal arrives finish their handler + ack cycle
    /// before this returns; nothing is abandoned mid-unit.
    pub async fn run(mut self) -> Result<(), PipelineError> {
        info!(group = %self.group, "subscription runner started");

        loop {
            if *self.shutdown.borrow() {
                break;
            }

            let deliveries = match self.subscription.pull(self.limits.max_in_flight).await {
                Ok(deliveries) => deliveries,
                Err(error) => {
                    warn!(group = %self.group, "pull failed, backing off: {error}");
                    sleep(self.limits.idle_backoff).await;
                    continue;
                }
            };

            if deliveries.is_empty() {
                let _ = timeout(self.limits.idle_backoff, self.shutdown.changed()).await;
                continue;
            }

            let runner = &self;
            stream::iter(deliveries)
                .for_each_concurrent(self.limits.max_in_flight, |delivery| async move {
                    let message_id = delivery.message_id;
                    if let Err(error) = runner.process_delivery(delivery).await {
                        error!(
                            group = %runner.group,
                            %message_id,
                            "delivery processing failed, leaving unacked: {error}"
                        );
                    }
                })
                .await;
        }

        info!(group = %self.group, "subscription runner stopped");
        Ok(())
    }

    pub(crate) async fn process_delivery(
        &self,
        delivery: Delivery,
    ) -> Result<Disposition, PipelineError> {
        let envelope = match Envelope::decode(&delivery.payload) {
            Ok(envelope) => envelope,
            Err(error) => {
                // Terminal: retrying cannot make the bytes parseable.
                self.dead_letters
                    .record_undecodable(
                        &self.group,
                        &delivery.payload,
                        delivery.attempt,
                        &error.to_string(),
                    )
                    .await?;
                self.subscription.ack(delivery.message_id).await?;
                return Ok(Disposition::DeadLettered);
            }
        };

        if delivery.attempt > self.limits.max_delivery_attempts {
            self.dead_letters
                .record(
                    &self.group,
                    &envelope,
                    &delivery.payload,
                    delivery.attempt,
                    "delivery attempts exhausted",
                )
                .await?;
            self.subscription.ack(delivery.message_id).await?;
            return Ok(Disposition::DeadLettered);
        }

        let Some(handler) = self.registry.get(envelope.kind()) else {
            debug!(
                group = %self.group,
                kind = %envelope.kind(),
                event_id = %envelope.event_id,
                "no handler registered, acking"
            );
            self.subscription.ack(delivery.message_id).await?;
            return Ok(Disposition::Unhandled);
        };

        if self
            .guard
            .is_processed(&self.group, &envelope.event_id)
            .await?
        {
            debug!(
                group = %self.group,
                event_id = %envelope.event_id,
                "already processed, acking redelivery"
            );
            self.subscription.ack(delivery.message_id).await?;
            return Ok(Disposition::Duplicate);
        }

        match self.execute_with_lease(&delivery, &envelope, handler).await {
            Ok(Executed::Completed) => {
                self.subscription.ack(delivery.message_id).await?;
                debug!(
                    group = %self.group,
                    event_id = %envelope.event_id,
                    position = %envelope.position,
                    "event processed"
                );
                Ok(Disposition::Completed)
            }
            Ok(Executed::Duplicate) => {
                self.subscription.ack(delivery.message_id).await?;
                Ok(Disposition::Duplicate)
            }
            Err(ExecutionFailure::Permanent(reason)) => {
                self.dead_letters
                    .record(
                        &self.group,
                        &envelope,
                        &delivery.payload,
                        delivery.attempt,
                        &reason,
                    )
                    .await?;
                self.subscription.ack(delivery.message_id).await?;
                Ok(Disposition::DeadLettered)
            }
            Err(ExecutionFailure::Transient(error)) => {
                warn!(
                    group = %self.group,
                    event_id = %envelope.event_id,
                    kind = %envelope.kind(),
                    position = %envelope.position,
                    attempt = delivery.attempt,
                    "transient failure, message will be redelivered: {error:#}"
                );
                let _ = self.subscription.nack(delivery.message_id).await;
                Ok(Disposition::Retrying)
            }
            Err(ExecutionFailure::DeadlineExceeded) => {
                warn!(
                    group = %self.group,
                    event_id = %envelope.event_id,
                    kind = %envelope.kind(),
                    position = %envelope.position,
                    attempt = delivery.attempt,
                    deadline = ?self.limits.handler_deadline,
                    "handler deadline exceeded, message will be redelivered"
                );
                let _ = self.subscription.nack(delivery.message_id).await;
                Ok(Disposition::Retrying)
            }
        }
    }

    /// Drives one handler unit while proactively renewing the broker lease
    /// at half-extension intervals, bounded overall by the handler deadline.
    async fn execute_with_lease(
        &self,
        delivery: &Delivery,
        envelope: &Envelope,
        handler: Arc<dyn EventHandler>,
    ) -> Result<Executed, ExecutionFailure> {
        let deadline = Instant::now() + self.limits.handler_deadline;
        let unit = self.execute_unit(envelope, handler);
        tokio::pin!(unit);

        loop {
            tokio::select! {
                result = &mut unit => return result,
                () = sleep_until(deadline) => return Err(ExecutionFailure::DeadlineExceeded),
                () = sleep(self.limits.lease_extension / 2) => {
                    if let Err(error) = self
                        .subscription
                        .extend_lease(delivery.message_id, self.limits.lease_extension)
                        .await
                    {
                        warn!(
                            group = %self.group,
                            message_id = %delivery.message_id,
                            "failed to extend lease: {error}"
                        );
                    }
                }
            }
        }
    }

    /// One atomic unit: claim, side effect, checkpoint, commit.
    async fn execute_unit(
        &self,
        envelope: &Envelope,
        handler: Arc<dyn EventHandler>,
    ) -> Result<Executed, ExecutionFailure> {
        let mut tx = self.pool.begin().await?;

        match IdempotencyGuard::try_claim(&mut tx, &self.group, &envelope.event_id).await? {
            Claim::AlreadyProcessed => {
                tx.rollback().await?;
                return Ok(Executed::Duplicate);
            }
            Claim::Claimed => {}
        }

        match handler.handle(&mut tx, envelope).await {
            Ok(outcome) => {
                if let Some(summary) = &outcome.summary {
                    IdempotencyGuard::record_outcome(
                        &mut tx,
                        &self.group,
                        &envelope.event_id,
                        summary,
                    )
                    .await?;
                }
                CheckpointStore::advance_in_tx(
                    &mut tx,
                    &self.scope,
                    &envelope.stream_id,
                    envelope.position,
                )
                .await?;
                tx.commit().await?;
                Ok(Executed::Completed)
            }
            Err(HandlerError::Permanent(reason)) => {
                let _ = tx.rollback().await;
                Err(ExecutionFailure::Permanent(reason))
            }
            Err(error) => {
                let _ = tx.rollback().await;
                Err(ExecutionFailure::Transient(error.into()))
            }
        }
    }
}
