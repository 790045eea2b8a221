//! Event synchronization pipeline between chain-side settlement events and
//! downstream services.
//!
//! A [`watcher`] resumes a source feed from its producer checkpoint and
//! publishes versioned [`envelope`]s onto named topics of an at-least-once
//! [`broker`]. Each consumer group runs a [`runner`] that decodes, dedups
//! via the [`idempotency`] guard, dispatches through the handler
//! [`registry`], advances its [`checkpoint`] and acks — all side effects
//! committing in one transaction before the ack. Poison and malformed
//! messages are parked in the [`dead_letter`] store. The [`lifecycle`]
//! supervisor owns startup and graceful drain of every task.

use sqlx::SqlitePool;
use std::sync::Arc;
use tracing::{error, info};

pub mod broker;
pub mod checkpoint;
pub mod dead_letter;
pub mod env;
pub mod envelope;
pub mod error;
pub mod handlers;
pub mod idempotency;
pub mod lifecycle;
pub mod publisher;
pub mod registry;
pub mod runner;
pub mod telemetry;
pub mod watcher;

pub use telemetry::{TelemetryError, TelemetryGuard};

#[cfg(test)]
pub(crate) mod test_utils;

use crate::broker::{InMemoryBus, MessageBus, SubscriptionName, TopicName};
use crate::env::{Config, FeedConfig, NotifierConfig};
use crate::envelope::{EventKind, StreamId};
use crate::error::PipelineError;
use crate::handlers::{
    MockNotifier, NotificationDispatcher, Notifier, RiskRecalculator, SettlementLedgerWriter,
    WebhookNotifier,
};
use crate::idempotency::{ConsumerGroup, IdempotencyGuard};
use crate::lifecycle::Supervisor;
use crate::publisher::Publisher;
use crate::registry::HandlerRegistry;
use crate::runner::SubscriptionRunner;
use crate::watcher::{ChainWatcher, ReplayFeed, WatcherConfig};

pub async fn launch(config: Config) -> anyhow::Result<()> {
    let pool = config.sqlite_pool().await?;
    sqlx::migrate!().run(&pool).await?;

    let bus: Arc<dyn MessageBus> = Arc::new(InMemoryBus::new(config.lease));
    let mut supervisor = Supervisor::new(config.shutdown_grace);
    build_pipeline(&config, &pool, &bus, &mut supervisor).await?;

    info!("pipeline running");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("received shutdown signal");
        }
        (name, outcome) = supervisor.wait_any() => {
            error!(task = %name, "pipeline task exited unexpectedly: {outcome:?}");
        }
    }

    supervisor.shutdown().await;
    Ok(())
}

async fn build_pipeline(
    config: &Config,
    pool: &SqlitePool,
    bus: &Arc<dyn MessageBus>,
    supervisor: &mut Supervisor,
) -> anyhow::Result<()> {
    let escrow_topic = config.escrow_topic();
    let market_topic = config.market_topic();
    bus.create_topic(&escrow_topic).await?;
    bus.create_topic(&market_topic).await?;

    // Settlement ledger: every escrow lifecycle event.
    let ledger: Arc<SettlementLedgerWriter> = Arc::new(SettlementLedgerWriter);
    let settlement_registry = HandlerRegistry::new()
        .with(EventKind::EscrowDeployed, ledger.clone())
        .with(EventKind::EscrowApproved, ledger.clone())
        .with(EventKind::EscrowReleased, ledger.clone())
        .with(EventKind::EscrowRefunded, ledger);
    spawn_consumer(
        supervisor,
        bus,
        pool,
        config,
        &escrow_topic,
        &config.settlement_subscription(),
        settlement_registry,
    )
    .await?;

    // Risk engine: market events only.
    let risk: Arc<RiskRecalculator> = Arc::new(RiskRecalculator);
    let risk_registry = HandlerRegistry::new()
        .with(EventKind::PriceUpdated, risk.clone())
        .with(EventKind::MarginAlert, risk);
    spawn_consumer(
        supervisor,
        bus,
        pool,
        config,
        &market_topic,
        &config.risk_subscription(),
        risk_registry,
    )
    .await?;

    // Notifications: one consumer group, fanned in from both topics.
    let notifier: Arc<dyn Notifier> = match &config.notifier {
        NotifierConfig::Webhook(url) => Arc::new(WebhookNotifier::new(url.clone())),
        NotifierConfig::DryRun => {
            info!("dry-run notifier active, notifications are recorded only");
            Arc::new(MockNotifier::new())
        }
    };
    let escrow_dispatch = Arc::new(NotificationDispatcher::new(notifier.clone()));
    let escrow_notify_registry = HandlerRegistry::new()
        .with(EventKind::EscrowReleased, escrow_dispatch.clone())
        .with(EventKind::EscrowRefunded, escrow_dispatch);
    spawn_consumer(
        supervisor,
        bus,
        pool,
        config,
        &escrow_topic,
        &config.notifications_subscription(),
        escrow_notify_registry,
    )
    .await?;

    let market_dispatch = Arc::new(NotificationDispatcher::new(notifier));
    let market_notify_registry =
        HandlerRegistry::new().with(EventKind::MarginAlert, market_dispatch);
    spawn_consumer(
        supervisor,
        bus,
        pool,
        config,
        &market_topic,
        &config.notifications_subscription(),
        market_notify_registry,
    )
    .await?;

    match &config.feed {
        FeedConfig::Replay(path) => {
            let feed = ReplayFeed::from_path(path)?;
            let watcher = ChainWatcher::new(
                WatcherConfig {
                    name: "chain-watcher".to_string(),
                    topic: escrow_topic,
                    stream: StreamId::new("escrow:base"),
                    poll_interval: config.watcher_poll_interval,
                    batch_size: config.watcher_batch_size,
                },
                Arc::new(feed),
                Publisher::new(bus.clone(), config.retry_policy()),
                pool.clone(),
                supervisor.shutdown_signal(),
            );
            supervisor.spawn_watcher("chain-watcher", watcher);
        }
        FeedConfig::Disabled => {
            info!("source feed disabled, running consumer-only");
        }
    }

    spawn_idempotency_pruner(config, pool, supervisor);

    Ok(())
}

async fn spawn_consumer(
    supervisor: &mut Supervisor,
    bus: &Arc<dyn MessageBus>,
    pool: &SqlitePool,
    config: &Config,
    topic: &TopicName,
    subscription: &SubscriptionName,
    registry: HandlerRegistry,
) -> anyhow::Result<()> {
    let bus_subscription = bus.subscribe(topic, subscription).await?;
    let runner = SubscriptionRunner::new(
        ConsumerGroup::new(subscription.as_str()),
        bus_subscription,
        Arc::new(registry),
        pool.clone(),
        config.runner_limits(),
        supervisor.shutdown_signal(),
    );
    supervisor.spawn_runner(format!("{subscription}@{topic}"), runner);
    Ok(())
}

fn spawn_idempotency_pruner(config: &Config, pool: &SqlitePool, supervisor: &mut Supervisor) {
    const PRUNE_INTERVAL: std::time::Duration = std::time::Duration::from_secs(3600);

    let guard = IdempotencyGuard::new(pool.clone());
    let retention = chrono::Duration::days(config.idempotency_retention_days);
    let mut shutdown = supervisor.shutdown_signal();

    supervisor.spawn("idempotency-pruner", async move {
        loop {
            if *shutdown.borrow() {
                return Ok::<(), PipelineError>(());
            }
            if let Err(error) = guard.prune_older_than(retention).await {
                error!("idempotency pruning failed: {error}");
            }
            let _ = tokio::time::timeout(PRUNE_INTERVAL, shutdown.changed()).await;
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::env::tests::create_test_config;
    use std::time::Duration;
    use tokio::time::timeout;

    #[tokio::test]
    async fn pipeline_builds_and_drains_cleanly() {
        let config = create_test_config();
        let pool = config.sqlite_pool().await.unwrap();
        sqlx::migrate!().run(&pool).await.unwrap();

        let bus: Arc<dyn MessageBus> = Arc::new(InMemoryBus::new(config.lease));
        let mut supervisor = Supervisor::new(Duration::from_secs(5));
        build_pipeline(&config, &pool, &bus, &mut supervisor)
            .await
            .unwrap();

        timeout(Duration::from_secs(5), supervisor.shutdown())
            .await
            .expect("pipeline did not drain");
    }

    #[tokio::test]
    async fn replay_feed_config_requires_a_readable_file() {
        let mut config = create_test_config();
        config.feed = FeedConfig::Replay("/nonexistent/events.jsonl".into());
        let pool = config.sqlite_pool().await.unwrap();
        sqlx::migrate!().run(&pool).await.unwrap();

        let bus: Arc<dyn MessageBus> = Arc::new(InMemoryBus::new(config.lease));
        let mut supervisor = Supervisor::new(Duration::from_secs(1));
        let result = build_pipeline(&config, &pool, &bus, &mut supervisor).await;
        assert!(result.is_err());

        supervisor.shutdown().await;
    }
}
