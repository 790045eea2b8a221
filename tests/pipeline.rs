//! End-to-end pipeline scenarios: publish through the bus, consume through
//! running subscription runners, and assert on the durable state.

use async_trait::async_trait;
use sqlx::{Sqlite, SqlitePool, Transaction};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, timeout};

use ledgerbus::broker::{
    BusSubscription, InMemoryBus, MessageBus, SubscriptionName, TopicName,
};
use ledgerbus::checkpoint::{CheckpointScope, CheckpointStore};
use ledgerbus::dead_letter::DeadLetterStore;
use ledgerbus::envelope::{Envelope, EventKind, StreamPosition};
use ledgerbus::handlers::{MockNotifier, NotificationDispatcher, SettlementLedgerWriter};
use ledgerbus::idempotency::ConsumerGroup;
use ledgerbus::lifecycle::Supervisor;
use ledgerbus::publisher::{Publisher, RetryPolicy};
use ledgerbus::registry::{EventHandler, HandlerError, HandlerOutcome, HandlerRegistry};
use ledgerbus::runner::{RunnerLimits, SubscriptionRunner};

use crate::common::{
    deployed_at, escrow_stream, eventually, idempotency_rows, ledger_rows, released_at,
    setup_test_db, test_address,
};

fn topic() -> TopicName {
    TopicName::new("escrow-events")
}

fn settlement_registry() -> HandlerRegistry {
    let ledger: Arc<SettlementLedgerWriter> = Arc::new(SettlementLedgerWriter);
    HandlerRegistry::new()
        .with(EventKind::EscrowDeployed, ledger.clone())
        .with(EventKind::EscrowApproved, ledger.clone())
        .with(EventKind::EscrowReleased, ledger.clone())
        .with(EventKind::EscrowRefunded, ledger)
}

fn fast_limits() -> RunnerLimits {
    RunnerLimits {
        idle_backoff: Duration::from_millis(10),
        ..RunnerLimits::default()
    }
}

async fn escrow_bus() -> InMemoryBus {
    let bus = InMemoryBus::new(Duration::from_secs(30));
    bus.create_topic(&topic()).await.unwrap();
    bus
}

async fn spawn_settlement_consumer(
    supervisor: &mut Supervisor,
    bus: &InMemoryBus,
    pool: &SqlitePool,
) -> Arc<dyn BusSubscription> {
    let subscription = bus
        .subscribe(&topic(), &SubscriptionName::new("settlement-ledger"))
        .await
        .unwrap();
    let runner = SubscriptionRunner::new(
        ConsumerGroup::new("settlement-ledger"),
        subscription.clone(),
        Arc::new(settlement_registry()),
        pool.clone(),
        fast_limits(),
        supervisor.shutdown_signal(),
    );
    supervisor.spawn_runner("settlement-ledger", runner);
    subscription
}

fn publisher(bus: &InMemoryBus) -> Publisher {
    Publisher::new(Arc::new(bus.clone()), RetryPolicy::default())
}

#[tokio::test]
async fn duplicate_delivery_produces_exactly_one_side_effect() {
    let pool = setup_test_db().await;
    let bus = escrow_bus().await;
    let mut supervisor = Supervisor::new(Duration::from_secs(10));
    spawn_settlement_consumer(&mut supervisor, &bus, &pool).await;

    // The same logical event published twice: two messages, one event_id.
    let envelope = deployed_at(100, 5, 'e');
    let publisher = publisher(&bus);
    publisher.publish(&topic(), &envelope).await.unwrap();
    publisher.publish(&topic(), &envelope).await.unwrap();

    eventually("both deliveries settled", || async {
        idempotency_rows(&pool, envelope.event_id.as_str()).await == 1
            && ledger_rows(&pool).await == 1
    })
    .await;

    // Give the second delivery time to be (wrongly) applied if dedup leaked.
    sleep(Duration::from_millis(100)).await;
    assert_eq!(ledger_rows(&pool).await, 1);
    assert_eq!(idempotency_rows(&pool, envelope.event_id.as_str()).await, 1);

    let checkpoints = CheckpointStore::new(pool.clone());
    let position = checkpoints
        .get(
            &CheckpointScope::consumer(&ConsumerGroup::new("settlement-ledger")),
            &escrow_stream(),
        )
        .await
        .unwrap();
    assert_eq!(position, Some(StreamPosition::new(100, 5)));

    supervisor.shutdown().await;
}

#[tokio::test]
async fn malformed_message_is_parked_and_does_not_stall_the_stream() {
    let pool = setup_test_db().await;
    let bus = escrow_bus().await;
    let mut supervisor = Supervisor::new(Duration::from_secs(10));
    spawn_settlement_consumer(&mut supervisor, &bus, &pool).await;

    let publisher = publisher(&bus);
    publisher
        .publish(&topic(), &deployed_at(100, 1, 'd'))
        .await
        .unwrap();
    bus.publish(&topic(), b"\x00garbled".to_vec()).await.unwrap();
    publisher
        .publish(&topic(), &deployed_at(100, 3, 'f'))
        .await
        .unwrap();

    eventually("valid neighbors processed", || async {
        ledger_rows(&pool).await == 2
    })
    .await;

    let dead_letters = DeadLetterStore::new(pool.clone());
    let group = ConsumerGroup::new("settlement-ledger");
    eventually("malformed message parked", || async {
        dead_letters.count(&group).await.unwrap() == 1
    })
    .await;

    let parked = dead_letters.recent(&group, 1).await.unwrap();
    assert_eq!(parked[0].payload, b"\x00garbled");

    supervisor.shutdown().await;
}

#[tokio::test]
async fn restart_resumes_only_the_unacked_tail() {
    let pool = setup_test_db().await;
    let bus = escrow_bus().await;
    let publisher = publisher(&bus);

    // First consumer session: events at 100 and 101 are fully processed.
    let mut session_one = Supervisor::new(Duration::from_secs(10));
    spawn_settlement_consumer(&mut session_one, &bus, &pool).await;

    publisher
        .publish(&topic(), &deployed_at(100, 0, '1'))
        .await
        .unwrap();
    publisher
        .publish(&topic(), &deployed_at(101, 0, '2'))
        .await
        .unwrap();

    eventually("first two events processed", || async {
        ledger_rows(&pool).await == 2
    })
    .await;
    session_one.shutdown().await;

    // Event at 102 arrives while no consumer instance is running; it sits
    // unacked at the broker, which is the durable store here.
    publisher
        .publish(&topic(), &deployed_at(102, 0, '3'))
        .await
        .unwrap();

    let checkpoints = CheckpointStore::new(pool.clone());
    let scope = CheckpointScope::consumer(&ConsumerGroup::new("settlement-ledger"));
    assert_eq!(
        checkpoints.get(&scope, &escrow_stream()).await.unwrap(),
        Some(StreamPosition::new(101, 0))
    );

    // Replacement instance on the same subscription picks up only the tail.
    let mut session_two = Supervisor::new(Duration::from_secs(10));
    spawn_settlement_consumer(&mut session_two, &bus, &pool).await;

    eventually("tail event processed after restart", || async {
        ledger_rows(&pool).await == 3
    })
    .await;

    assert_eq!(
        checkpoints.get(&scope, &escrow_stream()).await.unwrap(),
        Some(StreamPosition::new(102, 0))
    );
    // The first two events were not reprocessed: one idempotency record
    // each, committed in the first session.
    assert_eq!(idempotency_rows(&pool, "deploy-100-0").await, 1);
    assert_eq!(idempotency_rows(&pool, "deploy-101-0").await, 1);

    session_two.shutdown().await;
}

/// Ledger writer that stalls mid-handler so shutdown can arrive while the
/// side effect is in flight.
struct SlowLedger {
    delay: Duration,
}

#[async_trait]
impl EventHandler for SlowLedger {
    async fn handle(
        &self,
        tx: &mut Transaction<'_, Sqlite>,
        envelope: &Envelope,
    ) -> Result<HandlerOutcome, HandlerError> {
        sleep(self.delay).await;
        SettlementLedgerWriter.handle(tx, envelope).await
    }
}

#[tokio::test]
async fn shutdown_mid_handler_commits_fully_or_not_at_all() {
    let pool = setup_test_db().await;
    let bus = escrow_bus().await;
    let subscription = bus
        .subscribe(&topic(), &SubscriptionName::new("settlement-ledger"))
        .await
        .unwrap();

    let registry = HandlerRegistry::new().with(
        EventKind::EscrowDeployed,
        Arc::new(SlowLedger {
            delay: Duration::from_millis(200),
        }),
    );

    let mut supervisor = Supervisor::new(Duration::from_secs(10));
    let runner = SubscriptionRunner::new(
        ConsumerGroup::new("settlement-ledger"),
        subscription.clone(),
        Arc::new(registry),
        pool.clone(),
        fast_limits(),
        supervisor.shutdown_signal(),
    );
    supervisor.spawn_runner("settlement-ledger", runner);

    publisher(&bus)
        .publish(&topic(), &deployed_at(100, 0, 'e'))
        .await
        .unwrap();

    // Let the handler start, then shut down while it is mid-flight.
    sleep(Duration::from_millis(50)).await;
    timeout(Duration::from_secs(5), supervisor.shutdown())
        .await
        .expect("drain did not finish");

    // Graceful drain: the in-flight unit ran to completion and was acked.
    assert_eq!(ledger_rows(&pool).await, 1);
    assert_eq!(idempotency_rows(&pool, "deploy-100-0").await, 1);
    assert!(subscription.pull(10).await.unwrap().is_empty());
}

#[tokio::test]
async fn fan_out_groups_consume_and_checkpoint_independently() {
    let pool = setup_test_db().await;
    let bus = escrow_bus().await;
    let mut supervisor = Supervisor::new(Duration::from_secs(10));
    spawn_settlement_consumer(&mut supervisor, &bus, &pool).await;

    // Second group on the same topic: notifications for releases only.
    let notifier = Arc::new(MockNotifier::new());
    let notify_subscription = bus
        .subscribe(&topic(), &SubscriptionName::new("notifications"))
        .await
        .unwrap();
    let notify_registry = HandlerRegistry::new().with(
        EventKind::EscrowReleased,
        Arc::new(NotificationDispatcher::new(notifier.clone())),
    );
    let notify_runner = SubscriptionRunner::new(
        ConsumerGroup::new("notifications"),
        notify_subscription,
        Arc::new(notify_registry),
        pool.clone(),
        fast_limits(),
        supervisor.shutdown_signal(),
    );
    supervisor.spawn_runner("notifications", notify_runner);

    let publisher = publisher(&bus);
    publisher
        .publish(&topic(), &deployed_at(100, 0, 'e'))
        .await
        .unwrap();
    publisher
        .publish(&topic(), &released_at(101, 0, 'e'))
        .await
        .unwrap();

    eventually("ledger settled and notification sent", || async {
        let state: Option<String> =
            sqlx::query_scalar("SELECT state FROM settlement_ledger WHERE escrow = ?1")
                .bind(test_address('e').to_string())
                .fetch_optional(&pool)
                .await
                .unwrap();
        state.as_deref() == Some("released") && notifier.sent().len() == 1
    })
    .await;

    let checkpoints = CheckpointStore::new(pool.clone());
    let ledger_position = checkpoints
        .get(
            &CheckpointScope::consumer(&ConsumerGroup::new("settlement-ledger")),
            &escrow_stream(),
        )
        .await
        .unwrap();
    let notify_position = checkpoints
        .get(
            &CheckpointScope::consumer(&ConsumerGroup::new("notifications")),
            &escrow_stream(),
        )
        .await
        .unwrap();

    assert_eq!(ledger_position, Some(StreamPosition::new(101, 0)));
    // The notifications group acked the deployment without a handler, so
    // its checkpoint reflects only work it actually performed.
    assert_eq!(notify_position, Some(StreamPosition::new(101, 0)));

    supervisor.shutdown().await;
}

#[tokio::test]
async fn watcher_feeds_consumers_end_to_end() {
    use ledgerbus::watcher::{ChainWatcher, ReplayFeed, SourceEvent, WatcherConfig};

    let pool = setup_test_db().await;
    let bus = escrow_bus().await;
    let mut supervisor = Supervisor::new(Duration::from_secs(10));
    spawn_settlement_consumer(&mut supervisor, &bus, &pool).await;

    let events: Vec<SourceEvent> = [(100u64, '1'), (101, '2'), (102, '3')]
        .into_iter()
        .map(|(block, fill)| {
            let envelope = deployed_at(block, 0, fill);
            SourceEvent {
                event_id: envelope.event_id.clone(),
                position: envelope.position,
                produced_at: envelope.produced_at,
                payload: envelope.payload.clone(),
            }
        })
        .collect();

    let watcher = ChainWatcher::new(
        WatcherConfig {
            name: "chain-watcher".to_string(),
            topic: topic(),
            stream: escrow_stream(),
            poll_interval: Duration::from_millis(10),
            batch_size: 16,
        },
        Arc::new(ReplayFeed::from_events(events)),
        Publisher::new(Arc::new(bus.clone()), RetryPolicy::default()),
        pool.clone(),
        supervisor.shutdown_signal(),
    );
    supervisor.spawn_watcher("chain-watcher", watcher);

    eventually("all source events reached the ledger", || async {
        ledger_rows(&pool).await == 3
    })
    .await;

    let checkpoints = CheckpointStore::new(pool.clone());
    assert_eq!(
        checkpoints
            .get(&CheckpointScope::producer("chain-watcher"), &escrow_stream())
            .await
            .unwrap(),
        Some(StreamPosition::new(102, 0))
    );
    assert_eq!(
        checkpoints
            .get(
                &CheckpointScope::consumer(&ConsumerGroup::new("settlement-ledger")),
                &escrow_stream()
            )
            .await
            .unwrap(),
        Some(StreamPosition::new(102, 0))
    );

    supervisor.shutdown().await;
}

#[tokio::test]
async fn supervisor_with_no_tasks_shuts_down_immediately() {
    let supervisor = Supervisor::new(Duration::from_secs(1));
    timeout(Duration::from_secs(1), supervisor.shutdown())
        .await
        .unwrap();
}
