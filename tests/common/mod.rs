//! Shared fixtures for the end-to-end pipeline tests.

use chrono::Utc;
use rust_decimal_macros::dec;
use sqlx::SqlitePool;
use sqlx::sqlite::SqlitePoolOptions;
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;

use ledgerbus::envelope::{Address, Envelope, EventId, Payload, StreamId, StreamPosition};

/// Single connection: each `:memory:` connection is its own database, so
/// every task must share the one that ran the migrations.
pub async fn setup_test_db() -> SqlitePool {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect(":memory:")
        .await
        .unwrap();
    sqlx::migrate!().run(&pool).await.unwrap();
    pool
}

pub fn test_address(fill: char) -> Address {
    let hex: String = std::iter::repeat_n(fill, 40).collect();
    format!("0x{hex}").parse().unwrap()
}

pub fn escrow_stream() -> StreamId {
    StreamId::new("escrow:base")
}

/// Escrow deployment at `(block, log_index)`; the escrow address (and so the
/// ledger's natural key) is derived from `escrow_fill`.
pub fn deployed_at(block: u64, log_index: u64, escrow_fill: char) -> Envelope {
    Envelope::new(
        EventId::new(format!("deploy-{block}-{log_index}")),
        escrow_stream(),
        StreamPosition::new(block, log_index),
        Utc::now(),
        Payload::EscrowDeployed {
            escrow: test_address(escrow_fill),
            buyer: test_address('b'),
            seller: test_address('c'),
            asset: "USDC".to_string(),
            amount: dec!(1000),
        },
    )
}

pub fn released_at(block: u64, log_index: u64, escrow_fill: char) -> Envelope {
    Envelope::new(
        EventId::new(format!("release-{block}-{log_index}")),
        escrow_stream(),
        StreamPosition::new(block, log_index),
        Utc::now(),
        Payload::EscrowReleased {
            escrow: test_address(escrow_fill),
            recipient: test_address('c'),
            amount: dec!(1000),
        },
    )
}

/// Polls `condition` every 10ms until it holds, panicking after 5 seconds.
pub async fn eventually<F, Fut>(description: &str, condition: F)
where
    F: Fn() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        if condition().await {
            return;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for: {description}"
        );
        sleep(Duration::from_millis(10)).await;
    }
}

pub async fn ledger_rows(pool: &SqlitePool) -> i64 {
    sqlx::query_scalar("SELECT COUNT(*) FROM settlement_ledger")
        .fetch_one(pool)
        .await
        .unwrap()
}

pub async fn idempotency_rows(pool: &SqlitePool, event_id: &str) -> i64 {
    sqlx::query_scalar("SELECT COUNT(*) FROM idempotency_records WHERE event_id = ?1")
        .bind(event_id)
        .fetch_one(pool)
        .await
        .unwrap()
}
