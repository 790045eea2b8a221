//! Shared test fixtures: database setup and envelope/source-event builders.

use chrono::Utc;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use sqlx::SqlitePool;
use sqlx::sqlite::SqlitePoolOptions;

use crate::envelope::{Address, Envelope, EventId, Payload, StreamId, StreamPosition, TxHash};
use crate::watcher::SourceEvent;

/// In-memory SQLite database with all migrations applied. Single
/// connection: each `:memory:` connection is its own database, so every
/// task must share the one that ran the migrations.
pub(crate) async fn setup_test_db() -> SqlitePool {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect(":memory:")
        .await
        .unwrap();
    sqlx::migrate!().run(&pool).await.unwrap();
    pool
}

pub(crate) fn test_address(fill: char) -> Address {
    let hex: String = std::iter::repeat_n(fill, 40).collect();
    format!("0x{hex}").parse().unwrap()
}

pub(crate) fn test_tx_hash(fill: char) -> TxHash {
    let hex: String = std::iter::repeat_n(fill, 64).collect();
    format!("0x{hex}").parse().unwrap()
}

/// Price tick at sequence `seq` on the `prices:usd` stream.
pub(crate) fn price_envelope(seq: u64) -> Envelope {
    Envelope::new(
        EventId::new(format!("price-{seq}")),
        StreamId::new("prices:usd"),
        StreamPosition::sequence(seq),
        Utc::now(),
        Payload::PriceUpdated {
            pair: "ETH/USD".to_string(),
            price: Decimal::from(seq),
        },
    )
}

/// Escrow deployment at `(block, log_index)` on the `escrow:base` stream.
pub(crate) fn escrow_envelope(block: u64, log_index: u64) -> Envelope {
    let source = source_event(block, log_index);
    Envelope::new(
        source.event_id,
        StreamId::new("escrow:base"),
        source.position,
        source.produced_at,
        source.payload,
    )
}

/// Escrow deployment as it would come off the source feed.
pub(crate) fn source_event(block: u64, log_index: u64) -> SourceEvent {
    SourceEvent {
        event_id: EventId::new(format!("escrow-{block}-{log_index}")),
        position: StreamPosition::new(block, log_index),
        produced_at: Utc::now(),
        payload: Payload::EscrowDeployed {
            escrow: test_address('e'),
            buyer: test_address('b'),
            seller: test_address('c'),
            asset: "USDC".to_string(),
            amount: dec!(1000),
        },
    }
}
