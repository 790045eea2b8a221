//! Per-consumer dedup keyed on the stable event identity.
//!
//! The bus is at-least-once: the same `event_id` can arrive as any number of
//! messages. A claim is an `INSERT .. ON CONFLICT DO NOTHING` on the
//! `(consumer_group, event_id)` unique key, executed inside the same
//! transaction as the handler's side effect and the checkpoint advance.
//! Exactly one delivery commits; every other concurrent or later delivery
//! sees `AlreadyProcessed`. A rolled-back claim leaves no record, so a
//! failed handler attempt is retryable.

use chrono::Duration;
use sqlx::{Sqlite, SqlitePool, Transaction};
use std::fmt;
use tracing::info;

use crate::envelope::EventId;

/// Name of a consumer group; doubles as the dedup namespace.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConsumerGroup(String);

impl ConsumerGroup {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConsumerGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Outcome of a claim attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Claim {
    Claimed,
    AlreadyProcessed,
}

#[derive(Debug, Clone)]
pub struct IdempotencyGuard {
    pool: SqlitePool,
}

impl IdempotencyGuard {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Fast-path check used before opening the handler transaction, so a
    /// redelivered already-completed message is acked without touching the
    /// handler at all.
    pub async fn is_processed(
        &self,
        group: &ConsumerGroup,
        event_id: &EventId,
    ) -> Result<bool, sqlx::Error> {
        let row: Option<(i64,)> = sqlx::query_as(
            "SELECT 1 FROM idempotency_records \
             WHERE consumer_group = ?1 AND event_id = ?2 AND status = 'completed'",
        )
        .bind(group.as_str())
        .bind(event_id.as_str())
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.is_some())
    }

    /// Attempts to claim `(group, event_id)` inside the caller's
    /// transaction. The uniqueness constraint makes concurrent claims
    /// resolve deterministically: one `Claimed`, the rest
    /// `AlreadyProcessed`.
    pub async fn try_claim(
        tx: &mut Transaction<'_, Sqlite>,
        group: &ConsumerGroup,
        event_id: &EventId,
    ) -> Result<Claim, sqlx::Error> {
        let result = sqlx::query(
            "INSERT INTO idempotency_records (consumer_group, event_id, status) \
             VALUES (?1, ?2, 'completed') \
             ON CONFLICT (consumer_group, event_id) DO NOTHING",
        )
        .bind(group.as_str())
        .bind(event_id.as_str())
        .execute(&mut **tx)
        .await?;

        if result.rows_affected() > 0 {
            Ok(Claim::Claimed)
        } else {
            Ok(Claim::AlreadyProcessed)
        }
    }

    /// Attaches the handler's result summary to a claimed record, within
    /// the same transaction as the claim.
    pub async fn record_outcome(
        tx: &mut Transaction<'_, Sqlite>,
        group: &ConsumerGroup,
        event_id: &EventId,
        outcome: &str,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            "UPDATE idempotency_records SET outcome = ?3 \
             WHERE consumer_group = ?1 AND event_id = ?2",
        )
        .bind(group.as_str())
        .bind(event_id.as_str())
        .bind(outcome)
        .execute(&mut **tx)
        .await?;

        Ok(())
    }

    /// Removes records older than `retention`. Safe only while the broker's
    /// message retention is shorter than `retention`, so no redelivery can
    /// arrive after its record is gone.
    pub async fn prune_older_than(&self, retention: Duration) -> Result<u64, sqlx::Error> {
        let cutoff = format!("-{} seconds", retention.num_seconds());
        let result = sqlx::query(
            "DELETE FROM idempotency_records \
             WHERE processed_at < datetime('now', ?1)",
        )
        .bind(&cutoff)
        .execute(&self.pool)
        .await?;

        let pruned = result.rows_affected();
        if pruned > 0 {
            info!(pruned, "pruned idempotency records past retention");
        }
        Ok(pruned)
    }
}
