//! Terminal routing path for messages that must not be retried further.
//!
//! Every parked message keeps its full envelope metadata and raw payload so
//! an operator can inspect, fix, and manually replay it. Nothing that lands
//! here is ever redelivered by the bus; the runner acks the message as part
//! of parking it.

use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};
use std::num::TryFromIntError;
use tracing::error;

use crate::envelope::Envelope;
use crate::idempotency::ConsumerGroup;

#[derive(Debug, thiserror::Error)]
pub enum DeadLetterError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("position out of range: {0}")]
    PositionOutOfRange(#[from] TryFromIntError),
}

/// A parked message as read back for operator inspection.
#[derive(Debug, Clone)]
pub struct DeadLetter {
    pub id: i64,
    pub consumer_group: String,
    pub event_id: Option<String>,
    pub event_kind: Option<String>,
    pub stream_id: Option<String>,
    pub attempt: u32,
    pub reason: String,
    pub payload: Vec<u8>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct DeadLetterStore {
    pool: SqlitePool,
}

impl DeadLetterStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Parks a decoded envelope with full diagnostic context.
    pub async fn record(
        &self,
        group: &ConsumerGroup,
        envelope: &Envelope,
        payload: &[u8],
        attempt: u32,
        reason: &str,
    ) -> Result<(), DeadLetterError> {
        error!(
            consumer_group = %group,
            event_id = %envelope.event_id,
            kind = %envelope.kind(),
            position = %envelope.position,
            attempt,
            reason,
            "dead-lettering message"
        );

        sqlx::query(
            "INSERT INTO dead_letters \
             (consumer_group, event_id, event_kind, stream_id, position_block, position_log, \
              attempt, reason, payload) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        )
        .bind(group.as_str())
        .bind(envelope.event_id.as_str())
        .bind(envelope.kind().to_string())
        .bind(envelope.stream_id.as_str())
        .bind(i64::try_from(envelope.position.block)?)
        .bind(i64::try_from(envelope.position.log_index)?)
        .bind(i64::from(attempt))
        .bind(reason)
        .bind(payload)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Parks a message that could not even be decoded; only the raw payload
    /// and the failure reason are available.
    pub async fn record_undecodable(
        &self,
        group: &ConsumerGroup,
        payload: &[u8],
        attempt: u32,
        reason: &str,
    ) -> Result<(), DeadLetterError> {
        error!(
            consumer_group = %group,
            attempt,
            reason,
            payload_len = payload.len(),
            "dead-lettering undecodable message"
        );

        sqlx::query(
            "INSERT INTO dead_letters (consumer_group, attempt, reason, payload) \
             VALUES (?1, ?2, ?3, ?4)",
        )
        .bind(group.as_str())
        .bind(i64::from(attempt))
        .bind(reason)
        .bind(payload)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn count(&self, group: &ConsumerGroup) -> Result<i64, DeadLetterError> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM dead_letters WHERE consumer_group = ?1")
                .bind(group.as_str())
                .fetch_one(&self.pool)
                .await?;
        Ok(count)
    }

    pub async fn recent(
        &self,
        group: &ConsumerGroup,
        limit: u32,
    ) -> Result<Vec<DeadLetter>, DeadLetterError> {
        let rows = sqlx::query(
            "SELECT id, consumer_group, event_id, event_kind, stream_id, attempt, reason, \
             payload, created_at \
             FROM dead_letters WHERE consumer_group = ?1 \
             ORDER BY created_at DESC, id DESC LIMIT ?2",
        )
        .bind(group.as_str())
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| {
                let attempt: i64 = row.try_get("attempt")?;
                let created_at: chrono::NaiveDateTime = row.try_get("created_at")?;
                Ok(DeadLetter {
                    id: row.try_get("id")?,
                    consumer_group: row.try_get("consumer_group")?,
                    event_id: row.try_get("event_id")?,
                    event_kind: row.try_get("event_kind")?,
                    stream_id: row.try_get("stream_id")?,
                    attempt: u32::try_from(attempt).unwrap_or(u32::MAX),
                    reason: row.try_get("reason")?,
                    payload: row.try_get("payload")?,
                    created_at: created_at.and_utc(),
                })
            })
            .collect::<Result<Vec<_>, sqlx::Error>>()
            .map_err(DeadLetterError::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{price_envelope, setup_test_db};

    fn group() -> ConsumerGroup {
        ConsumerGroup::new("risk-engine")
    }

    #[tokio::test]
    async fn parked_envelope_keeps_diagnostic_context() {
        let store = DeadLetterStore::new(setup_test_db().await);
        let envelope = price_envelope(42);
        let payload = envelope.encode().unwrap();

        store
            .record(&group(), &envelope, &payload, 5, "delivery attempts exhausted")
            .await
            .unwrap();

        assert_eq!(store.count(&group()).await.unwrap(), 1);

        let parked = store.recent(&group(), 10).await.unwrap();
        assert_eq!(parked.len(), 1);
        assert_eq!(parked[0].event_id.as_deref(), Some("price-42"));
        assert_eq!(parked[0].event_kind.as_deref(), Some("price_updated"));
        assert_eq!(parked[0].attempt, 5);
        assert_eq!(parked[0].reason, "delivery attempts exhausted");
        assert_eq!(parked[0].payload, payload);
    }

    #[tokio::test]
    async fn undecodable_messages_are_parked_with_raw_payload() {
        let store = DeadLetterStore::new(setup_test_db().await);

        store
            .record_undecodable(&group(), b"\xff\xfenot json", 1, "malformed envelope")
            .await
            .unwrap();

        let parked = store.recent(&group(), 10).await.unwrap();
        assert_eq!(parked[0].event_id, None);
        assert_eq!(parked[0].payload, b"\xff\xfenot json");
    }

    #[tokio::test]
    async fn counts_are_per_consumer_group() {
        let store = DeadLetterStore::new(setup_test_db().await);

        store
            .record_undecodable(&group(), b"x", 1, "malformed envelope")
            .await
            .unwrap();

        assert_eq!(store.count(&group()).await.unwrap(), 1);
        assert_eq!(
            store
                .count(&ConsumerGroup::new("settlement-ledger"))
                .await
                .unwrap(),
            0
        );
    }
}
