//! Durable record of the highest fully processed position per
//! (scope, stream).
//!
//! Producers resuming a source scan and consumer groups tracking processed
//! position use logically separate namespaces; the scope prefix keeps them
//! from ever colliding on the same stream name. Advancement is max-wins:
//! repeated or out-of-order calls never regress the stored position, and
//! concurrent advances resolve to the maximum inside the database.

use sqlx::{Executor, Sqlite, SqlitePool, Transaction};
use std::fmt;
use std::num::TryFromIntError;

use crate::envelope::{StreamId, StreamPosition};
use crate::idempotency::ConsumerGroup;

#[derive(Debug, thiserror::Error)]
pub enum CheckpointError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("stored position out of range: {0}")]
    PositionOutOfRange(#[from] TryFromIntError),
}

/// Namespaced checkpoint owner: `producer:<name>` or `consumer:<group>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CheckpointScope(String);

impl CheckpointScope {
    pub fn producer(name: &str) -> Self {
        Self(format!("producer:{name}"))
    }

    pub fn consumer(group: &ConsumerGroup) -> Self {
        Self(format!("consumer:{group}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CheckpointScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

const ADVANCE_SQL: &str = r#"
INSERT INTO checkpoints (scope, stream_id, position_block, position_log, updated_at)
VALUES (?1, ?2, ?3, ?4, CURRENT_TIMESTAMP)
ON CONFLICT (scope, stream_id) DO UPDATE SET
    position_block = excluded.position_block,
    position_log = excluded.position_log,
    updated_at = CURRENT_TIMESTAMP
WHERE excluded.position_block > checkpoints.position_block
   OR (excluded.position_block = checkpoints.position_block
       AND excluded.position_log > checkpoints.position_log)
"#;

#[derive(Debug, Clone)]
pub struct CheckpointStore {
    pool: SqlitePool,
}

impl CheckpointStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn get(
        &self,
        scope: &CheckpointScope,
        stream: &StreamId,
    ) -> Result<Option<StreamPosition>, CheckpointError> {
        let row: Option<(i64, i64)> = sqlx::query_as(
            "SELECT position_block, position_log FROM checkpoints \
             WHERE scope = ?1 AND stream_id = ?2",
        )
        .bind(scope.as_str())
        .bind(stream.as_str())
        .fetch_optional(&self.pool)
        .await?;

        row.map(|(block, log_index)| {
            Ok(StreamPosition::new(
                u64::try_from(block)?,
                u64::try_from(log_index)?,
            ))
        })
        .transpose()
    }

    /// Advances the checkpoint if `position` is higher than the stored one.
    /// Returns whether the stored position moved.
    pub async fn advance(
        &self,
        scope: &CheckpointScope,
        stream: &StreamId,
        position: StreamPosition,
    ) -> Result<bool, CheckpointError> {
        advance_on(&self.pool, scope, stream, position).await
    }

    /// Same as [`advance`](Self::advance), inside the caller's transaction
    /// so the checkpoint commits atomically with the side effect it
    /// protects.
    pub async fn advance_in_tx(
        tx: &mut Transaction<'_, Sqlite>,
        scope: &CheckpointScope,
        stream: &StreamId,
        position: StreamPosition,
    ) -> Result<bool, CheckpointError> {
        advance_on(&mut **tx, scope, stream, position).await
    }
}

async fn advance_on<'e, E>(
    executor: E,
    scope: &CheckpointScope,
    stream: &StreamId,
    position: StreamPosition,
) -> Result<bool, CheckpointError>
where
    E: Executor<'e, Database = Sqlite>,
{
    let block = i64::try_from(position.block)?;
    let log_index = i64::try_from(position.log_index)?;

    let result = sqlx::query(ADVANCE_SQL)
        .bind(scope.as_str())
        .bind(stream.as_str())
        .bind(block)
        .bind(log_index)
        .execute(executor)
        .await?;

    Ok(result.rows_affected() > 0)
}
