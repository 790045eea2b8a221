//! Risk recalculation trigger: keeps the latest price mark per pair and
//! records margin alerts for the risk engine to act on.

use async_trait::async_trait;
use sqlx::{Sqlite, Transaction};
use tracing::debug;

use crate::envelope::{Envelope, Payload};
use crate::registry::{EventHandler, HandlerError, HandlerOutcome};

pub struct RiskRecalculator;

#[async_trait]
impl EventHandler for RiskRecalculator {
    async fn handle(
        &self,
        tx: &mut Transaction<'_, Sqlite>,
        envelope: &Envelope,
    ) -> Result<HandlerOutcome, HandlerError> {
        match &envelope.payload {
            Payload::PriceUpdated { pair, price } => {
                // Position-guarded upsert: a redelivered stale tick never
                // overwrites a newer mark.
                let result = sqlx::query(
                    "INSERT INTO risk_marks (pair, price, position_block, position_log) \
                     VALUES (?1, ?2, ?3, ?4) \
                     ON CONFLICT (pair) DO UPDATE SET \
                         price = excluded.price, \
                         position_block = excluded.position_block, \
                         position_log = excluded.position_log, \
                         updated_at = CURRENT_TIMESTAMP \
                     WHERE excluded.position_block > risk_marks.position_block \
                        OR (excluded.position_block = risk_marks.position_block \
                            AND excluded.position_log > risk_marks.position_log)",
                )
                .bind(pair)
                .bind(price.to_string())
                .bind(i64::try_from(envelope.position.block).map_err(|error| {
                    HandlerError::Permanent(format!("position out of range: {error}"))
                })?)
                .bind(i64::try_from(envelope.position.log_index).map_err(|error| {
                    HandlerError::Permanent(format!("position out of range: {error}"))
                })?)
                .execute(&mut **tx)
                .await?;

                if result.rows_affected() == 0 {
                    debug!(pair, position = %envelope.position, "stale price tick ignored");
                    return Ok(HandlerOutcome::done());
                }

                Ok(HandlerOutcome::summarized(format!("{pair} marked at {price}")))
            }
            Payload::MarginAlert {
                account,
                margin_ratio,
                threshold,
            } => {
                sqlx::query(
                    "INSERT OR IGNORE INTO risk_flags \
                     (account, event_id, margin_ratio, threshold) VALUES (?1, ?2, ?3, ?4)",
                )
                .bind(account.to_string())
                .bind(envelope.event_id.as_str())
                .bind(margin_ratio.to_string())
                .bind(threshold.to_string())
                .execute(&mut **tx)
                .await?;

                Ok(HandlerOutcome::summarized(format!(
                    "margin alert for {account}: ratio {margin_ratio} below {threshold}"
                )))
            }
            other => Err(HandlerError::Permanent(format!(
                "risk engine received non-market event {}",
                other.kind()
            ))),
        }
    }
}
