//! Settlement ledger writer: maintains one row per escrow through its
//! deploy → approve → release/refund lifecycle.

use async_trait::async_trait;
use rust_decimal::Decimal;
use sqlx::{Sqlite, Transaction};
use std::str::FromStr;
use tracing::debug;

use crate::envelope::{Address, Envelope, Payload};
use crate::registry::{EventHandler, HandlerError, HandlerOutcome};

/// Escrow lifecycle states as persisted in `settlement_ledger.state`.
const STATE_DEPLOYED: &str = "deployed";
const STATE_APPROVED: &str = "approved";
const STATE_RELEASED: &str = "released";
const STATE_REFUNDED: &str = "refunded";

pub struct SettlementLedgerWriter;

#[async_trait]
impl EventHandler for SettlementLedgerWriter {
    async fn handle(
        &self,
        tx: &mut Transaction<'_, Sqlite>,
        envelope: &Envelope,
    ) -> Result<HandlerOutcome, HandlerError> {
        match &envelope.payload {
            Payload::EscrowDeployed {
                escrow,
                buyer,
                seller,
                asset,
                amount,
            } => record_deployment(tx, escrow, buyer, seller, asset, *amount).await,
            Payload::EscrowApproved { escrow, approver } => {
                record_approval(tx, escrow, approver).await
            }
            Payload::EscrowReleased {
                escrow,
                recipient,
                amount,
            } => record_settlement(tx, escrow, recipient, *amount, STATE_RELEASED).await,
            Payload::EscrowRefunded {
                escrow,
                recipient,
                amount,
            } => record_settlement(tx, escrow, recipient, *amount, STATE_REFUNDED).await,
            other => Err(HandlerError::Permanent(format!(
                "settlement ledger received non-escrow event {}",
                other.kind()
            ))),
        }
    }
}

async fn record_deployment(
    tx: &mut Transaction<'_, Sqlite>,
    escrow: &Address,
    buyer: &Address,
    seller: &Address,
    asset: &str,
    amount: Decimal,
) -> Result<HandlerOutcome, HandlerError> {
    // Upsert by natural key: a redelivered deployment is a no-op.
    let result = sqlx::query(
        "INSERT INTO settlement_ledger (escrow, buyer, seller, asset, amount, state) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6) \
         ON CONFLICT (escrow) DO NOTHING",
    )
    .bind(escrow.to_string())
    .bind(buyer.to_string())
    .bind(seller.to_string())
    .bind(asset)
    .bind(amount.to_string())
    .bind(STATE_DEPLOYED)
    .execute(&mut **tx)
    .await?;

    if result.rows_affected() == 0 {
        debug!(%escrow, "escrow already on ledger");
        return Ok(HandlerOutcome::done());
    }

    Ok(HandlerOutcome::summarized(format!(
        "escrow {escrow} deployed for {amount} {asset}"
    )))
}

async fn record_approval(
    tx: &mut Transaction<'_, Sqlite>,
    escrow: &Address,
    approver: &Address,
) -> Result<HandlerOutcome, HandlerError> {
    let Some(state) = ledger_state(tx, escrow).await? else {
        // Concurrent in-flight processing can run the approval before the
        // deployment commits; redelivery resolves it.
        return Err(HandlerError::Transient(anyhow::anyhow!(
            "escrow {escrow} not yet on ledger"
        )));
    };

    if state != STATE_DEPLOYED {
        debug!(%escrow, state, "approval after later state, ignoring");
        return Ok(HandlerOutcome::done());
    }

    sqlx::query(
        "UPDATE settlement_ledger \
         SET state = ?2, updated_at = CURRENT_TIMESTAMP WHERE escrow = ?1",
    )
    .bind(escrow.to_string())
    .bind(STATE_APPROVED)
    .execute(&mut **tx)
    .await?;

    Ok(HandlerOutcome::summarized(format!(
        "escrow {escrow} approved by {approver}"
    )))
}

async fn record_settlement(
    tx: &mut Transaction<'_, Sqlite>,
    escrow: &Address,
    recipient: &Address,
    amount: Decimal,
    final_state: &str,
) -> Result<HandlerOutcome, HandlerError> {
    let Some(state) = ledger_state(tx, escrow).await? else {
        return Err(HandlerError::Transient(anyhow::anyhow!(
            "escrow {escrow} not yet on ledger"
        )));
    };

    if state == STATE_RELEASED || state == STATE_REFUNDED {
        debug!(%escrow, state, "escrow already settled, ignoring");
        return Ok(HandlerOutcome::done());
    }

    let deployed: String =
        sqlx::query_scalar("SELECT amount FROM settlement_ledger WHERE escrow = ?1")
            .bind(escrow.to_string())
            .fetch_one(&mut **tx)
            .await?;
    let deployed = Decimal::from_str(&deployed).map_err(|error| {
        HandlerError::Permanent(format!("ledger amount for {escrow} unparseable: {error}"))
    })?;

    if amount > deployed {
        return Err(HandlerError::Permanent(format!(
            "settlement of {amount} exceeds escrowed {deployed}"
        )));
    }

    sqlx::query(
        "UPDATE settlement_ledger \
         SET state = ?2, settled_amount = ?3, settled_recipient = ?4, \
             updated_at = CURRENT_TIMESTAMP \
         WHERE escrow = ?1",
    )
    .bind(escrow.to_string())
    .bind(final_state)
    .bind(amount.to_string())
    .bind(recipient.to_string())
    .execute(&mut **tx)
    .await?;

    Ok(HandlerOutcome::summarized(format!(
        "escrow {escrow} {final_state}: {amount} to {recipient}"
    )))
}

async fn ledger_state(
    tx: &mut Transaction<'_, Sqlite>,
    escrow: &Address,
) -> Result<Option<String>, HandlerError> {
    Ok(
        sqlx::query_scalar("SELECT state FROM settlement_ledger WHERE escrow = ?1")
            .bind(escrow.to_string())
            .fetch_optional(&mut **tx)
            .await?,
    )
}
