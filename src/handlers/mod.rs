//! Domain consumers registered on the pipeline.
//!
//! Each handler performs its side effect through the runner's transaction
//! and keeps its writes idempotent at the business level (upsert by natural
//! key) as defense-in-depth beyond the idempotency guard.

mod ledger;
mod notify;
mod risk;

pub use ledger::SettlementLedgerWriter;
pub use notify::{MockNotifier, NotificationDispatcher, Notifier, NotifyError, WebhookNotifier};
pub use risk::RiskRecalculator;
