//! Shared error type for long-lived pipeline tasks.
//!
//! Per-message failure handling (dead-lettering, redelivery, idempotency
//! short-circuits) lives in the runner; what surfaces here is only what
//! should take a task down or be reported to the supervisor.

use crate::broker::BrokerError;
use crate::checkpoint::CheckpointError;
use crate::dead_letter::DeadLetterError;
use crate::envelope::EnvelopeError;

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("broker error: {0}")]
    Broker(#[from] BrokerError),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),
    #[error("dead letter store error: {0}")]
    DeadLetter(#[from] DeadLetterError),
    #[error("envelope error: {0}")]
    Envelope(#[from] EnvelopeError),
}
