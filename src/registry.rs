//! Maps event kinds to domain handlers.
//!
//! Handlers receive the decoded envelope plus the runner's open transaction,
//! so their side effect commits atomically with the idempotency record and
//! the checkpoint advance. Dispatch to an unregistered kind is not an error:
//! forward-compatible producers may emit kinds this consumer does not yet
//! understand, and the runner acks those at its level.

use async_trait::async_trait;
use sqlx::{Sqlite, Transaction};
use std::collections::HashMap;
use std::sync::Arc;

use crate::envelope::{Envelope, EventKind};

#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    /// A downstream dependency failed in a way retrying can fix. The
    /// message is not acked and the broker redelivers it.
    #[error("transient handler failure: {0}")]
    Transient(#[source] anyhow::Error),
    /// The payload fails business validation; redelivery cannot help, so
    /// the runner dead-letters the message instead of blocking the stream.
    #[error("permanent handler failure: {0}")]
    Permanent(String),
    /// Database failures are transient: the store may be back on redelivery.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl HandlerError {
    pub fn is_permanent(&self) -> bool {
        matches!(self, Self::Permanent(_))
    }
}

/// Successful handler result, with an optional human-readable summary that
/// ends up on the idempotency record.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct HandlerOutcome {
    pub summary: Option<String>,
}

impl HandlerOutcome {
    pub fn done() -> Self {
        Self::default()
    }

    pub fn summarized(summary: impl Into<String>) -> Self {
        Self {
            summary: Some(summary.into()),
        }
    }
}

#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(
        &self,
        tx: &mut Transaction<'_, Sqlite>,
        envelope: &Envelope,
    ) -> Result<HandlerOutcome, HandlerError>;
}

#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<EventKind, Arc<dyn EventHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with(mut self, kind: EventKind, handler: Arc<dyn EventHandler>) -> Self {
        self.register(kind, handler);
        self
    }

    /// Registers `handler` for `kind`, replacing any previous registration.
    pub fn register(&mut self, kind: EventKind, handler: Arc<dyn EventHandler>) {
        self.handlers.insert(kind, handler);
    }

    pub fn get(&self, kind: EventKind) -> Option<Arc<dyn EventHandler>> {
        self.handlers.get(&kind).cloned()
    }

    /// Invokes the handler registered for the envelope's kind, or returns
    /// `None` if there is none.
    pub async fn dispatch(
        &self,
        tx: &mut Transaction<'_, Sqlite>,
        envelope: &Envelope,
    ) -> Option<Result<HandlerOutcome, HandlerError>> {
        let handler = self.get(envelope.kind())?;
        Some(handler.handle(tx, envelope).await)
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }
}
