//! Notification dispatcher: renders settlement and margin events into
//! operator notifications behind the [`Notifier`] capability.
//!
//! The outbox row commits in the runner's transaction; the external send
//! happens inside the same handler invocation, so a send failure rolls the
//! outbox back and the message is redelivered. Providers must therefore be
//! idempotent per `event_id` at the business level, which is exactly the
//! contract the outbox key encodes.

use async_trait::async_trait;
use reqwest::Url;
use serde::Serialize;
use sqlx::{Sqlite, Transaction};
use std::sync::{Arc, Mutex};
use tracing::debug;

use crate::envelope::{Envelope, Payload};
use crate::registry::{EventHandler, HandlerError, HandlerOutcome};

#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    #[error("notification channel unavailable: {0}")]
    Unavailable(String),
}

/// External notification provider (mail, SMS, chat webhook) behind a
/// capability interface.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, subject: &str, body: &str) -> Result<(), NotifyError>;
}

/// Posts notifications as JSON to a configured webhook.
pub struct WebhookNotifier {
    url: Url,
    client: reqwest::Client,
}

#[derive(Serialize)]
struct WebhookMessage<'a> {
    subject: &'a str,
    body: &'a str,
}

impl WebhookNotifier {
    pub fn new(url: Url) -> Self {
        Self {
            url,
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn send(&self, subject: &str, body: &str) -> Result<(), NotifyError> {
        let response = self
            .client
            .post(self.url.clone())
            .json(&WebhookMessage { subject, body })
            .send()
            .await
            .map_err(|error| NotifyError::Unavailable(error.to_string()))?;

        response
            .error_for_status()
            .map_err(|error| NotifyError::Unavailable(error.to_string()))?;
        Ok(())
    }
}

/// Records sends in memory; doubles as the dry-run notifier and the test
/// double.
#[derive(Default)]
pub struct MockNotifier {
    sent: Mutex<Vec<(String, String)>>,
    fail: Mutex<bool>,
}

impl MockNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> Vec<(String, String)> {
        self.sent.lock().unwrap().clone()
    }

    pub fn set_failing(&self, failing: bool) {
        *self.fail.lock().unwrap() = failing;
    }
}

#[async_trait]
impl Notifier for MockNotifier {
    async fn send(&self, subject: &str, body: &str) -> Result<(), NotifyError> {
        if *self.fail.lock().unwrap() {
            return Err(NotifyError::Unavailable("mock outage".to_string()));
        }
        self.sent
            .lock()
            .unwrap()
            .push((subject.to_string(), body.to_string()));
        Ok(())
    }
}

pub struct NotificationDispatcher {
    notifier: Arc<dyn Notifier>,
}

impl NotificationDispatcher {
    pub fn new(notifier: Arc<dyn Notifier>) -> Self {
        Self { notifier }
    }
}

#[async_trait]
impl EventHandler for NotificationDispatcher {
    async fn handle(
        &self,
        tx: &mut Transaction<'_, Sqlite>,
        envelope: &Envelope,
    ) -> Result<HandlerOutcome, HandlerError> {
        let Some((subject, body)) = render(envelope) else {
            debug!(kind = %envelope.kind(), "no notification configured for this kind");
            return Ok(HandlerOutcome::done());
        };

        let inserted = sqlx::query(
            "INSERT INTO notification_outbox (event_id, channel, body) \
             VALUES (?1, ?2, ?3) \
             ON CONFLICT (event_id) DO NOTHING",
        )
        .bind(envelope.event_id.as_str())
        .bind(&subject)
        .bind(&body)
        .execute(&mut **tx)
        .await?
        .rows_affected();

        if inserted == 0 {
            debug!(event_id = %envelope.event_id, "notification already dispatched");
            return Ok(HandlerOutcome::done());
        }

        self.notifier
            .send(&subject, &body)
            .await
            .map_err(|error| HandlerError::Transient(error.into()))?;

        Ok(HandlerOutcome::summarized(format!("notified: {subject}")))
    }
}

fn render(envelope: &Envelope) -> Option<(String, String)> {
    match &envelope.payload {
        Payload::EscrowReleased {
            escrow,
            recipient,
            amount,
        } => Some((
            "escrow released".to_string(),
            format!("escrow {escrow} released {amount} to {recipient}"),
        )),
        Payload::EscrowRefunded {
            escrow,
            recipient,
            amount,
        } => Some((
            "escrow refunded".to_string(),
            format!("escrow {escrow} refunded {amount} to {recipient}"),
        )),
        Payload::MarginAlert {
            account,
            margin_ratio,
            threshold,
        } => Some((
            "margin alert".to_string(),
            format!("account {account} margin ratio {margin_ratio} is below {threshold}"),
        )),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::{EventId, StreamId, StreamPosition};
    use crate::test_utils::{setup_test_db, test_address};
    use chrono::Utc;
    use rust_decimal_macros::dec;

    fn released() -> Envelope {
        Envelope::new(
            EventId::new("rel-1"),
            StreamId::new("escrow:base"),
            StreamPosition::new(10, 0),
            Utc::now(),
            Payload::EscrowReleased {
                escrow: test_address('e'),
                recipient: test_address('c'),
                amount: dec!(42),
            },
        )
    }

    #[tokio::test]
    async fn sends_and_records_the_outbox_row() {
        let pool = setup_test_db().await;
        let notifier = Arc::new(MockNotifier::new());
        let dispatcher = NotificationDispatcher::new(notifier.clone());

        let mut tx = pool.begin().await.unwrap();
        dispatcher.handle(&mut tx, &released()).await.unwrap();
        tx.commit().await.unwrap();

        let sent = notifier.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, "escrow released");

        let outbox: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM notification_outbox")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(outbox, 1);
    }

    #[tokio::test]
    async fn provider_outage_is_transient_and_rolls_back_the_outbox() {
        let pool = setup_test_db().await;
        let notifier = Arc::new(MockNotifier::new());
        notifier.set_failing(true);
        let dispatcher = NotificationDispatcher::new(notifier.clone());

        let mut tx = pool.begin().await.unwrap();
        let err = dispatcher.handle(&mut tx, &released()).await.unwrap_err();
        tx.rollback().await.unwrap();

        assert!(matches!(err, HandlerError::Transient(_)));

        let outbox: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM notification_outbox")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(outbox, 0);
    }

    #[tokio::test]
    async fn deploy_events_produce_no_notification() {
        let pool = setup_test_db().await;
        let notifier = Arc::new(MockNotifier::new());
        let dispatcher = NotificationDispatcher::new(notifier.clone());

        let deploy = Envelope::new(
            EventId::new("dep-1"),
            StreamId::new("escrow:base"),
            StreamPosition::new(9, 0),
            Utc::now(),
            Payload::EscrowDeployed {
                escrow: test_address('e'),
                buyer: test_address('b'),
                seller: test_address('c'),
                asset: "USDC".to_string(),
                amount: dec!(100),
            },
        );

        let mut tx = pool.begin().await.unwrap();
        dispatcher.handle(&mut tx, &deploy).await.unwrap();
        tx.commit().await.unwrap();

        assert!(notifier.sent().is_empty());
    }
}
