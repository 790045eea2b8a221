//! Producer side of the pipeline: turns a source feed into published
//! envelopes.
//!
//! The watcher resumes from its producer checkpoint (a namespace distinct
//! from any consumer group's), publishes each source event, and advances the
//! checkpoint only after the publish settles. An event whose publish retries
//! are exhausted is parked durably in `unpublished_events` and resent on the
//! next startup; it is never silently dropped. Identity and position come
//! from the source, so a resend carries the same `event_id` and downstream
//! dedup holds.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::broker::TopicName;
use crate::checkpoint::{CheckpointScope, CheckpointStore};
use crate::envelope::{Envelope, EventId, Payload, StreamId, StreamPosition};
use crate::error::PipelineError;
use crate::publisher::Publisher;

#[derive(Debug, thiserror::Error)]
pub enum FeedError {
    #[error("feed transport failure: {0}")]
    Transport(String),
    #[error("feed returned undecodable data: {0}")]
    Decode(String),
}

/// One domain event as observed at the source, before wrapping. The source
/// assigns identity and position so retries and resends stay deduplicable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceEvent {
    pub event_id: EventId,
    pub position: StreamPosition,
    pub produced_at: DateTime<Utc>,
    pub payload: Payload,
}

/// Capability interface over whatever produces domain events: a chain log
/// scanner, a calculation engine, or a replay file in dry-run mode.
#[async_trait]
pub trait SourceFeed: Send + Sync {
    /// Events strictly after `position` (or from the beginning when
    /// `None`), oldest first, at most `limit`.
    async fn events_after(
        &self,
        position: Option<StreamPosition>,
        limit: usize,
    ) -> Result<Vec<SourceEvent>, FeedError>;
}

#[derive(Debug, Clone)]
pub struct WatcherConfig {
    /// Producer checkpoint namespace, e.g. `chain-watcher`.
    pub name: String,
    pub topic: TopicName,
    pub stream: StreamId,
    pub poll_interval: Duration,
    pub batch_size: usize,
}

pub struct ChainWatcher {
    config: WatcherConfig,
    feed: Arc<dyn SourceFeed>,
    publisher: Publisher,
    checkpoints: CheckpointStore,
    scope: CheckpointScope,
    pool: SqlitePool,
    shutdown: watch::Receiver<bool>,
}

impl ChainWatcher {
    pub fn new(
        config: WatcherConfig,
        feed: Arc<dyn SourceFeed>,
        publisher: Publisher,
        pool: SqlitePool,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let scope = CheckpointScope::producer(&config.name);
        let checkpoints = CheckpointStore::new(pool.clone());
        Self {
            config,
            feed,
            publisher,
            checkpoints,
            scope,
            pool,
            shutdown,
        }
    }

    pub async fn run(mut self) -> Result<(), PipelineError> {
        info!(watcher = %self.config.name, stream = %self.config.stream, "chain watcher started");

        if let Err(error) = self.resend_unpublished().await {
            warn!(watcher = %self.config.name, "resend of parked events failed: {error}");
        }

        loop {
            if *self.shutdown.borrow() {
                break;
            }

            match self.poll_once().await {
                // Keep draining while the source has a backlog.
                Ok(published) if published >= self.config.batch_size => continue,
                Ok(_) => {}
                Err(error) => {
                    warn!(watcher = %self.config.name, "poll failed: {error}");
                }
            }

            let _ = timeout(self.config.poll_interval, self.shutdown.changed()).await;
        }

        info!(watcher = %self.config.name, "chain watcher stopped");
        Ok(())
    }

    /// One scan step: fetch events past the checkpoint and publish them in
    /// order. Returns how many events were handled (published or parked).
    pub(crate) async fn poll_once(&self) -> Result<usize, PipelineError> {
        let from = self.checkpoints.get(&self.scope, &self.config.stream).await?;

        let events = match self.feed.events_after(from, self.config.batch_size).await {
            Ok(events) => events,
            Err(error) => {
                warn!(watcher = %self.config.name, "source feed unavailable: {error}");
                return Ok(0);
            }
        };

        let mut handled = 0;
        for event in events {
            let envelope = Envelope::new(
                event.event_id,
                self.config.stream.clone(),
                event.position,
                event.produced_at,
                event.payload,
            );

            match self.publisher.publish(&self.config.topic, &envelope).await {
                Ok(receipt) => {
                    debug!(
                        event_id = %envelope.event_id,
                        position = %envelope.position,
                        broker_message_id = %receipt.broker_message_id,
                        "source event published"
                    );
                }
                Err(error) => {
                    // Park durably and move on; head-of-line blocking on a
                    // broker outage would stall the whole stream.
                    error!(
                        event_id = %envelope.event_id,
                        position = %envelope.position,
                        "publish failed after retries, parking event: {error}"
                    );
                    self.park_unpublished(&envelope).await?;
                }
            }

            self.checkpoints
                .advance(&self.scope, &self.config.stream, envelope.position)
                .await?;
            handled += 1;
        }

        Ok(handled)
    }

    async fn park_unpublished(&self, envelope: &Envelope) -> Result<(), PipelineError> {
        let payload = envelope.encode()?;
        sqlx::query(
            "INSERT OR IGNORE INTO unpublished_events (event_id, topic, payload) \
             VALUES (?1, ?2, ?3)",
        )
        .bind(envelope.event_id.as_str())
        .bind(self.config.topic.as_str())
        .bind(&payload)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Retries every parked event once at startup, clearing rows that make
    /// it out. Rows that still fail stay parked for the next attempt.
    pub(crate) async fn resend_unpublished(&self) -> Result<(), PipelineError> {
        let rows: Vec<(String, String, Vec<u8>)> = sqlx::query_as(
            "SELECT event_id, topic, payload FROM unpublished_events ORDER BY created_at, event_id",
        )
        .fetch_all(&self.pool)
        .await?;

        if rows.is_empty() {
            return Ok(());
        }
        info!(parked = rows.len(), "resending previously unpublished events");

        for (event_id, topic, payload) in rows {
            let envelope = match Envelope::decode(&payload) {
                Ok(envelope) => envelope,
                Err(error) => {
                    error!(%event_id, "parked event undecodable, leaving for operator: {error}");
                    continue;
                }
            };

            match self
                .publisher
                .publish(&TopicName::new(topic), &envelope)
                .await
            {
                Ok(_) => {
                    sqlx::query("DELETE FROM unpublished_events WHERE event_id = ?1")
                        .bind(&event_id)
                        .execute(&self.pool)
                        .await?;
                    info!(%event_id, "parked event resent");
                }
                Err(error) => {
                    warn!(%event_id, "parked event still unpublishable: {error}");
                }
            }
        }

        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ReplayFeedError {
    #[error("failed to read replay file: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid event on line {line}: {source}")]
    Parse {
        line: usize,
        #[source]
        source: serde_json::Error,
    },
}

/// Dry-run feed: replays a JSONL file of [`SourceEvent`]s in position
/// order. Stands in for a live chain connection in development and tests.
#[derive(Debug)]
pub struct ReplayFeed {
    events: Vec<SourceEvent>,
}

impl ReplayFeed {
    pub fn from_path(path: &Path) -> Result<Self, ReplayFeedError> {
        let contents = std::fs::read_to_string(path)?;
        let mut events = Vec::new();
        for (index, line) in contents.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let event: SourceEvent =
                serde_json::from_str(line).map_err(|source| ReplayFeedError::Parse {
                    line: index + 1,
                    source,
                })?;
            events.push(event);
        }
        Ok(Self::from_events(events))
    }

    pub fn from_events(mut events: Vec<SourceEvent>) -> Self {
        events.sort_by_key(|event| event.position);
        Self { events }
    }
}

#[async_trait]
impl SourceFeed for ReplayFeed {
    async fn events_after(
        &self,
        position: Option<StreamPosition>,
        limit: usize,
    ) -> Result<Vec<SourceEvent>, FeedError> {
        let events = self
            .events
            .iter()
            .filter(|event| position.is_none_or(|p| event.position > p))
            .take(limit)
            .cloned()
            .collect();
        Ok(events)
    }
}
