use clap::Parser;
use reqwest::Url;
use sqlx::SqlitePool;
use std::path::PathBuf;
use std::time::Duration;
use tracing::Level;

use crate::broker::{SubscriptionName, TopicName};
use crate::publisher::RetryPolicy;
use crate::runner::RunnerLimits;
use crate::telemetry::OtlpConfig;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("--notify-webhook-url is required when --notifier is webhook")]
    MissingWebhookUrl,
    #[error("--replay-path is required when --feed is replay")]
    MissingReplayPath,
    #[error(
        "handler deadline ({deadline_seconds}s) must not exceed the lease duration ({lease_seconds}s)"
    )]
    DeadlineExceedsLease {
        deadline_seconds: u64,
        lease_seconds: u64,
    },
}

#[derive(clap::ValueEnum, Debug, Clone)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl From<&LogLevel> for Level {
    fn from(log_level: &LogLevel) -> Self {
        match log_level {
            LogLevel::Trace => Self::TRACE,
            LogLevel::Debug => Self::DEBUG,
            LogLevel::Info => Self::INFO,
            LogLevel::Warn => Self::WARN,
            LogLevel::Error => Self::ERROR,
        }
    }
}

/// Notification provider selection. Explicit so a missing webhook URL is a
/// startup failure, never a silent downgrade to the dry-run notifier.
#[derive(clap::ValueEnum, Debug, Clone)]
pub enum NotifierMode {
    Webhook,
    DryRun,
}

/// Source feed selection. `disabled` runs consumer-only.
#[derive(clap::ValueEnum, Debug, Clone)]
pub enum FeedMode {
    Replay,
    Disabled,
}

#[derive(Parser, Debug, Clone)]
pub struct Env {
    /// SQLite database URL backing checkpoints, dedup and consumer state
    #[clap(long = "db", env = "DATABASE_URL")]
    database_url: String,
    #[clap(long, env, default_value = "info")]
    log_level: LogLevel,
    /// Broker project/namespace identifier, prefixed onto every topic name
    #[clap(long, env)]
    broker_namespace: String,
    /// Topic carrying escrow lifecycle events
    #[clap(long, env, default_value = "escrow-events")]
    escrow_topic: String,
    /// Topic carrying price ticks and margin alerts
    #[clap(long, env, default_value = "market-events")]
    market_topic: String,
    /// Subscription (and consumer group) for the settlement ledger writer
    #[clap(long, env, default_value = "settlement-ledger")]
    settlement_subscription: String,
    /// Subscription (and consumer group) for the risk recalculation trigger
    #[clap(long, env, default_value = "risk-engine")]
    risk_subscription: String,
    /// Subscription (and consumer group) for the notification dispatcher
    #[clap(long, env, default_value = "notifications")]
    notifications_subscription: String,
    /// Broker ack deadline per delivery, in seconds
    #[clap(long, env, default_value = "30")]
    lease_seconds: u64,
    /// Per-invocation handler deadline, in seconds; must fit inside the lease
    #[clap(long, env, default_value = "25")]
    handler_deadline_seconds: u64,
    /// Messages processed concurrently per subscription runner
    #[clap(long, env, default_value = "8")]
    max_in_flight: usize,
    /// Delivery attempts before a message is dead-lettered
    #[clap(long, env, default_value = "5")]
    max_delivery_attempts: u32,
    /// Transient publish retries before an event is parked
    #[clap(long, env, default_value = "5")]
    publish_max_attempts: u32,
    /// Watcher poll interval in milliseconds
    #[clap(long, env, default_value = "250")]
    watcher_poll_interval_ms: u64,
    /// Source events fetched per watcher poll
    #[clap(long, env, default_value = "64")]
    watcher_batch_size: usize,
    /// Days idempotency records are kept; must exceed broker retention
    #[clap(long, env, default_value = "30")]
    idempotency_retention_days: i64,
    /// Grace period for draining in-flight work on shutdown, in seconds
    #[clap(long, env, default_value = "20")]
    shutdown_grace_seconds: u64,
    /// Notification provider (required: webhook or dry-run)
    #[clap(long, env)]
    notifier: NotifierMode,
    /// Webhook URL for --notifier webhook
    #[clap(long, env)]
    notify_webhook_url: Option<Url>,
    /// Source feed mode (required: replay or disabled)
    #[clap(long, env)]
    feed: FeedMode,
    /// JSONL file of source events for --feed replay
    #[clap(long, env)]
    replay_path: Option<PathBuf>,
    /// OTLP endpoint for trace export (optional)
    #[clap(long, env)]
    otlp_endpoint: Option<Url>,
    /// Authorization header value for the OTLP endpoint
    #[clap(long, env)]
    otlp_api_key: Option<String>,
    /// Service name attached to exported traces
    #[clap(long, env, default_value = "ledgerbus")]
    otlp_service_name: String,
}

#[derive(Debug, Clone)]
pub enum NotifierConfig {
    Webhook(Url),
    DryRun,
}

#[derive(Debug, Clone)]
pub enum FeedConfig {
    Replay(PathBuf),
    Disabled,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub(crate) database_url: String,
    pub log_level: LogLevel,
    pub(crate) broker_namespace: String,
    pub(crate) escrow_topic: String,
    pub(crate) market_topic: String,
    pub(crate) settlement_subscription: String,
    pub(crate) risk_subscription: String,
    pub(crate) notifications_subscription: String,
    pub(crate) lease: Duration,
    pub(crate) handler_deadline: Duration,
    pub(crate) max_in_flight: usize,
    pub(crate) max_delivery_attempts: u32,
    pub(crate) publish_max_attempts: u32,
    pub(crate) watcher_poll_interval: Duration,
    pub(crate) watcher_batch_size: usize,
    pub(crate) idempotency_retention_days: i64,
    pub(crate) shutdown_grace: Duration,
    pub(crate) notifier: NotifierConfig,
    pub(crate) feed: FeedConfig,
    pub otlp: Option<OtlpConfig>,
}

impl Env {
    pub fn into_config(self) -> Result<Config, ConfigError> {
        if self.handler_deadline_seconds > self.lease_seconds {
            return Err(ConfigError::DeadlineExceedsLease {
                deadline_seconds: self.handler_deadline_seconds,
                lease_seconds: self.lease_seconds,
            });
        }

        let notifier = match self.notifier {
            NotifierMode::Webhook => {
                let url = self
                    .notify_webhook_url
                    .ok_or(ConfigError::MissingWebhookUrl)?;
                NotifierConfig::Webhook(url)
            }
            NotifierMode::DryRun => NotifierConfig::DryRun,
        };

        let feed = match self.feed {
            FeedMode::Replay => {
                let path = self.replay_path.ok_or(ConfigError::MissingReplayPath)?;
                FeedConfig::Replay(path)
            }
            FeedMode::Disabled => FeedConfig::Disabled,
        };

        let otlp = self.otlp_endpoint.map(|endpoint| OtlpConfig {
            endpoint,
            api_key: self.otlp_api_key,
            service_name: self.otlp_service_name,
            log_level: (&self.log_level).into(),
        });

        Ok(Config {
            database_url: self.database_url,
            log_level: self.log_level,
            broker_namespace: self.broker_namespace,
            escrow_topic: self.escrow_topic,
            market_topic: self.market_topic,
            settlement_subscription: self.settlement_subscription,
            risk_subscription: self.risk_subscription,
            notifications_subscription: self.notifications_subscription,
            lease: Duration::from_secs(self.lease_seconds),
            handler_deadline: Duration::from_secs(self.handler_deadline_seconds),
            max_in_flight: self.max_in_flight,
            max_delivery_attempts: self.max_delivery_attempts,
            publish_max_attempts: self.publish_max_attempts,
            watcher_poll_interval: Duration::from_millis(self.watcher_poll_interval_ms),
            watcher_batch_size: self.watcher_batch_size,
            idempotency_retention_days: self.idempotency_retention_days,
            shutdown_grace: Duration::from_secs(self.shutdown_grace_seconds),
            notifier,
            feed,
            otlp,
        })
    }
}

pub(crate) async fn configure_sqlite_pool(database_url: &str) -> Result<SqlitePool, sqlx::Error> {
    let pool = SqlitePool::connect(database_url).await?;

    // WAL allows concurrent readers with a single writer across processes.
    sqlx::query("PRAGMA journal_mode = WAL").execute(&pool).await?;

    // Blocked writers wait up to 10s before failing with "database is
    // locked"; handler transactions must stay short.
    sqlx::query("PRAGMA busy_timeout = 10000")
        .execute(&pool)
        .await?;

    Ok(pool)
}

impl Config {
    pub async fn sqlite_pool(&self) -> Result<SqlitePool, sqlx::Error> {
        configure_sqlite_pool(&self.database_url).await
    }

    pub(crate) fn escrow_topic(&self) -> TopicName {
        self.namespaced_topic(&self.escrow_topic)
    }

    pub(crate) fn market_topic(&self) -> TopicName {
        self.namespaced_topic(&self.market_topic)
    }

    fn namespaced_topic(&self, topic: &str) -> TopicName {
        TopicName::new(format!("{}.{}", self.broker_namespace, topic))
    }

    pub(crate) fn settlement_subscription(&self) -> SubscriptionName {
        SubscriptionName::new(self.settlement_subscription.clone())
    }

    pub(crate) fn risk_subscription(&self) -> SubscriptionName {
        SubscriptionName::new(self.risk_subscription.clone())
    }

    pub(crate) fn notifications_subscription(&self) -> SubscriptionName {
        SubscriptionName::new(self.notifications_subscription.clone())
    }

    pub(crate) fn runner_limits(&self) -> RunnerLimits {
        RunnerLimits {
            max_in_flight: self.max_in_flight,
            max_delivery_attempts: self.max_delivery_attempts,
            handler_deadline: self.handler_deadline,
            lease_extension: self.lease,
            idle_backoff: Duration::from_millis(100),
        }
    }

    pub(crate) fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.publish_max_attempts,
            ..RetryPolicy::default()
        }
    }
}

pub fn setup_tracing(log_level: &LogLevel) {
    let level: Level = log_level.into();
    let default_filter = format!("ledgerbus={level}");

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .init();
}
