//! Ownership of the pipeline's long-lived tasks.
//!
//! The supervisor spawns the watcher and subscription runners, hands each a
//! shutdown receiver at construction, and on shutdown waits (bounded by a
//! grace period) for in-flight work to finish its handler + ack cycle. A
//! handler is never killed mid-side-effect inside the grace window; a task
//! that outlives the window is aborted, which leaves its messages unacked at
//! the broker so a replacement instance resumes them. The broker, not this
//! process, is the durable store: scaling to zero loses nothing as long as
//! we never falsely ack-then-die.

use std::future::Future;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::{JoinError, JoinHandle};
use tokio::time::{Instant, timeout};
use tracing::{error, info, warn};

use crate::error::PipelineError;
use crate::runner::SubscriptionRunner;
use crate::watcher::ChainWatcher;

/// How a supervised task ended.
pub type TaskOutcome = Result<Result<(), PipelineError>, JoinError>;

struct NamedTask {
    name: String,
    handle: JoinHandle<Result<(), PipelineError>>,
}

pub struct Supervisor {
    shutdown_tx: watch::Sender<bool>,
    grace: Duration,
    tasks: Vec<NamedTask>,
}

impl Supervisor {
    pub fn new(grace: Duration) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            shutdown_tx,
            grace,
            tasks: Vec::new(),
        }
    }

    /// Receiver handed to every task at construction time; tasks check it
    /// rather than discovering shutdown state ambiguously at call time.
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    pub fn spawn_runner(&mut self, name: impl Into<String>, runner: SubscriptionRunner) {
        self.spawn(name, runner.run());
    }

    pub fn spawn_watcher(&mut self, name: impl Into<String>, watcher: ChainWatcher) {
        self.spawn(name, watcher.run());
    }

    pub fn spawn(
        &mut self,
        name: impl Into<String>,
        task: impl Future<Output = Result<(), PipelineError>> + Send + 'static,
    ) {
        let name = name.into();
        info!(task = %name, "starting pipeline task");
        self.tasks.push(NamedTask {
            name,
            handle: tokio::spawn(task),
        });
    }

    /// Waits until any supervised task exits. Under normal operation tasks
    /// only exit on failure, so the caller treats this as a signal to shut
    /// the rest down.
    pub async fn wait_any(&mut self) -> (String, TaskOutcome) {
        if self.tasks.is_empty() {
            std::future::pending::<()>().await;
            unreachable!();
        }

        let (outcome, index, _) =
            futures_util::future::select_all(self.tasks.iter_mut().map(|task| &mut task.handle))
                .await;
        let task = self.tasks.swap_remove(index);
        (task.name, outcome)
    }

    /// Signals shutdown and drains every task within the shared grace
    /// budget. Tasks that do not finish in time are aborted; their unacked
    /// messages stay at the broker for redelivery.
    pub async fn shutdown(mut self) {
        info!("shutdown requested, draining in-flight work");
        let _ = self.shutdown_tx.send(true);

        let deadline = Instant::now() + self.grace;
        for NamedTask { name, mut handle } in self.tasks.drain(..) {
            let now = Instant::now();
            let remaining = if deadline > now {
                deadline - now
            } else {
                Duration::ZERO
            };

            match timeout(remaining, &mut handle).await {
                Ok(outcome) => log_task_outcome(&name, outcome),
                Err(_) => {
                    warn!(task = %name, "did not drain within grace period, aborting");
                    handle.abort();
                }
            }
        }

        info!("shutdown complete");
    }
}

fn log_task_outcome(name: &str, outcome: TaskOutcome) {
    match outcome {
        Ok(Ok(())) => info!(task = %name, "drained cleanly"),
        Ok(Err(error)) => error!(task = %name, "exited with error: {error}"),
        Err(join_error) if join_error.is_cancelled() => {
            info!(task = %name, "cancelled (expected during shutdown)");
        }
        Err(join_error) => error!(task = %name, "task panicked: {join_error}"),
    }
}
