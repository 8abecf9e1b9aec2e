use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::cancellation::CancellationToken;
use crate::config::WorkerConfig;
use crate::progress::{ProgressEvent, ProgressReporter, ProgressSink, SinkClosed};
use crate::stage::{Stage, StageResult};

/// What a worker tells its controller.
///
/// Exactly one of `Completed`, `Failed` or `Cancelled` is sent, and it is
/// always the last event.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerEvent<T> {
    Progress(ProgressEvent),
    Status(String),
    Completed(T),
    Failed(String),
    Cancelled,
}

impl<T> WorkerEvent<T> {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            WorkerEvent::Completed(_) | WorkerEvent::Failed(_) | WorkerEvent::Cancelled
        )
    }
}

struct ChannelSink<T> {
    tx: UnboundedSender<WorkerEvent<T>>,
}

impl<T: Send> ProgressSink for ChannelSink<T> {
    fn progress(&self, event: ProgressEvent) -> Result<(), SinkClosed> {
        self.tx.send(WorkerEvent::Progress(event)).map_err(|_| SinkClosed)
    }

    fn status(&self, message: String) -> Result<(), SinkClosed> {
        self.tx.send(WorkerEvent::Status(message)).map_err(|_| SinkClosed)
    }
}

/// Bounded, non-destructive shutdown
#[derive(Debug, Clone, Copy)]
pub struct ShutdownPolicy {
    pub step: Duration,
    pub ceiling: Duration,
}

impl Default for ShutdownPolicy {
    fn default() -> Self {
        Self {
            step: Duration::from_secs(1),
            ceiling: Duration::from_secs(30),
        }
    }
}

impl From<&WorkerConfig> for ShutdownPolicy {
    fn from(config: &WorkerConfig) -> Self {
        Self {
            step: config.stop_step(),
            ceiling: config.stop_ceiling(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// The task reached a terminal state
    Stopped,
    /// The ceiling passed; the task was left to finish on its own
    StillRunning,
}

/// Handle to one stage running in the background
#[derive(Clone)]
pub struct StageWorker {
    operation: String,
    token: CancellationToken,
    finished: watch::Receiver<bool>,
}

impl StageWorker {
    /// Start `stage` on the runtime; events arrive on the returned receiver
    pub fn spawn<S: Stage>(
        stage: Arc<S>,
        input: S::Input,
        token: CancellationToken,
    ) -> (Self, UnboundedReceiver<WorkerEvent<S::Output>>) {
        let (tx, rx) = unbounded_channel();
        let (done_tx, done_rx) = watch::channel(false);
        let operation = stage.name().to_string();

        let progress = ProgressReporter::new(Arc::new(ChannelSink { tx: tx.clone() }), token.clone());
        let task_token = token.clone();
        let task_operation = operation.clone();

        tokio::spawn(async move {
            debug!("▶️  Worker {} started", task_operation);
            let outcome = AssertUnwindSafe(stage.run(input, &task_token, &progress))
                .catch_unwind()
                .await;

            let event = match outcome {
                Ok(StageResult::Cancelled) => WorkerEvent::Cancelled,
                // Anything produced after a stop request is discarded.
                Ok(_) if task_token.is_cancelled() => WorkerEvent::Cancelled,
                Ok(StageResult::Success(value)) => WorkerEvent::Completed(value),
                Ok(StageResult::Failure(message)) => WorkerEvent::Failed(message),
                Err(_) if task_token.is_cancelled() => WorkerEvent::Cancelled,
                Err(_) => {
                    error!("💥 Worker {} panicked", task_operation);
                    WorkerEvent::Failed(format!("{} stopped unexpectedly", task_operation))
                }
            };

            drop(progress);
            let _ = tx.send(event);
            let _ = done_tx.send(true);
            debug!("⏹️  Worker {} finished", task_operation);
        });

        (
            Self {
                operation,
                token,
                finished: done_rx,
            },
            rx,
        )
    }

    pub fn operation(&self) -> &str {
        &self.operation
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn is_running(&self) -> bool {
        !*self.finished.borrow()
    }

    /// Resolves once the task has sent its terminal event
    pub async fn wait(&self) {
        let mut finished = self.finished.clone();
        // A dropped sender also means the task is gone.
        let _ = finished.wait_for(|done| *done).await;
    }

    /// Cancel, then wait in `step` increments up to `ceiling`. Never aborts the task.
    pub async fn stop(&self, policy: &ShutdownPolicy) -> StopOutcome {
        self.token.cancel();
        if !self.is_running() {
            return StopOutcome::Stopped;
        }

        info!("🛑 Stopping {}...", self.operation);
        let mut waited = Duration::ZERO;
        while waited < policy.ceiling {
            if tokio::time::timeout(policy.step, self.wait()).await.is_ok() {
                info!("✅ {} stopped", self.operation);
                return StopOutcome::Stopped;
            }
            waited += policy.step;
            debug!("Still waiting for {} ({:.0}s)", self.operation, waited.as_secs_f64());
        }

        warn!(
            "⚠️  {} did not stop within {:.0}s; leaving it to finish in the background",
            self.operation,
            policy.ceiling.as_secs_f64()
        );
        StopOutcome::StillRunning
    }
}
