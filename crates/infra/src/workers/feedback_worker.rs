use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::jobs::{BatchOutcome, JobProcessor};

#[derive(Debug, Clone)]
pub struct FeedbackWorkerConfig {
    /// Name for logging
    pub name: String,
    pub poll_interval: Duration,
    pub batch_size: usize,
}

impl Default for FeedbackWorkerConfig {
    fn default() -> Self {
        Self {
            name: "feedback-worker".to_string(),
            poll_interval: Duration::from_secs(3),
            batch_size: 5,
        }
    }
}

/// Handle for the running worker (shutdown + trigger hook).
///
/// Dropping the handle stops the worker as well.
#[derive(Debug)]
pub struct WorkerHandle {
    shutdown: oneshot::Sender<()>,
    trigger: mpsc::Sender<()>,
    join: JoinHandle<()>,
}

impl WorkerHandle {
    /// Ask for a tick now instead of at the next interval.
    ///
    /// Triggers are coalesced: if one is already pending this is a no-op.
    pub fn trigger(&self) {
        let _ = self.trigger.try_send(());
    }

    /// Stop scheduling ticks. Does not wait for a tick in progress.
    pub fn shutdown(self) {
        let _ = self.shutdown.send(());
    }

    /// Stop scheduling ticks and wait for the loop to exit.
    pub async fn shutdown_and_wait(self) {
        let _ = self.shutdown.send(());
        let _ = self.join.await;
    }
}

/// Periodic driver for [`JobProcessor::process_once`].
///
/// The next tick is scheduled one poll interval after the previous one
/// finishes. Ticks never overlap: a tick requested while another is running
/// is skipped, not queued. Tick failures are logged and the loop carries on.
#[derive(Clone)]
pub struct FeedbackWorker {
    processor: Arc<JobProcessor>,
    config: FeedbackWorkerConfig,
    gate: Arc<Mutex<()>>,
}

impl FeedbackWorker {
    pub fn new(processor: Arc<JobProcessor>, config: FeedbackWorkerConfig) -> Self {
        Self {
            processor,
            config,
            gate: Arc::new(Mutex::new(())),
        }
    }

    /// Run one batch unless another tick holds the gate.
    ///
    /// Returns `None` when skipped or when the batch failed.
    pub async fn tick(&self) -> Option<BatchOutcome> {
        let Ok(_running) = self.gate.try_lock() else {
            debug!(worker = %self.config.name, "tick skipped; previous tick still running");
            return None;
        };

        match self.processor.process_once(self.config.batch_size).await {
            Ok(outcome) => Some(outcome),
            Err(err) => {
                error!(worker = %self.config.name, error = %err, "feedback worker tick failed");
                None
            }
        }
    }

    /// Spawn the worker on the current tokio runtime.
    pub fn spawn(self) -> WorkerHandle {
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let (trigger_tx, trigger_rx) = mpsc::channel(1);

        let join = tokio::spawn(self.run(shutdown_rx, trigger_rx));

        WorkerHandle {
            shutdown: shutdown_tx,
            trigger: trigger_tx,
            join,
        }
    }

    async fn run(self, mut shutdown: oneshot::Receiver<()>, mut trigger: mpsc::Receiver<()>) {
        let period = self.config.poll_interval.max(Duration::from_millis(1));

        info!(
            worker = %self.config.name,
            poll_interval_ms = period.as_millis() as u64,
            batch_size = self.config.batch_size,
            "feedback worker started"
        );

        loop {
            tokio::select! {
                biased;
                _ = &mut shutdown => break,
                Some(()) = trigger.recv() => {}
                _ = tokio::time::sleep(period) => {}
            }
            self.tick().await;

            // Requests that arrived mid-tick are dropped.
            while trigger.try_recv().is_ok() {}
        }

        info!(worker = %self.config.name, "feedback worker stopped");
    }
}
