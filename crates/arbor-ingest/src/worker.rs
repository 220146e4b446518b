//! Queue worker: drains runnable pages with a fixed number of async loops.

use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use log::{debug, error, info};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::config::WorkerConfig;
use crate::pipeline::{PageOutcome, Pipeline};

pub struct QueueWorker {
    pipeline: Arc<Pipeline>,
    concurrency: usize,
    poll_interval: Duration,
}

impl QueueWorker {
    pub fn new(pipeline: Arc<Pipeline>, concurrency: usize, poll_interval: Duration) -> Self {
        Self {
            pipeline,
            concurrency: concurrency.max(1),
            poll_interval,
        }
    }

    pub fn from_config(pipeline: Arc<Pipeline>, config: &WorkerConfig) -> Self {
        Self::new(
            pipeline,
            config.concurrency,
            Duration::from_millis(config.poll_interval_ms.max(1)),
        )
    }

    /// Runs until `shutdown` turns true or its sender is dropped.
    pub async fn run(self, shutdown: watch::Receiver<bool>) {
        info!("Started {} queue workers", self.concurrency);
        let loops = (0..self.concurrency).map(|worker_id| {
            run_loop(
                worker_id,
                Arc::clone(&self.pipeline),
                self.poll_interval,
                shutdown.clone(),
            )
        });
        join_all(loops).await;
        info!("Queue workers stopped");
    }

    pub fn spawn(self, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }
}

async fn run_loop(
    worker_id: usize,
    pipeline: Arc<Pipeline>,
    poll_interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let wake = pipeline.coordinator().wake_signal();
    loop {
        if *shutdown.borrow() {
            break;
        }

        match pipeline.process_next().await {
            Ok(Some(report)) => {
                match &report.outcome {
                    PageOutcome::Failed { message } => debug!(
                        "Worker {} finished page {} of {} with error: {}",
                        worker_id, report.page_number, report.queue_id, message
                    ),
                    outcome => debug!(
                        "Worker {} finished page {} of {}: {:?}",
                        worker_id, report.page_number, report.queue_id, outcome
                    ),
                }
                continue;
            }
            Ok(None) => {}
            Err(e) => error!("Worker {} failed to process queue: {}", worker_id, e),
        }

        // Idle: wait for new work, the poll fallback, or shutdown.
        tokio::select! {
            _ = wake.notified() => {}
            _ = tokio::time::sleep(poll_interval) => {}
            changed = shutdown.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }
    }
    debug!("Worker {} exiting", worker_id);
}
