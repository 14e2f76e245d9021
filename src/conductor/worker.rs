//! Worker loop: claim a job, run its handler, record the result.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use super::job::{Job, JobError, JobRegistry};
use super::queue::{FailureDisposition, JobQueue, QueueError};

const ERROR_BACKOFF: Duration = Duration::from_millis(500);

/// Result of one [`Worker::process_next`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Tick {
    Idle,
    Completed(i64),
    Retrying(i64),
    Failed(i64),
}

#[derive(Clone)]
pub(crate) struct Worker {
    queue: Arc<dyn JobQueue>,
    registry: Arc<JobRegistry>,
    idle_poll: Duration,
}

impl Worker {
    pub(crate) fn new(
        queue: Arc<dyn JobQueue>,
        registry: Arc<JobRegistry>,
        idle_poll: Duration,
    ) -> Self {
        Self {
            queue,
            registry,
            idle_poll,
        }
    }

    /// Spawns `count` workers sharing one queue and registry.
    pub(crate) fn spawn_pool(self, count: usize) -> Vec<JoinHandle<()>> {
        (0..count)
            .map(|index| {
                let worker = self.clone();
                tokio::spawn(async move { worker.run(index).await })
            })
            .collect()
    }

    async fn run(self, index: usize) {
        info!(worker = index, "Starting job worker");

        loop {
            match self.process_next().await {
                Ok(Tick::Idle) => sleep(self.idle_poll).await,
                Ok(tick) => debug!(worker = index, ?tick, "Processed job"),
                Err(error) => {
                    error!(worker = index, %error, "Queue error while processing job");
                    sleep(ERROR_BACKOFF).await;
                }
            }
        }
    }

    /// Claims and runs at most one job.
    pub(crate) async fn process_next(&self) -> Result<Tick, QueueError> {
        let Some(job) = self.queue.dequeue().await? else {
            return Ok(Tick::Idle);
        };

        self.run_job(job).await
    }

    #[tracing::instrument(
        skip_all,
        fields(job_id = job.id, kind = %job.payload.kind(), correlation_id = %job.correlation_id),
        level = tracing::Level::DEBUG
    )]
    async fn run_job(&self, job: Job) -> Result<Tick, QueueError> {
        let Some(handler) = self.registry.handler_for(&job) else {
            let error = JobError::unrecoverable(format!(
                "no handler registered for {}",
                job.payload.kind()
            ));
            warn!(%error, "Dropping job");
            self.queue.fail(&job, &error).await?;
            return Ok(Tick::Failed(job.id));
        };

        let queue = self.queue.as_ref();

        let result = match handler.process(&job, queue).await {
            Ok(outcome) => handler.on_complete(&job, outcome, queue).await,
            Err(error) => Err(error),
        };

        let error = match result {
            Ok(()) => {
                self.queue.complete(job.id).await?;
                return Ok(Tick::Completed(job.id));
            }
            Err(error) => error,
        };

        match self.queue.fail(&job, &error).await? {
            FailureDisposition::Retrying { delay } => {
                warn!(
                    attempts_made = job.attempts_made + 1,
                    max_attempts = job.max_attempts,
                    retry_in_ms = delay.as_millis(),
                    %error,
                    "Job attempt failed, retrying"
                );
                Ok(Tick::Retrying(job.id))
            }
            FailureDisposition::Terminal => {
                handler.on_failed(&job, &error).await;
                Ok(Tick::Failed(job.id))
            }
        }
    }
}
