//! Worker runtime: a fixed pool of consumers over the job queue.
//!
//! Each worker holds one job at a time and runs the orchestrator pipeline
//! to completion; parallelism is bounded by the pool size and back-pressure
//! comes from the queue's delivery rate. A pipeline is never cancelled
//! mid-flight; shutdown stops workers between jobs.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::errors::DeployError;
use crate::orchestrator::Orchestrator;
use crate::queue::{CompletedJob, DeployJob, JobQueue, MAX_ATTEMPTS, backoff_delay};

/// How long one BRPOP waits before the loop re-checks for shutdown.
const POP_TIMEOUT: Duration = Duration::from_secs(5);

pub struct WorkerRuntime {
    queue: Arc<dyn JobQueue>,
    orchestrator: Arc<Orchestrator>,
    concurrency: usize,
}

impl WorkerRuntime {
    pub fn new(
        queue: Arc<dyn JobQueue>,
        orchestrator: Arc<Orchestrator>,
        concurrency: usize,
    ) -> Self {
        Self {
            queue,
            orchestrator,
            concurrency,
        }
    }

    /// Run the pool until `shutdown` flips. In-flight jobs finish first.
    pub async fn run(&self, shutdown: watch::Receiver<bool>) {
        info!(concurrency = self.concurrency, "worker runtime starting");

        let mut handles = Vec::with_capacity(self.concurrency);
        for worker_id in 0..self.concurrency {
            let queue = Arc::clone(&self.queue);
            let orchestrator = Arc::clone(&self.orchestrator);
            let shutdown = shutdown.clone();
            handles.push(tokio::spawn(worker_loop(
                worker_id,
                queue,
                orchestrator,
                shutdown,
            )));
        }

        for handle in handles {
            if let Err(e) = handle.await {
                error!(error = %e, "worker task panicked");
            }
        }
        info!("worker runtime stopped");
    }
}

async fn worker_loop(
    worker_id: usize,
    queue: Arc<dyn JobQueue>,
    orchestrator: Arc<Orchestrator>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let job = tokio::select! {
            _ = shutdown.changed() => break,
            popped = queue.pop(POP_TIMEOUT) => match popped {
                Ok(Some(job)) => job,
                Ok(None) => continue,
                Err(e) => {
                    warn!(worker_id, error = %e, "queue receive failed, backing off");
                    tokio::time::sleep(Duration::from_secs(2)).await;
                    continue;
                }
            },
        };

        process_job(worker_id, &queue, &orchestrator, job).await;
    }
    info!(worker_id, "worker stopped");
}

async fn process_job(
    worker_id: usize,
    queue: &Arc<dyn JobQueue>,
    orchestrator: &Arc<Orchestrator>,
    job: DeployJob,
) {
    info!(
        worker_id,
        deployment_id = job.deployment_id,
        attempt = job.attempt,
        "job picked up"
    );

    let result = orchestrator.build_and_deploy(job.deployment_id).await;

    let outcome = match &result {
        Ok(()) => "completed".to_string(),
        Err(e) => format!("failed: {}", e),
    };
    let record = CompletedJob {
        deployment_id: job.deployment_id,
        project_id: job.project_id,
        attempt: job.attempt,
        outcome,
        finished_at: chrono::Utc::now().to_rfc3339(),
    };
    if let Err(e) = queue.record_completed(&record).await {
        warn!(worker_id, error = %e, "failed to record job completion");
    }

    match result {
        Ok(()) => {
            info!(worker_id, deployment_id = job.deployment_id, "job completed");
        }
        Err(err) if should_retry(&err, job.attempt) => {
            let delay = backoff_delay(job.attempt);
            warn!(
                worker_id,
                deployment_id = job.deployment_id,
                attempt = job.attempt,
                delay_secs = delay.as_secs(),
                error = %err,
                "job failed, scheduling retry"
            );
            let retry = job.next_attempt();
            let queue = Arc::clone(queue);
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                if let Err(e) = queue.submit(&retry).await {
                    error!(
                        deployment_id = retry.deployment_id,
                        error = %e,
                        "failed to re-submit job for retry"
                    );
                }
            });
        }
        Err(err) => {
            error!(
                worker_id,
                deployment_id = job.deployment_id,
                attempt = job.attempt,
                error = %err,
                "job failed permanently"
            );
        }
    }
}

fn should_retry(err: &DeployError, attempt: u32) -> bool {
    err.is_retryable() && attempt < MAX_ATTEMPTS
}
