//! Durable job queue over a Redis-compatible backend.
//!
//! Jobs are JSON blobs on a list: `LPUSH` to submit, `BRPOP` to consume.
//! Delivery is at-least-once; the retry policy (3 attempts, exponential
//! backoff) lives with the consumer, which re-submits a failed job with an
//! incremented attempt counter after the delay. The most recent 100
//! completed jobs are retained on a second list for introspection.

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::errors::DeployError;

const PENDING_KEY: &str = "dropdeploy:jobs:pending";
const COMPLETED_KEY: &str = "dropdeploy:jobs:completed";

/// Completed-job records kept for introspection.
const COMPLETED_RETENTION: isize = 100;

/// Maximum delivery attempts per job, first try included.
pub const MAX_ATTEMPTS: u32 = 3;

fn default_attempt() -> u32 {
    1
}

/// One unit of work for the worker runtime.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeployJob {
    pub deployment_id: i64,
    pub project_id: i64,
    #[serde(default = "default_attempt")]
    pub attempt: u32,
}

impl DeployJob {
    pub fn new(deployment_id: i64, project_id: i64) -> Self {
        Self {
            deployment_id,
            project_id,
            attempt: 1,
        }
    }

    /// The same job, one attempt later.
    pub fn next_attempt(&self) -> Self {
        Self {
            deployment_id: self.deployment_id,
            project_id: self.project_id,
            attempt: self.attempt + 1,
        }
    }
}

/// Record of a finished job kept on the completed list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletedJob {
    pub deployment_id: i64,
    pub project_id: i64,
    pub attempt: u32,
    pub outcome: String,
    pub finished_at: String,
}

/// Delay before re-submitting a failed attempt: 2 s, 4 s, 8 s.
pub fn backoff_delay(attempt: u32) -> Duration {
    Duration::from_secs(2u64 << (attempt.saturating_sub(1)).min(8))
}

#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Enqueue a job durably.
    async fn submit(&self, job: &DeployJob) -> Result<(), DeployError>;

    /// Wait up to `timeout` for the next job. `None` on timeout.
    async fn pop(&self, timeout: Duration) -> Result<Option<DeployJob>, DeployError>;

    /// Append to the bounded completed-jobs list.
    async fn record_completed(&self, entry: &CompletedJob) -> Result<(), DeployError>;
}

pub struct RedisQueue {
    client: redis::Client,
    manager: tokio::sync::Mutex<Option<ConnectionManager>>,
}

impl RedisQueue {
    /// Parse the backend URL. No I/O happens here; the connection is
    /// established lazily so a down backend never blocks API startup, and
    /// deployments stay persisted as queued until it returns.
    pub fn new(url: &str) -> Result<Self, DeployError> {
        let client = redis::Client::open(url)
            .map_err(|e| DeployError::QueueUnavailable(format!("invalid queue URL: {}", e)))?;
        Ok(Self {
            client,
            manager: tokio::sync::Mutex::new(None),
        })
    }

    /// Force the connection now. The worker calls this at startup so a
    /// missing backend is a fatal error rather than a silent idle loop.
    pub async fn connect(&self) -> Result<(), DeployError> {
        self.manager().await.map(|_| ())
    }

    async fn manager(&self) -> Result<ConnectionManager, DeployError> {
        let mut guard = self.manager.lock().await;
        if let Some(manager) = guard.as_ref() {
            return Ok(manager.clone());
        }
        let manager = ConnectionManager::new(self.client.clone())
            .await
            .map_err(classify_redis_error)?;
        debug!("connected to queue backend");
        *guard = Some(manager.clone());
        Ok(manager)
    }
}

#[async_trait]
impl JobQueue for RedisQueue {
    async fn submit(&self, job: &DeployJob) -> Result<(), DeployError> {
        let payload = serde_json::to_string(job)
            .map_err(|e| DeployError::Internal(format!("failed to encode job: {}", e)))?;
        let mut conn = self.manager().await?;
        let _: i64 = redis::cmd("LPUSH")
            .arg(PENDING_KEY)
            .arg(payload)
            .query_async(&mut conn)
            .await
            .map_err(classify_redis_error)?;
        debug!(deployment_id = job.deployment_id, attempt = job.attempt, "job submitted");
        Ok(())
    }

    async fn pop(&self, timeout: Duration) -> Result<Option<DeployJob>, DeployError> {
        let mut conn = self.manager().await?;
        let result: Option<(String, String)> = redis::cmd("BRPOP")
            .arg(PENDING_KEY)
            .arg(timeout.as_secs_f64())
            .query_async(&mut conn)
            .await
            .map_err(classify_redis_error)?;
        match result {
            Some((_, payload)) => {
                let job = serde_json::from_str(&payload)
                    .map_err(|e| DeployError::Internal(format!("failed to decode job: {}", e)))?;
                Ok(Some(job))
            }
            None => Ok(None),
        }
    }

    async fn record_completed(&self, entry: &CompletedJob) -> Result<(), DeployError> {
        let payload = serde_json::to_string(entry)
            .map_err(|e| DeployError::Internal(format!("failed to encode record: {}", e)))?;
        let mut conn = self.manager().await?;
        let _: i64 = redis::cmd("LPUSH")
            .arg(COMPLETED_KEY)
            .arg(payload)
            .query_async(&mut conn)
            .await
            .map_err(classify_redis_error)?;
        let _: () = redis::cmd("LTRIM")
            .arg(COMPLETED_KEY)
            .arg(0)
            .arg(COMPLETED_RETENTION - 1)
            .query_async(&mut conn)
            .await
            .map_err(classify_redis_error)?;
        Ok(())
    }
}

/// Connectivity problems become `QueueUnavailable` (swallowed at submit
/// time per the degradation contract); anything else is surfaced as-is.
fn classify_redis_error(err: redis::RedisError) -> DeployError {
    if err.is_io_error() || err.is_connection_refusal() || err.is_connection_dropped() {
        DeployError::QueueUnavailable(err.to_string())
    } else {
        DeployError::Internal(format!("queue error: {}", err))
    }
}
