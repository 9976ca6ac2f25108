use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use futures::FutureExt;
use serde_json::Value;
use thiserror::Error;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::jobs::queue::JobQueue;
use crate::jobs::store::{JobRecord, JobStatus, JobStatusStore, JobStoreError, JobUpdate};

#[derive(Clone, Copy)]
pub struct WorkerConfig {
    pub poll_interval: Duration,
    /// Maximum time to wait for in-flight jobs during graceful shutdown.
    pub drain_timeout: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(100),
            drain_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Error)]
pub enum JobError {
    #[error("{0}")]
    Execution(String),
    #[error("invalid job params: {0}")]
    InvalidParams(String),
}

impl JobError {
    pub fn message(&self) -> String {
        self.to_string()
    }
}

/// Executes one claimed job and returns its results payload. Implementors
/// route on `job.job_type`.
#[async_trait]
pub trait JobExecutor: Send + Sync {
    async fn execute(&self, job: JobRecord, cancel: CancellationToken) -> Result<Value, JobError>;
}

/// Drains the queue: dequeue, claim (compare-and-set at the store), run the
/// executor, then persist COMPLETED or FAILED. Several workers may run this
/// loop concurrently; the claim guarantees a job lands on exactly one of
/// them. Stale queue entries (already claimed, or deleted) are dropped.
pub async fn run_worker<E: JobExecutor>(
    queue: Arc<JobQueue>,
    store: Arc<JobStatusStore>,
    executor: Arc<E>,
    config: WorkerConfig,
    shutdown: CancellationToken,
) {
    let in_flight = Arc::new(AtomicUsize::new(0));
    let hard_shutdown = CancellationToken::new();

    let drain_handle = {
        let shutdown = shutdown.clone();
        let hard_shutdown = hard_shutdown.clone();
        let drain_timeout = config.drain_timeout;
        tokio::spawn(async move {
            shutdown.cancelled().await;
            info!("graceful shutdown initiated, waiting for in-flight jobs");
            tokio::time::sleep(drain_timeout).await;
            warn!("drain timeout exceeded, initiating hard shutdown");
            hard_shutdown.cancel();
        })
    };

    loop {
        if shutdown.is_cancelled() {
            if in_flight.load(Ordering::SeqCst) == 0 {
                break;
            }
            tokio::select! {
                _ = hard_shutdown.cancelled() => break,
                _ = tokio::time::sleep(Duration::from_millis(50)) => continue,
            }
        }

        match queue.dequeue() {
            Some((job_id, user_id)) => {
                in_flight.fetch_add(1, Ordering::SeqCst);
                handle_job(
                    store.clone(),
                    executor.clone(),
                    hard_shutdown.clone(),
                    &job_id,
                    &user_id,
                )
                .await;
                in_flight.fetch_sub(1, Ordering::SeqCst);
            }
            None => {
                tokio::select! {
                    _ = shutdown.cancelled() => {}
                    _ = sleep(config.poll_interval) => {}
                }
            }
        }
    }

    drain_handle.abort();
    info!("worker shutdown complete");
}

async fn handle_job<E: JobExecutor>(
    store: Arc<JobStatusStore>,
    executor: Arc<E>,
    hard_shutdown: CancellationToken,
    job_id: &str,
    user_id: &str,
) {
    let job = match store.claim(job_id, user_id).await {
        Ok(Some(job)) => job,
        Ok(None) => {
            // Not pending anymore: another worker claimed it, or it was
            // swept. Drop the stale queue entry.
            info!(job_id, "queued job no longer pending, dropping");
            return;
        }
        Err(err) => {
            error!(job_id, error = %err, "failed to claim job");
            return;
        }
    };

    info!(job_id = %job.job_id, job_type = %job.job_type, user_id, "processing job");

    let result = AssertUnwindSafe(executor.execute(job.clone(), hard_shutdown.child_token()))
        .catch_unwind()
        .await;

    let update = match result {
        Ok(Ok(results)) => JobUpdate {
            status: Some(JobStatus::Completed),
            progress: Some(100),
            results: Some(results),
            completed_at: Some(Utc::now()),
            ..Default::default()
        },
        Ok(Err(job_err)) => {
            warn!(job_id = %job.job_id, error = %job_err, "job failed");
            JobUpdate {
                status: Some(JobStatus::Failed),
                error_details: Some(job_err.message()),
                completed_at: Some(Utc::now()),
                ..Default::default()
            }
        }
        Err(panic) => {
            let message = if let Some(msg) = panic.downcast_ref::<&str>() {
                msg.to_string()
            } else if let Some(msg) = panic.downcast_ref::<String>() {
                msg.clone()
            } else {
                "job panicked".to_string()
            };
            warn!(job_id = %job.job_id, "job panicked: {message}");
            JobUpdate {
                status: Some(JobStatus::Failed),
                error_details: Some(format!("panic: {message}")),
                completed_at: Some(Utc::now()),
                ..Default::default()
            }
        }
    };

    match store.update(&job.job_id, user_id, update).await {
        Ok(_) => {}
        Err(JobStoreError::Terminal { .. }) => {
            info!(job_id = %job.job_id, "job already finalized elsewhere");
        }
        Err(err) => {
            error!(job_id = %job.job_id, error = %err, "failed to persist job outcome");
        }
    }
}
