use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::jobs::store::{JOB_TYPE_CATEGORIZATION, JOB_TYPE_CLEANUP, JobRecord};
use crate::jobs::worker::{JobError, JobExecutor};
use crate::jobs::{categorize, cleanup};
use crate::resources::Resources;

/// Routes claimed jobs to their handlers by `job_type`.
#[derive(Clone)]
pub struct JobDispatcher {
    resources: Arc<Resources>,
}

impl JobDispatcher {
    pub fn new(resources: Arc<Resources>) -> Self {
        Self { resources }
    }
}

#[async_trait]
impl JobExecutor for JobDispatcher {
    async fn execute(&self, job: JobRecord, cancel: CancellationToken) -> Result<Value, JobError> {
        match job.job_type.as_str() {
            JOB_TYPE_CATEGORIZATION => categorize::run(&self.resources, &job, cancel).await,
            JOB_TYPE_CLEANUP => cleanup::run(&self.resources, &job, cancel).await,
            other => Err(JobError::InvalidParams(format!("unknown job type: {other}"))),
        }
    }
}
