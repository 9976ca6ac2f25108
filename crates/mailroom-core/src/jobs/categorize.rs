use std::sync::Arc;

use serde::Deserialize;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::analysis::{AnalyzerFactory, CategorizationOptions, Orchestrator, OrchestratorError};
use crate::emails::EmailRepository;
use crate::jobs::store::{JobRecord, JobUpdate};
use crate::jobs::worker::JobError;
use crate::resources::Resources;
use crate::sessions::UserContext;

#[derive(Debug, Deserialize)]
struct CategorizeParams {
    #[serde(default)]
    force_refresh: bool,
    #[serde(default)]
    year: Option<i64>,
    #[allow(dead_code)]
    user_context: UserContext,
}

/// Categorization job body: resolve the job's user database, build the
/// analyzers from the current config, and run the orchestrator over the
/// candidate batch. The job's own `user_id` is authoritative; the context
/// in the params is audit trail.
pub async fn run(
    resources: &Arc<Resources>,
    job: &JobRecord,
    cancel: CancellationToken,
) -> Result<Value, JobError> {
    let params: CategorizeParams = serde_json::from_value(job.request_params.clone())
        .map_err(|err| JobError::InvalidParams(err.to_string()))?;

    let db = resources
        .factory
        .database_for(&job.user_id)
        .await
        .map_err(|err| JobError::Execution(err.to_string()))?;
    let analyzers = AnalyzerFactory::build(&resources.config.categorization, resources.cache.clone())
        .map_err(|err| JobError::InvalidParams(err.to_string()))?;
    let orchestrator = Orchestrator::new(
        EmailRepository::new(db),
        analyzers,
        &resources.config.categorization,
        resources.cache.clone(),
    );

    // Candidates are loaded; the visible progress jump tells pollers the
    // job got past setup.
    let _ = resources
        .store
        .update(
            &job.job_id,
            &job.user_id,
            JobUpdate {
                progress: Some(10),
                ..Default::default()
            },
        )
        .await;

    let options = CategorizationOptions {
        force_refresh: params.force_refresh,
        year: params.year,
    };
    let outcome = orchestrator.run(&options, &cancel).await.map_err(|err| match err {
        OrchestratorError::Canceled => JobError::Execution("categorization canceled".to_string()),
        other => JobError::Execution(other.to_string()),
    })?;

    info!(
        job_id = %job.job_id,
        user_id = %job.user_id,
        processed = outcome.processed,
        "categorization job finished"
    );
    Ok(outcome.to_results_json())
}
