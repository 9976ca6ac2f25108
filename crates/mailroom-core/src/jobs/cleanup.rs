use std::sync::Arc;

use serde::Deserialize;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::cleanup::{
    ArchiveRecordRepository, CleanupEngine, CleanupError, PolicyRepository, report_json,
};
use crate::emails::EmailRepository;
use crate::jobs::store::JobRecord;
use crate::jobs::worker::JobError;
use crate::resources::Resources;
use crate::sessions::UserContext;

#[derive(Debug, Deserialize)]
struct CleanupParams {
    policy_id: String,
    #[serde(default)]
    max_emails: Option<u32>,
    #[serde(default)]
    force: bool,
    user_context: UserContext,
}

/// Cleanup job body: evaluate the policy against the job's user and carry
/// out its action. Scheduled submissions arrive with `force=false`, so
/// confirmation-gated policies refuse unattended runs.
pub async fn run(
    resources: &Arc<Resources>,
    job: &JobRecord,
    _cancel: CancellationToken,
) -> Result<Value, JobError> {
    let params: CleanupParams = serde_json::from_value(job.request_params.clone())
        .map_err(|err| JobError::InvalidParams(err.to_string()))?;

    let db = resources
        .factory
        .database_for(&job.user_id)
        .await
        .map_err(|err| JobError::Execution(err.to_string()))?;
    let engine = CleanupEngine::new(
        PolicyRepository::new(db.clone()),
        EmailRepository::new(db.clone()),
        ArchiveRecordRepository::new(db),
    )
    .with_vendor_batch_size(resources.config.gmail.batch_size.max(1) as usize);

    let policy = engine
        .policy(&params.policy_id)
        .await
        .map_err(|err| JobError::Execution(err.to_string()))?;
    CleanupEngine::check_trigger(&policy, false, params.force).map_err(|err| match err {
        CleanupError::ConfirmationRequired(_) | CleanupError::Disabled(_) => {
            JobError::InvalidParams(err.to_string())
        }
        other => JobError::Execution(other.to_string()),
    })?;

    let mail = resources.mail_for(&params.user_context.session_id).await;
    let report = engine
        .execute(&policy, params.max_emails, mail)
        .await
        .map_err(|err| JobError::Execution(err.to_string()))?;

    info!(
        job_id = %job.job_id,
        policy_id = %report.policy_id,
        affected = report.affected,
        "cleanup job finished"
    );
    Ok(report_json(&report))
}
