use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::{Arc, Mutex as StdMutex, OnceLock};

use chrono::{DateTime, SecondsFormat, Utc};
use libsql::{Row, Value as SqlValue, params};
use rand::Rng;
use serde_json::Value;
use thiserror::Error;
use tracing::{info, warn};

use crate::db::DbError;
use crate::factory::{FactoryError, UserDbFactory};
use crate::jobs::queue::JobQueue;

const JOB_COLUMNS: &str = "job_id, user_id, job_type, status, request_params_json, progress, results_json, error_details, created_at, started_at, completed_at";

pub const JOB_TYPE_CATEGORIZATION: &str = "categorization";
pub const JOB_TYPE_CLEANUP: &str = "cleanup";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::InProgress => "in_progress",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(JobStatus::Pending),
            "in_progress" => Some(JobStatus::InProgress),
            "completed" => Some(JobStatus::Completed),
            "failed" => Some(JobStatus::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    fn rank(&self) -> u8 {
        match self {
            JobStatus::Pending => 0,
            JobStatus::InProgress => 1,
            JobStatus::Completed | JobStatus::Failed => 2,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct JobRecord {
    pub job_id: String,
    pub user_id: String,
    pub job_type: String,
    pub status: JobStatus,
    pub request_params: Value,
    pub progress: i64,
    pub results: Option<Value>,
    pub error_details: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Field merge for [`JobStatusStore::update`]. Absent fields keep their
/// stored values.
#[derive(Debug, Clone, Default)]
pub struct JobUpdate {
    pub status: Option<JobStatus>,
    pub progress: Option<i64>,
    pub results: Option<Value>,
    pub error_details: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    pub job_type: Option<String>,
    pub status: Option<JobStatus>,
    pub limit: Option<u32>,
    pub offset: Option<u32>,
}

#[derive(Debug, Error)]
pub enum JobStoreError {
    #[error("database error: {0}")]
    Database(#[from] DbError),
    #[error("sql error: {0}")]
    Sql(#[from] libsql::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("factory error: {0}")]
    Factory(#[from] FactoryError),
    #[error("datetime parse error: {0}")]
    DateTimeParse(#[from] chrono::ParseError),
    #[error("invalid job status value {0}")]
    InvalidStatus(String),
    #[error("job not found: {0}")]
    NotFound(String),
    #[error("job {job_id} is terminal ({status}); updates rejected")]
    Terminal { job_id: String, status: String },
    #[error("status cannot move from {from} to {to}")]
    BackwardTransition { from: String, to: String },
    #[error("a job status store already owns storage root {0}")]
    DuplicateInstance(String),
}

static STORE_ROOTS: OnceLock<StdMutex<HashSet<PathBuf>>> = OnceLock::new();

fn store_roots() -> &'static StdMutex<HashSet<PathBuf>> {
    STORE_ROOTS.get_or_init(|| StdMutex::new(HashSet::new()))
}

/// Durable record of every submitted job, stored in each user's own
/// database. The store itself is process-scoped: constructing a second one
/// over the same storage root is an integrity error, which replaces the
/// legacy singleton pattern with a runtime check.
pub struct JobStatusStore {
    factory: Arc<UserDbFactory>,
    root: PathBuf,
}

impl std::fmt::Debug for JobStatusStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobStatusStore").field("root", &self.root).finish()
    }
}

impl JobStatusStore {
    pub fn new(factory: Arc<UserDbFactory>) -> Result<Self, JobStoreError> {
        let root = factory.root().to_path_buf();
        let mut roots = store_roots().lock().expect("store registry lock");
        if !roots.insert(root.clone()) {
            return Err(JobStoreError::DuplicateInstance(
                root.to_string_lossy().to_string(),
            ));
        }
        Ok(Self { factory, root })
    }

    /// Insert a PENDING record and return its fresh id.
    pub async fn create(
        &self,
        job_type: &str,
        request_params: Value,
        user_id: &str,
    ) -> Result<String, JobStoreError> {
        let job_id = new_job_id();
        let now = now_rfc3339();
        let params_json = serde_json::to_string(&request_params)?;

        let db = self.factory.database_for(user_id).await?;
        let conn = db.connection().await?;
        conn.execute(
            "INSERT INTO jobs (job_id, user_id, job_type, status, request_params_json, progress, created_at)
             VALUES (?1, ?2, ?3, 'pending', ?4, 0, ?5)",
            params![job_id.as_str(), user_id, job_type, params_json, now],
        )
        .await?;

        Ok(job_id)
    }

    /// User-scoped read. Returns `None` both for missing jobs and for jobs
    /// owned by someone else; existence is never leaked.
    pub async fn get(
        &self,
        job_id: &str,
        user_id: &str,
    ) -> Result<Option<JobRecord>, JobStoreError> {
        let db = self.factory.database_for(user_id).await?;
        let conn = db.connection().await?;
        let mut rows = conn
            .query(
                &format!("SELECT {JOB_COLUMNS} FROM jobs WHERE job_id = ?1 AND user_id = ?2"),
                params![job_id, user_id],
            )
            .await?;

        match rows.next().await? {
            Some(row) => Ok(Some(row_to_job(row)?)),
            None => Ok(None),
        }
    }

    /// Atomic PENDING -> IN_PROGRESS transition. Returns the claimed record
    /// or `None` when the job was already claimed, finished, or missing.
    pub async fn claim(
        &self,
        job_id: &str,
        user_id: &str,
    ) -> Result<Option<JobRecord>, JobStoreError> {
        let now = now_rfc3339();
        let db = self.factory.database_for(user_id).await?;
        let conn = db.connection().await?;
        let mut rows = conn
            .query(
                &format!(
                    "UPDATE jobs SET status = 'in_progress', started_at = ?3
                     WHERE job_id = ?1 AND user_id = ?2 AND status = 'pending'
                     RETURNING {JOB_COLUMNS}"
                ),
                params![job_id, user_id, now],
            )
            .await?;

        match rows.next().await? {
            Some(row) => Ok(Some(row_to_job(row)?)),
            None => Ok(None),
        }
    }

    /// Merge fields into a job. Terminal rows are immutable; status moves
    /// one way; progress never decreases.
    pub async fn update(
        &self,
        job_id: &str,
        user_id: &str,
        update: JobUpdate,
    ) -> Result<JobRecord, JobStoreError> {
        let current = self
            .get(job_id, user_id)
            .await?
            .ok_or_else(|| JobStoreError::NotFound(job_id.to_string()))?;

        if current.status.is_terminal() {
            return Err(JobStoreError::Terminal {
                job_id: job_id.to_string(),
                status: current.status.as_str().to_string(),
            });
        }
        if let Some(next) = update.status {
            if next.rank() < current.status.rank() {
                return Err(JobStoreError::BackwardTransition {
                    from: current.status.as_str().to_string(),
                    to: next.as_str().to_string(),
                });
            }
        }

        let status = update.status.unwrap_or(current.status);
        let progress = update
            .progress
            .map(|p| p.clamp(0, 100))
            .unwrap_or(current.progress)
            .max(current.progress);
        let results_json = match &update.results {
            Some(value) => Some(serde_json::to_string(value)?),
            None => current
                .results
                .as_ref()
                .map(serde_json::to_string)
                .transpose()?,
        };
        let error_details = update.error_details.or(current.error_details);
        let started_at = update.started_at.or(current.started_at).map(to_rfc3339);
        let completed_at = update
            .completed_at
            .or(current.completed_at)
            .map(to_rfc3339);

        let db = self.factory.database_for(user_id).await?;
        let conn = db.connection().await?;
        let mut rows = conn
            .query(
                &format!(
                    "UPDATE jobs SET status = ?3, progress = ?4, results_json = ?5,
                        error_details = ?6, started_at = ?7, completed_at = ?8
                     WHERE job_id = ?1 AND user_id = ?2
                     RETURNING {JOB_COLUMNS}"
                ),
                params![
                    job_id,
                    user_id,
                    status.as_str(),
                    progress,
                    results_json,
                    error_details,
                    started_at,
                    completed_at
                ],
            )
            .await?;

        match rows.next().await? {
            Some(row) => row_to_job(row),
            None => Err(JobStoreError::NotFound(job_id.to_string())),
        }
    }

    pub async fn list(
        &self,
        user_id: &str,
        filter: &JobFilter,
    ) -> Result<Vec<JobRecord>, JobStoreError> {
        let mut clauses = vec!["user_id = ?1".to_string()];
        let mut args: Vec<SqlValue> = vec![user_id.into()];

        if let Some(job_type) = &filter.job_type {
            args.push(job_type.as_str().into());
            clauses.push(format!("job_type = ?{}", args.len()));
        }
        if let Some(status) = filter.status {
            args.push(status.as_str().into());
            clauses.push(format!("status = ?{}", args.len()));
        }

        let mut sql = format!(
            "SELECT {JOB_COLUMNS} FROM jobs WHERE {} ORDER BY created_at DESC, job_id DESC",
            clauses.join(" AND ")
        );
        if let Some(limit) = filter.limit {
            args.push((limit as i64).into());
            sql.push_str(&format!(" LIMIT ?{}", args.len()));
            if let Some(offset) = filter.offset {
                args.push((offset as i64).into());
                sql.push_str(&format!(" OFFSET ?{}", args.len()));
            }
        }

        let db = self.factory.database_for(user_id).await?;
        let conn = db.connection().await?;
        let mut rows = conn.query(&sql, args).await?;
        let mut jobs = Vec::new();
        while let Some(row) = rows.next().await? {
            jobs.push(row_to_job(row)?);
        }
        Ok(jobs)
    }

    /// Drop terminal jobs created before the cutoff; active rows stay.
    pub async fn delete_older_than(
        &self,
        user_id: &str,
        cutoff: DateTime<Utc>,
    ) -> Result<u64, JobStoreError> {
        let db = self.factory.database_for(user_id).await?;
        let conn = db.connection().await?;
        let deleted = conn
            .execute(
                "DELETE FROM jobs
                 WHERE user_id = ?1 AND created_at < ?2
                   AND status IN ('completed', 'failed')",
                params![user_id, to_rfc3339(cutoff)],
            )
            .await?;
        Ok(deleted)
    }

    /// Startup reconciliation for one user: IN_PROGRESS rows have no live
    /// worker after a restart and are reaped to FAILED; PENDING rows are
    /// re-enqueued since the in-memory queue did not survive.
    pub async fn recover_user(
        &self,
        user_id: &str,
        queue: &JobQueue,
    ) -> Result<RecoveryReport, JobStoreError> {
        let now = now_rfc3339();
        let db = self.factory.database_for(user_id).await?;
        let conn = db.connection().await?;

        let orphaned = conn
            .execute(
                "UPDATE jobs SET status = 'failed', error_details = 'orphaned on restart', completed_at = ?2
                 WHERE user_id = ?1 AND status = 'in_progress'",
                params![user_id, now],
            )
            .await?;
        if orphaned > 0 {
            warn!(user_id, orphaned, "reaped orphaned in-progress jobs");
        }

        let mut rows = conn
            .query(
                "SELECT job_id FROM jobs WHERE user_id = ?1 AND status = 'pending' ORDER BY created_at",
                params![user_id],
            )
            .await?;
        let mut requeued = 0usize;
        while let Some(row) = rows.next().await? {
            let job_id: String = row.get(0)?;
            queue.enqueue(job_id, user_id.to_string());
            requeued += 1;
        }
        if requeued > 0 {
            info!(user_id, requeued, "re-enqueued pending jobs");
        }

        Ok(RecoveryReport { orphaned, requeued })
    }
}

impl Drop for JobStatusStore {
    fn drop(&mut self) {
        if let Ok(mut roots) = store_roots().lock() {
            roots.remove(&self.root);
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecoveryReport {
    pub orphaned: u64,
    pub requeued: usize,
}

/// Monotonic-ish globally unique id: millisecond timestamp plus a short
/// random suffix.
fn new_job_id() -> String {
    let millis = Utc::now().timestamp_millis();
    let suffix: u32 = rand::thread_rng().gen_range(0..0xfff_fff);
    format!("job_{millis}_{suffix:06x}")
}

fn row_to_job(row: Row) -> Result<JobRecord, JobStoreError> {
    let status_str: String = row.get(3)?;
    let params_json: String = row.get(4)?;
    let results_json: Option<String> = row.get(6)?;
    let created_at: String = row.get(8)?;
    let started_at: Option<String> = row.get(9)?;
    let completed_at: Option<String> = row.get(10)?;

    let status = JobStatus::from_str(&status_str)
        .ok_or_else(|| JobStoreError::InvalidStatus(status_str))?;

    Ok(JobRecord {
        job_id: row.get(0)?,
        user_id: row.get(1)?,
        job_type: row.get(2)?,
        status,
        request_params: serde_json::from_str(&params_json)?,
        progress: row.get(5)?,
        results: results_json
            .map(|value| serde_json::from_str(&value))
            .transpose()?,
        error_details: row.get(7)?,
        created_at: parse_ts(&created_at)?,
        started_at: started_at.as_deref().map(parse_ts).transpose()?,
        completed_at: completed_at.as_deref().map(parse_ts).transpose()?,
    })
}

fn parse_ts(value: &str) -> Result<DateTime<Utc>, JobStoreError> {
    Ok(DateTime::parse_from_rfc3339(value)?.with_timezone(&Utc))
}

fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn to_rfc3339(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Millis, true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    async fn setup_store() -> (JobStatusStore, TempDir) {
        let dir = TempDir::new().expect("temp dir");
        let factory = Arc::new(UserDbFactory::new(dir.path()));
        let store = JobStatusStore::new(factory).expect("store");
        (store, dir)
    }

    #[tokio::test]
    async fn create_inserts_pending_job_with_formatted_id() {
        let (store, _dir) = setup_store().await;
        let job_id = store
            .create(JOB_TYPE_CATEGORIZATION, json!({"force_refresh": true}), "u1")
            .await
            .expect("create");

        assert!(job_id.starts_with("job_"), "id format: {job_id}");
        let job = store.get(&job_id, "u1").await.expect("get").expect("job");
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.progress, 0);
        assert_eq!(job.request_params["force_refresh"], true);
        assert!(job.started_at.is_none());
    }

    #[tokio::test]
    async fn get_does_not_leak_other_users_jobs() {
        let (store, _dir) = setup_store().await;
        let job_id = store
            .create(JOB_TYPE_CATEGORIZATION, json!({}), "u1")
            .await
            .expect("create");

        let foreign = store.get(&job_id, "u2").await.expect("get");
        assert!(foreign.is_none(), "existence must not leak across users");
    }

    #[tokio::test]
    async fn claim_transitions_pending_to_in_progress_once() {
        let (store, _dir) = setup_store().await;
        let job_id = store
            .create(JOB_TYPE_CATEGORIZATION, json!({}), "u1")
            .await
            .expect("create");

        let claimed = store.claim(&job_id, "u1").await.expect("claim");
        let job = claimed.expect("first claim succeeds");
        assert_eq!(job.status, JobStatus::InProgress);
        assert!(job.started_at.is_some());

        let second = store.claim(&job_id, "u1").await.expect("claim again");
        assert!(second.is_none(), "claim is compare-and-set on pending");
    }

    #[tokio::test]
    async fn update_completes_job_and_then_freezes_it() {
        let (store, _dir) = setup_store().await;
        let job_id = store
            .create(JOB_TYPE_CATEGORIZATION, json!({}), "u1")
            .await
            .expect("create");
        store.claim(&job_id, "u1").await.expect("claim");

        let done = store
            .update(
                &job_id,
                "u1",
                JobUpdate {
                    status: Some(JobStatus::Completed),
                    progress: Some(100),
                    results: Some(json!({"processed": 3})),
                    completed_at: Some(Utc::now()),
                    ..Default::default()
                },
            )
            .await
            .expect("update");
        assert_eq!(done.status, JobStatus::Completed);
        assert_eq!(done.progress, 100);
        assert_eq!(done.results.expect("results")["processed"], 3);
        assert!(done.started_at.unwrap() <= done.completed_at.unwrap());

        let err = store
            .update(
                &job_id,
                "u1",
                JobUpdate {
                    progress: Some(10),
                    ..Default::default()
                },
            )
            .await
            .expect_err("terminal jobs are immutable");
        assert!(matches!(err, JobStoreError::Terminal { .. }));
    }

    #[tokio::test]
    async fn progress_never_decreases() {
        let (store, _dir) = setup_store().await;
        let job_id = store
            .create(JOB_TYPE_CATEGORIZATION, json!({}), "u1")
            .await
            .expect("create");
        store.claim(&job_id, "u1").await.expect("claim");

        store
            .update(
                &job_id,
                "u1",
                JobUpdate {
                    progress: Some(60),
                    ..Default::default()
                },
            )
            .await
            .expect("update to 60");
        let job = store
            .update(
                &job_id,
                "u1",
                JobUpdate {
                    progress: Some(30),
                    ..Default::default()
                },
            )
            .await
            .expect("update with lower progress");
        assert_eq!(job.progress, 60, "progress is monotonic");
    }

    #[tokio::test]
    async fn status_cannot_move_backward() {
        let (store, _dir) = setup_store().await;
        let job_id = store
            .create(JOB_TYPE_CLEANUP, json!({}), "u1")
            .await
            .expect("create");
        store.claim(&job_id, "u1").await.expect("claim");

        let err = store
            .update(
                &job_id,
                "u1",
                JobUpdate {
                    status: Some(JobStatus::Pending),
                    ..Default::default()
                },
            )
            .await
            .expect_err("backward transition rejected");
        assert!(matches!(err, JobStoreError::BackwardTransition { .. }));
    }

    #[tokio::test]
    async fn list_filters_by_type_and_status() {
        let (store, _dir) = setup_store().await;
        let cat = store
            .create(JOB_TYPE_CATEGORIZATION, json!({}), "u1")
            .await
            .expect("create cat");
        store
            .create(JOB_TYPE_CLEANUP, json!({}), "u1")
            .await
            .expect("create cleanup");
        store.claim(&cat, "u1").await.expect("claim");

        let pending = store
            .list(
                "u1",
                &JobFilter {
                    status: Some(JobStatus::Pending),
                    ..Default::default()
                },
            )
            .await
            .expect("list");
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].job_type, JOB_TYPE_CLEANUP);

        let cats = store
            .list(
                "u1",
                &JobFilter {
                    job_type: Some(JOB_TYPE_CATEGORIZATION.to_string()),
                    ..Default::default()
                },
            )
            .await
            .expect("list");
        assert_eq!(cats.len(), 1);
        assert_eq!(cats[0].job_id, cat);
    }

    #[tokio::test]
    async fn delete_older_than_only_removes_terminal_jobs() {
        let (store, _dir) = setup_store().await;
        let done = store
            .create(JOB_TYPE_CATEGORIZATION, json!({}), "u1")
            .await
            .expect("create");
        store.claim(&done, "u1").await.expect("claim");
        store
            .update(
                &done,
                "u1",
                JobUpdate {
                    status: Some(JobStatus::Failed),
                    error_details: Some("boom".into()),
                    completed_at: Some(Utc::now()),
                    ..Default::default()
                },
            )
            .await
            .expect("fail job");
        let pending = store
            .create(JOB_TYPE_CATEGORIZATION, json!({}), "u1")
            .await
            .expect("create pending");

        let removed = store
            .delete_older_than("u1", Utc::now() + chrono::Duration::seconds(1))
            .await
            .expect("delete");
        assert_eq!(removed, 1);
        assert!(store.get(&done, "u1").await.expect("get").is_none());
        assert!(store.get(&pending, "u1").await.expect("get").is_some());
    }

    #[tokio::test]
    async fn recover_reaps_in_progress_and_requeues_pending() {
        let (store, _dir) = setup_store().await;
        let orphan = store
            .create(JOB_TYPE_CATEGORIZATION, json!({}), "u1")
            .await
            .expect("create orphan");
        store.claim(&orphan, "u1").await.expect("claim");
        let pending = store
            .create(JOB_TYPE_CLEANUP, json!({}), "u1")
            .await
            .expect("create pending");

        let queue = JobQueue::new();
        let report = store.recover_user("u1", &queue).await.expect("recover");
        assert_eq!(report.orphaned, 1);
        assert_eq!(report.requeued, 1);

        let reaped = store.get(&orphan, "u1").await.expect("get").expect("job");
        assert_eq!(reaped.status, JobStatus::Failed);
        assert_eq!(reaped.error_details.as_deref(), Some("orphaned on restart"));

        let (queued_id, queued_user) = queue.dequeue().expect("queued job");
        assert_eq!(queued_id, pending);
        assert_eq!(queued_user, "u1");
    }

    #[tokio::test]
    async fn second_store_over_same_root_is_rejected() {
        let dir = TempDir::new().expect("temp dir");
        let factory = Arc::new(UserDbFactory::new(dir.path()));
        let first = JobStatusStore::new(factory.clone()).expect("first store");

        let err = JobStatusStore::new(factory.clone()).expect_err("duplicate store");
        assert!(matches!(err, JobStoreError::DuplicateInstance(_)));

        drop(first);
        let _second = JobStatusStore::new(factory).expect("root freed after drop");
    }
}
