use std::sync::Arc;

use chrono::{SecondsFormat, Utc};
use serde_json::{Value, json};
use tracing::{info, warn};

use crate::cache;
use crate::cleanup::{
    ArchiveRecordRepository, CleanupEngine, CleanupSchedule, NewCleanupPolicy, PolicyPatch,
    PolicyRepository, ScheduleRepository, ScheduleType, report_json,
};
use crate::emails::{EmailCriteria, EmailRepository, PriorityCategory, SizeBuckets};
use crate::factory::UserDatabase;
use crate::gmail::with_backoff;
use crate::jobs::store::{JOB_TYPE_CATEGORIZATION, JOB_TYPE_CLEANUP, JobFilter, JobRecord, JobStatus};
use crate::labels::SystemLabel;
use crate::resources::Resources;
use crate::searches::SavedSearchRepository;
use crate::sessions::UserContext;
use crate::tools::catalog;
use crate::tools::error::ToolError;

/// Front door for every `tools/call`. Validates the caller's session,
/// extends it, resolves the user-bound database handle, and routes to the
/// handler. Only `authenticate` skips the session check.
pub struct ToolDispatcher {
    resources: Arc<Resources>,
}

impl ToolDispatcher {
    pub fn new(resources: Arc<Resources>) -> Self {
        Self { resources }
    }

    pub fn list_tools(&self) -> Value {
        catalog::definitions()
    }

    pub async fn dispatch(&self, tool_name: &str, args: Value) -> Result<Value, ToolError> {
        if tool_name == "authenticate" {
            return self.authenticate(&args).await;
        }
        if !catalog::is_known_tool(tool_name) {
            return Err(ToolError::MethodNotFound(tool_name.to_string()));
        }

        let ctx = extract_user_context(&args)?;
        self.resources
            .sessions
            .validate(&ctx.session_id, &ctx.user_id)
            .await?;
        let db = self.resources.factory.database_for(&ctx.user_id).await?;

        match tool_name {
            "list_emails" => self.list_emails(db, &ctx, &args).await,
            "search_emails" => self.search_emails(db, &args).await,
            "categorize_emails" => self.categorize_emails(&ctx, &args).await,
            "get_email_stats" => self.get_email_stats(db, &ctx, &args).await,
            "archive_emails" => self.archive_emails(db, &ctx, &args).await,
            "delete_emails" => self.delete_emails(db, &ctx, &args).await,
            "get_job_status" => self.get_job_status(&ctx, &args).await,
            "list_jobs" => self.list_jobs(&ctx, &args).await,
            "create_cleanup_policy" => self.create_cleanup_policy(db, &args).await,
            "update_cleanup_policy" => self.update_cleanup_policy(db, &args).await,
            "list_cleanup_policies" => self.list_cleanup_policies(db).await,
            "delete_cleanup_policy" => self.delete_cleanup_policy(db, &args).await,
            "trigger_cleanup" => self.trigger_cleanup(db, &ctx, &args).await,
            "create_cleanup_schedule" => self.create_cleanup_schedule(db, &args).await,
            "update_cleanup_schedule" => self.update_cleanup_schedule(db, &args).await,
            "list_cleanup_schedules" => self.list_cleanup_schedules(db).await,
            "get_cleanup_recommendations" => self.get_cleanup_recommendations(db).await,
            "save_search" => self.save_search(db, &args).await,
            "list_saved_searches" => self.list_saved_searches(db).await,
            other => Err(ToolError::MethodNotFound(other.to_string())),
        }
    }

    async fn authenticate(&self, args: &Value) -> Result<Value, ToolError> {
        let user_id = match args.get("user_id").and_then(Value::as_str) {
            Some(user_id) if !user_id.is_empty() => user_id.to_string(),
            _ if self.resources.config.sessions.multi_user => {
                return Err(ToolError::InvalidParams(
                    "user_id is required in multi-user mode".to_string(),
                ));
            }
            _ => "default".to_string(),
        };

        // Open the user's database eagerly so the first real call does not
        // pay migration latency.
        self.resources.factory.database_for(&user_id).await?;
        let session = self.resources.sessions.create(&user_id).await;
        info!(user_id, session_id = %session.session_id, "session opened");

        Ok(json!({
            "user_id": session.user_id,
            "session_id": session.session_id,
            "expires_at": session.expires_at.to_rfc3339_opts(SecondsFormat::Millis, true),
        }))
    }

    async fn list_emails(
        &self,
        db: UserDatabase,
        ctx: &UserContext,
        args: &Value,
    ) -> Result<Value, ToolError> {
        let mut criteria = parse_criteria(args)?;
        if criteria.limit.is_none() {
            criteria.limit = Some(50);
        }

        let options = serde_json::to_value(&criteria)
            .map_err(|err| ToolError::Internal(err.to_string()))?;
        let cache_key = cache::email_list_key(&ctx.user_id, &options);
        if let Some(cached) = self.resources.cache.get(&cache_key).await {
            return Ok(cached);
        }

        let repo = EmailRepository::new(db);
        let emails = repo.search(&criteria).await?;
        let total = repo.count(&EmailCriteria {
            limit: None,
            offset: None,
            ..criteria.clone()
        })
        .await?;

        let response = json!({
            "emails": emails,
            "count": emails.len(),
            "total": total,
            "limit": criteria.limit,
            "offset": criteria.offset.unwrap_or(0),
        });
        if let Err(err) = self
            .resources
            .cache
            .set(cache_key, response.clone(), &ctx.user_id, None)
            .await
        {
            warn!(error = %err, "email list cache write failed");
        }
        Ok(response)
    }

    async fn search_emails(&self, db: UserDatabase, args: &Value) -> Result<Value, ToolError> {
        let mut criteria = parse_criteria(args)?;
        if criteria.limit.is_none() {
            criteria.limit = Some(100);
        }

        let repo = EmailRepository::new(db);
        let emails = repo.search(&criteria).await?;
        Ok(json!({
            "emails": emails,
            "count": emails.len(),
        }))
    }

    async fn categorize_emails(
        &self,
        ctx: &UserContext,
        args: &Value,
    ) -> Result<Value, ToolError> {
        let force_refresh = args
            .get("force_refresh")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        let year = args.get("year").and_then(Value::as_i64);

        let params = json!({
            "force_refresh": force_refresh,
            "year": year,
            "user_context": ctx,
        });
        let job_id = self
            .resources
            .store
            .create(JOB_TYPE_CATEGORIZATION, params, &ctx.user_id)
            .await?;
        self.resources.queue.enqueue(job_id.clone(), ctx.user_id.clone());
        info!(user_id = %ctx.user_id, job_id, "categorization job submitted");

        Ok(json!({
            "job_id": job_id,
            "status": JobStatus::Pending.as_str(),
        }))
    }

    async fn get_email_stats(
        &self,
        db: UserDatabase,
        ctx: &UserContext,
        args: &Value,
    ) -> Result<Value, ToolError> {
        let group_by = args
            .get("group_by")
            .and_then(Value::as_str)
            .unwrap_or("all");
        if !matches!(group_by, "category" | "year" | "size" | "archived" | "all") {
            return Err(ToolError::InvalidParams(format!(
                "unknown group_by {group_by:?}"
            )));
        }
        let include_archived = args
            .get("include_archived")
            .and_then(Value::as_bool)
            .unwrap_or(false);

        let cache_key = (group_by == "category" && !include_archived)
            .then(|| cache::category_stats_key(&ctx.user_id));
        if let Some(key) = &cache_key {
            if let Some(cached) = self.resources.cache.get(key).await {
                return Ok(cached);
            }
        }

        let buckets = SizeBuckets {
            small_max: self.resources.config.categorization.small_max_bytes,
            medium_max: self.resources.config.categorization.medium_max_bytes,
        };
        let stats = EmailRepository::new(db)
            .stats(group_by, include_archived, buckets)
            .await?;

        if let Some(key) = cache_key {
            if let Err(err) = self
                .resources
                .cache
                .set(key, stats.clone(), &ctx.user_id, None)
                .await
            {
                warn!(error = %err, "stats cache write failed");
            }
        }
        Ok(stats)
    }

    async fn archive_emails(
        &self,
        db: UserDatabase,
        ctx: &UserContext,
        args: &Value,
    ) -> Result<Value, ToolError> {
        let criteria = parse_criteria(args)?;
        let method = args
            .get("method")
            .and_then(Value::as_str)
            .unwrap_or("gmail");
        if !matches!(method, "gmail" | "export") {
            return Err(ToolError::InvalidParams(format!(
                "unknown archive method {method:?}"
            )));
        }
        let dry_run = args.get("dry_run").and_then(Value::as_bool).unwrap_or(false);

        let repo = EmailRepository::new(db.clone());
        let matches = repo.search(&criteria).await?;
        let email_ids: Vec<String> = matches.iter().map(|email| email.id.clone()).collect();

        if dry_run {
            return Ok(json!({
                "dry_run": true,
                "would_archive": email_ids.len(),
                "email_ids": email_ids,
            }));
        }

        let location = (method == "export").then(|| {
            let format = args
                .get("export_format")
                .and_then(Value::as_str)
                .unwrap_or("mbox");
            format!("export/{}.{format}", Utc::now().format("%Y%m%d%H%M%S"))
        });

        let archived = repo
            .mark_archived(&email_ids, location.as_deref())
            .await?;

        if method == "gmail" && !email_ids.is_empty() {
            match self.resources.mail_for(&ctx.session_id).await {
                Some(api) => {
                    let remove = vec![SystemLabel::Inbox.as_str().to_string()];
                    let batch_size = self.resources.config.gmail.batch_size.max(1) as usize;
                    for chunk in email_ids.chunks(batch_size) {
                        if let Err(err) =
                            with_backoff(|| api.batch_modify(chunk, &[], &remove)).await
                        {
                            warn!(error = %err, "vendor archive sync failed");
                        }
                    }
                }
                None => warn!("no vendor client; archived in index only"),
            }
        }

        if archived > 0 {
            ArchiveRecordRepository::new(db)
                .record(method, location.as_deref(), archived as i64)
                .await?;
            self.invalidate_listings(&ctx.user_id).await;
        }

        Ok(json!({
            "archived": archived,
            "location": location,
        }))
    }

    async fn delete_emails(
        &self,
        db: UserDatabase,
        ctx: &UserContext,
        args: &Value,
    ) -> Result<Value, ToolError> {
        let confirm = args.get("confirm").and_then(Value::as_bool).unwrap_or(false);
        let dry_run = args.get("dry_run").and_then(Value::as_bool).unwrap_or(false);
        if !confirm && !dry_run {
            return Err(ToolError::InvalidParams(
                "delete_emails requires confirm=true or dry_run=true".to_string(),
            ));
        }

        let criteria = parse_criteria(args)?;
        let repo = EmailRepository::new(db);
        let matches = repo.search(&criteria).await?;
        let email_ids: Vec<String> = matches.iter().map(|email| email.id.clone()).collect();

        if dry_run {
            return Ok(json!({
                "dry_run": true,
                "would_delete": email_ids.len(),
                "email_ids": email_ids,
            }));
        }

        let deleted = repo.mark_deleted(&email_ids).await?;
        if let Some(api) = self.resources.mail_for(&ctx.session_id).await {
            for email_id in &email_ids {
                if let Err(err) = with_backoff(|| api.delete_message(email_id)).await {
                    warn!(email_id, error = %err, "vendor delete failed");
                }
            }
        }
        if deleted > 0 {
            self.invalidate_listings(&ctx.user_id).await;
        }

        info!(user_id = %ctx.user_id, deleted, "emails deleted");
        Ok(json!({"deleted": deleted}))
    }

    async fn get_job_status(&self, ctx: &UserContext, args: &Value) -> Result<Value, ToolError> {
        let job_id = args
            .get("id")
            .and_then(Value::as_str)
            .ok_or_else(|| ToolError::InvalidParams("id is required".to_string()))?;

        let job = self
            .resources
            .store
            .get(job_id, &ctx.user_id)
            .await?
            .ok_or_else(|| ToolError::NotFound(job_id.to_string()))?;
        Ok(job_to_json(&job))
    }

    async fn list_jobs(&self, ctx: &UserContext, args: &Value) -> Result<Value, ToolError> {
        let status = match args.get("status").and_then(Value::as_str) {
            Some(raw) => Some(JobStatus::from_str(raw).ok_or_else(|| {
                ToolError::InvalidParams(format!("unknown job status {raw:?}"))
            })?),
            None => None,
        };
        let filter = JobFilter {
            job_type: args
                .get("job_type")
                .and_then(Value::as_str)
                .map(|s| s.to_string()),
            status,
            limit: args.get("limit").and_then(Value::as_u64).map(|v| v as u32),
            offset: args.get("offset").and_then(Value::as_u64).map(|v| v as u32),
        };

        let jobs = self.resources.store.list(&ctx.user_id, &filter).await?;
        let jobs: Vec<Value> = jobs.iter().map(job_to_json).collect();
        Ok(json!({"jobs": jobs, "count": jobs.len()}))
    }

    async fn create_cleanup_policy(
        &self,
        db: UserDatabase,
        args: &Value,
    ) -> Result<Value, ToolError> {
        let spec = args
            .get("policy")
            .ok_or_else(|| ToolError::InvalidParams("policy object is required".to_string()))?;
        let new_policy: NewCleanupPolicy = serde_json::from_value(spec.clone())
            .map_err(|err| ToolError::InvalidParams(err.to_string()))?;

        let policy = PolicyRepository::new(db).create(new_policy).await?;
        Ok(json!({"policy": policy}))
    }

    async fn update_cleanup_policy(
        &self,
        db: UserDatabase,
        args: &Value,
    ) -> Result<Value, ToolError> {
        let policy_id = args
            .get("policy_id")
            .and_then(Value::as_str)
            .ok_or_else(|| ToolError::InvalidParams("policy_id is required".to_string()))?;
        let updates = args
            .get("updates")
            .ok_or_else(|| ToolError::InvalidParams("updates object is required".to_string()))?;
        let patch: PolicyPatch = serde_json::from_value(updates.clone())
            .map_err(|err| ToolError::InvalidParams(err.to_string()))?;

        let policy = PolicyRepository::new(db).update(policy_id, patch).await?;
        Ok(json!({"policy": policy}))
    }

    async fn list_cleanup_policies(&self, db: UserDatabase) -> Result<Value, ToolError> {
        let policies = PolicyRepository::new(db).list().await?;
        Ok(json!({"policies": policies, "count": policies.len()}))
    }

    async fn delete_cleanup_policy(
        &self,
        db: UserDatabase,
        args: &Value,
    ) -> Result<Value, ToolError> {
        let policy_id = args
            .get("policy_id")
            .and_then(Value::as_str)
            .ok_or_else(|| ToolError::InvalidParams("policy_id is required".to_string()))?;

        if !PolicyRepository::new(db).delete(policy_id).await? {
            return Err(ToolError::NotFound(policy_id.to_string()));
        }
        Ok(json!({"deleted": true}))
    }

    async fn trigger_cleanup(
        &self,
        db: UserDatabase,
        ctx: &UserContext,
        args: &Value,
    ) -> Result<Value, ToolError> {
        let policy_id = args
            .get("policy_id")
            .and_then(Value::as_str)
            .ok_or_else(|| ToolError::InvalidParams("policy_id is required".to_string()))?;
        let dry_run = args.get("dry_run").and_then(Value::as_bool).unwrap_or(false);
        let force = args.get("force").and_then(Value::as_bool).unwrap_or(false);
        let max_emails = args
            .get("max_emails")
            .and_then(Value::as_u64)
            .map(|v| v as u32);

        let engine = CleanupEngine::new(
            PolicyRepository::new(db.clone()),
            EmailRepository::new(db.clone()),
            ArchiveRecordRepository::new(db),
        );
        let policy = engine.policy(policy_id).await?;
        CleanupEngine::check_trigger(&policy, dry_run, force)?;

        if dry_run {
            let report = engine.preview(policy_id, max_emails).await?;
            return Ok(report_json(&report));
        }

        let params = json!({
            "policy_id": policy_id,
            "max_emails": max_emails,
            "force": force,
            "user_context": ctx,
        });
        let job_id = self
            .resources
            .store
            .create(JOB_TYPE_CLEANUP, params, &ctx.user_id)
            .await?;
        self.resources.queue.enqueue(job_id.clone(), ctx.user_id.clone());
        info!(user_id = %ctx.user_id, job_id, policy_id, "cleanup job submitted");

        Ok(json!({
            "job_id": job_id,
            "status": JobStatus::Pending.as_str(),
        }))
    }

    async fn create_cleanup_schedule(
        &self,
        db: UserDatabase,
        args: &Value,
    ) -> Result<Value, ToolError> {
        let raw_type = args
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| ToolError::InvalidParams("type is required".to_string()))?;
        let schedule_type = ScheduleType::from_str(raw_type)
            .ok_or_else(|| ToolError::InvalidParams(format!("unknown schedule type {raw_type:?}")))?;
        let expression = args
            .get("expression")
            .and_then(Value::as_str)
            .ok_or_else(|| ToolError::InvalidParams("expression is required".to_string()))?;
        let policy_id = args
            .get("policy_id")
            .and_then(Value::as_str)
            .ok_or_else(|| ToolError::InvalidParams("policy_id is required".to_string()))?;
        let enabled = args.get("enabled").and_then(Value::as_bool).unwrap_or(true);

        let schedule = ScheduleRepository::new(db)
            .create(policy_id, schedule_type, expression, enabled)
            .await?;
        Ok(json!({"schedule": schedule_to_json(&schedule)}))
    }

    async fn update_cleanup_schedule(
        &self,
        db: UserDatabase,
        args: &Value,
    ) -> Result<Value, ToolError> {
        let schedule_id = args
            .get("schedule_id")
            .and_then(Value::as_str)
            .ok_or_else(|| ToolError::InvalidParams("schedule_id is required".to_string()))?;
        let enabled = args
            .get("enabled")
            .and_then(Value::as_bool)
            .ok_or_else(|| ToolError::InvalidParams("enabled is required".to_string()))?;

        ScheduleRepository::new(db)
            .set_enabled(schedule_id, enabled)
            .await?;
        Ok(json!({"schedule_id": schedule_id, "enabled": enabled}))
    }

    async fn list_cleanup_schedules(&self, db: UserDatabase) -> Result<Value, ToolError> {
        let schedules = ScheduleRepository::new(db).list().await?;
        let schedules: Vec<Value> = schedules.iter().map(schedule_to_json).collect();
        Ok(json!({"schedules": schedules, "count": schedules.len()}))
    }

    async fn get_cleanup_recommendations(&self, db: UserDatabase) -> Result<Value, ToolError> {
        let engine = CleanupEngine::new(
            PolicyRepository::new(db.clone()),
            EmailRepository::new(db.clone()),
            ArchiveRecordRepository::new(db),
        );
        let recommendations = engine.recommendations().await?;
        Ok(json!({"recommendations": recommendations}))
    }

    async fn save_search(&self, db: UserDatabase, args: &Value) -> Result<Value, ToolError> {
        let name = args
            .get("name")
            .and_then(Value::as_str)
            .ok_or_else(|| ToolError::InvalidParams("name is required".to_string()))?;
        let criteria_value = args
            .get("criteria")
            .ok_or_else(|| ToolError::InvalidParams("criteria object is required".to_string()))?;
        let criteria: EmailCriteria = serde_json::from_value(criteria_value.clone())
            .map_err(|err| ToolError::InvalidParams(err.to_string()))?;

        let saved = SavedSearchRepository::new(db).save(name, &criteria).await?;
        Ok(json!({"search": saved}))
    }

    async fn list_saved_searches(&self, db: UserDatabase) -> Result<Value, ToolError> {
        let searches = SavedSearchRepository::new(db).list().await?;
        Ok(json!({"searches": searches, "count": searches.len()}))
    }

    async fn invalidate_listings(&self, user_id: &str) {
        self.resources
            .cache
            .flush_prefix(&format!("user:{user_id}:email-list:"))
            .await;
        self.resources
            .cache
            .delete(&cache::category_stats_key(user_id))
            .await;
    }
}

fn extract_user_context(args: &Value) -> Result<UserContext, ToolError> {
    let raw = args
        .get("user_context")
        .ok_or_else(|| ToolError::InvalidRequest("missing user_context".to_string()))?;
    serde_json::from_value(raw.clone())
        .map_err(|err| ToolError::InvalidRequest(format!("malformed user_context: {err}")))
}

fn parse_criteria(args: &Value) -> Result<EmailCriteria, ToolError> {
    let mut criteria = EmailCriteria::default();

    if let Some(raw) = args.get("category").and_then(Value::as_str) {
        criteria.category = Some(PriorityCategory::from_str(raw).ok_or_else(|| {
            ToolError::InvalidParams(format!("unknown category {raw:?}"))
        })?);
    }
    criteria.year = args.get("year").and_then(Value::as_i64);
    if let Some(range) = args.get("year_range") {
        criteria.year_from = range.get("from").and_then(Value::as_i64);
        criteria.year_to = range.get("to").and_then(Value::as_i64);
    }
    if let Some(range) = args.get("size_range") {
        criteria.size_min = range.get("min").and_then(Value::as_i64);
        criteria.size_max = range.get("max").and_then(Value::as_i64);
    }
    criteria.archived = args.get("archived").and_then(Value::as_bool);
    criteria.sender_contains = args
        .get("sender")
        .and_then(Value::as_str)
        .map(|s| s.to_string());
    criteria.query = args
        .get("query")
        .and_then(Value::as_str)
        .map(|s| s.to_string());
    criteria.has_attachments = args.get("has_attachments").and_then(Value::as_bool);
    if let Some(labels) = args.get("labels").and_then(Value::as_array) {
        criteria.labels = labels
            .iter()
            .filter_map(Value::as_str)
            .map(|s| s.to_string())
            .collect();
    }
    criteria.limit = args.get("limit").and_then(Value::as_u64).map(|v| v as u32);
    criteria.offset = args.get("offset").and_then(Value::as_u64).map(|v| v as u32);

    Ok(criteria)
}

fn job_to_json(job: &JobRecord) -> Value {
    json!({
        "job_id": job.job_id,
        "job_type": job.job_type,
        "status": job.status.as_str(),
        "progress": job.progress,
        "request_params": job.request_params,
        "results": job.results,
        "error_details": job.error_details,
        "created_at": job.created_at.to_rfc3339_opts(SecondsFormat::Millis, true),
        "started_at": job.started_at.map(|t| t.to_rfc3339_opts(SecondsFormat::Millis, true)),
        "completed_at": job.completed_at.map(|t| t.to_rfc3339_opts(SecondsFormat::Millis, true)),
    })
}

fn schedule_to_json(schedule: &CleanupSchedule) -> Value {
    json!({
        "id": schedule.id,
        "policy_id": schedule.policy_id,
        "type": schedule.schedule_type.as_str(),
        "expression": schedule.expression,
        "enabled": schedule.enabled,
        "last_fired_at": schedule
            .last_fired_at
            .map(|t| t.to_rfc3339_opts(SecondsFormat::Millis, true)),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::emails::NewEmail;
    use tempfile::TempDir;

    async fn setup() -> (ToolDispatcher, Arc<Resources>, TempDir) {
        let dir = TempDir::new().expect("temp dir");
        let mut config = Config::default();
        config.storage.path = dir.path().to_path_buf();
        let resources = Resources::build(config, None).await.expect("resources");
        (ToolDispatcher::new(resources.clone()), resources, dir)
    }

    async fn open_session(dispatcher: &ToolDispatcher, user_id: &str) -> UserContext {
        let response = dispatcher
            .dispatch("authenticate", json!({"user_id": user_id}))
            .await
            .expect("authenticate");
        UserContext {
            user_id: response["user_id"].as_str().expect("user").to_string(),
            session_id: response["session_id"].as_str().expect("session").to_string(),
        }
    }

    async fn seed_email(resources: &Resources, user_id: &str, id: &str, year: i32) {
        let db = resources.factory.database_for(user_id).await.expect("db");
        EmailRepository::new(db)
            .upsert(NewEmail {
                id: id.to_string(),
                thread_id: format!("t-{id}"),
                sender: Some("sender@example.com".into()),
                recipients: vec![],
                subject: Some(format!("subject {id}")),
                snippet: Some("snippet".into()),
                labels: vec!["INBOX".into()],
                has_attachments: false,
                date: Some(
                    chrono::TimeZone::with_ymd_and_hms(&Utc, year, 6, 1, 0, 0, 0).unwrap(),
                ),
                size_bytes: 1_000,
            })
            .await
            .expect("seed email");
    }

    #[tokio::test]
    async fn unknown_tool_is_method_not_found() {
        let (dispatcher, _resources, _dir) = setup().await;
        let ctx = open_session(&dispatcher, "u1").await;
        let err = dispatcher
            .dispatch("format_disk", json!({"user_context": ctx}))
            .await
            .expect_err("unknown tool");
        assert!(matches!(err, ToolError::MethodNotFound(_)));
    }

    #[tokio::test]
    async fn bogus_session_is_invalid_request() {
        let (dispatcher, _resources, _dir) = setup().await;
        let err = dispatcher
            .dispatch(
                "list_emails",
                json!({"user_context": {"user_id": "user-1", "session_id": "bogus"}}),
            )
            .await
            .expect_err("bogus session");
        assert!(matches!(err, ToolError::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn session_for_another_user_is_invalid_request() {
        let (dispatcher, _resources, _dir) = setup().await;
        let ctx = open_session(&dispatcher, "user-1").await;

        let err = dispatcher
            .dispatch(
                "list_emails",
                json!({"user_context": {"user_id": "user-2", "session_id": ctx.session_id}}),
            )
            .await
            .expect_err("foreign session");
        assert!(matches!(err, ToolError::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn missing_user_context_is_invalid_request() {
        let (dispatcher, _resources, _dir) = setup().await;
        let err = dispatcher
            .dispatch("list_emails", json!({}))
            .await
            .expect_err("missing context");
        assert!(matches!(err, ToolError::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn list_emails_filters_and_reports_totals() {
        let (dispatcher, resources, _dir) = setup().await;
        let ctx = open_session(&dispatcher, "u1").await;
        seed_email(&resources, "u1", "m1", 2022).await;
        seed_email(&resources, "u1", "m2", 2024).await;

        let response = dispatcher
            .dispatch(
                "list_emails",
                json!({"year": 2022, "user_context": ctx}),
            )
            .await
            .expect("list");
        assert_eq!(response["count"], 1);
        assert_eq!(response["total"], 1);
        assert_eq!(response["emails"][0]["id"], "m1");
    }

    #[tokio::test]
    async fn delete_emails_requires_confirmation_or_dry_run() {
        let (dispatcher, resources, _dir) = setup().await;
        let ctx = open_session(&dispatcher, "u1").await;
        seed_email(&resources, "u1", "m1", 2022).await;

        let err = dispatcher
            .dispatch(
                "delete_emails",
                json!({"year": 2022, "user_context": ctx}),
            )
            .await
            .expect_err("no confirm, no dry_run");
        assert!(matches!(err, ToolError::InvalidParams(_)));

        let preview = dispatcher
            .dispatch(
                "delete_emails",
                json!({"year": 2022, "dry_run": true, "user_context": ctx}),
            )
            .await
            .expect("dry run");
        assert_eq!(preview["would_delete"], 1);

        let listed = dispatcher
            .dispatch("list_emails", json!({"user_context": ctx}))
            .await
            .expect("list");
        assert_eq!(listed["count"], 1, "dry run changed nothing");

        let deleted = dispatcher
            .dispatch(
                "delete_emails",
                json!({"year": 2022, "confirm": true, "user_context": ctx}),
            )
            .await
            .expect("confirmed delete");
        assert_eq!(deleted["deleted"], 1);

        let listed = dispatcher
            .dispatch("list_emails", json!({"user_context": ctx}))
            .await
            .expect("list");
        assert_eq!(listed["count"], 0, "deleted email out of listings");
    }

    #[tokio::test]
    async fn archive_emails_dry_run_then_live() {
        let (dispatcher, resources, _dir) = setup().await;
        let ctx = open_session(&dispatcher, "u1").await;
        seed_email(&resources, "u1", "m1", 2020).await;

        let preview = dispatcher
            .dispatch(
                "archive_emails",
                json!({"year": 2020, "dry_run": true, "user_context": ctx}),
            )
            .await
            .expect("dry run");
        assert_eq!(preview["would_archive"], 1);

        let archived = dispatcher
            .dispatch(
                "archive_emails",
                json!({"year": 2020, "method": "export", "export_format": "mbox", "user_context": ctx}),
            )
            .await
            .expect("archive");
        assert_eq!(archived["archived"], 1);
        assert!(
            archived["location"]
                .as_str()
                .expect("location")
                .ends_with(".mbox")
        );
    }

    #[tokio::test]
    async fn categorize_emails_submits_a_pending_job() {
        let (dispatcher, resources, _dir) = setup().await;
        let ctx = open_session(&dispatcher, "u1").await;

        let response = dispatcher
            .dispatch(
                "categorize_emails",
                json!({"force_refresh": true, "user_context": ctx}),
            )
            .await
            .expect("submit");
        let job_id = response["job_id"].as_str().expect("job id");
        assert_eq!(response["status"], "pending");
        assert_eq!(resources.queue.len(), 1);

        let status = dispatcher
            .dispatch(
                "get_job_status",
                json!({"id": job_id, "user_context": ctx}),
            )
            .await
            .expect("status");
        assert_eq!(status["status"], "pending");
        assert_eq!(status["request_params"]["force_refresh"], true);
    }

    #[tokio::test]
    async fn job_status_does_not_leak_across_users() {
        let (dispatcher, _resources, _dir) = setup().await;
        let ctx_a = open_session(&dispatcher, "user-a").await;
        let ctx_b = open_session(&dispatcher, "user-b").await;

        let response = dispatcher
            .dispatch("categorize_emails", json!({"user_context": ctx_a}))
            .await
            .expect("submit");
        let job_id = response["job_id"].as_str().expect("job id");

        let err = dispatcher
            .dispatch(
                "get_job_status",
                json!({"id": job_id, "user_context": ctx_b}),
            )
            .await
            .expect_err("foreign job");
        assert!(matches!(err, ToolError::NotFound(_)));
    }

    #[tokio::test]
    async fn policy_crud_round_trips_through_tools() {
        let (dispatcher, _resources, _dir) = setup().await;
        let ctx = open_session(&dispatcher, "u1").await;

        let policy_spec = json!({
            "name": "archive-old",
            "priority": 70,
            "criteria": {"min_age_days": 365},
            "action": {"action": "archive", "method": "gmail"},
            "safety": {
                "max_emails_per_run": 50,
                "require_confirmation": false,
                "dry_run_first": false,
                "preserve_important": true
            }
        });
        let created = dispatcher
            .dispatch(
                "create_cleanup_policy",
                json!({"policy": policy_spec, "user_context": ctx}),
            )
            .await
            .expect("create");
        let policy_id = created["policy"]["id"].as_str().expect("id").to_string();

        let updated = dispatcher
            .dispatch(
                "update_cleanup_policy",
                json!({
                    "policy_id": policy_id,
                    "updates": {"enabled": false},
                    "user_context": ctx
                }),
            )
            .await
            .expect("update");
        assert_eq!(updated["policy"]["enabled"], false);
        assert_eq!(updated["policy"]["priority"], 70, "merge keeps the rest");

        let listed = dispatcher
            .dispatch("list_cleanup_policies", json!({"user_context": ctx}))
            .await
            .expect("list");
        assert_eq!(listed["count"], 1);

        let deleted = dispatcher
            .dispatch(
                "delete_cleanup_policy",
                json!({"policy_id": policy_id, "user_context": ctx}),
            )
            .await
            .expect("delete");
        assert_eq!(deleted["deleted"], true);

        let err = dispatcher
            .dispatch(
                "delete_cleanup_policy",
                json!({"policy_id": policy_id, "user_context": ctx}),
            )
            .await
            .expect_err("already gone");
        assert!(matches!(err, ToolError::NotFound(_)));
    }

    #[tokio::test]
    async fn create_policy_without_safety_block_fails() {
        let (dispatcher, _resources, _dir) = setup().await;
        let ctx = open_session(&dispatcher, "u1").await;

        let err = dispatcher
            .dispatch(
                "create_cleanup_policy",
                json!({
                    "policy": {
                        "name": "unsafe",
                        "action": {"action": "delete", "method": "gmail"}
                    },
                    "user_context": ctx
                }),
            )
            .await
            .expect_err("safety block is mandatory");
        assert!(matches!(err, ToolError::InvalidParams(_)));
    }

    #[tokio::test]
    async fn save_search_round_trips_against_direct_search() {
        let (dispatcher, resources, _dir) = setup().await;
        let ctx = open_session(&dispatcher, "u1").await;
        seed_email(&resources, "u1", "m1", 2022).await;
        seed_email(&resources, "u1", "m2", 2024).await;

        dispatcher
            .dispatch(
                "save_search",
                json!({
                    "name": "old-mail",
                    "criteria": {"year": 2022},
                    "user_context": ctx
                }),
            )
            .await
            .expect("save");

        let listed = dispatcher
            .dispatch("list_saved_searches", json!({"user_context": ctx}))
            .await
            .expect("list");
        assert_eq!(listed["count"], 1);
        let criteria = listed["searches"][0]["criteria"].clone();

        let direct = dispatcher
            .dispatch(
                "search_emails",
                json!({"year_range": {"from": 2022, "to": 2022}, "user_context": ctx}),
            )
            .await
            .expect("direct search");

        let db = resources.factory.database_for("u1").await.expect("db");
        let stored: EmailCriteria = serde_json::from_value(criteria).expect("criteria");
        let via_saved = EmailRepository::new(db).search(&stored).await.expect("saved");
        assert_eq!(via_saved.len(), direct["count"].as_u64().unwrap() as usize);
        assert_eq!(via_saved[0].id, "m1");
    }

    #[tokio::test]
    async fn trigger_cleanup_dry_run_and_submission() {
        let (dispatcher, resources, _dir) = setup().await;
        let ctx = open_session(&dispatcher, "u1").await;
        seed_email(&resources, "u1", "old-1", 2019).await;

        let created = dispatcher
            .dispatch(
                "create_cleanup_policy",
                json!({
                    "policy": {
                        "name": "archive-ancient",
                        "criteria": {"min_age_days": 365},
                        "action": {"action": "archive", "method": "gmail"},
                        "safety": {
                            "max_emails_per_run": 10,
                            "require_confirmation": false,
                            "dry_run_first": false,
                            "preserve_important": true
                        }
                    },
                    "user_context": ctx
                }),
            )
            .await
            .expect("create policy");
        let policy_id = created["policy"]["id"].as_str().expect("id");

        let preview = dispatcher
            .dispatch(
                "trigger_cleanup",
                json!({"policy_id": policy_id, "dry_run": true, "user_context": ctx}),
            )
            .await
            .expect("dry run");
        assert_eq!(preview["dry_run"], true);
        assert_eq!(preview["affected"], 1);

        let submitted = dispatcher
            .dispatch(
                "trigger_cleanup",
                json!({"policy_id": policy_id, "user_context": ctx}),
            )
            .await
            .expect("submit");
        assert_eq!(submitted["status"], "pending");
        assert_eq!(resources.queue.len(), 1);
    }

    #[tokio::test]
    async fn schedules_create_and_list() {
        let (dispatcher, _resources, _dir) = setup().await;
        let ctx = open_session(&dispatcher, "u1").await;

        let created = dispatcher
            .dispatch(
                "create_cleanup_policy",
                json!({
                    "policy": {
                        "name": "scheduled",
                        "action": {"action": "archive", "method": "gmail"},
                        "safety": {
                            "max_emails_per_run": 10,
                            "require_confirmation": false,
                            "dry_run_first": false,
                            "preserve_important": true
                        }
                    },
                    "user_context": ctx
                }),
            )
            .await
            .expect("create policy");
        let policy_id = created["policy"]["id"].as_str().expect("id");

        let schedule = dispatcher
            .dispatch(
                "create_cleanup_schedule",
                json!({
                    "type": "daily",
                    "expression": "03:30",
                    "policy_id": policy_id,
                    "user_context": ctx
                }),
            )
            .await
            .expect("create schedule");
        assert_eq!(schedule["schedule"]["type"], "daily");

        let err = dispatcher
            .dispatch(
                "create_cleanup_schedule",
                json!({
                    "type": "daily",
                    "expression": "26:00",
                    "policy_id": policy_id,
                    "user_context": ctx
                }),
            )
            .await
            .expect_err("bad expression");
        assert!(matches!(err, ToolError::InvalidParams(_)));

        let listed = dispatcher
            .dispatch("list_cleanup_schedules", json!({"user_context": ctx}))
            .await
            .expect("list");
        assert_eq!(listed["count"], 1);
        let schedule_id = listed["schedules"][0]["id"].as_str().expect("id");

        dispatcher
            .dispatch(
                "update_cleanup_schedule",
                json!({"schedule_id": schedule_id, "enabled": false, "user_context": ctx}),
            )
            .await
            .expect("disable");
        let listed = dispatcher
            .dispatch("list_cleanup_schedules", json!({"user_context": ctx}))
            .await
            .expect("list again");
        assert_eq!(listed["schedules"][0]["enabled"], false);
    }

    #[tokio::test]
    async fn email_stats_group_by_category_counts() {
        let (dispatcher, resources, _dir) = setup().await;
        let ctx = open_session(&dispatcher, "u1").await;
        seed_email(&resources, "u1", "m1", 2024).await;

        let stats = dispatcher
            .dispatch(
                "get_email_stats",
                json!({"group_by": "category", "user_context": ctx}),
            )
            .await
            .expect("stats");
        assert_eq!(stats["uncategorized"], 1);

        let err = dispatcher
            .dispatch(
                "get_email_stats",
                json!({"group_by": "phase_of_moon", "user_context": ctx}),
            )
            .await
            .expect_err("unknown grouping");
        assert!(matches!(err, ToolError::InvalidParams(_)));
    }

    #[tokio::test]
    async fn multi_user_mode_requires_user_id_on_authenticate() {
        let dir = TempDir::new().expect("temp dir");
        let mut config = Config::default();
        config.storage.path = dir.path().to_path_buf();
        config.sessions.multi_user = true;
        let resources = Resources::build(config, None).await.expect("resources");
        let dispatcher = ToolDispatcher::new(resources);

        let err = dispatcher
            .dispatch("authenticate", json!({}))
            .await
            .expect_err("user_id required");
        assert!(matches!(err, ToolError::InvalidParams(_)));

        let ok = dispatcher
            .dispatch("authenticate", json!({"user_id": "tenant-1"}))
            .await
            .expect("authenticate");
        assert_eq!(ok["user_id"], "tenant-1");
    }
}
