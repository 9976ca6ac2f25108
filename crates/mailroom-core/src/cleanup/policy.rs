use chrono::{DateTime, SecondsFormat, Utc};
use libsql::{Row, params};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

use crate::db::DbError;
use crate::factory::UserDatabase;

const POLICY_COLUMNS: &str = "id, user_id, name, enabled, priority, criteria_json, action_json, safety_json, schedule_json, created_at, updated_at";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CleanupAction {
    Archive,
    Delete,
}

impl CleanupAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            CleanupAction::Archive => "archive",
            CleanupAction::Delete => "delete",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CleanupMethod {
    Gmail,
    Export,
}

/// What a policy matches. All bounds are optional and conjunctive.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyCriteria {
    pub min_age_days: Option<i64>,
    /// Only emails at or below this importance are candidates.
    pub max_importance_level: Option<String>,
    pub min_size_bytes: Option<i64>,
    pub min_spam_score: Option<f64>,
    pub min_promotional_score: Option<f64>,
    pub max_access_score: Option<f64>,
    pub days_without_access: Option<i64>,
    /// Already-archived rows are excluded unless a policy opts in.
    pub include_archived: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyActionSpec {
    pub action: CleanupAction,
    pub method: CleanupMethod,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub export_format: Option<String>,
}

/// The mandatory safety block. Policies cannot be stored without one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicySafety {
    pub max_emails_per_run: u32,
    pub require_confirmation: bool,
    pub dry_run_first: bool,
    pub preserve_important: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CleanupPolicy {
    pub id: String,
    pub user_id: String,
    pub name: String,
    pub enabled: bool,
    /// 0-100; higher policies win scheduling conflicts.
    pub priority: i64,
    pub criteria: PolicyCriteria,
    pub action: PolicyActionSpec,
    pub safety: PolicySafety,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schedule: Option<Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewCleanupPolicy {
    pub name: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default = "default_priority")]
    pub priority: i64,
    #[serde(default)]
    pub criteria: PolicyCriteria,
    pub action: PolicyActionSpec,
    pub safety: PolicySafety,
    #[serde(default)]
    pub schedule: Option<Value>,
}

fn default_enabled() -> bool {
    true
}

fn default_priority() -> i64 {
    50
}

/// Partial update; absent fields keep their stored values.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct PolicyPatch {
    pub name: Option<String>,
    pub enabled: Option<bool>,
    pub priority: Option<i64>,
    pub criteria: Option<PolicyCriteria>,
    pub action: Option<PolicyActionSpec>,
    pub safety: Option<PolicySafety>,
    pub schedule: Option<Value>,
}

#[derive(Debug, Error)]
pub enum PolicyError {
    #[error("database error: {0}")]
    Database(#[from] DbError),
    #[error("sql error: {0}")]
    Sql(#[from] libsql::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("datetime parse error: {0}")]
    DateTimeParse(#[from] chrono::ParseError),
    #[error("policy not found: {0}")]
    NotFound(String),
    #[error("priority {0} outside 0-100")]
    PriorityOutOfRange(i64),
}

#[derive(Clone)]
pub struct PolicyRepository {
    db: UserDatabase,
}

impl PolicyRepository {
    pub fn new(db: UserDatabase) -> Self {
        Self { db }
    }

    pub async fn create(&self, new_policy: NewCleanupPolicy) -> Result<CleanupPolicy, PolicyError> {
        if !(0..=100).contains(&new_policy.priority) {
            return Err(PolicyError::PriorityOutOfRange(new_policy.priority));
        }

        let id = Uuid::new_v4().to_string();
        let now = now_rfc3339();
        let criteria_json = serde_json::to_string(&new_policy.criteria)?;
        let action_json = serde_json::to_string(&new_policy.action)?;
        let safety_json = serde_json::to_string(&new_policy.safety)?;
        let schedule_json = new_policy
            .schedule
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        let conn = self.db.connection().await?;
        let mut rows = conn
            .query(
                &format!(
                    "INSERT INTO cleanup_policies (id, user_id, name, enabled, priority, criteria_json, action_json, safety_json, schedule_json, created_at, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?10)
                     RETURNING {POLICY_COLUMNS}"
                ),
                params![
                    id.as_str(),
                    self.db.user_id(),
                    new_policy.name,
                    new_policy.enabled as i64,
                    new_policy.priority,
                    criteria_json,
                    action_json,
                    safety_json,
                    schedule_json,
                    now
                ],
            )
            .await?;

        match rows.next().await? {
            Some(row) => row_to_policy(row),
            None => Err(PolicyError::NotFound(id)),
        }
    }

    pub async fn get(&self, policy_id: &str) -> Result<Option<CleanupPolicy>, PolicyError> {
        let conn = self.db.connection().await?;
        let mut rows = conn
            .query(
                &format!(
                    "SELECT {POLICY_COLUMNS} FROM cleanup_policies WHERE id = ?1 AND user_id = ?2"
                ),
                params![policy_id, self.db.user_id()],
            )
            .await?;

        match rows.next().await? {
            Some(row) => Ok(Some(row_to_policy(row)?)),
            None => Ok(None),
        }
    }

    pub async fn list(&self) -> Result<Vec<CleanupPolicy>, PolicyError> {
        let conn = self.db.connection().await?;
        let mut rows = conn
            .query(
                &format!(
                    "SELECT {POLICY_COLUMNS} FROM cleanup_policies
                     WHERE user_id = ?1
                     ORDER BY priority DESC, created_at"
                ),
                params![self.db.user_id()],
            )
            .await?;

        let mut policies = Vec::new();
        while let Some(row) = rows.next().await? {
            policies.push(row_to_policy(row)?);
        }
        Ok(policies)
    }

    pub async fn update(
        &self,
        policy_id: &str,
        patch: PolicyPatch,
    ) -> Result<CleanupPolicy, PolicyError> {
        let current = self
            .get(policy_id)
            .await?
            .ok_or_else(|| PolicyError::NotFound(policy_id.to_string()))?;

        let priority = patch.priority.unwrap_or(current.priority);
        if !(0..=100).contains(&priority) {
            return Err(PolicyError::PriorityOutOfRange(priority));
        }

        let name = patch.name.unwrap_or(current.name);
        let enabled = patch.enabled.unwrap_or(current.enabled);
        let criteria_json = serde_json::to_string(&patch.criteria.unwrap_or(current.criteria))?;
        let action_json = serde_json::to_string(&patch.action.unwrap_or(current.action))?;
        let safety_json = serde_json::to_string(&patch.safety.unwrap_or(current.safety))?;
        let schedule_json = patch
            .schedule
            .or(current.schedule)
            .map(|value| serde_json::to_string(&value))
            .transpose()?;
        let now = now_rfc3339();

        let conn = self.db.connection().await?;
        let mut rows = conn
            .query(
                &format!(
                    "UPDATE cleanup_policies SET name = ?3, enabled = ?4, priority = ?5,
                        criteria_json = ?6, action_json = ?7, safety_json = ?8,
                        schedule_json = ?9, updated_at = ?10
                     WHERE id = ?1 AND user_id = ?2
                     RETURNING {POLICY_COLUMNS}"
                ),
                params![
                    policy_id,
                    self.db.user_id(),
                    name,
                    enabled as i64,
                    priority,
                    criteria_json,
                    action_json,
                    safety_json,
                    schedule_json,
                    now
                ],
            )
            .await?;

        match rows.next().await? {
            Some(row) => row_to_policy(row),
            None => Err(PolicyError::NotFound(policy_id.to_string())),
        }
    }

    pub async fn delete(&self, policy_id: &str) -> Result<bool, PolicyError> {
        let conn = self.db.connection().await?;
        let deleted = conn
            .execute(
                "DELETE FROM cleanup_policies WHERE id = ?1 AND user_id = ?2",
                params![policy_id, self.db.user_id()],
            )
            .await?;
        Ok(deleted > 0)
    }
}

/// Audit row written after each archive run.
#[derive(Debug, Clone, PartialEq)]
pub struct ArchiveRecord {
    pub id: String,
    pub user_id: String,
    pub method: String,
    pub location: Option<String>,
    pub email_count: i64,
    pub archived_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct ArchiveRecordRepository {
    db: UserDatabase,
}

impl ArchiveRecordRepository {
    pub fn new(db: UserDatabase) -> Self {
        Self { db }
    }

    pub async fn record(
        &self,
        method: &str,
        location: Option<&str>,
        email_count: i64,
    ) -> Result<ArchiveRecord, PolicyError> {
        let id = Uuid::new_v4().to_string();
        let now = now_rfc3339();
        let location_owned = location.map(|value| value.to_string());
        let conn = self.db.connection().await?;
        conn.execute(
            "INSERT INTO archive_records (id, user_id, method, location, email_count, archived_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                id.as_str(),
                self.db.user_id(),
                method,
                location_owned,
                email_count,
                now.as_str()
            ],
        )
        .await?;

        Ok(ArchiveRecord {
            id,
            user_id: self.db.user_id().to_string(),
            method: method.to_string(),
            location: location.map(|s| s.to_string()),
            email_count,
            archived_at: DateTime::parse_from_rfc3339(&now)?.with_timezone(&Utc),
        })
    }

    pub async fn list(&self) -> Result<Vec<ArchiveRecord>, PolicyError> {
        let conn = self.db.connection().await?;
        let mut rows = conn
            .query(
                "SELECT id, user_id, method, location, email_count, archived_at
                 FROM archive_records WHERE user_id = ?1 ORDER BY archived_at DESC",
                params![self.db.user_id()],
            )
            .await?;

        let mut records = Vec::new();
        while let Some(row) = rows.next().await? {
            let archived_at: String = row.get(5)?;
            records.push(ArchiveRecord {
                id: row.get(0)?,
                user_id: row.get(1)?,
                method: row.get(2)?,
                location: row.get(3)?,
                email_count: row.get(4)?,
                archived_at: DateTime::parse_from_rfc3339(&archived_at)?.with_timezone(&Utc),
            });
        }
        Ok(records)
    }
}

fn row_to_policy(row: Row) -> Result<CleanupPolicy, PolicyError> {
    let enabled: i64 = row.get(3)?;
    let criteria_json: String = row.get(5)?;
    let action_json: String = row.get(6)?;
    let safety_json: String = row.get(7)?;
    let schedule_json: Option<String> = row.get(8)?;
    let created_at: String = row.get(9)?;
    let updated_at: String = row.get(10)?;

    Ok(CleanupPolicy {
        id: row.get(0)?,
        user_id: row.get(1)?,
        name: row.get(2)?,
        enabled: enabled != 0,
        priority: row.get(4)?,
        criteria: serde_json::from_str(&criteria_json)?,
        action: serde_json::from_str(&action_json)?,
        safety: serde_json::from_str(&safety_json)?,
        schedule: schedule_json
            .map(|value| serde_json::from_str(&value))
            .transpose()?,
        created_at: DateTime::parse_from_rfc3339(&created_at)?.with_timezone(&Utc),
        updated_at: DateTime::parse_from_rfc3339(&updated_at)?.with_timezone(&Utc),
    })
}

fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::factory::UserDbFactory;
    use tempfile::TempDir;

    async fn setup() -> (PolicyRepository, ArchiveRecordRepository, TempDir) {
        let dir = TempDir::new().expect("temp dir");
        let factory = UserDbFactory::new(dir.path());
        let db = factory.database_for("user-a").await.expect("open db");
        (
            PolicyRepository::new(db.clone()),
            ArchiveRecordRepository::new(db),
            dir,
        )
    }

    pub(crate) fn sample_policy(name: &str) -> NewCleanupPolicy {
        NewCleanupPolicy {
            name: name.to_string(),
            enabled: true,
            priority: 60,
            criteria: PolicyCriteria {
                min_age_days: Some(365),
                max_importance_level: Some("low".into()),
                ..Default::default()
            },
            action: PolicyActionSpec {
                action: CleanupAction::Archive,
                method: CleanupMethod::Gmail,
                export_format: None,
            },
            safety: PolicySafety {
                max_emails_per_run: 100,
                require_confirmation: false,
                dry_run_first: true,
                preserve_important: true,
            },
            schedule: None,
        }
    }

    #[tokio::test]
    async fn create_then_list_round_trips_policy() {
        let (repo, _records, _dir) = setup().await;
        let created = repo.create(sample_policy("old-mail")).await.expect("create");

        let listed = repo.list().await.expect("list");
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0], created);
        assert_eq!(listed[0].criteria.min_age_days, Some(365));
        assert!(listed[0].safety.preserve_important);
    }

    #[tokio::test]
    async fn update_merges_only_patched_fields() {
        let (repo, _records, _dir) = setup().await;
        let created = repo.create(sample_policy("old-mail")).await.expect("create");

        let updated = repo
            .update(
                &created.id,
                PolicyPatch {
                    enabled: Some(false),
                    priority: Some(10),
                    ..Default::default()
                },
            )
            .await
            .expect("update");

        assert!(!updated.enabled);
        assert_eq!(updated.priority, 10);
        assert_eq!(updated.name, "old-mail", "unpatched fields unchanged");
        assert_eq!(updated.criteria, created.criteria);
    }

    #[tokio::test]
    async fn priority_is_validated_on_create_and_update() {
        let (repo, _records, _dir) = setup().await;
        let mut bad = sample_policy("bad");
        bad.priority = 150;
        let err = repo.create(bad).await.expect_err("priority out of range");
        assert!(matches!(err, PolicyError::PriorityOutOfRange(150)));

        let created = repo.create(sample_policy("ok")).await.expect("create");
        let err = repo
            .update(
                &created.id,
                PolicyPatch {
                    priority: Some(-1),
                    ..Default::default()
                },
            )
            .await
            .expect_err("negative priority");
        assert!(matches!(err, PolicyError::PriorityOutOfRange(-1)));
    }

    #[tokio::test]
    async fn delete_removes_policy() {
        let (repo, _records, _dir) = setup().await;
        let created = repo.create(sample_policy("gone")).await.expect("create");

        assert!(repo.delete(&created.id).await.expect("delete"));
        assert!(repo.get(&created.id).await.expect("get").is_none());
        assert!(!repo.delete(&created.id).await.expect("second delete"));
    }

    #[tokio::test]
    async fn update_missing_policy_is_not_found() {
        let (repo, _records, _dir) = setup().await;
        let err = repo
            .update("missing", PolicyPatch::default())
            .await
            .expect_err("not found");
        assert!(matches!(err, PolicyError::NotFound(_)));
    }

    #[tokio::test]
    async fn archive_records_accumulate() {
        let (_repo, records, _dir) = setup().await;
        records
            .record("gmail", None, 12)
            .await
            .expect("record gmail run");
        records
            .record("export", Some("export/2024.mbox"), 3)
            .await
            .expect("record export run");

        let listed = records.list().await.expect("list");
        assert_eq!(listed.len(), 2);
        assert!(listed.iter().any(|r| r.method == "export"
            && r.location.as_deref() == Some("export/2024.mbox")
            && r.email_count == 3));
    }
}
