use chrono::{DateTime, Datelike, SecondsFormat, Utc};
use libsql::{Row, Value as SqlValue, params};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use thiserror::Error;

use crate::db::DbError;
use crate::factory::UserDatabase;

const EMAIL_COLUMNS: &str = "id, user_id, thread_id, sender, recipients_json, subject, snippet, labels_json, has_attachments, date, year, size_bytes, category, archived, archive_date, archive_location, deleted, importance_level, importance_score, importance_matched_rules_json, age_category, size_category, gmail_category, spam_score, promotional_score, social_score, analysis_timestamp, analysis_version, created_at, updated_at";

/// Final per-email verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PriorityCategory {
    High,
    Medium,
    Low,
}

impl PriorityCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            PriorityCategory::High => "high",
            PriorityCategory::Medium => "medium",
            PriorityCategory::Low => "low",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        match value {
            "high" => Some(Self::High),
            "medium" => Some(Self::Medium),
            "low" => Some(Self::Low),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EmailIndex {
    pub id: String,
    pub user_id: String,
    pub thread_id: String,
    pub sender: Option<String>,
    pub recipients: Vec<String>,
    pub subject: Option<String>,
    pub snippet: Option<String>,
    pub labels: Vec<String>,
    pub has_attachments: bool,
    pub date: Option<DateTime<Utc>>,
    pub year: Option<i64>,
    pub size_bytes: i64,
    pub category: Option<PriorityCategory>,
    pub archived: bool,
    pub archive_date: Option<DateTime<Utc>>,
    pub archive_location: Option<String>,
    pub deleted: bool,
    pub importance_level: Option<String>,
    pub importance_score: Option<f64>,
    pub importance_matched_rules: Vec<String>,
    pub age_category: Option<String>,
    pub size_category: Option<String>,
    pub gmail_category: Option<String>,
    pub spam_score: Option<f64>,
    pub promotional_score: Option<f64>,
    pub social_score: Option<f64>,
    pub analysis_timestamp: Option<DateTime<Utc>>,
    pub analysis_version: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Vendor-sourced fields for insert/refresh. Derived and enrichment columns
/// are never written through this path.
#[derive(Debug, Clone)]
pub struct NewEmail {
    pub id: String,
    pub thread_id: String,
    pub sender: Option<String>,
    pub recipients: Vec<String>,
    pub subject: Option<String>,
    pub snippet: Option<String>,
    pub labels: Vec<String>,
    pub has_attachments: bool,
    pub date: Option<DateTime<Utc>>,
    pub size_bytes: i64,
}

/// Analyzer output written back onto a row after categorization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Enrichment {
    pub category: PriorityCategory,
    pub importance_level: String,
    pub importance_score: f64,
    pub importance_matched_rules: Vec<String>,
    pub age_category: String,
    pub size_category: String,
    pub gmail_category: String,
    pub spam_score: f64,
    pub promotional_score: f64,
    pub social_score: f64,
    pub analysis_timestamp: DateTime<Utc>,
    pub analysis_version: String,
}

/// Criteria bag shared by list/search/archive/delete/cleanup paths. Every
/// query built from it is additionally scoped to the handle's user.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EmailCriteria {
    pub category: Option<PriorityCategory>,
    pub uncategorized_only: bool,
    pub year: Option<i64>,
    pub year_from: Option<i64>,
    pub year_to: Option<i64>,
    pub archived: Option<bool>,
    pub size_min: Option<i64>,
    pub size_max: Option<i64>,
    pub date_from: Option<DateTime<Utc>>,
    pub date_to: Option<DateTime<Utc>>,
    pub labels: Vec<String>,
    pub sender_contains: Option<String>,
    pub query: Option<String>,
    pub has_attachments: Option<bool>,
    pub importance_level: Option<String>,
    pub include_deleted: bool,
    pub limit: Option<u32>,
    pub offset: Option<u32>,
}

/// Size bucket boundaries for stats grouping; values equal to a boundary
/// fall into the lower bucket.
#[derive(Debug, Clone, Copy)]
pub struct SizeBuckets {
    pub small_max: i64,
    pub medium_max: i64,
}

#[derive(Debug, Error)]
pub enum EmailError {
    #[error("database error: {0}")]
    Database(#[from] DbError),
    #[error("sql error: {0}")]
    Sql(#[from] libsql::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("datetime parse error: {0}")]
    DateTimeParse(#[from] chrono::ParseError),
    #[error("email not found: {0}")]
    NotFound(String),
}

#[derive(Clone)]
pub struct EmailRepository {
    db: UserDatabase,
}

impl EmailRepository {
    pub fn new(db: UserDatabase) -> Self {
        Self { db }
    }

    pub fn user_id(&self) -> &str {
        self.db.user_id()
    }

    pub async fn upsert(&self, new_email: NewEmail) -> Result<EmailIndex, EmailError> {
        let now = now_rfc3339();
        let recipients_json = serde_json::to_string(&new_email.recipients)?;
        let labels_json = serde_json::to_string(&new_email.labels)?;
        let date_str = new_email.date.map(to_rfc3339);
        let year = new_email.date.map(|d| d.year() as i64);
        let id_for_error = new_email.id.clone();

        let conn = self.db.connection().await?;
        let mut rows = conn
            .query(
                &format!(
                    "INSERT INTO email_index (
                        id, user_id, thread_id, sender, recipients_json, subject, snippet,
                        labels_json, has_attachments, date, year, size_bytes,
                        created_at, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?13)
                     ON CONFLICT(id) DO UPDATE SET
                        thread_id = excluded.thread_id,
                        sender = excluded.sender,
                        recipients_json = excluded.recipients_json,
                        subject = excluded.subject,
                        snippet = excluded.snippet,
                        labels_json = excluded.labels_json,
                        has_attachments = excluded.has_attachments,
                        date = excluded.date,
                        year = excluded.year,
                        size_bytes = excluded.size_bytes,
                        updated_at = excluded.updated_at
                     RETURNING {EMAIL_COLUMNS}"
                ),
                params![
                    new_email.id,
                    self.db.user_id(),
                    new_email.thread_id,
                    new_email.sender,
                    recipients_json,
                    new_email.subject,
                    new_email.snippet,
                    labels_json,
                    new_email.has_attachments as i64,
                    date_str,
                    year,
                    new_email.size_bytes,
                    now
                ],
            )
            .await?;

        match rows.next().await? {
            Some(row) => row_to_email(row),
            None => Err(EmailError::NotFound(id_for_error)),
        }
    }

    pub async fn get(&self, email_id: &str) -> Result<Option<EmailIndex>, EmailError> {
        let conn = self.db.connection().await?;
        let mut rows = conn
            .query(
                &format!("SELECT {EMAIL_COLUMNS} FROM email_index WHERE id = ?1 AND user_id = ?2"),
                params![email_id, self.db.user_id()],
            )
            .await?;

        match rows.next().await? {
            Some(row) => Ok(Some(row_to_email(row)?)),
            None => Ok(None),
        }
    }

    pub async fn search(&self, criteria: &EmailCriteria) -> Result<Vec<EmailIndex>, EmailError> {
        let (where_clause, mut args) = build_where(self.db.user_id(), criteria);
        let mut sql = format!(
            "SELECT {EMAIL_COLUMNS} FROM email_index WHERE {where_clause} ORDER BY date DESC, id"
        );

        if let Some(limit) = criteria.limit {
            sql.push_str(&format!(" LIMIT ?{}", args.len() + 1));
            args.push(SqlValue::from(limit as i64));
            if let Some(offset) = criteria.offset {
                sql.push_str(&format!(" OFFSET ?{}", args.len() + 1));
                args.push(SqlValue::from(offset as i64));
            }
        }

        let conn = self.db.connection().await?;
        let mut rows = conn.query(&sql, args).await?;
        let mut emails = Vec::new();
        while let Some(row) = rows.next().await? {
            emails.push(row_to_email(row)?);
        }
        Ok(emails)
    }

    pub async fn count(&self, criteria: &EmailCriteria) -> Result<i64, EmailError> {
        let (where_clause, args) = build_where(self.db.user_id(), criteria);
        let sql = format!("SELECT COUNT(*) FROM email_index WHERE {where_clause}");

        let conn = self.db.connection().await?;
        let mut rows = conn.query(&sql, args).await?;
        let row = rows.next().await?.ok_or_else(|| {
            EmailError::NotFound("count query returned no row".to_string())
        })?;
        Ok(row.get(0)?)
    }

    pub async fn apply_enrichment(
        &self,
        email_id: &str,
        enrichment: &Enrichment,
    ) -> Result<(), EmailError> {
        let matched_rules_json = serde_json::to_string(&enrichment.importance_matched_rules)?;
        let now = now_rfc3339();

        let conn = self.db.connection().await?;
        let mut rows = conn
            .query(
                "UPDATE email_index SET
                    category = ?3,
                    importance_level = ?4,
                    importance_score = ?5,
                    importance_matched_rules_json = ?6,
                    age_category = ?7,
                    size_category = ?8,
                    gmail_category = ?9,
                    spam_score = ?10,
                    promotional_score = ?11,
                    social_score = ?12,
                    analysis_timestamp = ?13,
                    analysis_version = ?14,
                    updated_at = ?15
                 WHERE id = ?1 AND user_id = ?2
                 RETURNING id",
                params![
                    email_id,
                    self.db.user_id(),
                    enrichment.category.as_str(),
                    enrichment.importance_level.as_str(),
                    enrichment.importance_score,
                    matched_rules_json,
                    enrichment.age_category.as_str(),
                    enrichment.size_category.as_str(),
                    enrichment.gmail_category.as_str(),
                    enrichment.spam_score,
                    enrichment.promotional_score,
                    enrichment.social_score,
                    to_rfc3339(enrichment.analysis_timestamp),
                    enrichment.analysis_version.as_str(),
                    now
                ],
            )
            .await?;

        if rows.next().await?.is_none() {
            return Err(EmailError::NotFound(email_id.to_string()));
        }
        Ok(())
    }

    pub async fn mark_archived(
        &self,
        email_ids: &[String],
        location: Option<&str>,
    ) -> Result<u64, EmailError> {
        if email_ids.is_empty() {
            return Ok(0);
        }
        let now = now_rfc3339();
        let placeholders = placeholders_from(4, email_ids.len());
        let sql = format!(
            "UPDATE email_index
             SET archived = 1, archive_date = ?2, archive_location = ?3, updated_at = ?2
             WHERE user_id = ?1 AND id IN ({placeholders})"
        );

        let mut args: Vec<SqlValue> = vec![
            self.db.user_id().into(),
            now.into(),
            location.map(SqlValue::from).unwrap_or(SqlValue::Null),
        ];
        for id in email_ids {
            args.push(id.as_str().into());
        }

        let conn = self.db.connection().await?;
        Ok(conn.execute(&sql, args).await?)
    }

    pub async fn mark_deleted(&self, email_ids: &[String]) -> Result<u64, EmailError> {
        if email_ids.is_empty() {
            return Ok(0);
        }
        let now = now_rfc3339();
        let placeholders = placeholders_from(3, email_ids.len());
        let sql = format!(
            "UPDATE email_index SET deleted = 1, updated_at = ?2
             WHERE user_id = ?1 AND id IN ({placeholders})"
        );

        let mut args: Vec<SqlValue> = vec![self.db.user_id().into(), now.into()];
        for id in email_ids {
            args.push(id.as_str().into());
        }

        let conn = self.db.connection().await?;
        Ok(conn.execute(&sql, args).await?)
    }

    /// Aggregate counts for `get_email_stats`.
    pub async fn stats(
        &self,
        group_by: &str,
        include_archived: bool,
        buckets: SizeBuckets,
    ) -> Result<Value, EmailError> {
        match group_by {
            "category" => self.stats_by_category(include_archived).await,
            "year" => self.stats_by_year(include_archived).await,
            "size" => self.stats_by_size(include_archived, buckets).await,
            "archived" => self.stats_by_archived().await,
            _ => {
                let mut all = json!({});
                all["category"] = self.stats_by_category(include_archived).await?;
                all["year"] = self.stats_by_year(include_archived).await?;
                all["size"] = self.stats_by_size(include_archived, buckets).await?;
                all["archived"] = self.stats_by_archived().await?;
                all["totals"] = self.stats_totals(include_archived).await?;
                Ok(all)
            }
        }
    }

    async fn stats_by_category(&self, include_archived: bool) -> Result<Value, EmailError> {
        let archived_clause = archived_filter(include_archived);
        let conn = self.db.connection().await?;
        let mut rows = conn
            .query(
                &format!(
                    "SELECT COALESCE(category, 'uncategorized'), COUNT(*)
                     FROM email_index
                     WHERE user_id = ?1 AND deleted = 0 {archived_clause}
                     GROUP BY COALESCE(category, 'uncategorized')"
                ),
                params![self.db.user_id()],
            )
            .await?;

        let mut counts = json!({"high": 0, "medium": 0, "low": 0, "uncategorized": 0});
        while let Some(row) = rows.next().await? {
            let key: String = row.get(0)?;
            let count: i64 = row.get(1)?;
            counts[key] = json!(count);
        }
        Ok(counts)
    }

    async fn stats_by_year(&self, include_archived: bool) -> Result<Value, EmailError> {
        let archived_clause = archived_filter(include_archived);
        let conn = self.db.connection().await?;
        let mut rows = conn
            .query(
                &format!(
                    "SELECT year, COUNT(*), SUM(size_bytes)
                     FROM email_index
                     WHERE user_id = ?1 AND deleted = 0 AND year IS NOT NULL {archived_clause}
                     GROUP BY year ORDER BY year"
                ),
                params![self.db.user_id()],
            )
            .await?;

        let mut by_year = serde_json::Map::new();
        while let Some(row) = rows.next().await? {
            let year: i64 = row.get(0)?;
            let count: i64 = row.get(1)?;
            let size: i64 = row.get(2)?;
            by_year.insert(
                year.to_string(),
                json!({"count": count, "total_size_bytes": size}),
            );
        }
        Ok(Value::Object(by_year))
    }

    async fn stats_by_size(
        &self,
        include_archived: bool,
        buckets: SizeBuckets,
    ) -> Result<Value, EmailError> {
        let archived_clause = archived_filter(include_archived);
        let conn = self.db.connection().await?;
        let mut rows = conn
            .query(
                &format!(
                    "SELECT
                        CASE
                            WHEN size_bytes <= ?2 THEN 'small'
                            WHEN size_bytes <= ?3 THEN 'medium'
                            ELSE 'large'
                        END AS bucket,
                        COUNT(*)
                     FROM email_index
                     WHERE user_id = ?1 AND deleted = 0 {archived_clause}
                     GROUP BY bucket"
                ),
                params![self.db.user_id(), buckets.small_max, buckets.medium_max],
            )
            .await?;

        let mut counts = json!({"small": 0, "medium": 0, "large": 0});
        while let Some(row) = rows.next().await? {
            let key: String = row.get(0)?;
            let count: i64 = row.get(1)?;
            counts[key] = json!(count);
        }
        Ok(counts)
    }

    async fn stats_by_archived(&self) -> Result<Value, EmailError> {
        let conn = self.db.connection().await?;
        let mut rows = conn
            .query(
                "SELECT archived, COUNT(*)
                 FROM email_index
                 WHERE user_id = ?1 AND deleted = 0
                 GROUP BY archived",
                params![self.db.user_id()],
            )
            .await?;

        let mut counts = json!({"archived": 0, "active": 0});
        while let Some(row) = rows.next().await? {
            let archived: i64 = row.get(0)?;
            let count: i64 = row.get(1)?;
            counts[if archived != 0 { "archived" } else { "active" }] = json!(count);
        }
        Ok(counts)
    }

    async fn stats_totals(&self, include_archived: bool) -> Result<Value, EmailError> {
        let archived_clause = archived_filter(include_archived);
        let conn = self.db.connection().await?;
        let mut rows = conn
            .query(
                &format!(
                    "SELECT COUNT(*), COALESCE(SUM(size_bytes), 0)
                     FROM email_index
                     WHERE user_id = ?1 AND deleted = 0 {archived_clause}"
                ),
                params![self.db.user_id()],
            )
            .await?;
        let row = rows.next().await?.ok_or_else(|| {
            EmailError::NotFound("totals query returned no row".to_string())
        })?;
        let count: i64 = row.get(0)?;
        let size: i64 = row.get(1)?;
        Ok(json!({"count": count, "total_size_bytes": size}))
    }
}

fn archived_filter(include_archived: bool) -> &'static str {
    if include_archived {
        ""
    } else {
        "AND archived = 0"
    }
}

fn placeholders_from(start: usize, count: usize) -> String {
    (0..count)
        .map(|i| format!("?{}", start + i))
        .collect::<Vec<_>>()
        .join(", ")
}

fn build_where(user_id: &str, criteria: &EmailCriteria) -> (String, Vec<SqlValue>) {
    let mut clauses = vec!["user_id = ?1".to_string()];
    let mut args: Vec<SqlValue> = vec![user_id.into()];

    if !criteria.include_deleted {
        clauses.push("deleted = 0".to_string());
    }
    if criteria.uncategorized_only {
        clauses.push("category IS NULL".to_string());
    } else if let Some(category) = criteria.category {
        args.push(category.as_str().into());
        clauses.push(format!("category = ?{}", args.len()));
    }
    if let Some(year) = criteria.year {
        args.push(year.into());
        clauses.push(format!("year = ?{}", args.len()));
    }
    if let Some(year_from) = criteria.year_from {
        args.push(year_from.into());
        clauses.push(format!("year >= ?{}", args.len()));
    }
    if let Some(year_to) = criteria.year_to {
        args.push(year_to.into());
        clauses.push(format!("year <= ?{}", args.len()));
    }
    if let Some(archived) = criteria.archived {
        args.push((archived as i64).into());
        clauses.push(format!("archived = ?{}", args.len()));
    }
    if let Some(size_min) = criteria.size_min {
        args.push(size_min.into());
        clauses.push(format!("size_bytes >= ?{}", args.len()));
    }
    if let Some(size_max) = criteria.size_max {
        args.push(size_max.into());
        clauses.push(format!("size_bytes <= ?{}", args.len()));
    }
    if let Some(date_from) = criteria.date_from {
        args.push(to_rfc3339(date_from).into());
        clauses.push(format!("date >= ?{}", args.len()));
    }
    if let Some(date_to) = criteria.date_to {
        args.push(to_rfc3339(date_to).into());
        clauses.push(format!("date <= ?{}", args.len()));
    }
    if let Some(sender) = &criteria.sender_contains {
        args.push(format!("%{sender}%").into());
        clauses.push(format!("sender LIKE ?{}", args.len()));
    }
    if let Some(query) = &criteria.query {
        args.push(format!("%{query}%").into());
        let idx = args.len();
        args.push(format!("%{query}%").into());
        clauses.push(format!("(subject LIKE ?{idx} OR snippet LIKE ?{})", args.len()));
    }
    if let Some(has_attachments) = criteria.has_attachments {
        args.push((has_attachments as i64).into());
        clauses.push(format!("has_attachments = ?{}", args.len()));
    }
    if let Some(level) = &criteria.importance_level {
        args.push(level.as_str().into());
        clauses.push(format!("importance_level = ?{}", args.len()));
    }
    for label in &criteria.labels {
        args.push(label.as_str().into());
        clauses.push(format!(
            "EXISTS (SELECT 1 FROM json_each(email_index.labels_json) WHERE json_each.value = ?{})",
            args.len()
        ));
    }

    (clauses.join(" AND "), args)
}

fn row_to_email(row: Row) -> Result<EmailIndex, EmailError> {
    let recipients_json: String = row.get(4)?;
    let labels_json: String = row.get(7)?;
    let has_attachments: i64 = row.get(8)?;
    let date: Option<String> = row.get(9)?;
    let category: Option<String> = row.get(12)?;
    let archived: i64 = row.get(13)?;
    let archive_date: Option<String> = row.get(14)?;
    let deleted: i64 = row.get(16)?;
    let matched_rules_json: Option<String> = row.get(19)?;
    let analysis_timestamp: Option<String> = row.get(26)?;
    let created_at: String = row.get(28)?;
    let updated_at: String = row.get(29)?;

    Ok(EmailIndex {
        id: row.get(0)?,
        user_id: row.get(1)?,
        thread_id: row.get(2)?,
        sender: row.get(3)?,
        recipients: serde_json::from_str(&recipients_json)?,
        subject: row.get(5)?,
        snippet: row.get(6)?,
        labels: serde_json::from_str(&labels_json)?,
        has_attachments: has_attachments != 0,
        date: parse_optional_ts(date)?,
        year: row.get(10)?,
        size_bytes: row.get(11)?,
        category: category.as_deref().and_then(PriorityCategory::from_str),
        archived: archived != 0,
        archive_date: parse_optional_ts(archive_date)?,
        archive_location: row.get(15)?,
        deleted: deleted != 0,
        importance_level: row.get(17)?,
        importance_score: row.get(18)?,
        importance_matched_rules: matched_rules_json
            .map(|json| serde_json::from_str(&json))
            .transpose()?
            .unwrap_or_default(),
        age_category: row.get(20)?,
        size_category: row.get(21)?,
        gmail_category: row.get(22)?,
        spam_score: row.get(23)?,
        promotional_score: row.get(24)?,
        social_score: row.get(25)?,
        analysis_timestamp: parse_optional_ts(analysis_timestamp)?,
        analysis_version: row.get(27)?,
        created_at: DateTime::parse_from_rfc3339(&created_at)?.with_timezone(&Utc),
        updated_at: DateTime::parse_from_rfc3339(&updated_at)?.with_timezone(&Utc),
    })
}

fn parse_optional_ts(value: Option<String>) -> Result<Option<DateTime<Utc>>, EmailError> {
    match value {
        Some(value) => Ok(Some(
            DateTime::parse_from_rfc3339(&value)?.with_timezone(&Utc),
        )),
        None => Ok(None),
    }
}

fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn to_rfc3339(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Millis, true)
}
