use chrono::{DateTime, SecondsFormat, Utc};
use libsql::{Row, params};
use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

use crate::db::DbError;
use crate::emails::EmailCriteria;
use crate::factory::UserDatabase;

const SEARCH_COLUMNS: &str = "id, user_id, name, criteria_json, created_at, updated_at";

/// A user-named criteria bag. Executing a saved search is exactly running
/// `search_emails` with the stored criteria.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SavedSearch {
    pub id: String,
    pub user_id: String,
    pub name: String,
    pub criteria: EmailCriteria,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Error)]
pub enum SavedSearchError {
    #[error("database error: {0}")]
    Database(#[from] DbError),
    #[error("sql error: {0}")]
    Sql(#[from] libsql::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("datetime parse error: {0}")]
    DateTimeParse(#[from] chrono::ParseError),
    #[error("saved search not found: {0}")]
    NotFound(String),
    #[error("search name must not be empty")]
    EmptyName,
}

#[derive(Clone)]
pub struct SavedSearchRepository {
    db: UserDatabase,
}

impl SavedSearchRepository {
    pub fn new(db: UserDatabase) -> Self {
        Self { db }
    }

    /// Insert or overwrite by name; saving the same name twice updates the
    /// stored criteria.
    pub async fn save(
        &self,
        name: &str,
        criteria: &EmailCriteria,
    ) -> Result<SavedSearch, SavedSearchError> {
        if name.trim().is_empty() {
            return Err(SavedSearchError::EmptyName);
        }

        let id = Uuid::new_v4().to_string();
        let now = now_rfc3339();
        let criteria_json = serde_json::to_string(criteria)?;

        let conn = self.db.connection().await?;
        let mut rows = conn
            .query(
                &format!(
                    "INSERT INTO saved_searches (id, user_id, name, criteria_json, created_at, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?5)
                     ON CONFLICT(name) DO UPDATE SET
                        criteria_json = excluded.criteria_json,
                        updated_at = excluded.updated_at
                     RETURNING {SEARCH_COLUMNS}"
                ),
                params![id.as_str(), self.db.user_id(), name, criteria_json, now],
            )
            .await?;

        match rows.next().await? {
            Some(row) => row_to_search(row),
            None => Err(SavedSearchError::NotFound(name.to_string())),
        }
    }

    pub async fn list(&self) -> Result<Vec<SavedSearch>, SavedSearchError> {
        let conn = self.db.connection().await?;
        let mut rows = conn
            .query(
                &format!(
                    "SELECT {SEARCH_COLUMNS} FROM saved_searches
                     WHERE user_id = ?1 ORDER BY name"
                ),
                params![self.db.user_id()],
            )
            .await?;

        let mut searches = Vec::new();
        while let Some(row) = rows.next().await? {
            searches.push(row_to_search(row)?);
        }
        Ok(searches)
    }

    pub async fn get_by_name(&self, name: &str) -> Result<Option<SavedSearch>, SavedSearchError> {
        let conn = self.db.connection().await?;
        let mut rows = conn
            .query(
                &format!(
                    "SELECT {SEARCH_COLUMNS} FROM saved_searches
                     WHERE user_id = ?1 AND name = ?2"
                ),
                params![self.db.user_id(), name],
            )
            .await?;

        match rows.next().await? {
            Some(row) => Ok(Some(row_to_search(row)?)),
            None => Ok(None),
        }
    }

    pub async fn delete(&self, name: &str) -> Result<bool, SavedSearchError> {
        let conn = self.db.connection().await?;
        let deleted = conn
            .execute(
                "DELETE FROM saved_searches WHERE user_id = ?1 AND name = ?2",
                params![self.db.user_id(), name],
            )
            .await?;
        Ok(deleted > 0)
    }
}

fn row_to_search(row: Row) -> Result<SavedSearch, SavedSearchError> {
    let criteria_json: String = row.get(3)?;
    let created_at: String = row.get(4)?;
    let updated_at: String = row.get(5)?;

    Ok(SavedSearch {
        id: row.get(0)?,
        user_id: row.get(1)?,
        name: row.get(2)?,
        criteria: serde_json::from_str(&criteria_json)?,
        created_at: DateTime::parse_from_rfc3339(&created_at)?.with_timezone(&Utc),
        updated_at: DateTime::parse_from_rfc3339(&updated_at)?.with_timezone(&Utc),
    })
}

fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}
