use std::collections::HashMap;
use std::path::PathBuf;

use thiserror::Error;
use tokio::sync::Mutex;
use tracing::info;

use crate::db::{Database, DbError};
use crate::migrations::{MigrationError, run_migrations};

/// A database handle that is already bound to one user. Repositories accept
/// only this type, so there is no way to query one user's store with another
/// user's id.
#[derive(Clone)]
pub struct UserDatabase {
    db: Database,
    user_id: String,
}

impl UserDatabase {
    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn db(&self) -> &Database {
        &self.db
    }

    pub async fn connection(&self) -> Result<libsql::Connection, DbError> {
        self.db.connection().await
    }
}

#[derive(Debug, Error)]
pub enum FactoryError {
    #[error("invalid user id: {0:?}")]
    InvalidUserId(String),
    #[error("failed to create storage directory: {0}")]
    Io(#[from] std::io::Error),
    #[error("database error: {0}")]
    Database(#[from] DbError),
    #[error("migration error: {0}")]
    Migration(#[from] MigrationError),
}

/// Opens and memoizes one database per user under the storage root. The
/// first open for a user creates `{root}/users/{user_id}/mailroom.db` and
/// runs migrations; later calls return the cached handle.
pub struct UserDbFactory {
    root: PathBuf,
    handles: Mutex<HashMap<String, UserDatabase>>,
}

impl UserDbFactory {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            handles: Mutex::new(HashMap::new()),
        }
    }

    pub fn root(&self) -> &std::path::Path {
        &self.root
    }

    pub async fn database_for(&self, user_id: &str) -> Result<UserDatabase, FactoryError> {
        validate_user_id(user_id)?;

        let mut handles = self.handles.lock().await;
        if let Some(handle) = handles.get(user_id) {
            return Ok(handle.clone());
        }

        let dir = self.root.join("users").join(user_id);
        tokio::fs::create_dir_all(&dir).await?;
        let db_path = dir.join("mailroom.db");
        let db = Database::open(&db_path).await?;
        run_migrations(&db).await?;
        info!(user_id, path = %db_path.display(), "opened user database");

        let handle = UserDatabase {
            db,
            user_id: user_id.to_string(),
        };
        handles.insert(user_id.to_string(), handle.clone());
        Ok(handle)
    }

    /// User ids with at least one opened handle this process.
    pub async fn known_users(&self) -> Vec<String> {
        let handles = self.handles.lock().await;
        handles.keys().cloned().collect()
    }
}

// User ids become directory names, so reject anything that could traverse
// or collide on the filesystem.
fn validate_user_id(user_id: &str) -> Result<(), FactoryError> {
    let acceptable = |c: char| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '@');
    if user_id.is_empty()
        || user_id.len() > 128
        || user_id.starts_with('.')
        || !user_id.chars().all(acceptable)
    {
        return Err(FactoryError::InvalidUserId(user_id.to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use libsql::params;
    use tempfile::TempDir;

    #[tokio::test]
    async fn first_open_creates_schema_and_later_opens_reuse_handle() {
        let dir = TempDir::new().expect("temp dir");
        let factory = UserDbFactory::new(dir.path());

        let first = factory.database_for("user-a").await.expect("open");
        assert_eq!(first.user_id(), "user-a");

        let conn = first.connection().await.expect("conn");
        let mut rows = conn
            .query(
                "SELECT name FROM sqlite_master WHERE type='table' AND name='email_index'",
                (),
            )
            .await
            .expect("query");
        assert!(rows.next().await.expect("row").is_some());

        let second = factory.database_for("user-a").await.expect("reopen");
        assert_eq!(second.user_id(), "user-a");
        assert_eq!(factory.known_users().await, vec!["user-a".to_string()]);
    }

    #[tokio::test]
    async fn users_get_distinct_database_files() {
        let dir = TempDir::new().expect("temp dir");
        let factory = UserDbFactory::new(dir.path());

        let a = factory.database_for("user-a").await.expect("open a");
        let b = factory.database_for("user-b").await.expect("open b");

        let conn_a = a.connection().await.expect("conn a");
        conn_a
            .execute(
                "INSERT INTO saved_searches (id, user_id, name, criteria_json, created_at, updated_at)
                 VALUES ('s1', 'user-a', 'mine', '{}', '2024-01-01T00:00:00Z', '2024-01-01T00:00:00Z')",
                (),
            )
            .await
            .expect("insert");

        let conn_b = b.connection().await.expect("conn b");
        let mut rows = conn_b
            .query(
                "SELECT COUNT(*) FROM saved_searches WHERE id = ?1",
                params!["s1"],
            )
            .await
            .expect("query");
        let count: i64 = rows
            .next()
            .await
            .expect("row")
            .expect("value")
            .get(0)
            .expect("count");
        assert_eq!(count, 0, "user-b must not observe user-a's write");
    }

    #[tokio::test]
    async fn hostile_user_ids_are_rejected() {
        let dir = TempDir::new().expect("temp dir");
        let factory = UserDbFactory::new(dir.path());

        for bad in ["", "../escape", "a/b", "a\\b", ".hidden", "user id"] {
            let err = factory.database_for(bad).await;
            assert!(
                matches!(err, Err(FactoryError::InvalidUserId(_))),
                "{bad:?} should be rejected"
            );
        }
    }
}
