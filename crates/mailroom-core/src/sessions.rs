use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::RwLock;
use uuid::Uuid;

/// The `{user_id, session_id}` pair every tool call (and every job's
/// request params) carries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserContext {
    pub user_id: String,
    pub session_id: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Session {
    pub session_id: String,
    pub user_id: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub last_accessed: DateTime<Utc>,
}

#[derive(Debug, Error, PartialEq)]
pub enum SessionError {
    #[error("unknown session")]
    NotFound,
    #[error("session does not belong to the presented user")]
    UserMismatch,
    #[error("session expired")]
    Expired,
}

/// In-memory session registry. Sessions bind a transport caller to a user
/// id with sliding expiry: every successful validation moves
/// `last_accessed` strictly forward and pushes `expires_at` out by the ttl.
///
/// Jobs submitted under a session keep running after it expires; only new
/// tool calls are refused.
pub struct SessionManager {
    sessions: RwLock<HashMap<String, Session>>,
    ttl: Duration,
}

impl SessionManager {
    pub fn new(ttl_minutes: i64) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            ttl: Duration::minutes(ttl_minutes.max(1)),
        }
    }

    pub async fn create(&self, user_id: impl Into<String>) -> Session {
        let now = Utc::now();
        let session = Session {
            session_id: Uuid::new_v4().to_string(),
            user_id: user_id.into(),
            created_at: now,
            expires_at: now + self.ttl,
            last_accessed: now,
        };

        let mut sessions = self.sessions.write().await;
        sessions.insert(session.session_id.clone(), session.clone());
        session
    }

    /// Validate that `session_id` exists, belongs to `user_id`, and has not
    /// expired. On success the session is extended and the refreshed copy
    /// returned.
    pub async fn validate(
        &self,
        session_id: &str,
        user_id: &str,
    ) -> Result<Session, SessionError> {
        let now = Utc::now();
        let mut sessions = self.sessions.write().await;
        let session = sessions.get_mut(session_id).ok_or(SessionError::NotFound)?;

        if session.user_id != user_id {
            return Err(SessionError::UserMismatch);
        }
        if now > session.expires_at {
            sessions.remove(session_id);
            return Err(SessionError::Expired);
        }

        // last_accessed must move strictly forward even on same-millisecond
        // validations.
        session.last_accessed = now.max(session.last_accessed + Duration::nanoseconds(1));
        session.expires_at = now + self.ttl;
        Ok(session.clone())
    }

    pub async fn invalidate(&self, session_id: &str) -> bool {
        let mut sessions = self.sessions.write().await;
        sessions.remove(session_id).is_some()
    }

    pub async fn sweep_expired(&self) -> usize {
        let now = Utc::now();
        let mut sessions = self.sessions.write().await;
        let before = sessions.len();
        sessions.retain(|_, session| now <= session.expires_at);
        before - sessions.len()
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn create_then_validate_extends_session() {
        let manager = SessionManager::new(60);
        let session = manager.create("user-1").await;

        let refreshed = manager
            .validate(&session.session_id, "user-1")
            .await
            .expect("valid session");
        assert!(refreshed.last_accessed > session.last_accessed);
        assert!(refreshed.expires_at >= session.expires_at);
    }

    #[tokio::test]
    async fn validate_rejects_unknown_session() {
        let manager = SessionManager::new(60);
        let err = manager.validate("bogus", "user-1").await.unwrap_err();
        assert_eq!(err, SessionError::NotFound);
    }

    #[tokio::test]
    async fn validate_rejects_wrong_user() {
        let manager = SessionManager::new(60);
        let session = manager.create("user-1").await;
        let err = manager
            .validate(&session.session_id, "user-2")
            .await
            .unwrap_err();
        assert_eq!(err, SessionError::UserMismatch);
    }

    #[tokio::test]
    async fn invalidated_session_stops_validating() {
        let manager = SessionManager::new(60);
        let session = manager.create("user-1").await;
        assert!(manager.invalidate(&session.session_id).await);
        let err = manager
            .validate(&session.session_id, "user-1")
            .await
            .unwrap_err();
        assert_eq!(err, SessionError::NotFound);
    }

    #[tokio::test]
    async fn sweep_drops_expired_sessions() {
        let manager = SessionManager::new(60);
        let session = manager.create("user-1").await;

        {
            let mut sessions = manager.sessions.write().await;
            let entry = sessions.get_mut(&session.session_id).expect("entry");
            entry.expires_at = Utc::now() - Duration::seconds(1);
        }

        assert_eq!(manager.sweep_expired().await, 1);
        assert_eq!(manager.len().await, 0);
    }

    #[tokio::test]
    async fn expired_session_is_rejected_and_removed() {
        let manager = SessionManager::new(60);
        let session = manager.create("user-1").await;

        {
            let mut sessions = manager.sessions.write().await;
            let entry = sessions.get_mut(&session.session_id).expect("entry");
            entry.expires_at = Utc::now() - Duration::seconds(1);
        }

        let err = manager
            .validate(&session.session_id, "user-1")
            .await
            .unwrap_err();
        assert_eq!(err, SessionError::Expired);
        assert_eq!(manager.len().await, 0);
    }
}
