use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use thiserror::Error;

use crate::gmail::MailApi;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("no credentials for session {0}")]
    NoCredentials(String),
    #[error("token store error: {0}")]
    TokenStore(String),
    #[error("vendor client error: {0}")]
    Client(String),
}

/// OAuth acquisition and refresh live outside the core. The server only
/// needs these two operations from whatever authenticator it is wired to.
#[async_trait]
pub trait Authenticator: Send + Sync {
    /// A ready-to-use vendor handle for the given session.
    async fn client_for(&self, session_id: &str) -> Result<Arc<dyn MailApi>, AuthError>;

    /// Whether the session still has usable credentials.
    async fn valid(&self, session_id: &str) -> bool;
}

/// At-rest persistence for opaque credential blobs, keyed by session. The
/// blob arrives already encrypted by the authenticator (the configured
/// `TOKEN_ENCRYPTION_KEY` is its concern); this store only moves bytes.
#[async_trait]
pub trait TokenStore: Send + Sync {
    async fn save(&self, session_id: &str, blob: &[u8]) -> Result<(), AuthError>;
    async fn load(&self, session_id: &str) -> Result<Option<Vec<u8>>, AuthError>;
    async fn delete(&self, session_id: &str) -> Result<(), AuthError>;
}

/// Token files under `{storage_root}/tokens/{session_id}.token`, base64 so
/// the payload survives text-mode tooling.
pub struct FileTokenStore {
    dir: PathBuf,
}

impl FileTokenStore {
    pub fn new(storage_root: impl Into<PathBuf>) -> Self {
        Self {
            dir: storage_root.into().join("tokens"),
        }
    }

    fn path_for(&self, session_id: &str) -> Result<PathBuf, AuthError> {
        let sane = session_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-');
        if session_id.is_empty() || !sane {
            return Err(AuthError::TokenStore(format!(
                "invalid session id {session_id:?}"
            )));
        }
        Ok(self.dir.join(format!("{session_id}.token")))
    }
}

#[async_trait]
impl TokenStore for FileTokenStore {
    async fn save(&self, session_id: &str, blob: &[u8]) -> Result<(), AuthError> {
        let path = self.path_for(session_id)?;
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|err| AuthError::TokenStore(err.to_string()))?;
        tokio::fs::write(&path, BASE64.encode(blob))
            .await
            .map_err(|err| AuthError::TokenStore(err.to_string()))
    }

    async fn load(&self, session_id: &str) -> Result<Option<Vec<u8>>, AuthError> {
        let path = self.path_for(session_id)?;
        let encoded = match tokio::fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(AuthError::TokenStore(err.to_string())),
        };
        BASE64
            .decode(encoded.trim())
            .map(Some)
            .map_err(|err| AuthError::TokenStore(err.to_string()))
    }

    async fn delete(&self, session_id: &str) -> Result<(), AuthError> {
        let path = self.path_for(session_id)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(AuthError::TokenStore(err.to_string())),
        }
    }
}

/// Authenticator that hands every session the same vendor handle. Used in
/// single-user deployments and tests; multi-tenant deployments wire in a
/// real OAuth authenticator instead.
pub struct StaticAuthenticator {
    api: Arc<dyn MailApi>,
}

impl StaticAuthenticator {
    pub fn new(api: Arc<dyn MailApi>) -> Self {
        Self { api }
    }
}

#[async_trait]
impl Authenticator for StaticAuthenticator {
    async fn client_for(&self, _session_id: &str) -> Result<Arc<dyn MailApi>, AuthError> {
        Ok(self.api.clone())
    }

    async fn valid(&self, _session_id: &str) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn token_store_round_trips_blobs() {
        let dir = TempDir::new().expect("temp dir");
        let store = FileTokenStore::new(dir.path());

        store.save("abc-123", b"refresh-token").await.expect("save");
        let loaded = store.load("abc-123").await.expect("load").expect("present");
        assert_eq!(loaded, b"refresh-token");

        store.delete("abc-123").await.expect("delete");
        assert!(store.load("abc-123").await.expect("load").is_none());
    }

    #[tokio::test]
    async fn missing_token_loads_as_none() {
        let dir = TempDir::new().expect("temp dir");
        let store = FileTokenStore::new(dir.path());
        assert!(store.load("never-saved").await.expect("load").is_none());
    }

    #[tokio::test]
    async fn hostile_session_ids_are_rejected() {
        let dir = TempDir::new().expect("temp dir");
        let store = FileTokenStore::new(dir.path());
        let err = store.save("../escape", b"x").await.expect_err("reject");
        assert!(matches!(err, AuthError::TokenStore(_)));
    }

    #[tokio::test]
    async fn stored_file_is_base64_not_plaintext() {
        let dir = TempDir::new().expect("temp dir");
        let store = FileTokenStore::new(dir.path());
        store.save("abc", b"secret-bytes").await.expect("save");

        let raw = std::fs::read_to_string(dir.path().join("tokens/abc.token")).expect("read");
        assert!(!raw.contains("secret-bytes"));
        assert_eq!(BASE64.decode(raw.trim()).expect("decode"), b"secret-bytes");
    }
}
