use std::sync::Arc;

use thiserror::Error;
use tracing::{info, warn};

use crate::auth::Authenticator;
use crate::cache::UserCache;
use crate::config::Config;
use crate::factory::{FactoryError, UserDbFactory};
use crate::gmail::MailApi;
use crate::jobs::queue::JobQueue;
use crate::jobs::store::{JobStatusStore, JobStoreError};
use crate::sessions::SessionManager;

#[derive(Debug, Error)]
pub enum ResourceError {
    #[error("failed to prepare storage root: {0}")]
    Io(#[from] std::io::Error),
    #[error("factory error: {0}")]
    Factory(#[from] FactoryError),
    #[error("job store error: {0}")]
    JobStore(#[from] JobStoreError),
}

/// The only process-wide mutable state: cache, queue, job store, DB
/// factory, sessions. Built once at startup and passed explicitly; nothing
/// else is global.
pub struct Resources {
    pub config: Config,
    pub factory: Arc<UserDbFactory>,
    pub cache: Arc<UserCache>,
    pub sessions: Arc<SessionManager>,
    pub queue: Arc<JobQueue>,
    pub store: Arc<JobStatusStore>,
    pub authenticator: Option<Arc<dyn Authenticator>>,
}

impl Resources {
    pub async fn build(
        config: Config,
        authenticator: Option<Arc<dyn Authenticator>>,
    ) -> Result<Arc<Self>, ResourceError> {
        tokio::fs::create_dir_all(&config.storage.path).await?;

        let factory = Arc::new(UserDbFactory::new(config.storage.path.clone()));
        let store = Arc::new(JobStatusStore::new(factory.clone())?);

        Ok(Arc::new(Self {
            factory,
            cache: Arc::new(UserCache::default()),
            sessions: Arc::new(SessionManager::new(config.sessions.ttl_minutes)),
            queue: Arc::new(JobQueue::new()),
            store,
            authenticator,
            config,
        }))
    }

    /// Vendor handle for one session, when an authenticator is wired and
    /// has credentials. Absence degrades vendor sync, never local state.
    pub async fn mail_for(&self, session_id: &str) -> Option<Arc<dyn MailApi>> {
        let authenticator = self.authenticator.as_ref()?;
        match authenticator.client_for(session_id).await {
            Ok(api) => Some(api),
            Err(err) => {
                warn!(session_id, error = %err, "no vendor client for session");
                None
            }
        }
    }

    /// Startup reconciliation: open every user database already on disk,
    /// reap orphaned IN_PROGRESS jobs, and re-enqueue surviving PENDING
    /// rows into the fresh in-memory queue.
    pub async fn recover(&self) -> Result<(), ResourceError> {
        let users_dir = self.factory.root().join("users");
        let mut entries = match tokio::fs::read_dir(&users_dir).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(err) => return Err(err.into()),
        };

        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            let Some(user_id) = entry.file_name().to_str().map(|s| s.to_string()) else {
                continue;
            };
            if let Err(err) = self.factory.database_for(&user_id).await {
                warn!(user_id, error = %err, "skipping unrecoverable user directory");
                continue;
            }
            let report = self.store.recover_user(&user_id, &self.queue).await?;
            if report.orphaned > 0 || report.requeued > 0 {
                info!(
                    user_id,
                    orphaned = report.orphaned,
                    requeued = report.requeued,
                    "recovered job state"
                );
            }
        }
        Ok(())
    }

    /// Periodic sweep: expired cache entries, expired sessions, and jobs
    /// past the retention window.
    pub async fn housekeep(&self) {
        let swept_cache = self.cache.clean_expired().await;
        let swept_sessions = self.sessions.sweep_expired().await;

        let cutoff =
            chrono::Utc::now() - chrono::Duration::days(self.config.jobs.retention_days as i64);
        let mut swept_jobs = 0u64;
        for user_id in self.factory.known_users().await {
            match self.store.delete_older_than(&user_id, cutoff).await {
                Ok(count) => swept_jobs += count,
                Err(err) => warn!(user_id, error = %err, "job retention sweep failed"),
            }
        }

        if swept_cache > 0 || swept_sessions > 0 || swept_jobs > 0 {
            info!(
                cache = swept_cache,
                sessions = swept_sessions,
                jobs = swept_jobs,
                "housekeeping sweep"
            );
        }
    }
}
