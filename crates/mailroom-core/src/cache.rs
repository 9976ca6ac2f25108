use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::RwLock;

pub const DEFAULT_TTL: Duration = Duration::from_secs(3600);

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache key {key:?} is outside the namespace of user {user_id:?}")]
    KeyOutsideNamespace { key: String, user_id: String },
}

#[derive(Debug, Clone)]
struct Entry {
    payload: Value,
    inserted: DateTime<Utc>,
    ttl: Duration,
}

impl Entry {
    fn expired(&self, now: DateTime<Utc>) -> bool {
        match chrono::Duration::from_std(self.ttl) {
            Ok(ttl) => now > self.inserted + ttl,
            Err(_) => false,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
}

/// Shared TTL cache. All users share the map, but every key is namespaced
/// `user:{user_id}:…` and [`UserCache::set`] refuses keys outside the
/// writing user's namespace, so entries can never collide across users.
///
/// Expiry is lazy on read; [`UserCache::clean_expired`] sweeps the rest and
/// is called from the server's housekeeping tick.
pub struct UserCache {
    entries: RwLock<HashMap<String, Entry>>,
    default_ttl: Duration,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl UserCache {
    pub fn new(default_ttl: Duration) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            default_ttl,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub async fn get(&self, key: &str) -> Option<Value> {
        let now = Utc::now();
        {
            let entries = self.entries.read().await;
            match entries.get(key) {
                Some(entry) if !entry.expired(now) => {
                    self.hits.fetch_add(1, Ordering::Relaxed);
                    return Some(entry.payload.clone());
                }
                Some(_) => {}
                None => {
                    self.misses.fetch_add(1, Ordering::Relaxed);
                    return None;
                }
            }
        }

        // Entry was present but expired; drop it under the write lock.
        let mut entries = self.entries.write().await;
        if let Some(entry) = entries.get(key) {
            if entry.expired(now) {
                entries.remove(key);
            } else {
                self.hits.fetch_add(1, Ordering::Relaxed);
                return Some(entry.payload.clone());
            }
        }
        self.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    pub async fn set(
        &self,
        key: impl Into<String>,
        payload: Value,
        user_id: &str,
        ttl: Option<Duration>,
    ) -> Result<(), CacheError> {
        let key = key.into();
        if !key.starts_with(&user_prefix(user_id)) {
            return Err(CacheError::KeyOutsideNamespace {
                key,
                user_id: user_id.to_string(),
            });
        }

        let entry = Entry {
            payload,
            inserted: Utc::now(),
            ttl: ttl.unwrap_or(self.default_ttl),
        };
        let mut entries = self.entries.write().await;
        entries.insert(key, entry);
        Ok(())
    }

    pub async fn delete(&self, key: &str) {
        let mut entries = self.entries.write().await;
        entries.remove(key);
    }

    /// Drop every key belonging to one user.
    pub async fn flush_user(&self, user_id: &str) {
        let prefix = user_prefix(user_id);
        let mut entries = self.entries.write().await;
        entries.retain(|key, _| !key.starts_with(&prefix));
    }

    /// Drop every key under an exact prefix, e.g. one user's email-list
    /// entries without touching their analyzer caches.
    pub async fn flush_prefix(&self, prefix: &str) {
        let mut entries = self.entries.write().await;
        entries.retain(|key, _| !key.starts_with(prefix));
    }

    pub async fn flush(&self) {
        let mut entries = self.entries.write().await;
        entries.clear();
    }

    pub async fn clean_expired(&self) -> usize {
        let now = Utc::now();
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|_, entry| !entry.expired(now));
        before - entries.len()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }
}

impl Default for UserCache {
    fn default() -> Self {
        Self::new(DEFAULT_TTL)
    }
}

fn user_prefix(user_id: &str) -> String {
    format!("user:{user_id}:")
}

/// `user:{uid}:email-list:{fingerprint(options)}`
pub fn email_list_key(user_id: &str, options: &Value) -> String {
    format!("user:{user_id}:email-list:{}", fingerprint(options))
}

/// `user:{uid}:email:{email_id}`
pub fn email_key(user_id: &str, email_id: &str) -> String {
    format!("user:{user_id}:email:{email_id}")
}

/// `user:{uid}:category-stats`
pub fn category_stats_key(user_id: &str) -> String {
    format!("user:{user_id}:category-stats")
}

/// Analyzer cache keys: `user:{uid}:{analyzer}:{fingerprint}`.
pub fn analyzer_key(user_id: &str, analyzer: &str, fingerprint: &str) -> String {
    format!("user:{user_id}:{analyzer}:{fingerprint}")
}

/// Canonical JSON for fingerprints. `serde_json`'s map keeps keys sorted,
/// so serializing is stable for equal values regardless of build order.
pub fn fingerprint(value: &Value) -> String {
    serde_json::to_string(value).unwrap_or_default()
}
