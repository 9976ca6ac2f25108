use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use reqwest::{Client, StatusCode};
use serde_json::json;
use thiserror::Error;
use tokio::time::sleep;
use tracing::warn;

use crate::gmail::types::{GmailMessage, MessageList};

const DEFAULT_API_BASE: &str = "https://gmail.googleapis.com/gmail/v1/users/me";
const MAX_ATTEMPTS: u32 = 3;

/// Batches at or under this size fall back to per-message fetches when the
/// batch call keeps failing.
const INDIVIDUAL_FALLBACK_MAX: usize = 10;

#[derive(Debug, Error)]
pub enum MailApiError {
    #[error("unauthorized")]
    Unauthorized,
    #[error("rate limited")]
    RateLimited,
    #[error("message not found: {0}")]
    NotFound(String),
    #[error("vendor server error ({0})")]
    Server(u16),
    #[error("http error: {0}")]
    Http(String),
    #[error("decode error: {0}")]
    Decode(String),
}

impl MailApiError {
    /// Transient failures are retry candidates; the rest fail fast.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            MailApiError::RateLimited | MailApiError::Server(_) | MailApiError::Http(_)
        )
    }
}

/// The vendor primitives the core depends on. Everything above this trait
/// is vendor-agnostic; tests substitute their own implementation.
#[async_trait]
pub trait MailApi: Send + Sync {
    async fn list_messages(
        &self,
        query: Option<&str>,
        page_token: Option<&str>,
        max_results: u32,
    ) -> Result<MessageList, MailApiError>;

    async fn get_message(&self, message_id: &str) -> Result<GmailMessage, MailApiError>;

    async fn batch_modify(
        &self,
        message_ids: &[String],
        add_labels: &[String],
        remove_labels: &[String],
    ) -> Result<(), MailApiError>;

    async fn delete_message(&self, message_id: &str) -> Result<(), MailApiError>;
}

/// Retry a transient-failing call with bounded exponential backoff and
/// jitter. Non-transient errors return immediately.
pub async fn with_backoff<T, F, Fut>(mut op: F) -> Result<T, MailApiError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, MailApiError>>,
{
    let mut attempt = 0u32;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_transient() && attempt + 1 < MAX_ATTEMPTS => {
                attempt += 1;
                let backoff = backoff_with_jitter(attempt);
                warn!(attempt, error = %err, "vendor call failed, retrying");
                sleep(backoff).await;
            }
            Err(err) => return Err(err),
        }
    }
}

fn backoff_with_jitter(attempt: u32) -> Duration {
    let base_millis = 250u64.saturating_mul(2u64.saturating_pow(attempt.min(6)));
    let capped = base_millis.min(5_000);
    let factor: f64 = rand::thread_rng().gen_range(0.75..=1.25);
    Duration::from_millis((capped as f64 * factor) as u64)
}

/// Fetch a batch of messages with backoff. If the batch keeps failing and
/// is small enough, retry each message individually; either way the result
/// carries a per-message outcome so one bad message never sinks the batch.
pub async fn fetch_batch(
    api: &dyn MailApi,
    message_ids: &[String],
) -> Vec<(String, Result<GmailMessage, MailApiError>)> {
    let mut results = Vec::with_capacity(message_ids.len());
    let mut failures = 0usize;

    for message_id in message_ids {
        let outcome = with_backoff(|| api.get_message(message_id)).await;
        if outcome.is_err() {
            failures += 1;
        }
        results.push((message_id.clone(), outcome));
    }

    // Small batches get one more individual pass over the failures.
    if failures > 0 && message_ids.len() <= INDIVIDUAL_FALLBACK_MAX {
        for (message_id, outcome) in results.iter_mut() {
            if outcome.is_err() {
                *outcome = api.get_message(message_id).await;
            }
        }
    }

    results
}

/// Thin REST implementation over the vendor HTTP surface. The access token
/// is injected per session by the authenticator; this client never
/// refreshes tokens itself.
pub struct GmailRestClient {
    http: Client,
    api_base: String,
    access_token: String,
}

impl GmailRestClient {
    pub fn new(access_token: impl Into<String>, timeout: Duration) -> Result<Self, MailApiError> {
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| MailApiError::Http(err.to_string()))?;
        Ok(Self {
            http,
            api_base: DEFAULT_API_BASE.to_string(),
            access_token: access_token.into(),
        })
    }

    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = api_base.into();
        self
    }

    fn map_status(status: StatusCode, message_id: Option<&str>) -> Option<MailApiError> {
        match status {
            StatusCode::UNAUTHORIZED => Some(MailApiError::Unauthorized),
            StatusCode::TOO_MANY_REQUESTS | StatusCode::FORBIDDEN => {
                // 403 usually means userRateLimitExceeded on this API.
                Some(MailApiError::RateLimited)
            }
            StatusCode::NOT_FOUND => Some(MailApiError::NotFound(
                message_id.unwrap_or("unknown").to_string(),
            )),
            status if status.is_server_error() => Some(MailApiError::Server(status.as_u16())),
            status if !status.is_success() => Some(MailApiError::Http(status.to_string())),
            _ => None,
        }
    }

    async fn check(
        response: reqwest::Response,
        message_id: Option<&str>,
    ) -> Result<reqwest::Response, MailApiError> {
        if let Some(err) = Self::map_status(response.status(), message_id) {
            return Err(err);
        }
        Ok(response)
    }
}

#[async_trait]
impl MailApi for GmailRestClient {
    async fn list_messages(
        &self,
        query: Option<&str>,
        page_token: Option<&str>,
        max_results: u32,
    ) -> Result<MessageList, MailApiError> {
        let url = format!("{}/messages", self.api_base);
        let mut request = self
            .http
            .get(&url)
            .bearer_auth(&self.access_token)
            .query(&[("maxResults", max_results.to_string())]);
        if let Some(q) = query {
            request = request.query(&[("q", q)]);
        }
        if let Some(token) = page_token {
            request = request.query(&[("pageToken", token)]);
        }

        let response = request
            .send()
            .await
            .map_err(|err| MailApiError::Http(err.to_string()))?;
        let response = Self::check(response, None).await?;
        response
            .json()
            .await
            .map_err(|err| MailApiError::Decode(err.to_string()))
    }

    async fn get_message(&self, message_id: &str) -> Result<GmailMessage, MailApiError> {
        let url = format!("{}/messages/{}", self.api_base, message_id);
        let response = self
            .http
            .get(&url)
            .bearer_auth(&self.access_token)
            .query(&[("format", "metadata")])
            .send()
            .await
            .map_err(|err| MailApiError::Http(err.to_string()))?;
        let response = Self::check(response, Some(message_id)).await?;
        response
            .json()
            .await
            .map_err(|err| MailApiError::Decode(err.to_string()))
    }

    async fn batch_modify(
        &self,
        message_ids: &[String],
        add_labels: &[String],
        remove_labels: &[String],
    ) -> Result<(), MailApiError> {
        if message_ids.is_empty() {
            return Ok(());
        }
        let url = format!("{}/messages/batchModify", self.api_base);
        let response = self
            .http
            .post(&url)
            .bearer_auth(&self.access_token)
            .json(&json!({
                "ids": message_ids,
                "addLabelIds": add_labels,
                "removeLabelIds": remove_labels,
            }))
            .send()
            .await
            .map_err(|err| MailApiError::Http(err.to_string()))?;
        Self::check(response, None).await?;
        Ok(())
    }

    async fn delete_message(&self, message_id: &str) -> Result<(), MailApiError> {
        let url = format!("{}/messages/{}/trash", self.api_base, message_id);
        let response = self
            .http
            .post(&url)
            .bearer_auth(&self.access_token)
            .send()
            .await
            .map_err(|err| MailApiError::Http(err.to_string()))?;
        Self::check(response, Some(message_id)).await?;
        Ok(())
    }
}
