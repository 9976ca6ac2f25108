use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::warn;

use crate::analysis::{Analyzer, AnalyzerError, PartialVerdict};
use crate::cache::{UserCache, analyzer_key, fingerprint};
use crate::config::CategorizationConfig;
use crate::rules::EmailContext;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgeCategory {
    Recent,
    Moderate,
    Old,
}

impl AgeCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgeCategory::Recent => "recent",
            AgeCategory::Moderate => "moderate",
            AgeCategory::Old => "old",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SizeCategory {
    Small,
    Medium,
    Large,
}

impl SizeCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            SizeCategory::Small => "small",
            SizeCategory::Medium => "medium",
            SizeCategory::Large => "large",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DateSizeResult {
    pub age_category: AgeCategory,
    pub size_category: SizeCategory,
    /// Weighted blend of recency and size signals in [0, 1].
    pub score: f64,
}

/// Buckets an email by age and size. Values exactly on a threshold fall
/// into the lower (younger/smaller) bucket; the tests pin this.
pub struct DateSizeAnalyzer {
    recent_days: i64,
    moderate_days: i64,
    small_max_bytes: i64,
    medium_max_bytes: i64,
    recency_weight: f64,
    size_weight: f64,
    cache: Arc<UserCache>,
    cache_ttl: Duration,
}

impl DateSizeAnalyzer {
    pub fn from_config(config: &CategorizationConfig, cache: Arc<UserCache>) -> Self {
        Self {
            recent_days: config.recent_days,
            moderate_days: config.moderate_days,
            small_max_bytes: config.small_max_bytes,
            medium_max_bytes: config.medium_max_bytes,
            recency_weight: config.recency_weight,
            size_weight: config.size_weight,
            cache,
            cache_ttl: Duration::from_secs(config.cache_ttl_secs),
        }
    }

    pub fn age_category(&self, age_days: i64) -> AgeCategory {
        if age_days <= self.recent_days {
            AgeCategory::Recent
        } else if age_days <= self.moderate_days {
            AgeCategory::Moderate
        } else {
            AgeCategory::Old
        }
    }

    pub fn size_category(&self, size_bytes: i64) -> SizeCategory {
        if size_bytes <= self.small_max_bytes {
            SizeCategory::Small
        } else if size_bytes <= self.medium_max_bytes {
            SizeCategory::Medium
        } else {
            SizeCategory::Large
        }
    }

    fn classify(&self, ctx: &EmailContext) -> DateSizeResult {
        let age_days = (Utc::now() - ctx.date).num_days().max(0);
        let age_category = self.age_category(age_days);
        let size_category = self.size_category(ctx.size_bytes);

        let recency_factor = match age_category {
            AgeCategory::Recent => 1.0,
            AgeCategory::Moderate => 0.5,
            AgeCategory::Old => 0.1,
        };
        let size_factor = match size_category {
            SizeCategory::Large => 1.0,
            SizeCategory::Medium => 0.5,
            SizeCategory::Small => 0.1,
        };
        let score = self.recency_weight * recency_factor + self.size_weight * size_factor;

        DateSizeResult {
            age_category,
            size_category,
            score,
        }
    }
}

#[async_trait]
impl Analyzer for DateSizeAnalyzer {
    fn name(&self) -> &'static str {
        "date_size"
    }

    async fn analyze(&self, ctx: &EmailContext) -> Result<PartialVerdict, AnalyzerError> {
        let key = analyzer_key(
            &ctx.user_id,
            "datesize",
            &fingerprint(&json!({
                "email_id": ctx.email_id,
                "date": ctx.date.to_rfc3339(),
                "size": ctx.size_bytes,
            })),
        );

        if let Some(cached) = self.cache.get(&key).await {
            if let Ok(result) = serde_json::from_value::<DateSizeResult>(cached) {
                return Ok(PartialVerdict {
                    date_size: Some(result),
                    ..Default::default()
                });
            }
        }

        let result = self.classify(ctx);

        match serde_json::to_value(&result) {
            Ok(payload) => {
                if let Err(err) = self
                    .cache
                    .set(key, payload, &ctx.user_id, Some(self.cache_ttl))
                    .await
                {
                    warn!(error = %err, "date/size cache write failed");
                }
            }
            Err(err) => warn!(error = %err, "date/size result not serializable for cache"),
        }

        Ok(PartialVerdict {
            date_size: Some(result),
            ..Default::default()
        })
    }
}
