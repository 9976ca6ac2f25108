use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::warn;

use crate::analysis::{Analyzer, AnalyzerError, PartialVerdict};
use crate::cache::{UserCache, analyzer_key, fingerprint};
use crate::labels::{SemanticBucket, SystemLabel, bucket_for};
use crate::rules::EmailContext;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LabelResult {
    pub gmail_category: SemanticBucket,
    pub spam_score: f64,
    pub promotional_score: f64,
    pub social_score: f64,
}

// Explicit system labels carry more weight than fuzzy name matches.
const EXPLICIT_WEIGHT: f64 = 0.8;
const EXPLICIT_SPAM_WEIGHT: f64 = 1.0;
const FUZZY_WEIGHT: f64 = 0.3;

const FUZZY_SIGNALS: &[(&str, SemanticBucket)] = &[
    ("spam", SemanticBucket::Spam),
    ("suspicious", SemanticBucket::Spam),
    ("junk", SemanticBucket::Spam),
    ("promo", SemanticBucket::Promotions),
    ("newsletter", SemanticBucket::Promotions),
    ("deal", SemanticBucket::Promotions),
    ("social", SemanticBucket::Social),
    ("friend", SemanticBucket::Social),
    ("notification", SemanticBucket::Updates),
    ("update", SemanticBucket::Updates),
    ("forum", SemanticBucket::Forums),
    ("digest", SemanticBucket::Forums),
];

/// Maps an email's labels to a semantic bucket plus spam/promotional/social
/// scores in [0, 1]. Classification is order-independent: labels are sorted
/// before fingerprinting so equal label sets share a cache entry.
pub struct LabelClassifier {
    cache: Arc<UserCache>,
    cache_ttl: Duration,
}

impl LabelClassifier {
    pub fn new(cache: Arc<UserCache>, cache_ttl_secs: u64) -> Self {
        Self {
            cache,
            cache_ttl: Duration::from_secs(cache_ttl_secs),
        }
    }

    pub fn classify(&self, labels: &[String]) -> LabelResult {
        let mut scores: HashMap<SemanticBucket, f64> = HashMap::new();

        for label in labels {
            if let Some(system) = SystemLabel::from_str(label) {
                if let Some(bucket) = bucket_for(system) {
                    let weight = if bucket == SemanticBucket::Spam {
                        EXPLICIT_SPAM_WEIGHT
                    } else {
                        EXPLICIT_WEIGHT
                    };
                    *scores.entry(bucket).or_default() += weight;
                }
                continue;
            }

            let lowered = label.to_lowercase();
            for (needle, bucket) in FUZZY_SIGNALS {
                if lowered.contains(needle) {
                    *scores.entry(*bucket).or_default() += FUZZY_WEIGHT;
                }
            }
        }

        for value in scores.values_mut() {
            *value = value.min(1.0);
        }

        let gmail_category = scores
            .iter()
            .filter(|(_, score)| **score > 0.0)
            .max_by(|(a_bucket, a_score), (b_bucket, b_score)| {
                a_score
                    .partial_cmp(b_score)
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then_with(|| b_bucket.precedence().cmp(&a_bucket.precedence()))
            })
            .map(|(bucket, _)| *bucket)
            .unwrap_or(SemanticBucket::Primary);

        LabelResult {
            gmail_category,
            spam_score: scores.get(&SemanticBucket::Spam).copied().unwrap_or(0.0),
            promotional_score: scores
                .get(&SemanticBucket::Promotions)
                .copied()
                .unwrap_or(0.0),
            social_score: scores.get(&SemanticBucket::Social).copied().unwrap_or(0.0),
        }
    }
}

#[async_trait]
impl Analyzer for LabelClassifier {
    fn name(&self) -> &'static str {
        "label"
    }

    async fn analyze(&self, ctx: &EmailContext) -> Result<PartialVerdict, AnalyzerError> {
        let mut sorted = ctx.labels.clone();
        sorted.sort();
        let key = analyzer_key(
            &ctx.user_id,
            "label",
            &fingerprint(&json!({"labels": sorted})),
        );

        if let Some(cached) = self.cache.get(&key).await {
            if let Ok(result) = serde_json::from_value::<LabelResult>(cached) {
                return Ok(PartialVerdict {
                    label: Some(result),
                    ..Default::default()
                });
            }
        }

        let result = self.classify(&ctx.labels);

        match serde_json::to_value(&result) {
            Ok(payload) => {
                if let Err(err) = self
                    .cache
                    .set(key, payload, &ctx.user_id, Some(self.cache_ttl))
                    .await
                {
                    warn!(error = %err, "label cache write failed");
                }
            }
            Err(err) => warn!(error = %err, "label result not serializable for cache"),
        }

        Ok(PartialVerdict {
            label: Some(result),
            ..Default::default()
        })
    }
}
