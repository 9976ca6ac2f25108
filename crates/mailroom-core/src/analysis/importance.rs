use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, warn};

use crate::analysis::{Analyzer, AnalyzerError, PartialVerdict};
use crate::cache::{UserCache, analyzer_key, fingerprint};
use crate::config::{CategorizationConfig, FingerprintStrategy};
use crate::rules::{EmailContext, EvaluationContext, RuleError, RuleSet};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImportanceLevel {
    High,
    Medium,
    Low,
}

impl ImportanceLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            ImportanceLevel::High => "high",
            ImportanceLevel::Medium => "medium",
            ImportanceLevel::Low => "low",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImportanceResult {
    pub level: ImportanceLevel,
    pub score: f64,
    /// Ids of the rules that matched, in evaluation order.
    pub matched_rules: Vec<String>,
    pub confidence: f64,
    #[serde(default)]
    pub from_cache: bool,
}

/// Scores an email by evaluating every configured rule and summing the
/// matched scores. Rule evaluation errors are logged and the rule skipped;
/// cache errors are logged and treated as a miss. Neither fails the
/// analysis.
pub struct ImportanceAnalyzer {
    rules: RuleSet,
    high_threshold: f64,
    low_threshold: f64,
    cache: Arc<UserCache>,
    cache_enabled: bool,
    cache_ttl: Duration,
    strategy: FingerprintStrategy,
    eval: Mutex<EvaluationContext>,
}

impl ImportanceAnalyzer {
    pub fn from_config(
        config: &CategorizationConfig,
        cache: Arc<UserCache>,
    ) -> Result<Self, RuleError> {
        Ok(Self {
            rules: RuleSet::parse(&config.rules)?,
            high_threshold: config.high_threshold,
            low_threshold: config.low_threshold,
            cache,
            cache_enabled: config.cache_enabled,
            cache_ttl: Duration::from_secs(config.cache_ttl_secs),
            strategy: config.fingerprint.clone(),
            eval: Mutex::new(EvaluationContext::new()),
        })
    }

    fn cache_key(&self, ctx: &EmailContext) -> String {
        let value = match self.strategy {
            FingerprintStrategy::Partial => json!({
                "user": ctx.user_id,
                "email_id": ctx.email_id,
                "subject": ctx.subject,
                "sender": ctx.sender,
            }),
            FingerprintStrategy::Full => {
                let mut labels = ctx.labels.clone();
                labels.sort();
                json!({
                    "user": ctx.user_id,
                    "email_id": ctx.email_id,
                    "subject": ctx.subject,
                    "sender": ctx.sender,
                    "snippet": ctx.snippet,
                    "labels": labels,
                    "size": ctx.size_bytes,
                    "has_attachments": ctx.has_attachments,
                    "date": ctx.date.to_rfc3339(),
                })
            }
        };
        analyzer_key(&ctx.user_id, "importance", &fingerprint(&value))
    }

    fn evaluate_rules(&self, ctx: &EmailContext) -> ImportanceResult {
        let mut eval = self.eval.lock().expect("evaluation context lock");
        let mut score = 0.0;
        let mut matched_rules = Vec::new();
        let mut matched_priority_sum = 0.0;

        for rule in self.rules.rules() {
            match rule.evaluate(ctx, &mut eval) {
                Ok(outcome) if outcome.matched => {
                    score += outcome.score;
                    matched_priority_sum += rule.priority as f64;
                    matched_rules.push(rule.id.clone());
                }
                Ok(_) => {}
                Err(err) => {
                    warn!(rule_id = %rule.id, error = %err, "rule evaluation failed, skipping");
                }
            }
        }

        let level = if score >= self.high_threshold {
            ImportanceLevel::High
        } else if score <= self.low_threshold {
            ImportanceLevel::Low
        } else {
            ImportanceLevel::Medium
        };

        let match_ratio = if self.rules.is_empty() {
            0.0
        } else {
            matched_rules.len() as f64 / self.rules.len() as f64
        };
        let confidence = (match_ratio + matched_priority_sum / 100.0).clamp(0.0, 1.0);

        ImportanceResult {
            level,
            score,
            matched_rules,
            confidence,
            from_cache: false,
        }
    }
}

#[async_trait]
impl Analyzer for ImportanceAnalyzer {
    fn name(&self) -> &'static str {
        "importance"
    }

    async fn analyze(&self, ctx: &EmailContext) -> Result<PartialVerdict, AnalyzerError> {
        let key = self.cache_key(ctx);

        if self.cache_enabled {
            if let Some(cached) = self.cache.get(&key).await {
                match serde_json::from_value::<ImportanceResult>(cached) {
                    Ok(mut result) => {
                        result.from_cache = true;
                        debug!(email_id = %ctx.email_id, "importance cache hit");
                        return Ok(PartialVerdict {
                            importance: Some(result),
                            ..Default::default()
                        });
                    }
                    Err(err) => {
                        warn!(error = %err, "stale importance cache entry, re-evaluating");
                    }
                }
            }
        }

        let result = self.evaluate_rules(ctx);

        if self.cache_enabled {
            match serde_json::to_value(&result) {
                Ok(payload) => {
                    if let Err(err) = self
                        .cache
                        .set(key, payload, &ctx.user_id, Some(self.cache_ttl))
                        .await
                    {
                        warn!(error = %err, "importance cache write failed");
                    }
                }
                Err(err) => warn!(error = %err, "importance result not serializable for cache"),
            }
        }

        Ok(PartialVerdict {
            importance: Some(result),
            ..Default::default()
        })
    }
}
