pub mod date_size;
pub mod importance;
pub mod label_classifier;
pub mod orchestrator;

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::cache::UserCache;
use crate::config::CategorizationConfig;
use crate::labels::SemanticBucket;
use crate::rules::{EmailContext, RuleError};

pub use date_size::{AgeCategory, DateSizeAnalyzer, DateSizeResult, SizeCategory};
pub use importance::{ImportanceAnalyzer, ImportanceLevel, ImportanceResult};
pub use label_classifier::{LabelClassifier, LabelResult};
pub use orchestrator::{
    CategorizationOptions, CategorizationOutcome, CategoryCounts, EmailFailure, Orchestrator,
    OrchestratorError,
};

/// One analyzer's contribution to the final verdict. Each analyzer fills
/// exactly one field; the orchestrator merges them.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PartialVerdict {
    pub importance: Option<ImportanceResult>,
    pub date_size: Option<DateSizeResult>,
    pub label: Option<LabelResult>,
}

#[derive(Debug, Error)]
pub enum AnalyzerError {
    #[error("analyzer {analyzer} failed: {message}")]
    Failed {
        analyzer: &'static str,
        message: String,
    },
}

/// Analyzers are independent and composed by the orchestrator; none of
/// them sees another's output. Rule and cache failures are handled inside
/// `analyze` (logged, degraded), so an `Err` here means the analyzer could
/// not produce any verdict at all.
#[async_trait]
pub trait Analyzer: Send + Sync {
    fn name(&self) -> &'static str;
    async fn analyze(&self, ctx: &EmailContext) -> Result<PartialVerdict, AnalyzerError>;
}

impl std::fmt::Debug for dyn Analyzer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("dyn Analyzer").field("name", &self.name()).finish()
    }
}

/// Neutral stand-in used when an analyzer times out or errors: the middle
/// bucket everywhere, zero signal scores, no matched rules.
pub fn neutral_verdict(analyzer: &str) -> PartialVerdict {
    match analyzer {
        "importance" => PartialVerdict {
            importance: Some(ImportanceResult {
                level: ImportanceLevel::Medium,
                score: 0.0,
                matched_rules: Vec::new(),
                confidence: 0.0,
                from_cache: false,
            }),
            ..Default::default()
        },
        "date_size" => PartialVerdict {
            date_size: Some(DateSizeResult {
                age_category: AgeCategory::Moderate,
                size_category: SizeCategory::Medium,
                score: 0.5,
            }),
            ..Default::default()
        },
        "label" => PartialVerdict {
            label: Some(LabelResult {
                gmail_category: SemanticBucket::Primary,
                spam_score: 0.0,
                promotional_score: 0.0,
                social_score: 0.0,
            }),
            ..Default::default()
        },
        _ => PartialVerdict::default(),
    }
}

/// Builds the three analyzers from configuration with the shared cache
/// injected. Rule parsing happens here, so a config with an unknown rule
/// type fails construction instead of evaluation.
pub struct AnalyzerFactory;

impl AnalyzerFactory {
    pub fn build(
        config: &CategorizationConfig,
        cache: Arc<UserCache>,
    ) -> Result<Vec<Arc<dyn Analyzer>>, RuleError> {
        Ok(vec![
            Arc::new(ImportanceAnalyzer::from_config(config, cache.clone())?),
            Arc::new(DateSizeAnalyzer::from_config(config, cache.clone())),
            Arc::new(LabelClassifier::new(cache, config.cache_ttl_secs)),
        ])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn factory_builds_all_three_analyzers() {
        let config = CategorizationConfig::default();
        let cache = Arc::new(UserCache::default());
        let analyzers = AnalyzerFactory::build(&config, cache).expect("build");
        let names: Vec<&str> = analyzers.iter().map(|a| a.name()).collect();
        assert_eq!(names, vec!["importance", "date_size", "label"]);
    }

    #[test]
    fn factory_rejects_unknown_rule_types() {
        let mut config = CategorizationConfig::default();
        config.rules.push(json!({
            "id": "bad", "name": "Bad", "type": "llm", "weight": 1.0
        }));
        let cache = Arc::new(UserCache::default());
        let err = AnalyzerFactory::build(&config, cache).expect_err("must fail");
        assert!(matches!(err, RuleError::UnknownType(_)));
    }

    #[test]
    fn neutral_verdicts_use_middle_buckets() {
        let importance = neutral_verdict("importance");
        assert_eq!(
            importance.importance.expect("importance").level,
            ImportanceLevel::Medium
        );

        let date_size = neutral_verdict("date_size");
        let ds = date_size.date_size.expect("date_size");
        assert_eq!(ds.age_category, AgeCategory::Moderate);
        assert_eq!(ds.size_category, SizeCategory::Medium);

        let label = neutral_verdict("label");
        assert_eq!(
            label.label.expect("label").gmail_category,
            SemanticBucket::Primary
        );
    }
}
