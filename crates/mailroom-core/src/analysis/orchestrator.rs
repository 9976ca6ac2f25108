use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use thiserror::Error;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::analysis::{Analyzer, LabelResult, PartialVerdict, neutral_verdict};
use crate::analysis::date_size::{AgeCategory, SizeCategory};
use crate::analysis::importance::{ImportanceLevel, ImportanceResult};
use crate::cache::{self, UserCache};
use crate::config::CategorizationConfig;
use crate::emails::{EmailCriteria, EmailError, EmailIndex, EmailRepository, Enrichment, PriorityCategory};
use crate::labels::SystemLabel;
use crate::rules::EmailContext;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CategorizationOptions {
    #[serde(default)]
    pub force_refresh: bool,
    #[serde(default)]
    pub year: Option<i64>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategoryCounts {
    pub high: usize,
    pub medium: usize,
    pub low: usize,
}

impl CategoryCounts {
    fn record(&mut self, category: PriorityCategory) {
        match category {
            PriorityCategory::High => self.high += 1,
            PriorityCategory::Medium => self.medium += 1,
            PriorityCategory::Low => self.low += 1,
        }
    }

    pub fn total(&self) -> usize {
        self.high + self.medium + self.low
    }
}

/// A per-email failure recorded against the batch; the batch continues.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmailFailure {
    pub email_id: String,
    pub error: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AnalyzerInsights {
    pub top_importance_rules: Vec<RuleHitCount>,
    pub spam_detection_rate: f64,
    pub avg_confidence: f64,
    pub age_distribution: Distribution3,
    pub size_distribution: Distribution3,
    /// Importance cache hits observed during the run.
    pub cache_hits: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleHitCount {
    pub rule_id: String,
    pub count: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Distribution3 {
    pub recent_or_small: usize,
    pub moderate_or_medium: usize,
    pub old_or_large: usize,
}

impl Distribution3 {
    fn as_age_json(&self) -> Value {
        json!({
            "recent": self.recent_or_small,
            "moderate": self.moderate_or_medium,
            "old": self.old_or_large,
        })
    }

    fn as_size_json(&self) -> Value {
        json!({
            "small": self.recent_or_small,
            "medium": self.moderate_or_medium,
            "large": self.old_or_large,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CategorizationOutcome {
    pub processed: usize,
    pub category_counts: CategoryCounts,
    pub email_ids: Vec<String>,
    pub failures: Vec<EmailFailure>,
    /// Enrichment written per email, keyed by id.
    pub emails: Vec<Value>,
    pub insights: AnalyzerInsights,
}

impl CategorizationOutcome {
    /// Shape stored in the job's results column and returned by
    /// `categorize_emails`.
    pub fn to_results_json(&self) -> Value {
        json!({
            "processed": self.processed,
            "category_counts": {
                "high": self.category_counts.high,
                "medium": self.category_counts.medium,
                "low": self.category_counts.low,
            },
            "email_ids": self.email_ids,
            "error_count": self.failures.len(),
            "errors": self.failures,
            "emails": self.emails,
            "analyzer_insights": {
                "top_importance_rules": self.insights.top_importance_rules,
                "spam_detection_rate": self.insights.spam_detection_rate,
                "avg_confidence": self.insights.avg_confidence,
                "age_distribution": self.insights.age_distribution.as_age_json(),
                "size_distribution": self.insights.size_distribution.as_size_json(),
                "cache_hits": self.insights.cache_hits,
            },
        })
    }
}

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("categorization canceled")]
    Canceled,
    #[error("email store error: {0}")]
    Email(#[from] EmailError),
}

/// Runs the analyzers over a batch of candidate emails and combines their
/// partial verdicts into a final category plus enrichment.
///
/// Determinism contract: for a fixed (config, email) pair the verdict is
/// the same on every run; re-running without `force_refresh` never touches
/// an already-categorized email.
pub struct Orchestrator {
    repo: EmailRepository,
    analyzers: Vec<Arc<dyn Analyzer>>,
    cache: Arc<UserCache>,
    parallel: bool,
    analyzer_timeout: Duration,
    spam_low_threshold: f64,
    promotional_low_threshold: f64,
    analysis_version: String,
}

impl Orchestrator {
    pub fn new(
        repo: EmailRepository,
        analyzers: Vec<Arc<dyn Analyzer>>,
        config: &CategorizationConfig,
        cache: Arc<UserCache>,
    ) -> Self {
        Self {
            repo,
            analyzers,
            cache,
            parallel: config.parallel,
            analyzer_timeout: Duration::from_millis(config.analyzer_timeout_ms),
            spam_low_threshold: config.spam_low_threshold,
            promotional_low_threshold: config.promotional_low_threshold,
            analysis_version: config.analysis_version.clone(),
        }
    }

    pub async fn run(
        &self,
        options: &CategorizationOptions,
        cancel: &CancellationToken,
    ) -> Result<CategorizationOutcome, OrchestratorError> {
        let criteria = EmailCriteria {
            uncategorized_only: !options.force_refresh,
            year: options.year,
            ..Default::default()
        };
        let candidates = self.repo.search(&criteria).await?;
        info!(
            user_id = %self.repo.user_id(),
            candidates = candidates.len(),
            force_refresh = options.force_refresh,
            "starting categorization batch"
        );

        let mut outcome = CategorizationOutcome {
            processed: 0,
            category_counts: CategoryCounts::default(),
            email_ids: Vec::new(),
            failures: Vec::new(),
            emails: Vec::new(),
            insights: AnalyzerInsights::default(),
        };
        let mut rule_hits: HashMap<String, usize> = HashMap::new();
        let mut confidence_sum = 0.0;
        let mut spam_flagged = 0usize;

        for email in &candidates {
            if cancel.is_cancelled() {
                return Err(OrchestratorError::Canceled);
            }

            let ctx = match build_context(email) {
                Ok(ctx) => ctx,
                Err(failure) => {
                    warn!(email_id = %failure.email_id, error = %failure.error, "skipping email");
                    outcome.failures.push(failure);
                    continue;
                }
            };

            let verdict = self.run_analyzers(&ctx, cancel).await?;
            let importance = verdict
                .importance
                .clone()
                .unwrap_or_else(|| neutral_importance());
            let date_size = verdict
                .date_size
                .clone()
                .unwrap_or_else(|| neutral_verdict("date_size").date_size.unwrap());
            let label = verdict
                .label
                .clone()
                .unwrap_or_else(|| neutral_verdict("label").label.unwrap());

            let category = self.combine(&ctx, &importance, &date_size.age_category, &label);
            let enrichment = Enrichment {
                category,
                importance_level: importance.level.as_str().to_string(),
                importance_score: importance.score,
                importance_matched_rules: importance.matched_rules.clone(),
                age_category: date_size.age_category.as_str().to_string(),
                size_category: date_size.size_category.as_str().to_string(),
                gmail_category: label.gmail_category.as_str().to_string(),
                spam_score: label.spam_score,
                promotional_score: label.promotional_score,
                social_score: label.social_score,
                analysis_timestamp: Utc::now(),
                analysis_version: self.analysis_version.clone(),
            };

            if let Err(err) = self.repo.apply_enrichment(&email.id, &enrichment).await {
                warn!(email_id = %email.id, error = %err, "failed to persist enrichment");
                outcome.failures.push(EmailFailure {
                    email_id: email.id.clone(),
                    error: err.to_string(),
                });
                continue;
            }

            // The stored row changed; its single-email cache entry is stale.
            self.cache
                .delete(&cache::email_key(self.repo.user_id(), &email.id))
                .await;

            outcome.processed += 1;
            outcome.category_counts.record(category);
            outcome.email_ids.push(email.id.clone());
            outcome.emails.push(json!({
                "id": email.id,
                "category": category.as_str(),
                "importance_level": enrichment.importance_level,
                "importance_score": enrichment.importance_score,
                "importance_matched_rules": enrichment.importance_matched_rules,
                "age_category": enrichment.age_category,
                "size_category": enrichment.size_category,
                "gmail_category": enrichment.gmail_category,
                "spam_score": enrichment.spam_score,
                "promotional_score": enrichment.promotional_score,
                "social_score": enrichment.social_score,
            }));

            for rule_id in &importance.matched_rules {
                *rule_hits.entry(rule_id.clone()).or_default() += 1;
            }
            confidence_sum += importance.confidence;
            if importance.from_cache {
                outcome.insights.cache_hits += 1;
            }
            if label.spam_score >= self.spam_low_threshold {
                spam_flagged += 1;
            }
            match date_size.age_category {
                AgeCategory::Recent => outcome.insights.age_distribution.recent_or_small += 1,
                AgeCategory::Moderate => outcome.insights.age_distribution.moderate_or_medium += 1,
                AgeCategory::Old => outcome.insights.age_distribution.old_or_large += 1,
            }
            match date_size.size_category {
                SizeCategory::Small => outcome.insights.size_distribution.recent_or_small += 1,
                SizeCategory::Medium => {
                    outcome.insights.size_distribution.moderate_or_medium += 1
                }
                SizeCategory::Large => outcome.insights.size_distribution.old_or_large += 1,
            }
        }

        if outcome.processed > 0 {
            outcome.insights.avg_confidence = confidence_sum / outcome.processed as f64;
            outcome.insights.spam_detection_rate = spam_flagged as f64 / outcome.processed as f64;

            let mut hits: Vec<RuleHitCount> = rule_hits
                .into_iter()
                .map(|(rule_id, count)| RuleHitCount { rule_id, count })
                .collect();
            hits.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.rule_id.cmp(&b.rule_id)));
            hits.truncate(5);
            outcome.insights.top_importance_rules = hits;

            // Listing and stats caches no longer reflect the stored rows.
            let user_id = self.repo.user_id();
            self.cache
                .flush_prefix(&format!("user:{user_id}:email-list:"))
                .await;
            self.cache.delete(&cache::category_stats_key(user_id)).await;
        }

        info!(
            user_id = %self.repo.user_id(),
            processed = outcome.processed,
            high = outcome.category_counts.high,
            medium = outcome.category_counts.medium,
            low = outcome.category_counts.low,
            failures = outcome.failures.len(),
            "categorization batch finished"
        );
        Ok(outcome)
    }

    async fn run_analyzers(
        &self,
        ctx: &EmailContext,
        cancel: &CancellationToken,
    ) -> Result<PartialVerdict, OrchestratorError> {
        let mut merged = PartialVerdict::default();

        if self.parallel {
            let futures: Vec<_> = self
                .analyzers
                .iter()
                .map(|analyzer| {
                    let analyzer = analyzer.clone();
                    let ctx = ctx.clone();
                    let limit = self.analyzer_timeout;
                    async move {
                        let name = analyzer.name();
                        match timeout(limit, analyzer.analyze(&ctx)).await {
                            Ok(Ok(verdict)) => (name, verdict),
                            Ok(Err(err)) => {
                                warn!(analyzer = name, error = %err, "analyzer failed, using neutral result");
                                (name, neutral_verdict(name))
                            }
                            Err(_) => {
                                warn!(analyzer = name, "analyzer timed out, using neutral result");
                                (name, neutral_verdict(name))
                            }
                        }
                    }
                })
                .collect();

            let joined = tokio::select! {
                results = futures::future::join_all(futures) => results,
                _ = cancel.cancelled() => {
                    debug!(email_id = %ctx.email_id, "batch canceled while analyzers in flight");
                    return Err(OrchestratorError::Canceled);
                }
            };
            for (_, verdict) in joined {
                merge(&mut merged, verdict);
            }
        } else {
            for analyzer in &self.analyzers {
                if cancel.is_cancelled() {
                    return Err(OrchestratorError::Canceled);
                }
                let name = analyzer.name();
                match analyzer.analyze(ctx).await {
                    Ok(verdict) => merge(&mut merged, verdict),
                    Err(err) => {
                        warn!(analyzer = name, error = %err, "analyzer failed, using neutral result");
                        merge(&mut merged, neutral_verdict(name));
                    }
                }
            }
        }

        Ok(merged)
    }

    fn combine(
        &self,
        ctx: &EmailContext,
        importance: &ImportanceResult,
        age: &AgeCategory,
        label: &LabelResult,
    ) -> PriorityCategory {
        let base = match importance.level {
            ImportanceLevel::High => PriorityCategory::High,
            ImportanceLevel::Low => PriorityCategory::Low,
            ImportanceLevel::Medium => PriorityCategory::Medium,
        };

        // An explicit important/starred label on a recent email is a user
        // signal and outranks the heuristic downgrades.
        let explicitly_important = ctx.labels.iter().any(|l| {
            matches!(
                SystemLabel::from_str(l),
                Some(SystemLabel::Important | SystemLabel::Starred)
            )
        });
        if explicitly_important && *age == AgeCategory::Recent {
            return PriorityCategory::High;
        }

        if label.spam_score >= self.spam_low_threshold
            || label.promotional_score >= self.promotional_low_threshold
        {
            return PriorityCategory::Low;
        }

        base
    }
}

fn neutral_importance() -> ImportanceResult {
    neutral_verdict("importance")
        .importance
        .expect("neutral importance present")
}

fn merge(into: &mut PartialVerdict, from: PartialVerdict) {
    if from.importance.is_some() {
        into.importance = from.importance;
    }
    if from.date_size.is_some() {
        into.date_size = from.date_size;
    }
    if from.label.is_some() {
        into.label = from.label;
    }
}

fn build_context(email: &EmailIndex) -> Result<EmailContext, EmailFailure> {
    let missing = |field: &str| EmailFailure {
        email_id: email.id.clone(),
        error: format!("missing required field {field}"),
    };

    Ok(EmailContext {
        user_id: email.user_id.clone(),
        email_id: email.id.clone(),
        subject: email.subject.clone().ok_or_else(|| missing("subject"))?,
        sender: email.sender.clone().ok_or_else(|| missing("sender"))?,
        snippet: email.snippet.clone().ok_or_else(|| missing("snippet"))?,
        labels: email.labels.clone(),
        size_bytes: email.size_bytes,
        has_attachments: email.has_attachments,
        date: email.date.unwrap_or(email.created_at),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::AnalyzerFactory;
    use crate::emails::NewEmail;
    use crate::factory::UserDbFactory;
    use tempfile::TempDir;

    async fn setup(user_id: &str, config: &CategorizationConfig) -> (Orchestrator, EmailRepository, Arc<UserCache>, TempDir) {
        let dir = TempDir::new().expect("temp dir");
        let factory = UserDbFactory::new(dir.path());
        let db = factory.database_for(user_id).await.expect("open db");
        let repo = EmailRepository::new(db);
        let cache = Arc::new(UserCache::default());
        let analyzers = AnalyzerFactory::build(config, cache.clone()).expect("analyzers");
        let orchestrator = Orchestrator::new(repo.clone(), analyzers, config, cache.clone());
        (orchestrator, repo, cache, dir)
    }

    fn urgent_email(id: &str) -> NewEmail {
        NewEmail {
            id: id.to_string(),
            thread_id: format!("t-{id}"),
            sender: Some("admin@company.com".into()),
            recipients: vec!["me@company.com".into()],
            subject: Some("URGENT: System Alert".into()),
            snippet: Some("the database is on fire".into()),
            labels: vec!["INBOX".into(), "IMPORTANT".into()],
            has_attachments: false,
            date: Some(Utc::now()),
            size_bytes: 75_000,
        }
    }

    fn newsletter_email(id: &str) -> NewEmail {
        NewEmail {
            id: id.to_string(),
            thread_id: format!("t-{id}"),
            sender: Some("newsletter@example.com".into()),
            recipients: vec!["me@company.com".into()],
            subject: Some("Newsletter: Weekly Updates".into()),
            snippet: Some("unsubscribe below".into()),
            labels: vec!["CATEGORY_PROMOTIONS".into()],
            has_attachments: false,
            date: Some(Utc::now() - chrono::Duration::days(7)),
            size_bytes: 2_048,
        }
    }

    #[tokio::test]
    async fn empty_batch_produces_zero_outcome() {
        let config = CategorizationConfig::default();
        let (orchestrator, _repo, _cache, _dir) = setup("u1", &config).await;
        let outcome = orchestrator
            .run(&CategorizationOptions::default(), &CancellationToken::new())
            .await
            .expect("run");

        assert_eq!(outcome.processed, 0);
        assert_eq!(outcome.category_counts.total(), 0);
        assert!(outcome.email_ids.is_empty());
        assert!(outcome.failures.is_empty());
    }

    #[tokio::test]
    async fn urgent_email_is_categorized_high() {
        let config = CategorizationConfig::default();
        let (orchestrator, repo, _cache, _dir) = setup("u1", &config).await;
        repo.upsert(urgent_email("m1")).await.expect("insert");

        let outcome = orchestrator
            .run(
                &CategorizationOptions {
                    force_refresh: true,
                    year: None,
                },
                &CancellationToken::new(),
            )
            .await
            .expect("run");

        assert_eq!(outcome.processed, 1);
        assert_eq!(outcome.category_counts.high, 1);
        assert_eq!(outcome.category_counts.total(), outcome.processed);

        let stored = repo.get("m1").await.expect("get").expect("present");
        assert_eq!(stored.category, Some(PriorityCategory::High));
        assert!(
            stored
                .importance_matched_rules
                .contains(&"urgent-keywords".to_string())
        );
        assert_eq!(stored.analysis_version.as_deref(), Some("modular-1"));
    }

    #[tokio::test]
    async fn newsletter_is_categorized_low_with_promotional_signal() {
        let config = CategorizationConfig::default();
        let (orchestrator, repo, _cache, _dir) = setup("u1", &config).await;
        repo.upsert(newsletter_email("m2")).await.expect("insert");

        let outcome = orchestrator
            .run(&CategorizationOptions::default(), &CancellationToken::new())
            .await
            .expect("run");

        assert_eq!(outcome.processed, 1);
        assert_eq!(outcome.category_counts.low, 1);

        let stored = repo.get("m2").await.expect("get").expect("present");
        assert_eq!(stored.category, Some(PriorityCategory::Low));
        assert_eq!(stored.gmail_category.as_deref(), Some("promotions"));
        assert!(stored.promotional_score.unwrap_or(0.0) > 0.0);
    }

    #[tokio::test]
    async fn rerun_without_force_refresh_skips_categorized_emails() {
        let config = CategorizationConfig::default();
        let (orchestrator, repo, _cache, _dir) = setup("u1", &config).await;
        repo.upsert(urgent_email("m1")).await.expect("insert");

        let first = orchestrator
            .run(&CategorizationOptions::default(), &CancellationToken::new())
            .await
            .expect("first run");
        assert_eq!(first.processed, 1);

        let second = orchestrator
            .run(&CategorizationOptions::default(), &CancellationToken::new())
            .await
            .expect("second run");
        assert_eq!(second.processed, 0, "already-categorized email untouched");
    }

    #[tokio::test]
    async fn force_refresh_rerun_is_deterministic_and_hits_cache() {
        let config = CategorizationConfig::default();
        let (orchestrator, repo, _cache, _dir) = setup("u1", &config).await;
        repo.upsert(urgent_email("m1")).await.expect("insert");

        let options = CategorizationOptions {
            force_refresh: true,
            year: None,
        };
        let first = orchestrator
            .run(&options, &CancellationToken::new())
            .await
            .expect("first run");
        let first_stored = repo.get("m1").await.expect("get").expect("present");

        let second = orchestrator
            .run(&options, &CancellationToken::new())
            .await
            .expect("second run");
        let second_stored = repo.get("m1").await.expect("get").expect("present");

        assert_eq!(first.category_counts, second.category_counts);
        assert_eq!(first_stored.category, second_stored.category);
        assert_eq!(
            first_stored.importance_score,
            second_stored.importance_score
        );
        assert!(second.insights.cache_hits >= 1, "second run should hit the importance cache");
    }

    #[tokio::test]
    async fn null_subject_fails_that_email_only() {
        let config = CategorizationConfig::default();
        let (orchestrator, repo, _cache, _dir) = setup("u1", &config).await;

        let mut broken = urgent_email("m-broken");
        broken.subject = None;
        repo.upsert(broken).await.expect("insert broken");
        repo.upsert(urgent_email("m-ok")).await.expect("insert ok");

        let outcome = orchestrator
            .run(&CategorizationOptions::default(), &CancellationToken::new())
            .await
            .expect("run");

        assert_eq!(outcome.processed, 1);
        assert_eq!(outcome.failures.len(), 1);
        assert_eq!(outcome.failures[0].email_id, "m-broken");
        assert!(outcome.failures[0].error.contains("subject"));

        let broken_row = repo.get("m-broken").await.expect("get").expect("present");
        assert!(broken_row.category.is_none(), "failed email left untouched");
    }

    #[tokio::test]
    async fn year_filter_limits_candidates() {
        let config = CategorizationConfig::default();
        let (orchestrator, repo, _cache, _dir) = setup("u1", &config).await;

        let mut old_email = newsletter_email("m-old");
        old_email.date = Some(
            chrono::TimeZone::with_ymd_and_hms(&Utc, 2020, 6, 1, 0, 0, 0).unwrap(),
        );
        repo.upsert(old_email).await.expect("insert old");
        repo.upsert(urgent_email("m-new")).await.expect("insert new");

        let outcome = orchestrator
            .run(
                &CategorizationOptions {
                    force_refresh: true,
                    year: Some(2020),
                },
                &CancellationToken::new(),
            )
            .await
            .expect("run");

        assert_eq!(outcome.processed, 1);
        assert_eq!(outcome.email_ids, vec!["m-old".to_string()]);
    }

    #[tokio::test]
    async fn canceled_token_stops_the_batch() {
        let config = CategorizationConfig::default();
        let (orchestrator, repo, _cache, _dir) = setup("u1", &config).await;
        repo.upsert(urgent_email("m1")).await.expect("insert");

        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = orchestrator
            .run(&CategorizationOptions::default(), &cancel)
            .await
            .expect_err("canceled batch errors");
        assert!(matches!(err, OrchestratorError::Canceled));
    }

    #[tokio::test]
    async fn sequential_mode_matches_parallel_mode() {
        let parallel_config = CategorizationConfig::default();
        let sequential_config = CategorizationConfig {
            parallel: false,
            ..Default::default()
        };

        let (par, par_repo, _c1, _d1) = setup("u1", &parallel_config).await;
        let (seq, seq_repo, _c2, _d2) = setup("u1", &sequential_config).await;
        par_repo.upsert(urgent_email("m1")).await.expect("insert");
        seq_repo.upsert(urgent_email("m1")).await.expect("insert");

        let options = CategorizationOptions::default();
        let from_par = par
            .run(&options, &CancellationToken::new())
            .await
            .expect("parallel run");
        let from_seq = seq
            .run(&options, &CancellationToken::new())
            .await
            .expect("sequential run");

        assert_eq!(from_par.category_counts, from_seq.category_counts);
        let a = par_repo.get("m1").await.expect("get").expect("row");
        let b = seq_repo.get("m1").await.expect("get").expect("row");
        assert_eq!(a.category, b.category);
        assert_eq!(a.importance_score, b.importance_score);
    }

    #[tokio::test]
    async fn insights_track_distributions_and_top_rules() {
        let config = CategorizationConfig::default();
        let (orchestrator, repo, _cache, _dir) = setup("u1", &config).await;
        repo.upsert(urgent_email("m1")).await.expect("insert");
        repo.upsert(newsletter_email("m2")).await.expect("insert");

        let outcome = orchestrator
            .run(&CategorizationOptions::default(), &CancellationToken::new())
            .await
            .expect("run");

        assert_eq!(outcome.processed, 2);
        let age = outcome.insights.age_distribution;
        assert_eq!(
            age.recent_or_small + age.moderate_or_medium + age.old_or_large,
            2
        );
        assert!(
            outcome
                .insights
                .top_importance_rules
                .iter()
                .any(|hit| hit.rule_id == "urgent-keywords")
        );
        assert!(outcome.insights.avg_confidence > 0.0);
    }
}
