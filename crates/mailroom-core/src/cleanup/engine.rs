use std::sync::Arc;

use chrono::{Datelike, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use thiserror::Error;
use tracing::{info, warn};

use crate::cleanup::policy::{
    ArchiveRecordRepository, CleanupAction, CleanupMethod, CleanupPolicy, NewCleanupPolicy,
    PolicyActionSpec, PolicyCriteria, PolicyError, PolicyRepository, PolicySafety,
};
use crate::emails::{EmailCriteria, EmailError, EmailIndex, EmailRepository, PriorityCategory};
use crate::gmail::{MailApi, with_backoff};
use crate::labels::SystemLabel;

#[derive(Debug, Error)]
pub enum CleanupError {
    #[error("policy not found: {0}")]
    NotFound(String),
    #[error("policy {0} is disabled")]
    Disabled(String),
    #[error("policy {0} requires confirmation; pass force or run a dry run")]
    ConfirmationRequired(String),
    #[error("policy store error: {0}")]
    Policy(#[from] PolicyError),
    #[error("email store error: {0}")]
    Email(#[from] EmailError),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CleanupRunReport {
    pub policy_id: String,
    pub action: CleanupAction,
    pub dry_run: bool,
    pub examined: usize,
    pub affected: usize,
    pub email_ids: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub archive_location: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recommendation {
    pub name: String,
    pub reason: String,
    pub policy: NewCleanupPolicy,
}

/// Evaluates retention policies against the user's email index and carries
/// out the archive/delete actions with the safety block enforced.
pub struct CleanupEngine {
    policies: PolicyRepository,
    emails: EmailRepository,
    records: ArchiveRecordRepository,
    vendor_batch_size: usize,
}

impl CleanupEngine {
    pub fn new(
        policies: PolicyRepository,
        emails: EmailRepository,
        records: ArchiveRecordRepository,
    ) -> Self {
        Self {
            policies,
            emails,
            records,
            vendor_batch_size: 50,
        }
    }

    /// Page size for vendor batch calls (`GMAIL_BATCH_SIZE`).
    pub fn with_vendor_batch_size(mut self, batch_size: usize) -> Self {
        self.vendor_batch_size = batch_size.max(1);
        self
    }

    pub async fn policy(&self, policy_id: &str) -> Result<CleanupPolicy, CleanupError> {
        self.policies
            .get(policy_id)
            .await?
            .ok_or_else(|| CleanupError::NotFound(policy_id.to_string()))
    }

    /// Gate a run attempt against the policy's enablement and safety block.
    pub fn check_trigger(
        policy: &CleanupPolicy,
        dry_run: bool,
        force: bool,
    ) -> Result<(), CleanupError> {
        if dry_run {
            // Previews read the caller's own data and always go through.
            return Ok(());
        }
        if !policy.enabled && !force {
            return Err(CleanupError::Disabled(policy.id.clone()));
        }
        if (policy.safety.require_confirmation || policy.safety.dry_run_first) && !force {
            return Err(CleanupError::ConfirmationRequired(policy.id.clone()));
        }
        Ok(())
    }

    /// Candidate set for one policy: criteria conjunction, safety filters,
    /// oldest first, capped at `max_emails_per_run`.
    pub async fn evaluate(
        &self,
        policy: &CleanupPolicy,
    ) -> Result<Vec<EmailIndex>, CleanupError> {
        let criteria = EmailCriteria {
            date_to: policy
                .criteria
                .min_age_days
                .map(|days| Utc::now() - Duration::days(days)),
            size_min: policy.criteria.min_size_bytes,
            archived: if policy.criteria.include_archived {
                None
            } else {
                Some(false)
            },
            ..Default::default()
        };

        let now = Utc::now();
        let mut candidates: Vec<EmailIndex> = self
            .emails
            .search(&criteria)
            .await?
            .into_iter()
            .filter(|email| self.matches_policy(email, policy, now))
            .collect();

        // Oldest first so the run cap trims the newest candidates.
        candidates.sort_by_key(|email| email.date.unwrap_or(email.created_at));
        candidates.truncate(policy.safety.max_emails_per_run as usize);
        Ok(candidates)
    }

    fn matches_policy(
        &self,
        email: &EmailIndex,
        policy: &CleanupPolicy,
        now: chrono::DateTime<Utc>,
    ) -> bool {
        if let Some(max_level) = policy.criteria.max_importance_level.as_deref() {
            let level = email
                .importance_level
                .as_deref()
                .unwrap_or("medium");
            if importance_rank(level) > importance_rank(max_level) {
                return false;
            }
        }
        if let Some(min_spam) = policy.criteria.min_spam_score {
            if email.spam_score.unwrap_or(0.0) < min_spam {
                return false;
            }
        }
        if let Some(min_promo) = policy.criteria.min_promotional_score {
            if email.promotional_score.unwrap_or(0.0) < min_promo {
                return false;
            }
        }
        if let Some(days) = policy.criteria.days_without_access {
            if email.updated_at > now - Duration::days(days) {
                return false;
            }
        }

        if policy.safety.preserve_important && is_important(email) {
            return false;
        }
        true
    }

    /// Dry-run preview: what a live run would touch, with no mutation.
    pub async fn preview(
        &self,
        policy_id: &str,
        max_emails: Option<u32>,
    ) -> Result<CleanupRunReport, CleanupError> {
        let policy = self.policy(policy_id).await?;
        let mut candidates = self.evaluate(&policy).await?;
        if let Some(cap) = max_emails {
            candidates.truncate(cap as usize);
        }

        Ok(CleanupRunReport {
            policy_id: policy.id,
            action: policy.action.action,
            dry_run: true,
            examined: candidates.len(),
            affected: candidates.len(),
            email_ids: candidates.into_iter().map(|email| email.id).collect(),
            archive_location: None,
        })
    }

    /// Live run, invoked from the cleanup job. The vendor handle is
    /// optional: without one the index is still updated and the vendor sync
    /// is skipped with a warning.
    pub async fn execute(
        &self,
        policy: &CleanupPolicy,
        max_emails: Option<u32>,
        mail: Option<Arc<dyn MailApi>>,
    ) -> Result<CleanupRunReport, CleanupError> {
        let mut candidates = self.evaluate(policy).await?;
        if let Some(cap) = max_emails {
            candidates.truncate(cap as usize);
        }
        let email_ids: Vec<String> = candidates.iter().map(|email| email.id.clone()).collect();
        let examined = email_ids.len();

        if email_ids.is_empty() {
            return Ok(CleanupRunReport {
                policy_id: policy.id.clone(),
                action: policy.action.action,
                dry_run: false,
                examined: 0,
                affected: 0,
                email_ids,
                archive_location: None,
            });
        }

        let mut archive_location = None;
        let affected = match policy.action.action {
            CleanupAction::Archive => {
                if policy.action.method == CleanupMethod::Export {
                    let format = policy
                        .action
                        .export_format
                        .clone()
                        .unwrap_or_else(|| "mbox".to_string());
                    archive_location = Some(format!(
                        "export/{}-{}.{format}",
                        policy.id,
                        Utc::now().format("%Y%m%d%H%M%S")
                    ));
                }
                let affected = self
                    .emails
                    .mark_archived(&email_ids, archive_location.as_deref())
                    .await? as usize;

                if policy.action.method == CleanupMethod::Gmail {
                    match &mail {
                        Some(api) => {
                            let remove = vec![SystemLabel::Inbox.as_str().to_string()];
                            for chunk in email_ids.chunks(self.vendor_batch_size) {
                                if let Err(err) =
                                    with_backoff(|| api.batch_modify(chunk, &[], &remove)).await
                                {
                                    warn!(policy_id = %policy.id, error = %err, "vendor archive sync failed");
                                }
                            }
                        }
                        None => warn!(policy_id = %policy.id, "no vendor client; archived in index only"),
                    }
                }

                self.records
                    .record(
                        match policy.action.method {
                            CleanupMethod::Gmail => "gmail",
                            CleanupMethod::Export => "export",
                        },
                        archive_location.as_deref(),
                        affected as i64,
                    )
                    .await?;
                affected
            }
            CleanupAction::Delete => {
                let affected = self.emails.mark_deleted(&email_ids).await? as usize;
                if let Some(api) = &mail {
                    for email_id in &email_ids {
                        if let Err(err) =
                            with_backoff(|| api.delete_message(email_id)).await
                        {
                            warn!(email_id, error = %err, "vendor delete failed");
                        }
                    }
                }
                affected
            }
        };

        info!(
            policy_id = %policy.id,
            action = policy.action.action.as_str(),
            affected,
            "cleanup run finished"
        );

        Ok(CleanupRunReport {
            policy_id: policy.id.clone(),
            action: policy.action.action,
            dry_run: false,
            examined,
            affected,
            email_ids,
            archive_location,
        })
    }

    /// Propose policy templates from the user's current email distribution.
    pub async fn recommendations(&self) -> Result<Vec<Recommendation>, CleanupError> {
        let mut recommendations = Vec::new();
        let current_year = Utc::now().year() as i64;

        let old_count = self
            .emails
            .count(&EmailCriteria {
                year_to: Some(current_year - 2),
                archived: Some(false),
                ..Default::default()
            })
            .await?;
        if old_count > 0 {
            recommendations.push(Recommendation {
                name: "archive-old-mail".into(),
                reason: format!("{old_count} unarchived emails are two or more years old"),
                policy: template(
                    "Archive mail older than two years",
                    PolicyCriteria {
                        min_age_days: Some(730),
                        max_importance_level: Some("medium".into()),
                        ..Default::default()
                    },
                    CleanupAction::Archive,
                ),
            });
        }

        let promotional_count = self
            .emails
            .count(&EmailCriteria {
                labels: vec![SystemLabel::CategoryPromotions.as_str().to_string()],
                archived: Some(false),
                ..Default::default()
            })
            .await?;
        if promotional_count > 0 {
            recommendations.push(Recommendation {
                name: "delete-stale-promotions".into(),
                reason: format!("{promotional_count} promotional emails in the index"),
                policy: template(
                    "Delete old promotional mail",
                    PolicyCriteria {
                        min_age_days: Some(90),
                        min_promotional_score: Some(0.5),
                        max_importance_level: Some("low".into()),
                        ..Default::default()
                    },
                    CleanupAction::Delete,
                ),
            });
        }

        let low_count = self
            .emails
            .count(&EmailCriteria {
                category: Some(PriorityCategory::Low),
                archived: Some(false),
                ..Default::default()
            })
            .await?;
        if low_count > 0 {
            recommendations.push(Recommendation {
                name: "archive-low-priority".into(),
                reason: format!("{low_count} low-priority emails could be archived"),
                policy: template(
                    "Archive aged low-priority mail",
                    PolicyCriteria {
                        min_age_days: Some(180),
                        max_importance_level: Some("low".into()),
                        ..Default::default()
                    },
                    CleanupAction::Archive,
                ),
            });
        }

        Ok(recommendations)
    }
}

fn template(name: &str, criteria: PolicyCriteria, action: CleanupAction) -> NewCleanupPolicy {
    NewCleanupPolicy {
        name: name.to_string(),
        enabled: false,
        priority: 50,
        criteria,
        action: PolicyActionSpec {
            action,
            method: CleanupMethod::Gmail,
            export_format: None,
        },
        safety: PolicySafety {
            max_emails_per_run: 200,
            require_confirmation: matches!(action, CleanupAction::Delete),
            dry_run_first: true,
            preserve_important: true,
        },
        schedule: None,
    }
}

fn importance_rank(level: &str) -> u8 {
    match level {
        "high" => 2,
        "low" => 0,
        _ => 1,
    }
}

fn is_important(email: &EmailIndex) -> bool {
    if email.category == Some(PriorityCategory::High) {
        return true;
    }
    if email.importance_level.as_deref() == Some("high") {
        return true;
    }
    email.labels.iter().any(|label| {
        matches!(
            SystemLabel::from_str(label),
            Some(SystemLabel::Important | SystemLabel::Starred)
        )
    })
}

/// Serializable summary for the trigger tool's dry-run response.
pub fn report_json(report: &CleanupRunReport) -> Value {
    json!({
        "policy_id": report.policy_id,
        "action": report.action.as_str(),
        "dry_run": report.dry_run,
        "examined": report.examined,
        "affected": report.affected,
        "email_ids": report.email_ids,
        "archive_location": report.archive_location,
    })
}
