use std::collections::HashMap;

use chrono::{DateTime, Utc};
use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Immutable input to rule evaluation for one email.
#[derive(Debug, Clone, PartialEq)]
pub struct EmailContext {
    pub user_id: String,
    pub email_id: String,
    pub subject: String,
    pub sender: String,
    pub snippet: String,
    pub labels: Vec<String>,
    pub size_bytes: i64,
    pub has_attachments: bool,
    pub date: DateTime<Utc>,
}

/// The typed rule variants. Configurations arrive as untyped JSON bags
/// (the legacy form); parsing them into this sum rejects unknown `type`
/// values instead of evaluating them as silent non-matches.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum RuleKind {
    #[serde(rename = "keyword")]
    Keyword { keywords: Vec<String> },
    #[serde(rename = "domain")]
    Domain { domains: Vec<String> },
    #[serde(rename = "label")]
    Label { labels: Vec<String> },
    #[serde(rename = "noReply")]
    NoReply,
    #[serde(rename = "largeAttachment")]
    LargeAttachment { min_size: i64 },
}

impl RuleKind {
    pub fn type_name(&self) -> &'static str {
        match self {
            RuleKind::Keyword { .. } => "keyword",
            RuleKind::Domain { .. } => "domain",
            RuleKind::Label { .. } => "label",
            RuleKind::NoReply => "noReply",
            RuleKind::LargeAttachment { .. } => "largeAttachment",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rule {
    pub id: String,
    pub name: String,
    /// Ordering tie-breaker, high first. Equal priorities keep insertion
    /// order.
    #[serde(default)]
    pub priority: i64,
    /// Contribution to the importance score; may be negative.
    pub weight: f64,
    #[serde(flatten)]
    pub kind: RuleKind,
}

/// Result of evaluating one rule against one email.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleMatch {
    pub matched: bool,
    pub score: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl RuleMatch {
    fn no_match() -> Self {
        Self {
            matched: false,
            score: 0.0,
            reason: None,
        }
    }
}

#[derive(Debug, Error)]
pub enum RuleError {
    #[error("unknown rule type {0:?}")]
    UnknownType(String),
    #[error("invalid rule config: {0}")]
    InvalidConfig(#[from] serde_json::Error),
    #[error("rule config is not an object: {0}")]
    NotAnObject(Value),
    #[error("invalid keyword pattern {keyword:?}: {source}")]
    InvalidKeyword {
        keyword: String,
        source: regex::Error,
    },
}

const KNOWN_TYPES: &[&str] = &["keyword", "domain", "label", "noReply", "largeAttachment"];

/// Parse one untyped rule bag into the typed form. Unknown `type` values
/// are their own error so the caller can surface them as InvalidParams.
pub fn parse_rule(config: &Value) -> Result<Rule, RuleError> {
    let obj = config
        .as_object()
        .ok_or_else(|| RuleError::NotAnObject(config.clone()))?;
    if let Some(type_name) = obj.get("type").and_then(Value::as_str) {
        if !KNOWN_TYPES.contains(&type_name) {
            return Err(RuleError::UnknownType(type_name.to_string()));
        }
    }
    Ok(serde_json::from_value(config.clone())?)
}

/// An ordered set of rules: descending priority, insertion order on ties.
#[derive(Debug, Clone, PartialEq)]
pub struct RuleSet {
    rules: Vec<Rule>,
}

impl RuleSet {
    pub fn parse(configs: &[Value]) -> Result<Self, RuleError> {
        let mut rules = configs.iter().map(parse_rule).collect::<Result<Vec<_>, _>>()?;
        // Stable sort keeps insertion order for equal priorities.
        rules.sort_by(|a, b| b.priority.cmp(&a.priority));
        Ok(Self { rules })
    }

    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

/// Per-run scratch state; caches compiled keyword patterns across emails.
#[derive(Debug, Default)]
pub struct EvaluationContext {
    keyword_patterns: HashMap<String, Regex>,
}

impl EvaluationContext {
    pub fn new() -> Self {
        Self::default()
    }

    fn keyword_pattern(&mut self, keyword: &str) -> Result<&Regex, RuleError> {
        if !self.keyword_patterns.contains_key(keyword) {
            let pattern = format!(r"\b{}\b", regex::escape(keyword));
            let compiled = RegexBuilder::new(&pattern)
                .case_insensitive(true)
                .build()
                .map_err(|source| RuleError::InvalidKeyword {
                    keyword: keyword.to_string(),
                    source,
                })?;
            self.keyword_patterns.insert(keyword.to_string(), compiled);
        }
        Ok(self
            .keyword_patterns
            .get(keyword)
            .expect("pattern present after insertion"))
    }
}

impl Rule {
    /// Pure evaluation: no side effects, deterministic for a given context.
    pub fn evaluate(
        &self,
        ctx: &EmailContext,
        eval: &mut EvaluationContext,
    ) -> Result<RuleMatch, RuleError> {
        match &self.kind {
            RuleKind::Keyword { keywords } => {
                let haystack = format!("{} {}", ctx.subject, ctx.snippet);
                let mut hits = Vec::new();
                for keyword in keywords {
                    if eval.keyword_pattern(keyword)?.is_match(&haystack) {
                        hits.push(keyword.as_str());
                    }
                }
                if hits.is_empty() {
                    Ok(RuleMatch::no_match())
                } else {
                    Ok(RuleMatch {
                        matched: true,
                        score: hits.len() as f64 * self.weight,
                        reason: Some(format!("keywords: {}", hits.join(", "))),
                    })
                }
            }
            RuleKind::Domain { domains } => {
                let sender = ctx.sender.to_lowercase();
                let hit = domains
                    .iter()
                    .find(|domain| sender.contains(&domain.to_lowercase()));
                match hit {
                    Some(domain) => Ok(RuleMatch {
                        matched: true,
                        score: self.weight,
                        reason: Some(format!("sender domain: {domain}")),
                    }),
                    None => Ok(RuleMatch::no_match()),
                }
            }
            RuleKind::Label { labels } => {
                let hits: Vec<&str> = labels
                    .iter()
                    .filter(|wanted| {
                        ctx.labels
                            .iter()
                            .any(|have| have.eq_ignore_ascii_case(wanted))
                    })
                    .map(|s| s.as_str())
                    .collect();
                if hits.is_empty() {
                    Ok(RuleMatch::no_match())
                } else {
                    Ok(RuleMatch {
                        matched: true,
                        score: hits.len() as f64 * self.weight,
                        reason: Some(format!("labels: {}", hits.join(", "))),
                    })
                }
            }
            RuleKind::NoReply => {
                let sender = ctx.sender.to_lowercase();
                if sender.contains("no-reply") || sender.contains("noreply") {
                    Ok(RuleMatch {
                        matched: true,
                        score: self.weight,
                        reason: Some("no-reply sender".to_string()),
                    })
                } else {
                    Ok(RuleMatch::no_match())
                }
            }
            RuleKind::LargeAttachment { min_size } => {
                if ctx.has_attachments && ctx.size_bytes > *min_size {
                    Ok(RuleMatch {
                        matched: true,
                        score: self.weight,
                        reason: Some(format!("attachment over {min_size} bytes")),
                    })
                } else {
                    Ok(RuleMatch::no_match())
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn context() -> EmailContext {
        EmailContext {
            user_id: "u1".into(),
            email_id: "m1".into(),
            subject: "URGENT: server down".into(),
            sender: "ops@example.com".into(),
            snippet: "please take action required now".into(),
            labels: vec!["INBOX".into(), "IMPORTANT".into()],
            size_bytes: 50_000,
            has_attachments: false,
            date: Utc::now(),
        }
    }

    fn keyword_rule(keywords: &[&str], weight: f64) -> Rule {
        Rule {
            id: "kw".into(),
            name: "Keywords".into(),
            priority: 10,
            weight,
            kind: RuleKind::Keyword {
                keywords: keywords.iter().map(|s| s.to_string()).collect(),
            },
        }
    }

    #[test]
    fn keyword_matches_on_word_boundary_case_insensitive() {
        let mut eval = EvaluationContext::new();
        let rule = keyword_rule(&["urgent", "action required"], 5.0);
        let result = rule.evaluate(&context(), &mut eval).expect("evaluate");
        assert!(result.matched);
        assert_eq!(result.score, 10.0, "two keywords at weight 5");
        assert!(result.reason.as_deref().unwrap().contains("urgent"));
    }

    #[test]
    fn keyword_does_not_match_inside_words() {
        let mut eval = EvaluationContext::new();
        let mut ctx = context();
        ctx.subject = "concurrently scheduled".into();
        ctx.snippet = String::new();
        let rule = keyword_rule(&["urgent"], 5.0);
        let result = rule.evaluate(&ctx, &mut eval).expect("evaluate");
        assert!(!result.matched, "'urgent' inside 'concurrently' is no hit");
        assert_eq!(result.score, 0.0);
    }

    #[test]
    fn domain_matches_substring_of_sender() {
        let mut eval = EvaluationContext::new();
        let rule = Rule {
            id: "dom".into(),
            name: "Domains".into(),
            priority: 5,
            weight: 7.0,
            kind: RuleKind::Domain {
                domains: vec!["EXAMPLE.com".into()],
            },
        };
        let result = rule.evaluate(&context(), &mut eval).expect("evaluate");
        assert!(result.matched);
        assert_eq!(result.score, 7.0);
    }

    #[test]
    fn label_matches_case_insensitive_equality() {
        let mut eval = EvaluationContext::new();
        let rule = Rule {
            id: "lbl".into(),
            name: "Labels".into(),
            priority: 5,
            weight: 4.0,
            kind: RuleKind::Label {
                labels: vec!["important".into(), "STARRED".into()],
            },
        };
        let result = rule.evaluate(&context(), &mut eval).expect("evaluate");
        assert!(result.matched);
        assert_eq!(result.score, 4.0, "only IMPORTANT matches");
    }

    #[test]
    fn no_reply_matches_both_spellings() {
        let mut eval = EvaluationContext::new();
        let rule = Rule {
            id: "nr".into(),
            name: "No reply".into(),
            priority: 5,
            weight: -3.0,
            kind: RuleKind::NoReply,
        };

        let mut ctx = context();
        ctx.sender = "no-reply@shop.example".into();
        assert!(rule.evaluate(&ctx, &mut eval).expect("evaluate").matched);

        ctx.sender = "NoReply@shop.example".into();
        assert!(rule.evaluate(&ctx, &mut eval).expect("evaluate").matched);

        ctx.sender = "alice@shop.example".into();
        assert!(!rule.evaluate(&ctx, &mut eval).expect("evaluate").matched);
    }

    #[test]
    fn large_attachment_requires_flag_and_strict_size() {
        let mut eval = EvaluationContext::new();
        let rule = Rule {
            id: "big".into(),
            name: "Large attachment".into(),
            priority: 5,
            weight: 2.0,
            kind: RuleKind::LargeAttachment { min_size: 50_000 },
        };

        let mut ctx = context();
        ctx.has_attachments = true;
        ctx.size_bytes = 50_000;
        assert!(
            !rule.evaluate(&ctx, &mut eval).expect("evaluate").matched,
            "size equal to min_size is not over it"
        );

        ctx.size_bytes = 50_001;
        assert!(rule.evaluate(&ctx, &mut eval).expect("evaluate").matched);

        ctx.has_attachments = false;
        assert!(!rule.evaluate(&ctx, &mut eval).expect("evaluate").matched);
    }

    #[test]
    fn zero_weight_rule_never_changes_score() {
        let mut eval = EvaluationContext::new();
        let rule = keyword_rule(&["urgent"], 0.0);
        let result = rule.evaluate(&context(), &mut eval).expect("evaluate");
        assert!(result.matched);
        assert_eq!(result.score, 0.0);
    }

    #[test]
    fn parse_rejects_unknown_type() {
        let err = parse_rule(&json!({
            "id": "x", "name": "X", "type": "sentiment", "weight": 1.0
        }))
        .expect_err("unknown type must fail");
        match err {
            RuleError::UnknownType(name) => assert_eq!(name, "sentiment"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn parse_rejects_non_object_config() {
        let err = parse_rule(&json!("keyword")).expect_err("must fail");
        assert!(matches!(err, RuleError::NotAnObject(_)));
    }

    #[test]
    fn ruleset_orders_by_priority_then_insertion() {
        let set = RuleSet::parse(&[
            json!({"id": "a", "name": "A", "type": "noReply", "priority": 10, "weight": 1.0}),
            json!({"id": "b", "name": "B", "type": "noReply", "priority": 90, "weight": 1.0}),
            json!({"id": "c", "name": "C", "type": "noReply", "priority": 10, "weight": 1.0}),
        ])
        .expect("parse");

        let ids: Vec<&str> = set.rules().iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["b", "a", "c"], "desc priority, ties in order");
    }

    #[test]
    fn evaluation_is_deterministic() {
        let mut eval = EvaluationContext::new();
        let rule = keyword_rule(&["urgent", "alert"], 3.0);
        let first = rule.evaluate(&context(), &mut eval).expect("evaluate");
        let second = rule.evaluate(&context(), &mut eval).expect("evaluate");
        assert_eq!(first, second);
    }
}
