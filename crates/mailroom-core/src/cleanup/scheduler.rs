use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Datelike, Duration, SecondsFormat, TimeZone, Timelike, Utc, Weekday};
use libsql::{Row, params};
use serde_json::json;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::db::DbError;
use crate::factory::{UserDatabase, UserDbFactory};
use crate::jobs::queue::JobQueue;
use crate::jobs::store::{JOB_TYPE_CLEANUP, JobStatusStore};

const SCHEDULE_COLUMNS: &str =
    "id, user_id, policy_id, schedule_type, expression, enabled, last_fired_at, created_at, updated_at";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleType {
    Daily,
    Weekly,
    Monthly,
    Interval,
    Cron,
}

impl ScheduleType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScheduleType::Daily => "daily",
            ScheduleType::Weekly => "weekly",
            ScheduleType::Monthly => "monthly",
            ScheduleType::Interval => "interval",
            ScheduleType::Cron => "cron",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        match value {
            "daily" => Some(Self::Daily),
            "weekly" => Some(Self::Weekly),
            "monthly" => Some(Self::Monthly),
            "interval" => Some(Self::Interval),
            "cron" => Some(Self::Cron),
            _ => None,
        }
    }
}

#[derive(Debug, Error)]
pub enum ScheduleError {
    #[error("database error: {0}")]
    Database(#[from] DbError),
    #[error("sql error: {0}")]
    Sql(#[from] libsql::Error),
    #[error("datetime parse error: {0}")]
    DateTimeParse(#[from] chrono::ParseError),
    #[error("unknown schedule type {0:?}")]
    UnknownType(String),
    #[error("invalid {kind} expression {expression:?}")]
    InvalidExpression { kind: &'static str, expression: String },
    #[error("schedule not found: {0}")]
    NotFound(String),
    #[error("policy not found: {0}")]
    PolicyNotFound(String),
}

/// Parsed firing rule. Fires are wall-clock; missed ticks during downtime
/// are not replayed, only the next upcoming one runs.
#[derive(Debug, Clone, PartialEq)]
pub enum ScheduleExpression {
    Daily { hour: u32, minute: u32 },
    Weekly { weekday: Weekday, hour: u32, minute: u32 },
    Monthly { day: u32, hour: u32, minute: u32 },
    Interval { millis: u64 },
    Cron(CronSpec),
}

#[derive(Debug, Clone, PartialEq)]
pub struct CronSpec {
    pub minute: CronField,
    pub hour: CronField,
    pub day: CronField,
    pub month: CronField,
    pub weekday: CronField,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CronField {
    Any,
    Step(u32),
    Values(Vec<u32>),
}

impl CronField {
    fn matches(&self, value: u32) -> bool {
        match self {
            CronField::Any => true,
            CronField::Step(step) => *step > 0 && value % step == 0,
            CronField::Values(values) => values.contains(&value),
        }
    }

    fn is_restricted(&self) -> bool {
        !matches!(self, CronField::Any)
    }

    fn parse(raw: &str) -> Option<Self> {
        if raw == "*" {
            return Some(CronField::Any);
        }
        if let Some(step) = raw.strip_prefix("*/") {
            return step.parse().ok().map(CronField::Step);
        }
        let mut values = Vec::new();
        for part in raw.split(',') {
            if let Some((start, end)) = part.split_once('-') {
                let start: u32 = start.parse().ok()?;
                let end: u32 = end.parse().ok()?;
                if end < start {
                    return None;
                }
                values.extend(start..=end);
            } else {
                values.push(part.parse().ok()?);
            }
        }
        Some(CronField::Values(values))
    }
}

impl ScheduleExpression {
    pub fn parse(schedule_type: ScheduleType, expression: &str) -> Result<Self, ScheduleError> {
        let invalid = |kind: &'static str| ScheduleError::InvalidExpression {
            kind,
            expression: expression.to_string(),
        };

        match schedule_type {
            ScheduleType::Daily => {
                let (hour, minute) = parse_hh_mm(expression).ok_or_else(|| invalid("daily"))?;
                Ok(Self::Daily { hour, minute })
            }
            ScheduleType::Weekly => {
                let (day, rest) = expression.split_once(':').ok_or_else(|| invalid("weekly"))?;
                let weekday = parse_weekday(day).ok_or_else(|| invalid("weekly"))?;
                let (hour, minute) = parse_hh_mm(rest).ok_or_else(|| invalid("weekly"))?;
                Ok(Self::Weekly {
                    weekday,
                    hour,
                    minute,
                })
            }
            ScheduleType::Monthly => {
                let (day, rest) = expression.split_once(':').ok_or_else(|| invalid("monthly"))?;
                let day: u32 = day.parse().map_err(|_| invalid("monthly"))?;
                if !(1..=31).contains(&day) {
                    return Err(invalid("monthly"));
                }
                let (hour, minute) = parse_hh_mm(rest).ok_or_else(|| invalid("monthly"))?;
                Ok(Self::Monthly { day, hour, minute })
            }
            ScheduleType::Interval => {
                let millis: u64 = expression.trim().parse().map_err(|_| invalid("interval"))?;
                if millis == 0 {
                    return Err(invalid("interval"));
                }
                Ok(Self::Interval { millis })
            }
            ScheduleType::Cron => {
                let fields: Vec<&str> = expression.split_whitespace().collect();
                if fields.len() != 5 {
                    return Err(invalid("cron"));
                }
                let parsed: Vec<CronField> = fields
                    .iter()
                    .map(|raw| CronField::parse(raw))
                    .collect::<Option<_>>()
                    .ok_or_else(|| invalid("cron"))?;
                let mut iter = parsed.into_iter();
                Ok(Self::Cron(CronSpec {
                    minute: iter.next().unwrap(),
                    hour: iter.next().unwrap(),
                    day: iter.next().unwrap(),
                    month: iter.next().unwrap(),
                    weekday: iter.next().unwrap(),
                }))
            }
        }
    }

    /// First wall-clock instant strictly after `after` at which this
    /// schedule fires.
    pub fn next_fire(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            Self::Daily { hour, minute } => {
                let candidate = at_time(after.date_naive(), *hour, *minute)?;
                if candidate > after {
                    Some(candidate)
                } else {
                    at_time(after.date_naive() + Duration::days(1), *hour, *minute)
                }
            }
            Self::Weekly {
                weekday,
                hour,
                minute,
            } => {
                for offset in 0..=7 {
                    let date = after.date_naive() + Duration::days(offset);
                    if date.weekday() == *weekday {
                        let candidate = at_time(date, *hour, *minute)?;
                        if candidate > after {
                            return Some(candidate);
                        }
                    }
                }
                None
            }
            Self::Monthly { day, hour, minute } => {
                let mut year = after.year();
                let mut month = after.month();
                for _ in 0..48 {
                    if let Some(date) = chrono::NaiveDate::from_ymd_opt(year, month, *day) {
                        let candidate = at_time(date, *hour, *minute)?;
                        if candidate > after {
                            return Some(candidate);
                        }
                    }
                    month += 1;
                    if month > 12 {
                        month = 1;
                        year += 1;
                    }
                }
                None
            }
            Self::Interval { millis } => {
                Some(after + Duration::milliseconds(*millis as i64))
            }
            Self::Cron(spec) => {
                // Minute-resolution scan, bounded at 366 days.
                let mut candidate = truncate_to_minute(after) + Duration::minutes(1);
                for _ in 0..(366 * 24 * 60) {
                    if cron_matches(spec, candidate) {
                        return Some(candidate);
                    }
                    candidate += Duration::minutes(1);
                }
                None
            }
        }
    }
}

fn cron_matches(spec: &CronSpec, at: DateTime<Utc>) -> bool {
    if !spec.minute.matches(at.minute()) || !spec.hour.matches(at.hour()) {
        return false;
    }
    if !spec.month.matches(at.month()) {
        return false;
    }

    let dom = spec.day.matches(at.day());
    let dow = spec
        .weekday
        .matches(at.weekday().num_days_from_sunday());
    // Standard cron: when both day fields are restricted, either may match.
    match (spec.day.is_restricted(), spec.weekday.is_restricted()) {
        (true, true) => dom || dow,
        (true, false) => dom,
        (false, true) => dow,
        (false, false) => true,
    }
}

fn parse_hh_mm(raw: &str) -> Option<(u32, u32)> {
    let (hour, minute) = raw.trim().split_once(':')?;
    let hour: u32 = hour.parse().ok()?;
    let minute: u32 = minute.parse().ok()?;
    if hour > 23 || minute > 59 {
        return None;
    }
    Some((hour, minute))
}

fn parse_weekday(raw: &str) -> Option<Weekday> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "mon" | "monday" | "1" => Some(Weekday::Mon),
        "tue" | "tuesday" | "2" => Some(Weekday::Tue),
        "wed" | "wednesday" | "3" => Some(Weekday::Wed),
        "thu" | "thursday" | "4" => Some(Weekday::Thu),
        "fri" | "friday" | "5" => Some(Weekday::Fri),
        "sat" | "saturday" | "6" => Some(Weekday::Sat),
        "sun" | "sunday" | "0" => Some(Weekday::Sun),
        _ => None,
    }
}

fn at_time(date: chrono::NaiveDate, hour: u32, minute: u32) -> Option<DateTime<Utc>> {
    let naive = date.and_hms_opt(hour, minute, 0)?;
    Utc.from_local_datetime(&naive).single()
}

fn truncate_to_minute(at: DateTime<Utc>) -> DateTime<Utc> {
    at - Duration::seconds(at.second() as i64)
        - Duration::nanoseconds(at.timestamp_subsec_nanos() as i64)
}

#[derive(Debug, Clone, PartialEq)]
pub struct CleanupSchedule {
    pub id: String,
    pub user_id: String,
    pub policy_id: String,
    pub schedule_type: ScheduleType,
    pub expression: String,
    pub enabled: bool,
    pub last_fired_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct ScheduleRepository {
    db: UserDatabase,
}

impl ScheduleRepository {
    pub fn new(db: UserDatabase) -> Self {
        Self { db }
    }

    pub async fn create(
        &self,
        policy_id: &str,
        schedule_type: ScheduleType,
        expression: &str,
        enabled: bool,
    ) -> Result<CleanupSchedule, ScheduleError> {
        // Fail fast on unparseable expressions and dangling policy ids.
        ScheduleExpression::parse(schedule_type, expression)?;
        let conn = self.db.connection().await?;
        let mut rows = conn
            .query(
                "SELECT 1 FROM cleanup_policies WHERE id = ?1 AND user_id = ?2",
                params![policy_id, self.db.user_id()],
            )
            .await?;
        if rows.next().await?.is_none() {
            return Err(ScheduleError::PolicyNotFound(policy_id.to_string()));
        }

        let id = Uuid::new_v4().to_string();
        let now = now_rfc3339();
        let mut rows = conn
            .query(
                &format!(
                    "INSERT INTO cleanup_schedules (id, user_id, policy_id, schedule_type, expression, enabled, created_at, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)
                     RETURNING {SCHEDULE_COLUMNS}"
                ),
                params![
                    id.as_str(),
                    self.db.user_id(),
                    policy_id,
                    schedule_type.as_str(),
                    expression,
                    enabled as i64,
                    now
                ],
            )
            .await?;

        match rows.next().await? {
            Some(row) => row_to_schedule(row),
            None => Err(ScheduleError::NotFound(id)),
        }
    }

    pub async fn list(&self) -> Result<Vec<CleanupSchedule>, ScheduleError> {
        let conn = self.db.connection().await?;
        let mut rows = conn
            .query(
                &format!(
                    "SELECT {SCHEDULE_COLUMNS} FROM cleanup_schedules
                     WHERE user_id = ?1 ORDER BY created_at"
                ),
                params![self.db.user_id()],
            )
            .await?;

        let mut schedules = Vec::new();
        while let Some(row) = rows.next().await? {
            schedules.push(row_to_schedule(row)?);
        }
        Ok(schedules)
    }

    pub async fn set_enabled(&self, schedule_id: &str, enabled: bool) -> Result<(), ScheduleError> {
        let now = now_rfc3339();
        let conn = self.db.connection().await?;
        let mut rows = conn
            .query(
                "UPDATE cleanup_schedules SET enabled = ?3, updated_at = ?4
                 WHERE id = ?1 AND user_id = ?2 RETURNING id",
                params![schedule_id, self.db.user_id(), enabled as i64, now],
            )
            .await?;
        if rows.next().await?.is_none() {
            return Err(ScheduleError::NotFound(schedule_id.to_string()));
        }
        Ok(())
    }

    pub async fn mark_fired(
        &self,
        schedule_id: &str,
        at: DateTime<Utc>,
    ) -> Result<(), ScheduleError> {
        let fired = at.to_rfc3339_opts(SecondsFormat::Millis, true);
        let conn = self.db.connection().await?;
        let mut rows = conn
            .query(
                "UPDATE cleanup_schedules SET last_fired_at = ?3, updated_at = ?3
                 WHERE id = ?1 AND user_id = ?2 RETURNING id",
                params![schedule_id, self.db.user_id(), fired],
            )
            .await?;
        if rows.next().await?.is_none() {
            return Err(ScheduleError::NotFound(schedule_id.to_string()));
        }
        Ok(())
    }
}

fn row_to_schedule(row: Row) -> Result<CleanupSchedule, ScheduleError> {
    let type_str: String = row.get(3)?;
    let enabled: i64 = row.get(5)?;
    let last_fired_at: Option<String> = row.get(6)?;
    let created_at: String = row.get(7)?;
    let updated_at: String = row.get(8)?;

    Ok(CleanupSchedule {
        id: row.get(0)?,
        user_id: row.get(1)?,
        policy_id: row.get(2)?,
        schedule_type: ScheduleType::from_str(&type_str)
            .ok_or(ScheduleError::UnknownType(type_str))?,
        expression: row.get(4)?,
        enabled: enabled != 0,
        last_fired_at: last_fired_at
            .map(|value| {
                DateTime::parse_from_rfc3339(&value).map(|parsed| parsed.with_timezone(&Utc))
            })
            .transpose()?,
        created_at: DateTime::parse_from_rfc3339(&created_at)?.with_timezone(&Utc),
        updated_at: DateTime::parse_from_rfc3339(&updated_at)?.with_timezone(&Utc),
    })
}

fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Ticker that fires due schedules by submitting cleanup jobs. Baseline for
/// "due" is the later of the schedule's last firing and scheduler startup,
/// which is what makes missed downtime ticks skip instead of replay.
pub async fn run_scheduler(
    factory: Arc<UserDbFactory>,
    store: Arc<JobStatusStore>,
    queue: Arc<JobQueue>,
    tick: StdDuration,
    shutdown: CancellationToken,
) {
    let started = Utc::now();
    info!("cleanup scheduler started");

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = tokio::time::sleep(tick) => {}
        }

        let now = Utc::now();
        for user_id in factory.known_users().await {
            let db = match factory.database_for(&user_id).await {
                Ok(db) => db,
                Err(err) => {
                    warn!(user_id, error = %err, "scheduler could not open user db");
                    continue;
                }
            };
            let repo = ScheduleRepository::new(db);
            let schedules = match repo.list().await {
                Ok(schedules) => schedules,
                Err(err) => {
                    warn!(user_id, error = %err, "scheduler could not list schedules");
                    continue;
                }
            };

            for schedule in schedules.into_iter().filter(|s| s.enabled) {
                let expression =
                    match ScheduleExpression::parse(schedule.schedule_type, &schedule.expression) {
                        Ok(expression) => expression,
                        Err(err) => {
                            warn!(schedule_id = %schedule.id, error = %err, "unparseable schedule");
                            continue;
                        }
                    };

                let baseline = schedule.last_fired_at.map_or(started, |t| t.max(started));
                let due = match expression.next_fire(baseline) {
                    Some(due) => due,
                    None => continue,
                };
                if due > now {
                    continue;
                }

                let params = json!({
                    "policy_id": schedule.policy_id,
                    "user_context": {"user_id": user_id, "session_id": "scheduler"},
                    "trigger": "schedule",
                    "schedule_id": schedule.id,
                });
                match store.create(JOB_TYPE_CLEANUP, params, &user_id).await {
                    Ok(job_id) => {
                        queue.enqueue(job_id.clone(), user_id.clone());
                        info!(schedule_id = %schedule.id, job_id, "schedule fired");
                        if let Err(err) = repo.mark_fired(&schedule.id, now).await {
                            warn!(schedule_id = %schedule.id, error = %err, "failed to stamp firing");
                        }
                    }
                    Err(err) => {
                        warn!(schedule_id = %schedule.id, error = %err, "failed to submit scheduled job");
                    }
                }
            }
        }
    }

    info!("cleanup scheduler stopped");
}
