pub mod analysis;
pub mod auth;
pub mod cache;
pub mod cleanup;
pub mod config;
pub mod db;
pub mod emails;
pub mod factory;
pub mod gmail;
pub mod jobs;
pub mod labels;
pub mod migrations;
pub mod resources;
pub mod rules;
pub mod searches;
pub mod sessions;
pub mod telemetry;
pub mod tools;

pub use analysis::{
    Analyzer, AnalyzerFactory, CategorizationOptions, CategorizationOutcome, ImportanceAnalyzer,
    Orchestrator,
};
pub use auth::{AuthError, Authenticator, FileTokenStore, StaticAuthenticator, TokenStore};
pub use cache::{CacheStats, UserCache};
pub use cleanup::{
    CleanupEngine, CleanupPolicy, CleanupSchedule, NewCleanupPolicy, PolicyRepository,
    ScheduleRepository, run_scheduler,
};
pub use config::{CategorizationConfig, Config, ConfigError};
pub use db::Database;
pub use emails::{EmailCriteria, EmailIndex, EmailRepository, NewEmail, PriorityCategory};
pub use factory::{UserDatabase, UserDbFactory};
pub use gmail::{GmailRestClient, MailApi, MailApiError};
pub use jobs::{
    JOB_TYPE_CATEGORIZATION, JOB_TYPE_CLEANUP, JobDispatcher, JobQueue, JobRecord, JobStatus,
    JobStatusStore, WorkerConfig, run_worker,
};
pub use resources::{ResourceError, Resources};
pub use rules::{EmailContext, Rule, RuleKind, RuleSet};
pub use searches::SavedSearchRepository;
pub use sessions::{Session, SessionManager, UserContext};
pub use telemetry::{TelemetryError, TelemetryGuard, init_telemetry};
pub use tools::{ToolDispatcher, ToolError, tool_definitions};
