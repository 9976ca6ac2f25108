pub mod engine;
pub mod policy;
pub mod scheduler;

pub use engine::{CleanupEngine, CleanupError, CleanupRunReport, Recommendation, report_json};
pub use policy::{
    ArchiveRecord, ArchiveRecordRepository, CleanupAction, CleanupMethod, CleanupPolicy,
    NewCleanupPolicy, PolicyActionSpec, PolicyCriteria, PolicyError, PolicyPatch,
    PolicyRepository, PolicySafety,
};
pub use scheduler::{
    CleanupSchedule, CronField, CronSpec, ScheduleError, ScheduleExpression, ScheduleRepository,
    ScheduleType, run_scheduler,
};
