mod categorize;
mod cleanup;
pub mod dispatch;
pub mod queue;
pub mod store;
pub mod worker;

pub use dispatch::JobDispatcher;
pub use queue::JobQueue;
pub use store::{
    JOB_TYPE_CATEGORIZATION, JOB_TYPE_CLEANUP, JobFilter, JobRecord, JobStatus, JobStatusStore,
    JobStoreError, JobUpdate, RecoveryReport,
};
pub use worker::{JobError, JobExecutor, WorkerConfig, run_worker};
