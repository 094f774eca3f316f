pub mod cancellation;
pub mod run_coordinator;
pub mod task_executor;
pub mod worker_pool;

pub use cancellation::CancellationToken;
pub use run_coordinator::{RunCoordinator, RunCoordinatorConfig};
pub use task_executor::{AttemptOutcome, TaskAttempt, TaskExecutor};
pub use worker_pool::{
    Job, JobFuture, JobReport, LaneConfig, LaneStats, WorkerContext, WorkerPool, WorkerPoolConfig,
};

use crate::models::CoreError;

pub type OrchestrationResult<T> = Result<T, CoreError>;
