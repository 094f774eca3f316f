pub mod error;
pub mod provider;
pub mod run;
pub mod task;

pub use error::{CoreError, CoreErrorKind};
pub use provider::{CostInfo, ProviderName, ProviderResult, QueueClass};
pub use run::{
    ProviderStatus, RunCompletion, RunId, RunRecord, RunState, RunStatus, SubjectRef,
    aggregate_run_state,
};
pub use task::{ProviderTaskRecord, ProviderTaskState, TaskError};
