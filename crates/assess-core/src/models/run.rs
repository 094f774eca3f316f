use std::fmt::{Display, Formatter};
use std::time::SystemTime;

use serde::{Deserialize, Serialize};

use crate::models::{
    ProviderName, ProviderResult, ProviderTaskRecord, ProviderTaskState, TaskError,
};

#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(pub u64);

impl Display for RunId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Opaque reference to the thing being assessed. Never interpreted here.
#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubjectRef(String);

impl SubjectRef {
    pub fn new(subject: impl Into<String>) -> Self {
        Self(subject.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for SubjectRef {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Created,
    InProgress,
    PartiallyCompleted,
    Completed,
    Failed,
}

impl RunState {
    pub const ALL: [RunState; 5] = [
        RunState::Created,
        RunState::InProgress,
        RunState::PartiallyCompleted,
        RunState::Completed,
        RunState::Failed,
    ];

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::PartiallyCompleted | Self::Completed | Self::Failed
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::InProgress => "in_progress",
            Self::PartiallyCompleted => "partially_completed",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|state| state.as_str() == raw)
    }
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub id: RunId,
    pub subject: SubjectRef,
    pub state: RunState,
    pub created_at: SystemTime,
    pub started_at: Option<SystemTime>,
    pub finished_at: Option<SystemTime>,
    pub failure_reason: Option<String>,
}

impl RunRecord {
    pub fn created(id: RunId, subject: SubjectRef, now: SystemTime) -> Self {
        Self {
            id,
            subject,
            state: RunState::Created,
            created_at: now,
            started_at: None,
            finished_at: None,
            failure_reason: None,
        }
    }
}

/// Derives the terminal run state from its task states.
///
/// Returns `None` while any task is still in flight, and for an empty task set.
pub fn aggregate_run_state(
    states: impl IntoIterator<Item = ProviderTaskState>,
) -> Option<RunState> {
    let mut succeeded = 0usize;
    let mut failed = 0usize;
    for state in states {
        match state {
            ProviderTaskState::Succeeded => succeeded += 1,
            ProviderTaskState::FailedPermanent => failed += 1,
            _ => return None,
        }
    }

    match (succeeded, failed) {
        (0, 0) => None,
        (_, 0) => Some(RunState::Completed),
        (0, _) => Some(RunState::Failed),
        _ => Some(RunState::PartiallyCompleted),
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProviderStatus {
    pub name: ProviderName,
    pub state: ProviderTaskState,
    pub attempts: u32,
    pub max_attempts: u32,
    pub error: Option<TaskError>,
    pub result: Option<ProviderResult>,
}

impl From<ProviderTaskRecord> for ProviderStatus {
    fn from(task: ProviderTaskRecord) -> Self {
        Self {
            name: task.provider,
            state: task.state,
            attempts: task.attempts,
            max_attempts: task.max_attempts,
            error: task.last_error,
            result: task.result,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RunStatus {
    pub run: RunRecord,
    pub percent_complete: f64,
    pub providers: Vec<ProviderStatus>,
}

impl RunStatus {
    /// The last task only counts once the run itself is terminal, so 100% is reported
    /// iff the run has been aggregated.
    pub fn new(run: RunRecord, tasks: Vec<ProviderTaskRecord>) -> Self {
        let total = tasks.len();
        let terminal = tasks.iter().filter(|task| task.state.is_terminal()).count();
        let percent_complete = if run.state.is_terminal() {
            100.0
        } else if total == 0 {
            0.0
        } else {
            (terminal.min(total - 1) as f64 / total as f64) * 100.0
        };

        Self {
            run,
            percent_complete,
            providers: tasks.into_iter().map(ProviderStatus::from).collect(),
        }
    }

    pub fn state(&self) -> RunState {
        self.run.state
    }

    pub fn provider(&self, name: &str) -> Option<&ProviderStatus> {
        self.providers
            .iter()
            .find(|provider| provider.name.as_str() == name)
    }
}

/// Emitted exactly once per run when it reaches a terminal state.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct RunCompletion {
    pub run: RunId,
    pub subject: SubjectRef,
    pub state: RunState,
    pub failure_reason: Option<String>,
    pub finished_at: SystemTime,
}
