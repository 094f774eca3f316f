use std::time::SystemTime;

use serde::{Deserialize, Serialize};

use crate::models::{CoreError, CoreErrorKind, ProviderName, ProviderResult, QueueClass, RunId};

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderTaskState {
    Pending,
    Running,
    RetryScheduled,
    Succeeded,
    FailedPermanent,
}

impl ProviderTaskState {
    pub const ALL: [ProviderTaskState; 5] = [
        ProviderTaskState::Pending,
        ProviderTaskState::Running,
        ProviderTaskState::RetryScheduled,
        ProviderTaskState::Succeeded,
        ProviderTaskState::FailedPermanent,
    ];

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::FailedPermanent)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::RetryScheduled => "retry_scheduled",
            Self::Succeeded => "succeeded",
            Self::FailedPermanent => "failed_permanent",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|state| state.as_str() == raw)
    }
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct TaskError {
    pub kind: CoreErrorKind,
    pub message: String,
}

impl From<&CoreError> for TaskError {
    fn from(error: &CoreError) -> Self {
        Self {
            kind: error.kind,
            message: error.message.clone(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProviderTaskRecord {
    pub run: RunId,
    pub provider: ProviderName,
    pub queue_class: QueueClass,
    pub state: ProviderTaskState,
    pub attempts: u32,
    pub max_attempts: u32,
    pub last_error: Option<TaskError>,
    pub result: Option<ProviderResult>,
    pub created_at: SystemTime,
    pub updated_at: SystemTime,
    pub next_attempt_at: Option<SystemTime>,
}

impl ProviderTaskRecord {
    pub fn pending(
        run: RunId,
        provider: ProviderName,
        queue_class: QueueClass,
        max_attempts: u32,
        now: SystemTime,
    ) -> Self {
        Self {
            run,
            provider,
            queue_class,
            state: ProviderTaskState::Pending,
            attempts: 0,
            max_attempts,
            last_error: None,
            result: None,
            created_at: now,
            updated_at: now,
            next_attempt_at: None,
        }
    }

    /// Moves a pending or retry-scheduled task into `Running` and returns the new
    /// attempt number.
    pub fn begin_attempt(&mut self, now: SystemTime) -> Result<u32, CoreError> {
        if !matches!(
            self.state,
            ProviderTaskState::Pending | ProviderTaskState::RetryScheduled
        ) {
            return Err(self.invalid_transition(ProviderTaskState::Running));
        }
        if self.attempts >= self.max_attempts {
            return Err(CoreError::new(
                CoreErrorKind::Internal,
                format!(
                    "task '{}' already used all {} attempts",
                    self.provider, self.max_attempts
                ),
            )
            .for_run(self.run)
            .for_provider(&self.provider));
        }

        self.attempts += 1;
        self.state = ProviderTaskState::Running;
        self.next_attempt_at = None;
        self.updated_at = now;
        Ok(self.attempts)
    }

    pub fn succeed(&mut self, result: ProviderResult, now: SystemTime) -> Result<(), CoreError> {
        if self.state != ProviderTaskState::Running {
            return Err(self.invalid_transition(ProviderTaskState::Succeeded));
        }
        self.state = ProviderTaskState::Succeeded;
        self.result = Some(result);
        self.updated_at = now;
        Ok(())
    }

    pub fn schedule_retry(
        &mut self,
        error: TaskError,
        next_attempt_at: SystemTime,
        now: SystemTime,
    ) -> Result<(), CoreError> {
        if self.state != ProviderTaskState::Running {
            return Err(self.invalid_transition(ProviderTaskState::RetryScheduled));
        }
        self.state = ProviderTaskState::RetryScheduled;
        self.last_error = Some(error);
        self.next_attempt_at = Some(next_attempt_at);
        self.updated_at = now;
        Ok(())
    }

    /// Any non-terminal state may fail permanently; cancellation relies on this.
    pub fn fail_permanently(&mut self, error: TaskError, now: SystemTime) -> Result<(), CoreError> {
        if self.state.is_terminal() {
            return Err(self.invalid_transition(ProviderTaskState::FailedPermanent));
        }
        self.state = ProviderTaskState::FailedPermanent;
        self.last_error = Some(error);
        self.next_attempt_at = None;
        self.updated_at = now;
        Ok(())
    }

    fn invalid_transition(&self, desired: ProviderTaskState) -> CoreError {
        CoreError::new(
            CoreErrorKind::InvalidInput,
            format!(
                "task '{}' cannot transition from '{}' to '{}'",
                self.provider,
                self.state.as_str(),
                desired.as_str()
            ),
        )
        .for_run(self.run)
        .for_provider(&self.provider)
    }
}

#[cfg(test)]
mod tests {
    use std::time::SystemTime;

    use super::{ProviderTaskRecord, ProviderTaskState, TaskError};
    use crate::models::{CoreErrorKind, CostInfo, ProviderName, ProviderResult, QueueClass, RunId};

    fn record(max_attempts: u32) -> ProviderTaskRecord {
        ProviderTaskRecord::pending(
            RunId(1),
            ProviderName::new("security_headers"),
            QueueClass::Assessment,
            max_attempts,
            SystemTime::now(),
        )
    }

    fn upstream() -> TaskError {
        TaskError {
            kind: CoreErrorKind::Upstream,
            message: "503".to_string(),
        }
    }

    #[test]
    fn attempts_never_exceed_max() {
        let mut task = record(2);
        let now = SystemTime::now();

        assert_eq!(task.begin_attempt(now).unwrap(), 1);
        task.schedule_retry(upstream(), now, now).unwrap();
        assert_eq!(task.begin_attempt(now).unwrap(), 2);
        task.schedule_retry(upstream(), now, now).unwrap();

        let error = task.begin_attempt(now).unwrap_err();
        assert_eq!(error.kind, CoreErrorKind::Internal);
        assert_eq!(task.attempts, 2);
    }

    #[test]
    fn terminal_states_are_immutable() {
        let mut task = record(3);
        let now = SystemTime::now();
        task.begin_attempt(now).unwrap();
        task.succeed(
            ProviderResult {
                payload: serde_json::json!({"score": 91}),
                cost: CostInfo::default(),
            },
            now,
        )
        .unwrap();

        assert!(task.fail_permanently(upstream(), now).is_err());
        assert!(task.begin_attempt(now).is_err());
        assert_eq!(task.state, ProviderTaskState::Succeeded);
    }

    #[test]
    fn pending_task_can_be_failed_by_cancellation() {
        let mut task = record(3);
        task.fail_permanently(
            TaskError {
                kind: CoreErrorKind::Cancelled,
                message: "run cancelled".to_string(),
            },
            SystemTime::now(),
        )
        .unwrap();

        assert_eq!(task.state, ProviderTaskState::FailedPermanent);
        assert_eq!(task.attempts, 0);
    }
}
