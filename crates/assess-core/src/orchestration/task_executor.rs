use std::sync::Arc;
use std::time::{Duration, SystemTime};

use crate::models::{
    CoreError, CoreErrorKind, ProviderName, ProviderResult, ProviderTaskRecord, RunId, SubjectRef,
    TaskError,
};
use crate::orchestration::CancellationToken;
use crate::persistence::{PersistRetry, StatusStore, write_with_retry};
use crate::providers::{IdempotencyKey, InvocationContext, ProviderInput};
use crate::registry::RegisteredProvider;
use crate::retry::{ErrorClass, RetryDecision};

/// Everything one provider attempt needs. `cell` is the live task record shared with
/// the coordinator.
pub struct TaskAttempt<'a> {
    pub run: RunId,
    pub subject: &'a SubjectRef,
    pub provider: &'a RegisteredProvider,
    pub cell: &'a tokio::sync::Mutex<ProviderTaskRecord>,
    pub cancellation: &'a CancellationToken,
}

#[derive(Clone, Debug, PartialEq)]
pub enum AttemptOutcome {
    Succeeded {
        peak_memory_bytes: Option<u64>,
    },
    FailedPermanent {
        error: CoreError,
    },
    RetryScheduled {
        next_attempt: u32,
        delay: Duration,
        peak_memory_bytes: Option<u64>,
    },
    /// The task reached a terminal state elsewhere, typically through cancellation.
    Superseded,
}

impl AttemptOutcome {
    /// Peak memory the adapter reported for this attempt, failed or not.
    pub fn peak_memory_bytes(&self) -> Option<u64> {
        match self {
            Self::Succeeded { peak_memory_bytes }
            | Self::RetryScheduled {
                peak_memory_bytes, ..
            } => *peak_memory_bytes,
            Self::FailedPermanent { error } => error.peak_memory_bytes(),
            Self::Superseded => None,
        }
    }
}

/// Runs single provider attempts and applies the resulting task transition.
pub struct TaskExecutor {
    store: Arc<dyn StatusStore>,
    persist_retry: PersistRetry,
}

impl TaskExecutor {
    pub fn new(store: Arc<dyn StatusStore>, persist_retry: PersistRetry) -> Self {
        Self {
            store,
            persist_retry,
        }
    }

    pub async fn execute(&self, attempt: TaskAttempt<'_>) -> AttemptOutcome {
        let name = attempt.provider.name().clone();

        let attempt_number = {
            let mut task = attempt.cell.lock().await;
            if task.state.is_terminal() {
                return AttemptOutcome::Superseded;
            }

            let mut next = task.clone();
            let attempt_number = match next.begin_attempt(SystemTime::now()) {
                Ok(number) => number,
                Err(error) => {
                    tracing::error!(
                        run_id = %attempt.run,
                        provider = %name,
                        message = %error.message,
                        "provider task could not start an attempt"
                    );
                    let error = attribute(error, attempt.run, &name);
                    return self.fail(&mut task, error).await;
                }
            };
            self.persist(&next).await;
            *task = next;
            attempt_number
        };

        let result = self
            .invoke(&attempt, &name, attempt_number)
            .await
            .map_err(|error| attribute(error, attempt.run, &name));

        let mut task = attempt.cell.lock().await;
        if task.state.is_terminal() {
            return AttemptOutcome::Superseded;
        }

        match result {
            Ok(result) => {
                let peak_memory_bytes = result.cost.peak_memory_bytes;
                let mut next = task.clone();
                if let Err(error) = next.succeed(result, SystemTime::now()) {
                    return self.fail(&mut task, error).await;
                }
                self.persist(&next).await;
                *task = next;
                tracing::debug!(
                    run_id = %attempt.run,
                    provider = %name,
                    attempt = attempt_number,
                    "provider attempt succeeded"
                );
                AttemptOutcome::Succeeded { peak_memory_bytes }
            }
            Err(error) => {
                let policy = &attempt.provider.profile.retry;
                let decision = if error.kind == CoreErrorKind::Cancelled {
                    RetryDecision::GiveUp {
                        class: ErrorClass::Permanent,
                        exhausted: false,
                    }
                } else {
                    policy.decide_with_jitter(&error, attempt_number)
                };

                match decision {
                    RetryDecision::Retry {
                        next_attempt,
                        delay,
                    } => {
                        let now = SystemTime::now();
                        let mut next = task.clone();
                        if let Err(transition) =
                            next.schedule_retry(TaskError::from(&error), now + delay, now)
                        {
                            return self.fail(&mut task, transition).await;
                        }
                        self.persist(&next).await;
                        *task = next;
                        tracing::warn!(
                            run_id = %attempt.run,
                            provider = %name,
                            attempt = attempt_number,
                            kind = error.kind.as_str(),
                            delay_ms = delay.as_millis() as u64,
                            message = %error.message,
                            "provider attempt failed; retry scheduled"
                        );
                        AttemptOutcome::RetryScheduled {
                            next_attempt,
                            delay,
                            peak_memory_bytes: error.peak_memory_bytes(),
                        }
                    }
                    RetryDecision::GiveUp { class, exhausted } => {
                        tracing::warn!(
                            run_id = %attempt.run,
                            provider = %name,
                            attempt = attempt_number,
                            kind = error.kind.as_str(),
                            class = ?class,
                            exhausted,
                            message = %error.message,
                            "provider attempt failed permanently"
                        );
                        self.fail(&mut task, error).await
                    }
                }
            }
        }
    }

    async fn invoke(
        &self,
        attempt: &TaskAttempt<'_>,
        name: &ProviderName,
        attempt_number: u32,
    ) -> Result<ProviderResult, CoreError> {
        let deadline = attempt.provider.profile.timeout;
        let context = InvocationContext {
            run: attempt.run,
            provider: name.clone(),
            attempt: attempt_number,
            idempotency_key: IdempotencyKey::derive(attempt.run, name, attempt_number),
            deadline,
            cancellation: attempt.cancellation.clone(),
        };
        let input = ProviderInput {
            subject: attempt.subject.clone(),
        };

        tokio::select! {
            _ = attempt.cancellation.cancelled() => {
                Err(CoreError::new(CoreErrorKind::Cancelled, "run cancelled"))
            }
            result = tokio::time::timeout(deadline, attempt.provider.adapter.invoke(context, input)) => {
                result.unwrap_or_else(|_| {
                    Err(CoreError::new(
                        CoreErrorKind::Timeout,
                        format!("provider call exceeded {}ms deadline", deadline.as_millis()),
                    ))
                })
            }
        }
    }

    async fn fail(&self, task: &mut ProviderTaskRecord, error: CoreError) -> AttemptOutcome {
        let mut next = task.clone();
        if next
            .fail_permanently(TaskError::from(&error), SystemTime::now())
            .is_err()
        {
            return AttemptOutcome::Superseded;
        }
        self.persist(&next).await;
        *task = next;
        AttemptOutcome::FailedPermanent { error }
    }

    /// In-memory state stays authoritative when the store keeps failing.
    async fn persist(&self, task: &ProviderTaskRecord) {
        let record = task.clone();
        let result = write_with_retry(&self.store, self.persist_retry, "put_task", move |store| {
            store.put_task(&record)
        })
        .await;

        if let Err(error) = result {
            tracing::error!(
                run_id = %task.run,
                provider = %task.provider,
                state = task.state.as_str(),
                message = %error.message,
                "failed to persist provider task state"
            );
        }
    }
}

fn attribute(error: CoreError, run: RunId, provider: &ProviderName) -> CoreError {
    error.for_run(run).for_provider(provider)
}
