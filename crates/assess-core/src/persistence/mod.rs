pub mod in_memory;

use std::sync::Arc;
use std::time::Duration;

use crate::models::{CoreError, CoreErrorKind, ProviderTaskRecord, RunId, RunRecord};

pub use in_memory::InMemoryStatusStore;

pub type PersistenceResult<T> = Result<T, CoreError>;

pub trait MigrationStore: Send + Sync {
    fn current_version(&self) -> PersistenceResult<i64>;

    fn apply_migration(&self, target_version: i64) -> PersistenceResult<()>;
}

/// Durable record of runs and their provider tasks.
///
/// Writes are upserts keyed by run id and `(run id, provider)`. Storing a terminal run
/// while any of its stored tasks is non-terminal is refused.
pub trait StatusStore: Send + Sync {
    fn put_task(&self, task: &ProviderTaskRecord) -> PersistenceResult<()>;

    fn put_run(&self, run: &RunRecord) -> PersistenceResult<()>;

    fn get_run(&self, run: RunId) -> PersistenceResult<Option<RunRecord>>;

    fn list_tasks(&self, run: RunId) -> PersistenceResult<Vec<ProviderTaskRecord>>;

    fn max_run_id(&self) -> PersistenceResult<Option<RunId>> {
        Ok(None)
    }
}

/// Bounded retry for store writes.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct PersistRetry {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for PersistRetry {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(50),
        }
    }
}

impl PersistRetry {
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.base_delay.saturating_mul(factor)
    }
}

/// Runs a blocking store write off the async runtime, retrying with doubling delays.
pub async fn write_with_retry<F>(
    store: &Arc<dyn StatusStore>,
    retry: PersistRetry,
    operation: &'static str,
    write: F,
) -> PersistenceResult<()>
where
    F: Fn(&dyn StatusStore) -> PersistenceResult<()> + Clone + Send + 'static,
{
    let max_attempts = retry.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        let store = Arc::clone(store);
        let write = write.clone();
        let result = tokio::task::spawn_blocking(move || write(store.as_ref()))
            .await
            .map_err(|join_error| {
                CoreError::new(
                    CoreErrorKind::Internal,
                    format!("store write join failure: {join_error}"),
                )
            })
            .and_then(|result| result);

        match result {
            Ok(()) => return Ok(()),
            Err(error) if attempt < max_attempts => {
                let delay = retry.delay_for_attempt(attempt);
                tracing::warn!(
                    operation,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    message = %error.message,
                    "store write failed; retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(error) => return Err(error),
        }
    }
}

/// Reads from a store on the blocking pool.
pub async fn read_blocking<T, F>(store: &Arc<dyn StatusStore>, read: F) -> PersistenceResult<T>
where
    T: Send + 'static,
    F: FnOnce(&dyn StatusStore) -> PersistenceResult<T> + Send + 'static,
{
    let store = Arc::clone(store);
    tokio::task::spawn_blocking(move || read(store.as_ref()))
        .await
        .map_err(|join_error| {
            CoreError::new(
                CoreErrorKind::Internal,
                format!("store read join failure: {join_error}"),
            )
        })?
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::PersistRetry;

    #[test]
    fn persist_retry_delay_doubles() {
        let retry = PersistRetry {
            max_attempts: 4,
            base_delay: Duration::from_millis(10),
        };
        assert_eq!(retry.delay_for_attempt(1), Duration::from_millis(10));
        assert_eq!(retry.delay_for_attempt(2), Duration::from_millis(20));
        assert_eq!(retry.delay_for_attempt(3), Duration::from_millis(40));
    }
}
