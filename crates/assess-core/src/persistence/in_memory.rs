use std::collections::{BTreeMap, HashMap};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::models::{
    CoreError, CoreErrorKind, ProviderName, ProviderTaskRecord, RunId, RunRecord,
};
use crate::persistence::{PersistenceResult, StatusStore};

#[derive(Default)]
struct RunEntry {
    run: Option<RunRecord>,
    tasks: BTreeMap<ProviderName, ProviderTaskRecord>,
}

/// Process-local [`StatusStore`]; contents are lost on exit.
#[derive(Default)]
pub struct InMemoryStatusStore {
    runs: RwLock<HashMap<RunId, RunEntry>>,
}

impl InMemoryStatusStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> PersistenceResult<RwLockReadGuard<'_, HashMap<RunId, RunEntry>>> {
        self.runs.read().map_err(|_| poisoned())
    }

    fn write(&self) -> PersistenceResult<RwLockWriteGuard<'_, HashMap<RunId, RunEntry>>> {
        self.runs.write().map_err(|_| poisoned())
    }
}

impl StatusStore for InMemoryStatusStore {
    fn put_task(&self, task: &ProviderTaskRecord) -> PersistenceResult<()> {
        let mut runs = self.write()?;
        runs.entry(task.run)
            .or_default()
            .tasks
            .insert(task.provider.clone(), task.clone());
        Ok(())
    }

    fn put_run(&self, run: &RunRecord) -> PersistenceResult<()> {
        let mut runs = self.write()?;
        let entry = runs.entry(run.id).or_default();

        if run.state.is_terminal()
            && let Some(task) = entry.tasks.values().find(|task| !task.state.is_terminal())
        {
            return Err(CoreError::new(
                CoreErrorKind::StorageFailure,
                format!(
                    "run {} cannot be stored as '{}' while task '{}' is '{}'",
                    run.id,
                    run.state.as_str(),
                    task.provider,
                    task.state.as_str()
                ),
            )
            .for_run(run.id));
        }

        entry.run = Some(run.clone());
        Ok(())
    }

    fn get_run(&self, run: RunId) -> PersistenceResult<Option<RunRecord>> {
        Ok(self.read()?.get(&run).and_then(|entry| entry.run.clone()))
    }

    fn list_tasks(&self, run: RunId) -> PersistenceResult<Vec<ProviderTaskRecord>> {
        Ok(self
            .read()?
            .get(&run)
            .map(|entry| entry.tasks.values().cloned().collect())
            .unwrap_or_default())
    }

    fn max_run_id(&self) -> PersistenceResult<Option<RunId>> {
        Ok(self
            .read()?
            .iter()
            .filter(|(_, entry)| entry.run.is_some())
            .map(|(id, _)| *id)
            .max())
    }
}

fn poisoned() -> CoreError {
    CoreError::new(CoreErrorKind::Internal, "in-memory status store lock poisoned")
}
