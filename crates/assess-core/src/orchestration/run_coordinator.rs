use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::{Duration, Instant, SystemTime};

use tokio::sync::{Notify, broadcast};
use tracing::Instrument;

use crate::models::{
    CoreError, CoreErrorKind, ProviderName, ProviderTaskRecord, RunCompletion, RunId, RunRecord,
    RunState, RunStatus, SubjectRef, TaskError, aggregate_run_state,
};
use crate::orchestration::{
    AttemptOutcome, CancellationToken, Job, JobFuture, JobReport, OrchestrationResult,
    TaskAttempt, TaskExecutor, WorkerContext, WorkerPool,
};
use crate::persistence::{PersistRetry, StatusStore, read_blocking, write_with_retry};
use crate::registry::{ProviderRegistry, RegisteredProvider};

const COMPLETION_CHANNEL_CAPACITY: usize = 256;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct RunCoordinatorConfig {
    pub dedup_window: Duration,
    pub persist_retry: PersistRetry,
    pub aggregation_retry: PersistRetry,
}

impl Default for RunCoordinatorConfig {
    fn default() -> Self {
        Self {
            dedup_window: Duration::from_secs(60),
            persist_retry: PersistRetry::default(),
            aggregation_retry: PersistRetry::default(),
        }
    }
}

/// Fans a subject out to its providers and folds the task outcomes back into one run.
#[derive(Clone)]
pub struct RunCoordinator {
    inner: Arc<CoordinatorInner>,
}

struct CoordinatorInner {
    registry: ProviderRegistry,
    pool: WorkerPool,
    store: Arc<dyn StatusStore>,
    executor: TaskExecutor,
    config: RunCoordinatorConfig,
    next_run_id: AtomicU64,
    runs: RwLock<HashMap<RunId, Arc<LiveRun>>>,
    submissions: Mutex<HashMap<SubjectRef, RecentSubmission>>,
    completions: broadcast::Sender<RunCompletion>,
}

struct RecentSubmission {
    run: RunId,
    providers: BTreeSet<ProviderName>,
    submitted_at: Instant,
}

struct LiveRun {
    id: RunId,
    subject: SubjectRef,
    record: tokio::sync::Mutex<RunRecord>,
    tasks: BTreeMap<ProviderName, LiveTask>,
    barrier: Mutex<FanIn>,
    cancellation: CancellationToken,
    finished: Notify,
}

struct LiveTask {
    provider: RegisteredProvider,
    cell: tokio::sync::Mutex<ProviderTaskRecord>,
}

struct FanIn {
    remaining: usize,
    arrived: HashSet<ProviderName>,
    closed: bool,
}

enum Admission {
    Existing(RunId),
    New(Arc<LiveRun>),
}

impl RunCoordinator {
    /// Builds a coordinator over an already started pool.
    ///
    /// Run ids continue after the highest id already in `store`; this reads the store
    /// synchronously.
    pub fn new(
        registry: ProviderRegistry,
        pool: WorkerPool,
        store: Arc<dyn StatusStore>,
        config: RunCoordinatorConfig,
    ) -> OrchestrationResult<Self> {
        if registry.is_empty() {
            return Err(CoreError::new(
                CoreErrorKind::InvalidInput,
                "run coordinator needs at least one registered provider",
            ));
        }

        let next_run_id = store
            .max_run_id()?
            .map(|run| run.0.saturating_add(1))
            .unwrap_or(1);
        let (completions, _) = broadcast::channel(COMPLETION_CHANNEL_CAPACITY);

        Ok(Self {
            inner: Arc::new(CoordinatorInner {
                executor: TaskExecutor::new(Arc::clone(&store), config.persist_retry),
                registry,
                pool,
                store,
                config,
                next_run_id: AtomicU64::new(next_run_id),
                runs: RwLock::new(HashMap::new()),
                submissions: Mutex::new(HashMap::new()),
                completions,
            }),
        })
    }

    /// Completion events, one per run, for runs finishing after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<RunCompletion> {
        self.inner.completions.subscribe()
    }

    /// Submits `subject` against every registered provider.
    pub async fn submit(&self, subject: SubjectRef) -> OrchestrationResult<RunId> {
        let names: Vec<ProviderName> = self.inner.registry.names().cloned().collect();
        self.submit_with_providers(subject, &names).await
    }

    pub async fn submit_with_providers(
        &self,
        subject: SubjectRef,
        providers: &[ProviderName],
    ) -> OrchestrationResult<RunId> {
        let resolved = self.inner.registry.resolve(providers)?;
        let provider_set: BTreeSet<ProviderName> =
            resolved.iter().map(|provider| provider.name().clone()).collect();

        let admission = self.inner.admit(&subject, provider_set, |run_id| {
            Arc::new(LiveRun::new(run_id, subject.clone(), resolved, SystemTime::now()))
        })?;
        let run = match admission {
            Admission::Existing(run_id) => {
                tracing::debug!(
                    run_id = %run_id,
                    subject = %subject,
                    "duplicate submission joined in-flight run"
                );
                return Ok(run_id);
            }
            Admission::New(run) => run,
        };
        let run_id = run.id;

        let record = run.record.lock().await.clone();
        let initial_tasks = run.snapshot_tasks().await;
        let created = write_with_retry(
            &self.inner.store,
            self.inner.config.persist_retry,
            "create_run",
            move |store| {
                store.put_run(&record)?;
                for task in &initial_tasks {
                    store.put_task(task)?;
                }
                Ok(())
            },
        )
        .await;

        if let Err(error) = created {
            tracing::error!(
                run_id = %run_id,
                subject = %subject,
                message = %error.message,
                "failed to persist new run"
            );
            self.inner.abort_run(&run, error).await;
            return Ok(run_id);
        }

        tracing::info!(
            run_id = %run_id,
            subject = %subject,
            providers = run.tasks.len(),
            "run submitted"
        );

        for (name, task) in &run.tasks {
            let job = task_job(Arc::clone(&self.inner), Arc::clone(&run), name.clone());
            if let Err(error) = self
                .inner
                .pool
                .submit(task.provider.profile.queue_class, job)
            {
                tracing::warn!(
                    run_id = %run_id,
                    provider = %name,
                    kind = error.kind.as_str(),
                    message = %error.message,
                    "worker pool refused provider task"
                );
                self.inner.fail_task(&run, name, error).await;
            }
        }

        Ok(run_id)
    }

    pub async fn get_status(&self, run: RunId) -> OrchestrationResult<RunStatus> {
        if let Some(live) = self.inner.live_run(run) {
            return Ok(live.status().await);
        }

        let (record, tasks) = read_blocking(&self.inner.store, move |store| {
            Ok((store.get_run(run)?, store.list_tasks(run)?))
        })
        .await?;
        record
            .map(|record| RunStatus::new(record, tasks))
            .ok_or_else(|| unknown_run(run))
    }

    pub async fn task_status(
        &self,
        run: RunId,
        provider: &ProviderName,
    ) -> OrchestrationResult<ProviderTaskRecord> {
        if let Some(live) = self.inner.live_run(run) {
            let task = live.tasks.get(provider).ok_or_else(|| unknown_task(run, provider))?;
            return Ok(task.cell.lock().await.clone());
        }

        let tasks = read_blocking(&self.inner.store, move |store| {
            if store.get_run(run)?.is_none() {
                return Err(unknown_run(run));
            }
            store.list_tasks(run)
        })
        .await?;
        tasks
            .into_iter()
            .find(|task| &task.provider == provider)
            .ok_or_else(|| unknown_task(run, provider))
    }

    /// Stops a run: trips its cancellation token and fails every task still in flight.
    ///
    /// The run then aggregates like any other. Cancelling a terminal run does nothing.
    pub async fn cancel(&self, run: RunId) -> OrchestrationResult<()> {
        let Some(live) = self.inner.live_run(run) else {
            return self.get_status(run).await.map(|_| ());
        };

        if live.record.lock().await.state.is_terminal() {
            return Ok(());
        }

        live.cancellation.cancel();
        tracing::info!(run_id = %run, "run cancellation requested");

        for name in live.tasks.keys() {
            let error = CoreError::new(CoreErrorKind::Cancelled, "run cancelled");
            self.inner.fail_task(&live, name, error).await;
        }
        Ok(())
    }

    /// Waits for the run to reach a terminal state.
    pub async fn wait_for_completion(
        &self,
        run: RunId,
        timeout_duration: Duration,
    ) -> OrchestrationResult<RunStatus> {
        let deadline = tokio::time::Instant::now() + timeout_duration;
        loop {
            let Some(live) = self.inner.live_run(run) else {
                return self.get_status(run).await;
            };

            let notified = live.finished.notified();
            if live.record.lock().await.state.is_terminal() {
                return self.get_status(run).await;
            }

            tokio::time::timeout_at(deadline, notified)
                .await
                .map_err(|_| {
                    CoreError::new(
                        CoreErrorKind::Timeout,
                        format!("timed out waiting for run {run} to complete"),
                    )
                    .for_run(run)
                })?;
        }
    }
}

impl CoordinatorInner {
    fn live_run(&self, run: RunId) -> Option<Arc<LiveRun>> {
        self.runs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&run)
            .cloned()
    }

    /// Registers a new live run for `subject`, or returns the in-flight run it duplicates.
    ///
    /// The run is visible to `get_status` before the submissions lock is released, so a
    /// duplicate submitter never sees an id it cannot look up.
    fn admit(
        &self,
        subject: &SubjectRef,
        providers: BTreeSet<ProviderName>,
        build: impl FnOnce(RunId) -> Arc<LiveRun>,
    ) -> OrchestrationResult<Admission> {
        let mut submissions = self
            .submissions
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        if let Some(recent) = submissions.get(subject)
            && recent.submitted_at.elapsed() < self.config.dedup_window
        {
            if recent.providers == providers {
                return Ok(Admission::Existing(recent.run));
            }
            return Err(CoreError::new(
                CoreErrorKind::DuplicateSubmission,
                format!(
                    "subject '{subject}' already has in-flight run {} with a different provider set",
                    recent.run
                ),
            )
            .for_run(recent.run));
        }

        let run = build(RunId(self.next_run_id.fetch_add(1, Ordering::SeqCst)));
        self.runs
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(run.id, Arc::clone(&run));
        submissions.insert(
            subject.clone(),
            RecentSubmission {
                run: run.id,
                providers,
                submitted_at: Instant::now(),
            },
        );
        Ok(Admission::New(run))
    }

    async fn mark_started(&self, run: &LiveRun) {
        let mut record = run.record.lock().await;
        if record.state != RunState::Created {
            return;
        }

        let now = SystemTime::now();
        record.state = RunState::InProgress;
        record.started_at = Some(now);
        let snapshot = record.clone();
        if let Err(error) = write_with_retry(
            &self.store,
            self.config.persist_retry,
            "put_run",
            move |store| store.put_run(&snapshot),
        )
        .await
        {
            tracing::error!(
                run_id = %run.id,
                message = %error.message,
                "failed to persist run start"
            );
        }
    }

    /// Fails a non-terminal task outside the executor and counts it toward fan-in.
    async fn fail_task(&self, run: &LiveRun, provider: &ProviderName, error: CoreError) {
        let Some(task) = run.tasks.get(provider) else {
            return;
        };

        let error = error.for_run(run.id).for_provider(provider);
        let snapshot = {
            let mut cell = task.cell.lock().await;
            if cell.state.is_terminal() {
                return;
            }
            if cell
                .fail_permanently(TaskError::from(&error), SystemTime::now())
                .is_err()
            {
                return;
            }
            cell.clone()
        };

        if let Err(persist_error) = write_with_retry(
            &self.store,
            self.config.persist_retry,
            "put_task",
            move |store| store.put_task(&snapshot),
        )
        .await
        {
            tracing::error!(
                run_id = %run.id,
                provider = %provider,
                message = %persist_error.message,
                "failed to persist provider task failure"
            );
        }

        self.arrive(run, provider).await;
    }

    async fn arrive(&self, run: &LiveRun, provider: &ProviderName) {
        let last = {
            let mut barrier = run.barrier.lock().unwrap_or_else(PoisonError::into_inner);
            if barrier.closed || !barrier.arrived.insert(provider.clone()) {
                tracing::debug!(
                    run_id = %run.id,
                    provider = %provider,
                    "ignoring redundant terminal callback"
                );
                return;
            }
            barrier.remaining = barrier.remaining.saturating_sub(1);
            if barrier.remaining == 0 {
                barrier.closed = true;
            }
            barrier.closed
        };

        if last {
            self.finalize(run).await;
        }
    }

    async fn finalize(&self, run: &LiveRun) {
        let tasks = run.snapshot_tasks().await;
        let state =
            aggregate_run_state(tasks.iter().map(|task| task.state)).unwrap_or(RunState::Failed);

        let completion = {
            let mut record = run.record.lock().await;
            let now = SystemTime::now();
            record.state = state;
            record.finished_at = Some(now);

            let snapshot = record.clone();
            let persisted = write_with_retry(
                &self.store,
                self.config.aggregation_retry,
                "finalize_run",
                move |store| {
                    for task in &tasks {
                        store.put_task(task)?;
                    }
                    store.put_run(&snapshot)
                },
            )
            .await;

            match persisted {
                Ok(()) => {
                    self.runs
                        .write()
                        .unwrap_or_else(PoisonError::into_inner)
                        .remove(&run.id);
                }
                Err(error) => {
                    tracing::error!(
                        run_id = %run.id,
                        state = state.as_str(),
                        message = %error.message,
                        "run aggregation failed"
                    );
                    record.state = RunState::Failed;
                    record.failure_reason = Some(format!("aggregation error: {}", error.message));
                    let fallback = record.clone();
                    if let Err(fallback_error) = write_with_retry(
                        &self.store,
                        PersistRetry {
                            max_attempts: 1,
                            ..self.config.aggregation_retry
                        },
                        "put_run",
                        move |store| store.put_run(&fallback),
                    )
                    .await
                    {
                        tracing::error!(
                            run_id = %run.id,
                            message = %fallback_error.message,
                            "failed to persist failed run after aggregation error"
                        );
                    }
                }
            }
            self.release_subject(run);

            RunCompletion {
                run: run.id,
                subject: run.subject.clone(),
                state: record.state,
                failure_reason: record.failure_reason.clone(),
                finished_at: now,
            }
        };

        tracing::info!(
            run_id = %run.id,
            state = completion.state.as_str(),
            "run finished"
        );
        run.finished.notify_waiters();
        let _ = self.completions.send(completion);
    }

    /// Ends dedup for the run's subject. Called with the run record locked so waiters
    /// never observe a terminal run that still blocks resubmission.
    fn release_subject(&self, run: &LiveRun) {
        let mut submissions = self
            .submissions
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if submissions
            .get(&run.subject)
            .is_some_and(|recent| recent.run == run.id)
        {
            submissions.remove(&run.subject);
        }
    }

    /// Terminates a run whose initial records could not be stored.
    async fn abort_run(&self, run: &LiveRun, error: CoreError) {
        let error = CoreError::new(
            CoreErrorKind::StorageFailure,
            format!("run creation failed: {}", error.message),
        )
        .for_run(run.id);

        {
            let mut barrier = run.barrier.lock().unwrap_or_else(PoisonError::into_inner);
            barrier.remaining = 0;
            barrier.closed = true;
        }
        for task in run.tasks.values() {
            let mut cell = task.cell.lock().await;
            let _ = cell.fail_permanently(TaskError::from(&error), SystemTime::now());
        }

        let completion = {
            let mut record = run.record.lock().await;
            let now = SystemTime::now();
            record.state = RunState::Failed;
            record.finished_at = Some(now);
            record.failure_reason = Some(error.message.clone());
            self.release_subject(run);
            RunCompletion {
                run: run.id,
                subject: run.subject.clone(),
                state: RunState::Failed,
                failure_reason: record.failure_reason.clone(),
                finished_at: now,
            }
        };

        run.finished.notify_waiters();
        let _ = self.completions.send(completion);
    }
}

impl LiveRun {
    fn new(
        id: RunId,
        subject: SubjectRef,
        providers: Vec<RegisteredProvider>,
        now: SystemTime,
    ) -> Self {
        let tasks: BTreeMap<ProviderName, LiveTask> = providers
            .into_iter()
            .map(|provider| {
                let name = provider.name().clone();
                let task = ProviderTaskRecord::pending(
                    id,
                    name.clone(),
                    provider.profile.queue_class,
                    provider.profile.retry.max_attempts,
                    now,
                );
                (
                    name,
                    LiveTask {
                        provider,
                        cell: tokio::sync::Mutex::new(task),
                    },
                )
            })
            .collect();

        Self {
            id,
            record: tokio::sync::Mutex::new(RunRecord::created(id, subject.clone(), now)),
            subject,
            barrier: Mutex::new(FanIn {
                remaining: tasks.len(),
                arrived: HashSet::new(),
                closed: false,
            }),
            tasks,
            cancellation: CancellationToken::new(),
            finished: Notify::new(),
        }
    }

    async fn snapshot_tasks(&self) -> Vec<ProviderTaskRecord> {
        let mut tasks = Vec::with_capacity(self.tasks.len());
        for task in self.tasks.values() {
            tasks.push(task.cell.lock().await.clone());
        }
        tasks
    }

    async fn status(&self) -> RunStatus {
        let record = self.record.lock().await.clone();
        RunStatus::new(record, self.snapshot_tasks().await)
    }
}

fn task_job(inner: Arc<CoordinatorInner>, run: Arc<LiveRun>, provider: ProviderName) -> Job {
    Box::new(move |worker: WorkerContext| -> JobFuture {
        let span = tracing::info_span!(
            "provider_attempt",
            run_id = %run.id,
            provider = %provider,
            worker_id = worker.worker_id
        );
        Box::pin(run_attempt(inner, run, provider).instrument(span))
    })
}

async fn run_attempt(
    inner: Arc<CoordinatorInner>,
    run: Arc<LiveRun>,
    provider: ProviderName,
) -> JobReport {
    let Some(task) = run.tasks.get(&provider) else {
        return JobReport::default();
    };
    if run.cancellation.is_cancelled() {
        return JobReport::default();
    }

    inner.mark_started(&run).await;
    let outcome = inner
        .executor
        .execute(TaskAttempt {
            run: run.id,
            subject: &run.subject,
            provider: &task.provider,
            cell: &task.cell,
            cancellation: &run.cancellation,
        })
        .await;

    let report = JobReport {
        peak_memory_bytes: outcome.peak_memory_bytes(),
    };
    match outcome {
        AttemptOutcome::Succeeded { .. } | AttemptOutcome::FailedPermanent { .. } => {
            inner.arrive(&run, &provider).await;
        }
        AttemptOutcome::RetryScheduled { delay, .. } => {
            let class = task.provider.profile.queue_class;
            let job = task_job(Arc::clone(&inner), Arc::clone(&run), provider.clone());
            if let Err(error) = inner.pool.submit_after(class, delay, job) {
                inner.fail_task(&run, &provider, error).await;
            }
        }
        AttemptOutcome::Superseded => {}
    }
    report
}

fn unknown_run(run: RunId) -> CoreError {
    CoreError::new(CoreErrorKind::UnknownRun, format!("run {run} does not exist")).for_run(run)
}

fn unknown_task(run: RunId, provider: &ProviderName) -> CoreError {
    CoreError::new(
        CoreErrorKind::UnknownRun,
        format!("run {run} has no task for provider '{provider}'"),
    )
    .for_run(run)
    .for_provider(provider)
}
