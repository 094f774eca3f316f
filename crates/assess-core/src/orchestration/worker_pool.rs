use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use tokio::runtime::Handle;
use tokio::sync::{Notify, Semaphore, mpsc};

use crate::models::{CoreError, CoreErrorKind, QueueClass};
use crate::orchestration::OrchestrationResult;

pub type JobFuture = Pin<Box<dyn Future<Output = JobReport> + Send>>;

/// Unit of work run on a lane worker.
pub type Job = Box<dyn FnOnce(WorkerContext) -> JobFuture + Send>;

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct JobReport {
    pub peak_memory_bytes: Option<u64>,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct WorkerContext {
    pub queue_class: QueueClass,
    pub worker_id: u64,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct LaneConfig {
    pub concurrency: usize,
    pub queue_capacity: usize,
    pub memory_ceiling_bytes: Option<u64>,
}

impl LaneConfig {
    pub fn new(concurrency: usize) -> Self {
        Self {
            concurrency,
            queue_capacity: 64,
            memory_ceiling_bytes: None,
        }
    }

    pub fn with_queue_capacity(mut self, queue_capacity: usize) -> Self {
        self.queue_capacity = queue_capacity;
        self
    }

    pub fn with_memory_ceiling(mut self, bytes: u64) -> Self {
        self.memory_ceiling_bytes = Some(bytes);
        self
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct WorkerPoolConfig {
    pub high_priority: LaneConfig,
    pub assessment: LaneConfig,
    pub llm: LaneConfig,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            high_priority: LaneConfig::new(2),
            assessment: LaneConfig::new(8),
            llm: LaneConfig::new(2),
        }
    }
}

impl WorkerPoolConfig {
    pub fn lane(&self, class: QueueClass) -> &LaneConfig {
        match class {
            QueueClass::HighPriority => &self.high_priority,
            QueueClass::Assessment => &self.assessment,
            QueueClass::Llm => &self.llm,
        }
    }

    pub fn lane_mut(&mut self, class: QueueClass) -> &mut LaneConfig {
        match class {
            QueueClass::HighPriority => &mut self.high_priority,
            QueueClass::Assessment => &mut self.assessment,
            QueueClass::Llm => &mut self.llm,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize)]
pub struct LaneStats {
    pub queued: usize,
    pub running: usize,
    pub deferred: usize,
    pub completed: u64,
    pub rejected: u64,
    pub recycled_workers: u64,
    pub live_workers: usize,
}

/// Per-class worker lanes with bounded admission.
///
/// Each lane runs `concurrency` long-lived workers pulling from one queue, with a
/// semaphore of the same size bounding jobs in flight across worker recycling. `submit`
/// refuses work with `Backpressure` once queued plus running jobs reach
/// `concurrency + queue_capacity`. Deferred jobs hold no worker while they wait and are
/// admitted without the depth check when their delay elapses.
///
/// Dropping the last handle without `shutdown` stops admission and closes the lanes:
/// jobs already queued still run, then the workers exit.
#[derive(Clone)]
pub struct WorkerPool {
    inner: Arc<PoolInner>,
    _handles: Arc<LastHandle>,
}

/// Workers and deferred timers keep `PoolInner` alive, so lane closing hangs off the
/// handles instead.
struct LastHandle(Arc<PoolInner>);

impl Drop for LastHandle {
    fn drop(&mut self) {
        self.0.closing.store(true, Ordering::SeqCst);
        for lane in &self.0.lanes {
            lane.close();
        }
        self.0.progress.notify_waiters();
    }
}

struct PoolInner {
    handle: Handle,
    lanes: [Arc<Lane>; 3],
    closing: AtomicBool,
    next_worker_id: AtomicU64,
    progress: Notify,
}

struct Lane {
    class: QueueClass,
    config: LaneConfig,
    sender: Mutex<Option<mpsc::UnboundedSender<Job>>>,
    receiver: tokio::sync::Mutex<mpsc::UnboundedReceiver<Job>>,
    permits: Arc<Semaphore>,
    admitted: AtomicUsize,
    running: AtomicUsize,
    deferred: AtomicUsize,
    completed: AtomicU64,
    rejected: AtomicU64,
    recycled: AtomicU64,
    live_workers: AtomicUsize,
    discard: AtomicBool,
}

impl Lane {
    fn new(class: QueueClass, config: LaneConfig) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        Self {
            class,
            config,
            sender: Mutex::new(Some(sender)),
            receiver: tokio::sync::Mutex::new(receiver),
            permits: Arc::new(Semaphore::new(config.concurrency)),
            admitted: AtomicUsize::new(0),
            running: AtomicUsize::new(0),
            deferred: AtomicUsize::new(0),
            completed: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
            recycled: AtomicU64::new(0),
            live_workers: AtomicUsize::new(0),
            discard: AtomicBool::new(false),
        }
    }

    fn sender(&self) -> Option<mpsc::UnboundedSender<Job>> {
        self.sender.lock().ok().and_then(|sender| sender.clone())
    }

    fn close(&self) {
        if let Ok(mut sender) = self.sender.lock() {
            sender.take();
        }
    }

    fn depth_limit(&self) -> usize {
        self.config.concurrency.saturating_add(self.config.queue_capacity)
    }

    fn stats(&self) -> LaneStats {
        let admitted = self.admitted.load(Ordering::SeqCst);
        let running = self.running.load(Ordering::SeqCst);
        LaneStats {
            queued: admitted.saturating_sub(running),
            running,
            deferred: self.deferred.load(Ordering::SeqCst),
            completed: self.completed.load(Ordering::SeqCst),
            rejected: self.rejected.load(Ordering::SeqCst),
            recycled_workers: self.recycled.load(Ordering::SeqCst),
            live_workers: self.live_workers.load(Ordering::SeqCst),
        }
    }
}

impl WorkerPool {
    /// Spawns every lane's workers on the current tokio runtime.
    pub fn start(config: WorkerPoolConfig) -> OrchestrationResult<Self> {
        for class in QueueClass::ALL {
            if config.lane(class).concurrency == 0 {
                return Err(CoreError::new(
                    CoreErrorKind::InvalidInput,
                    format!("queue class '{}' needs a concurrency of at least 1", class.as_str()),
                ));
            }
        }

        let handle = Handle::try_current().map_err(|error| {
            CoreError::new(
                CoreErrorKind::Internal,
                format!("worker pool must start inside a tokio runtime: {error}"),
            )
        })?;

        let inner = Arc::new(PoolInner {
            handle,
            lanes: QueueClass::ALL
                .map(|class| Arc::new(Lane::new(class, *config.lane(class)))),
            closing: AtomicBool::new(false),
            next_worker_id: AtomicU64::new(1),
            progress: Notify::new(),
        });

        for lane in &inner.lanes {
            for _ in 0..lane.config.concurrency {
                spawn_worker(&inner, Arc::clone(lane));
            }
        }

        Ok(Self {
            _handles: Arc::new(LastHandle(Arc::clone(&inner))),
            inner,
        })
    }

    pub fn submit(&self, class: QueueClass, job: Job) -> OrchestrationResult<()> {
        if self.inner.closing.load(Ordering::SeqCst) {
            return Err(shutting_down(class));
        }

        let lane = self.inner.lane(class);
        let sender = lane.sender().ok_or_else(|| shutting_down(class))?;
        let limit = lane.depth_limit();
        if lane
            .admitted
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| {
                (current < limit).then_some(current + 1)
            })
            .is_err()
        {
            lane.rejected.fetch_add(1, Ordering::SeqCst);
            return Err(CoreError::new(
                CoreErrorKind::Backpressure,
                format!(
                    "queue class '{}' is full ({limit} queued or running)",
                    class.as_str()
                ),
            ));
        }

        if sender.send(job).is_err() {
            lane.admitted.fetch_sub(1, Ordering::SeqCst);
            return Err(shutting_down(class));
        }
        Ok(())
    }

    /// Enqueues `job` once `delay` has elapsed, without holding a worker meanwhile.
    pub fn submit_after(
        &self,
        class: QueueClass,
        delay: Duration,
        job: Job,
    ) -> OrchestrationResult<()> {
        let lane = Arc::clone(self.inner.lane(class));
        if lane.sender().is_none() {
            return Err(shutting_down(class));
        }

        lane.deferred.fetch_add(1, Ordering::SeqCst);
        let inner = Arc::clone(&self.inner);
        self.inner.handle.spawn(async move {
            tokio::time::sleep(delay).await;

            lane.admitted.fetch_add(1, Ordering::SeqCst);
            let sent = match lane.sender() {
                Some(sender) => sender.send(job).is_ok(),
                None => false,
            };
            if !sent {
                lane.admitted.fetch_sub(1, Ordering::SeqCst);
                tracing::debug!(
                    queue_class = class.as_str(),
                    "dropping deferred job; worker pool is shut down"
                );
            }
            lane.deferred.fetch_sub(1, Ordering::SeqCst);
            inner.progress.notify_waiters();
        });
        Ok(())
    }

    pub fn stats(&self, class: QueueClass) -> LaneStats {
        self.inner.lane(class).stats()
    }

    /// Stops accepting work and waits for every worker to exit.
    ///
    /// With `drain` the queued and deferred jobs run first; without it they are dropped
    /// and only jobs already running are awaited.
    pub async fn shutdown(&self, drain: bool) {
        self.inner.closing.store(true, Ordering::SeqCst);

        if drain {
            loop {
                let notified = self.inner.progress.notified();
                if self.inner.lanes.iter().all(|lane| {
                    lane.admitted.load(Ordering::SeqCst) == 0
                        && lane.deferred.load(Ordering::SeqCst) == 0
                }) {
                    break;
                }
                notified.await;
            }
        } else {
            for lane in &self.inner.lanes {
                lane.discard.store(true, Ordering::SeqCst);
            }
        }

        for lane in &self.inner.lanes {
            lane.close();
        }

        loop {
            let notified = self.inner.progress.notified();
            if self
                .inner
                .lanes
                .iter()
                .all(|lane| lane.live_workers.load(Ordering::SeqCst) == 0)
            {
                break;
            }
            notified.await;
        }
        tracing::debug!("worker pool shut down");
    }
}

impl PoolInner {
    fn lane(&self, class: QueueClass) -> &Arc<Lane> {
        match class {
            QueueClass::HighPriority => &self.lanes[0],
            QueueClass::Assessment => &self.lanes[1],
            QueueClass::Llm => &self.lanes[2],
        }
    }
}

fn spawn_worker(inner: &Arc<PoolInner>, lane: Arc<Lane>) {
    let worker_id = inner.next_worker_id.fetch_add(1, Ordering::SeqCst);
    lane.live_workers.fetch_add(1, Ordering::SeqCst);
    let pool = Arc::clone(inner);
    inner
        .handle
        .spawn(run_worker(pool, lane, worker_id));
}

async fn run_worker(inner: Arc<PoolInner>, lane: Arc<Lane>, worker_id: u64) {
    let context = WorkerContext {
        queue_class: lane.class,
        worker_id,
    };

    loop {
        let job = {
            let mut receiver = lane.receiver.lock().await;
            receiver.recv().await
        };
        let Some(job) = job else {
            break;
        };

        if lane.discard.load(Ordering::SeqCst) {
            drop(job);
            lane.admitted.fetch_sub(1, Ordering::SeqCst);
            inner.progress.notify_waiters();
            continue;
        }

        let Ok(permit) = Arc::clone(&lane.permits).acquire_owned().await else {
            lane.admitted.fetch_sub(1, Ordering::SeqCst);
            break;
        };
        lane.running.fetch_add(1, Ordering::SeqCst);
        // A panicking job must not take the worker down with it.
        let report = match tokio::spawn(job(context)).await {
            Ok(report) => report,
            Err(join_error) => {
                tracing::error!(
                    queue_class = lane.class.as_str(),
                    worker_id,
                    message = %join_error,
                    "worker job panicked"
                );
                JobReport::default()
            }
        };
        drop(permit);
        lane.running.fetch_sub(1, Ordering::SeqCst);
        lane.admitted.fetch_sub(1, Ordering::SeqCst);
        lane.completed.fetch_add(1, Ordering::SeqCst);

        let over_ceiling = matches!(
            (report.peak_memory_bytes, lane.config.memory_ceiling_bytes),
            (Some(peak), Some(ceiling)) if peak > ceiling
        );
        if over_ceiling {
            tracing::warn!(
                queue_class = lane.class.as_str(),
                worker_id,
                peak_memory_bytes = report.peak_memory_bytes,
                "worker exceeded memory ceiling; recycling"
            );
            lane.recycled.fetch_add(1, Ordering::SeqCst);
            spawn_worker(&inner, Arc::clone(&lane));
            inner.progress.notify_waiters();
            break;
        }
        inner.progress.notify_waiters();
    }

    lane.live_workers.fetch_sub(1, Ordering::SeqCst);
    inner.progress.notify_waiters();
}

fn shutting_down(class: QueueClass) -> CoreError {
    CoreError::new(
        CoreErrorKind::ShuttingDown,
        format!("worker pool is shutting down; queue class '{}' is closed", class.as_str()),
    )
}

#[cfg(test)]
mod tests {
    use super::{LaneConfig, WorkerPoolConfig};
    use crate::models::QueueClass;

    #[test]
    fn default_lanes_match_queue_classes() {
        let config = WorkerPoolConfig::default();
        assert_eq!(config.lane(QueueClass::HighPriority).concurrency, 2);
        assert_eq!(config.lane(QueueClass::Assessment).concurrency, 8);
        assert_eq!(config.lane(QueueClass::Llm).concurrency, 2);
        assert_eq!(config.lane(QueueClass::Llm).queue_capacity, 64);
    }

    #[test]
    fn lane_builder_sets_capacity_and_ceiling() {
        let lane = LaneConfig::new(3)
            .with_queue_capacity(1)
            .with_memory_ceiling(1024);
        assert_eq!(lane.concurrency, 3);
        assert_eq!(lane.queue_capacity, 1);
        assert_eq!(lane.memory_ceiling_bytes, Some(1024));
    }
}
