use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::cli::config::WorkerSettings;
use crate::error::{Result, ScraperError};
use crate::scraper::task::{WorkerResult, WorkerTask};

/// Work executed by the pool for each task
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn handle(&self, task: &WorkerTask, worker_id: usize) -> anyhow::Result<Value>;
}

/// Heap entry: lower priority first, then older, then submission order
#[derive(Debug)]
struct QueuedTask {
    task: WorkerTask,
    seq: u64,
}

impl PartialEq for QueuedTask {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == CmpOrdering::Equal
    }
}

impl Eq for QueuedTask {}

impl PartialOrd for QueuedTask {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedTask {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        // BinaryHeap is a max-heap, so compare in reverse
        other
            .task
            .priority
            .cmp(&self.task.priority)
            .then_with(|| other.task.created_at.cmp(&self.task.created_at))
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerStatus {
    Idle,
    Processing,
    Stuck,
}

#[derive(Debug, Clone)]
struct WorkerSlot {
    status: WorkerStatus,
    current_task: Option<String>,
    tasks_processed: u64,
    last_activity: Instant,
}

impl WorkerSlot {
    fn idle() -> Self {
        Self {
            status: WorkerStatus::Idle,
            current_task: None,
            tasks_processed: 0,
            last_activity: Instant::now(),
        }
    }
}

#[derive(Debug, Default)]
struct Counters {
    tasks_submitted: u64,
    tasks_processed: u64,
    tasks_failed: u64,
    total_processing_time: Duration,
}

/// Worker pool statistics
#[derive(Debug, Clone, Serialize)]
pub struct PoolStats {
    pub tasks_submitted: u64,
    pub tasks_processed: u64,
    pub tasks_failed: u64,
    pub total_processing_time: Duration,
    pub average_processing_time: Duration,
    pub success_rate: f64,
    pub active_workers: usize,
    pub queue_size: usize,
}

struct Shared {
    settings: WorkerSettings,
    handler: Arc<dyn TaskHandler>,
    queue: Mutex<BinaryHeap<QueuedTask>>,
    /// One permit per queued task
    available: Semaphore,
    /// Fixed-capacity worker state, indexed by worker id
    slots: Mutex<Vec<WorkerSlot>>,
    counters: Mutex<Counters>,
    results: mpsc::UnboundedSender<WorkerResult>,
    seq: AtomicU64,
}

impl Shared {
    fn enqueue(&self, task: WorkerTask) {
        let seq = self.seq.fetch_add(1, Ordering::SeqCst);
        self.queue.lock().push(QueuedTask { task, seq });
        self.available.add_permits(1);
    }

    async fn next_task(&self) -> Option<WorkerTask> {
        let permit = self.available.acquire().await.ok()?;
        permit.forget();
        self.queue.lock().pop().map(|queued| queued.task)
    }

    fn set_slot(&self, worker_id: usize, status: WorkerStatus, current_task: Option<String>) {
        if let Some(slot) = self.slots.lock().get_mut(worker_id) {
            if status == WorkerStatus::Idle && slot.status != WorkerStatus::Idle {
                slot.tasks_processed += 1;
            }
            slot.status = status;
            slot.current_task = current_task;
            slot.last_activity = Instant::now();
        }
    }

    async fn run_task(&self, task: WorkerTask, worker_id: usize) {
        self.set_slot(worker_id, WorkerStatus::Processing, Some(task.task_id.clone()));
        let started = Instant::now();
        let timeout = Duration::from_secs(self.settings.task_timeout_secs);

        let outcome = match tokio::time::timeout(timeout, self.handler.handle(&task, worker_id)).await {
            Ok(Ok(data)) => Ok(data),
            Ok(Err(e)) => Err(e.to_string()),
            Err(_) => Err(format!("task timed out after {:?}", timeout)),
        };
        let processing_time = started.elapsed();
        self.set_slot(worker_id, WorkerStatus::Idle, None);

        let result = match outcome {
            Ok(data) => {
                let mut counters = self.counters.lock();
                counters.tasks_processed += 1;
                counters.total_processing_time += processing_time;
                drop(counters);

                WorkerResult {
                    task_id: task.task_id,
                    payload: task.payload,
                    success: true,
                    data: Some(data),
                    error: None,
                    processing_time,
                    worker_id,
                }
            }
            Err(message) if task.can_retry() => {
                warn!(
                    task = %task.task_id,
                    retry = task.retry_count + 1,
                    "Task failed, re-queueing: {}",
                    message
                );
                self.enqueue(task.next_attempt());
                return;
            }
            Err(message) => {
                let mut counters = self.counters.lock();
                counters.tasks_processed += 1;
                counters.tasks_failed += 1;
                drop(counters);

                WorkerResult {
                    task_id: task.task_id,
                    payload: task.payload,
                    success: false,
                    data: None,
                    error: Some(message),
                    processing_time,
                    worker_id,
                }
            }
        };

        if self.results.send(result).is_err() {
            debug!("Result receiver dropped");
        }
    }

    fn flag_stuck_workers(&self) -> usize {
        let limit = Duration::from_secs(self.settings.task_timeout_secs);
        let mut stuck = 0;
        for (worker_id, slot) in self.slots.lock().iter_mut().enumerate() {
            if slot.status == WorkerStatus::Processing && slot.last_activity.elapsed() > limit {
                warn!("Worker {} appears stuck on {:?}", worker_id, slot.current_task);
                slot.status = WorkerStatus::Stuck;
                stuck += 1;
            }
        }
        stuck
    }
}

/// Priority queue of tasks drained by a fixed set of async workers
pub struct WorkerPool {
    shared: Arc<Shared>,
    receiver: tokio::sync::Mutex<mpsc::UnboundedReceiver<WorkerResult>>,
    running: AtomicBool,
    token: Mutex<CancellationToken>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    pub fn new(settings: WorkerSettings, handler: Arc<dyn TaskHandler>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let workers = settings.max_workers.max(1);
        Self {
            shared: Arc::new(Shared {
                slots: Mutex::new(vec![WorkerSlot::idle(); workers]),
                settings,
                handler,
                queue: Mutex::new(BinaryHeap::new()),
                available: Semaphore::new(0),
                counters: Mutex::new(Counters::default()),
                results: tx,
                seq: AtomicU64::new(0),
            }),
            receiver: tokio::sync::Mutex::new(rx),
            running: AtomicBool::new(false),
            token: Mutex::new(CancellationToken::new()),
            handles: Mutex::new(Vec::new()),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Spawn the workers and the health loop
    pub fn start(&self) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }

        let token = CancellationToken::new();
        *self.token.lock() = token.clone();
        let workers = self.shared.slots.lock().len();
        let mut handles = self.handles.lock();

        for worker_id in 0..workers {
            let shared = Arc::clone(&self.shared);
            let token = token.clone();
            handles.push(tokio::spawn(async move {
                loop {
                    let task = tokio::select! {
                        _ = token.cancelled() => break,
                        task = shared.next_task() => task,
                    };
                    match task {
                        Some(task) => shared.run_task(task, worker_id).await,
                        None => break,
                    }
                }
                debug!("Worker {} exited", worker_id);
            }));
        }

        let shared = Arc::clone(&self.shared);
        let interval = Duration::from_secs(self.shared.settings.health_check_interval_secs.max(1));
        handles.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        shared.flag_stuck_workers();
                    }
                }
            }
        }));

        info!("Worker pool started with {} workers", workers);
    }

    /// Stop the workers. Tasks still queued are dropped.
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }

        info!("Stopping worker pool...");
        self.token.lock().cancel();
        let handles: Vec<JoinHandle<()>> = self.handles.lock().drain(..).collect();
        for handle in handles {
            if tokio::time::timeout(Duration::from_secs(5), handle).await.is_err() {
                error!("Worker did not stop within 5s");
            }
        }

        let dropped = {
            let mut queue = self.shared.queue.lock();
            let dropped = queue.len();
            queue.clear();
            dropped
        };
        if dropped > 0 {
            warn!("Dropped {} queued task(s)", dropped);
        }
        info!("Worker pool stopped");
    }

    pub fn submit_task(&self, task: WorkerTask) -> Result<()> {
        if !self.is_running() {
            return Err(ScraperError::WorkerPoolStopped);
        }
        debug!("Task {} submitted to worker pool", task.task_id);
        self.shared.counters.lock().tasks_submitted += 1;
        self.shared.enqueue(task);
        Ok(())
    }

    /// Next finished result, or `None` if none arrives within `timeout`
    pub async fn get_result(&self, timeout: Duration) -> Option<WorkerResult> {
        let mut receiver = self.receiver.lock().await;
        tokio::time::timeout(timeout, receiver.recv()).await.ok().flatten()
    }

    pub fn stats(&self) -> PoolStats {
        let counters = self.shared.counters.lock();
        let succeeded = counters.tasks_processed - counters.tasks_failed;
        let average_processing_time = if succeeded > 0 {
            counters.total_processing_time / succeeded as u32
        } else {
            Duration::ZERO
        };
        let success_rate = if counters.tasks_processed > 0 {
            succeeded as f64 / counters.tasks_processed as f64
        } else {
            0.0
        };

        PoolStats {
            tasks_submitted: counters.tasks_submitted,
            tasks_processed: counters.tasks_processed,
            tasks_failed: counters.tasks_failed,
            total_processing_time: counters.total_processing_time,
            average_processing_time,
            success_rate,
            active_workers: self
                .shared
                .slots
                .lock()
                .iter()
                .filter(|slot| slot.status == WorkerStatus::Processing)
                .count(),
            queue_size: self.shared.queue.lock().len(),
        }
    }

    pub fn worker_states(&self) -> Vec<WorkerStatus> {
        self.shared.slots.lock().iter().map(|slot| slot.status).collect()
    }
}
