use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{watch, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::{Result, TaskError};
use crate::persistence::TaskPersistence;
use crate::types::{retry_backoff_secs, QueueStats, TaskInfo, TaskPriority, TaskStatus};

/// How long a worker parks before re-checking shutdown when idle.
const IDLE_POLL: Duration = Duration::from_secs(1);

/// Handed to every handler invocation: cooperative cancellation plus a
/// progress reporter that updates (and persists) the task record.
#[derive(Clone)]
pub struct TaskContext {
    pub cancel: CancellationToken,
    progress: Arc<dyn Fn(f64) + Send + Sync>,
}

impl TaskContext {
    /// Report fractional progress, clamped to [0, 1].
    pub fn report_progress(&self, fraction: f64) {
        (self.progress)(fraction.clamp(0.0, 1.0));
    }
}

/// A named task handler. The payload is opaque bytes chosen by the
/// submitter; the result is an arbitrary JSON value stored on the record.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn run(&self, payload: Vec<u8>, ctx: TaskContext) -> Result<serde_json::Value>;
}

struct QueueState {
    queues: HashMap<TaskPriority, VecDeque<(String, Vec<u8>)>>,
}

impl QueueState {
    fn new() -> Self {
        let mut queues = HashMap::new();
        for p in TaskPriority::ALL {
            queues.insert(p, VecDeque::new());
        }
        Self { queues }
    }

    fn total(&self) -> usize {
        self.queues.values().map(|q| q.len()).sum()
    }

    fn pop_by_priority(&mut self) -> Option<(String, Vec<u8>)> {
        for p in TaskPriority::ALL {
            if let Some(item) = self.queues.get_mut(&p).and_then(|q| q.pop_front()) {
                return Some(item);
            }
        }
        None
    }
}

/// Priority task queue with bounded size, fixed workers, retries with
/// exponential backoff, per-task timeout, cooperative cancellation, and
/// file-backed persistence of pending work across restarts.
pub struct TaskQueue {
    max_queue_size: usize,
    workers: usize,
    state: Mutex<QueueState>,
    notify: Notify,
    tasks: Mutex<HashMap<String, TaskInfo>>,
    running: Mutex<HashMap<String, CancellationToken>>,
    handlers: Mutex<HashMap<String, Arc<dyn TaskHandler>>>,
    persistence: Option<TaskPersistence>,
    running_count: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    cancelled: AtomicU64,
    shutdown_tx: watch::Sender<bool>,
}

impl TaskQueue {
    pub fn new(
        workers: usize,
        max_queue_size: usize,
        persistence: Option<TaskPersistence>,
    ) -> Arc<Self> {
        let (shutdown_tx, _) = watch::channel(false);
        Arc::new(Self {
            max_queue_size,
            workers,
            state: Mutex::new(QueueState::new()),
            notify: Notify::new(),
            tasks: Mutex::new(HashMap::new()),
            running: Mutex::new(HashMap::new()),
            handlers: Mutex::new(HashMap::new()),
            persistence,
            running_count: AtomicU64::new(0),
            completed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            cancelled: AtomicU64::new(0),
            shutdown_tx,
        })
    }

    pub fn register_handler(&self, task_type: &str, handler: Arc<dyn TaskHandler>) {
        self.handlers
            .lock()
            .unwrap()
            .insert(task_type.to_string(), handler);
    }

    /// Restore persisted tasks and launch the worker pool.
    pub fn start(self: &Arc<Self>) {
        self.restore_tasks();
        for i in 0..self.workers {
            let queue = self.clone();
            let mut shutdown = self.shutdown_tx.subscribe();
            tokio::spawn(async move {
                debug!(worker = i, "task worker started");
                loop {
                    if *shutdown.borrow() {
                        break;
                    }
                    let next = queue.state.lock().unwrap().pop_by_priority();
                    match next {
                        Some((task_id, payload)) => {
                            queue.execute(task_id, payload).await;
                        }
                        None => {
                            tokio::select! {
                                _ = queue.notify.notified() => {}
                                _ = tokio::time::sleep(IDLE_POLL) => {}
                                _ = shutdown.changed() => {}
                            }
                        }
                    }
                }
                debug!(worker = i, "task worker stopped");
            });
        }
        info!(workers = self.workers, "task queue started");
    }

    pub fn stop(&self) {
        let _ = self.shutdown_tx.send(true);
        self.notify.notify_waiters();
        info!("task queue stopping");
    }

    /// Enqueue a task. Rejects with `QueueFull` past the bound; assigns a
    /// UUID and persists `{metadata, payload}` before the task is visible to
    /// workers.
    pub fn submit(
        &self,
        task_type: &str,
        payload: Vec<u8>,
        priority: TaskPriority,
        timeout_secs: u64,
        max_retries: u32,
        metadata: serde_json::Value,
    ) -> Result<String> {
        {
            let state = self.state.lock().unwrap();
            let queued = state.total();
            if queued >= self.max_queue_size {
                return Err(TaskError::QueueFull {
                    queued,
                    max: self.max_queue_size,
                });
            }
        }
        if !self.handlers.lock().unwrap().contains_key(task_type) {
            return Err(TaskError::UnknownHandler(task_type.to_string()));
        }

        let task_id = Uuid::new_v4().to_string();
        let info = TaskInfo {
            task_id: task_id.clone(),
            task_type: task_type.to_string(),
            priority,
            status: TaskStatus::Pending,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            retry_count: 0,
            max_retries,
            timeout_secs,
            progress: 0.0,
            result: None,
            error: None,
            metadata,
        };

        if let Some(p) = &self.persistence {
            p.save(&info, Some(&payload))?;
        }
        self.tasks.lock().unwrap().insert(task_id.clone(), info);
        self.state
            .lock()
            .unwrap()
            .queues
            .get_mut(&priority)
            .unwrap()
            .push_back((task_id.clone(), payload));
        self.notify.notify_one();

        info!(task_id = %task_id, task_type, priority = %priority, "task submitted");
        Ok(task_id)
    }

    pub fn status(&self, task_id: &str) -> Option<TaskInfo> {
        self.tasks.lock().unwrap().get(task_id).cloned()
    }

    /// Cancel a task. Pending tasks are marked before dispatch; running
    /// tasks get their cooperative token cancelled.
    pub fn cancel(&self, task_id: &str) -> bool {
        if let Some(token) = self.running.lock().unwrap().get(task_id) {
            token.cancel();
            return true;
        }
        let mut tasks = self.tasks.lock().unwrap();
        if let Some(info) = tasks.get_mut(task_id) {
            if info.status == TaskStatus::Pending {
                info.status = TaskStatus::Cancelled;
                self.cancelled.fetch_add(1, Ordering::Relaxed);
                self.persist(info, None);
                return true;
            }
        }
        false
    }

    pub fn stats(&self) -> QueueStats {
        let state = self.state.lock().unwrap();
        QueueStats {
            urgent_queue: state.queues[&TaskPriority::Urgent].len(),
            high_queue: state.queues[&TaskPriority::High].len(),
            normal_queue: state.queues[&TaskPriority::Normal].len(),
            low_queue: state.queues[&TaskPriority::Low].len(),
            running: self.running_count.load(Ordering::Relaxed) as usize,
            completed: self.completed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            cancelled: self.cancelled.load(Ordering::Relaxed),
        }
    }

    // --- private helpers ---------------------------------------------------

    async fn execute(self: &Arc<Self>, task_id: String, payload: Vec<u8>) {
        let (handler, timeout_secs) = {
            let mut tasks = self.tasks.lock().unwrap();
            let Some(info) = tasks.get_mut(&task_id) else {
                return;
            };
            if info.status == TaskStatus::Cancelled {
                return;
            }
            info.status = TaskStatus::Running;
            info.started_at = Some(Utc::now());
            let handler = self.handlers.lock().unwrap().get(&info.task_type).cloned();
            (handler, info.timeout_secs)
        };
        self.persist_by_id(&task_id, Some(&payload));

        let Some(handler) = handler else {
            self.finish_failure(&task_id, payload, "handler disappeared".into())
                .await;
            return;
        };

        let token = CancellationToken::new();
        self.running
            .lock()
            .unwrap()
            .insert(task_id.clone(), token.clone());
        self.running_count.fetch_add(1, Ordering::Relaxed);

        let ctx = TaskContext {
            cancel: token.clone(),
            progress: {
                let queue = self.clone();
                let task_id = task_id.clone();
                Arc::new(move |fraction: f64| {
                    if let Some(info) = queue.tasks.lock().unwrap().get_mut(&task_id) {
                        info.progress = fraction.max(info.progress);
                    }
                    queue.persist_by_id(&task_id, None);
                })
            },
        };

        debug!(task_id = %task_id, "task dispatched");
        let outcome = tokio::select! {
            _ = token.cancelled() => Err(TaskError::Cancelled),
            res = tokio::time::timeout(
                Duration::from_secs(timeout_secs),
                handler.run(payload.clone(), ctx),
            ) => match res {
                Ok(inner) => inner,
                Err(_) => Err(TaskError::Timeout { secs: timeout_secs }),
            },
        };

        self.running.lock().unwrap().remove(&task_id);
        self.running_count.fetch_sub(1, Ordering::Relaxed);

        match outcome {
            Ok(result) => {
                {
                    let mut tasks = self.tasks.lock().unwrap();
                    if let Some(info) = tasks.get_mut(&task_id) {
                        info.status = TaskStatus::Completed;
                        info.completed_at = Some(Utc::now());
                        info.result = Some(result);
                        info.progress = 1.0;
                    }
                }
                self.completed.fetch_add(1, Ordering::Relaxed);
                self.persist_by_id(&task_id, None);
                info!(task_id = %task_id, "task completed");
            }
            Err(TaskError::Cancelled) => {
                {
                    let mut tasks = self.tasks.lock().unwrap();
                    if let Some(info) = tasks.get_mut(&task_id) {
                        info.status = TaskStatus::Cancelled;
                        info.completed_at = Some(Utc::now());
                    }
                }
                self.cancelled.fetch_add(1, Ordering::Relaxed);
                self.persist_by_id(&task_id, None);
                info!(task_id = %task_id, "task cancelled");
            }
            Err(e) => {
                self.finish_failure(&task_id, payload, e.to_string()).await;
            }
        }
    }

    /// Retry with backoff if the budget allows, otherwise mark failed.
    async fn finish_failure(self: &Arc<Self>, task_id: &str, payload: Vec<u8>, error: String) {
        let retry = {
            let mut tasks = self.tasks.lock().unwrap();
            let Some(info) = tasks.get_mut(task_id) else {
                return;
            };
            info.error = Some(error.clone());
            if info.retry_count < info.max_retries {
                info.retry_count += 1;
                info.status = TaskStatus::Retrying;
                Some((info.retry_count, info.priority))
            } else {
                info.status = TaskStatus::Failed;
                info.completed_at = Some(Utc::now());
                None
            }
        };
        self.persist_by_id(task_id, None);

        match retry {
            Some((retry_count, priority)) => {
                let backoff = retry_backoff_secs(retry_count);
                warn!(task_id = %task_id, retry_count, backoff, "task retry scheduled: {error}");
                let queue = self.clone();
                let task_id = task_id.to_string();
                // Re-insertion happens off the worker so backoff never
                // stalls the pool.
                tokio::spawn(async move {
                    tokio::time::sleep(Duration::from_secs(backoff)).await;
                    queue
                        .state
                        .lock()
                        .unwrap()
                        .queues
                        .get_mut(&priority)
                        .unwrap()
                        .push_back((task_id, payload));
                    queue.notify.notify_one();
                });
            }
            None => {
                self.failed.fetch_add(1, Ordering::Relaxed);
                error!(task_id = %task_id, "task failed permanently: {error}");
            }
        }
    }

    /// Re-enqueue persisted pending/running/retrying tasks; keep terminal
    /// records loaded for status queries.
    fn restore_tasks(&self) {
        let Some(p) = &self.persistence else {
            return;
        };
        let mut restored = 0;
        for task_id in p.list() {
            let Some((mut info, payload)) = p.load(&task_id) else {
                continue;
            };
            if info.status.is_recoverable() {
                info.status = TaskStatus::Pending;
                info.started_at = None;
                let priority = info.priority;
                self.tasks.lock().unwrap().insert(task_id.clone(), info);
                self.state
                    .lock()
                    .unwrap()
                    .queues
                    .get_mut(&priority)
                    .unwrap()
                    .push_back((task_id, payload));
                restored += 1;
            } else {
                self.tasks.lock().unwrap().insert(task_id, info);
            }
        }
        if restored > 0 {
            info!(count = restored, "restored unfinished tasks");
            self.notify.notify_waiters();
        }
    }

    fn persist_by_id(&self, task_id: &str, payload: Option<&[u8]>) {
        let info = self.tasks.lock().unwrap().get(task_id).cloned();
        if let Some(info) = info {
            self.persist(&info, payload);
        }
    }

    fn persist(&self, info: &TaskInfo, payload: Option<&[u8]>) {
        if let Some(p) = &self.persistence {
            if let Err(e) = p.save(info, payload) {
                warn!(task_id = %info.task_id, "task persistence failed: {e}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct Recorder {
        order: Mutex<Vec<String>>,
        fail_times: AtomicUsize,
    }

    #[async_trait]
    impl TaskHandler for Arc<Recorder> {
        async fn run(&self, payload: Vec<u8>, ctx: TaskContext) -> Result<serde_json::Value> {
            let name = String::from_utf8(payload).unwrap();
            if self.fail_times.load(Ordering::SeqCst) > 0 {
                self.fail_times.fetch_sub(1, Ordering::SeqCst);
                return Err(TaskError::Handler("transient".into()));
            }
            ctx.report_progress(0.5);
            self.order.lock().unwrap().push(name);
            Ok(serde_json::json!({ "ok": true }))
        }
    }

    fn recorder(fail_times: usize) -> Arc<Recorder> {
        Arc::new(Recorder {
            order: Mutex::new(Vec::new()),
            fail_times: AtomicUsize::new(fail_times),
        })
    }

    async fn wait_for<F: Fn() -> bool>(cond: F) {
        for _ in 0..2000 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        panic!("condition not reached in time");
    }

    #[tokio::test]
    async fn priority_order_is_respected_by_a_single_worker() {
        let queue = TaskQueue::new(1, 100, None);
        let rec = recorder(0);
        queue.register_handler("t", Arc::new(rec.clone()));

        // Submit before starting so the worker drains in priority order.
        queue
            .submit("t", b"low".to_vec(), TaskPriority::Low, 30, 0, serde_json::json!({}))
            .unwrap();
        queue
            .submit("t", b"urgent".to_vec(), TaskPriority::Urgent, 30, 0, serde_json::json!({}))
            .unwrap();
        queue
            .submit("t", b"normal".to_vec(), TaskPriority::Normal, 30, 0, serde_json::json!({}))
            .unwrap();
        queue.start();

        wait_for(|| rec.order.lock().unwrap().len() == 3).await;
        assert_eq!(
            *rec.order.lock().unwrap(),
            vec!["urgent".to_string(), "normal".to_string(), "low".to_string()]
        );
        queue.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failure_retries_then_completes() {
        let queue = TaskQueue::new(1, 100, None);
        let rec = recorder(2);
        queue.register_handler("t", Arc::new(rec.clone()));
        queue.start();

        let id = queue
            .submit("t", b"x".to_vec(), TaskPriority::Normal, 30, 3, serde_json::json!({}))
            .unwrap();

        // Paused clock auto-advances through the backoff sleeps.
        wait_for(|| {
            queue
                .status(&id)
                .is_some_and(|s| s.status == TaskStatus::Completed)
        })
        .await;
        let info = queue.status(&id).unwrap();
        assert_eq!(info.retry_count, 2);
        assert_eq!(queue.stats().completed, 1);
        queue.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn retries_exhaust_into_failed() {
        let queue = TaskQueue::new(1, 100, None);
        let rec = recorder(10);
        queue.register_handler("t", Arc::new(rec));
        queue.start();

        let id = queue
            .submit("t", b"x".to_vec(), TaskPriority::Normal, 30, 1, serde_json::json!({}))
            .unwrap();
        wait_for(|| {
            queue
                .status(&id)
                .is_some_and(|s| s.status == TaskStatus::Failed)
        })
        .await;
        assert_eq!(queue.stats().failed, 1);
        queue.stop();
    }

    #[tokio::test]
    async fn queue_full_is_rejected() {
        let queue = TaskQueue::new(1, 1, None);
        let rec = recorder(0);
        queue.register_handler("t", Arc::new(rec));
        queue
            .submit("t", b"a".to_vec(), TaskPriority::Normal, 30, 0, serde_json::json!({}))
            .unwrap();
        let err = queue.submit("t", b"b".to_vec(), TaskPriority::Normal, 30, 0, serde_json::json!({}));
        assert!(matches!(err, Err(TaskError::QueueFull { .. })));
    }

    #[tokio::test]
    async fn pending_cancellation_skips_dispatch() {
        let queue = TaskQueue::new(1, 100, None);
        let rec = recorder(0);
        queue.register_handler("t", Arc::new(rec.clone()));
        let id = queue
            .submit("t", b"x".to_vec(), TaskPriority::Normal, 30, 0, serde_json::json!({}))
            .unwrap();
        assert!(queue.cancel(&id));
        queue.start();

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(rec.order.lock().unwrap().is_empty());
        assert_eq!(queue.status(&id).unwrap().status, TaskStatus::Cancelled);
        queue.stop();
    }

    #[tokio::test]
    async fn restart_recovery_requeues_unfinished_tasks() {
        let dir = tempfile::tempdir().unwrap();

        // First incarnation: submit but never start a worker.
        {
            let queue = TaskQueue::new(1, 100, Some(TaskPersistence::new(dir.path()).unwrap()));
            let rec = recorder(0);
            queue.register_handler("t", Arc::new(rec));
            queue
                .submit("t", b"again".to_vec(), TaskPriority::High, 30, 0, serde_json::json!({}))
                .unwrap();
        }

        // Second incarnation restores and runs it.
        let queue = TaskQueue::new(1, 100, Some(TaskPersistence::new(dir.path()).unwrap()));
        let rec = recorder(0);
        queue.register_handler("t", Arc::new(rec.clone()));
        queue.start();
        wait_for(|| rec.order.lock().unwrap().len() == 1).await;
        assert_eq!(*rec.order.lock().unwrap(), vec!["again".to_string()]);
        queue.stop();
    }
}
