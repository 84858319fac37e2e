//! Task execution: registry, worker pool, and tracked handles.

use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use futures::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::{broadcast, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::store::{NewTask, TaskNotice, TaskNoticeKind, TaskStore};
use super::{Outcome, TaskError, TaskRow, TaskStatus, DEFAULT_PRIORITY};
use crate::config::VaultConfig;
use crate::error::{Result, VaultError};

/// The async function a task type runs.
pub type TaskRunner = Arc<dyn Fn(TaskContext) -> BoxFuture<'static, Outcome> + Send + Sync>;

/// A registered task type: its name, the resources it needs, and its runner.
///
/// This is the whole invocation surface: inputs and outputs are JSON, and
/// resource requirements are plain declarations consumed at claim time.
#[derive(Clone)]
pub struct TaskType {
    pub name: &'static str,
    pub resources: &'static [&'static str],
    runner: TaskRunner,
}

impl TaskType {
    /// Declares a task type with the given runner.
    pub fn new<F>(name: &'static str, resources: &'static [&'static str], runner: F) -> Self
    where
        F: Fn(TaskContext) -> BoxFuture<'static, Outcome> + Send + Sync + 'static,
    {
        TaskType {
            name,
            resources,
            runner: Arc::new(runner),
        }
    }
}

/// The set of task types a node knows how to execute.
///
/// Built explicitly during wiring and handed to the scheduler by reference;
/// there is no global registration.
#[derive(Clone, Default)]
pub struct TaskRegistry {
    types: HashMap<&'static str, TaskType>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a task type. Re-registering a name replaces the earlier entry.
    pub fn register(&mut self, task_type: TaskType) {
        self.types.insert(task_type.name, task_type);
    }

    /// Looks up a task type by name.
    pub fn get(&self, name: &str) -> Option<&TaskType> {
        self.types.get(name)
    }

    /// Iterates over all registered types.
    pub fn iter(&self) -> impl Iterator<Item = &TaskType> {
        self.types.values()
    }
}

/// What a runner gets to work with.
pub struct TaskContext {
    /// The claimed task row, including its JSON input.
    pub task: TaskRow,
    /// Queue access, primarily for submitting subtasks.
    pub store: TaskStore,
}

impl TaskContext {
    /// Deserializes the task input into its declared shape.
    pub fn input<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_value(self.task.input.clone()).map_err(|source| {
            VaultError::TaskInputInvalid {
                task_type: self.task.task_type.clone(),
                source,
            }
        })
    }

    /// Submits a subtask of the current task and records the dependency
    /// edge; release `Blocked` afterwards to park until it completes.
    pub async fn submit_subtask(
        &self,
        task_type: &str,
        input: Value,
        priority: i64,
        resources: &[&str],
    ) -> Result<i64> {
        self.store
            .submit_subtask(
                &self.task,
                NewTask {
                    priority,
                    resources,
                    ..NewTask::new(task_type, input)
                },
            )
            .await
    }
}

/// A local, typed handle on a submitted task.
///
/// The handle resolves through completion notices when they arrive and falls
/// back to polling the row, so a dropped notification only costs latency.
pub struct TaskHandle<O> {
    task_id: i64,
    store: TaskStore,
    notices: broadcast::Receiver<TaskNotice>,
    poll_interval: Duration,
    _output: PhantomData<fn() -> O>,
}

impl<O: DeserializeOwned> TaskHandle<O> {
    pub(crate) fn new(task_id: i64, store: TaskStore, poll_interval: Duration) -> Self {
        let notices = store.subscribe();
        TaskHandle {
            task_id,
            store,
            notices,
            poll_interval,
            _output: PhantomData,
        }
    }

    /// Returns the id of the task this handle tracks.
    pub fn task_id(&self) -> i64 {
        self.task_id
    }

    /// Waits for the task to reach a terminal status.
    ///
    /// Returns `Ok(Some(output))` on completion, `Ok(None)` on timeout
    /// (without touching the task), and `Err` when the task failed, died, or
    /// was cancelled.
    pub async fn wait(&mut self, timeout: Duration) -> Result<Option<O>> {
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            let row = self
                .store
                .get(self.task_id)
                .await?
                .ok_or_else(|| VaultError::TaskExecutionFailed {
                    retryable: false,
                    cause: anyhow!("task {} does not exist", self.task_id),
                })?;

            match row.status {
                TaskStatus::Complete => {
                    let output = row.output.unwrap_or(Value::Null);
                    let typed = serde_json::from_value(output).map_err(|source| {
                        VaultError::TaskInputInvalid {
                            task_type: row.task_type,
                            source,
                        }
                    })?;
                    return Ok(Some(typed));
                }
                TaskStatus::Error | TaskStatus::Dead | TaskStatus::Cancelled => {
                    let message = row
                        .output
                        .as_ref()
                        .and_then(|output| output.get("message"))
                        .and_then(Value::as_str)
                        .unwrap_or("task did not complete")
                        .to_owned();
                    return Err(VaultError::TaskExecutionFailed {
                        retryable: row.retryable.unwrap_or(false),
                        cause: anyhow!("task {} {}: {}", row.id, row.status, message),
                    });
                }
                _ => {}
            }

            // Park until our completion notice, the poll interval, or the
            // caller's deadline, whichever comes first.
            let wake = tokio::time::sleep(self.poll_interval);
            tokio::pin!(wake);
            loop {
                tokio::select! {
                    _ = &mut wake => break,
                    _ = tokio::time::sleep_until(deadline) => return Ok(None),
                    notice = self.notices.recv() => match notice {
                        Ok(TaskNotice { task_id, kind: TaskNoticeKind::Completed })
                            if task_id == self.task_id => break,
                        Ok(_) => continue,
                        // Lagged or closed: fall back to polling.
                        Err(_) => break,
                    },
                }
            }
        }
    }
}

struct SchedulerInner {
    store: TaskStore,
    registry: TaskRegistry,
    node_id: i64,
    workers: usize,
    max_retries: u32,
    poll_interval: Duration,
    claim_lease: Duration,
    sweep_interval: Duration,
    node_timeout: Duration,
    shutdown: watch::Sender<bool>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

/// Drives task execution on one node.
///
/// `start()` brings up the configured number of claim-execute-release worker
/// loops plus a heartbeat and a stale-claim sweeper; `shutdown()` stops them
/// after their current task.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<SchedulerInner>,
}

impl Scheduler {
    /// Registers this node and prepares a scheduler over the queue.
    ///
    /// Every resource named by a registered task type is ensured to exist;
    /// concurrency caps are set separately by the wiring.
    pub async fn new(
        store: TaskStore,
        registry: TaskRegistry,
        config: &VaultConfig,
        hostname: &str,
    ) -> Result<Self> {
        let node_id = store.register_node(hostname).await?;
        for task_type in registry.iter() {
            for resource in task_type.resources {
                store.ensure_resource(resource).await?;
            }
        }

        let (shutdown, _) = watch::channel(false);
        Ok(Scheduler {
            inner: Arc::new(SchedulerInner {
                store,
                registry,
                node_id,
                workers: config.task_workers,
                max_retries: config.max_retries,
                poll_interval: config.poll_interval(),
                claim_lease: config.claim_lease(),
                sweep_interval: config.sweep_interval(),
                node_timeout: config.node_timeout(),
                shutdown,
                handles: Mutex::new(Vec::new()),
            }),
        })
    }

    /// Returns the underlying queue.
    pub fn store(&self) -> &TaskStore {
        &self.inner.store
    }

    /// Returns this node's id.
    pub fn node_id(&self) -> i64 {
        self.inner.node_id
    }

    /// Spawns the worker, sweeper, and heartbeat loops.
    pub async fn start(&self) {
        let mut handles = self.inner.handles.lock().await;
        if !handles.is_empty() {
            return;
        }

        info!(node = self.inner.node_id, workers = self.inner.workers, "scheduler starting");
        for worker in 0..self.inner.workers {
            let inner = self.inner.clone();
            handles.push(tokio::spawn(async move {
                worker_loop(inner, worker).await;
            }));
        }

        let sweeper = self.inner.clone();
        handles.push(tokio::spawn(async move {
            sweep_loop(sweeper).await;
        }));

        let heart = self.inner.clone();
        handles.push(tokio::spawn(async move {
            heartbeat_loop(heart).await;
        }));
    }

    /// Signals every loop to stop and waits for them.
    pub async fn shutdown(&self) {
        let _ = self.inner.shutdown.send(true);
        let mut handles = self.inner.handles.lock().await;
        for handle in handles.drain(..) {
            let _ = handle.await;
        }
    }

    /// Enqueues a task of a registered type.
    pub async fn submit(
        &self,
        task_type: &str,
        input: Value,
        tenant_id: Option<i64>,
        priority: i64,
    ) -> Result<i64> {
        self.submit_with_deps(task_type, input, tenant_id, priority, &[])
            .await
    }

    /// Enqueues a task that must wait for the given tasks to complete.
    pub async fn submit_with_deps(
        &self,
        task_type: &str,
        input: Value,
        tenant_id: Option<i64>,
        priority: i64,
        depends_on: &[i64],
    ) -> Result<i64> {
        let resources = self
            .inner
            .registry
            .get(task_type)
            .map(|tt| tt.resources)
            .unwrap_or(&[]);
        self.inner
            .store
            .submit(NewTask {
                task_type,
                input,
                tenant_id,
                parent_id: None,
                priority,
                depends_on,
                resources,
            })
            .await
    }

    /// Enqueues a task and returns a typed handle on its completion.
    pub async fn submit_tracked<O: DeserializeOwned>(
        &self,
        task_type: &str,
        input: Value,
        tenant_id: Option<i64>,
    ) -> Result<TaskHandle<O>> {
        let id = self
            .submit(task_type, input, tenant_id, DEFAULT_PRIORITY)
            .await?;
        Ok(TaskHandle::new(
            id,
            self.inner.store.clone(),
            self.inner.poll_interval,
        ))
    }
}

async fn worker_loop(inner: Arc<SchedulerInner>, worker: usize) {
    let mut shutdown = inner.shutdown.subscribe();
    let mut notices = inner.store.subscribe();

    loop {
        if *shutdown.borrow() {
            break;
        }

        match inner.store.claim_next(inner.node_id).await {
            Ok(Some(task)) => {
                execute(&inner, task).await;
                // Immediately look for more work.
                continue;
            }
            Ok(None) => {}
            Err(e) => {
                warn!(worker, error = %e, "claim failed");
            }
        }

        // Idle: wake on an availability notice, the poll fallback, or
        // shutdown.
        tokio::select! {
            _ = shutdown.changed() => {}
            _ = tokio::time::sleep(inner.poll_interval) => {}
            notice = notices.recv() => {
                if let Ok(TaskNotice { kind: TaskNoticeKind::Completed, .. }) = notice {
                    // Completions only matter to handles.
                    continue;
                }
            }
        }
    }
    debug!(worker, "worker stopped");
}

async fn execute(inner: &Arc<SchedulerInner>, task: TaskRow) {
    let task_id = task.id;
    let task_type = task.task_type.clone();
    debug!(task = task_id, r#type = %task_type, "executing");

    let outcome = match inner.registry.get(&task_type) {
        Some(tt) => {
            let ctx = TaskContext {
                task,
                store: inner.store.clone(),
            };
            (tt.runner)(ctx).await
        }
        None => Outcome::Failed(TaskError::terminal(format!(
            "no task type registered for {:?}",
            task_type
        ))),
    };

    if let Outcome::Failed(ref err) = outcome {
        warn!(task = task_id, r#type = %task_type, error = %err.message, "task failed");
    }
    if let Err(e) = inner.store.release(task_id, outcome, inner.max_retries).await {
        error!(task = task_id, error = %e, "failed to release task");
    }
}

async fn sweep_loop(inner: Arc<SchedulerInner>) {
    let mut shutdown = inner.shutdown.subscribe();
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = tokio::time::sleep(inner.sweep_interval) => {}
        }
        if *shutdown.borrow() {
            break;
        }
        if let Err(e) = inner
            .store
            .sweep(inner.claim_lease, inner.node_timeout, inner.max_retries)
            .await
        {
            warn!(error = %e, "sweep failed");
        }
    }
}

async fn heartbeat_loop(inner: Arc<SchedulerInner>) {
    let mut shutdown = inner.shutdown.subscribe();
    let interval = inner.node_timeout / 4;
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = tokio::time::sleep(interval) => {}
        }
        if *shutdown.borrow() {
            break;
        }
        if let Err(e) = inner.store.heartbeat(inner.node_id).await {
            warn!(error = %e, "heartbeat failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Db;
    use crate::index::Index;
    use futures::FutureExt;

    fn quick_config() -> VaultConfig {
        VaultConfig {
            task_workers: 2,
            poll_interval_millis: 20,
            sweep_interval_secs: 1,
            ..VaultConfig::default()
        }
    }

    async fn scheduler_with(registry: TaskRegistry) -> Scheduler {
        let db = Db::open_in_memory().unwrap();
        Index::new(db.clone()).init().await.unwrap();
        let store = TaskStore::new(db);
        store.init().await.unwrap();
        Scheduler::new(store, registry, &quick_config(), "test-node")
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn runs_submitted_task_to_completion() {
        let mut registry = TaskRegistry::new();
        registry.register(TaskType::new("double", &[], |ctx| {
            async move {
                let n = ctx.task.input["n"].as_i64().unwrap_or(0);
                Outcome::Complete(serde_json::json!({ "doubled": n * 2 }))
            }
            .boxed()
        }));

        let scheduler = scheduler_with(registry).await;
        scheduler.start().await;

        let mut handle: TaskHandle<Value> = scheduler
            .submit_tracked("double", serde_json::json!({ "n": 21 }), None)
            .await
            .unwrap();
        let output = handle.wait(Duration::from_secs(5)).await.unwrap().unwrap();
        assert_eq!(output["doubled"], 42);

        scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn unknown_task_type_errors_terminally() {
        let scheduler = scheduler_with(TaskRegistry::new()).await;
        scheduler.start().await;

        let mut handle: TaskHandle<Value> = scheduler
            .submit_tracked("missing", Value::Null, None)
            .await
            .unwrap();
        let err = handle.wait(Duration::from_secs(5)).await.unwrap_err();
        assert!(matches!(
            err,
            VaultError::TaskExecutionFailed { retryable: false, .. }
        ));

        scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn retryable_failure_is_retried_to_success() {
        use std::sync::atomic::{AtomicU32, Ordering};
        static ATTEMPTS: AtomicU32 = AtomicU32::new(0);

        let mut registry = TaskRegistry::new();
        registry.register(TaskType::new("flaky", &[], |_ctx| {
            async move {
                if ATTEMPTS.fetch_add(1, Ordering::SeqCst) == 0 {
                    Outcome::Failed(TaskError::retryable("first attempt flakes"))
                } else {
                    Outcome::Complete(Value::from("second time lucky"))
                }
            }
            .boxed()
        }));

        let scheduler = scheduler_with(registry).await;
        scheduler.start().await;

        let mut handle: TaskHandle<String> = scheduler
            .submit_tracked("flaky", Value::Null, None)
            .await
            .unwrap();
        let output = handle.wait(Duration::from_secs(5)).await.unwrap().unwrap();
        assert_eq!(output, "second time lucky");

        let row = scheduler
            .store()
            .get(handle.task_id())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.retry_count, 1);

        scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn handle_times_out_without_mutating_task() {
        let registry = TaskRegistry::new();
        let scheduler = scheduler_with(registry).await;
        // Not started: nothing will claim the task.

        let mut handle: TaskHandle<Value> = scheduler
            .submit_tracked("never-runs", Value::Null, None)
            .await
            .unwrap();
        let waited = handle.wait(Duration::from_millis(50)).await.unwrap();
        assert!(waited.is_none());

        let row = scheduler
            .store()
            .get(handle.task_id())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.status, TaskStatus::Open);
    }

    #[tokio::test]
    async fn dependent_task_completes_after_dependency() {
        let mut registry = TaskRegistry::new();
        registry.register(TaskType::new("noop", &[], |_ctx| {
            async move { Outcome::Complete(Value::Null) }.boxed()
        }));

        let scheduler = scheduler_with(registry).await;

        let a = scheduler
            .submit("noop", Value::Null, None, DEFAULT_PRIORITY)
            .await
            .unwrap();
        let b = scheduler
            .submit_with_deps("noop", Value::Null, None, DEFAULT_PRIORITY, &[a])
            .await
            .unwrap();
        assert_eq!(
            scheduler.store().get(b).await.unwrap().unwrap().status,
            TaskStatus::Blocked
        );

        scheduler.start().await;
        let mut handle =
            TaskHandle::<Value>::new(b, scheduler.store().clone(), Duration::from_millis(20));
        handle.wait(Duration::from_secs(5)).await.unwrap().unwrap();

        let a_row = scheduler.store().get(a).await.unwrap().unwrap();
        let b_row = scheduler.store().get(b).await.unwrap().unwrap();
        assert!(b_row.completed_at.unwrap() >= a_row.completed_at.unwrap());

        scheduler.shutdown().await;
    }
}
