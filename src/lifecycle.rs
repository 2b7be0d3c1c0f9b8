//! Task state machine: admission, background execution, stop and delete.
//!
//! A task is written as `in_progress` and handed to a pool worker. The worker
//! is the only writer of progress entries for its task; a manual stop and the
//! worker's terminal write race through conditional SQL, so whichever commits
//! first decides the final status and the other becomes a no-op.

use crate::device_config::DeviceConfig;
use crate::error::TaskError;
use crate::executor::{
    CancelToken, ExecutorEvent, ProgressSink, UpgradeExecutor, UpgradeOutcome, UpgradeRequest,
};
use crate::fanout::{FanoutEvent, Notifier};
use crate::settings::LifecycleSettings;
use crate::store::{FinishOutcome, LogType, NewTask, Store, Task, TaskStatus};
use crate::worker_pool::WorkerPool;
use serde::Deserialize;
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

pub const STOP_MESSAGE: &str = "upgrade task stopped manually";
pub const MAX_LIST_LIMIT: usize = 100;

const WORKER_POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Body of a create request. Older clients send `ne_ip` / `ne_ip_input`.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct CreateTaskRequest {
    #[serde(default)]
    pub upgrade_type: Option<String>,
    #[serde(default)]
    pub work_type: Option<String>,
    #[serde(default, alias = "ne_ip")]
    pub target_address: Option<TargetInput>,
    #[serde(default, alias = "ne_ip_input")]
    pub raw_target_input: Option<String>,
    #[serde(default)]
    pub version_path: Option<String>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(untagged)]
pub enum TargetInput {
    One(String),
    Many(Vec<String>),
}

impl TargetInput {
    fn normalized(&self) -> String {
        match self {
            Self::One(raw) => raw.trim().to_string(),
            Self::Many(items) => items
                .iter()
                .map(|item| item.trim())
                .filter(|item| !item.is_empty())
                .collect::<Vec<_>>()
                .join(","),
        }
    }
}

impl CreateTaskRequest {
    /// Trims every field and reports all blank required fields at once.
    pub fn validate(&self) -> Result<NewTask, TaskError> {
        let field = |value: &Option<String>| {
            value
                .as_deref()
                .map(str::trim)
                .unwrap_or_default()
                .to_string()
        };
        let upgrade_type = field(&self.upgrade_type);
        let work_type = field(&self.work_type);
        let version_path = field(&self.version_path);
        let target_address = self
            .target_address
            .as_ref()
            .map(TargetInput::normalized)
            .unwrap_or_default();

        let missing: Vec<&str> = [
            ("upgrade_type", &upgrade_type),
            ("work_type", &work_type),
            ("target_address", &target_address),
            ("version_path", &version_path),
        ]
        .into_iter()
        .filter(|(_, value)| value.is_empty())
        .map(|(name, _)| name)
        .collect();
        if !missing.is_empty() {
            return Err(TaskError::Validation(format!(
                "missing required fields: {}",
                missing.join(", ")
            )));
        }

        Ok(NewTask {
            upgrade_type,
            work_type,
            target_address,
            raw_target_input: self
                .raw_target_input
                .as_deref()
                .map(str::trim)
                .filter(|raw| !raw.is_empty())
                .map(str::to_string),
            version_path,
        })
    }
}

pub fn initial_message(task: &NewTask) -> String {
    format!(
        "upgrade task started\nupgrade type: {}\nwork type: {}\nNE IP: {}\nversion path: {}",
        task.upgrade_type, task.work_type, task.target_address, task.version_path
    )
}

/// Stop flags of tasks that currently own a worker.
#[derive(Clone, Default)]
struct CancelRegistry(Arc<Mutex<HashMap<i64, CancelToken>>>);

impl CancelRegistry {
    fn register(&self, task_id: i64) -> CancelToken {
        let token = CancelToken::new();
        if let Ok(mut tokens) = self.0.lock() {
            tokens.insert(task_id, token.clone());
        }
        token
    }

    fn cancel(&self, task_id: i64) -> bool {
        let token = self.0.lock().ok().and_then(|tokens| tokens.get(&task_id).cloned());
        match token {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    fn remove(&self, task_id: i64) {
        if let Ok(mut tokens) = self.0.lock() {
            tokens.remove(&task_id);
        }
    }
}

struct Registered {
    registry: CancelRegistry,
    task_id: i64,
}

impl Drop for Registered {
    fn drop(&mut self) {
        self.registry.remove(self.task_id);
    }
}

pub struct TaskManager {
    store: Store,
    pool: WorkerPool,
    list_limit: usize,
    runner: Runner,
}

impl TaskManager {
    pub fn new(
        store: Store,
        executor: Arc<dyn UpgradeExecutor>,
        notifier: Notifier,
        settings: LifecycleSettings,
        list_limit: usize,
    ) -> Self {
        let pool = WorkerPool::new(settings.workers, settings.queue_depth);
        tracing::info!(
            workers = pool.workers(),
            capacity = pool.capacity(),
            executor = executor.kind(),
            "task manager ready"
        );
        Self {
            runner: Runner {
                store: store.clone(),
                executor,
                notifier,
                cancels: CancelRegistry::default(),
                settings,
            },
            store,
            pool,
            list_limit: list_limit.clamp(1, MAX_LIST_LIMIT),
        }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn notifier(&self) -> &Notifier {
        &self.runner.notifier
    }

    pub fn stale_after(&self) -> Duration {
        self.runner.settings.stale_after
    }

    pub fn capacity(&self) -> usize {
        self.pool.capacity()
    }

    /// Tasks admitted to the pool that have not finished yet.
    pub fn outstanding(&self) -> usize {
        self.pool.outstanding()
    }

    pub fn create_task(&self, request: &CreateTaskRequest) -> Result<Task, TaskError> {
        let new = request.validate()?;
        if self.runner.settings.strict_config {
            self.store
                .load_device_config()?
                .validate_task(&new)
                .map_err(TaskError::Validation)?;
        }

        let reservation = self.pool.try_reserve().ok_or(TaskError::Busy {
            capacity: self.pool.capacity(),
        })?;
        let (task, _) = self.store.insert_task(&new, &initial_message(&new))?;
        let token = self.runner.cancels.register(task.id);

        let runner = self.runner.clone();
        let request = UpgradeRequest {
            task_id: task.id,
            upgrade_type: task.upgrade_type.clone(),
            work_type: task.work_type.clone(),
            target_address: task.target_address.clone(),
            version_path: task.version_path.clone(),
        };
        if let Err(err) = reservation.submit(move || runner.run(request, token)) {
            tracing::error!(task_id = task.id, error = %err, "task-submit-failed");
            self.runner.cancels.remove(task.id);
            self.runner.finish(
                task.id,
                TaskStatus::Failed,
                &format!("upgrade failed: {err}"),
                LogType::Error,
            );
            return Ok(self.store.get_task(task.id)?.unwrap_or(task));
        }

        tracing::info!(
            task_id = task.id,
            upgrade_type = %task.upgrade_type,
            work_type = %task.work_type,
            target = %task.target_address,
            "upgrade task created"
        );
        Ok(task)
    }

    pub fn get_task(&self, id: i64) -> Result<Task, TaskError> {
        self.store.get_task(id)?.ok_or(TaskError::NotFound(id))
    }

    /// Newest first. `limit` falls back to the configured default and is
    /// capped at [`MAX_LIST_LIMIT`].
    pub fn list_tasks(&self, limit: Option<usize>) -> Result<Vec<Task>, TaskError> {
        let limit = limit.unwrap_or(self.list_limit).clamp(1, MAX_LIST_LIMIT);
        Ok(self.store.recent_tasks(limit)?)
    }

    pub fn stop_task(&self, id: i64) -> Result<Task, TaskError> {
        let (task, entry) = self
            .store
            .stop_task(id, STOP_MESSAGE)?
            .ok_or(TaskError::NotFound(id))?;
        let signalled = self.runner.cancels.cancel(id);
        tracing::info!(task_id = id, worker_signalled = signalled, "upgrade task stopped");

        let notifier = &self.runner.notifier;
        notifier.publish_entry(id, &entry);
        notifier.publish(
            id,
            FanoutEvent::Status {
                status: TaskStatus::Stopped,
            },
        );
        notifier.close(id);
        Ok(task)
    }

    pub fn delete_task(&self, id: i64) -> Result<(), TaskError> {
        self.runner.cancels.cancel(id);
        if !self.store.delete_task(id)? {
            return Err(TaskError::NotFound(id));
        }
        self.runner.notifier.close(id);
        tracing::info!(task_id = id, "upgrade task deleted");
        Ok(())
    }

    pub fn device_config(&self) -> Result<DeviceConfig, TaskError> {
        Ok(self.store.load_device_config()?)
    }
}

enum Verdict {
    Finish {
        status: TaskStatus,
        message: String,
        log_type: LogType,
    },
    Stopped,
}

impl Verdict {
    fn failed(message: impl Into<String>) -> Self {
        Self::Finish {
            status: TaskStatus::Failed,
            message: message.into(),
            log_type: LogType::Error,
        }
    }
}

/// Everything a worker needs to drive one task.
#[derive(Clone)]
struct Runner {
    store: Store,
    executor: Arc<dyn UpgradeExecutor>,
    notifier: Notifier,
    cancels: CancelRegistry,
    settings: LifecycleSettings,
}

impl Runner {
    fn run(&self, request: UpgradeRequest, cancel: CancelToken) {
        let task_id = request.task_id;
        let _registered = Registered {
            registry: self.cancels.clone(),
            task_id,
        };
        if cancel.is_cancelled() {
            tracing::info!(task_id, "task cancelled before start");
            return;
        }

        self.progress(task_id, "upgrade task starting");
        match self.supervise(request, &cancel) {
            Verdict::Finish {
                status,
                message,
                log_type,
            } => self.finish(task_id, status, &message, log_type),
            Verdict::Stopped => {
                tracing::info!(task_id, "worker released after stop");
            }
        }
    }

    /// Runs the executor on its own thread and relays its progress until an
    /// outcome, a stop or the deadline.
    fn supervise(&self, request: UpgradeRequest, cancel: &CancelToken) -> Verdict {
        let task_id = request.task_id;
        let (tx, rx) = mpsc::channel();
        let sink = ProgressSink::new(tx.clone());
        let executor = Arc::clone(&self.executor);
        let exec_cancel = cancel.clone();

        let spawned = thread::Builder::new()
            .name(format!("upgrade-exec-{task_id}"))
            .spawn(move || {
                let result = panic::catch_unwind(AssertUnwindSafe(|| {
                    executor.execute(&request, &sink, &exec_cancel)
                }))
                .map_err(panic_message);
                let _ = tx.send(ExecutorEvent::Finished(result));
            });
        if let Err(err) = spawned {
            return Verdict::failed(format!("upgrade failed: could not start executor: {err}"));
        }

        let deadline = self.settings.task_timeout.map(|limit| Instant::now() + limit);
        loop {
            if cancel.is_cancelled() {
                return Verdict::Stopped;
            }
            match rx.recv_timeout(WORKER_POLL_INTERVAL) {
                Ok(ExecutorEvent::Progress(line)) => self.progress(task_id, &line),
                Ok(ExecutorEvent::Finished(result)) => {
                    if cancel.is_cancelled() {
                        return Verdict::Stopped;
                    }
                    return match result {
                        Ok(UpgradeOutcome::Success) => Verdict::Finish {
                            status: TaskStatus::Success,
                            message: "upgrade task completed".to_string(),
                            log_type: LogType::Success,
                        },
                        Ok(UpgradeOutcome::Failure) => Verdict::failed("upgrade task failed"),
                        Err(panic) => {
                            tracing::error!(task_id, panic = %panic, "executor panicked");
                            Verdict::failed(format!("upgrade failed: executor panicked: {panic}"))
                        }
                    };
                }
                Err(RecvTimeoutError::Timeout) => {
                    if let (Some(deadline), Some(limit)) = (deadline, self.settings.task_timeout) {
                        if Instant::now() >= deadline {
                            cancel.cancel();
                            tracing::warn!(task_id, limit_secs = limit.as_secs(), "task timed out");
                            return Verdict::failed(format!(
                                "upgrade timed out after {}s",
                                limit.as_secs()
                            ));
                        }
                    }
                }
                Err(RecvTimeoutError::Disconnected) => {
                    return Verdict::failed(
                        "upgrade failed: executor exited without reporting an outcome",
                    );
                }
            }
        }
    }

    fn progress(&self, task_id: i64, line: &str) {
        match self.store.append_progress(task_id, line, LogType::Info) {
            Ok(Some(entry)) => self.notifier.publish_entry(task_id, &entry),
            Ok(None) => tracing::debug!(task_id, "progress dropped, task no longer running"),
            Err(err) => tracing::error!(task_id, error = %err, "progress-write-failed"),
        }
    }

    fn finish(&self, task_id: i64, status: TaskStatus, message: &str, log_type: LogType) {
        let attempts = self.settings.finish_retry_attempts.max(1);
        for attempt in 1..=attempts {
            match self.store.finish_task(task_id, status, message, log_type) {
                Ok(FinishOutcome::Applied(entry)) => {
                    tracing::info!(task_id, status = %status, "upgrade task finished");
                    self.notifier.publish_entry(task_id, &entry);
                    self.notifier.publish(task_id, FanoutEvent::Status { status });
                    self.notifier.close(task_id);
                    return;
                }
                Ok(FinishOutcome::AlreadyFinished(current)) => {
                    tracing::info!(
                        task_id,
                        current = %current,
                        wanted = %status,
                        "terminal write skipped"
                    );
                    return;
                }
                Ok(FinishOutcome::Missing) => {
                    tracing::warn!(task_id, "task deleted before it finished");
                    return;
                }
                Err(err) => {
                    tracing::error!(task_id, attempt, attempts, error = %err, "terminal-write-failed");
                    if attempt < attempts {
                        thread::sleep(self.settings.finish_retry_delay);
                    }
                }
            }
        }
        tracing::error!(task_id, status = %status, "giving up on terminal write");
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic".to_string()
    }
}
