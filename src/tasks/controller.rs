use chrono::Utc;
use futures::FutureExt;
use serde::Serialize;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Weak};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, Mutex};
use tracing::{debug, error, info, warn};

use crate::adapters::TargetCatalog;
use crate::cli::config::WorkerSettings;
use crate::process::{ProcessManager, ProcessRecord, SupervisorEvent, WorkerLauncher};
use crate::storage::export::{self, ExportFormat};
use crate::storage::{CredentialStore, Pagination, ResultPage, TaskFilter, TaskStore};
use crate::tasks::task::{ProgressSnapshot, ResultRecord, Task, TaskConfig, TaskId, TaskStatus};
use crate::worker::{StartMessage, SupervisorMessage, WorkerMessage};

/// Page size used when a task's whole result set is read back
const EXPORT_BATCH: u32 = 1000;

/// Failures of controller operations
#[derive(Debug, Error)]
pub enum ControllerError {
    #[error("invalid task configuration: {0}")]
    Validation(String),

    #[error("task {0} not found")]
    NotFound(TaskId),

    #[error("task {id} cannot go from {from} to {to}")]
    InvalidTransition { id: TaskId, from: TaskStatus, to: TaskStatus },

    #[error("task {0} already has a live worker")]
    AlreadyRunning(TaskId),

    #[error("task {0} has no live worker")]
    NotRunning(TaskId),

    #[error("task {0} is still active; stop it first")]
    Active(TaskId),

    #[error("failed to start a worker for task {id}: {message}")]
    Spawn { id: TaskId, message: String },

    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

/// Changes pushed to subscribers
#[derive(Debug, Clone, PartialEq)]
pub enum TaskEvent {
    StatusChanged { task_id: TaskId, status: TaskStatus },
    Progress(ProgressSnapshot),
    Completed { task_id: TaskId, results: usize },
    Failed { task_id: TaskId, message: String },
}

impl TaskEvent {
    pub fn task_id(&self) -> TaskId {
        match self {
            Self::StatusChanged { task_id, .. } => *task_id,
            Self::Progress(snapshot) => snapshot.task_id,
            Self::Completed { task_id, .. } => *task_id,
            Self::Failed { task_id, .. } => *task_id,
        }
    }
}

/// Operations accepted by `bulk_operation`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BulkOp {
    Start,
    Pause,
    Resume,
    Stop,
    Delete,
}

impl std::str::FromStr for BulkOp {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> anyhow::Result<Self> {
        match value.to_lowercase().as_str() {
            "start" => Ok(Self::Start),
            "pause" => Ok(Self::Pause),
            "resume" => Ok(Self::Resume),
            "stop" => Ok(Self::Stop),
            "delete" => Ok(Self::Delete),
            other => anyhow::bail!("Unsupported bulk operation: {}", other),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BulkOutcome {
    pub task_id: TaskId,
    pub success: bool,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct KillOutcome {
    pub success: bool,
    pub task_id: Option<TaskId>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProcessStatus {
    pub pid: u32,
    pub alive: bool,
    /// Supervised by this controller
    pub tracked: bool,
    pub task_id: Option<TaskId>,
}

/// What the start-up recovery pass did
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SessionRecovery {
    /// Active tasks without any live worker, now failed
    pub orphaned: Vec<TaskId>,
    /// Active tasks whose worker outlived its supervisor, killed and failed
    pub detached: Vec<TaskId>,
    /// Pending tasks whose schedule has come
    pub due: Vec<TaskId>,
}

/// Timing knobs of worker supervision
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ControllerSettings {
    pub stop_grace: Duration,
    pub heartbeat_interval_ms: u64,
    pub heartbeat_timeout: Duration,
}

impl From<&WorkerSettings> for ControllerSettings {
    fn from(settings: &WorkerSettings) -> Self {
        Self {
            stop_grace: settings.stop_grace(),
            heartbeat_interval_ms: settings.heartbeat_interval_ms,
            heartbeat_timeout: settings.heartbeat_timeout(),
        }
    }
}

struct Inner {
    store: Arc<dyn TaskStore>,
    targets: TargetCatalog,
    credentials: Arc<dyn CredentialStore>,
    processes: ProcessManager,
    settings: ControllerSettings,
    progress: Mutex<HashMap<TaskId, ProgressSnapshot>>,
    events: broadcast::Sender<TaskEvent>,

    /// Serialises read-modify-write cycles on persisted tasks
    writes: Mutex<()>,
}

/// Owns task lifecycle: validation, status, workers and their reports.
///
/// Control calls and worker events both go through here; status is only
/// ever written by this type.
#[derive(Clone)]
pub struct TaskController {
    inner: Arc<Inner>,
}

impl TaskController {
    /// Create a controller. Must be called inside a tokio runtime.
    pub fn new(
        store: Arc<dyn TaskStore>,
        targets: TargetCatalog,
        credentials: Arc<dyn CredentialStore>,
        launcher: Arc<dyn WorkerLauncher>,
        settings: ControllerSettings,
    ) -> Self {
        let (processes, supervisor_events) = ProcessManager::new(launcher);
        let (events, _) = broadcast::channel(1024);

        let inner = Arc::new(Inner {
            store,
            targets,
            credentials,
            processes,
            settings,
            progress: Mutex::new(HashMap::new()),
            events,
            writes: Mutex::new(()),
        });
        tokio::spawn(handle_events(Arc::downgrade(&inner), supervisor_events));

        Self { inner }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TaskEvent> {
        self.inner.events.subscribe()
    }

    pub fn targets(&self) -> &TargetCatalog {
        &self.inner.targets
    }

    /// Validate and persist a new pending task
    pub async fn create_task(&self, config: TaskConfig) -> Result<TaskId, ControllerError> {
        self.validate(&config)?;
        let task = self.inner.store.create_task(config).await?;
        info!("Created task {} '{}' on target {}", task.id, task.config.name, task.config.target);
        Ok(task.id)
    }

    fn validate(&self, config: &TaskConfig) -> Result<(), ControllerError> {
        let invalid = |message: String| Err(ControllerError::Validation(message));

        if config.name.trim().is_empty() {
            return invalid("name must not be empty".into());
        }
        if config.keywords.is_empty() {
            return invalid("at least one keyword is required".into());
        }
        if config.keywords.iter().any(|k| k.trim().is_empty()) {
            return invalid("keywords must not be blank".into());
        }
        if config.max_pages < 1 {
            return invalid("max_pages must be at least 1".into());
        }
        if config.concurrency < 1 {
            return invalid("concurrency must be at least 1".into());
        }
        if config.delay_between_requests < 0 {
            return invalid("delay_between_requests must not be negative".into());
        }

        let Some(target) = self.inner.targets.get(&config.target) else {
            return invalid(format!("unknown target '{}'", config.target));
        };
        if !target.active {
            return invalid(format!("target '{}' is not active", config.target));
        }
        let has_binding = config.credential_id.as_deref().map_or(false, |id| !id.trim().is_empty());
        if target.requires_credentials && !has_binding {
            return invalid(format!("target '{}' requires a credential binding", config.target));
        }
        Ok(())
    }

    pub async fn get_task(&self, id: TaskId) -> Result<Task, ControllerError> {
        self.inner
            .store
            .get_task(id)
            .await?
            .ok_or(ControllerError::NotFound(id))
    }

    pub async fn list_tasks(&self, filter: &TaskFilter) -> Result<Vec<Task>, ControllerError> {
        Ok(self.inner.store.list_tasks(filter).await?)
    }

    pub async fn get_task_results(&self, id: TaskId, pagination: Pagination) -> Result<ResultPage, ControllerError> {
        self.get_task(id).await?;
        Ok(self.inner.store.get_results(id, pagination).await?)
    }

    /// Render every stored result of a task
    pub async fn export_task_results(&self, id: TaskId, format: ExportFormat) -> Result<String, ControllerError> {
        self.get_task(id).await?;

        let mut records: Vec<ResultRecord> = Vec::new();
        let mut page = 1;
        loop {
            let batch = self
                .inner
                .store
                .get_results(id, Pagination::new(page, EXPORT_BATCH))
                .await?;
            let done = batch.items.is_empty() || records.len() + batch.items.len() >= batch.total as usize;
            records.extend(batch.items);
            if done {
                break;
            }
            page += 1;
        }

        Ok(export::render(&records, format)?)
    }

    /// Latest progress of a task, if it reported any
    pub async fn get_progress(&self, id: TaskId) -> Option<ProgressSnapshot> {
        self.inner.progress.lock().await.get(&id).cloned()
    }

    /// Workers supervised by this controller
    pub async fn running(&self) -> Vec<ProcessRecord> {
        self.inner.processes.records().await
    }

    /// No worker is supervised and every finished run has been recorded
    pub async fn is_idle(&self) -> bool {
        // Records are released under the write lock together with the status write
        let _write = self.inner.writes.lock().await;
        self.inner.processes.is_empty().await
    }

    /// Launch a worker for a pending or paused task
    pub async fn start_task(&self, id: TaskId) -> Result<ProcessRecord, ControllerError> {
        let _write = self.inner.writes.lock().await;
        let mut task = self.get_task(id).await?;

        if !task.status.can_transition_to(TaskStatus::InProgress) {
            return Err(ControllerError::InvalidTransition {
                id,
                from: task.status,
                to: TaskStatus::InProgress,
            });
        }
        if self.inner.processes.record(id).await.is_some() {
            return Err(ControllerError::AlreadyRunning(id));
        }
        if let Some(pid) = task.pid {
            if self.inner.processes.is_live_worker(pid).await {
                return Err(ControllerError::AlreadyRunning(id));
            }
        }

        let target = match self.inner.targets.get(&task.config.target) {
            Some(target) if target.active => target.clone(),
            Some(_) => {
                return Err(ControllerError::Validation(format!(
                    "target '{}' is not active",
                    task.config.target
                )))
            }
            None => {
                return Err(ControllerError::Validation(format!(
                    "unknown target '{}'",
                    task.config.target
                )))
            }
        };

        let credentials = match task.config.credential_id.as_deref() {
            Some(binding) => match self.inner.credentials.resolve(binding).await? {
                Some(credentials) => Some(credentials),
                None if target.requires_credentials => {
                    return Err(ControllerError::Validation(format!(
                        "credential binding '{}' could not be resolved",
                        binding
                    )))
                }
                None => {
                    warn!("Task {}: credential binding '{}' not found, running without it", id, binding);
                    None
                }
            },
            None => None,
        };

        let start = StartMessage {
            task_id: id,
            config: task.config.clone(),
            target,
            credentials,
            heartbeat_interval_ms: self.inner.settings.heartbeat_interval_ms,
        };

        transition(&mut task, TaskStatus::InProgress)?;
        let record = match self.inner.processes.spawn(start).await {
            Ok(record) => record,
            Err(e) => {
                let message = format!("{:#}", e);
                error!("Task {}: worker spawn failed: {}", id, message);
                transition(&mut task, TaskStatus::Failed)?;
                task.append_error(&format!("worker spawn failed: {}", message));
                self.inner.store.update_task(&task).await?;
                self.emit(TaskEvent::Failed {
                    task_id: id,
                    message: message.clone(),
                });
                return Err(ControllerError::Spawn { id, message });
            }
        };

        task.pid = Some(record.pid);
        task.append_run_log(&format!("run {} started on worker pid {}", record.run_id, record.pid));
        self.inner.store.update_task(&task).await?;
        self.inner.progress.lock().await.remove(&id);

        info!("Task {} started on worker {}", id, record.pid);
        self.emit_status(id, TaskStatus::InProgress);
        Ok(record)
    }

    /// Stop the worker of an active task and put it back to pending
    pub async fn stop_task(&self, id: TaskId) -> Result<(), ControllerError> {
        let _write = self.inner.writes.lock().await;
        self.get_task(id).await?;

        let Some(record) = self
            .inner
            .processes
            .terminate(id, self.inner.settings.stop_grace)
            .await?
        else {
            return Err(ControllerError::NotRunning(id));
        };

        let mut task = self.get_task(id).await?;
        if task.status.is_active() {
            transition(&mut task, TaskStatus::Pending)?;
        }
        task.append_run_log(&format!("run {} stopped on request", record.run_id));
        self.inner.store.update_task(&task).await?;
        self.inner.progress.lock().await.remove(&id);

        info!("Task {} stopped (worker {})", id, record.pid);
        self.emit_status(id, task.status);
        Ok(())
    }

    pub async fn pause_task(&self, id: TaskId) -> Result<(), ControllerError> {
        self.signal_run(id, TaskStatus::InProgress, TaskStatus::Paused, SupervisorMessage::Pause)
            .await
    }

    pub async fn resume_task(&self, id: TaskId) -> Result<(), ControllerError> {
        self.signal_run(id, TaskStatus::Paused, TaskStatus::InProgress, SupervisorMessage::Resume)
            .await
    }

    async fn signal_run(
        &self,
        id: TaskId,
        from: TaskStatus,
        to: TaskStatus,
        message: SupervisorMessage,
    ) -> Result<(), ControllerError> {
        let _write = self.inner.writes.lock().await;
        let mut task = self.get_task(id).await?;

        if task.status != from {
            return Err(ControllerError::InvalidTransition {
                id,
                from: task.status,
                to,
            });
        }
        if !self.inner.processes.send_control(id, message).await {
            return Err(ControllerError::NotRunning(id));
        }

        transition(&mut task, to)?;
        self.inner.store.update_task(&task).await?;
        info!("Task {} is now {}", id, to);
        self.emit_status(id, to);
        Ok(())
    }

    /// Delete an inactive task and its results
    pub async fn delete_task(&self, id: TaskId) -> Result<(), ControllerError> {
        let _write = self.inner.writes.lock().await;
        let task = self.get_task(id).await?;

        if task.status.is_active() || self.inner.processes.record(id).await.is_some() {
            return Err(ControllerError::Active(id));
        }
        if !self.inner.store.delete_task(id).await? {
            return Err(ControllerError::NotFound(id));
        }
        self.inner.progress.lock().await.remove(&id);
        info!("Deleted task {}", id);
        Ok(())
    }

    /// Kill a worker by OS pid, tracked or left over from another supervisor.
    ///
    /// The owning task, if any, goes back to pending.
    pub async fn kill_process_by_pid(&self, pid: u32) -> KillOutcome {
        let _write = self.inner.writes.lock().await;

        match self.inner.processes.kill_by_pid(pid).await {
            Ok(Some(record)) => {
                self.requeue_killed(record.task_id, pid).await;
                return KillOutcome {
                    success: true,
                    task_id: Some(record.task_id),
                };
            }
            Ok(None) => {}
            Err(e) => {
                warn!("Failed to kill worker {}: {:#}", pid, e);
                return KillOutcome {
                    success: false,
                    task_id: None,
                };
            }
        }

        let owner = self.persisted_owner(pid).await;
        if owner.is_none() {
            warn!("Pid {} does not belong to any known task", pid);
        }
        match self.inner.processes.kill_untracked(pid).await {
            Ok(true) => {
                if let Some(task_id) = owner {
                    self.requeue_killed(task_id, pid).await;
                }
                KillOutcome {
                    success: true,
                    task_id: owner,
                }
            }
            Ok(false) => {
                debug!("No live process with pid {}", pid);
                KillOutcome {
                    success: false,
                    task_id: owner,
                }
            }
            Err(e) => {
                warn!("Failed to kill process {}: {:#}", pid, e);
                KillOutcome {
                    success: false,
                    task_id: owner,
                }
            }
        }
    }

    /// Active task recorded as owning `pid`
    async fn persisted_owner(&self, pid: u32) -> Option<TaskId> {
        match self.inner.store.list_tasks(&TaskFilter::default()).await {
            Ok(tasks) => tasks
                .into_iter()
                .find(|task| task.status.is_active() && task.pid == Some(pid))
                .map(|task| task.id),
            Err(e) => {
                warn!("Failed to look up the owner of pid {}: {:#}", pid, e);
                None
            }
        }
    }

    async fn requeue_killed(&self, id: TaskId, pid: u32) {
        if let Err(e) = self.requeue(id, pid).await {
            error!("Task {}: failed to record the kill of worker {}: {:#}", id, pid, e);
        }
        self.inner.progress.lock().await.remove(&id);
    }

    async fn requeue(&self, id: TaskId, pid: u32) -> anyhow::Result<()> {
        let Some(mut task) = self.inner.store.get_task(id).await? else {
            return Ok(());
        };
        if task.status.is_active() {
            transition(&mut task, TaskStatus::Pending)?;
        }
        task.append_run_log(&format!("worker pid {} killed by operator", pid));
        self.inner.store.update_task(&task).await?;
        self.emit_status(id, task.status);
        Ok(())
    }

    pub async fn get_process_status_by_pid(&self, pid: u32) -> ProcessStatus {
        let tracked = self
            .inner
            .processes
            .records()
            .await
            .into_iter()
            .find(|record| record.pid == pid);

        let (tracked, task_id) = match tracked {
            Some(record) => (true, Some(record.task_id)),
            None => (false, self.persisted_owner(pid).await),
        };

        ProcessStatus {
            pid,
            alive: self.inner.processes.is_alive(pid).await,
            tracked,
            task_id,
        }
    }

    /// Apply `op` to every id; one outcome per id, in order
    pub async fn bulk_operation(&self, op: BulkOp, ids: &[TaskId]) -> Vec<BulkOutcome> {
        let mut outcomes = Vec::with_capacity(ids.len());

        for &id in ids {
            let result = AssertUnwindSafe(self.apply(op, id)).catch_unwind().await;
            let error = match result {
                Ok(Ok(())) => None,
                Ok(Err(e)) => Some(e.to_string()),
                Err(panic) => {
                    let message = panic
                        .downcast_ref::<&str>()
                        .map(|s| s.to_string())
                        .or_else(|| panic.downcast_ref::<String>().cloned())
                        .unwrap_or_else(|| "unknown panic".to_string());
                    error!("Task {}: bulk {:?} panicked: {}", id, op, message);
                    Some(format!("internal error: {}", message))
                }
            };
            outcomes.push(BulkOutcome {
                task_id: id,
                success: error.is_none(),
                error,
            });
        }

        outcomes
    }

    async fn apply(&self, op: BulkOp, id: TaskId) -> Result<(), ControllerError> {
        match op {
            BulkOp::Start => self.start_task(id).await.map(|_| ()),
            BulkOp::Pause => self.pause_task(id).await,
            BulkOp::Resume => self.resume_task(id).await,
            BulkOp::Stop => self.stop_task(id).await,
            BulkOp::Delete => self.delete_task(id).await,
        }
    }

    /// Stop every worker this controller supervises
    pub async fn stop_all(&self) -> Vec<BulkOutcome> {
        let ids: Vec<TaskId> = self.running().await.iter().map(|record| record.task_id).collect();
        self.bulk_operation(BulkOp::Stop, &ids).await
    }

    /// Fail active tasks that have no live worker at all. Idempotent.
    pub async fn check_for_orphaned_processes(&self) -> Result<Vec<TaskId>, ControllerError> {
        let _write = self.inner.writes.lock().await;
        let mut orphaned = Vec::new();

        for mut task in self.active_tasks().await? {
            if self.inner.processes.record(task.id).await.is_some() {
                continue;
            }
            if let Some(pid) = task.pid {
                if self.inner.processes.is_live_worker(pid).await {
                    continue;
                }
            }

            let message = match task.pid {
                Some(pid) => format!("orphaned: worker pid {} is gone and no supervisor owns the run", pid),
                None => "orphaned: no worker is bound to the run".to_string(),
            };
            warn!("Task {}: {}", task.id, message);
            transition(&mut task, TaskStatus::Failed)?;
            task.append_error(&message);
            self.inner.store.update_task(&task).await?;
            self.emit(TaskEvent::Failed {
                task_id: task.id,
                message,
            });
            orphaned.push(task.id);
        }

        Ok(orphaned)
    }

    /// Start-up reconciliation with whatever a previous supervisor left behind
    pub async fn handle_tasks_from_previous_session(&self) -> Result<SessionRecovery, ControllerError> {
        let orphaned = self.check_for_orphaned_processes().await?;

        let _write = self.inner.writes.lock().await;
        let mut detached = Vec::new();
        for mut task in self.active_tasks().await? {
            if self.inner.processes.record(task.id).await.is_some() {
                continue;
            }
            let Some(pid) = task.pid else {
                continue;
            };

            if let Err(e) = self.inner.processes.kill_untracked(pid).await {
                warn!("Task {}: failed to kill detached worker {}: {:#}", task.id, pid, e);
            }
            let message = format!(
                "detached worker pid {} from a previous supervisor session was terminated",
                pid
            );
            warn!("Task {}: {}", task.id, message);
            transition(&mut task, TaskStatus::Failed)?;
            task.append_error(&message);
            self.inner.store.update_task(&task).await?;
            self.emit(TaskEvent::Failed {
                task_id: task.id,
                message,
            });
            detached.push(task.id);
        }

        let now = Utc::now();
        let due = self
            .inner
            .store
            .list_tasks(&TaskFilter::with_status(TaskStatus::Pending))
            .await?
            .into_iter()
            .filter(|task| task.config.scheduled_at.map_or(false, |at| at <= now))
            .map(|task| task.id)
            .collect();

        let recovery = SessionRecovery {
            orphaned,
            detached,
            due,
        };
        info!(
            "Previous session: {} orphaned, {} detached, {} due",
            recovery.orphaned.len(),
            recovery.detached.len(),
            recovery.due.len()
        );
        Ok(recovery)
    }

    async fn active_tasks(&self) -> anyhow::Result<Vec<Task>> {
        let mut tasks = self
            .inner
            .store
            .list_tasks(&TaskFilter::with_status(TaskStatus::InProgress))
            .await?;
        tasks.extend(
            self.inner
                .store
                .list_tasks(&TaskFilter::with_status(TaskStatus::Paused))
                .await?,
        );
        Ok(tasks)
    }

    /// Kill workers that stopped sending heartbeats and fail their tasks
    pub async fn check_process_health(&self) -> Result<Vec<TaskId>, ControllerError> {
        let timeout = self.inner.settings.heartbeat_timeout;
        let mut failed = Vec::new();

        for record in self.inner.processes.unhealthy(timeout).await {
            let _write = self.inner.writes.lock().await;
            // Gone already means the exit path owns the task
            if self.inner.processes.kill_by_pid(record.pid).await?.is_none() {
                continue;
            }

            let Some(mut task) = self.inner.store.get_task(record.task_id).await? else {
                continue;
            };
            if !task.status.is_active() {
                continue;
            }
            let message = format!(
                "worker pid {} missed its heartbeat for more than {:?} and was killed",
                record.pid, timeout
            );
            warn!("Task {}: {}", task.id, message);
            transition(&mut task, TaskStatus::Failed)?;
            task.append_error(&message);
            self.inner.store.update_task(&task).await?;
            self.inner.progress.lock().await.remove(&task.id);
            self.emit(TaskEvent::Failed {
                task_id: task.id,
                message,
            });
            failed.push(task.id);
        }

        Ok(failed)
    }

    /// Wait until a task is no longer in progress or paused, or `timeout` passes
    pub async fn wait_for_settled(&self, id: TaskId, timeout: Duration) -> Result<Task, ControllerError> {
        let mut events = self.subscribe();
        let settle = async {
            loop {
                let task = match self.get_task(id).await {
                    Ok(task) => task,
                    Err(e) => return Err(e),
                };
                if !task.status.is_active() {
                    return Ok(task);
                }
                loop {
                    match events.recv().await {
                        Ok(event) if event.task_id() == id => break,
                        Ok(_) => continue,
                        Err(broadcast::error::RecvError::Lagged(_)) => break,
                        Err(broadcast::error::RecvError::Closed) => return Ok(task),
                    }
                }
            }
        };

        match tokio::time::timeout(timeout, settle).await {
            Ok(result) => result,
            Err(_) => self.get_task(id).await,
        }
    }

    fn emit(&self, event: TaskEvent) {
        let _ = self.inner.events.send(event);
    }

    fn emit_status(&self, task_id: TaskId, status: TaskStatus) {
        self.emit(TaskEvent::StatusChanged { task_id, status });
    }

    async fn handle_event(&self, event: SupervisorEvent) -> anyhow::Result<()> {
        match event {
            SupervisorEvent::Message {
                task_id,
                run_id,
                pid,
                message,
            } => {
                if !self.inner.processes.is_current(task_id, run_id).await {
                    debug!("Task {}: ignoring {} from stale run {}", task_id, message.kind(), run_id);
                    return Ok(());
                }

                match message {
                    WorkerMessage::Heartbeat { .. } => {}
                    WorkerMessage::Ack { command, .. } => {
                        debug!("Task {}: worker {} acknowledged {:?}", task_id, pid, command);
                    }
                    WorkerMessage::Progress(snapshot) => {
                        self.inner.progress.lock().await.insert(task_id, snapshot.clone());
                        self.emit(TaskEvent::Progress(snapshot));
                    }
                    WorkerMessage::Log { message, .. } => {
                        let _write = self.inner.writes.lock().await;
                        if let Some(mut task) = self.inner.store.get_task(task_id).await? {
                            task.append_run_log(&message);
                            self.inner.store.update_task(&task).await?;
                        }
                    }
                    WorkerMessage::Completed { results, .. } => {
                        let _write = self.inner.writes.lock().await;
                        if !self.inner.processes.release(task_id, run_id).await {
                            debug!("Task {}: run {} was stopped before its completion arrived", task_id, run_id);
                            return Ok(());
                        }
                        self.complete(task_id, results).await?;
                    }
                    WorkerMessage::Error { message, .. } => {
                        let _write = self.inner.writes.lock().await;
                        if !self.inner.processes.release(task_id, run_id).await {
                            return Ok(());
                        }
                        self.fail(task_id, &message).await?;
                    }
                }
            }
            SupervisorEvent::Exited {
                task_id,
                run_id,
                pid,
                report,
                released,
            } => {
                let _write = self.inner.writes.lock().await;
                // A terminal message of this run may have released it already
                if released || !self.inner.processes.release(task_id, run_id).await {
                    debug!("Task {}: worker {} exited after release ({})", task_id, pid, report.description);
                    return Ok(());
                }

                let Some(task) = self.inner.store.get_task(task_id).await? else {
                    return Ok(());
                };
                match task.status {
                    TaskStatus::InProgress | TaskStatus::Paused if task.pid == Some(pid) => {
                        let message = format!(
                            "worker pid {} exited unexpectedly ({}) without reporting a result",
                            pid, report.description
                        );
                        self.fail(task_id, &message).await?;
                    }
                    TaskStatus::Pending => {
                        info!("Task {}: worker {} exited after an external kill", task_id, pid);
                        self.inner.progress.lock().await.remove(&task_id);
                    }
                    status => {
                        debug!("Task {}: worker {} exited while task is {}", task_id, pid, status);
                    }
                }
            }
        }
        Ok(())
    }

    async fn complete(&self, id: TaskId, results: Vec<ResultRecord>) -> anyhow::Result<()> {
        let Some(mut task) = self.inner.store.get_task(id).await? else {
            warn!("Task {} was deleted while running; dropping {} results", id, results.len());
            return Ok(());
        };

        // Workers hold their result while paused, so a paused task only gets
        // here when the pause reached the worker after its run had finished
        let late_pause = task.status == TaskStatus::Paused;
        if late_pause {
            transition(&mut task, TaskStatus::InProgress)?;
            task.append_run_log("pause arrived after the last page; run already finished");
        }
        transition(&mut task, TaskStatus::Completed)?;

        self.inner.store.append_results(id, &results).await?;
        task.append_run_log(&format!("completed with {} results", results.len()));
        self.inner.store.update_task(&task).await?;
        if late_pause {
            self.emit_status(id, TaskStatus::InProgress);
        }

        let total_pages = task.config.total_pages();
        let snapshot = {
            let mut progress = self.inner.progress.lock().await;
            let keyword = progress
                .get(&id)
                .map(|p| p.keyword.clone())
                .or_else(|| task.config.keywords.last().cloned())
                .unwrap_or_default();
            let snapshot = ProgressSnapshot {
                task_id: id,
                keyword,
                current_page: total_pages,
                total_pages,
                results_count: results.len() as u64,
                percentage: 100,
                eta_seconds: Some(0),
            };
            progress.insert(id, snapshot.clone());
            snapshot
        };

        info!("Task {} completed with {} results", id, results.len());
        self.emit(TaskEvent::Progress(snapshot));
        self.emit(TaskEvent::Completed {
            task_id: id,
            results: results.len(),
        });
        self.emit_status(id, TaskStatus::Completed);
        Ok(())
    }

    async fn fail(&self, id: TaskId, message: &str) -> anyhow::Result<()> {
        let Some(mut task) = self.inner.store.get_task(id).await? else {
            return Ok(());
        };

        transition(&mut task, TaskStatus::Failed)?;
        task.append_error(message);
        self.inner.store.update_task(&task).await?;
        self.inner.progress.lock().await.remove(&id);

        error!("Task {} failed: {}", id, message);
        self.emit(TaskEvent::Failed {
            task_id: id,
            message: message.to_string(),
        });
        self.emit_status(id, TaskStatus::Failed);
        Ok(())
    }
}

/// Move `task` to `to` if the task state machine allows it
fn transition(task: &mut Task, to: TaskStatus) -> Result<(), ControllerError> {
    if !task.status.can_transition_to(to) {
        return Err(ControllerError::InvalidTransition {
            id: task.id,
            from: task.status,
            to,
        });
    }
    task.set_status(to);
    Ok(())
}

/// Consume supervisor events until the controller is dropped
async fn handle_events(inner: Weak<Inner>, mut events: mpsc::UnboundedReceiver<SupervisorEvent>) {
    while let Some(event) = events.recv().await {
        let Some(inner) = inner.upgrade() else {
            break;
        };
        let controller = TaskController { inner };
        if let Err(e) = controller.handle_event(event).await {
            error!("Failed to handle worker event: {:#}", e);
        }
    }
}
