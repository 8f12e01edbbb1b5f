pub mod in_process;
pub mod launcher;
pub mod os;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::tasks::task::TaskId;
use crate::worker::{StartMessage, SupervisorMessage, WorkerMessage};

// Re-export common types
pub use in_process::InProcessLauncher;
pub use launcher::{ExitReport, TerminationSignal, WorkerHandle, WorkerLauncher};
pub use os::OsProcessLauncher;

/// How long a worker gets after SIGTERM before SIGKILL
const TERMINATE_TIMEOUT: Duration = Duration::from_secs(2);

/// How long a killed worker gets to be reaped
const KILL_REAP_TIMEOUT: Duration = Duration::from_secs(2);

/// Bookkeeping for one live worker
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProcessRecord {
    pub task_id: TaskId,
    pub pid: u32,

    /// Distinguishes successive runs of the same task
    pub run_id: Uuid,

    pub started_at: DateTime<Utc>,

    /// Last time anything was heard from the worker
    pub last_seen: DateTime<Utc>,
}

/// What the supervisor hears about its workers
#[derive(Debug, Clone)]
pub enum SupervisorEvent {
    Message {
        task_id: TaskId,
        run_id: Uuid,
        pid: u32,
        message: WorkerMessage,
    },
    Exited {
        task_id: TaskId,
        run_id: Uuid,
        pid: u32,
        report: ExitReport,
        /// The record was released (stop, kill, terminal message) before the exit.
        /// Otherwise it stays tracked until whoever handles this event releases it.
        released: bool,
    },
}

struct Tracked {
    record: ProcessRecord,
    control: mpsc::UnboundedSender<SupervisorMessage>,
    exited: watch::Receiver<bool>,
}

impl Tracked {
    fn has_exited(&self) -> bool {
        *self.exited.borrow()
    }
}

/// Spawns workers, tracks them by task id and relays their messages
#[derive(Clone)]
pub struct ProcessManager {
    launcher: Arc<dyn WorkerLauncher>,
    tracked: Arc<Mutex<HashMap<TaskId, Tracked>>>,
    events: mpsc::UnboundedSender<SupervisorEvent>,
}

impl ProcessManager {
    /// Create a process manager and the stream of its events
    pub fn new(launcher: Arc<dyn WorkerLauncher>) -> (Self, mpsc::UnboundedReceiver<SupervisorEvent>) {
        let (events, receiver) = mpsc::unbounded_channel();
        let manager = Self {
            launcher,
            tracked: Arc::new(Mutex::new(HashMap::new())),
            events,
        };
        (manager, receiver)
    }

    /// Launch a worker for `start.task_id`; fails if the task already has one
    pub async fn spawn(&self, start: StartMessage) -> Result<ProcessRecord> {
        let task_id = start.task_id;
        let mut tracked = self.tracked.lock().await;
        if let Some(existing) = tracked.get(&task_id) {
            anyhow::bail!("Task {} already has worker {}", task_id, existing.record.pid);
        }

        let handle = self.launcher.launch(start).await?;
        let now = Utc::now();
        let record = ProcessRecord {
            task_id,
            pid: handle.pid,
            run_id: Uuid::new_v4(),
            started_at: now,
            last_seen: now,
        };

        let (exited_tx, exited) = watch::channel(false);
        tracked.insert(
            task_id,
            Tracked {
                record: record.clone(),
                control: handle.control,
                exited,
            },
        );
        drop(tracked);

        info!("Worker {} started for task {} (run {})", record.pid, task_id, record.run_id);

        tokio::spawn(relay(
            record.clone(),
            handle.messages,
            handle.exit,
            self.tracked.clone(),
            self.events.clone(),
            exited_tx,
        ));

        Ok(record)
    }

    /// Deliver a control message; false when the task has no worker
    pub async fn send_control(&self, task_id: TaskId, message: SupervisorMessage) -> bool {
        let tracked = self.tracked.lock().await;
        match tracked.get(&task_id) {
            Some(entry) => entry.control.send(message).is_ok(),
            None => false,
        }
    }

    /// Stop a task's worker: ask first, then SIGTERM after `grace`, then SIGKILL.
    ///
    /// The record is released before anything is signalled, so the exit
    /// that follows is reported as `released`. A worker that already exited
    /// is left to its exit event.
    pub async fn terminate(&self, task_id: TaskId, grace: Duration) -> Result<Option<ProcessRecord>> {
        let entry = {
            let mut tracked = self.tracked.lock().await;
            match tracked.get(&task_id).map(Tracked::has_exited) {
                Some(false) => tracked.remove(&task_id),
                _ => None,
            }
        };
        let Some(entry) = entry else {
            return Ok(None);
        };
        let Tracked {
            record,
            control,
            mut exited,
        } = entry;

        let _ = control.send(SupervisorMessage::Stop);
        drop(control);

        if wait_exited(&mut exited, grace).await {
            debug!("Worker {} of task {} stopped gracefully", record.pid, task_id);
            return Ok(Some(record));
        }

        warn!(
            "Worker {} of task {} ignored stop for {:?}; sending SIGTERM",
            record.pid, task_id, grace
        );
        self.launcher.signal(record.pid, TerminationSignal::Terminate).await?;
        if wait_exited(&mut exited, TERMINATE_TIMEOUT).await {
            return Ok(Some(record));
        }

        warn!("Worker {} of task {} survived SIGTERM; killing it", record.pid, task_id);
        self.launcher.signal(record.pid, TerminationSignal::Kill).await?;
        if !wait_exited(&mut exited, KILL_REAP_TIMEOUT).await {
            warn!("Worker {} of task {} did not exit after SIGKILL", record.pid, task_id);
        }
        Ok(Some(record))
    }

    /// Kill a tracked worker by pid; `None` when no tracked worker has it
    pub async fn kill_by_pid(&self, pid: u32) -> Result<Option<ProcessRecord>> {
        let entry = {
            let mut tracked = self.tracked.lock().await;
            let task_id = tracked
                .values()
                .find(|entry| entry.record.pid == pid && !entry.has_exited())
                .map(|entry| entry.record.task_id);
            task_id.and_then(|task_id| tracked.remove(&task_id))
        };
        let Some(mut entry) = entry else {
            return Ok(None);
        };

        self.launcher.signal(pid, TerminationSignal::Kill).await?;
        if !wait_exited(&mut entry.exited, KILL_REAP_TIMEOUT).await {
            warn!("Worker {} did not exit after SIGKILL", pid);
        }
        info!("Killed worker {} of task {}", pid, entry.record.task_id);
        Ok(Some(entry.record))
    }

    /// Kill a worker this manager does not track (left by another supervisor).
    ///
    /// `Ok(false)` when nothing lives at `pid`; an error when something does
    /// but it cannot be confirmed to be a worker.
    pub async fn kill_untracked(&self, pid: u32) -> Result<bool> {
        if !self.launcher.is_alive(pid).await {
            return Ok(false);
        }
        if !self.launcher.is_worker(pid).await {
            anyhow::bail!("process {} is not a worker; leaving it alone", pid);
        }
        let killed = self.launcher.kill_detached(pid).await?;
        if killed {
            info!("Killed untracked worker {}", pid);
        }
        Ok(killed)
    }

    /// Drop the record of a finished run; false when `run_id` is not current
    pub async fn release(&self, task_id: TaskId, run_id: Uuid) -> bool {
        let mut tracked = self.tracked.lock().await;
        if tracked.get(&task_id).map(|entry| entry.record.run_id) == Some(run_id) {
            tracked.remove(&task_id);
            true
        } else {
            false
        }
    }

    pub async fn is_current(&self, task_id: TaskId, run_id: Uuid) -> bool {
        self.tracked
            .lock()
            .await
            .get(&task_id)
            .map_or(false, |entry| entry.record.run_id == run_id)
    }

    pub async fn record(&self, task_id: TaskId) -> Option<ProcessRecord> {
        self.tracked.lock().await.get(&task_id).map(|entry| entry.record.clone())
    }

    /// Records of workers still running
    pub async fn records(&self) -> Vec<ProcessRecord> {
        let mut records: Vec<_> = self
            .tracked
            .lock()
            .await
            .values()
            .filter(|entry| !entry.has_exited())
            .map(|entry| entry.record.clone())
            .collect();
        records.sort_by_key(|record| record.task_id);
        records
    }

    /// Nothing tracked, including exited runs whose exit was not yet released
    pub async fn is_empty(&self) -> bool {
        self.tracked.lock().await.is_empty()
    }

    /// Whether `pid` is a running worker, ours or one left by another supervisor
    pub async fn is_live_worker(&self, pid: u32) -> bool {
        let tracked_exited = self
            .tracked
            .lock()
            .await
            .values()
            .find(|entry| entry.record.pid == pid)
            .map(Tracked::has_exited);
        match tracked_exited {
            Some(exited) => !exited,
            None => self.launcher.is_alive(pid).await && self.launcher.is_worker(pid).await,
        }
    }

    /// Whether a process with this pid is alive, tracked or not
    pub async fn is_alive(&self, pid: u32) -> bool {
        let tracked_exited = self
            .tracked
            .lock()
            .await
            .values()
            .find(|entry| entry.record.pid == pid)
            .map(Tracked::has_exited);
        match tracked_exited {
            Some(exited) => !exited,
            None => self.launcher.is_alive(pid).await,
        }
    }

    /// Running workers that went silent for longer than `timeout` or whose process is gone
    pub async fn unhealthy(&self, timeout: Duration) -> Vec<ProcessRecord> {
        let records = self.records().await;
        let deadline = Utc::now() - chrono::Duration::from_std(timeout).unwrap_or_else(|_| chrono::Duration::zero());

        let mut unhealthy = Vec::new();
        for record in records {
            if record.last_seen < deadline || !self.launcher.is_alive(record.pid).await {
                unhealthy.push(record);
            }
        }
        unhealthy
    }
}

/// Wait until the relay has seen the worker exit; false on timeout
async fn wait_exited(exited: &mut watch::Receiver<bool>, timeout: Duration) -> bool {
    // A dropped sender means the relay is gone, which only happens after exit
    let exit = async { exited.wait_for(|exited| *exited).await.map(|_| ()) };
    tokio::time::timeout(timeout, exit).await.is_ok()
}

/// Forward one worker's messages in order, then its exit
async fn relay(
    record: ProcessRecord,
    mut messages: mpsc::UnboundedReceiver<WorkerMessage>,
    mut exit: oneshot::Receiver<ExitReport>,
    tracked: Arc<Mutex<HashMap<TaskId, Tracked>>>,
    events: mpsc::UnboundedSender<SupervisorEvent>,
    exited_tx: watch::Sender<bool>,
) {
    let ProcessRecord {
        task_id, pid, run_id, ..
    } = record;

    let forward = |message: WorkerMessage| {
        let _ = events.send(SupervisorEvent::Message {
            task_id,
            run_id,
            pid,
            message,
        });
    };

    let report = loop {
        tokio::select! {
            biased;
            message = messages.recv() => match message {
                Some(message) => {
                    touch(&tracked, task_id, run_id).await;
                    forward(message);
                }
                None => break (&mut exit).await.unwrap_or_else(|_| ExitReport::abnormal("exit status lost")),
            },
            report = &mut exit => {
                while let Ok(message) = messages.try_recv() {
                    forward(message);
                }
                break report.unwrap_or_else(|_| ExitReport::abnormal("exit status lost"));
            }
        }
    };

    // The record outlives the process until the exit event is handled, so
    // messages still queued for this run are not mistaken for a stale run
    let released = !tracked
        .lock()
        .await
        .get(&task_id)
        .map_or(false, |entry| entry.record.run_id == run_id);

    let _ = exited_tx.send(true);
    debug!("Worker {} of task {} exited: {}", pid, task_id, report.description);
    let _ = events.send(SupervisorEvent::Exited {
        task_id,
        run_id,
        pid,
        report,
        released,
    });
}

async fn touch(tracked: &Mutex<HashMap<TaskId, Tracked>>, task_id: TaskId, run_id: Uuid) {
    if let Some(entry) = tracked.lock().await.get_mut(&task_id) {
        if entry.record.run_id == run_id {
            entry.record.last_seen = Utc::now();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worker::testing::{scripted_env, start_message, task_config, Script, ScriptedAdapter};

    fn manager(script: Script) -> (ProcessManager, mpsc::UnboundedReceiver<SupervisorEvent>) {
        let launcher = InProcessLauncher::new(scripted_env(ScriptedAdapter::new(script)));
        ProcessManager::new(Arc::new(launcher))
    }

    async fn until_exit(events: &mut mpsc::UnboundedReceiver<SupervisorEvent>) -> Vec<SupervisorEvent> {
        let mut seen = Vec::new();
        loop {
            let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
                .await
                .unwrap()
                .unwrap();
            let done = matches!(event, SupervisorEvent::Exited { .. });
            seen.push(event);
            if done {
                return seen;
            }
        }
    }

    #[tokio::test]
    async fn test_messages_are_relayed_before_exit() {
        let (manager, mut events) = manager(Script {
            items_per_page: 2,
            ..Default::default()
        });
        let record = manager.spawn(start_message(7, task_config(&["rust"], 3))).await.unwrap();
        assert_eq!(manager.record(TaskId(7)).await.unwrap().pid, record.pid);

        let seen = until_exit(&mut events).await;
        let kinds: Vec<_> = seen
            .iter()
            .map(|event| match event {
                SupervisorEvent::Message { message, .. } => message.kind(),
                SupervisorEvent::Exited { .. } => "exit",
            })
            .collect();
        assert_eq!(kinds, vec!["progress", "progress", "progress", "completed", "exit"]);

        match seen.last().unwrap() {
            SupervisorEvent::Exited { released, report, .. } => {
                assert!(!released);
                assert!(report.success);
            }
            _ => unreachable!(),
        }

        // Exited but not yet released: no longer running, still tracked
        assert!(manager.records().await.is_empty());
        assert!(!manager.is_empty().await);
        assert!(manager.is_current(TaskId(7), record.run_id).await);
        assert!(manager.terminate(TaskId(7), Duration::from_millis(10)).await.unwrap().is_none());

        assert!(manager.release(TaskId(7), record.run_id).await);
        assert!(manager.record(TaskId(7)).await.is_none());
        assert!(manager.is_empty().await);
    }

    #[tokio::test]
    async fn test_second_spawn_for_same_task_is_refused() {
        let (manager, _events) = manager(Script {
            page_delay: Duration::from_secs(30),
            ..Default::default()
        });
        manager.spawn(start_message(1, task_config(&["rust"], 1))).await.unwrap();
        assert!(manager.spawn(start_message(1, task_config(&["rust"], 1))).await.is_err());
        manager.terminate(TaskId(1), Duration::from_millis(50)).await.unwrap();
    }

    /// In-process launcher that remembers the signals it was asked to send
    struct SignalLog {
        inner: InProcessLauncher,
        sent: std::sync::Mutex<Vec<TerminationSignal>>,
    }

    #[async_trait::async_trait]
    impl WorkerLauncher for SignalLog {
        async fn launch(&self, start: StartMessage) -> Result<WorkerHandle> {
            self.inner.launch(start).await
        }

        async fn is_alive(&self, pid: u32) -> bool {
            self.inner.is_alive(pid).await
        }

        async fn is_worker(&self, pid: u32) -> bool {
            self.inner.is_worker(pid).await
        }

        async fn signal(&self, pid: u32, signal: TerminationSignal) -> Result<bool> {
            self.sent.lock().unwrap().push(signal);
            self.inner.signal(pid, signal).await
        }

        async fn kill_detached(&self, pid: u32) -> Result<bool> {
            self.inner.kill_detached(pid).await
        }
    }

    #[tokio::test]
    async fn test_terminate_escalates_past_an_ignored_stop() {
        let launcher = Arc::new(SignalLog {
            inner: InProcessLauncher::new(scripted_env(ScriptedAdapter::new(Script {
                page_delay: Duration::from_secs(30),
                ..Default::default()
            }))),
            sent: Default::default(),
        });
        let (manager, mut events) = ProcessManager::new(launcher.clone());
        let record = manager.spawn(start_message(1, task_config(&["rust"], 2))).await.unwrap();

        let stopped = manager.terminate(TaskId(1), Duration::from_millis(100)).await.unwrap();
        assert_eq!(stopped.unwrap().pid, record.pid);
        assert!(!manager.is_alive(record.pid).await);
        // The aborted in-process worker is gone after SIGTERM already
        assert_eq!(*launcher.sent.lock().unwrap(), vec![TerminationSignal::Terminate]);
        assert!(manager.terminate(TaskId(1), Duration::from_millis(100)).await.unwrap().is_none());

        let seen = until_exit(&mut events).await;
        assert!(matches!(seen.last(), Some(SupervisorEvent::Exited { released: true, .. })));
    }

    #[tokio::test]
    async fn test_kill_by_pid_only_touches_tracked_workers() {
        let (manager, _events) = manager(Script {
            page_delay: Duration::from_secs(30),
            ..Default::default()
        });
        let record = manager.spawn(start_message(3, task_config(&["rust"], 2))).await.unwrap();

        assert!(manager.kill_by_pid(record.pid + 1000).await.unwrap().is_none());
        let killed = manager.kill_by_pid(record.pid).await.unwrap().unwrap();
        assert_eq!(killed.task_id, TaskId(3));
        assert!(manager.records().await.is_empty());
    }

    #[tokio::test]
    async fn test_silent_worker_is_unhealthy() {
        let (manager, _events) = manager(Script {
            page_delay: Duration::from_secs(30),
            ..Default::default()
        });
        manager.spawn(start_message(1, task_config(&["rust"], 1))).await.unwrap();

        assert!(manager.unhealthy(Duration::from_secs(60)).await.is_empty());
        tokio::time::sleep(Duration::from_millis(30)).await;
        let stale = manager.unhealthy(Duration::from_millis(10)).await;
        assert_eq!(stale.len(), 1);

        manager.terminate(TaskId(1), Duration::from_millis(10)).await.unwrap();
    }
}
