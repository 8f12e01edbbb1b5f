use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::AbortHandle;
use tracing::debug;

use crate::process::launcher::{ExitReport, TerminationSignal, WorkerHandle, WorkerLauncher};
use crate::worker::{self, StartMessage, WorkerEnv};

/// Synthetic pids start far above any kernel pid_max
const FIRST_PID: u32 = 900_000_000;

/// Runs workers as tasks on the supervisor's runtime.
///
/// Same channels and exit reporting as OS workers; a kill aborts the task.
pub struct InProcessLauncher {
    env: WorkerEnv,
    next_pid: AtomicU32,
    workers: Arc<Mutex<HashMap<u32, AbortHandle>>>,
}

impl InProcessLauncher {
    pub fn new(env: WorkerEnv) -> Self {
        Self {
            env,
            next_pid: AtomicU32::new(FIRST_PID),
            workers: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

#[async_trait]
impl WorkerLauncher for InProcessLauncher {
    async fn launch(&self, start: StartMessage) -> Result<WorkerHandle> {
        let pid = self.next_pid.fetch_add(1, Ordering::SeqCst);
        let task_id = start.task_id;

        let (control, control_rx) = mpsc::unbounded_channel();
        let (outbox, messages) = mpsc::unbounded_channel();
        let (exit_tx, exit) = oneshot::channel();

        let mut workers = self.workers.lock().await;
        let run = tokio::spawn(worker::serve(start, self.env.clone(), control_rx, outbox));
        workers.insert(pid, run.abort_handle());
        drop(workers);

        let workers = self.workers.clone();
        tokio::spawn(async move {
            let report = match run.await {
                Ok(()) => ExitReport::exited(0),
                Err(e) if e.is_cancelled() => ExitReport::abnormal("killed"),
                Err(e) => ExitReport::abnormal(format!("worker panicked: {}", e)),
            };
            workers.lock().await.remove(&pid);
            let _ = exit_tx.send(report);
        });

        debug!("In-process worker {} launched for task {}", pid, task_id);

        Ok(WorkerHandle {
            pid,
            control,
            messages,
            exit,
        })
    }

    async fn is_alive(&self, pid: u32) -> bool {
        self.workers.lock().await.contains_key(&pid)
    }

    // Synthetic pids only ever name workers
    async fn is_worker(&self, pid: u32) -> bool {
        self.is_alive(pid).await
    }

    async fn signal(&self, pid: u32, _signal: TerminationSignal) -> Result<bool> {
        match self.workers.lock().await.get(&pid) {
            Some(handle) => {
                handle.abort();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn kill_detached(&self, pid: u32) -> Result<bool> {
        self.signal(pid, TerminationSignal::Kill).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worker::testing::{scripted_env, start_message, task_config, Script, ScriptedAdapter};
    use crate::worker::WorkerMessage;
    use std::time::Duration;

    #[tokio::test]
    async fn test_worker_runs_and_reports_exit() {
        let adapter = ScriptedAdapter::new(Script {
            items_per_page: 1,
            ..Default::default()
        });
        let launcher = InProcessLauncher::new(scripted_env(adapter));
        let mut handle = launcher.launch(start_message(1, task_config(&["rust"], 2))).await.unwrap();
        assert!(handle.pid >= FIRST_PID);

        let report = handle.exit.await.unwrap();
        assert!(report.success);

        let mut last = None;
        while let Ok(message) = handle.messages.try_recv() {
            last = Some(message);
        }
        assert!(matches!(last, Some(WorkerMessage::Completed { .. })));
        assert!(!launcher.is_alive(handle.pid).await);
    }

    #[tokio::test]
    async fn test_kill_aborts_the_worker() {
        let adapter = ScriptedAdapter::new(Script {
            items_per_page: 1,
            page_delay: Duration::from_secs(30),
            ..Default::default()
        });
        let launcher = InProcessLauncher::new(scripted_env(adapter));
        let handle = launcher.launch(start_message(1, task_config(&["rust"], 2))).await.unwrap();

        assert!(launcher.is_alive(handle.pid).await);
        assert!(launcher.signal(handle.pid, TerminationSignal::Kill).await.unwrap());

        let report = tokio::time::timeout(Duration::from_secs(5), handle.exit).await.unwrap().unwrap();
        assert!(!report.success);
        assert!(!launcher.signal(handle.pid, TerminationSignal::Kill).await.unwrap());
    }
}
