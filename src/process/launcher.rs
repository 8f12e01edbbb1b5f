use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};

use crate::worker::{StartMessage, SupervisorMessage, WorkerMessage};

/// How a worker ended, as seen by whoever spawned it
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExitReport {
    pub success: bool,
    pub code: Option<i32>,
    pub description: String,
}

impl ExitReport {
    pub fn exited(code: i32) -> Self {
        Self {
            success: code == 0,
            code: Some(code),
            description: format!("exited with code {}", code),
        }
    }

    pub fn abnormal(description: impl Into<String>) -> Self {
        Self {
            success: false,
            code: None,
            description: description.into(),
        }
    }
}

/// Signals the supervisor sends to a worker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationSignal {
    /// Ask the worker to exit (SIGTERM)
    Terminate,
    /// Force the worker down (SIGKILL)
    Kill,
}

/// A freshly launched worker and its channels
pub struct WorkerHandle {
    pub pid: u32,

    /// Control messages towards the worker; dropping it means stop
    pub control: mpsc::UnboundedSender<SupervisorMessage>,

    /// Messages from the worker, in send order
    pub messages: mpsc::UnboundedReceiver<WorkerMessage>,

    /// Resolves once the worker is gone
    pub exit: oneshot::Receiver<ExitReport>,
}

/// Starts workers and reaches them by pid
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait WorkerLauncher: Send + Sync {
    /// Start a worker and hand it its task
    async fn launch(&self, start: StartMessage) -> Result<WorkerHandle>;

    /// Whether a worker (or any process, for OS pids) with this pid exists
    async fn is_alive(&self, pid: u32) -> bool;

    /// Whether the live process at `pid` is one of our workers, started by
    /// this supervisor or an earlier one. False when it cannot be verified.
    async fn is_worker(&self, pid: u32) -> bool;

    /// Signal a worker this launcher started; `Ok(false)` when no such process exists
    async fn signal(&self, pid: u32, signal: TerminationSignal) -> Result<bool>;

    /// Kill a verified worker left behind by another supervisor, never its group
    async fn kill_detached(&self, pid: u32) -> Result<bool>;
}
