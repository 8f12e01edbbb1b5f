use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::browser::proxy::ProxyConfig;

/// Identifier of a persisted task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub u64);

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl FromStr for TaskId {
    type Err = std::num::ParseIntError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        value.trim().parse().map(TaskId)
    }
}

/// Lifecycle status of a task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Paused,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    /// Whether a worker process may be bound to a task in this status
    pub fn is_active(self) -> bool {
        matches!(self, Self::InProgress | Self::Paused)
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Check a status change against the task state machine.
    ///
    /// `Paused -> Failed` is only ever taken by supervision (a worker crash
    /// or an orphan found while paused), never by a control call.
    pub fn can_transition_to(self, next: TaskStatus) -> bool {
        use TaskStatus::*;

        matches!(
            (self, next),
            (Pending, InProgress)
                | (InProgress, Paused)
                | (InProgress, Pending)
                | (InProgress, Completed)
                | (InProgress, Failed)
                | (Paused, InProgress)
                | (Paused, Pending)
                | (Paused, Failed)
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_lowercase().replace('-', "_").as_str() {
            "pending" => Ok(Self::Pending),
            "in_progress" | "running" => Ok(Self::InProgress),
            "paused" => Ok(Self::Paused),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown task status '{}'", other)),
        }
    }
}

/// User supplied configuration of a scrape task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskConfig {
    /// Human readable task name
    pub name: String,

    /// Name of the target descriptor (adapter + configuration) to use
    pub target: String,

    /// Keywords to search for, processed in order
    pub keywords: Vec<String>,

    /// Optional location passed to the search
    #[serde(default)]
    pub location: Option<String>,

    /// Number of result pages fetched per keyword
    pub max_pages: u32,

    /// Upper bound of page fetches in flight inside one worker
    #[serde(default = "default_concurrency")]
    pub concurrency: u32,

    /// Delay between two page requests of the same keyword, in milliseconds
    #[serde(default)]
    pub delay_between_requests: i64,

    /// Credential binding used to log into the target
    #[serde(default)]
    pub credential_id: Option<String>,

    /// Proxy the worker's session goes through
    #[serde(default)]
    pub proxy: Option<ProxyConfig>,

    /// Run browser sessions without a visible window
    #[serde(default = "default_headless")]
    pub headless: bool,

    /// Earliest time the task should be picked up by `run --due`
    #[serde(default)]
    pub scheduled_at: Option<DateTime<Utc>>,
}

fn default_concurrency() -> u32 {
    1
}

fn default_headless() -> bool {
    true
}

impl TaskConfig {
    pub fn new(name: impl Into<String>, target: impl Into<String>, keywords: Vec<String>) -> Self {
        Self {
            name: name.into(),
            target: target.into(),
            keywords,
            location: None,
            max_pages: 1,
            concurrency: 1,
            delay_between_requests: 0,
            credential_id: None,
            proxy: None,
            headless: true,
            scheduled_at: None,
        }
    }

    /// Total number of pages a full run visits
    pub fn total_pages(&self) -> u32 {
        (self.keywords.len() as u32).saturating_mul(self.max_pages)
    }
}

/// A persisted task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,

    #[serde(flatten)]
    pub config: TaskConfig,

    pub status: TaskStatus,

    /// Pid of the bound worker while the task is in progress or paused
    #[serde(default)]
    pub pid: Option<u32>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,

    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,

    /// Append-only error history
    #[serde(default)]
    pub error_log: String,

    /// Append-only run history
    #[serde(default)]
    pub run_log: String,
}

impl Task {
    pub fn new(id: TaskId, config: TaskConfig) -> Self {
        let now = Utc::now();
        Self {
            id,
            config,
            status: TaskStatus::Pending,
            pid: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
            error_log: String::new(),
            run_log: String::new(),
        }
    }

    pub fn append_error(&mut self, message: &str) {
        append_line(&mut self.error_log, message);
        self.updated_at = Utc::now();
    }

    pub fn append_run_log(&mut self, message: &str) {
        append_line(&mut self.run_log, message);
        self.updated_at = Utc::now();
    }

    /// Move to `status`, keeping `pid` and `completed_at` consistent with it
    pub fn set_status(&mut self, status: TaskStatus) {
        self.status = status;
        if !status.is_active() {
            self.pid = None;
        }
        if status.is_terminal() {
            self.completed_at = Some(Utc::now());
        }
        self.updated_at = Utc::now();
    }
}

fn append_line(log: &mut String, message: &str) {
    log.push_str(&format!("[{}] {}\n", Utc::now().to_rfc3339(), message));
}

/// One extracted item, owned by the task store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultRecord {
    pub task_id: TaskId,
    pub keyword: String,
    pub page: u32,
    pub data: Value,
    pub extracted_at: DateTime<Utc>,
}

/// Transient progress report of a running task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressSnapshot {
    pub task_id: TaskId,
    pub keyword: String,
    pub current_page: u32,
    pub total_pages: u32,
    pub results_count: u64,
    pub percentage: u8,
    #[serde(default)]
    pub eta_seconds: Option<u64>,
}

impl ProgressSnapshot {
    /// Percentage reported while a run is still executing; 100 is reserved for completion
    pub fn running_percentage(done: u32, total: u32) -> u8 {
        if total == 0 {
            return 0;
        }
        let pct = (u64::from(done) * 100) / u64::from(total);
        pct.min(99) as u8
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn permitted_transitions() {
        use TaskStatus::*;

        assert!(Pending.can_transition_to(InProgress));
        assert!(InProgress.can_transition_to(Paused));
        assert!(InProgress.can_transition_to(Pending));
        assert!(InProgress.can_transition_to(Completed));
        assert!(Paused.can_transition_to(InProgress));
        assert!(Paused.can_transition_to(Pending));

        assert!(!Pending.can_transition_to(Paused));
        assert!(!Pending.can_transition_to(Completed));
        assert!(!Completed.can_transition_to(InProgress));
        assert!(!Failed.can_transition_to(Pending));
        assert!(!Paused.can_transition_to(Completed));
    }

    #[test]
    fn status_parsing_accepts_aliases() {
        assert_eq!("in-progress".parse::<TaskStatus>(), Ok(TaskStatus::InProgress));
        assert_eq!("Running".parse::<TaskStatus>(), Ok(TaskStatus::InProgress));
        assert!("done".parse::<TaskStatus>().is_err());
    }

    #[test]
    fn leaving_active_status_clears_pid() {
        let mut task = Task::new(TaskId(1), TaskConfig::new("t", "generic", vec!["a".into()]));
        task.set_status(TaskStatus::InProgress);
        task.pid = Some(4242);

        task.set_status(TaskStatus::Paused);
        assert_eq!(task.pid, Some(4242));

        task.set_status(TaskStatus::Failed);
        assert_eq!(task.pid, None);
        assert!(task.completed_at.is_some());
    }

    #[test]
    fn running_percentage_never_reaches_hundred() {
        assert_eq!(ProgressSnapshot::running_percentage(0, 4), 0);
        assert_eq!(ProgressSnapshot::running_percentage(2, 4), 50);
        assert_eq!(ProgressSnapshot::running_percentage(4, 4), 99);
        assert_eq!(ProgressSnapshot::running_percentage(1, 0), 0);
    }

    #[test]
    fn task_round_trips_through_yaml_with_defaults() {
        let yaml = "name: jobs\ntarget: generic\nkeywords: [rust]\nmax_pages: 2\n";
        let config: TaskConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.concurrency, 1);
        assert!(config.headless);
        assert_eq!(config.total_pages(), 2);
    }
}
