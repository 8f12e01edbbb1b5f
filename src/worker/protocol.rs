use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::adapters::TargetDescriptor;
use crate::storage::credentials::Credentials;
use crate::tasks::task::{ProgressSnapshot, ResultRecord, TaskConfig, TaskId};

/// Everything a worker needs to run one task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StartMessage {
    pub task_id: TaskId,
    pub config: TaskConfig,
    pub target: TargetDescriptor,
    #[serde(default)]
    pub credentials: Option<Credentials>,
    pub heartbeat_interval_ms: u64,
}

/// Supervisor -> worker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SupervisorMessage {
    Start(StartMessage),
    Pause,
    Resume,
    Stop,
}

/// Control requests a worker acknowledges
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlCommand {
    Pause,
    Resume,
    Stop,
}

/// Worker -> supervisor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerMessage {
    Progress(ProgressSnapshot),
    Completed {
        task_id: TaskId,
        results: Vec<ResultRecord>,
    },
    Error {
        task_id: TaskId,
        message: String,
    },
    Ack {
        task_id: TaskId,
        command: ControlCommand,
    },
    /// Page-level problem worth keeping in the run log
    Log {
        task_id: TaskId,
        message: String,
    },
    Heartbeat {
        task_id: TaskId,
    },
}

impl WorkerMessage {
    /// Completed and Error end a run; nothing follows them
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed { .. } | Self::Error { .. })
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Progress(_) => "progress",
            Self::Completed { .. } => "completed",
            Self::Error { .. } => "error",
            Self::Ack { .. } => "ack",
            Self::Log { .. } => "log",
            Self::Heartbeat { .. } => "heartbeat",
        }
    }
}

/// Run state driven by control messages inside a worker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunSignal {
    Running,
    Paused,
    Stopped,
}

/// Serialize a message as one line (newline included)
pub fn encode_line<T: Serialize>(message: &T) -> Result<String> {
    let mut line = serde_json::to_string(message).context("Failed to encode message")?;
    line.push('\n');
    Ok(line)
}

pub fn decode_line<T: DeserializeOwned>(line: &str) -> Result<T> {
    serde_json::from_str(line.trim_end()).context(format!("Failed to decode message: {}", line.trim_end()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_messages_are_tagged_by_type() {
        let line = encode_line(&SupervisorMessage::Pause).unwrap();
        assert_eq!(line, "{\"type\":\"pause\"}\n");

        let ack: WorkerMessage = decode_line(r#"{"type":"ack","task_id":3,"command":"stop"}"#).unwrap();
        assert_eq!(
            ack,
            WorkerMessage::Ack {
                task_id: TaskId(3),
                command: ControlCommand::Stop
            }
        );
    }

    #[test]
    fn test_progress_is_flattened_into_the_message() {
        let message = WorkerMessage::Progress(ProgressSnapshot {
            task_id: TaskId(1),
            keyword: "rust".into(),
            current_page: 2,
            total_pages: 4,
            results_count: 10,
            percentage: 50,
            eta_seconds: None,
        });
        let value: serde_json::Value = serde_json::from_str(&encode_line(&message).unwrap()).unwrap();
        assert_eq!(value["type"], json!("progress"));
        assert_eq!(value["percentage"], json!(50));
        assert!(!message.is_terminal());
    }

    #[test]
    fn test_garbage_is_rejected() {
        assert!(decode_line::<WorkerMessage>("not json").is_err());
        assert!(decode_line::<SupervisorMessage>(r#"{"type":"reboot"}"#).is_err());
    }
}
