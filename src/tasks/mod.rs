pub mod controller;
pub mod task;

// Re-export common types
pub use controller::{
    BulkOp, BulkOutcome, ControllerError, ControllerSettings, KillOutcome, ProcessStatus, SessionRecovery,
    TaskController, TaskEvent,
};
pub use task::{ProgressSnapshot, ResultRecord, Task, TaskConfig, TaskId, TaskStatus};
