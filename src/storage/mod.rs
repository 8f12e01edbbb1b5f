pub mod credentials;
pub mod export;
pub mod file;
pub mod memory;
pub mod postgres;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::cli::config::StorageSettings;
use crate::tasks::task::{ResultRecord, Task, TaskConfig, TaskId, TaskStatus};

// Re-export common types
pub use credentials::{ConfigCredentialStore, CredentialStore, Credentials};
pub use export::ExportFormat;
pub use file::FileTaskStore;
pub use memory::MemoryTaskStore;
pub use postgres::PostgresTaskStore;

/// Filter for task listings
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskFilter {
    pub status: Option<TaskStatus>,
    pub target: Option<String>,
    /// Case-insensitive substring of the task name
    pub name_contains: Option<String>,
    pub limit: Option<usize>,
    #[serde(default)]
    pub offset: usize,
}

impl TaskFilter {
    pub fn with_status(status: TaskStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn matches(&self, task: &Task) -> bool {
        if let Some(status) = self.status {
            if task.status != status {
                return false;
            }
        }
        if let Some(target) = &self.target {
            if &task.config.target != target {
                return false;
            }
        }
        if let Some(needle) = &self.name_contains {
            if !task.config.name.to_lowercase().contains(&needle.to_lowercase()) {
                return false;
            }
        }
        true
    }

    /// Apply offset and limit to an already filtered, ordered listing
    pub fn window<T>(&self, items: Vec<T>) -> Vec<T> {
        let iter = items.into_iter().skip(self.offset);
        match self.limit {
            Some(limit) => iter.take(limit).collect(),
            None => iter.collect(),
        }
    }
}

/// 1-based result pagination
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pagination {
    pub page: u32,
    pub per_page: u32,
}

impl Default for Pagination {
    fn default() -> Self {
        Self { page: 1, per_page: 50 }
    }
}

impl Pagination {
    pub fn new(page: u32, per_page: u32) -> Self {
        Self {
            page: page.max(1),
            per_page: per_page.max(1),
        }
    }

    pub fn offset(&self) -> usize {
        (self.page.max(1) as usize - 1) * self.per_page as usize
    }
}

/// One page of a task's results
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultPage {
    pub items: Vec<ResultRecord>,
    pub total: u64,
    pub page: u32,
    pub per_page: u32,
}

/// Durable record of tasks and their results
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Persist a new task with status pending
    async fn create_task(&self, config: TaskConfig) -> Result<Task>;

    async fn get_task(&self, id: TaskId) -> Result<Option<Task>>;

    /// Replace the stored task with `task`
    async fn update_task(&self, task: &Task) -> Result<()>;

    /// Remove a task and all of its results; `false` if it did not exist
    async fn delete_task(&self, id: TaskId) -> Result<bool>;

    /// List tasks matching `filter`, ordered by id
    async fn list_tasks(&self, filter: &TaskFilter) -> Result<Vec<Task>>;

    async fn append_results(&self, id: TaskId, results: &[ResultRecord]) -> Result<()>;

    async fn get_results(&self, id: TaskId, pagination: Pagination) -> Result<ResultPage>;

    async fn delete_results(&self, id: TaskId) -> Result<()>;
}

/// Factory for creating a TaskStore implementation
pub struct TaskStoreFactory;

impl TaskStoreFactory {
    /// Create a new TaskStore instance based on the settings
    pub async fn create(settings: &StorageSettings) -> Result<Arc<dyn TaskStore>> {
        match settings.backend.as_str() {
            "memory" => Ok(Arc::new(MemoryTaskStore::new())),
            "filesystem" => {
                let store = FileTaskStore::open(&settings.path).await?;
                Ok(Arc::new(store))
            }
            "postgresql" => {
                let store = PostgresTaskStore::new(settings).await?;
                Ok(Arc::new(store))
            }
            _ => {
                anyhow::bail!("Unsupported task store backend: {}", settings.backend);
            }
        }
    }
}
