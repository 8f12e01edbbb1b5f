use anyhow::Result;
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use tokio::sync::Mutex;

use crate::storage::{Pagination, ResultPage, TaskFilter, TaskStore};
use crate::tasks::task::{ResultRecord, Task, TaskConfig, TaskId};

/// Task store kept in process memory
#[derive(Default)]
pub struct MemoryTaskStore {
    state: Mutex<MemoryState>,
}

#[derive(Default)]
struct MemoryState {
    next_id: u64,
    tasks: BTreeMap<TaskId, Task>,
    results: HashMap<TaskId, Vec<ResultRecord>>,
}

impl MemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TaskStore for MemoryTaskStore {
    async fn create_task(&self, config: TaskConfig) -> Result<Task> {
        let mut state = self.state.lock().await;
        state.next_id += 1;
        let task = Task::new(TaskId(state.next_id), config);
        state.tasks.insert(task.id, task.clone());
        Ok(task)
    }

    async fn get_task(&self, id: TaskId) -> Result<Option<Task>> {
        Ok(self.state.lock().await.tasks.get(&id).cloned())
    }

    async fn update_task(&self, task: &Task) -> Result<()> {
        let mut state = self.state.lock().await;
        match state.tasks.get_mut(&task.id) {
            Some(stored) => {
                *stored = task.clone();
                Ok(())
            }
            None => anyhow::bail!("Task not found: {}", task.id),
        }
    }

    async fn delete_task(&self, id: TaskId) -> Result<bool> {
        let mut state = self.state.lock().await;
        state.results.remove(&id);
        Ok(state.tasks.remove(&id).is_some())
    }

    async fn list_tasks(&self, filter: &TaskFilter) -> Result<Vec<Task>> {
        let state = self.state.lock().await;
        let matching = state
            .tasks
            .values()
            .filter(|task| filter.matches(task))
            .cloned()
            .collect();
        Ok(filter.window(matching))
    }

    async fn append_results(&self, id: TaskId, results: &[ResultRecord]) -> Result<()> {
        let mut state = self.state.lock().await;
        if !state.tasks.contains_key(&id) {
            anyhow::bail!("Task not found: {}", id);
        }
        state.results.entry(id).or_default().extend_from_slice(results);
        Ok(())
    }

    async fn get_results(&self, id: TaskId, pagination: Pagination) -> Result<ResultPage> {
        let state = self.state.lock().await;
        let all = state.results.get(&id).map(Vec::as_slice).unwrap_or(&[]);
        let items = all
            .iter()
            .skip(pagination.offset())
            .take(pagination.per_page as usize)
            .cloned()
            .collect();

        Ok(ResultPage {
            items,
            total: all.len() as u64,
            page: pagination.page,
            per_page: pagination.per_page,
        })
    }

    async fn delete_results(&self, id: TaskId) -> Result<()> {
        self.state.lock().await.results.remove(&id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tasks::task::TaskStatus;
    use chrono::Utc;
    use serde_json::json;

    fn record(id: TaskId, n: u32) -> ResultRecord {
        ResultRecord {
            task_id: id,
            keyword: "k".into(),
            page: n,
            data: json!({ "n": n }),
            extracted_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_ids_are_sequential_and_listing_is_ordered() {
        let store = MemoryTaskStore::new();
        let a = store.create_task(TaskConfig::new("a", "generic", vec!["x".into()])).await.unwrap();
        let b = store.create_task(TaskConfig::new("b", "generic", vec!["x".into()])).await.unwrap();
        assert_eq!(a.id, TaskId(1));
        assert_eq!(b.id, TaskId(2));
        assert_eq!(a.status, TaskStatus::Pending);

        let listed = store.list_tasks(&TaskFilter::default()).await.unwrap();
        assert_eq!(listed.iter().map(|t| t.id).collect::<Vec<_>>(), vec![a.id, b.id]);
    }

    #[tokio::test]
    async fn test_delete_cascades_results() {
        let store = MemoryTaskStore::new();
        let task = store.create_task(TaskConfig::new("a", "generic", vec!["x".into()])).await.unwrap();
        store
            .append_results(task.id, &[record(task.id, 1), record(task.id, 2), record(task.id, 3)])
            .await
            .unwrap();

        let page = store.get_results(task.id, Pagination::new(2, 2)).await.unwrap();
        assert_eq!(page.total, 3);
        assert_eq!(page.items.len(), 1);
        assert_eq!(page.items[0].page, 3);

        assert!(store.delete_task(task.id).await.unwrap());
        assert_eq!(store.get_results(task.id, Pagination::default()).await.unwrap().total, 0);
        assert!(!store.delete_task(task.id).await.unwrap());
    }
}
