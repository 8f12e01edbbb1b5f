use anyhow::{Context, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::debug;

use crate::storage::{Pagination, ResultPage, TaskFilter, TaskStore};
use crate::tasks::task::{ResultRecord, Task, TaskConfig, TaskId};

/// Filesystem implementation of TaskStore.
///
/// Layout: `<root>/tasks/<id>.json` holds the task, `<root>/results/<id>.jsonl`
/// holds one result record per line.
pub struct FileTaskStore {
    root: PathBuf,

    /// Next task id; the lock also serialises writers
    next_id: Mutex<u64>,
}

impl FileTaskStore {
    /// Open (creating if needed) a store rooted at `root`
    pub async fn open(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        for dir in [root.join("tasks"), root.join("results")] {
            fs::create_dir_all(&dir)
                .await
                .context(format!("Failed to create directory: {}", dir.display()))?;
        }

        let mut max_id = 0;
        let mut entries = fs::read_dir(root.join("tasks"))
            .await
            .context("Failed to read tasks directory")?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().map_or(false, |ext| ext == "json") {
                if let Some(id) = path
                    .file_stem()
                    .and_then(|s| s.to_str())
                    .and_then(|s| s.parse::<u64>().ok())
                {
                    max_id = max_id.max(id);
                }
            }
        }

        debug!("Opened task store at {} (next id {})", root.display(), max_id + 1);

        Ok(Self {
            root,
            next_id: Mutex::new(max_id + 1),
        })
    }

    fn task_path(&self, id: TaskId) -> PathBuf {
        self.root.join("tasks").join(format!("{}.json", id.0))
    }

    fn results_path(&self, id: TaskId) -> PathBuf {
        self.root.join("results").join(format!("{}.jsonl", id.0))
    }

    async fn write_task(&self, task: &Task) -> Result<()> {
        let path = self.task_path(task.id);
        let tmp = path.with_extension("json.tmp");
        let contents = serde_json::to_vec_pretty(task).context("Failed to serialize task")?;

        fs::write(&tmp, contents)
            .await
            .context(format!("Failed to write task file: {}", tmp.display()))?;
        fs::rename(&tmp, &path)
            .await
            .context(format!("Failed to replace task file: {}", path.display()))?;
        Ok(())
    }

    async fn read_task(path: &Path) -> Result<Task> {
        let contents = fs::read(path)
            .await
            .context(format!("Failed to read task file: {}", path.display()))?;
        serde_json::from_slice(&contents).context(format!("Failed to parse task file: {}", path.display()))
    }

    async fn read_results(&self, id: TaskId) -> Result<Vec<ResultRecord>> {
        let path = self.results_path(id);
        if !fs::try_exists(&path).await.unwrap_or(false) {
            return Ok(Vec::new());
        }

        let contents = fs::read_to_string(&path)
            .await
            .context(format!("Failed to read results file: {}", path.display()))?;

        contents
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| serde_json::from_str(line).context("Failed to parse result record"))
            .collect()
    }
}

#[async_trait]
impl TaskStore for FileTaskStore {
    async fn create_task(&self, config: TaskConfig) -> Result<Task> {
        let mut next_id = self.next_id.lock().await;
        let task = Task::new(TaskId(*next_id), config);
        self.write_task(&task).await?;
        *next_id += 1;
        Ok(task)
    }

    async fn get_task(&self, id: TaskId) -> Result<Option<Task>> {
        let path = self.task_path(id);
        if !fs::try_exists(&path).await.unwrap_or(false) {
            return Ok(None);
        }
        Self::read_task(&path).await.map(Some)
    }

    async fn update_task(&self, task: &Task) -> Result<()> {
        let _guard = self.next_id.lock().await;
        if !fs::try_exists(self.task_path(task.id)).await.unwrap_or(false) {
            anyhow::bail!("Task not found: {}", task.id);
        }
        self.write_task(task).await
    }

    async fn delete_task(&self, id: TaskId) -> Result<bool> {
        let _guard = self.next_id.lock().await;
        let path = self.task_path(id);
        let existed = fs::try_exists(&path).await.unwrap_or(false);
        if existed {
            fs::remove_file(&path)
                .await
                .context(format!("Failed to delete task file: {}", path.display()))?;
        }

        let results = self.results_path(id);
        if fs::try_exists(&results).await.unwrap_or(false) {
            fs::remove_file(&results)
                .await
                .context(format!("Failed to delete results file: {}", results.display()))?;
        }

        Ok(existed)
    }

    async fn list_tasks(&self, filter: &TaskFilter) -> Result<Vec<Task>> {
        let mut tasks = Vec::new();
        let mut entries = fs::read_dir(self.root.join("tasks"))
            .await
            .context("Failed to read tasks directory")?;

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().map_or(false, |ext| ext == "json") {
                let task = Self::read_task(&path).await?;
                if filter.matches(&task) {
                    tasks.push(task);
                }
            }
        }

        tasks.sort_by_key(|task| task.id);
        Ok(filter.window(tasks))
    }

    async fn append_results(&self, id: TaskId, results: &[ResultRecord]) -> Result<()> {
        let _guard = self.next_id.lock().await;
        if !fs::try_exists(self.task_path(id)).await.unwrap_or(false) {
            anyhow::bail!("Task not found: {}", id);
        }

        let mut buffer = String::new();
        for record in results {
            buffer.push_str(&serde_json::to_string(record).context("Failed to serialize result")?);
            buffer.push('\n');
        }

        let path = self.results_path(id);
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .context(format!("Failed to open results file: {}", path.display()))?;
        file.write_all(buffer.as_bytes())
            .await
            .context("Failed to append results")?;
        file.flush().await?;

        debug!("Appended {} results for task {}", results.len(), id);
        Ok(())
    }

    async fn get_results(&self, id: TaskId, pagination: Pagination) -> Result<ResultPage> {
        let all = self.read_results(id).await?;
        let total = all.len() as u64;
        let items = all
            .into_iter()
            .skip(pagination.offset())
            .take(pagination.per_page as usize)
            .collect();

        Ok(ResultPage {
            items,
            total,
            page: pagination.page,
            per_page: pagination.per_page,
        })
    }

    async fn delete_results(&self, id: TaskId) -> Result<()> {
        let _guard = self.next_id.lock().await;
        let path = self.results_path(id);
        if fs::try_exists(&path).await.unwrap_or(false) {
            fs::remove_file(&path)
                .await
                .context(format!("Failed to delete results file: {}", path.display()))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tasks::task::TaskStatus;
    use chrono::Utc;
    use serde_json::json;

    #[tokio::test]
    async fn test_tasks_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();

        let id = {
            let store = FileTaskStore::open(dir.path()).await.unwrap();
            let mut task = store
                .create_task(TaskConfig::new("persisted", "generic", vec!["a".into()]))
                .await
                .unwrap();
            task.set_status(TaskStatus::InProgress);
            task.pid = Some(1234);
            store.update_task(&task).await.unwrap();
            task.id
        };

        let store = FileTaskStore::open(dir.path()).await.unwrap();
        let task = store.get_task(id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::InProgress);
        assert_eq!(task.pid, Some(1234));

        let next = store
            .create_task(TaskConfig::new("next", "generic", vec!["a".into()]))
            .await
            .unwrap();
        assert_eq!(next.id, TaskId(id.0 + 1));
    }

    #[tokio::test]
    async fn test_results_append_and_cascade() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileTaskStore::open(dir.path()).await.unwrap();
        let task = store
            .create_task(TaskConfig::new("r", "generic", vec!["a".into()]))
            .await
            .unwrap();

        let records: Vec<_> = (1..=3)
            .map(|page| ResultRecord {
                task_id: task.id,
                keyword: "a".into(),
                page,
                data: json!({ "title": format!("item {}", page) }),
                extracted_at: Utc::now(),
            })
            .collect();
        store.append_results(task.id, &records[..2]).await.unwrap();
        store.append_results(task.id, &records[2..]).await.unwrap();

        let page = store.get_results(task.id, Pagination::new(1, 10)).await.unwrap();
        assert_eq!(page.total, 3);
        assert_eq!(page.items, records);

        assert!(store.delete_task(task.id).await.unwrap());
        assert!(store.get_task(task.id).await.unwrap().is_none());
        assert_eq!(store.get_results(task.id, Pagination::default()).await.unwrap().total, 0);
    }

    #[tokio::test]
    async fn test_update_of_unknown_task_fails() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileTaskStore::open(dir.path()).await.unwrap();
        let ghost = Task::new(TaskId(99), TaskConfig::new("ghost", "generic", vec!["a".into()]));
        assert!(store.update_task(&ghost).await.is_err());
    }
}
