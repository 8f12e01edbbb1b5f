use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::postgres::PgPoolOptions;
use sqlx::types::Json;
use sqlx::{Pool, Postgres};
use tracing::debug;

use crate::cli::config::StorageSettings;
use crate::storage::{Pagination, ResultPage, TaskFilter, TaskStore};
use crate::tasks::task::{ResultRecord, Task, TaskConfig, TaskId};

/// PostgreSQL implementation of TaskStore
pub struct PostgresTaskStore {
    /// PostgreSQL connection pool
    pool: Pool<Postgres>,

    /// Schema name
    schema: String,

    /// Table prefix
    table_prefix: String,
}

impl PostgresTaskStore {
    /// Create a new PostgreSQL task store
    pub async fn new(settings: &StorageSettings) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(&settings.connection_string)
            .await
            .context("Failed to connect to PostgreSQL")?;

        let store = Self {
            pool,
            schema: settings.schema_name.clone(),
            table_prefix: settings.table_prefix.clone(),
        };

        store.ensure_schema().await?;

        debug!("Connected to PostgreSQL task store");

        Ok(store)
    }

    fn tasks_table(&self) -> String {
        format!("{}.{}_tasks", self.schema, self.table_prefix)
    }

    fn results_table(&self) -> String {
        format!("{}.{}_results", self.schema, self.table_prefix)
    }

    /// Ensure the schema and both tables exist
    async fn ensure_schema(&self) -> Result<()> {
        sqlx::query(&format!("CREATE SCHEMA IF NOT EXISTS {}", self.schema))
            .execute(&self.pool)
            .await
            .context(format!("Failed to create schema: {}", self.schema))?;

        sqlx::query(&format!(
            "CREATE TABLE IF NOT EXISTS {} (
                id BIGSERIAL PRIMARY KEY,
                name TEXT NOT NULL,
                target TEXT NOT NULL,
                status TEXT NOT NULL,
                task JSONB NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )",
            self.tasks_table()
        ))
        .execute(&self.pool)
        .await
        .context("Failed to create tasks table")?;

        sqlx::query(&format!(
            "CREATE TABLE IF NOT EXISTS {} (
                seq BIGSERIAL PRIMARY KEY,
                task_id BIGINT NOT NULL REFERENCES {}(id) ON DELETE CASCADE,
                record JSONB NOT NULL
            )",
            self.results_table(),
            self.tasks_table()
        ))
        .execute(&self.pool)
        .await
        .context("Failed to create results table")?;

        Ok(())
    }
}

#[async_trait]
impl TaskStore for PostgresTaskStore {
    async fn create_task(&self, config: TaskConfig) -> Result<Task> {
        let mut tx = self.pool.begin().await.context("Failed to begin transaction")?;

        let id: i64 = sqlx::query_scalar(&format!(
            "INSERT INTO {} (name, target, status, task) VALUES ($1, $2, 'pending', '{{}}'::jsonb) RETURNING id",
            self.tasks_table()
        ))
        .bind(&config.name)
        .bind(&config.target)
        .fetch_one(&mut *tx)
        .await
        .context("Failed to insert task")?;

        let task = Task::new(TaskId(id as u64), config);

        sqlx::query(&format!("UPDATE {} SET task = $1 WHERE id = $2", self.tasks_table()))
            .bind(Json(&task))
            .bind(id)
            .execute(&mut *tx)
            .await
            .context("Failed to store task document")?;

        tx.commit().await.context("Failed to commit task creation")?;
        Ok(task)
    }

    async fn get_task(&self, id: TaskId) -> Result<Option<Task>> {
        let row: Option<Json<Task>> =
            sqlx::query_scalar(&format!("SELECT task FROM {} WHERE id = $1", self.tasks_table()))
                .bind(id.0 as i64)
                .fetch_optional(&self.pool)
                .await
                .context("Failed to query task")?;

        Ok(row.map(|json| json.0))
    }

    async fn update_task(&self, task: &Task) -> Result<()> {
        let result = sqlx::query(&format!(
            "UPDATE {} SET name = $1, target = $2, status = $3, task = $4, updated_at = NOW() WHERE id = $5",
            self.tasks_table()
        ))
        .bind(&task.config.name)
        .bind(&task.config.target)
        .bind(task.status.as_str())
        .bind(Json(task))
        .bind(task.id.0 as i64)
        .execute(&self.pool)
        .await
        .context("Failed to update task")?;

        if result.rows_affected() == 0 {
            anyhow::bail!("Task not found: {}", task.id);
        }
        Ok(())
    }

    async fn delete_task(&self, id: TaskId) -> Result<bool> {
        // Results go with the task through ON DELETE CASCADE
        let result = sqlx::query(&format!("DELETE FROM {} WHERE id = $1", self.tasks_table()))
            .bind(id.0 as i64)
            .execute(&self.pool)
            .await
            .context("Failed to delete task")?;

        Ok(result.rows_affected() > 0)
    }

    async fn list_tasks(&self, filter: &TaskFilter) -> Result<Vec<Task>> {
        let rows: Vec<Json<Task>> = sqlx::query_scalar(&format!(
            "SELECT task FROM {}
             WHERE ($1::TEXT IS NULL OR status = $1)
               AND ($2::TEXT IS NULL OR target = $2)
               AND ($3::TEXT IS NULL OR name ILIKE '%' || $3 || '%')
             ORDER BY id
             LIMIT $4 OFFSET $5",
            self.tasks_table()
        ))
        .bind(filter.status.map(|s| s.as_str()))
        .bind(filter.target.as_deref())
        .bind(filter.name_contains.as_deref())
        .bind(filter.limit.map(|l| l as i64))
        .bind(filter.offset as i64)
        .fetch_all(&self.pool)
        .await
        .context("Failed to list tasks")?;

        Ok(rows.into_iter().map(|json| json.0).collect())
    }

    async fn append_results(&self, id: TaskId, results: &[ResultRecord]) -> Result<()> {
        let mut tx = self.pool.begin().await.context("Failed to begin transaction")?;
        let query = format!("INSERT INTO {} (task_id, record) VALUES ($1, $2)", self.results_table());

        for record in results {
            sqlx::query(&query)
                .bind(id.0 as i64)
                .bind(Json(record))
                .execute(&mut *tx)
                .await
                .context("Failed to insert result")?;
        }

        tx.commit().await.context("Failed to commit results")?;
        debug!("Stored {} results for task {}", results.len(), id);
        Ok(())
    }

    async fn get_results(&self, id: TaskId, pagination: Pagination) -> Result<ResultPage> {
        let total: i64 = sqlx::query_scalar(&format!(
            "SELECT COUNT(*) FROM {} WHERE task_id = $1",
            self.results_table()
        ))
        .bind(id.0 as i64)
        .fetch_one(&self.pool)
        .await
        .context("Failed to count results")?;

        let rows: Vec<Json<ResultRecord>> = sqlx::query_scalar(&format!(
            "SELECT record FROM {} WHERE task_id = $1 ORDER BY seq LIMIT $2 OFFSET $3",
            self.results_table()
        ))
        .bind(id.0 as i64)
        .bind(pagination.per_page as i64)
        .bind(pagination.offset() as i64)
        .fetch_all(&self.pool)
        .await
        .context("Failed to query results")?;

        Ok(ResultPage {
            items: rows.into_iter().map(|json| json.0).collect(),
            total: total as u64,
            page: pagination.page,
            per_page: pagination.per_page,
        })
    }

    async fn delete_results(&self, id: TaskId) -> Result<()> {
        sqlx::query(&format!("DELETE FROM {} WHERE task_id = $1", self.results_table()))
            .bind(id.0 as i64)
            .execute(&self.pool)
            .await
            .context("Failed to delete results")?;
        Ok(())
    }
}
