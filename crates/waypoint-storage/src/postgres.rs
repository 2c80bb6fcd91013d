//! PostgreSQL-backed implementations of the persistence contracts.
//!
//! Uses `sqlx::query` (not the `query!` compile-time macro family) so the
//! crate builds without a live database connection.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use tracing::{debug, error, instrument};
use uuid::Uuid;
use waypoint_engine::model::{TaskExecutionRecord, TaskExecutionStatus, WorkflowVersion};
use waypoint_engine::persistence::{ExecutionFilter, ExecutionRepository, StoreError, TaskExecutionRepository, WorkflowVersionRepository};
use waypoint_engine::{ExecutionRecord, ExecutionStatus};

fn execution_status_str(status: ExecutionStatus) -> &'static str {
    match status {
        ExecutionStatus::Running => "running",
        ExecutionStatus::Succeeded => "succeeded",
        ExecutionStatus::Failed => "failed",
        ExecutionStatus::Cancelled => "cancelled",
    }
}

fn parse_execution_status(raw: &str) -> Result<ExecutionStatus, StoreError> {
    match raw {
        "running" => Ok(ExecutionStatus::Running),
        "succeeded" => Ok(ExecutionStatus::Succeeded),
        "failed" => Ok(ExecutionStatus::Failed),
        "cancelled" => Ok(ExecutionStatus::Cancelled),
        other => Err(StoreError::Backend(format!("unknown execution status: {other}"))),
    }
}

fn task_status_str(status: TaskExecutionStatus) -> &'static str {
    match status {
        TaskExecutionStatus::Succeeded => "succeeded",
        TaskExecutionStatus::Failed => "failed",
        TaskExecutionStatus::Skipped => "skipped",
    }
}

fn parse_task_status(raw: &str) -> Result<TaskExecutionStatus, StoreError> {
    match raw {
        "succeeded" => Ok(TaskExecutionStatus::Succeeded),
        "failed" => Ok(TaskExecutionStatus::Failed),
        "skipped" => Ok(TaskExecutionStatus::Skipped),
        other => Err(StoreError::Backend(format!("unknown task execution status: {other}"))),
    }
}

/// # Example
///
/// ```ignore
/// use sqlx::PgPool;
/// use waypoint_storage::PostgresExecutionRepository;
///
/// let pool = PgPool::connect("postgres://localhost/waypoint").await?;
/// let repo = PostgresExecutionRepository::new(pool);
/// ```
#[derive(Clone)]
pub struct PostgresExecutionRepository {
    pool: PgPool,
}

impl PostgresExecutionRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ExecutionRepository for PostgresExecutionRepository {
    #[instrument(skip(self, record))]
    async fn save(&self, record: &ExecutionRecord) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO waypoint_executions
                (id, workflow_name, namespace, input, output, status, parent_execution_id, started_at, completed_at, duration_ms, errors)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            ON CONFLICT (id) DO UPDATE SET
                output = EXCLUDED.output,
                status = EXCLUDED.status,
                completed_at = EXCLUDED.completed_at,
                duration_ms = EXCLUDED.duration_ms,
                errors = EXCLUDED.errors
            "#,
        )
        .bind(record.id)
        .bind(&record.workflow_name)
        .bind(&record.namespace)
        .bind(&record.input)
        .bind(&record.output)
        .bind(execution_status_str(record.status))
        .bind(record.parent_execution_id)
        .bind(record.started_at)
        .bind(record.completed_at)
        .bind(record.duration_ms)
        .bind(serde_json::to_value(&record.errors).unwrap_or_default())
        .execute(&self.pool)
        .await
        .map_err(|e| {
            error!(error = %e, "failed to save execution");
            StoreError::Backend(e.to_string())
        })?;

        debug!(execution_id = %record.id, "saved execution");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn get(&self, id: Uuid) -> Result<Option<(ExecutionRecord, Vec<TaskExecutionRecord>)>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT id, workflow_name, namespace, input, output, status, parent_execution_id, started_at, completed_at, duration_ms, errors
            FROM waypoint_executions
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StoreError::Backend(e.to_string()))?;

        let Some(row) = row else { return Ok(None) };
        let record = row_to_execution(&row)?;

        let tasks = PostgresTaskExecutionRepository { pool: self.pool.clone() }.list_for_execution(id).await?;
        Ok(Some((record, tasks)))
    }

    #[instrument(skip(self))]
    async fn list(&self, filter: ExecutionFilter) -> Result<Vec<ExecutionRecord>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, workflow_name, namespace, input, output, status, parent_execution_id, started_at, completed_at, duration_ms, errors
            FROM waypoint_executions
            WHERE ($1::text IS NULL OR workflow_name = $1)
              AND ($2::text IS NULL OR status = $2)
            ORDER BY started_at DESC
            OFFSET $3
            LIMIT $4
            "#,
        )
        .bind(&filter.workflow_name)
        .bind(filter.status.map(execution_status_str))
        .bind(filter.skip as i64)
        .bind(filter.take.max(1) as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError::Backend(e.to_string()))?;

        rows.iter().map(row_to_execution).collect()
    }
}

fn row_to_execution(row: &sqlx::postgres::PgRow) -> Result<ExecutionRecord, StoreError> {
    let status: String = row.get("status");
    let errors: serde_json::Value = row.get("errors");
    Ok(ExecutionRecord {
        id: row.get("id"),
        workflow_name: row.get("workflow_name"),
        namespace: row.get("namespace"),
        input: row.get("input"),
        output: row.get("output"),
        status: parse_execution_status(&status)?,
        parent_execution_id: row.get("parent_execution_id"),
        started_at: row.get::<DateTime<Utc>, _>("started_at"),
        completed_at: row.get("completed_at"),
        duration_ms: row.get("duration_ms"),
        errors: serde_json::from_value(errors).unwrap_or_default(),
    })
}

#[derive(Clone)]
pub struct PostgresTaskExecutionRepository {
    pool: PgPool,
}

impl PostgresTaskExecutionRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl TaskExecutionRepository for PostgresTaskExecutionRepository {
    #[instrument(skip(self, record))]
    async fn save(&self, record: &TaskExecutionRecord) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO waypoint_task_executions
                (id, execution_id, task_id, task_ref, status, input, output, errors, retry_count, started_at, completed_at, duration_ms)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            ON CONFLICT (id) DO UPDATE SET
                status = EXCLUDED.status,
                output = EXCLUDED.output,
                errors = EXCLUDED.errors,
                retry_count = EXCLUDED.retry_count,
                completed_at = EXCLUDED.completed_at,
                duration_ms = EXCLUDED.duration_ms
            "#,
        )
        .bind(record.id)
        .bind(record.execution_id)
        .bind(&record.task_id)
        .bind(&record.task_ref)
        .bind(task_status_str(record.status))
        .bind(&record.input)
        .bind(&record.output)
        .bind(serde_json::to_value(&record.errors).unwrap_or_default())
        .bind(record.retry_count as i32)
        .bind(record.started_at)
        .bind(record.completed_at)
        .bind(record.duration_ms)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            error!(error = %e, "failed to save task execution");
            StoreError::Backend(e.to_string())
        })?;

        Ok(())
    }

    #[instrument(skip(self))]
    async fn list_for_execution(&self, execution_id: Uuid) -> Result<Vec<TaskExecutionRecord>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, execution_id, task_id, task_ref, status, input, output, errors, retry_count, started_at, completed_at, duration_ms
            FROM waypoint_task_executions
            WHERE execution_id = $1
            ORDER BY started_at ASC
            "#,
        )
        .bind(execution_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError::Backend(e.to_string()))?;

        rows.iter()
            .map(|row| {
                let status: String = row.get("status");
                let errors: serde_json::Value = row.get("errors");
                let retry_count: i32 = row.get("retry_count");
                Ok(TaskExecutionRecord {
                    id: row.get("id"),
                    execution_id: row.get("execution_id"),
                    task_id: row.get("task_id"),
                    task_ref: row.get("task_ref"),
                    status: parse_task_status(&status)?,
                    input: row.get("input"),
                    output: row.get("output"),
                    errors: serde_json::from_value(errors).unwrap_or_default(),
                    retry_count: retry_count as u32,
                    started_at: row.get("started_at"),
                    completed_at: row.get("completed_at"),
                    duration_ms: row.get("duration_ms"),
                })
            })
            .collect()
    }
}

#[derive(Clone)]
pub struct PostgresWorkflowVersionRepository {
    pool: PgPool,
}

impl PostgresWorkflowVersionRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl WorkflowVersionRepository for PostgresWorkflowVersionRepository {
    #[instrument(skip(self, version))]
    async fn save_version(&self, version: &WorkflowVersion) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO waypoint_workflow_versions (id, workflow_name, version_hash, created_at, definition_snapshot)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (workflow_name, version_hash) DO NOTHING
            "#,
        )
        .bind(version.id)
        .bind(&version.workflow_name)
        .bind(&version.version_hash)
        .bind(version.created_at)
        .bind(&version.definition_snapshot)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Backend(e.to_string()))?;

        Ok(())
    }

    #[instrument(skip(self))]
    async fn get_versions(&self, workflow_name: &str) -> Result<Vec<WorkflowVersion>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, workflow_name, version_hash, created_at, definition_snapshot
            FROM waypoint_workflow_versions
            WHERE workflow_name = $1
            ORDER BY created_at DESC
            "#,
        )
        .bind(workflow_name)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError::Backend(e.to_string()))?;

        Ok(rows.iter().map(row_to_version).collect())
    }

    #[instrument(skip(self))]
    async fn get_latest_version(&self, workflow_name: &str) -> Result<Option<WorkflowVersion>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT id, workflow_name, version_hash, created_at, definition_snapshot
            FROM waypoint_workflow_versions
            WHERE workflow_name = $1
            ORDER BY created_at DESC
            LIMIT 1
            "#,
        )
        .bind(workflow_name)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StoreError::Backend(e.to_string()))?;

        Ok(row.as_ref().map(row_to_version))
    }
}

fn row_to_version(row: &sqlx::postgres::PgRow) -> WorkflowVersion {
    WorkflowVersion {
        id: row.get("id"),
        workflow_name: row.get("workflow_name"),
        version_hash: row.get("version_hash"),
        created_at: row.get("created_at"),
        definition_snapshot: row.get("definition_snapshot"),
    }
}
