//! Persistence layer contracts
//!
//! The engine depends only on these traits; `waypoint-storage` supplies the
//! in-memory and Postgres/sqlx implementations. One trait per aggregate
//! instead of a single god-trait, so a caller embedding the engine can mix
//! implementations (e.g. Postgres executions, in-memory versions) freely.

use async_trait::async_trait;
use thiserror::Error;
use uuid::Uuid;

use crate::error::{ErrorCode, HasErrorCode};
use crate::model::{ExecutionRecord, ExecutionStatus, TaskExecutionRecord, WorkflowVersion};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("storage backend error: {0}")]
    Backend(String),
}

impl HasErrorCode for StoreError {
    fn code(&self) -> ErrorCode {
        ErrorCode::Persistence
    }
}

/// Filters accepted by [`ExecutionRepository::list`]
#[derive(Debug, Clone, Default)]
pub struct ExecutionFilter {
    pub workflow_name: Option<String>,
    pub status: Option<ExecutionStatus>,
    pub skip: u64,
    pub take: u64,
}

#[async_trait]
pub trait ExecutionRepository: Send + Sync {
    /// Upsert by id.
    async fn save(&self, record: &ExecutionRecord) -> Result<(), StoreError>;

    /// Includes the execution's task execution records.
    async fn get(&self, id: Uuid) -> Result<Option<(ExecutionRecord, Vec<TaskExecutionRecord>)>, StoreError>;

    /// Ordered by `startedAt` descending.
    async fn list(&self, filter: ExecutionFilter) -> Result<Vec<ExecutionRecord>, StoreError>;
}

#[async_trait]
pub trait TaskExecutionRepository: Send + Sync {
    /// Upsert by id.
    async fn save(&self, record: &TaskExecutionRecord) -> Result<(), StoreError>;

    /// Ordered by `startedAt` ascending.
    async fn list_for_execution(&self, execution_id: Uuid) -> Result<Vec<TaskExecutionRecord>, StoreError>;
}

#[async_trait]
pub trait WorkflowVersionRepository: Send + Sync {
    async fn save_version(&self, version: &WorkflowVersion) -> Result<(), StoreError>;

    /// Newest first.
    async fn get_versions(&self, workflow_name: &str) -> Result<Vec<WorkflowVersion>, StoreError>;

    async fn get_latest_version(&self, workflow_name: &str) -> Result<Option<WorkflowVersion>, StoreError>;
}
