//! In-memory implementations of the persistence contracts, for embedding and
//! testing. Stores all data behind `parking_lot::RwLock`, same semantics as
//! the Postgres-backed implementations minus durability across process
//! restarts.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::RwLock;
use uuid::Uuid;
use waypoint_engine::persistence::{ExecutionFilter, ExecutionRepository, StoreError, TaskExecutionRepository, WorkflowVersionRepository};
use waypoint_engine::{ExecutionRecord, ExecutionStatus};
use waypoint_engine::model::{TaskExecutionRecord, WorkflowVersion};

/// In-memory [`ExecutionRepository`].
///
/// # Example
///
/// ```
/// use waypoint_storage::InMemoryExecutionRepository;
///
/// let repo = InMemoryExecutionRepository::new();
/// ```
#[derive(Debug, Default)]
pub struct InMemoryExecutionRepository {
    executions: RwLock<HashMap<Uuid, ExecutionRecord>>,
}

impl InMemoryExecutionRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ExecutionRepository for InMemoryExecutionRepository {
    async fn save(&self, record: &ExecutionRecord) -> Result<(), StoreError> {
        self.executions.write().insert(record.id, record.clone());
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<(ExecutionRecord, Vec<TaskExecutionRecord>)>, StoreError> {
        Ok(self.executions.read().get(&id).cloned().map(|r| (r, Vec::new())))
    }

    async fn list(&self, filter: ExecutionFilter) -> Result<Vec<ExecutionRecord>, StoreError> {
        let mut rows: Vec<ExecutionRecord> = self
            .executions
            .read()
            .values()
            .filter(|r| filter.workflow_name.as_deref().map_or(true, |n| r.workflow_name == n))
            .filter(|r| filter.status.map_or(true, |s| r.status == s))
            .cloned()
            .collect();
        rows.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        let rows = rows.into_iter().skip(filter.skip as usize).take(filter.take.max(1) as usize).collect();
        Ok(rows)
    }
}

/// In-memory [`TaskExecutionRepository`].
#[derive(Debug, Default)]
pub struct InMemoryTaskExecutionRepository {
    records: RwLock<HashMap<Uuid, TaskExecutionRecord>>,
}

impl InMemoryTaskExecutionRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TaskExecutionRepository for InMemoryTaskExecutionRepository {
    async fn save(&self, record: &TaskExecutionRecord) -> Result<(), StoreError> {
        self.records.write().insert(record.id, record.clone());
        Ok(())
    }

    async fn list_for_execution(&self, execution_id: Uuid) -> Result<Vec<TaskExecutionRecord>, StoreError> {
        let mut rows: Vec<TaskExecutionRecord> = self
            .records
            .read()
            .values()
            .filter(|r| r.execution_id == execution_id)
            .cloned()
            .collect();
        rows.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        Ok(rows)
    }
}

/// In-memory [`WorkflowVersionRepository`].
#[derive(Debug, Default)]
pub struct InMemoryWorkflowVersionRepository {
    versions: RwLock<HashMap<String, Vec<WorkflowVersion>>>,
}

impl InMemoryWorkflowVersionRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl WorkflowVersionRepository for InMemoryWorkflowVersionRepository {
    async fn save_version(&self, version: &WorkflowVersion) -> Result<(), StoreError> {
        self.versions.write().entry(version.workflow_name.clone()).or_default().push(version.clone());
        Ok(())
    }

    async fn get_versions(&self, workflow_name: &str) -> Result<Vec<WorkflowVersion>, StoreError> {
        let mut rows = self.versions.read().get(workflow_name).cloned().unwrap_or_default();
        rows.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(rows)
    }

    async fn get_latest_version(&self, workflow_name: &str) -> Result<Option<WorkflowVersion>, StoreError> {
        Ok(self.versions.read().get(workflow_name).and_then(|v| v.iter().max_by_key(|v| v.created_at).cloned()))
    }
}
