//! Content-hash versioning

use chrono::Utc;
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::error::{ErrorCode, HasErrorCode};
use crate::model::{WorkflowResource, WorkflowVersion};
use crate::persistence::{StoreError, WorkflowVersionRepository};

#[derive(Debug, thiserror::Error)]
pub enum VersioningError {
    #[error("failed to normalize workflow definition: {0}")]
    Normalize(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl HasErrorCode for VersioningError {
    fn code(&self) -> ErrorCode {
        ErrorCode::Persistence
    }
}

/// Stable 64-hex-char SHA-256 of the workflow's normalized definition.
/// Normalization drops the `version` annotation (the hash determines it, not
/// the reverse) and relies on every map-shaped field already being a
/// `BTreeMap`, so key order never perturbs the digest; serialization to
/// compact JSON canonicalizes whitespace. Identical definitions therefore
/// always hash identically, and any task add/remove/reorder/input change
/// changes the hash because task order is preserved in the `Vec`.
pub fn calculate_version_hash(workflow: &WorkflowResource) -> Result<String, VersioningError> {
    let mut normalized = workflow.clone();
    normalized.version = None;

    let canonical = serde_json::to_string(&normalized).map_err(|e| VersioningError::Normalize(e.to_string()))?;

    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    Ok(hex::encode(hasher.finalize()))
}

/// The normalized snapshot text stored alongside a version row.
pub fn normalized_snapshot(workflow: &WorkflowResource) -> Result<String, VersioningError> {
    let mut normalized = workflow.clone();
    normalized.version = None;
    serde_json::to_string(&normalized).map_err(|e| VersioningError::Normalize(e.to_string()))
}

/// Compare `workflow`'s hash against the latest stored version for its name;
/// if different (or none exists), append a new row. Returns whether a new
/// version was stored. Calling this twice in succession for the same
/// definition stores at most one row (idempotent).
pub async fn create_version_if_changed(workflow: &WorkflowResource, repo: &dyn WorkflowVersionRepository) -> Result<bool, VersioningError> {
    let hash = calculate_version_hash(workflow)?;
    let latest = repo.get_latest_version(&workflow.metadata.name).await?;

    if let Some(latest) = latest {
        if latest.version_hash == hash {
            return Ok(false);
        }
    }

    let snapshot = normalized_snapshot(workflow)?;
    let version = WorkflowVersion {
        id: Uuid::now_v7(),
        workflow_name: workflow.metadata.name.clone(),
        version_hash: hash,
        created_at: Utc::now(),
        definition_snapshot: snapshot,
    };
    repo.save_version(&version).await?;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{StepBody, WorkflowMetadata, WorkflowTaskStep};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::collections::BTreeMap;

    fn workflow(name: &str, task_ids: &[&str]) -> WorkflowResource {
        WorkflowResource {
            metadata: WorkflowMetadata {
                name: name.to_string(),
                namespace: "default".to_string(),
                labels: BTreeMap::new(),
            },
            version: None,
            input_schema: BTreeMap::new(),
            output: BTreeMap::new(),
            tasks: task_ids
                .iter()
                .map(|id| WorkflowTaskStep {
                    id: id.to_string(),
                    depends_on: Vec::new(),
                    timeout: None,
                    retry: None,
                    condition: None,
                    for_each: None,
                    body: StepBody::TaskRef {
                        task_ref: "noop".to_string(),
                        input: BTreeMap::new(),
                    },
                })
                .collect(),
        }
    }

    #[derive(Default)]
    struct InMemoryVersions(Mutex<Vec<WorkflowVersion>>);

    #[async_trait]
    impl WorkflowVersionRepository for InMemoryVersions {
        async fn save_version(&self, version: &WorkflowVersion) -> Result<(), StoreError> {
            self.0.lock().push(version.clone());
            Ok(())
        }

        async fn get_versions(&self, workflow_name: &str) -> Result<Vec<WorkflowVersion>, StoreError> {
            let mut versions: Vec<_> = self.0.lock().iter().filter(|v| v.workflow_name == workflow_name).cloned().collect();
            versions.sort_by(|a, b| b.created_at.cmp(&a.created_at));
            Ok(versions)
        }

        async fn get_latest_version(&self, workflow_name: &str) -> Result<Option<WorkflowVersion>, StoreError> {
            Ok(self.get_versions(workflow_name).await?.into_iter().next())
        }
    }

    #[test]
    fn identical_definitions_hash_identically() {
        let a = workflow("greet", &["t1", "t2"]);
        let b = workflow("greet", &["t1", "t2"]);
        assert_eq!(calculate_version_hash(&a).unwrap(), calculate_version_hash(&b).unwrap());
    }

    #[test]
    fn hash_is_64_hex_chars() {
        let hash = calculate_version_hash(&workflow("greet", &["t1"])).unwrap();
        assert_eq!(hash.len(), 64);
        assert!(hash.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn adding_a_task_changes_the_hash() {
        let a = workflow("greet", &["t1"]);
        let b = workflow("greet", &["t1", "t2"]);
        assert_ne!(calculate_version_hash(&a).unwrap(), calculate_version_hash(&b).unwrap());
    }

    #[test]
    fn reordering_tasks_changes_the_hash() {
        let a = workflow("greet", &["t1", "t2"]);
        let b = workflow("greet", &["t2", "t1"]);
        assert_ne!(calculate_version_hash(&a).unwrap(), calculate_version_hash(&b).unwrap());
    }

    #[tokio::test]
    async fn create_version_if_changed_is_idempotent() {
        let repo = InMemoryVersions::default();
        let wf = workflow("greet", &["t1"]);

        assert!(create_version_if_changed(&wf, &repo).await.unwrap());
        assert!(!create_version_if_changed(&wf, &repo).await.unwrap());

        let versions = repo.get_versions("greet").await.unwrap();
        assert_eq!(versions.len(), 1);
    }

    #[tokio::test]
    async fn changed_definition_records_new_version() {
        let repo = InMemoryVersions::default();
        let v1 = workflow("greet", &["t1"]);
        let v2 = workflow("greet", &["t1", "t2"]);

        assert!(create_version_if_changed(&v1, &repo).await.unwrap());
        assert!(create_version_if_changed(&v2, &repo).await.unwrap());

        let versions = repo.get_versions("greet").await.unwrap();
        assert_eq!(versions.len(), 2);
    }
}
