//! Trigger registration and the tick loop that fires workflows on cron
//! schedule
//!
//! A trigger's `lastFiredAt` is the only piece of state the scheduler
//! carries across ticks, and it is persisted per trigger name through
//! [`TriggerStore`] so a restarted scheduler does not immediately re-fire
//! everything whose next occurrence fell during the downtime (it still
//! fires everything *due since* the last known fire, per [`is_due`] —
//! spec.md's non-goals rule out durable execution recovery, not trigger
//! replay on restart).

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, error, info, instrument, warn};
use waypoint_engine::error::{ErrorCode, HasErrorCode};
use waypoint_engine::{Orchestrator, WorkflowProvider};

use crate::cron::{is_due, CronError, CronSchedule};

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error(transparent)]
    Cron(#[from] CronError),
    #[error("trigger '{0}' references unknown workflow '{1}'")]
    UnknownWorkflow(String, String),
    #[error("duplicate trigger name '{0}'")]
    DuplicateTrigger(String),
}

impl HasErrorCode for SchedulerError {
    fn code(&self) -> ErrorCode {
        match self {
            SchedulerError::Cron(e) => e.code(),
            SchedulerError::UnknownWorkflow(..) | SchedulerError::DuplicateTrigger(..) => ErrorCode::CronInvalid,
        }
    }
}

/// A registered cron-driven trigger
#[derive(Debug, Clone)]
pub struct TriggerDefinition {
    pub name: String,
    pub workflow_name: String,
    pub workflow_namespace: String,
    pub schedule: CronSchedule,
    pub input: Value,
}

/// Persists `lastFiredAt` per trigger name (spec §4.11: "Trigger state
/// (`lastFiredAt`) is persisted per trigger name").
#[async_trait]
pub trait TriggerStore: Send + Sync {
    async fn get_last_fired(&self, trigger_name: &str) -> Option<DateTime<Utc>>;
    async fn set_last_fired(&self, trigger_name: &str, at: DateTime<Utc>);
}

/// Sufficient for embedding and for single-process deployments; a
/// Postgres-backed implementation would live in `waypoint-storage` behind
/// the same trait.
#[derive(Debug, Default)]
pub struct InMemoryTriggerStore {
    last_fired: RwLock<BTreeMap<String, DateTime<Utc>>>,
}

impl InMemoryTriggerStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TriggerStore for InMemoryTriggerStore {
    async fn get_last_fired(&self, trigger_name: &str) -> Option<DateTime<Utc>> {
        self.last_fired.read().get(trigger_name).copied()
    }

    async fn set_last_fired(&self, trigger_name: &str, at: DateTime<Utc>) {
        self.last_fired.write().insert(trigger_name.to_string(), at);
    }
}

/// Drives a local in-process tick loop over a set of registered triggers,
/// firing each whose `IsDue` is true (spec §4.11: "ticks once per minute
/// boundary... examining all registered triggers"). Not a distributed
/// scheduler (spec §1 non-goals: no leader election across engine
/// instances) — every process running this loop would fire its own copy
/// of a due trigger.
pub struct Scheduler {
    orchestrator: Arc<Orchestrator>,
    workflows: Arc<dyn WorkflowProvider>,
    store: Arc<dyn TriggerStore>,
    triggers: RwLock<Vec<TriggerDefinition>>,
}

impl Scheduler {
    pub fn new(orchestrator: Arc<Orchestrator>, workflows: Arc<dyn WorkflowProvider>, store: Arc<dyn TriggerStore>) -> Self {
        Self {
            orchestrator,
            workflows,
            store,
            triggers: RwLock::new(Vec::new()),
        }
    }

    pub fn register(&self, trigger: TriggerDefinition) -> Result<(), SchedulerError> {
        let mut triggers = self.triggers.write();
        if triggers.iter().any(|t| t.name == trigger.name) {
            return Err(SchedulerError::DuplicateTrigger(trigger.name));
        }
        triggers.push(trigger);
        Ok(())
    }

    pub fn unregister(&self, name: &str) {
        self.triggers.write().retain(|t| t.name != name);
    }

    pub fn triggers(&self) -> Vec<TriggerDefinition> {
        self.triggers.read().clone()
    }

    /// Examine every registered trigger against `now` and fire the ones
    /// that are due, persisting `lastFiredAt` before returning. Takes an
    /// explicit `now` rather than reading the wall clock so a caller (the
    /// run loop below, or a test) controls time.
    #[instrument(skip(self))]
    pub async fn tick(&self, now: DateTime<Utc>) {
        let triggers = self.triggers();
        for trigger in triggers {
            let last_run = self.store.get_last_fired(&trigger.name).await;
            if !is_due(&trigger.schedule, last_run, now) {
                continue;
            }

            let namespace = trigger.workflow_namespace.clone();
            let workflows = self.workflows.list(Some(&namespace)).await;
            let Some(workflow) = workflows.iter().find(|w| w.metadata.name == trigger.workflow_name) else {
                warn!(trigger = %trigger.name, workflow = %trigger.workflow_name, "trigger fired but workflow is not registered");
                self.store.set_last_fired(&trigger.name, now).await;
                continue;
            };

            info!(trigger = %trigger.name, workflow = %trigger.workflow_name, "cron trigger firing workflow");
            let orchestrator = self.orchestrator.clone();
            let workflow = workflow.clone();
            let input = trigger.input.clone();
            tokio::spawn(async move {
                let result = orchestrator.execute(&workflow, input).await;
                if !result.success {
                    error!(execution_id = %result.execution_id, error = ?result.error, "triggered execution did not succeed");
                }
            });

            self.store.set_last_fired(&trigger.name, now).await;
        }
    }

    /// Runs [`tick`](Self::tick) once per wall-clock minute boundary until
    /// `shutdown` resolves. Sleeps to the next `:00` rather than a fixed
    /// 60s interval so ticks stay aligned to the minute even if a previous
    /// tick's spawn overhead pushes the loop slightly late.
    pub async fn run(self: Arc<Self>, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        loop {
            let now = Utc::now();
            let sleep_secs = 60 - (now.timestamp() % 60);
            tokio::select! {
                _ = tokio::time::sleep(std::time::Duration::from_secs(sleep_secs as u64)) => {}
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        debug!("scheduler shutdown requested");
                        return;
                    }
                }
            }
            if *shutdown.borrow() {
                return;
            }
            self.tick(Utc::now()).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap as Map;
    use waypoint_engine::prelude::*;

    fn workflow(name: &str) -> WorkflowResource {
        WorkflowResource {
            metadata: WorkflowMetadata {
                name: name.to_string(),
                namespace: "default".to_string(),
                labels: Map::new(),
            },
            version: None,
            input_schema: Map::new(),
            output: Map::new(),
            tasks: Vec::new(),
        }
    }

    fn orchestrator_for(workflows: StaticWorkflowRegistry) -> (Arc<Orchestrator>, Arc<dyn WorkflowProvider>) {
        use waypoint_engine::reliability::CircuitBreakerRegistry;
        use waypoint_engine::task_executor::{StaticTaskRegistry, TaskExecutor};
        use waypoint_storage::memory::{InMemoryExecutionRepository, InMemoryTaskExecutionRepository, InMemoryWorkflowVersionRepository};

        let workflows: Arc<dyn WorkflowProvider> = Arc::new(workflows);
        let executor = Arc::new(TaskExecutor::new(Arc::new(CircuitBreakerRegistry::new()), std::time::Duration::from_secs(30)));
        let orchestrator = Arc::new(Orchestrator::new(
            Default::default(),
            Arc::new(StaticTaskRegistry::new()),
            workflows.clone(),
            Arc::new(InMemoryExecutionRepository::new()),
            Arc::new(InMemoryTaskExecutionRepository::new()),
            Arc::new(InMemoryWorkflowVersionRepository::new()),
            executor,
        ));
        (orchestrator, workflows)
    }

    #[tokio::test]
    async fn registers_and_rejects_duplicate_names() {
        let registry = StaticWorkflowRegistry::new().with_workflow(workflow("nightly-report"));
        let (orchestrator, workflows) = orchestrator_for(registry);
        let scheduler = Scheduler::new(orchestrator, workflows, Arc::new(InMemoryTriggerStore::new()));

        let trigger = TriggerDefinition {
            name: "nightly".to_string(),
            workflow_name: "nightly-report".to_string(),
            workflow_namespace: "default".to_string(),
            schedule: CronSchedule::parse("0 2 * * *").unwrap(),
            input: Value::Null,
        };
        scheduler.register(trigger.clone()).unwrap();
        let err = scheduler.register(trigger).unwrap_err();
        assert!(matches!(err, SchedulerError::DuplicateTrigger(_)));
    }

    #[tokio::test]
    async fn tick_fires_due_trigger_and_records_last_fired() {
        let registry = StaticWorkflowRegistry::new().with_workflow(workflow("nightly-report"));
        let (orchestrator, workflows) = orchestrator_for(registry);
        let store = Arc::new(InMemoryTriggerStore::new());
        let scheduler = Scheduler::new(orchestrator, workflows, store.clone());

        scheduler
            .register(TriggerDefinition {
                name: "every-minute".to_string(),
                workflow_name: "nightly-report".to_string(),
                workflow_namespace: "default".to_string(),
                schedule: CronSchedule::parse("* * * * *").unwrap(),
                input: Value::Null,
            })
            .unwrap();

        let t0 = Utc::now();
        assert!(store.get_last_fired("every-minute").await.is_none());
        scheduler.tick(t0).await;
        assert_eq!(store.get_last_fired("every-minute").await, Some(t0));
    }

    #[tokio::test]
    async fn tick_does_not_fire_when_not_due() {
        let registry = StaticWorkflowRegistry::new().with_workflow(workflow("nightly-report"));
        let (orchestrator, workflows) = orchestrator_for(registry);
        let store = Arc::new(InMemoryTriggerStore::new());
        let scheduler = Scheduler::new(orchestrator, workflows, store.clone());

        scheduler
            .register(TriggerDefinition {
                name: "yearly".to_string(),
                workflow_name: "nightly-report".to_string(),
                workflow_namespace: "default".to_string(),
                schedule: CronSchedule::parse("0 0 1 1 *").unwrap(),
                input: Value::Null,
            })
            .unwrap();

        let now = Utc::now();
        scheduler.tick(now).await;
        assert!(store.get_last_fired("yearly").await.is_none());
    }
}
