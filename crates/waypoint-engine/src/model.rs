//! Data model — workflow definitions, task steps, and execution records
//!
//! Mirrors spec §3. Task steps are a tagged sum (`StepBody`) rather than a
//! class hierarchy with nullable fields, per the design note in spec §9:
//! the one-of constraint between `taskRef | workflowRef | switch` is
//! enforced by the type system for a [`WorkflowTaskStep`] built directly;
//! definitions loaded from a loosely-typed external representation (YAML,
//! a CRD) go through [`RawWorkflowTaskStep::into_step`], which performs the
//! one-of validation explicitly and returns [`GraphError::InvalidStep`] on
//! violation.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::graph::GraphError;
use crate::reliability::RetryPolicy;

/// Workflow identity and labels
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct WorkflowMetadata {
    pub name: String,
    #[serde(default = "default_namespace")]
    pub namespace: String,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

fn default_namespace() -> String {
    "default".to_string()
}

/// One entry of the workflow's input schema
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InputProperty {
    #[serde(rename = "type")]
    pub property_type: String,
    #[serde(default)]
    pub required: bool,
}

/// A declarative workflow definition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowResource {
    pub metadata: WorkflowMetadata,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub input_schema: BTreeMap<String, InputProperty>,
    #[serde(default)]
    pub output: BTreeMap<String, String>,
    pub tasks: Vec<WorkflowTaskStep>,
}

impl WorkflowResource {
    pub fn task(&self, id: &str) -> Option<&WorkflowTaskStep> {
        self.tasks.iter().find(|t| t.id == id)
    }
}

/// Gate attached to a step: skip the step when `if_expr` evaluates falsey
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Condition {
    #[serde(rename = "if")]
    pub if_expr: String,
}

/// Iteration spec attached to a step
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ForEachSpec {
    pub items: String,
    #[serde(default = "default_item_var")]
    pub item_var: String,
    #[serde(default)]
    pub parallel: bool,
    pub max_concurrency: Option<usize>,
}

fn default_item_var() -> String {
    "item".to_string()
}

/// One branch of a `switch` step
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SwitchCase {
    #[serde(rename = "match")]
    pub match_value: String,
    pub task_ref: String,
}

/// `namespace/name@version` sub-workflow reference, pre-parse
pub type WorkflowRefString = String;

/// The mutually exclusive payload of a step
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum StepBody {
    TaskRef {
        task_ref: String,
        #[serde(default)]
        input: BTreeMap<String, String>,
    },
    WorkflowRef {
        workflow_ref: WorkflowRefString,
        #[serde(default)]
        input: BTreeMap<String, String>,
    },
    Switch {
        value: String,
        cases: Vec<SwitchCase>,
        default: Option<String>,
    },
}

impl StepBody {
    /// Template expressions embedded directly in this step's own inputs/value,
    /// excluding any nested `condition`/`forEach` expressions (handled by the caller)
    pub fn own_template_expressions(&self) -> Vec<&str> {
        match self {
            StepBody::TaskRef { input, .. } | StepBody::WorkflowRef { input, .. } => {
                input.values().map(|s| s.as_str()).collect()
            }
            StepBody::Switch { value, .. } => vec![value.as_str()],
        }
    }
}

/// A single node in a workflow definition
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WorkflowTaskStep {
    pub id: String,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default, with = "option_duration_millis")]
    pub timeout: Option<Duration>,
    #[serde(default)]
    pub retry: Option<RetryPolicy>,
    #[serde(default)]
    pub condition: Option<Condition>,
    #[serde(default)]
    pub for_each: Option<ForEachSpec>,
    #[serde(flatten)]
    pub body: StepBody,
}

mod option_duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(v: &Option<Duration>, s: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        v.map(|d| d.as_millis() as u64).serialize(s)
    }

    pub fn deserialize<'de, D>(d: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis: Option<u64> = Option::deserialize(d)?;
        Ok(millis.map(Duration::from_millis))
    }
}

/// Loosely-typed step shape accepted from external declarative sources
/// (YAML workflow files, a CRD). Converted to [`WorkflowTaskStep`] by
/// [`RawWorkflowTaskStep::into_step`], which enforces the one-of invariant
/// that the strongly-typed [`StepBody`] otherwise guarantees by construction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawWorkflowTaskStep {
    pub id: String,
    #[serde(default)]
    pub depends_on: Vec<String>,
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub retry: Option<RetryPolicy>,
    #[serde(default)]
    pub condition: Option<Condition>,
    #[serde(default)]
    pub for_each: Option<ForEachSpec>,
    pub task_ref: Option<String>,
    pub workflow_ref: Option<String>,
    pub switch: Option<RawSwitch>,
    #[serde(default)]
    pub input: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawSwitch {
    pub value: String,
    pub cases: Vec<SwitchCase>,
    pub default: Option<String>,
}

impl RawWorkflowTaskStep {
    pub fn into_step(self) -> Result<WorkflowTaskStep, GraphError> {
        let present = [
            self.task_ref.is_some(),
            self.workflow_ref.is_some(),
            self.switch.is_some(),
        ]
        .iter()
        .filter(|x| **x)
        .count();

        let body = match present {
            0 => {
                return Err(GraphError::InvalidStep {
                    id: self.id.clone(),
                    reason: "neither taskRef, workflowRef, nor switch present".into(),
                })
            }
            1 => {
                if let Some(task_ref) = self.task_ref {
                    StepBody::TaskRef {
                        task_ref,
                        input: self.input,
                    }
                } else if let Some(workflow_ref) = self.workflow_ref {
                    StepBody::WorkflowRef {
                        workflow_ref,
                        input: self.input,
                    }
                } else {
                    let sw = self.switch.expect("checked present == 1");
                    StepBody::Switch {
                        value: sw.value,
                        cases: sw.cases,
                        default: sw.default,
                    }
                }
            }
            _ => {
                return Err(GraphError::InvalidStep {
                    id: self.id.clone(),
                    reason: "both taskRef and workflowRef (or switch) present".into(),
                })
            }
        };

        Ok(WorkflowTaskStep {
            id: self.id,
            depends_on: self.depends_on,
            timeout: self.timeout_ms.map(Duration::from_millis),
            retry: self.retry,
            condition: self.condition,
            for_each: self.for_each,
            body,
        })
    }
}

/// The HTTP/transform contract a registered task name resolves to
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskDefinition {
    pub name: String,
    pub kind: TaskKind,
    #[serde(default)]
    pub retry: Option<RetryPolicy>,
    #[serde(default, with = "option_duration_millis")]
    pub timeout: Option<Duration>,
    #[serde(default)]
    pub circuit_breaker: Option<crate::reliability::CircuitBreakerConfig>,
}

/// A registered task is either an HTTP-backed call or a transform pipeline
/// (spec §4.4: "Transform tasks are a specialization of taskRef where body
/// is a declared pipeline of typed operators").
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum TaskKind {
    Http(HttpRequestTemplate),
    Transform { pipeline: Vec<crate::transform::operators::Operator> },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpRequestTemplate {
    pub method: String,
    pub url: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    pub body: Option<String>,
}

/// Per-task outcome recorded into the in-memory execution context
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskOutcome {
    pub output: serde_json::Value,
    pub success: bool,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub retry_count: u32,
    pub error: Option<String>,
}

/// Per-item loop binding active while evaluating a `forEach` body
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoopBinding {
    pub item: serde_json::Value,
    pub index: usize,
}

/// Output snapshot of a completed parent, visible to a sub-workflow child
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParentBinding {
    pub output: serde_json::Value,
}

/// In-memory per-execution state, mutated only at task terminate (single writer)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionContext {
    pub input: serde_json::Value,
    pub tasks: BTreeMap<String, TaskOutcome>,
    pub env: serde_json::Value,
    #[serde(rename = "loop")]
    pub loop_binding: Option<LoopBinding>,
    pub parent: Option<ParentBinding>,
}

impl ExecutionContext {
    pub fn new(input: serde_json::Value, env: serde_json::Value) -> Self {
        Self {
            input,
            tasks: BTreeMap::new(),
            env,
            loop_binding: None,
            parent: None,
        }
    }

    /// Clone this context for a concurrently-scheduled fan-out unit; the
    /// clone is merged back at level join (spec §9: copy-at-fan-out,
    /// merge-at-join instead of shared interior mutability).
    pub fn fork(&self) -> Self {
        self.clone()
    }

    pub fn with_loop_binding(&self, item: serde_json::Value, index: usize) -> Self {
        let mut ctx = self.clone();
        ctx.loop_binding = Some(LoopBinding { item, index });
        ctx
    }
}

/// Workflow execution status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

/// Per-task execution status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskExecutionStatus {
    Succeeded,
    Failed,
    Skipped,
}

/// A persisted workflow execution
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub id: Uuid,
    pub workflow_name: String,
    pub namespace: String,
    pub input: serde_json::Value,
    pub output: Option<serde_json::Value>,
    pub status: ExecutionStatus,
    /// Set when this execution was entered via a `workflowRef` step of another
    /// execution (spec §4.6: "Child's ExecutionRecord is a sibling row linked
    /// by a parent execution id").
    #[serde(default)]
    pub parent_execution_id: Option<Uuid>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
    pub errors: Vec<String>,
}

impl ExecutionRecord {
    pub fn start(workflow_name: impl Into<String>, namespace: impl Into<String>, input: serde_json::Value, parent_execution_id: Option<Uuid>) -> Self {
        Self {
            id: Uuid::now_v7(),
            workflow_name: workflow_name.into(),
            namespace: namespace.into(),
            input,
            output: None,
            status: ExecutionStatus::Running,
            parent_execution_id,
            started_at: Utc::now(),
            completed_at: None,
            duration_ms: None,
            errors: Vec::new(),
        }
    }

    pub fn terminate(&mut self, status: ExecutionStatus, output: Option<serde_json::Value>, errors: Vec<String>) {
        let now = Utc::now();
        self.completed_at = Some(now);
        self.duration_ms = Some((now - self.started_at).num_milliseconds());
        self.status = status;
        self.output = output;
        self.errors = errors;
    }
}

/// A persisted per-task execution record, written exactly once at task terminate
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskExecutionRecord {
    pub id: Uuid,
    pub execution_id: Uuid,
    pub task_id: String,
    pub task_ref: String,
    pub status: TaskExecutionStatus,
    pub input: serde_json::Value,
    pub output: serde_json::Value,
    pub errors: Vec<String>,
    pub retry_count: u32,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub duration_ms: i64,
}

/// An append-only content-addressed workflow version
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowVersion {
    pub id: Uuid,
    pub workflow_name: String,
    pub version_hash: String,
    pub created_at: DateTime<Utc>,
    pub definition_snapshot: String,
}
