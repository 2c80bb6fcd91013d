//! # Waypoint Workflow Execution Engine
//!
//! A declarative, DAG-based workflow orchestration core: template
//! resolution, dependency extraction, graph construction, task dispatch,
//! retry/circuit-breaking, orchestration, sub-workflow composition, content
//! addressed versioning, transform pipelines, and blast-radius analysis.
//!
//! ## Features
//!
//! - **Declarative task graphs**: dependencies are extracted from `{{ }}`
//!   template references, not declared by hand; cycles are rejected at
//!   graph-build time with a witness path.
//! - **Template resolution**: `input.`, `tasks.<id>.output.`, `env.`,
//!   `item`/`index`/`parent.output.` root paths, cached per template string.
//! - **Reliability**: exponential backoff with jitter and per-task circuit
//!   breakers, independent of one another.
//! - **Sub-workflow composition**: `workflowRef` steps recurse into the
//!   orchestrator with an immutable call stack that rejects cycles.
//! - **Versioning**: workflow definitions are content-addressed and stored
//!   append-only, so an execution always records the version it ran against.
//! - **Transform pipelines**: a small operator algebra (filter, map, select,
//!   group-by, aggregate, join, ...) with an equivalence checker usable by an
//!   optimizer to judge whether two operators may be safely reordered.
//! - **Blast-radius analysis**: reverse-dependency BFS from a task or
//!   workflow to the set of workflows it would affect if changed.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        Orchestrator                          │
//! │  (drives levels of the DAG, forEach/switch/workflowRef,     │
//! │   cancellation, timeouts, terminal persistence)              │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!          ┌───────────────────┼───────────────────┐
//!          ▼                   ▼                   ▼
//! ┌─────────────────┐ ┌─────────────────┐ ┌─────────────────────┐
//! │  TemplateResolver │ │   TaskExecutor   │ │  reliability::{     │
//! │  (graph, model)   │ │ (http, transform)│ │   RetryPolicy,       │
//! │                    │ │                  │ │   CircuitBreaker }   │
//! └─────────────────┘ └─────────────────┘ └─────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        persistence                           │
//! │  (ExecutionRepository, TaskExecutionRepository,              │
//! │   WorkflowVersionRepository — implemented by waypoint-storage)│
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use waypoint_engine::prelude::*;
//!
//! let executor = Arc::new(TaskExecutor::new(
//!     Arc::new(StaticTaskRegistry::new()),
//!     Arc::new(ReqwestInvoker::default()),
//!     Arc::new(TemplateResolver::new()),
//! ));
//! let orchestrator = Orchestrator::new(
//!     EngineConfig::default(),
//!     Arc::new(StaticTaskRegistry::new()),
//!     Arc::new(StaticWorkflowRegistry::new()),
//!     execution_repo,
//!     task_execution_repo,
//!     version_repo,
//!     executor,
//! );
//!
//! let result = orchestrator.execute(&workflow, input).await;
//! ```

pub mod blast_radius;
pub mod config;
pub mod error;
pub mod events;
pub mod graph;
pub mod model;
pub mod orchestrator;
pub mod persistence;
pub mod reliability;
pub mod subworkflow;
pub mod task_executor;
pub mod template;
pub mod transform;
pub mod versioning;

/// Prelude for common imports.
pub mod prelude {
    pub use crate::blast_radius::{analyze, BlastEdge, BlastNode, BlastRadiusResult, BlastSummary, NodeId};
    pub use crate::config::EngineConfig;
    pub use crate::error::{ErrorCode, FailureDetail, HasErrorCode};
    pub use crate::events::{duration_ms, Event, EventPublisher, ExecutionEventStream};
    pub use crate::graph::{build_graph, extract_dependencies, BuildResult, Graph, GraphError, ParallelGroup};
    pub use crate::model::{
        Condition, ExecutionContext, ExecutionRecord, ExecutionStatus, ForEachSpec, HttpRequestTemplate, InputProperty, LoopBinding,
        ParentBinding, StepBody, SwitchCase, TaskDefinition, TaskExecutionRecord, TaskExecutionStatus, TaskKind, TaskOutcome,
        WorkflowMetadata, WorkflowResource, WorkflowTaskStep, WorkflowVersion,
    };
    pub use crate::orchestrator::{ExecutionResult, Orchestrator};
    pub use crate::persistence::{ExecutionFilter, ExecutionRepository, StoreError, TaskExecutionRepository, WorkflowVersionRepository};
    pub use crate::reliability::{CircuitBreakerConfig, CircuitBreakerRegistry, CircuitState, Decision, RetryPolicy};
    pub use crate::subworkflow::{resolve as resolve_workflow_ref, CallStack, StaticWorkflowRegistry, SubworkflowError, WorkflowProvider, WorkflowRef};
    pub use crate::task_executor::{render_input, HttpInvoker, ReqwestInvoker, StaticTaskRegistry, TaskDefinitionProvider, TaskExecError, TaskExecutor};
    pub use crate::template::{Resolved, TemplateError, TemplateResolver};
    pub use crate::transform::{check_pair, execute_pipeline, AggOp, CompareOp, EquivalenceCheck, Operator, Safety, TransformError};
    pub use crate::versioning::{calculate_version_hash, create_version_if_changed, VersioningError};
}

// Re-export key types at crate root.
pub use blast_radius::{analyze, BlastRadiusResult, NodeId};
pub use config::EngineConfig;
pub use error::{ErrorCode, FailureDetail, HasErrorCode};
pub use events::{Event, EventPublisher};
pub use graph::{build_graph, Graph, GraphError};
pub use model::{ExecutionContext, ExecutionRecord, ExecutionStatus, WorkflowResource, WorkflowTaskStep};
pub use orchestrator::{ExecutionResult, Orchestrator};
pub use persistence::{ExecutionRepository, StoreError, TaskExecutionRepository, WorkflowVersionRepository};
pub use reliability::{CircuitBreakerConfig, RetryPolicy};
pub use subworkflow::{CallStack, SubworkflowError, WorkflowProvider};
pub use task_executor::{TaskDefinitionProvider, TaskExecutor};
pub use template::TemplateResolver;
pub use versioning::VersioningError;
