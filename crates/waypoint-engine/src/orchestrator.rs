//! Workflow Orchestrator: drives the DAG produced by the graph
//! builder level by level, dispatches each ready task through the executor
//! (or recursively through itself for a `workflowRef` step), fans level
//! members out concurrently bounded by [`EngineConfig::max_workflow_concurrency`],
//! and aggregates the terminal [`ExecutionRecord`].
//!
//! Fan-out is cooperative (`futures::future::join_all` / `buffer_unordered`
//! over borrowed `&self`), not `tokio::spawn` — every unit this module
//! schedules is polled to completion before `execute` returns, so there is no
//! need for `'static` futures or an `Arc<Self>` just to get "tasks at a level
//! run concurrently". Recursion into a sub-workflow goes through
//! [`Orchestrator::execute_inner`], the one method boxed to break the
//! otherwise-infinite `async fn` type.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use futures::future::{BoxFuture, FutureExt};
use futures::stream::{self, StreamExt};
use serde_json::Value;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::events::{Event, EventPublisher};
use crate::graph::{build_graph, Graph};
use crate::model::{
    ExecutionContext, ExecutionRecord, ExecutionStatus, ForEachSpec, InputProperty, StepBody, TaskExecutionRecord, TaskExecutionStatus, TaskOutcome, WorkflowResource,
    WorkflowTaskStep,
};
use crate::persistence::{ExecutionRepository, TaskExecutionRepository, WorkflowVersionRepository};
use crate::reliability::RetryPolicy;
use crate::subworkflow::{self, CallStack, WorkflowProvider};
use crate::task_executor::{render_input, TaskDefinitionProvider, TaskExecutor};
use crate::template::TemplateResolver;
use crate::versioning;

/// Per-execution-id bookkeeping for cooperative cancellation. `user_cancelled`
/// distinguishes an explicit `Cancel()` call (terminal status `Cancelled`)
/// from a workflow-timeout-triggered cancel (terminal status `Failed`,
/// error="workflow timeout") even though both cancel the same token.
struct ExecutionControl {
    token: CancellationToken,
    user_cancelled: AtomicBool,
}

/// Engine embed contract result (spec §7: "an ExecutionResult always carries
/// `{success, status, output?, error?, errors?, taskDetails[]}`").
#[derive(Debug, Clone)]
pub struct ExecutionResult {
    pub success: bool,
    pub status: ExecutionStatus,
    pub execution_id: Uuid,
    pub output: Option<Value>,
    pub error: Option<String>,
    pub errors: Vec<String>,
    pub task_details: Vec<TaskExecutionRecord>,
}

impl ExecutionResult {
    fn from_record(record: &ExecutionRecord, task_details: Vec<TaskExecutionRecord>) -> Self {
        Self {
            success: record.status == ExecutionStatus::Succeeded,
            status: record.status,
            execution_id: record.id,
            output: record.output.clone(),
            error: record.errors.first().cloned(),
            errors: record.errors.clone(),
            task_details,
        }
    }
}

/// The outcome of dispatching one step body (leaf task, switch, or
/// sub-workflow), before it is wrapped with timestamps into a
/// [`TaskExecutionRecord`] by the caller.
struct StepOutcome {
    status: TaskExecutionStatus,
    output: Value,
    error: Option<String>,
    retry_count: u32,
    /// The resolved task-ref actually invoked (or the step's declared label
    /// when nothing was resolved, e.g. a condition-skip), for the persisted
    /// trace record.
    task_ref: String,
    input_snapshot: Value,
}

impl StepOutcome {
    fn skipped(task_ref: impl Into<String>) -> Self {
        Self {
            status: TaskExecutionStatus::Skipped,
            output: Value::Null,
            error: None,
            retry_count: 0,
            task_ref: task_ref.into(),
            input_snapshot: Value::Null,
        }
    }

    fn failed(task_ref: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            status: TaskExecutionStatus::Failed,
            output: Value::Null,
            error: Some(message.into()),
            retry_count: 0,
            task_ref: task_ref.into(),
            input_snapshot: Value::Null,
        }
    }

    fn from_task_outcome(task_ref: String, input_snapshot: Value, outcome: TaskOutcome) -> Self {
        Self {
            status: if outcome.success { TaskExecutionStatus::Succeeded } else { TaskExecutionStatus::Failed },
            output: outcome.output,
            error: outcome.error,
            retry_count: outcome.retry_count,
            task_ref,
            input_snapshot,
        }
    }
}

fn step_label(body: &StepBody) -> String {
    match body {
        StepBody::TaskRef { task_ref, .. } => task_ref.clone(),
        StepBody::WorkflowRef { workflow_ref, .. } => workflow_ref.clone(),
        StepBody::Switch { .. } => "switch".to_string(),
    }
}

/// `false, null, 0, "", [], {}` are falsey; everything else,
/// including non-zero numbers and non-empty containers, is truthy.
fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(true),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn type_matches(declared: &str, value: &Value) -> bool {
    match declared {
        "string" => value.is_string(),
        "number" => value.is_number(),
        "integer" => value.is_i64() || value.is_u64(),
        "boolean" => value.is_boolean(),
        "object" => value.is_object(),
        "array" => value.is_array(),
        // Unrecognized declared type: accept rather than reject, since this
        // engine does not implement the full JSON Schema type vocabulary.
        _ => true,
    }
}

/// Validates `input` against the workflow's declared input schema (spec §4.6
/// step 1). Returns the first violation found; schema keys are iterated in
/// `BTreeMap` (sorted) order so the reported error is deterministic.
fn validate_input(schema: &BTreeMap<String, InputProperty>, input: &Value) -> Result<(), String> {
    let obj = input.as_object();
    for (key, property) in schema {
        let found = obj.and_then(|o| o.get(key));
        match found {
            None | Some(Value::Null) if property.required => {
                return Err(format!("missing required input '{key}'"));
            }
            Some(value) if !value.is_null() && !type_matches(&property.property_type, value) => {
                return Err(format!("input '{key}' expected type '{}', got {}", property.property_type, json_type_name(value)));
            }
            _ => {}
        }
    }
    Ok(())
}

/// Drives a workflow definition against registered collaborators: task
/// lookup, sub-workflow lookup, persistence, and event publication.
pub struct Orchestrator {
    config: EngineConfig,
    tasks: Arc<dyn TaskDefinitionProvider>,
    workflows: Arc<dyn WorkflowProvider>,
    execution_repo: Arc<dyn ExecutionRepository>,
    task_execution_repo: Arc<dyn TaskExecutionRepository>,
    version_repo: Arc<dyn WorkflowVersionRepository>,
    executor: Arc<TaskExecutor>,
    resolver: Arc<TemplateResolver>,
    events: EventPublisher,
    concurrency: Arc<Semaphore>,
    controls: DashMap<Uuid, Arc<ExecutionControl>>,
    env: Value,
}

impl Orchestrator {
    pub fn new(
        config: EngineConfig,
        tasks: Arc<dyn TaskDefinitionProvider>,
        workflows: Arc<dyn WorkflowProvider>,
        execution_repo: Arc<dyn ExecutionRepository>,
        task_execution_repo: Arc<dyn TaskExecutionRepository>,
        version_repo: Arc<dyn WorkflowVersionRepository>,
        executor: Arc<TaskExecutor>,
    ) -> Self {
        let resolver = executor.resolver.clone();
        let concurrency = Arc::new(Semaphore::new(config.max_workflow_concurrency));
        let events = EventPublisher::new(config.event_queue_capacity);
        Self {
            config,
            tasks,
            workflows,
            execution_repo,
            task_execution_repo,
            version_repo,
            executor,
            resolver,
            events,
            concurrency,
            controls: DashMap::new(),
            env: Value::Object(Default::default()),
        }
    }

    pub fn with_env(mut self, env: Value) -> Self {
        self.env = env;
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn events(&self) -> &EventPublisher {
        &self.events
    }

    /// `Execute(workflowRef, input, options) -> ExecutionResult`.
    #[instrument(skip(self, workflow, input), fields(workflow_name = %workflow.metadata.name))]
    pub fn execute(&self, workflow: &WorkflowResource, input: Value) -> BoxFuture<'_, ExecutionResult> {
        self.execute_inner(workflow.clone(), input, None, CallStack::new())
    }

    /// `Cancel(executionId) -> void`. Cooperative: in-flight task
    /// units observe the cancellation at their next await point.
    pub fn cancel(&self, execution_id: Uuid) {
        if let Some(control) = self.controls.get(&execution_id) {
            control.user_cancelled.store(true, Ordering::SeqCst);
            control.token.cancel();
            info!(%execution_id, "execution cancelled");
        }
    }

    fn execute_inner(&self, workflow: WorkflowResource, input: Value, parent_execution_id: Option<Uuid>, call_stack: CallStack) -> BoxFuture<'_, ExecutionResult> {
        async move {
            let execution_id = Uuid::now_v7();
            let control = Arc::new(ExecutionControl {
                token: CancellationToken::new(),
                user_cancelled: AtomicBool::new(false),
            });
            self.controls.insert(execution_id, control.clone());

            let result = self.run_execution(&workflow, input, parent_execution_id, call_stack, execution_id, &control).await;

            self.controls.remove(&execution_id);
            result
        }
        .boxed()
    }

    async fn run_execution(
        &self,
        workflow: &WorkflowResource,
        input: Value,
        parent_execution_id: Option<Uuid>,
        call_stack: CallStack,
        execution_id: Uuid,
        control: &Arc<ExecutionControl>,
    ) -> ExecutionResult {
        let mut record = ExecutionRecord::start(workflow.metadata.name.clone(), workflow.metadata.namespace.clone(), input.clone(), parent_execution_id);
        record.id = execution_id;

        if let Err(message) = validate_input(&workflow.input_schema, &input) {
            record.terminate(ExecutionStatus::Failed, None, vec![format!("input validation: {message}")]);
            self.save_execution_terminal(&record).await;
            return ExecutionResult::from_record(&record, Vec::new());
        }

        let build = build_graph(&workflow.tasks);
        let Some(graph) = build.graph else {
            let messages: Vec<String> = build.errors.iter().map(|e| format!("graph build: {e}")).collect();
            record.terminate(ExecutionStatus::Failed, None, messages);
            self.save_execution_terminal(&record).await;
            return ExecutionResult::from_record(&record, Vec::new());
        };

        if let Err(e) = self.execution_repo.save(&record).await {
            warn!(%execution_id, error = %e, "failed to persist execution start (continuing in-memory)");
        }
        self.events.emit(Event::WorkflowStarted {
            execution_id,
            workflow_name: workflow.metadata.name.clone(),
            timestamp: record.started_at,
        });

        if let Err(e) = versioning::create_version_if_changed(workflow, &*self.version_repo).await {
            warn!(workflow = %workflow.metadata.name, error = %e, "versioning failed (best-effort, execution continues)");
        }

        let drive = self.drive_levels(workflow, &graph, input, call_stack, execution_id, control);
        let (task_details, failed_errors, workflow_failed, timed_out, rendered_output) = match self.config.workflow_timeout {
            Some(timeout) => match tokio::time::timeout(timeout, drive).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    control.token.cancel();
                    (Vec::new(), vec!["workflow timeout".to_string()], true, true, None)
                }
            },
            None => drive.await,
        };

        if control.user_cancelled.load(Ordering::SeqCst) {
            record.terminate(ExecutionStatus::Cancelled, None, failed_errors);
        } else if timed_out {
            record.terminate(ExecutionStatus::Failed, None, failed_errors);
        } else if workflow_failed {
            record.terminate(ExecutionStatus::Failed, None, failed_errors);
        } else {
            record.terminate(ExecutionStatus::Succeeded, rendered_output, Vec::new());
        }

        self.save_execution_terminal(&record).await;
        self.events.emit(Event::WorkflowCompleted {
            execution_id,
            workflow_name: workflow.metadata.name.clone(),
            status: record.status,
            output: record.output.clone(),
            duration_ms: record.duration_ms.unwrap_or(0),
            timestamp: record.completed_at.unwrap_or_else(Utc::now),
        });

        ExecutionResult::from_record(&record, task_details)
    }

    /// Levels 0..=max, fanning each level out concurrently and joining before
    /// advancing (spec §4.6 step 5). Returns once the workflow either
    /// completes all levels or a non-skipped failure stops further
    /// scheduling (fail-fast, spec §4.6 step 7).
    async fn drive_levels(
        &self,
        workflow: &WorkflowResource,
        graph: &Graph,
        input: Value,
        call_stack: CallStack,
        execution_id: Uuid,
        control: &Arc<ExecutionControl>,
    ) -> (Vec<TaskExecutionRecord>, Vec<String>, bool, bool, Option<Value>) {
        let mut ctx = ExecutionContext::new(input, self.env.clone());
        let mut all_task_details = Vec::new();
        let mut failed_errors = Vec::new();
        let mut workflow_failed = false;

        let Some(max_level) = graph.levels.values().copied().max() else {
            return self.finalize_success_output(workflow, &ctx, all_task_details, failed_errors, workflow_failed).await;
        };

        for level in 0..=max_level {
            if control.token.is_cancelled() {
                break;
            }

            let mut ids: Vec<&String> = graph.levels.iter().filter(|(_, l)| **l == level).map(|(id, _)| id).collect();
            ids.sort();

            let results = futures::future::join_all(ids.iter().map(|id| self.run_task_at_level(id, workflow, graph, &ctx, &call_stack, execution_id, control))).await;

            for (id, outcome, record) in results {
                all_task_details.push(record);
                match outcome.status {
                    TaskExecutionStatus::Succeeded => {
                        ctx.tasks.insert(
                            id,
                            TaskOutcome {
                                output: outcome.output,
                                success: true,
                                started_at: all_task_details.last().unwrap().started_at,
                                completed_at: all_task_details.last().unwrap().completed_at,
                                retry_count: outcome.retry_count,
                                error: None,
                            },
                        );
                    }
                    TaskExecutionStatus::Failed => {
                        let started_at = all_task_details.last().unwrap().started_at;
                        let completed_at = all_task_details.last().unwrap().completed_at;
                        ctx.tasks.insert(
                            id.clone(),
                            TaskOutcome {
                                output: outcome.output,
                                success: false,
                                started_at,
                                completed_at,
                                retry_count: outcome.retry_count,
                                error: outcome.error.clone(),
                            },
                        );
                        workflow_failed = true;
                        failed_errors.push(outcome.error.unwrap_or_else(|| format!("task '{id}' failed")));
                    }
                    TaskExecutionStatus::Skipped => {
                        // No context entry: downstream template lookups miss
                        // and resolve to null, per spec §4.4.
                    }
                }
            }

            if workflow_failed {
                break;
            }
        }

        if workflow_failed {
            (all_task_details, failed_errors, true, false, None)
        } else {
            self.finalize_success_output(workflow, &ctx, all_task_details, failed_errors, false).await
        }
    }

    /// Render the workflow-level `output` mapping (spec §4.6 step 8) once
    /// every level has completed successfully. A template error here fails
    /// the whole workflow rather than silently producing a partial output.
    async fn finalize_success_output(
        &self,
        workflow: &WorkflowResource,
        ctx: &ExecutionContext,
        all_task_details: Vec<TaskExecutionRecord>,
        failed_errors: Vec<String>,
        workflow_failed: bool,
    ) -> (Vec<TaskExecutionRecord>, Vec<String>, bool, bool, Option<Value>) {
        match render_input(&self.resolver, &workflow.output, ctx) {
            Ok(map) => (all_task_details, failed_errors, workflow_failed, false, Some(Value::Object(map))),
            Err(e) => (all_task_details, vec![format!("output rendering: {e}")], true, false, None),
        }
    }

    #[instrument(skip(self, workflow, graph, ctx, call_stack, control), fields(task_id = %id))]
    async fn run_task_at_level(
        &self,
        id: &str,
        workflow: &WorkflowResource,
        graph: &Graph,
        ctx: &ExecutionContext,
        call_stack: &CallStack,
        execution_id: Uuid,
        control: &Arc<ExecutionControl>,
    ) -> (String, StepOutcome, TaskExecutionRecord) {
        let _permit = self.concurrency.acquire().await.expect("semaphore is never closed");
        let step = workflow.task(id).expect("id came from this workflow's graph");
        let started_at = Utc::now();

        self.events.emit(Event::TaskStarted {
            execution_id,
            task_id: id.to_string(),
            task_name: step_label(&step.body),
            timestamp: started_at,
        });

        let outcome = tokio::select! {
            biased;
            _ = control.token.cancelled() => StepOutcome::failed(step_label(&step.body), "cancelled"),
            o = self.run_step(step, ctx, call_stack, execution_id, &workflow.metadata.namespace) => o,
        };

        let completed_at = Utc::now();
        let duration_ms = (completed_at - started_at).num_milliseconds();

        let record = TaskExecutionRecord {
            id: Uuid::now_v7(),
            execution_id,
            task_id: id.to_string(),
            task_ref: outcome.task_ref.clone(),
            status: outcome.status,
            input: outcome.input_snapshot.clone(),
            output: outcome.output.clone(),
            errors: outcome.error.clone().into_iter().collect(),
            retry_count: outcome.retry_count,
            started_at,
            completed_at,
            duration_ms,
        };

        if let Err(e) = self.task_execution_repo.save(&record).await {
            warn!(%execution_id, task_id = %id, error = %e, "failed to persist task execution record (continuing in-memory)");
        }

        self.events.emit(Event::TaskCompleted {
            execution_id,
            task_id: id.to_string(),
            task_name: record.task_ref.clone(),
            status: record.status,
            output: record.output.clone(),
            duration_ms,
            timestamp: completed_at,
        });

        for dependent in graph.dependents_of(id) {
            self.events.emit(Event::SignalFlow {
                execution_id,
                from_task_id: id.to_string(),
                to_task_id: dependent.to_string(),
                timestamp: completed_at,
            });
        }

        (id.to_string(), outcome, record)
    }

    /// Dispatch one step: evaluate `condition` (skip when falsey), expand
    /// `forEach` (sequential or bounded-parallel), or run the body directly
    ///.
    async fn run_step(&self, step: &WorkflowTaskStep, ctx: &ExecutionContext, call_stack: &CallStack, execution_id: Uuid, namespace: &str) -> StepOutcome {
        if let Some(condition) = &step.condition {
            match self.resolver.resolve(&condition.if_expr, ctx) {
                Ok(resolved) => {
                    if !is_truthy(&resolved.into_value()) {
                        debug!(task_id = %step.id, "condition false, skipping");
                        return StepOutcome::skipped(step_label(&step.body));
                    }
                }
                Err(e) => return StepOutcome::failed(step_label(&step.body), e.to_string()),
            }
        }

        if let Some(for_each) = &step.for_each {
            return self.run_for_each(step, for_each, ctx, call_stack, execution_id, namespace).await;
        }

        self.run_body(&step.body, ctx, call_stack, execution_id, namespace, step.timeout, step.retry.as_ref()).await
    }

    async fn run_for_each(&self, step: &WorkflowTaskStep, for_each: &ForEachSpec, ctx: &ExecutionContext, call_stack: &CallStack, execution_id: Uuid, namespace: &str) -> StepOutcome {
        let items_value = match self.resolver.resolve(&for_each.items, ctx) {
            Ok(resolved) => resolved.into_value(),
            Err(e) => return StepOutcome::failed(step_label(&step.body), e.to_string()),
        };

        let items: Vec<Value> = match items_value {
            Value::Array(items) => items,
            Value::Null => Vec::new(),
            other => return StepOutcome::failed(step_label(&step.body), format!("forEach items resolved to non-array value: {other}")),
        };

        if items.is_empty() {
            return StepOutcome {
                status: TaskExecutionStatus::Succeeded,
                output: Value::Array(Vec::new()),
                error: None,
                retry_count: 0,
                task_ref: step_label(&step.body),
                input_snapshot: Value::Array(Vec::new()),
            };
        }

        let label = step_label(&step.body);

        if for_each.parallel {
            let max = for_each.max_concurrency.unwrap_or(items.len()).max(1);
            let abort = Arc::new(AtomicBool::new(false));

            let mut results: Vec<(usize, StepOutcome)> = stream::iter(items.into_iter().enumerate())
                .map(|(index, item)| {
                    let abort = abort.clone();
                    let child_ctx = ctx.with_loop_binding(item, index);
                    async move {
                        if abort.load(Ordering::SeqCst) {
                            return (index, StepOutcome::failed(step_label(&step.body), "cancelled: a sibling iteration failed"));
                        }
                        let outcome = self.run_body(&step.body, &child_ctx, call_stack, execution_id, namespace, step.timeout, step.retry.as_ref()).await;
                        if outcome.status == TaskExecutionStatus::Failed {
                            abort.store(true, Ordering::SeqCst);
                        }
                        (index, outcome)
                    }
                })
                .buffer_unordered(max)
                .collect()
                .await;

            results.sort_by_key(|(index, _)| *index);

            if let Some((_, failure)) = results.iter().find(|(_, o)| o.status == TaskExecutionStatus::Failed) {
                return StepOutcome::failed(label, failure.error.clone().unwrap_or_else(|| "forEach iteration failed".to_string()));
            }

            let outputs: Vec<Value> = results.into_iter().map(|(_, o)| o.output).collect();
            StepOutcome {
                status: TaskExecutionStatus::Succeeded,
                output: Value::Array(outputs),
                error: None,
                retry_count: 0,
                task_ref: label,
                input_snapshot: Value::Null,
            }
        } else {
            let mut outputs = Vec::new();
            let mut failure: Option<String> = None;

            for (index, item) in items.into_iter().enumerate() {
                let child_ctx = ctx.with_loop_binding(item, index);
                let outcome = self.run_body(&step.body, &child_ctx, call_stack, execution_id, namespace, step.timeout, step.retry.as_ref()).await;
                if outcome.status == TaskExecutionStatus::Failed {
                    failure = Some(outcome.error.unwrap_or_else(|| "forEach iteration failed".to_string()));
                    break;
                }
                outputs.push(outcome.output);
            }

            match failure {
                Some(message) => StepOutcome::failed(label, message),
                None => StepOutcome {
                    status: TaskExecutionStatus::Succeeded,
                    output: Value::Array(outputs),
                    error: None,
                    retry_count: 0,
                    task_ref: label,
                    input_snapshot: Value::Null,
                },
            }
        }
    }

    async fn run_body(
        &self,
        body: &StepBody,
        ctx: &ExecutionContext,
        call_stack: &CallStack,
        execution_id: Uuid,
        namespace: &str,
        step_timeout: Option<Duration>,
        step_retry: Option<&RetryPolicy>,
    ) -> StepOutcome {
        match body {
            StepBody::TaskRef { task_ref, input } => match self.tasks.lookup(task_ref).await {
                Some(def) => {
                    let snapshot = render_input(&self.resolver, input, ctx).map(|m| Value::Object(m)).unwrap_or(Value::Null);
                    let outcome = self.executor.invoke(&def, input, ctx, step_timeout, step_retry).await;
                    StepOutcome::from_task_outcome(task_ref.clone(), snapshot, outcome)
                }
                None => StepOutcome::failed(task_ref.clone(), format!("unknown task ref '{task_ref}'")),
            },
            StepBody::Switch { value, cases, default } => {
                let resolved = match self.resolver.resolve(value, ctx) {
                    Ok(r) => r.as_str_lossy(),
                    Err(e) => return StepOutcome::failed("switch", e.to_string()),
                };
                let chosen = cases.iter().find(|c| c.match_value == resolved).map(|c| c.task_ref.clone()).or_else(|| default.clone());
                match chosen {
                    Some(task_ref) => match self.tasks.lookup(&task_ref).await {
                        Some(def) => {
                            let outcome = self.executor.invoke(&def, &BTreeMap::new(), ctx, step_timeout, step_retry).await;
                            StepOutcome::from_task_outcome(task_ref, Value::Null, outcome)
                        }
                        None => StepOutcome::failed(task_ref.clone(), format!("unknown task ref '{task_ref}'")),
                    },
                    None => StepOutcome::skipped("switch"),
                }
            }
            StepBody::WorkflowRef { workflow_ref, input } => {
                let rendered = match render_input(&self.resolver, input, ctx) {
                    Ok(map) => Value::Object(map),
                    Err(e) => return StepOutcome::failed(workflow_ref.clone(), e.to_string()),
                };

                let available = self.workflows.list(None).await;
                let target = match subworkflow::resolve(workflow_ref, namespace, &available) {
                    Ok(t) => t.clone(),
                    Err(e) => return StepOutcome::failed(workflow_ref.clone(), e.to_string()),
                };

                let hash = versioning::calculate_version_hash(&target).unwrap_or_default();
                let frame = format!("{}/{}@{}", target.metadata.namespace, target.metadata.name, hash);
                let next_stack = match call_stack.enter(frame) {
                    Ok(stack) => stack,
                    Err(e) => return StepOutcome::failed(workflow_ref.clone(), e.to_string()),
                };

                let run = self.execute_inner(target, rendered.clone(), Some(execution_id), next_stack);
                let result = match step_timeout {
                    Some(d) => match tokio::time::timeout(d, run).await {
                        Ok(r) => r,
                        Err(_) => return StepOutcome::failed(workflow_ref.clone(), "sub-workflow timed out"),
                    },
                    None => run.await,
                };

                match result.status {
                    ExecutionStatus::Succeeded => StepOutcome::from_task_outcome(
                        workflow_ref.clone(),
                        rendered,
                        TaskOutcome {
                            output: result.output.unwrap_or(Value::Null),
                            success: true,
                            started_at: Utc::now(),
                            completed_at: Utc::now(),
                            retry_count: 0,
                            error: None,
                        },
                    ),
                    // Open question (b), resolved per spec §9: a cancelled
                    // child is reported to the parent as a failed task.
                    ExecutionStatus::Cancelled => StepOutcome::failed(workflow_ref.clone(), "cancelled"),
                    _ => StepOutcome::failed(workflow_ref.clone(), result.error.unwrap_or_else(|| "sub-workflow failed".to_string())),
                }
            }
        }
    }

    /// Terminal write with bounded retry (spec §4.9: "a completed execution
    /// retries its final write with bounded backoff"; non-terminal writes
    /// just log and continue in-memory).
    async fn save_execution_terminal(&self, record: &ExecutionRecord) {
        let mut attempt: u32 = 0;
        loop {
            match self.execution_repo.save(record).await {
                Ok(()) => return,
                Err(e) => {
                    attempt += 1;
                    if attempt >= 3 {
                        error!(execution_id = %record.id, error = %e, "terminal execution write failed after retries, giving up");
                        return;
                    }
                    warn!(execution_id = %record.id, attempt, error = %e, "retrying terminal execution write");
                    tokio::time::sleep(Duration::from_millis(50 * attempt as u64)).await;
                }
            }
        }
    }
}
