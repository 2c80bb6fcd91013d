//! Single-task-instance invocation
//!
//! Dispatches one `taskRef` step: render its HTTP request template through
//! the [`TemplateResolver`], invoke it through an [`HttpInvoker`], and wrap
//! the call in retry + circuit-breaker per §4.5. `workflowRef`/`condition`/
//! `switch`/`forEach` expansion is the orchestrator's job (§4.6) — it needs
//! the call stack and recursive `Execute`, which only it owns — so this
//! module covers the leaf invocation only: a single HTTP call or transform
//! pipeline run.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde_json::{Map, Value};
use tracing::{debug, instrument, warn};

use crate::error::{ErrorCode, HasErrorCode};
use crate::model::{ExecutionContext, HttpRequestTemplate, TaskDefinition, TaskKind, TaskOutcome};
use crate::reliability::{is_retryable_status, CircuitBreakerConfig, CircuitBreakerRegistry, Decision, RetryPolicy};
use crate::template::{TemplateError, TemplateResolver};
use crate::transform::{execute_pipeline, TransformError};

#[derive(Debug, thiserror::Error)]
pub enum TaskExecError {
    #[error(transparent)]
    Template(#[from] TemplateError),
    #[error(transparent)]
    Transform(#[from] TransformError),
    #[error("task timed out after {0:?}")]
    Timeout(Duration),
    #[error("task invocation failed: {0}")]
    Failed(String),
    #[error("circuit open for task-ref '{0}'")]
    CircuitOpen(String),
    #[error("retry exhausted after {attempts} attempts: {last_error}")]
    RetryExhausted { attempts: u32, last_error: String },
}

impl HasErrorCode for TaskExecError {
    fn code(&self) -> ErrorCode {
        match self {
            TaskExecError::Template(_) => ErrorCode::TemplateError,
            TaskExecError::Transform(_) => ErrorCode::TaskFailed,
            TaskExecError::Timeout(_) => ErrorCode::TaskTimeout,
            TaskExecError::Failed(_) => ErrorCode::TaskFailed,
            TaskExecError::CircuitOpen(_) => ErrorCode::CircuitOpen,
            TaskExecError::RetryExhausted { .. } => ErrorCode::RetryExhausted,
        }
    }
}

/// An HTTP response as seen by the retry loop
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub body: Value,
    /// `Retry-After`, parsed as seconds, when the response carried one
    pub retry_after: Option<Duration>,
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum HttpInvokeError {
    #[error("network error: {0}")]
    Network(String),
}

/// Abstracts the actual network call so the executor is testable without a
/// socket, and so it can be swapped for a recording/fake invoker in tests.
#[async_trait]
pub trait HttpInvoker: Send + Sync {
    async fn invoke(&self, method: &str, url: &str, headers: &BTreeMap<String, String>, body: &Value) -> Result<HttpResponse, HttpInvokeError>;
}

/// Default invoker backed by `reqwest`.
pub struct ReqwestInvoker {
    client: reqwest::Client,
}

impl ReqwestInvoker {
    pub fn new() -> Self {
        Self { client: reqwest::Client::new() }
    }
}

impl Default for ReqwestInvoker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl HttpInvoker for ReqwestInvoker {
    async fn invoke(&self, method: &str, url: &str, headers: &BTreeMap<String, String>, body: &Value) -> Result<HttpResponse, HttpInvokeError> {
        let method = reqwest::Method::from_bytes(method.to_ascii_uppercase().as_bytes()).map_err(|e| HttpInvokeError::Network(e.to_string()))?;
        let mut request = self.client.request(method, url);
        for (k, v) in headers {
            request = request.header(k, v);
        }
        if !body.is_null() {
            request = request.json(body);
        }

        let response = request.send().await.map_err(|e| HttpInvokeError::Network(e.to_string()))?;
        let status = response.status().as_u16();
        let retry_after = response
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok())
            .map(Duration::from_secs);

        let body = response.json::<Value>().await.unwrap_or(Value::Null);
        Ok(HttpResponse { status, body, retry_after })
    }
}

/// Lookup contract for registered task definitions (spec §6:
/// `TaskDefinitionProvider.Lookup(name) -> TaskDefinition | NotFound`).
#[async_trait]
pub trait TaskDefinitionProvider: Send + Sync {
    async fn lookup(&self, name: &str) -> Option<TaskDefinition>;
}

/// In-memory registry sufficient for embedding and for `waypoint-cli`.
#[derive(Debug, Default)]
pub struct StaticTaskRegistry {
    tasks: std::collections::HashMap<String, TaskDefinition>,
}

impl StaticTaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_task(mut self, def: TaskDefinition) -> Self {
        self.tasks.insert(def.name.clone(), def);
        self
    }
}

#[async_trait]
impl TaskDefinitionProvider for StaticTaskRegistry {
    async fn lookup(&self, name: &str) -> Option<TaskDefinition> {
        self.tasks.get(name).cloned()
    }
}

/// Renders a step's `input` map against the execution context into a JSON object.
pub fn render_input(resolver: &TemplateResolver, input: &BTreeMap<String, String>, ctx: &ExecutionContext) -> Result<Map<String, Value>, TemplateError> {
    let mut rendered = Map::new();
    for (key, template) in input {
        rendered.insert(key.clone(), resolver.resolve(template, ctx)?.into_value());
    }
    Ok(rendered)
}

fn render_request(resolver: &TemplateResolver, request: &HttpRequestTemplate, resolved_input: &Map<String, Value>, ctx: &ExecutionContext) -> Result<(String, String, BTreeMap<String, String>, Value), TemplateError> {
    let url = resolver.resolve(&request.url, ctx)?.as_str_lossy();
    let mut headers = BTreeMap::new();
    for (k, template) in &request.headers {
        headers.insert(k.clone(), resolver.resolve(template, ctx)?.as_str_lossy());
    }
    let body = match &request.body {
        Some(template) => resolver.resolve(template, ctx)?.into_value(),
        None => Value::Object(resolved_input.clone()),
    };
    Ok((request.method.clone(), url, headers, body))
}

/// Executes a single `taskRef` invocation: render, dispatch by [`TaskKind`],
/// retry + circuit-break around the attempt loop. Returns a [`TaskOutcome`]
/// whose `success` flag and `error` string carry the terminal result; the
/// caller (orchestrator) is responsible for turning that into a
/// [`crate::model::TaskExecutionRecord`].
pub struct TaskExecutor {
    pub http: Arc<dyn HttpInvoker>,
    pub resolver: Arc<TemplateResolver>,
    pub circuits: Arc<CircuitBreakerRegistry>,
    pub default_timeout: Duration,
}

impl TaskExecutor {
    pub fn new(circuits: Arc<CircuitBreakerRegistry>, default_timeout: Duration) -> Self {
        Self {
            http: Arc::new(ReqwestInvoker::new()),
            resolver: Arc::new(TemplateResolver::new()),
            circuits,
            default_timeout,
        }
    }

    pub fn with_invoker(mut self, invoker: Arc<dyn HttpInvoker>) -> Self {
        self.http = invoker;
        self
    }

    pub fn with_resolver(mut self, resolver: Arc<TemplateResolver>) -> Self {
        self.resolver = resolver;
        self
    }

    #[instrument(skip(self, task_def, input, ctx, step_retry), fields(task_ref = %task_def.name))]
    pub async fn invoke(
        &self,
        task_def: &TaskDefinition,
        input: &BTreeMap<String, String>,
        ctx: &ExecutionContext,
        step_timeout: Option<Duration>,
        step_retry: Option<&RetryPolicy>,
    ) -> TaskOutcome {
        let started_at = Utc::now();
        let timeout = step_timeout.or(task_def.timeout).unwrap_or(self.default_timeout);
        let policy = step_retry.or(task_def.retry.as_ref()).cloned().unwrap_or_else(|| RetryPolicy::no_retry());
        let circuit_config = task_def.circuit_breaker.clone().unwrap_or_default();

        let resolved_input = match render_input(&self.resolver, input, ctx) {
            Ok(v) => v,
            Err(e) => return failed_outcome(started_at, 0, e.to_string()),
        };

        let mut attempts_made: u32 = 0;
        let mut last_error = String::new();
        let mut rng = StdRng::from_entropy();

        loop {
            if self.circuits.try_acquire(&task_def.name, &circuit_config) == Decision::Deny {
                warn!(task_ref = %task_def.name, "circuit open, refusing invocation");
                return failed_outcome(started_at, attempts_made, TaskExecError::CircuitOpen(task_def.name.clone()).to_string());
            }

            attempts_made += 1;
            let attempt_result = self.attempt(task_def, &resolved_input, ctx, timeout).await;

            match attempt_result {
                Ok(output) => {
                    self.circuits.record_success(&task_def.name, &circuit_config);
                    debug!(task_ref = %task_def.name, attempts_made, "task succeeded");
                    return TaskOutcome {
                        output,
                        success: true,
                        started_at,
                        completed_at: Utc::now(),
                        retry_count: attempts_made - 1,
                        error: None,
                    };
                }
                Err(AttemptError { message, retryable, retry_after }) => {
                    self.circuits.record_failure(&task_def.name, &circuit_config);
                    last_error = message;

                    if retryable && policy.has_attempts_remaining(attempts_made) {
                        let delay = retry_after.unwrap_or_else(|| policy.delay_for_attempt(attempts_made, &mut rng));
                        debug!(task_ref = %task_def.name, attempts_made, ?delay, "retrying after failure");
                        tokio::time::sleep(delay).await;
                        continue;
                    }

                    let err = if retryable && attempts_made > 1 {
                        TaskExecError::RetryExhausted {
                            attempts: attempts_made,
                            last_error: last_error.clone(),
                        }
                    } else {
                        TaskExecError::Failed(last_error.clone())
                    };
                    return failed_outcome(started_at, attempts_made - 1, err.to_string());
                }
            }
        }
    }

    async fn attempt(&self, task_def: &TaskDefinition, resolved_input: &Map<String, Value>, ctx: &ExecutionContext, timeout: Duration) -> Result<Value, AttemptError> {
        match &task_def.kind {
            TaskKind::Http(request) => self.attempt_http(request, resolved_input, ctx, timeout).await,
            TaskKind::Transform { pipeline } => attempt_transform(pipeline, resolved_input),
        }
    }

    async fn attempt_http(&self, request: &HttpRequestTemplate, resolved_input: &Map<String, Value>, ctx: &ExecutionContext, timeout: Duration) -> Result<Value, AttemptError> {
        let (method, url, headers, body) = render_request(&self.resolver, request, resolved_input, ctx).map_err(|e| AttemptError::terminal(e.to_string()))?;

        let call = self.http.invoke(&method, &url, &headers, &body);
        let outcome = tokio::time::timeout(timeout, call).await;

        match outcome {
            Err(_elapsed) => Err(AttemptError::retryable(TaskExecError::Timeout(timeout).to_string(), None)),
            Ok(Err(HttpInvokeError::Network(msg))) => Err(AttemptError::retryable(msg, None)),
            Ok(Ok(response)) if (200..300).contains(&response.status) => Ok(response.body),
            Ok(Ok(response)) => {
                let retryable = is_retryable_status(response.status);
                let message = format!("HTTP {} from {}", response.status, url);
                if retryable {
                    Err(AttemptError::retryable(message, response.retry_after))
                } else {
                    Err(AttemptError::terminal(message))
                }
            }
        }
    }
}

fn attempt_transform(pipeline: &[crate::transform::operators::Operator], resolved_input: &Map<String, Value>) -> Result<Value, AttemptError> {
    let items = resolved_input.get("items").cloned().unwrap_or(Value::Array(Vec::new()));
    execute_pipeline(pipeline, items).map_err(|e| AttemptError::terminal(e.to_string()))
}

struct AttemptError {
    message: String,
    retryable: bool,
    retry_after: Option<Duration>,
}

impl AttemptError {
    fn retryable(message: String, retry_after: Option<Duration>) -> Self {
        Self {
            message,
            retryable: true,
            retry_after,
        }
    }

    fn terminal(message: String) -> Self {
        Self {
            message,
            retryable: false,
            retry_after: None,
        }
    }
}

fn failed_outcome(started_at: chrono::DateTime<Utc>, retry_count: u32, error: String) -> TaskOutcome {
    TaskOutcome {
        output: Value::Null,
        success: false,
        started_at,
        completed_at: Utc::now(),
        retry_count,
        error: Some(error),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct ScriptedInvoker {
        responses: Vec<Result<HttpResponse, HttpInvokeError>>,
        calls: AtomicUsize,
    }

    impl ScriptedInvoker {
        fn new(responses: Vec<Result<HttpResponse, HttpInvokeError>>) -> Self {
            Self {
                responses,
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl HttpInvoker for ScriptedInvoker {
        async fn invoke(&self, _method: &str, _url: &str, _headers: &BTreeMap<String, String>, _body: &Value) -> Result<HttpResponse, HttpInvokeError> {
            let idx = self.calls.fetch_add(1, Ordering::SeqCst);
            self.responses.get(idx).cloned().unwrap_or_else(|| {
                Ok(HttpResponse {
                    status: 500,
                    body: Value::Null,
                    retry_after: None,
                })
            })
        }
    }

    fn task_def(name: &str, retry: Option<RetryPolicy>) -> TaskDefinition {
        TaskDefinition {
            name: name.to_string(),
            kind: TaskKind::Http(HttpRequestTemplate {
                method: "GET".to_string(),
                url: "http://svc/{{input.id}}".to_string(),
                headers: BTreeMap::new(),
                body: None,
            }),
            retry,
            timeout: Some(Duration::from_millis(200)),
            circuit_breaker: None,
        }
    }

    #[tokio::test]
    async fn succeeds_on_first_attempt() {
        let invoker = Arc::new(ScriptedInvoker::new(vec![Ok(HttpResponse {
            status: 200,
            body: json!({"email": "a@x"}),
            retry_after: None,
        })]));
        let executor = TaskExecutor::new(Arc::new(CircuitBreakerRegistry::new()), Duration::from_secs(1)).with_invoker(invoker);
        let ctx = ExecutionContext::new(json!({"id": "u1"}), json!({}));
        let mut input = BTreeMap::new();
        input.insert("id".to_string(), "{{input.id}}".to_string());

        let outcome = executor.invoke(&task_def("fetch-user", None), &input, &ctx, None, None).await;
        assert!(outcome.success);
        assert_eq!(outcome.output, json!({"email": "a@x"}));
        assert_eq!(outcome.retry_count, 0);
    }

    #[tokio::test]
    async fn retries_on_5xx_then_succeeds() {
        let invoker = Arc::new(ScriptedInvoker::new(vec![
            Ok(HttpResponse {
                status: 503,
                body: Value::Null,
                retry_after: None,
            }),
            Ok(HttpResponse {
                status: 200,
                body: json!({"ok": true}),
                retry_after: None,
            }),
        ]));
        let policy = RetryPolicy::exponential(3, Duration::from_millis(1));
        let executor = TaskExecutor::new(Arc::new(CircuitBreakerRegistry::new()), Duration::from_secs(1)).with_invoker(invoker);
        let ctx = ExecutionContext::new(json!({"id": "u1"}), json!({}));

        let outcome = executor.invoke(&task_def("flaky", Some(policy)), &BTreeMap::new(), &ctx, None, None).await;
        assert!(outcome.success);
        assert_eq!(outcome.retry_count, 1);
    }

    #[tokio::test]
    async fn exhausts_retries_and_reports_retry_exhausted() {
        let invoker = Arc::new(ScriptedInvoker::new(vec![
            Ok(HttpResponse {
                status: 500,
                body: Value::Null,
                retry_after: None,
            });
            3
        ]));
        let policy = RetryPolicy::exponential(3, Duration::from_millis(1));
        let executor = TaskExecutor::new(Arc::new(CircuitBreakerRegistry::new()), Duration::from_secs(1)).with_invoker(invoker);
        let ctx = ExecutionContext::new(json!({}), json!({}));

        let outcome = executor.invoke(&task_def("flaky", Some(policy)), &BTreeMap::new(), &ctx, None, None).await;
        assert!(!outcome.success);
        assert!(outcome.error.unwrap().contains("retry exhausted"));
    }

    #[tokio::test]
    async fn non_retryable_4xx_fails_terminally_without_retry() {
        let invoker = Arc::new(ScriptedInvoker::new(vec![Ok(HttpResponse {
            status: 404,
            body: Value::Null,
            retry_after: None,
        })]));
        let policy = RetryPolicy::exponential(3, Duration::from_millis(1));
        let executor = TaskExecutor::new(Arc::new(CircuitBreakerRegistry::new()), Duration::from_secs(1)).with_invoker(invoker);
        let ctx = ExecutionContext::new(json!({}), json!({}));

        let outcome = executor.invoke(&task_def("missing", Some(policy)), &BTreeMap::new(), &ctx, None, None).await;
        assert!(!outcome.success);
        assert_eq!(outcome.retry_count, 0);
    }

    #[tokio::test]
    async fn open_circuit_refuses_without_http_call() {
        let invoker = Arc::new(ScriptedInvoker::new(vec![]));
        let circuits = Arc::new(CircuitBreakerRegistry::new());
        circuits.force_open("flaky");
        let executor = TaskExecutor::new(circuits, Duration::from_secs(1)).with_invoker(invoker.clone());
        let ctx = ExecutionContext::new(json!({}), json!({}));

        let outcome = executor.invoke(&task_def("flaky", None), &BTreeMap::new(), &ctx, None, None).await;
        assert!(!outcome.success);
        assert_eq!(outcome.error.unwrap(), TaskExecError::CircuitOpen("flaky".to_string()).to_string());
        assert_eq!(invoker.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn transform_pipeline_task_runs_pipeline_over_items() {
        let invoker = Arc::new(ScriptedInvoker::new(vec![]));
        let executor = TaskExecutor::new(Arc::new(CircuitBreakerRegistry::new()), Duration::from_secs(1)).with_invoker(invoker);
        let mut input = BTreeMap::new();
        input.insert("items".to_string(), "{{input.rows}}".to_string());
        let def = TaskDefinition {
            name: "count-active".to_string(),
            kind: TaskKind::Transform {
                pipeline: vec![crate::transform::operators::Operator::Aggregate {
                    op: crate::transform::operators::AggOp::Count,
                    field: None,
                }],
            },
            retry: None,
            timeout: None,
            circuit_breaker: None,
        };
        let ctx = ExecutionContext::new(json!({"rows": [{"a": 1}, {"a": 2}]}), json!({}));
        let outcome = executor.invoke(&def, &input, &ctx, None, None).await;
        assert!(outcome.success);
        assert_eq!(outcome.output, json!(2));
    }
}
