//! Stable error taxonomy shared across the engine
//!
//! Every component-specific error type exposes a [`code()`](HasErrorCode::code)
//! method returning one of these codes, so the orchestrator and any external
//! caller can do programmatic dispatch without matching on error message text.

use serde::{Deserialize, Serialize};

/// Stable, serializable error code
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    TemplateError,
    GraphCycle,
    UnknownTaskRef,
    DuplicateTaskId,
    InvalidStep,
    InputValidation,
    TaskTimeout,
    TaskFailed,
    CircuitOpen,
    RetryExhausted,
    SubworkflowNotFound,
    SubworkflowCyclic,
    CronInvalid,
    Cancelled,
    Persistence,
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::TemplateError => "TEMPLATE_ERROR",
            Self::GraphCycle => "GRAPH_CYCLE",
            Self::UnknownTaskRef => "UNKNOWN_TASK_REF",
            Self::DuplicateTaskId => "DUPLICATE_TASK_ID",
            Self::InvalidStep => "INVALID_STEP",
            Self::InputValidation => "INPUT_VALIDATION",
            Self::TaskTimeout => "TASK_TIMEOUT",
            Self::TaskFailed => "TASK_FAILED",
            Self::CircuitOpen => "CIRCUIT_OPEN",
            Self::RetryExhausted => "RETRY_EXHAUSTED",
            Self::SubworkflowNotFound => "SUBWORKFLOW_NOT_FOUND",
            Self::SubworkflowCyclic => "SUBWORKFLOW_CYCLIC",
            Self::CronInvalid => "CRON_INVALID",
            Self::Cancelled => "CANCELLED",
            Self::Persistence => "PERSISTENCE",
        };
        write!(f, "{s}")
    }
}

/// Implemented by every component error enum so callers can extract a stable code
pub trait HasErrorCode {
    fn code(&self) -> ErrorCode;
}

/// A problem-details-shaped, user-visible failure (mirrors §6's RFC 7807 wire note)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailureDetail {
    pub code: ErrorCode,
    pub detail: String,
    pub request_id: Option<String>,
}

impl FailureDetail {
    pub fn new(code: ErrorCode, detail: impl Into<String>) -> Self {
        Self {
            code,
            detail: detail.into(),
            request_id: None,
        }
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }
}

impl std::fmt::Display for FailureDetail {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code, self.detail)
    }
}
