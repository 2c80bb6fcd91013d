//! Engine-wide tunables
//!
//! Plain struct with a `Default` impl and `with_*` builders: no config
//! framework, just a struct the embedding binary can override from its own
//! environment/file loading before constructing the orchestrator.

use std::time::Duration;

/// Engine-wide tunables
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Global bound on concurrently in-flight task units across levels (§4.6)
    pub max_workflow_concurrency: usize,

    /// Effective timeout when neither the step nor the task definition set one (§5)
    pub default_task_timeout: Duration,

    /// Optional overall workflow wall-clock budget (§5)
    pub workflow_timeout: Option<Duration>,

    /// Bounded queue depth per event subscription before oldest events are dropped (§4.10)
    pub event_queue_capacity: usize,

    /// Maximum call-stack depth for sub-workflow composition, a backstop
    /// above the cycle guard (§4.7) for accidental deep legitimate nesting
    pub max_subworkflow_depth: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_workflow_concurrency: 32,
            default_task_timeout: Duration::from_secs(30),
            workflow_timeout: None,
            event_queue_capacity: 1024,
            max_subworkflow_depth: 32,
        }
    }
}

impl EngineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_workflow_concurrency(mut self, n: usize) -> Self {
        self.max_workflow_concurrency = n.max(1);
        self
    }

    pub fn with_default_task_timeout(mut self, d: Duration) -> Self {
        self.default_task_timeout = d;
        self
    }

    pub fn with_workflow_timeout(mut self, d: Duration) -> Self {
        self.workflow_timeout = Some(d);
        self
    }

    pub fn with_event_queue_capacity(mut self, n: usize) -> Self {
        self.event_queue_capacity = n.max(1);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec() {
        let cfg = EngineConfig::default();
        assert_eq!(cfg.max_workflow_concurrency, 32);
        assert_eq!(cfg.default_task_timeout, Duration::from_secs(30));
        assert!(cfg.workflow_timeout.is_none());
    }

    #[test]
    fn builder_clamps_zero_concurrency() {
        let cfg = EngineConfig::new().with_max_workflow_concurrency(0);
        assert_eq!(cfg.max_workflow_concurrency, 1);
    }
}
