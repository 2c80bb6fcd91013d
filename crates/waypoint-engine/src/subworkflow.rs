//! WorkflowRef grammar and sub-workflow cycle guard

use async_trait::async_trait;

use crate::error::{ErrorCode, HasErrorCode};
use crate::model::WorkflowResource;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SubworkflowError {
    #[error("workflow reference '{reference}' matched no registered workflow")]
    NotFound { reference: String },
    #[error("workflow reference '{reference}' matched more than one registered workflow")]
    MultipleMatches { reference: String },
    #[error("Cyclic sub-workflow composition: {}", .witness.join(" → "))]
    Cyclic { witness: Vec<String> },
}

impl HasErrorCode for SubworkflowError {
    fn code(&self) -> ErrorCode {
        match self {
            SubworkflowError::NotFound { .. } | SubworkflowError::MultipleMatches { .. } => ErrorCode::SubworkflowNotFound,
            SubworkflowError::Cyclic { .. } => ErrorCode::SubworkflowCyclic,
        }
    }
}

/// A parsed `name | name@version | namespace/name | namespace/name@version`
/// reference. Tie-break: the first `/` separates namespace from the rest;
/// the last `@` separates the version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkflowRef {
    pub namespace: Option<String>,
    pub name: String,
    pub version: Option<String>,
}

impl WorkflowRef {
    pub fn parse(raw: &str) -> Self {
        let (namespace, rest) = match raw.find('/') {
            Some(idx) => (Some(raw[..idx].to_string()), &raw[idx + 1..]),
            None => (None, raw),
        };
        let (name, version) = match rest.rfind('@') {
            Some(idx) => (rest[..idx].to_string(), Some(rest[idx + 1..].to_string())),
            None => (rest.to_string(), None),
        };
        WorkflowRef { namespace, name, version }
    }

    /// Namespace defaults to the parent's namespace if omitted.
    pub fn effective_namespace<'a>(&'a self, parent_namespace: &'a str) -> &'a str {
        self.namespace.as_deref().unwrap_or(parent_namespace)
    }
}

/// Resolve a reference against the set of workflows visible to the caller.
/// Returns the unique match, or fails with `NotFound`/`MultipleMatches`.
pub fn resolve<'a>(reference: &str, parent_namespace: &str, available: &'a [WorkflowResource]) -> Result<&'a WorkflowResource, SubworkflowError> {
    let parsed = WorkflowRef::parse(reference);
    let namespace = parsed.effective_namespace(parent_namespace);

    let matches: Vec<&WorkflowResource> = available
        .iter()
        .filter(|w| {
            w.metadata.namespace == namespace
                && w.metadata.name == parsed.name
                && parsed.version.as_ref().map_or(true, |v| w.version.as_deref() == Some(v.as_str()))
        })
        .collect();

    match matches.len() {
        1 => Ok(matches[0]),
        0 => Err(SubworkflowError::NotFound {
            reference: reference.to_string(),
        }),
        _ => Err(SubworkflowError::MultipleMatches {
            reference: reference.to_string(),
        }),
    }
}

/// Immutable call stack of `namespace/name@versionHash` frames, threaded
/// through recursive sub-workflow invocation. Each `enter` either returns a
/// stack extended with the new frame, or a `Cyclic` error citing the witness
/// cycle, so a forEach branch calling `enter` independently on a clone of
/// the parent stack gets its own cycle check (spec §9 open question (a):
/// each iteration extends the parent call stack independently).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallStack(Vec<String>);

impl CallStack {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn depth(&self) -> usize {
        self.0.len()
    }

    pub fn frames(&self) -> &[String] {
        &self.0
    }

    pub fn enter(&self, frame: impl Into<String>) -> Result<CallStack, SubworkflowError> {
        let frame = frame.into();
        if self.0.contains(&frame) {
            let mut witness = self.0.clone();
            witness.push(frame);
            return Err(SubworkflowError::Cyclic { witness });
        }
        let mut next = self.0.clone();
        next.push(frame);
        Ok(CallStack(next))
    }
}

/// Lookup contract for sub-workflow resolution (spec §6:
/// `WorkflowProvider.List(namespace?) -> [WorkflowResource]`).
#[async_trait]
pub trait WorkflowProvider: Send + Sync {
    async fn list(&self, namespace: Option<&str>) -> Vec<WorkflowResource>;
}

/// In-memory registry sufficient for embedding and for `waypoint-cli`.
#[derive(Debug, Default, Clone)]
pub struct StaticWorkflowRegistry {
    workflows: Vec<WorkflowResource>,
}

impl StaticWorkflowRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_workflow(mut self, workflow: WorkflowResource) -> Self {
        self.workflows.push(workflow);
        self
    }
}

#[async_trait]
impl WorkflowProvider for StaticWorkflowRegistry {
    async fn list(&self, namespace: Option<&str>) -> Vec<WorkflowResource> {
        match namespace {
            Some(ns) => self.workflows.iter().filter(|w| w.metadata.namespace == ns).cloned().collect(),
            None => self.workflows.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::WorkflowMetadata;
    use std::collections::BTreeMap;

    fn workflow(namespace: &str, name: &str, version: Option<&str>) -> WorkflowResource {
        WorkflowResource {
            metadata: WorkflowMetadata {
                name: name.to_string(),
                namespace: namespace.to_string(),
                labels: BTreeMap::new(),
            },
            version: version.map(String::from),
            input_schema: BTreeMap::new(),
            output: BTreeMap::new(),
            tasks: Vec::new(),
        }
    }

    #[test]
    fn parses_bare_name() {
        let r = WorkflowRef::parse("send-welcome");
        assert_eq!(r.namespace, None);
        assert_eq!(r.name, "send-welcome");
        assert_eq!(r.version, None);
    }

    #[test]
    fn parses_name_with_version() {
        let r = WorkflowRef::parse("send-welcome@abc123");
        assert_eq!(r.name, "send-welcome");
        assert_eq!(r.version, Some("abc123".to_string()));
    }

    #[test]
    fn parses_namespace_and_name() {
        let r = WorkflowRef::parse("billing/send-welcome");
        assert_eq!(r.namespace, Some("billing".to_string()));
        assert_eq!(r.name, "send-welcome");
    }

    #[test]
    fn parses_namespace_name_and_version() {
        let r = WorkflowRef::parse("billing/send-welcome@abc123");
        assert_eq!(r.namespace, Some("billing".to_string()));
        assert_eq!(r.name, "send-welcome");
        assert_eq!(r.version, Some("abc123".to_string()));
    }

    #[test]
    fn resolves_unique_match_in_default_namespace() {
        let workflows = vec![workflow("default", "send-welcome", Some("v1"))];
        let resolved = resolve("send-welcome", "default", &workflows).unwrap();
        assert_eq!(resolved.metadata.name, "send-welcome");
    }

    #[test]
    fn missing_namespace_defaults_to_parent() {
        let workflows = vec![workflow("billing", "send-welcome", None)];
        let resolved = resolve("send-welcome", "billing", &workflows).unwrap();
        assert_eq!(resolved.metadata.namespace, "billing");
    }

    #[test]
    fn not_found_when_no_match() {
        let workflows = vec![workflow("default", "other", None)];
        let err = resolve("send-welcome", "default", &workflows).unwrap_err();
        assert_eq!(err.code(), ErrorCode::SubworkflowNotFound);
    }

    #[test]
    fn multiple_matches_when_version_unspecified_and_ambiguous() {
        let workflows = vec![workflow("default", "send-welcome", Some("v1")), workflow("default", "send-welcome", Some("v2"))];
        let err = resolve("send-welcome", "default", &workflows).unwrap_err();
        assert!(matches!(err, SubworkflowError::MultipleMatches { .. }));
    }

    #[test]
    fn call_stack_detects_cycle() {
        let stack = CallStack::new().enter("default/a@h1").unwrap().enter("default/b@h2").unwrap();
        let err = stack.enter("default/a@h1").unwrap_err();
        match err {
            SubworkflowError::Cyclic { witness } => {
                assert_eq!(witness, vec!["default/a@h1", "default/b@h2", "default/a@h1"]);
            }
            other => panic!("expected Cyclic, got {other:?}"),
        }
    }

    #[test]
    fn independent_branches_each_get_their_own_cycle_check() {
        let base = CallStack::new().enter("default/a@h1").unwrap();
        let branch1 = base.enter("default/b@h2").unwrap();
        let branch2 = base.enter("default/c@h3").unwrap();
        assert_eq!(branch1.depth(), 2);
        assert_eq!(branch2.depth(), 2);
    }
}
