//! Loads a `WorkflowResource` and a task registry from YAML or JSON files
//! on disk. How these definitions arrive in a larger deployment (a CRD
//! controller, a config service) is out of scope here; this CLI's one
//! concrete answer is a plain file, sniffed by extension.

use std::path::Path;

use anyhow::{bail, Context, Result};
use waypoint_engine::model::{RawWorkflowTaskStep, TaskDefinition, WorkflowResource, WorkflowTaskStep};
use waypoint_engine::task_executor::StaticTaskRegistry;

/// A workflow file on disk mirrors [`WorkflowResource`] except its `tasks`
/// are [`RawWorkflowTaskStep`] — the loosely-typed shape that enforces the
/// one-of `taskRef | workflowRef | switch` constraint at load time instead
/// of at construction, matching how a CRD or hand-written YAML would arrive.
#[derive(Debug, serde::Deserialize)]
struct RawWorkflowFile {
    metadata: waypoint_engine::model::WorkflowMetadata,
    #[serde(default)]
    version: Option<String>,
    #[serde(default)]
    input_schema: std::collections::BTreeMap<String, waypoint_engine::model::InputProperty>,
    #[serde(default)]
    output: std::collections::BTreeMap<String, String>,
    tasks: Vec<RawWorkflowTaskStep>,
}

fn parse_by_extension<T: serde::de::DeserializeOwned>(path: &Path, contents: &str) -> Result<T> {
    match path.extension().and_then(|e| e.to_str()) {
        Some("yaml") | Some("yml") => serde_yaml::from_str(contents).with_context(|| format!("parsing {} as YAML", path.display())),
        Some("json") => serde_json::from_str(contents).with_context(|| format!("parsing {} as JSON", path.display())),
        other => bail!("unsupported file extension {other:?} for {}: expected .yaml, .yml, or .json", path.display()),
    }
}

pub fn load_workflow(path: &Path) -> Result<WorkflowResource> {
    let contents = std::fs::read_to_string(path).with_context(|| format!("reading workflow definition {}", path.display()))?;
    let raw: RawWorkflowFile = parse_by_extension(path, &contents)?;

    let tasks: Result<Vec<WorkflowTaskStep>> = raw.tasks.into_iter().map(|t| t.into_step().map_err(anyhow::Error::from)).collect();

    Ok(WorkflowResource {
        metadata: raw.metadata,
        version: raw.version,
        input_schema: raw.input_schema,
        output: raw.output,
        tasks: tasks?,
    })
}

pub fn load_task_registry(path: &Path) -> Result<StaticTaskRegistry> {
    let contents = std::fs::read_to_string(path).with_context(|| format!("reading task registry {}", path.display()))?;
    let defs: Vec<TaskDefinition> = parse_by_extension(path, &contents)?;

    let mut registry = StaticTaskRegistry::new();
    for def in defs {
        registry = registry.with_task(def);
    }
    Ok(registry)
}

pub fn load_input(raw: Option<&str>, path: Option<&Path>) -> Result<serde_json::Value> {
    match (raw, path) {
        (Some(raw), _) => serde_json::from_str(raw).context("parsing --input as JSON"),
        (None, Some(path)) => {
            let contents = std::fs::read_to_string(path).with_context(|| format!("reading input file {}", path.display()))?;
            parse_by_extension(path, &contents)
        }
        (None, None) => Ok(serde_json::Value::Object(Default::default())),
    }
}
