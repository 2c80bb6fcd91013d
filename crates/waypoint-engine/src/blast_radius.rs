//! Blast radius analyzer
//!
//! Depth-limited, cycle-safe BFS over the reverse-dependency graph rooted at
//! a task name: task → workflows that reference it → sibling task-refs in
//! those workflows → workflows that reference *those* → ... A visited set
//! keyed by node identity makes repeated re-entry into an already-seen
//! workflow or task a no-op rather than an infinite walk.

use std::collections::{BTreeMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::model::{StepBody, WorkflowResource};

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum NodeId {
    Task { name: String },
    Workflow { namespace: String, name: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlastNode {
    pub id: NodeId,
    pub depth: u32,
    pub is_source: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlastEdge {
    pub from: NodeId,
    pub to: NodeId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlastSummary {
    pub affected_workflows: usize,
    pub affected_tasks: usize,
    pub by_depth: BTreeMap<u32, usize>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlastRadiusResult {
    pub summary: BlastSummary,
    pub nodes: Vec<BlastNode>,
    pub edges: Vec<BlastEdge>,
    pub truncated_at_depth: Option<u32>,
}

/// Every task-ref name a step references: its own `taskRef`, or any `switch`
/// case/default target.
fn referenced_task_refs(step: &crate::model::WorkflowTaskStep) -> Vec<String> {
    match &step.body {
        StepBody::TaskRef { task_ref, .. } => vec![task_ref.clone()],
        StepBody::WorkflowRef { .. } => Vec::new(),
        StepBody::Switch { cases, default, .. } => {
            let mut refs: Vec<String> = cases.iter().map(|c| c.task_ref.clone()).collect();
            if let Some(default) = default {
                refs.push(default.clone());
            }
            refs
        }
    }
}

fn workflows_using_task<'a>(task_name: &str, workflows: &'a [WorkflowResource]) -> Vec<NodeId> {
    workflows
        .iter()
        .filter(|w| w.tasks.iter().any(|t| referenced_task_refs(t).iter().any(|r| r == task_name)))
        .map(|w| NodeId::Workflow {
            namespace: w.metadata.namespace.clone(),
            name: w.metadata.name.clone(),
        })
        .collect()
}

fn sibling_task_refs(namespace: &str, name: &str, workflows: &[WorkflowResource]) -> Vec<NodeId> {
    let Some(workflow) = workflows.iter().find(|w| w.metadata.namespace == namespace && w.metadata.name == name) else {
        return Vec::new();
    };
    let mut seen = HashSet::new();
    workflow
        .tasks
        .iter()
        .flat_map(referenced_task_refs)
        .filter(|task_ref| seen.insert(task_ref.clone()))
        .map(|task_ref| NodeId::Task { name: task_ref })
        .collect()
}

fn neighbors(node: &NodeId, workflows: &[WorkflowResource]) -> Vec<NodeId> {
    match node {
        NodeId::Task { name } => workflows_using_task(name, workflows),
        NodeId::Workflow { namespace, name } => sibling_task_refs(namespace, name, workflows),
    }
}

/// Traverse the reverse-dependency graph from `task_name` up to `max_depth`
/// hops. The source task is excluded from `affected_tasks` and appears as
/// its own node with `is_source = true, depth = 0`.
pub fn analyze(task_name: &str, workflows: &[WorkflowResource], max_depth: u32) -> BlastRadiusResult {
    let source = NodeId::Task { name: task_name.to_string() };

    let mut visited: HashSet<NodeId> = HashSet::new();
    visited.insert(source.clone());

    let mut nodes = vec![BlastNode {
        id: source.clone(),
        depth: 0,
        is_source: true,
    }];
    let mut edges = Vec::new();
    let mut frontier = vec![source];
    let mut depth = 0u32;
    let mut truncated_at_depth = None;

    loop {
        if frontier.is_empty() {
            break;
        }
        if depth >= max_depth {
            truncated_at_depth = Some(max_depth);
            break;
        }
        depth += 1;
        let mut next_frontier = Vec::new();
        for node in &frontier {
            for neighbor in neighbors(node, workflows) {
                edges.push(BlastEdge {
                    from: node.clone(),
                    to: neighbor.clone(),
                });
                if visited.insert(neighbor.clone()) {
                    nodes.push(BlastNode {
                        id: neighbor.clone(),
                        depth,
                        is_source: false,
                    });
                    next_frontier.push(neighbor);
                }
            }
        }
        frontier = next_frontier;
    }

    let mut by_depth: BTreeMap<u32, usize> = BTreeMap::new();
    for node in &nodes {
        *by_depth.entry(node.depth).or_insert(0) += 1;
    }

    let affected_workflows = nodes.iter().filter(|n| matches!(n.id, NodeId::Workflow { .. })).count();
    let affected_tasks = nodes.iter().filter(|n| matches!(n.id, NodeId::Task { .. }) && !n.is_source).count();

    BlastRadiusResult {
        summary: BlastSummary {
            affected_workflows,
            affected_tasks,
            by_depth,
        },
        nodes,
        edges,
        truncated_at_depth,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{SwitchCase, WorkflowMetadata, WorkflowTaskStep};
    use std::collections::BTreeMap;

    fn task_ref_step(id: &str, task_ref: &str) -> WorkflowTaskStep {
        WorkflowTaskStep {
            id: id.to_string(),
            depends_on: Vec::new(),
            timeout: None,
            retry: None,
            condition: None,
            for_each: None,
            body: StepBody::TaskRef {
                task_ref: task_ref.to_string(),
                input: BTreeMap::new(),
            },
        }
    }

    fn workflow(namespace: &str, name: &str, tasks: Vec<WorkflowTaskStep>) -> WorkflowResource {
        WorkflowResource {
            metadata: WorkflowMetadata {
                name: name.to_string(),
                namespace: namespace.to_string(),
                labels: BTreeMap::new(),
            },
            version: None,
            input_schema: BTreeMap::new(),
            output: BTreeMap::new(),
            tasks,
        }
    }

    #[test]
    fn finds_direct_workflow_and_siblings() {
        let workflows = vec![workflow(
            "default",
            "onboarding",
            vec![task_ref_step("t1", "fetch-user"), task_ref_step("t2", "send-email")],
        )];
        let result = analyze("fetch-user", &workflows, 2);

        assert_eq!(result.summary.affected_workflows, 1);
        assert!(result.summary.affected_tasks >= 1);
        assert!(result.nodes.iter().any(|n| n.id == NodeId::Task { name: "send-email".to_string() }));
    }

    #[test]
    fn source_excluded_from_affected_tasks() {
        let workflows = vec![workflow("default", "onboarding", vec![task_ref_step("t1", "fetch-user")])];
        let result = analyze("fetch-user", &workflows, 2);
        assert!(!result.nodes.iter().any(|n| n.id == NodeId::Task { name: "fetch-user".to_string() } && !n.is_source));
    }

    #[test]
    fn depth_limit_truncates_and_reports_it() {
        let workflows = vec![
            workflow("default", "w1", vec![task_ref_step("t1", "a"), task_ref_step("t2", "b")]),
            workflow("default", "w2", vec![task_ref_step("t1", "b"), task_ref_step("t2", "c")]),
        ];
        let result = analyze("a", &workflows, 1);
        assert_eq!(result.truncated_at_depth, Some(1));
        assert!(!result.nodes.iter().any(|n| n.id == NodeId::Task { name: "c".to_string() }));
    }

    #[test]
    fn cycle_safe_via_visited_set() {
        let workflows = vec![workflow(
            "default",
            "w1",
            vec![task_ref_step("t1", "a"), task_ref_step("t2", "b"), task_ref_step("t3", "a")],
        )];
        let result = analyze("a", &workflows, 5);
        let task_nodes: Vec<_> = result.nodes.iter().filter(|n| matches!(n.id, NodeId::Task { .. })).collect();
        assert_eq!(task_nodes.len(), 2);
    }

    #[test]
    fn switch_case_targets_count_as_references() {
        let switch_step = WorkflowTaskStep {
            id: "t1".to_string(),
            depends_on: Vec::new(),
            timeout: None,
            retry: None,
            condition: None,
            for_each: None,
            body: StepBody::Switch {
                value: "{{input.kind}}".to_string(),
                cases: vec![SwitchCase {
                    match_value: "premium".to_string(),
                    task_ref: "charge-premium".to_string(),
                }],
                default: Some("charge-standard".to_string()),
            },
        };
        let workflows = vec![workflow("default", "billing", vec![switch_step])];
        let result = analyze("charge-premium", &workflows, 2);
        assert_eq!(result.summary.affected_workflows, 1);
    }
}
