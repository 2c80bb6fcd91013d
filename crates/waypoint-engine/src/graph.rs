//! Dependency extraction and execution graph construction

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};

use serde::{Deserialize, Serialize};

use crate::error::{ErrorCode, HasErrorCode};
use crate::model::WorkflowTaskStep;
use crate::template::referenced_task_ids;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GraphError {
    #[error("Circular dependency: {}", .witness.join(" → "))]
    Cycle { witness: Vec<String> },
    #[error("task '{from}' references unknown task id '{referenced}'")]
    UnknownTaskRef { from: String, referenced: String },
    #[error("duplicate task id '{id}'")]
    DuplicateTaskId { id: String },
    #[error("invalid step '{id}': {reason}")]
    InvalidStep { id: String, reason: String },
}

impl HasErrorCode for GraphError {
    fn code(&self) -> ErrorCode {
        match self {
            GraphError::Cycle { .. } => ErrorCode::GraphCycle,
            GraphError::UnknownTaskRef { .. } => ErrorCode::UnknownTaskRef,
            GraphError::DuplicateTaskId { .. } => ErrorCode::DuplicateTaskId,
            GraphError::InvalidStep { .. } => ErrorCode::InvalidStep,
        }
    }
}

/// One level of the graph containing more than one runnable id
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParallelGroup {
    pub level: u32,
    pub task_ids: Vec<String>,
}

/// A validated, ready-to-execute workflow graph
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Graph {
    pub nodes: Vec<String>,
    pub edges: Vec<(String, String)>,
    pub levels: BTreeMap<String, u32>,
    pub parallel_groups: Vec<ParallelGroup>,
    pub execution_order: Vec<String>,
}

impl Graph {
    pub fn dependents_of(&self, id: &str) -> Vec<&str> {
        self.edges
            .iter()
            .filter(|(from, _)| from == id)
            .map(|(_, to)| to.as_str())
            .collect()
    }

    pub fn dependencies_of(&self, id: &str) -> Vec<&str> {
        self.edges
            .iter()
            .filter(|(_, to)| to == id)
            .map(|(from, _)| from.as_str())
            .collect()
    }
}

/// Outcome of a graph build attempt. No partial graph is ever returned
/// alongside errors: either `graph` is `Some` and `errors` is empty, or
/// `graph` is `None` and `errors` names every problem found.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildResult {
    pub is_valid: bool,
    pub errors: Vec<GraphError>,
    pub graph: Option<Graph>,
}

/// Union of a step's explicit `dependsOn` and every `tasks.<id>.output.*`
/// reference found in its own templates (input values, `condition.if`,
/// `forEach.items`). Does not evaluate templates. Fails if any reference
/// (explicit or template-derived) names an id absent from `known_ids`.
pub fn extract_dependencies(step: &WorkflowTaskStep, known_ids: &HashSet<String>) -> Result<BTreeSet<String>, GraphError> {
    let mut deps: BTreeSet<String> = BTreeSet::new();

    for dep in &step.depends_on {
        if !known_ids.contains(dep) {
            return Err(GraphError::UnknownTaskRef {
                from: step.id.clone(),
                referenced: dep.clone(),
            });
        }
        deps.insert(dep.clone());
    }

    let mut templates: Vec<&str> = step.body.own_template_expressions();
    if let Some(cond) = &step.condition {
        templates.push(cond.if_expr.as_str());
    }
    if let Some(for_each) = &step.for_each {
        templates.push(for_each.items.as_str());
    }

    for template in templates {
        for id in referenced_task_ids(template) {
            if !known_ids.contains(&id) {
                return Err(GraphError::UnknownTaskRef {
                    from: step.id.clone(),
                    referenced: id,
                });
            }
            deps.insert(id);
        }
    }

    Ok(deps)
}

/// Build and validate the execution graph for a workflow.
pub fn build_graph(tasks: &[WorkflowTaskStep]) -> BuildResult {
    let mut errors = Vec::new();
    let mut ids: Vec<String> = Vec::new();
    let mut seen: HashSet<String> = HashSet::new();

    for task in tasks {
        if !seen.insert(task.id.clone()) {
            errors.push(GraphError::DuplicateTaskId { id: task.id.clone() });
            continue;
        }
        ids.push(task.id.clone());
    }

    if !errors.is_empty() {
        return BuildResult {
            is_valid: false,
            errors,
            graph: None,
        };
    }

    let known: HashSet<String> = seen;
    let mut deps_map: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
    for task in tasks {
        match extract_dependencies(task, &known) {
            Ok(deps) => {
                deps_map.insert(task.id.clone(), deps);
            }
            Err(e) => errors.push(e),
        }
    }

    if !errors.is_empty() {
        return BuildResult {
            is_valid: false,
            errors,
            graph: None,
        };
    }

    let mut adjacency: BTreeMap<String, Vec<String>> = BTreeMap::new();
    let mut edges: Vec<(String, String)> = Vec::new();
    for (id, deps) in &deps_map {
        for dep in deps {
            adjacency.entry(dep.clone()).or_default().push(id.clone());
            edges.push((dep.clone(), id.clone()));
        }
    }

    let mut remaining_in_degree: BTreeMap<String, usize> = ids.iter().map(|id| (id.clone(), deps_map[id].len())).collect();
    let mut frontier: BTreeSet<String> = ids
        .iter()
        .filter(|id| remaining_in_degree[*id] == 0)
        .cloned()
        .collect();

    let mut levels: BTreeMap<String, u32> = BTreeMap::new();
    let mut execution_order: Vec<String> = Vec::new();
    let mut level: u32 = 0;

    while !frontier.is_empty() {
        for id in &frontier {
            levels.insert(id.clone(), level);
            execution_order.push(id.clone());
        }
        let mut next_frontier = BTreeSet::new();
        for id in &frontier {
            if let Some(dependents) = adjacency.get(id) {
                for dependent in dependents {
                    let degree = remaining_in_degree.get_mut(dependent).expect("known id");
                    *degree -= 1;
                    if *degree == 0 {
                        next_frontier.insert(dependent.clone());
                    }
                }
            }
        }
        frontier = next_frontier;
        level += 1;
    }

    if execution_order.len() != ids.len() {
        let processed: HashSet<&String> = execution_order.iter().collect();
        let cyclic: BTreeSet<String> = ids.iter().filter(|id| !processed.contains(id)).cloned().collect();
        let witness = shortest_cycle(&adjacency, &cyclic);
        return BuildResult {
            is_valid: false,
            errors: vec![GraphError::Cycle { witness }],
            graph: None,
        };
    }

    let mut by_level: BTreeMap<u32, Vec<String>> = BTreeMap::new();
    for (id, lvl) in &levels {
        by_level.entry(*lvl).or_default().push(id.clone());
    }
    for ids in by_level.values_mut() {
        ids.sort();
    }
    let parallel_groups = by_level
        .into_iter()
        .filter(|(_, ids)| ids.len() > 1)
        .map(|(level, task_ids)| ParallelGroup { level, task_ids })
        .collect();

    BuildResult {
        is_valid: true,
        errors: Vec::new(),
        graph: Some(Graph {
            nodes: ids,
            edges,
            levels,
            parallel_groups,
            execution_order,
        }),
    }
}

/// Find a shortest cycle within the subgraph of nodes left over after Kahn's
/// algorithm removes every node reachable from a zero in-degree root. Every
/// remaining node lies on or feeds into at least one cycle. Breaks ties by
/// lexicographically smallest path for a deterministic witness.
fn shortest_cycle(adjacency: &BTreeMap<String, Vec<String>>, remaining: &BTreeSet<String>) -> Vec<String> {
    let mut best: Option<Vec<String>> = None;

    for start in remaining {
        let mut queue: VecDeque<Vec<String>> = VecDeque::new();
        queue.push_back(vec![start.clone()]);
        let mut best_depth_seen: HashMap<String, usize> = HashMap::new();
        best_depth_seen.insert(start.clone(), 0);

        while let Some(path) = queue.pop_front() {
            if let Some(b) = &best {
                if path.len() >= b.len() {
                    continue;
                }
            }
            let last = path.last().expect("non-empty path");
            let Some(neighbors) = adjacency.get(last) else {
                continue;
            };
            for next in neighbors {
                if !remaining.contains(next) {
                    continue;
                }
                if next == start {
                    let mut cycle = path.clone();
                    cycle.push(start.clone());
                    let better = match &best {
                        None => true,
                        Some(b) => cycle.len() < b.len() || (cycle.len() == b.len() && cycle < *b),
                    };
                    if better {
                        best = Some(cycle);
                    }
                    continue;
                }
                let depth = path.len();
                if best_depth_seen.get(next).map_or(true, |&d| depth < d) {
                    best_depth_seen.insert(next.clone(), depth);
                    let mut extended = path.clone();
                    extended.push(next.clone());
                    queue.push_back(extended);
                }
            }
        }
    }

    best.unwrap_or_else(|| remaining.iter().cloned().collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::StepBody;
    use std::collections::BTreeMap;

    fn task_ref_step(id: &str, depends_on: Vec<&str>, input: BTreeMap<String, String>) -> WorkflowTaskStep {
        WorkflowTaskStep {
            id: id.to_string(),
            depends_on: depends_on.into_iter().map(String::from).collect(),
            timeout: None,
            retry: None,
            condition: None,
            for_each: None,
            body: StepBody::TaskRef {
                task_ref: "noop".to_string(),
                input,
            },
        }
    }

    #[test]
    fn linear_two_task_chain() {
        let mut input_b = BTreeMap::new();
        input_b.insert("x".to_string(), "{{tasks.a.output.y}}".to_string());
        let tasks = vec![task_ref_step("a", vec![], BTreeMap::new()), task_ref_step("b", vec![], input_b)];

        let result = build_graph(&tasks);
        assert!(result.is_valid);
        let graph = result.graph.unwrap();
        assert_eq!(graph.execution_order, vec!["a", "b"]);
        assert_eq!(graph.levels["a"], 0);
        assert_eq!(graph.levels["b"], 1);
        assert!(graph.parallel_groups.is_empty());
    }

    #[test]
    fn diamond_produces_parallel_group() {
        let mut input_b = BTreeMap::new();
        input_b.insert("x".to_string(), "{{tasks.a.output.y}}".to_string());
        let mut input_c = BTreeMap::new();
        input_c.insert("x".to_string(), "{{tasks.a.output.y}}".to_string());
        let mut input_d = BTreeMap::new();
        input_d.insert("x".to_string(), "{{tasks.b.output.y}}".to_string());
        input_d.insert("z".to_string(), "{{tasks.c.output.y}}".to_string());

        let tasks = vec![
            task_ref_step("a", vec![], BTreeMap::new()),
            task_ref_step("b", vec![], input_b),
            task_ref_step("c", vec![], input_c),
            task_ref_step("d", vec![], input_d),
        ];

        let result = build_graph(&tasks);
        assert!(result.is_valid);
        let graph = result.graph.unwrap();
        assert_eq!(graph.levels["a"], 0);
        assert_eq!(graph.levels["b"], 1);
        assert_eq!(graph.levels["c"], 1);
        assert_eq!(graph.levels["d"], 2);
        assert_eq!(graph.parallel_groups.len(), 1);
        assert_eq!(graph.parallel_groups[0].task_ids, vec!["b", "c"]);
        assert_eq!(graph.execution_order, vec!["a", "b", "c", "d"]);
    }

    #[test]
    fn cycle_is_detected_with_witness() {
        let mut input_a = BTreeMap::new();
        input_a.insert("x".to_string(), "{{tasks.c.output.y}}".to_string());
        let mut input_b = BTreeMap::new();
        input_b.insert("x".to_string(), "{{tasks.a.output.y}}".to_string());
        let mut input_c = BTreeMap::new();
        input_c.insert("x".to_string(), "{{tasks.b.output.y}}".to_string());

        let tasks = vec![
            task_ref_step("a", vec![], input_a),
            task_ref_step("b", vec![], input_b),
            task_ref_step("c", vec![], input_c),
        ];

        let result = build_graph(&tasks);
        assert!(!result.is_valid);
        assert_eq!(result.errors.len(), 1);
        match &result.errors[0] {
            GraphError::Cycle { witness } => assert_eq!(witness.len(), 4),
            other => panic!("expected Cycle, got {other:?}"),
        }
    }

    #[test]
    fn unknown_task_ref_fails_construction() {
        let mut input_a = BTreeMap::new();
        input_a.insert("x".to_string(), "{{tasks.ghost.output.y}}".to_string());
        let tasks = vec![task_ref_step("a", vec![], input_a)];

        let result = build_graph(&tasks);
        assert!(!result.is_valid);
        assert_eq!(result.errors[0].code(), ErrorCode::UnknownTaskRef);
    }

    #[test]
    fn duplicate_task_id_fails_construction() {
        let tasks = vec![task_ref_step("a", vec![], BTreeMap::new()), task_ref_step("a", vec![], BTreeMap::new())];
        let result = build_graph(&tasks);
        assert!(!result.is_valid);
        assert_eq!(result.errors[0].code(), ErrorCode::DuplicateTaskId);
    }

    #[test]
    fn multiple_refs_to_same_predecessor_collapse_to_one_edge() {
        let mut input_b = BTreeMap::new();
        input_b.insert("x".to_string(), "{{tasks.a.output.y}}".to_string());
        input_b.insert("z".to_string(), "{{tasks.a.output.w}}".to_string());
        let tasks = vec![task_ref_step("a", vec![], BTreeMap::new()), task_ref_step("b", vec![], input_b)];

        let result = build_graph(&tasks);
        let graph = result.graph.unwrap();
        assert_eq!(graph.edges, vec![("a".to_string(), "b".to_string())]);
    }
}
