//! Trace rendering for the `run`/`test` subcommands
//!
//! Supports a text and a json format, minus a third `yaml` option — there is
//! no scripting audience here that wants it.

use waypoint_engine::graph::Graph;
use waypoint_engine::orchestrator::ExecutionResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

pub fn print_execution_result(result: &ExecutionResult, format: OutputFormat) {
    match format {
        OutputFormat::Json => {
            let payload = serde_json::json!({
                "success": result.success,
                "status": result.status,
                "executionId": result.execution_id,
                "output": result.output,
                "error": result.error,
                "errors": result.errors,
                "taskDetails": result.task_details,
            });
            println!("{}", serde_json::to_string_pretty(&payload).expect("execution result serializes"));
        }
        OutputFormat::Text => {
            println!("execution {}  status={:?}  success={}", result.execution_id, result.status, result.success);
            if let Some(error) = &result.error {
                println!("error: {error}");
            }
            println!();
            println!("{:<20} {:<10} {:>8}  error", "task", "status", "ms");
            for task in &result.task_details {
                println!(
                    "{:<20} {:<10} {:>8}  {}",
                    task.task_id,
                    format!("{:?}", task.status),
                    task.duration_ms,
                    task.errors.join("; ")
                );
            }
            if let Some(output) = &result.output {
                println!();
                println!("output:");
                println!("{}", serde_json::to_string_pretty(output).expect("output serializes"));
            }
        }
    }
}

pub fn print_graph(graph: &Graph, format: OutputFormat) {
    match format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(graph).expect("graph serializes"));
        }
        OutputFormat::Text => {
            println!("execution order: {}", graph.execution_order.join(" -> "));
            println!();
            for group in &graph.parallel_groups {
                println!("level {} (parallel): {}", group.level, group.task_ids.join(", "));
            }
            println!();
            println!("{:<20} level", "task");
            for id in &graph.nodes {
                println!("{:<20} {}", id, graph.levels.get(id).copied().unwrap_or_default());
            }
        }
    }
}
