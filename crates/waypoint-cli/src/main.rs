// Waypoint CLI
//
// Design Decision: clap derive for subcommand parsing.
// Design Decision: no remote API client — this binary drives the engine
// in-process, so `run`/`graph`/`validate` exercise exactly the embed
// contract, with no network-facing gateway in between.

mod loader;
mod output;

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;
use waypoint_engine::config::EngineConfig;
use waypoint_engine::graph::build_graph;
use waypoint_engine::orchestrator::Orchestrator;
use waypoint_engine::reliability::CircuitBreakerRegistry;
use waypoint_engine::subworkflow::StaticWorkflowRegistry;
use waypoint_engine::task_executor::TaskExecutor;
use waypoint_storage::memory::{InMemoryExecutionRepository, InMemoryTaskExecutionRepository, InMemoryWorkflowVersionRepository};

use crate::output::OutputFormat;

#[derive(Parser)]
#[command(name = "waypoint")]
#[command(about = "Execute a waypoint workflow definition")]
#[command(version)]
struct Cli {
    /// Output format
    #[arg(long, short, value_enum, default_value = "text")]
    output: OutputFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Execute a workflow definition against a task registry
    Run {
        /// Path to the workflow definition (YAML or JSON)
        workflow: PathBuf,
        /// Path to the task registry (YAML or JSON list of task definitions)
        #[arg(long)]
        tasks: PathBuf,
        /// Inline JSON input, mutually exclusive with --input-file
        #[arg(long)]
        input: Option<String>,
        /// Path to a JSON/YAML input file
        #[arg(long)]
        input_file: Option<PathBuf>,
        /// Global concurrency cap (spec §4.6 default 32)
        #[arg(long, default_value = "32")]
        max_concurrency: usize,
    },
    /// Build and print the execution graph without running anything
    Graph {
        workflow: PathBuf,
    },
    /// Dry-run: build the graph and report validation errors, if any
    Validate {
        workflow: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt().with_env_filter(EnvFilter::from_default_env()).init();

    let cli = Cli::parse();

    match cli.command {
        Command::Graph { workflow } => {
            let workflow = loader::load_workflow(&workflow)?;
            let build = build_graph(&workflow.tasks);
            match build.graph {
                Some(graph) => output::print_graph(&graph, cli.output),
                None => {
                    for error in &build.errors {
                        eprintln!("error: {error}");
                    }
                    std::process::exit(1);
                }
            }
        }
        Command::Validate { workflow } => {
            let workflow = loader::load_workflow(&workflow)?;
            let build = build_graph(&workflow.tasks);
            if build.is_valid {
                println!("valid: {} task(s), {} level(s)", workflow.tasks.len(), build.graph.map(|g| g.parallel_groups.len()).unwrap_or(0));
            } else {
                for error in &build.errors {
                    eprintln!("error: {error}");
                }
                std::process::exit(1);
            }
        }
        Command::Run {
            workflow,
            tasks,
            input,
            input_file,
            max_concurrency,
        } => {
            let workflow = loader::load_workflow(&workflow)?;
            let registry = Arc::new(loader::load_task_registry(&tasks)?);
            let input = loader::load_input(input.as_deref(), input_file.as_deref())?;

            let executor = Arc::new(TaskExecutor::new(Arc::new(CircuitBreakerRegistry::new()), EngineConfig::default().default_task_timeout));
            let workflows = Arc::new(StaticWorkflowRegistry::new().with_workflow(workflow.clone()));
            let config = EngineConfig::new().with_max_workflow_concurrency(max_concurrency);

            let orchestrator = Orchestrator::new(
                config,
                registry,
                workflows,
                Arc::new(InMemoryExecutionRepository::new()),
                Arc::new(InMemoryTaskExecutionRepository::new()),
                Arc::new(InMemoryWorkflowVersionRepository::new()),
                executor,
            );

            let result = orchestrator.execute(&workflow, input).await;
            output::print_execution_result(&result, cli.output);
            if !result.success {
                std::process::exit(1);
            }
        }
    }

    Ok(())
}
