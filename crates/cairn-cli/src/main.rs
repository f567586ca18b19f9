//! CLI binary for validating, compiling and running Cairn analysis graphs.

use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};

use cairn_pipeline::{
    default_registry, validate, FunctionRegistry, GraphModel, RunEvent, RunManager, RunStatus, RuntimeConfig,
    Severity, SubmitRequest,
};
use cairn_types::{NodeState, RunState};

#[derive(Parser)]
#[command(name = "cairn", version, about = "Pipeline compiler and runner for imaging analysis graphs")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// TOML runtime configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Root directory for run trees (overrides config and CAIRN_ROOT)
    #[arg(long, global = true)]
    root: Option<PathBuf>,

    /// Workspace the run belongs to
    #[arg(short, long, global = true, default_value = "default")]
    workspace: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Check a graph .json file for errors and warnings
    Validate {
        /// Path to the graph .json file
        graph: PathBuf,
    },

    /// Print the rule DAG a graph compiles to
    Compile {
        /// Path to the graph .json file
        graph: PathBuf,

        /// Run id used for artifact paths
        #[arg(long, default_value = "preview")]
        run_id: String,
    },

    /// Submit a graph and wait for it to finish
    Run {
        /// Path to the graph .json file
        graph: PathBuf,

        /// Re-run an existing run, reusing its cached artifacts
        #[arg(long)]
        run_id: Option<String>,

        /// Display name of the run
        #[arg(short, long, default_value = "")]
        name: String,

        /// Node ids to recompute along with their dependents
        #[arg(short, long, value_delimiter = ',')]
        force: Vec<String>,
    },

    /// Show the status of a run
    Status {
        run_id: String,

        /// Only report these node ids
        #[arg(long, value_delimiter = ',')]
        nodes: Vec<String>,

        /// Print the raw status record
        #[arg(long)]
        json: bool,
    },

    /// Change the display name of a run
    Rename { run_id: String, name: String },

    /// Duplicate a run under a new id
    Copy {
        run_id: String,

        /// Display name of the copy
        #[arg(short, long)]
        name: Option<String>,
    },

    /// Delete a run and all of its artifacts
    Delete { run_id: String },

    /// Print the failure trace of a node
    Trace { run_id: String, node_id: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let mut config = RuntimeConfig::load(cli.config.as_deref())?;
    if let Some(root) = cli.root {
        config.root_dir = root;
    }
    tracing::debug!(root = %config.root_dir.display(), max_parallel = config.max_parallel, "Configuration loaded");
    let registry = default_registry();
    let ws = cli.workspace.as_str();

    match cli.command {
        Commands::Validate { graph } => {
            cmd_validate(&graph, &registry)?;
        }
        Commands::Compile { graph, run_id } => {
            let manager = RunManager::new(config, registry);
            let dag = manager.compile(ws, &run_id, &load_graph(&graph)?)?;
            println!("{}", dag.to_json()?);
        }
        Commands::Run {
            graph,
            run_id,
            name,
            force,
        } => {
            let manager = RunManager::new(config, registry);
            cmd_run(&manager, ws, &graph, run_id, name, force).await?;
        }
        Commands::Status { run_id, nodes, json } => {
            let manager = RunManager::new(config, registry);
            let subset = (!nodes.is_empty()).then_some(nodes.as_slice());
            let status = manager.status(ws, &run_id, subset).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&status)?);
            } else {
                print_status(&status);
            }
        }
        Commands::Rename { run_id, name } => {
            let manager = RunManager::new(config, registry);
            let status = manager.rename(ws, &run_id, &name).await?;
            println!("Renamed {} to '{}'", status.run_id, status.name);
        }
        Commands::Copy { run_id, name } => {
            let manager = RunManager::new(config, registry);
            let copy = manager.copy(ws, &run_id, name.as_deref()).await?;
            println!("Copied {run_id} to {copy}");
        }
        Commands::Delete { run_id } => {
            let manager = RunManager::new(config, registry);
            manager.delete(ws, &run_id).await?;
            println!("Deleted {run_id}");
        }
        Commands::Trace { run_id, node_id } => {
            let manager = RunManager::new(config, registry);
            match manager.trace(ws, &run_id, &node_id).await? {
                Some(trace) => {
                    println!("{} at {}", trace.kind, trace.occurred_at.format("%Y-%m-%d %H:%M:%S"));
                    for line in &trace.trace {
                        println!("  {line}");
                    }
                }
                None => println!("Node '{node_id}' has no recorded failure"),
            }
        }
    }

    Ok(())
}

fn load_graph(path: &Path) -> anyhow::Result<GraphModel> {
    let source = std::fs::read_to_string(path)?;
    Ok(GraphModel::from_json(&source)?)
}

fn cmd_validate(path: &Path, registry: &FunctionRegistry) -> anyhow::Result<()> {
    let graph = load_graph(path)?;
    let diagnostics = validate(&graph, registry);

    if diagnostics.is_empty() {
        println!("Graph is valid");
        return Ok(());
    }

    let mut has_error = false;
    for diag in &diagnostics {
        let severity = match diag.severity {
            Severity::Error => {
                has_error = true;
                "ERROR"
            }
            Severity::Warning => "WARN",
        };
        println!("[{}] {}: {}", severity, diag.rule, diag.message);
    }

    if has_error {
        std::process::exit(1);
    }
    Ok(())
}

async fn cmd_run(
    manager: &RunManager,
    ws: &str,
    path: &Path,
    run_id: Option<String>,
    name: String,
    force: Vec<String>,
) -> anyhow::Result<()> {
    let graph = load_graph(path)?;
    let mut events = manager.events().subscribe();
    let printer = tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                RunEvent::NodeSucceeded {
                    node_id, duration_ms, ..
                } => println!("  done    {node_id} ({duration_ms} ms)"),
                RunEvent::NodeCached { node_id, .. } => println!("  cached  {node_id}"),
                RunEvent::NodeFailed { node_id, error, .. } => println!("  FAILED  {node_id}: {error}"),
                RunEvent::RunFinished { .. } => break,
                _ => {}
            }
        }
    });

    let submitted = manager
        .submit(SubmitRequest {
            workspace_id: ws.to_string(),
            run_id,
            name,
            graph,
            force,
        })
        .await?;
    let run_id = submitted.run_id.clone();
    println!("Run {run_id} in workspace {ws}");
    if !submitted.invalidated.is_empty() {
        let ids: Vec<_> = submitted.invalidated.iter().map(String::as_str).collect();
        println!("Recomputing: {}", ids.join(", "));
    }

    let wait = submitted.handle.wait();
    tokio::pin!(wait);
    let report = tokio::select! {
        report = &mut wait => report?,
        _ = tokio::signal::ctrl_c() => {
            println!("Cancelling; running nodes will finish first");
            manager.cancel(ws, &run_id).await;
            wait.await?
        }
    };
    let _ = printer.await;

    println!(
        "\nRun {:?}: {} executed, {} cached, {} failed, {} not run",
        report.state,
        report.executed.len(),
        report.cached.len(),
        report.failed.len(),
        report.not_run.len()
    );
    if report.state != RunState::Success {
        std::process::exit(1);
    }
    Ok(())
}

fn print_status(status: &RunStatus) {
    let name = if status.name.is_empty() { &status.run_id } else { &status.name };
    println!("Run: {} [{:?}]", name, status.state);
    println!("Started: {}", status.started_at.format("%Y-%m-%d %H:%M:%S"));
    if let Some(finished) = status.finished_at {
        println!("Finished: {}", finished.format("%Y-%m-%d %H:%M:%S"));
    }

    println!("\nNodes:");
    for node in status.nodes.values() {
        let marker = match node.state {
            NodeState::Pending => " ",
            NodeState::Running => ">",
            NodeState::Success => "+",
            NodeState::Error => "!",
        };
        println!("  {} {} [{}] {:?}", marker, node.id, node.name, node.state);
        if let Some(message) = node.message.as_deref().and_then(|m| m.lines().next()) {
            println!("      {message}");
        }
    }
}
