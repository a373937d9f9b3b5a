mod agents;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{CommandFactory, Parser, Subcommand};
use serde_json::Value;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use weft_core::config::WeftConfig;
use weft_core::event::WorkflowEventKind;
use weft_core::types::RunStatus;
use weft_flow::graph::{Engine, NodeKind, WorkflowDefinition};

use agents::BuiltinAgents;

#[derive(Parser)]
#[command(name = "weft", version, about = "Workflow orchestration for multi-agent tasks")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "weft.toml", env = "WEFT_CONFIG")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check a workflow document and report problems
    Validate {
        /// Workflow JSON file
        file: PathBuf,
    },
    /// Print a workflow's nodes and edges
    Show {
        /// Workflow JSON file
        file: PathBuf,
    },
    /// Run a workflow with the built-in agent templates
    Run {
        /// Workflow JSON file
        file: PathBuf,
        /// Input variable as key=value; the value is parsed as JSON when it can be
        #[arg(short, long = "input", value_parser = parse_input)]
        inputs: Vec<(String, Value)>,
        /// Route agent calls through the supervised coordinator
        #[arg(long)]
        actors: bool,
        /// Print lifecycle events to stderr
        #[arg(long)]
        events: bool,
    },
    /// Show the effective configuration
    Config,
    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("weft=info,warn")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Completions { shell } => {
            let mut cmd = Cli::command();
            clap_complete::generate(shell, &mut cmd, "weft", &mut std::io::stdout());
        }
        Commands::Validate { file } => {
            let definition = load_workflow(&file)?;
            definition.validate()?;
            println!(
                "{}: ok ({} nodes, {} edges)",
                definition.id,
                definition.nodes.len(),
                definition.edges.len()
            );
        }
        Commands::Show { file } => {
            let definition = load_workflow(&file)?;
            show(&definition);
        }
        Commands::Config => {
            let config = WeftConfig::load_or_default(&cli.config)?;
            println!("{}", toml::to_string_pretty(&config)?);
        }
        Commands::Run {
            file,
            inputs,
            actors,
            events,
        } => {
            let mut config = WeftConfig::load_or_default(&cli.config)?;
            if actors {
                config.engine.use_coordinator = true;
            }
            let definition = load_workflow(&file)?;
            let inputs: HashMap<String, Value> = inputs.into_iter().collect();
            run(config, definition, inputs, events).await?;
        }
    }

    Ok(())
}

fn load_workflow(path: &Path) -> anyhow::Result<WorkflowDefinition> {
    WorkflowDefinition::load(path)
        .map_err(|e| anyhow::anyhow!("{}: {}", path.display(), e))
}

fn parse_input(raw: &str) -> Result<(String, Value), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected key=value, got {raw:?}"))?;
    let key = key.trim();
    if key.is_empty() {
        return Err(format!("empty key in {raw:?}"));
    }
    let value = serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_string()));
    Ok((key.to_string(), value))
}

fn show(definition: &WorkflowDefinition) {
    println!("{} ({}) v{}", definition.name, definition.id, definition.version);
    if !definition.description.is_empty() {
        println!("  {}", definition.description);
    }
    for input in &definition.inputs {
        let required = if input.required { " (required)" } else { "" };
        println!("  input  {}: {:?}{}", input.name, input.var_type, required);
    }
    println!("nodes:");
    for node in &definition.nodes {
        let detail = match &node.kind {
            NodeKind::Task { agent } => format!(" -> {}", agent.template),
            NodeKind::Condition { condition } => match &condition.expression {
                Some(expr) => format!(" if {expr}"),
                None => format!(" {} rules", condition.rules.len()),
            },
            NodeKind::Loop { spec } => format!(" {:?} x{}", spec.kind, spec.max_loops),
            NodeKind::Parallel { parallel } => {
                format!(" {} branches, {:?}", parallel.branches.len(), parallel.join)
            }
            NodeKind::Start | NodeKind::End | NodeKind::Merge => String::new(),
        };
        println!("  {:<16} [{}] {}{}", node.id, node.kind.type_name(), node.label(), detail);
    }
    println!("edges:");
    for edge in &definition.edges {
        match &edge.condition {
            Some(cond) => println!("  {} -> {} when {}", edge.from, edge.to, cond),
            None => println!("  {} -> {}", edge.from, edge.to),
        }
    }
}

async fn run(
    config: WeftConfig,
    definition: WorkflowDefinition,
    inputs: HashMap<String, Value>,
    print_events: bool,
) -> anyhow::Result<()> {
    let engine = Engine::new(Arc::new(BuiltinAgents), &config);
    info!(
        workflow_id = %definition.id,
        coordinator = config.engine.use_coordinator,
        templates = ?agents::TEMPLATES,
        "Running workflow"
    );

    let printer = print_events.then(|| {
        let mut rx = engine.events().subscribe();
        tokio::spawn(async move {
            while let Ok(event) = rx.recv().await {
                let node = event.node_id.as_deref().unwrap_or("-");
                eprintln!("[{}] {}", event.kind, node);
                if matches!(
                    event.kind,
                    WorkflowEventKind::WorkflowCompleted
                        | WorkflowEventKind::WorkflowFailed
                        | WorkflowEventKind::WorkflowCancelled
                ) {
                    break;
                }
            }
        })
    });

    let result = tokio::select! {
        result = engine.execute_definition(definition, inputs) => result?,
        _ = tokio::signal::ctrl_c() => {
            warn!("Interrupted, cancelling running executions");
            for summary in engine.list_executions(&Default::default()) {
                let _ = engine.cancel(&summary.execution_id);
            }
            anyhow::bail!("interrupted");
        }
    };

    if let Some(printer) = printer {
        let _ = printer.await;
    }

    println!("{}", serde_json::to_string_pretty(&result)?);
    for warning in &result.warnings {
        warn!(warning = %warning, "Workflow warning");
    }
    if result.status != RunStatus::Completed {
        anyhow::bail!("workflow finished with status {}", result.status);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_input() {
        assert_eq!(parse_input("name=bob").unwrap(), ("name".into(), Value::from("bob")));
        assert_eq!(parse_input("n=42").unwrap(), ("n".into(), Value::from(42)));
        assert_eq!(
            parse_input("tags=[\"a\"]").unwrap().1,
            serde_json::json!(["a"])
        );
        assert!(parse_input("novalue").is_err());
        assert!(parse_input("=x").is_err());
    }

    #[test]
    fn test_cli_parses_run() {
        let cli = Cli::try_parse_from([
            "weft", "run", "flow.json", "--input", "message=hi", "--actors",
        ])
        .unwrap();
        match cli.command {
            Commands::Run { inputs, actors, .. } => {
                assert!(actors);
                assert_eq!(inputs, vec![("message".to_string(), Value::from("hi"))]);
            }
            _ => panic!("expected run"),
        }
    }
}
