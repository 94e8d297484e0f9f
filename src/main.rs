use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{CommandFactory, Parser, Subcommand};
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

use crewflow_core::config::{AppConfig, TransportKind};
use crewflow_core::event::EventBroadcaster;
use crewflow_core::flow::FlowDefinition;
use crewflow_core::traits::ExecutionStore;
use crewflow_core::types::ExecutionStatus;
use crewflow_engine::{crew_runner_from_config, ExecutionService, FlowGraph, FunctionRegistry};
use crewflow_gateway::GatewayServer;
use crewflow_store::SqliteStore;

#[derive(Parser)]
#[command(name = "crewflow", version, about = "Flow execution engine for agent crews")]
struct Cli {
    /// Path to config file (defaults to ~/.crewflow/crewflow.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP/WebSocket gateway and the worker pool
    Serve,
    /// Run a flow definition to completion and print the execution
    Run {
        /// Flow definition (JSON)
        flow: PathBuf,
        /// Flow input as key=value (value parsed as JSON when possible)
        #[arg(short, long = "input")]
        inputs: Vec<String>,
        /// Initial flow state as a JSON object
        #[arg(long)]
        state: Option<String>,
    },
    /// Check a flow definition without running it
    Validate {
        /// Flow definition (JSON)
        flow: PathBuf,
    },
    /// Show current configuration
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
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("crewflow=info,warn")),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();

    // Handle completions before config loading
    if let Commands::Completions { shell } = &cli.command {
        let mut cmd = Cli::command();
        clap_complete::generate(*shell, &mut cmd, "crewflow", &mut std::io::stdout());
        return Ok(());
    }

    let config = match &cli.config {
        Some(path) => AppConfig::load(path)?,
        None => AppConfig::load_or_default(&AppConfig::default_path())?,
    };

    match cli.command {
        Commands::Serve => serve(config).await?,
        Commands::Run {
            flow,
            inputs,
            state,
        } => run_flow(config, &flow, &inputs, state.as_deref()).await?,
        Commands::Validate { flow } => {
            let definition = read_flow(&flow)?;
            let graph = FlowGraph::build(&definition)?;
            println!(
                "Flow '{}' is valid: {} steps, start step '{}'",
                definition.name,
                graph.steps_count(),
                graph.find_start_step()?.id
            );
        }
        Commands::Config => {
            println!("{}", toml::to_string_pretty(&config)?);
        }
        Commands::Completions { .. } => unreachable!("handled before config load"),
    }

    Ok(())
}

async fn serve(config: AppConfig) -> anyhow::Result<()> {
    let db_path = config.storage.resolved_path();
    let store: Arc<dyn ExecutionStore> = Arc::new(SqliteStore::open(&db_path)?);
    info!(path = %db_path.display(), "Execution store opened");

    let broadcaster = Arc::new(build_broadcaster(&config)?);
    let _relay = broadcaster.start_relay().await?;

    let crew_runner = crew_runner_from_config(&config.crew)?;
    let cancel = CancellationToken::new();
    let (service, workers) = ExecutionService::start(
        store,
        broadcaster,
        crew_runner,
        FunctionRegistry::new(),
        &config.worker,
        cancel.clone(),
    );

    // Graceful shutdown on Ctrl-C
    let cancel_clone = cancel.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("Shutting down gateway...");
        cancel_clone.cancel();
    });

    info!(bind = %config.server.bind, "Starting gateway");
    let server = GatewayServer::new(config.server.clone(), Arc::new(service));
    server.run(cancel).await?;
    workers.await.ok();
    Ok(())
}

fn build_broadcaster(config: &AppConfig) -> anyhow::Result<EventBroadcaster> {
    let buffer = config.events.observer_buffer;
    match config.events.transport {
        TransportKind::Local => Ok(EventBroadcaster::local(buffer)),
        #[cfg(feature = "redis")]
        TransportKind::Redis => {
            let transport = crewflow_core::event::RedisTransport::new(&config.events.redis_url)?;
            info!(url = %config.events.redis_url, "Using redis event transport");
            Ok(EventBroadcaster::new(Arc::new(transport), buffer))
        }
        #[cfg(not(feature = "redis"))]
        TransportKind::Redis => {
            anyhow::bail!("events.transport = \"redis\" requires the `redis` feature")
        }
    }
}

async fn run_flow(
    config: AppConfig,
    flow: &Path,
    inputs: &[String],
    state: Option<&str>,
) -> anyhow::Result<()> {
    let definition = read_flow(flow)?;
    let inputs = parse_inputs(inputs)?;
    let initial_state = match state {
        Some(raw) => match serde_json::from_str::<Value>(raw).context("invalid --state")? {
            Value::Object(map) => map,
            _ => anyhow::bail!("--state must be a JSON object"),
        },
        None => Map::new(),
    };

    let cancel = CancellationToken::new();
    let (service, _workers) = ExecutionService::start(
        Arc::new(SqliteStore::in_memory()?),
        Arc::new(EventBroadcaster::local(config.events.observer_buffer)),
        crew_runner_from_config(&config.crew)?,
        FunctionRegistry::new(),
        &config.worker,
        cancel.clone(),
    );

    service.save_flow(&definition).await?;
    let mut execution = service
        .kickoff_flow(&definition.id, inputs, initial_state, false, "cli")
        .await?;

    // Answer human feedback steps from stdin until the run settles
    while execution.status == ExecutionStatus::WaitingHuman {
        eprint!("Human feedback required> ");
        io::stderr().flush().ok();
        let mut line = String::new();
        if io::stdin().lock().read_line(&mut line)? == 0 {
            break;
        }
        let feedback = parse_value(line.trim());

        let mut events = service.subscribe(&execution.id);
        service.submit_feedback(&execution.id, feedback).await?;
        while let Some(event) = events.recv().await {
            if event.is_final() || event.event_type() == "human_input_required" {
                break;
            }
        }
        execution = service.get(&execution.id).await?;
    }

    cancel.cancel();
    println!("{}", serde_json::to_string_pretty(&execution)?);
    if execution.status == ExecutionStatus::Failed {
        anyhow::bail!(
            "flow failed: {}",
            execution.error.unwrap_or_else(|| "unknown error".to_string())
        );
    }
    Ok(())
}

fn read_flow(path: &Path) -> anyhow::Result<FlowDefinition> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("cannot read {}", path.display()))?;
    serde_json::from_str(&content).with_context(|| format!("invalid flow {}", path.display()))
}

fn parse_inputs(pairs: &[String]) -> anyhow::Result<Map<String, Value>> {
    let mut inputs = Map::new();
    for pair in pairs {
        let (key, value) = pair
            .split_once('=')
            .with_context(|| format!("input '{}' is not key=value", pair))?;
        inputs.insert(key.trim().to_string(), parse_value(value));
    }
    Ok(inputs)
}

fn parse_value(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}
