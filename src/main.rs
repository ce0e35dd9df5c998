use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use shopsim::api::{self, AppState};
use shopsim::checkpoint::CheckpointManager;
use shopsim::engine::{Collaborators, Orchestrator, ResumeFrom};
use shopsim::providers::{HeuristicGraph, SimulatedClock};
use shopsim::storage::{InMemoryStore, PostgresStorage};
use shopsim::types::{AgentId, AgentRecord, AgentSelection, ExecutionMode, PersonaTraits};
use shopsim::Config;

#[derive(Parser)]
#[command(name = "shopsim")]
#[command(about = "Concurrent shopping-agent simulation engine", long_about = None)]
#[command(version)]
struct Cli {
    /// TOML file with run and connection settings
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a simulation
    Run(RunArgs),
    /// List saved checkpoints, newest first
    Checkpoints,
}

#[derive(Args)]
struct RunArgs {
    /// Wall-clock hours to run for
    #[arg(long)]
    duration_hours: Option<f64>,

    /// Simulated hours per real hour
    #[arg(long)]
    time_scale: Option<f64>,

    /// Only drive these agents
    #[arg(long, value_delimiter = ',', conflicts_with = "random_agents")]
    agent_ids: Vec<AgentId>,

    /// Drive a random sample of this many agents
    #[arg(long)]
    random_agents: Option<usize>,

    /// Backend requests per second
    #[arg(long)]
    rate_limit: Option<f64>,

    /// Save a checkpoint every N cycles (0 disables)
    #[arg(long)]
    checkpoint_interval: Option<u64>,

    /// Ramp the population over N cycles (0 disables)
    #[arg(long)]
    warmup_cycles: Option<u64>,

    /// Run agents one at a time
    #[arg(long)]
    sequential: bool,

    /// Resume from the newest checkpoint
    #[arg(long, conflicts_with_all = ["resume_from", "fresh"])]
    resume: bool,

    /// Resume from a specific checkpoint file
    #[arg(long, conflicts_with = "fresh")]
    resume_from: Option<PathBuf>,

    /// Ignore existing checkpoints
    #[arg(long)]
    fresh: bool,

    /// Serve the dashboard API on this port
    #[arg(long)]
    dashboard_port: Option<u16>,

    /// Use an in-memory store seeded with N synthetic agents instead of Postgres
    #[arg(long, value_name = "N")]
    in_memory: Option<usize>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::from_env(),
    };

    match cli.command {
        Commands::Run(args) => run_simulation(config, args).await?,
        Commands::Checkpoints => list_checkpoints(&config)?,
    }

    Ok(())
}

async fn run_simulation(mut config: Config, args: RunArgs) -> Result<()> {
    apply_overrides(&mut config, &args);

    let graph = Arc::new(HeuristicGraph::new());
    let collaborators = match args.in_memory {
        Some(count) => Collaborators::in_memory(seed_store(count)?, graph),
        None => {
            let url = config
                .database_url
                .clone()
                .context("DATABASE_URL is not set (use --in-memory N to run without a database)")?;
            let storage = Arc::new(PostgresStorage::new(&url, config.pool_sizing()).await?);
            storage.run_migrations().await?;
            Collaborators {
                storage: storage.clone(),
                sessions: storage,
                time: Arc::new(SimulatedClock::starting_now()),
                graph,
            }
        }
    };

    let resume = if args.fresh {
        ResumeFrom::Fresh
    } else if let Some(path) = args.resume_from {
        ResumeFrom::Path(path)
    } else if args.resume {
        ResumeFrom::Latest
    } else {
        ResumeFrom::Fresh
    };

    let orchestrator = Orchestrator::new(config.simulation.clone(), collaborators)?.with_resume(resume);
    let handle = orchestrator.handle();

    if let Some(port) = config.dashboard_port {
        let state = AppState {
            handle: handle.clone(),
        };
        tokio::spawn(async move {
            if let Err(e) = api::serve(state, port).await {
                log::error!("Dashboard server failed: {:#}", e);
            }
        });
    }

    {
        let handle = handle.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                log::info!("Interrupt received, stopping after the current step");
                handle.stop();
            }
        });
    }

    let stats = orchestrator.run().await?;

    println!("\nSimulation finished");
    println!("  Cycles completed: {}", stats.cycles_completed);
    println!("  Agents processed: {}", stats.agents_processed);
    println!("  Agents acted:     {}", stats.agents_acted);
    println!("  Events created:   {}", stats.events_created);
    println!("  Errors:           {} ({:.1}%)", stats.errors, stats.error_rate() * 100.0);
    println!("  Avg cycle time:   {:.2}s", stats.average_cycle_secs());
    for (outcome, count) in &stats.outcomes {
        println!("    {:<16} {}", outcome, count);
    }

    Ok(())
}

fn apply_overrides(config: &mut Config, args: &RunArgs) {
    let sim = &mut config.simulation;

    if let Some(hours) = args.duration_hours {
        sim.duration_hours = hours;
    }
    if let Some(scale) = args.time_scale {
        sim.time_scale = scale;
    }
    if let Some(rate) = args.rate_limit {
        sim.rate_limit = rate;
    }
    if let Some(interval) = args.checkpoint_interval {
        sim.checkpoint_interval = interval;
    }
    if let Some(cycles) = args.warmup_cycles {
        sim.warmup_cycles = cycles;
    }
    if args.sequential {
        sim.execution_mode = ExecutionMode::Sequential;
    }
    if !args.agent_ids.is_empty() {
        sim.selection = AgentSelection::Ids(args.agent_ids.clone());
    } else if let Some(count) = args.random_agents {
        sim.selection = AgentSelection::Random(count);
    }
    if args.dashboard_port.is_some() {
        config.dashboard_port = args.dashboard_port;
    }
}

fn seed_store(count: usize) -> Result<InMemoryStore> {
    use rand::Rng;

    let store = InMemoryStore::new();
    let mut rng = rand::thread_rng();
    for i in 0..count {
        let traits = PersonaTraits {
            shopping_frequency: rng.gen_range(0.1..0.9),
            price_sensitivity: rng.gen_range(0.0..1.0),
            impulse_factor: rng.gen_range(0.0..0.6),
        };
        store.add_agent(AgentRecord::new(format!("shopper-{:04}", i + 1), traits))?;
    }
    log::info!("Seeded in-memory store with {} agents", count);
    Ok(store)
}

fn list_checkpoints(config: &Config) -> Result<()> {
    // Listing never touches storage, so an empty store is enough.
    let manager =
        CheckpointManager::from_config(&config.simulation, Arc::new(InMemoryStore::new()));
    let checkpoints = manager.list()?;

    if checkpoints.is_empty() {
        println!("No checkpoints in {}", manager.dir().display());
        return Ok(());
    }

    for path in checkpoints {
        match manager.load(&path) {
            Ok(checkpoint) => println!(
                "{}  cycle {:>6}  {} cycles, {} errors  ({})",
                checkpoint.created_at.format("%Y-%m-%d %H:%M:%S"),
                checkpoint.state.cycle,
                checkpoint.statistics.cycles_completed,
                checkpoint.statistics.errors,
                path.display()
            ),
            Err(e) => println!("{}  unreadable: {}", path.display(), e),
        }
    }

    Ok(())
}
