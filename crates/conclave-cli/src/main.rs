//! `conclave` command line: validate engine configs and run plans against a
//! simulated executor.

mod plan;

use clap::{Parser, Subcommand, ValueEnum};
use conclave_core::EngineConfig;
use conclave_orchestrator::{CoordinationEngine, EventJournal, JsonlEventSink};
use plan::{Plan, SimulatedExecutor};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "conclave", about = "Conclave: coordination and scheduling for agent fleets")]
struct Cli {
    /// Path to engine config file (defaults apply when omitted)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log output format
    #[arg(long, value_enum, default_value_t = LogFormat::Text, global = true)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Check an engine config file and print the effective settings
    Validate {
        /// Config file to check
        path: PathBuf,
    },
    /// Run a plan with simulated executors and print the final report
    Run {
        /// Plan file listing agents and tasks
        #[arg(short, long)]
        plan: PathBuf,
        /// Give up waiting after this many seconds
        #[arg(long, default_value_t = 60)]
        timeout_secs: u64,
        /// Append every event to this JSONL file
        #[arg(long)]
        journal: Option<PathBuf>,
    },
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

fn load_config(path: Option<&PathBuf>) -> anyhow::Result<EngineConfig> {
    match path {
        Some(path) => Ok(EngineConfig::load(path)?),
        None => Ok(EngineConfig::default()),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    match cli.command {
        Commands::Validate { path } => {
            let config = EngineConfig::load(&path)?;
            println!("{} is valid", path.display());
            println!("{}", toml::to_string_pretty(&config)?);
        }
        Commands::Run {
            plan,
            timeout_secs,
            journal,
        } => {
            let config = load_config(cli.config.as_ref())?;
            let plan = Plan::load(&plan)?;
            let (specs, keys) = plan.task_specs()?;

            let engine = CoordinationEngine::new(config, Arc::new(SimulatedExecutor))?;
            engine.start()?;

            let journal = journal.map(|path| {
                let (stop, stopped) = tokio::sync::watch::channel(false);
                let handle = EventJournal::spawn(
                    engine.bus().subscribe(),
                    Arc::new(JsonlEventSink::new(path)),
                    stopped,
                );
                (stop, handle)
            });

            for descriptor in plan.agent_descriptors() {
                engine.register_agent(descriptor)?;
            }
            let submitted = engine.submit_tasks(specs)?;
            info!(tasks = submitted.len(), agents = engine.agents().len(), "plan submitted");

            let drained = engine
                .wait_until_drained(Duration::from_secs(timeout_secs))
                .await;
            if !drained {
                warn!(timeout_secs, "plan did not finish before the timeout");
            }
            // Let the collector catch up with the final events.
            tokio::time::sleep(Duration::from_millis(50)).await;

            let tasks: Vec<serde_json::Value> = submitted
                .iter()
                .filter_map(|id| engine.task(*id))
                .map(|task| {
                    serde_json::json!({
                        "key": keys.get(&task.id),
                        "status": task.status,
                        "retry_count": task.retry_count,
                        "agent": task.assigned_agent,
                        "last_error": task.last_error,
                    })
                })
                .collect();
            let report = serde_json::json!({
                "drained": drained,
                "tasks": tasks,
                "metrics": engine.query_metrics(),
            });
            engine.shutdown().await;

            if let Some((stop, handle)) = journal {
                let _ = stop.send(true);
                let written = handle.await?;
                info!(written, "journal closed");
            }
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
    }

    Ok(())
}
