use anyhow::Result;
use clap::{Parser, Subcommand};
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};

use meshwork::core::logging::{init_tracing_with_level, parse_level};
use meshwork::{
    address, Broker, ClusterConfig, ClusterError, ClusterSetup, Completion, Hooks, InstanceSetup, LocalBroker,
    Orchestrator, RouteSetup, UnitContext, GLOBAL_ENTRIES,
};

#[derive(Parser)]
#[command(name = "meshwork")]
#[command(about = "Bring up a topology of cooperating worker processes")]
struct Cli {
    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", global = true)]
    log_level: String,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the cluster described by a declaration file
    Run {
        #[arg(short, long, env = "MESHWORK_CONFIG")]
        config: PathBuf,
    },
    /// Check a declaration file and print it resolved
    Validate {
        #[arg(short, long, env = "MESHWORK_CONFIG")]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing_with_level(parse_level(&cli.log_level));

    match cli.command {
        Commands::Run { config } => run(config).await,
        Commands::Validate { config } => {
            let config = ClusterConfig::from_file(&config)?;
            println!("{}", serde_yaml::to_string(&config)?);
            Ok(())
        }
    }
}

/// `echo`: serves `/{unit tag}/echo` and answers with the payload it got
fn register_builtin_entries() {
    GLOBAL_ENTRIES.register("echo", |ctx: UnitContext| async move {
        let path = address::action_path(&ctx.boot.tag_name, "echo");
        let mut unit = ctx.unit(InstanceSetup::new().route(RouteSetup::new(
            path,
            |payload: Value, completion: Completion| {
                completion.succeed(json!({ "echo": payload }));
                Ok(())
            },
        )));
        unit.init(None)?;
        std::future::pending::<()>().await;
        anyhow::Ok(())
    });
}

fn logging_hooks(kind: &'static str) -> Hooks {
    Hooks::new()
        .on_ready(move |owner| info!(kind = kind, tag = %owner.tag_name, "Ready"))
        .on_error(move |owner, err| error!(kind = kind, tag = %owner.tag_name, error = %err, "Failure reported"))
        .on_close(move |owner| info!(kind = kind, tag = %owner.tag_name, "Closed"))
}

async fn run(config: PathBuf) -> Result<()> {
    register_builtin_entries();

    let config = ClusterConfig::from_file(&config)?;
    let mut setup = ClusterSetup::from_config(&config)?.hooks(logging_hooks("cluster"));
    for process in &mut setup.processes {
        process.instance.hooks = logging_hooks("process");
    }

    let broker: Arc<dyn Broker> = Arc::new(LocalBroker::new());
    let mut orchestrator = Orchestrator::new(setup, broker)?;
    info!(role = ?orchestrator.role(), "meshwork started");

    let outcome = tokio::signal::ctrl_c()
        .await
        .map_err(|e| ClusterError::io("waiting for shutdown signal", e));

    let killed = orchestrator.terminate_all();
    if let Some(manager) = orchestrator.manager_mut() {
        manager.shutdown(outcome);
    } else {
        outcome?;
    }
    info!(killed = killed, "meshwork stopped");
    Ok(())
}
