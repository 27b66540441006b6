//! `kitt` binary: controller, storage admin, campaigns, agents, results.
//!
//! Subcommands: `run` / `web` (serve the controller), `storage`, `campaign`,
//! `agent`, `engines`, `results`, `fingerprint`. Exit code 0 on success,
//! 1 on failure.

mod api;
mod commands;

use clap::{Parser, Subcommand};

use commands::{agents, campaign, engines, results, storage, web};

#[derive(Parser, Debug)]
#[command(name = "kitt")]
#[command(about = "kitt — distributed benchmark orchestrator for LLM inference engines")]
struct Args {
    /// Controller URL for remote commands (default: KITT_CONTROLLER_URL or
    /// http://127.0.0.1:9100)
    #[arg(long, global = true, value_name = "URL")]
    controller: Option<String>,

    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start the controller with defaults (database, sweeper, HTTP + SSE).
    Run {
        /// Listen address (default 127.0.0.1:9100)
        #[arg(long, value_name = "ADDR")]
        addr: Option<String>,
    },
    /// Serve the controller API on an explicit address.
    Web {
        #[arg(long, value_name = "ADDR")]
        addr: Option<String>,
    },
    /// Database administration.
    #[command(subcommand)]
    Storage(storage::StorageCmd),
    /// Campaign lifecycle against a running controller.
    #[command(subcommand)]
    Campaign(campaign::CampaignCmd),
    /// Agent operations: register this host, run the daemon, test agents.
    #[command(subcommand)]
    Agent(agents::AgentCmd),
    /// Engine registry.
    #[command(subcommand)]
    Engines(engines::EnginesCmd),
    /// Result analysis.
    #[command(subcommand)]
    Results(results::ResultsCmd),
    /// Print this host's hardware fingerprint.
    Fingerprint,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    config::load_and_apply(None).ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    match args.cmd {
        Command::Run { addr } | Command::Web { addr } => web::serve(addr.as_deref()).await,
        Command::Storage(cmd) => storage::run(cmd).await,
        Command::Campaign(cmd) => campaign::run(cmd, args.controller).await,
        Command::Agent(cmd) => agents::run(cmd, args.controller).await,
        Command::Engines(cmd) => engines::run(cmd, args.controller).await,
        Command::Results(cmd) => results::run(cmd).await,
        Command::Fingerprint => {
            let (arch, hw) = agent::hardware::detect();
            println!("{}", kitt::fingerprint::fingerprint(arch, &hw));
            Ok(())
        }
    }
}
