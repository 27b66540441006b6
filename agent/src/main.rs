//! `kitt-agent` binary: start the daemon, or print identity details.

use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;

use agent::{config::AgentConfig, daemon::Daemon, hardware, runtime::DockerCli};

#[derive(Parser, Debug)]
#[command(name = "kitt-agent")]
#[command(about = "kitt benchmark agent daemon")]
struct Args {
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Register with the controller and run the heartbeat loop.
    Start {
        /// Controller base URL; overrides agent.yaml.
        #[arg(long, value_name = "URL")]
        controller: Option<String>,
        /// Agent name; defaults to the hostname.
        #[arg(long, value_name = "NAME")]
        name: Option<String>,
    },
    /// Print detected hardware and the host fingerprint.
    Fingerprint,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    config::load_and_apply(None).ok();
    let home = config::ensure_home().context("resolve kitt home")?;
    let _guard = config::tracing_init::init(&home.join("logs"), "kitt-agent")
        .context("init tracing")?;

    let args = Args::parse();
    match args.cmd {
        Command::Start { controller, name } => {
            let mut cfg = match AgentConfig::load(&home) {
                Ok(cfg) => cfg,
                Err(_) => {
                    let url = controller.clone().context(
                        "no agent.yaml found; pass --controller to create one",
                    )?;
                    AgentConfig::new(url)
                }
            };
            if let Some(url) = controller {
                cfg.controller_url = url;
            }
            if let Some(name) = name {
                cfg.name = Some(name);
            }
            cfg.save(&home).context("save agent.yaml")?;

            let daemon = Arc::new(Daemon::new(home, cfg, Arc::new(DockerCli::new()))?);
            let cancel = CancellationToken::new();
            let stop = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    stop.cancel();
                }
            });
            daemon.run(cancel).await?;
        }
        Command::Fingerprint => {
            let (arch, hw) = hardware::detect();
            println!("{}", kitt::fingerprint::fingerprint(arch, &hw));
            println!("  arch: {}", arch.as_str());
            println!("  gpu: {} ({:?} GiB)", hw.gpu, hw.vram_gb);
            println!("  cpu: {} ({:.0} GiB RAM)", hw.cpu, hw.ram_gb);
            println!("  environment: {}", hw.environment_type);
        }
    }
    Ok(())
}
