//! `kitt agent …`: register this host, run the daemon, manage test agents.

use std::sync::Arc;

use anyhow::Context;
use clap::Subcommand;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use agent::{config::AgentConfig, daemon::Daemon, runtime::DockerCli};

use crate::api::Api;

#[derive(Subcommand, Debug)]
pub enum AgentCmd {
    /// Register this host with the controller and store its identity.
    Register {
        /// Controller base URL to register with.
        #[arg(long, value_name = "URL")]
        url: String,
        #[arg(long)]
        name: Option<String>,
    },
    /// Run the agent daemon on this host.
    Start,
    /// List agents known to the controller.
    Status,
    /// Virtual agents for integration testing.
    #[command(subcommand)]
    Test(TestCmd),
}

#[derive(Subcommand, Debug)]
pub enum TestCmd {
    /// Create (or fetch) a test agent by name.
    Create {
        #[arg(value_name = "NAME")]
        name: String,
    },
    /// List test agents.
    List,
    /// Delete a test agent.
    Stop {
        #[arg(value_name = "ID")]
        id: String,
    },
}

pub async fn run(cmd: AgentCmd, controller: Option<String>) -> anyhow::Result<()> {
    match cmd {
        AgentCmd::Register { url, name } => {
            let home = config::ensure_home().context("resolve kitt home")?;
            let mut cfg = AgentConfig::load(&home).unwrap_or_else(|_| AgentConfig::new(&url));
            cfg.controller_url = url;
            if name.is_some() {
                cfg.name = name;
            }
            cfg.save(&home)?;
            // The daemon registers on start; doing it here just validates
            // connectivity and stores the issued token.
            let daemon = Arc::new(Daemon::new(home, cfg, Arc::new(DockerCli::new()))?);
            daemon.register_once().await?;
            println!("registered; identity stored in agent.yaml");
        }
        AgentCmd::Start => {
            let home = config::ensure_home().context("resolve kitt home")?;
            let cfg = AgentConfig::load(&home)
                .context("no agent.yaml; run `kitt agent register` first")?;
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
        AgentCmd::Status => {
            let api = Api::new(controller);
            let body = api.get("/api/v1/agents").await?;
            let empty = Vec::new();
            println!(
                "{:<36}  {:<16}  {:<7}  {:<6}  {}",
                "id", "name", "status", "arch", "last heartbeat"
            );
            for agent in body["agents"].as_array().unwrap_or(&empty) {
                println!(
                    "{:<36}  {:<16}  {:<7}  {:<6}  {}",
                    agent["id"].as_str().unwrap_or("?"),
                    agent["name"].as_str().unwrap_or("?"),
                    agent["status"].as_str().unwrap_or("?"),
                    agent["cpu_arch"].as_str().unwrap_or("?"),
                    agent["last_heartbeat"].as_str().unwrap_or("never"),
                );
            }
        }
        AgentCmd::Test(test) => {
            let api = Api::new(controller);
            match test {
                TestCmd::Create { name } => {
                    let created = api
                        .post("/api/v1/agents/test", &json!({ "name": name }))
                        .await?;
                    println!(
                        "test agent {} ({})",
                        created["name"].as_str().unwrap_or("?"),
                        created["id"].as_str().unwrap_or("?")
                    );
                }
                TestCmd::List => {
                    let body = api.get("/api/v1/agents").await?;
                    let empty = Vec::new();
                    for agent in body["agents"].as_array().unwrap_or(&empty) {
                        if agent["is_test_agent"].as_bool().unwrap_or(false) {
                            println!(
                                "{:<36}  {}",
                                agent["id"].as_str().unwrap_or("?"),
                                agent["name"].as_str().unwrap_or("?")
                            );
                        }
                    }
                }
                TestCmd::Stop { id } => {
                    api.delete(&format!("/api/v1/agents/{id}")).await?;
                    println!("deleted {id}");
                }
            }
        }
    }
    Ok(())
}
