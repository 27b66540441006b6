//! `kitt campaign …`: lifecycle against a running controller.

use std::path::PathBuf;
use std::time::Duration;

use clap::Subcommand;
use serde_json::json;

use crate::api::Api;

const POLL: Duration = Duration::from_secs(2);

#[derive(Subcommand, Debug)]
pub enum CampaignCmd {
    /// Create a draft campaign from a YAML file.
    Create {
        #[arg(long, value_name = "PATH")]
        file: PathBuf,
        /// Agent id or name to assign.
        #[arg(long)]
        agent: Option<String>,
    },
    /// Create, launch, and follow a campaign to its terminal state.
    Run {
        #[arg(long, value_name = "PATH")]
        file: PathBuf,
        #[arg(long)]
        agent: String,
    },
    /// Show one campaign.
    Status {
        #[arg(value_name = "ID")]
        id: String,
    },
    /// List campaigns.
    List,
    /// Cancel a queued or running campaign.
    Cancel {
        #[arg(value_name = "ID")]
        id: String,
    },
}

pub async fn run(cmd: CampaignCmd, controller: Option<String>) -> anyhow::Result<()> {
    let api = Api::new(controller);
    match cmd {
        CampaignCmd::Create { file, agent } => {
            let yaml = std::fs::read_to_string(&file)?;
            let created = api
                .post(
                    "/api/v1/campaigns",
                    &json!({ "config_yaml": yaml, "agent": agent }),
                )
                .await?;
            println!(
                "created campaign {} ({})",
                created["id"].as_str().unwrap_or("?"),
                created["name"].as_str().unwrap_or("?")
            );
        }
        CampaignCmd::Run { file, agent } => {
            let yaml = std::fs::read_to_string(&file)?;
            let created = api
                .post(
                    "/api/v1/campaigns",
                    &json!({ "config_yaml": yaml, "agent": agent }),
                )
                .await?;
            let id = created["id"]
                .as_str()
                .ok_or_else(|| anyhow::anyhow!("controller returned no campaign id"))?
                .to_string();
            api.post(&format!("/api/v1/campaigns/{id}/launch"), &json!({}))
                .await?;
            println!("launched campaign {id}");
            follow(&api, &id).await?;
        }
        CampaignCmd::Status { id } => {
            let campaign = api.get(&format!("/api/v1/campaigns/{id}")).await?;
            print_campaign(&campaign);
        }
        CampaignCmd::List => {
            let body = api.get("/api/v1/campaigns").await?;
            let empty = Vec::new();
            for campaign in body["campaigns"].as_array().unwrap_or(&empty) {
                println!(
                    "{:<36}  {:<10}  {}",
                    campaign["id"].as_str().unwrap_or("?"),
                    campaign["status"].as_str().unwrap_or("?"),
                    campaign["name"].as_str().unwrap_or("?")
                );
            }
        }
        CampaignCmd::Cancel { id } => {
            api.post(&format!("/api/v1/campaigns/{id}/cancel"), &json!({}))
                .await?;
            println!("cancelled {id}");
        }
    }
    Ok(())
}

/// Polls until terminal, echoing new log lines as they land.
async fn follow(api: &Api, id: &str) -> anyhow::Result<()> {
    let mut printed = 0usize;
    loop {
        let logs = api.get(&format!("/api/v1/campaigns/{id}/logs")).await?;
        let empty = Vec::new();
        let lines = logs["logs"].as_array().unwrap_or(&empty);
        for entry in lines.iter().skip(printed) {
            if let Some(line) = entry["line"].as_str() {
                println!("{line}");
            }
        }
        printed = lines.len();

        let campaign = api.get(&format!("/api/v1/campaigns/{id}")).await?;
        let status = campaign["status"].as_str().unwrap_or("?");
        if matches!(status, "completed" | "failed" | "cancelled") {
            print_campaign(&campaign);
            if status != "completed" {
                anyhow::bail!("campaign {status}");
            }
            return Ok(());
        }
        tokio::time::sleep(POLL).await;
    }
}

fn print_campaign(campaign: &serde_json::Value) {
    println!(
        "{} [{}] {} — total {} succeeded {} failed {} skipped {}",
        campaign["id"].as_str().unwrap_or("?"),
        campaign["status"].as_str().unwrap_or("?"),
        campaign["name"].as_str().unwrap_or("?"),
        campaign["counters"]["total_runs"],
        campaign["counters"]["succeeded"],
        campaign["counters"]["failed"],
        campaign["counters"]["skipped"],
    );
}
