//! `kitt engines …`: the compile-time registry and host compatibility.

use clap::Subcommand;

use kitt::engines;

use crate::api::Api;

#[derive(Subcommand, Debug)]
pub enum EnginesCmd {
    /// List registered engines and their capability sets.
    List,
    /// Check which engines this host (or a remote agent) can run.
    Check {
        /// Agent id or name; checks the local host when omitted.
        #[arg(long)]
        agent: Option<String>,
    },
}

pub async fn run(cmd: EnginesCmd, controller: Option<String>) -> anyhow::Result<()> {
    match cmd {
        EnginesCmd::List => {
            println!(
                "{:<10}  {:<22}  {:<14}  {:>5}  {}",
                "name", "formats", "arches", "port", "image"
            );
            for engine in engines::engines() {
                let formats: Vec<_> =
                    engine.supported_formats.iter().map(|f| f.as_str()).collect();
                let arches: Vec<_> =
                    engine.supported_arches.iter().map(|a| a.as_str()).collect();
                println!(
                    "{:<10}  {:<22}  {:<14}  {:>5}  {}",
                    engine.name,
                    formats.join(","),
                    arches.join(","),
                    engine.default_port,
                    engine.image
                );
            }
        }
        EnginesCmd::Check { agent: Some(key) } => {
            let api = Api::new(controller);
            let agent = api.get(&format!("/api/v1/agents/{key}")).await?;
            let arch = agent["cpu_arch"].as_str().unwrap_or("amd64");
            print_check(agent["name"].as_str().unwrap_or(&key), arch);
        }
        EnginesCmd::Check { agent: None } => {
            let arch = agent::hardware::host_arch();
            print_check("this host", arch.as_str());
        }
    }
    Ok(())
}

fn print_check(who: &str, arch: &str) {
    println!("engine compatibility for {who} ({arch}):");
    for engine in engines::engines() {
        let ok = engine
            .supported_arches
            .iter()
            .any(|a| a.as_str() == arch);
        println!(
            "  {:<10}  {}",
            engine.name,
            if ok { "ok" } else { "unsupported_arch" }
        );
    }
}
