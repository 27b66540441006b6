//! `kitt storage …`: init, migrate, import, export, list, stats against the
//! configured database.

use clap::Subcommand;
use std::path::PathBuf;

use kitt::store::{QuickTestFilter, RunFilter, RunRecord, Store};

use super::open_store;

#[derive(Subcommand, Debug)]
pub enum StorageCmd {
    /// Create the database and apply all migrations.
    Init,
    /// Apply pending migrations.
    Migrate,
    /// List stored runs.
    List {
        #[arg(long)]
        model: Option<String>,
        #[arg(long)]
        engine: Option<String>,
        #[arg(long)]
        suite: Option<String>,
        #[arg(long, default_value_t = 50)]
        limit: u32,
    },
    /// Row counts per table.
    Stats,
    /// Export runs as JSON (one run with --id, else every run).
    Export {
        /// Output file; stdout when omitted.
        #[arg(long, value_name = "PATH")]
        out: Option<PathBuf>,
        /// Export the raw metrics blob of a single run, verbatim.
        #[arg(long, value_name = "RUN_ID")]
        id: Option<String>,
    },
    /// Import runs previously produced by `storage export`.
    Import {
        #[arg(value_name = "PATH")]
        file: PathBuf,
    },
}

pub async fn run(cmd: StorageCmd) -> anyhow::Result<()> {
    let store = open_store()?;
    match cmd {
        StorageCmd::Init => {
            store.migrate()?;
            println!("schema version {}", store.schema_version()?);
        }
        StorageCmd::Migrate => {
            let before = store.schema_version().unwrap_or(0);
            store.migrate()?;
            let after = store.schema_version()?;
            if before == after {
                println!("schema up to date at version {after}");
            } else {
                println!("migrated {before} -> {after}");
            }
        }
        StorageCmd::List {
            model,
            engine,
            suite,
            limit,
        } => {
            let runs = store.query_runs(&RunFilter {
                model,
                engine,
                suite,
                limit: Some(limit),
                ..Default::default()
            })?;
            println!(
                "{:<36}  {:<24}  {:<10}  {:<10}  {:>8}  {}",
                "id", "model", "engine", "suite", "duration", "timestamp"
            );
            for run in runs {
                println!(
                    "{:<36}  {:<24}  {:<10}  {:<10}  {:>7.1}s  {}",
                    run.id,
                    run.model,
                    run.engine,
                    run.suite,
                    run.duration_seconds,
                    run.timestamp.to_rfc3339()
                );
            }
        }
        StorageCmd::Stats => {
            let runs = store.query_runs(&RunFilter {
                limit: Some(u32::MAX),
                ..Default::default()
            })?;
            let agents = store.list_agents()?;
            let tests = store.list_quick_tests(&QuickTestFilter::default())?;
            let campaigns = store.list_campaigns()?;
            println!("schema_version: {}", store.schema_version()?);
            println!("runs: {}", runs.len());
            println!("agents: {}", agents.len());
            println!("quick_tests: {}", tests.len());
            println!("campaigns: {}", campaigns.len());
        }
        StorageCmd::Export { out, id } => {
            let payload = match id {
                Some(id) => {
                    let run = store
                        .get_run(&id)?
                        .ok_or_else(|| anyhow::anyhow!("run {id} not found"))?;
                    // The canonical blob, byte for byte.
                    run.raw_json
                }
                None => {
                    let summaries = store.query_runs(&RunFilter {
                        limit: Some(u32::MAX),
                        ..Default::default()
                    })?;
                    let mut full = Vec::with_capacity(summaries.len());
                    for summary in summaries {
                        if let Some(run) = store.get_run(&summary.id)? {
                            full.push(run);
                        }
                    }
                    serde_json::to_string_pretty(&full)?
                }
            };
            match out {
                Some(path) => std::fs::write(&path, payload)?,
                None => println!("{payload}"),
            }
        }
        StorageCmd::Import { file } => {
            let content = std::fs::read_to_string(&file)?;
            let runs: Vec<RunRecord> = serde_json::from_str(&content)?;
            let mut imported = 0;
            for run in &runs {
                match store.save_run(run) {
                    Ok(()) => imported += 1,
                    Err(e) => eprintln!("skipping {}: {e}", run.id),
                }
            }
            println!("imported {imported}/{} runs", runs.len());
        }
    }
    Ok(())
}
