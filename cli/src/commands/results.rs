//! `kitt results …`: comparisons over stored runs.

use clap::Subcommand;

use kitt::store::{GroupBy, Store};

use super::open_store;

#[derive(Subcommand, Debug)]
pub enum ResultsCmd {
    /// Compare a metric across models, engines, or suites.
    Compare {
        /// Metric name, e.g. throughput_tps.
        #[arg(long)]
        metric: String,
        /// model | engine | suite (default engine)
        #[arg(long, default_value = "engine")]
        group_by: String,
    },
}

pub async fn run(cmd: ResultsCmd) -> anyhow::Result<()> {
    let ResultsCmd::Compare { metric, group_by } = cmd;
    let group_by = match group_by.as_str() {
        "model" => GroupBy::Model,
        "engine" => GroupBy::Engine,
        "suite" => GroupBy::Suite,
        other => anyhow::bail!("group_by must be model|engine|suite, got {other}"),
    };
    let store = open_store()?;
    let rows = store.aggregate(group_by, &metric)?;
    if rows.is_empty() {
        println!("no samples for metric {metric}");
        return Ok(());
    }
    println!(
        "{:<24}  {:>5}  {:>10}  {:>10}  {:>10}  {:>8}  {:>6}",
        "group", "count", "mean", "min", "max", "stddev", "cv"
    );
    for row in rows {
        println!(
            "{:<24}  {:>5}  {:>10.2}  {:>10.2}  {:>10.2}  {:>8}  {:>6}",
            row.group,
            row.count,
            row.mean,
            row.min,
            row.max,
            row.stddev
                .map(|s| format!("{s:.2}"))
                .unwrap_or_else(|| "-".into()),
            row.cv
                .map(|c| format!("{c:.3}"))
                .unwrap_or_else(|| "-".into()),
        );
    }
    Ok(())
}
