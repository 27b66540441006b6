//! `kitt run` / `kitt web`: serve the controller.

use std::sync::Arc;

use anyhow::Context;
use tokio_util::sync::CancellationToken;

use kitt::store::Store;
use kitt::{Controller, Tuning};

use super::open_store;

pub async fn serve(addr: Option<&str>) -> anyhow::Result<()> {
    let store = open_store()?;
    store.migrate().context("apply migrations")?;
    let ctrl = Controller::new(store, Tuning::default());

    let cancel = CancellationToken::new();
    kitt::agents::sweeper::spawn(
        Arc::clone(&ctrl.agents),
        ctrl.tuning.sweep_interval,
        cancel.clone(),
    );

    let serve_config = serve::ServeConfig::from_env().context("controller config")?;
    let result = serve::run_serve(addr, ctrl, serve_config).await;
    cancel.cancel();
    result.map_err(|e| anyhow::anyhow!(e))
}
