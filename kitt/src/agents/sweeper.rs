//! Periodic liveness sweep task.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use super::AgentManager;

/// Spawns the sweeper loop. Cancel the token to stop it.
pub fn spawn(
    manager: Arc<AgentManager>,
    interval: Duration,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }
            let mgr = Arc::clone(&manager);
            let swept = tokio::task::spawn_blocking(move || mgr.sweep()).await;
            match swept {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::warn!(error = %e, "liveness sweep failed"),
                Err(e) => tracing::warn!(error = %e, "liveness sweep panicked"),
            }
        }
    })
}
