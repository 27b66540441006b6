//! The typed controller context. Everything that used to be a process global
//! lives here and is passed explicitly; tests build a fresh one per case.

use std::sync::Arc;
use std::time::Duration;

use crate::agents::AgentManager;
use crate::bus::EventBus;
use crate::error::KittError;
use crate::store::Store;

/// Timing knobs. Production uses the defaults; tests shrink them so watchdog
/// and polling paths run in test time.
#[derive(Clone, Debug)]
pub struct Tuning {
    /// Per-test wall-clock watchdog.
    pub test_watchdog: Duration,
    /// Campaign executor terminal-state poll interval.
    pub campaign_poll: Duration,
    /// Liveness sweeper pass interval.
    pub sweep_interval: Duration,
    /// Simulated-step delay bounds (milliseconds) for test agents.
    pub simulate_step_ms: (u64, u64),
}

impl Default for Tuning {
    fn default() -> Self {
        Self {
            test_watchdog: Duration::from_secs(30 * 60),
            campaign_poll: Duration::from_secs(2),
            sweep_interval: Duration::from_secs(30),
            simulate_step_ms: (500, 1_500),
        }
    }
}

pub struct Controller {
    pub store: Arc<dyn Store>,
    pub bus: Arc<EventBus>,
    pub agents: Arc<AgentManager>,
    pub tuning: Tuning,
}

impl Controller {
    pub fn new(store: Arc<dyn Store>, tuning: Tuning) -> Arc<Self> {
        let bus = Arc::new(EventBus::new(Arc::clone(&store)));
        let agents = Arc::new(AgentManager::new(Arc::clone(&store), Arc::clone(&bus)));
        Arc::new(Self {
            store,
            bus,
            agents,
            tuning,
        })
    }

    /// Runs a blocking store/bus section off the async workers.
    pub async fn run_blocking<T, F>(self: &Arc<Self>, f: F) -> Result<T, KittError>
    where
        F: FnOnce(&Controller) -> Result<T, KittError> + Send + 'static,
        T: Send + 'static,
    {
        let ctrl = Arc::clone(self);
        tokio::task::spawn_blocking(move || f(&ctrl))
            .await
            .map_err(|e| KittError::Fatal(format!("blocking task join: {e}")))?
    }
}
