//! The agent daemon: register, heartbeat at the server-driven interval,
//! execute pulled commands, recover from controller resets.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

use stream_event::{
    CommandKind, HeartbeatRequest, RegisterRequest, RunTestPayload, StopContainerPayload,
    WireCommand,
};

use crate::client::ControllerClient;
use crate::config::AgentConfig;
use crate::error::AgentError;
use crate::hardware;
use crate::runner::{self, RunnerEnv};
use crate::runtime::ContainerRuntime;

/// Fallback cadence when the controller has not told us one yet.
const INITIAL_INTERVAL_S: u64 = 30;

struct RunningTest {
    test_id: String,
}

pub struct Daemon {
    home: PathBuf,
    config: Mutex<AgentConfig>,
    client: Arc<ControllerClient>,
    runtime: Arc<dyn ContainerRuntime>,
    current: Arc<Mutex<Option<RunningTest>>>,
    started: Instant,
    agent_id: Mutex<Option<String>>,
}

impl Daemon {
    pub fn new(
        home: PathBuf,
        config: AgentConfig,
        runtime: Arc<dyn ContainerRuntime>,
    ) -> Result<Self, AgentError> {
        let mut client = ControllerClient::new(&config.controller_url)?;
        if let Ok(admin) = std::env::var("KITT_AUTH_TOKEN") {
            if !admin.trim().is_empty() {
                client = client.with_admin_token(admin);
            }
        }
        if let Some(token) = &config.token {
            client.set_agent_token(token.clone());
        }
        Ok(Self {
            home,
            agent_id: Mutex::new(config.agent_id.clone()),
            config: Mutex::new(config),
            client: Arc::new(client),
            runtime,
            current: Arc::new(Mutex::new(None)),
            started: Instant::now(),
        })
    }

    /// Runs until cancelled. Registers first, then heartbeats forever,
    /// re-registering whenever the controller answers 404.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) -> Result<(), AgentError> {
        self.register().await?;
        let mut interval_s = INITIAL_INTERVAL_S;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!("daemon stopping");
                    return Ok(());
                }
                _ = tokio::time::sleep(Duration::from_secs(interval_s)) => {}
            }
            match self.beat().await {
                Ok(next_interval) => interval_s = next_interval,
                Err(AgentError::NotRegistered) => {
                    tracing::warn!("controller lost our registration, re-registering");
                    if let Err(e) = self.register().await {
                        tracing::warn!(error = %e, "re-register failed, will retry");
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, "heartbeat failed, will retry");
                }
            }
        }
    }

    /// One-shot registration; the CLI uses this to validate connectivity and
    /// store the issued identity without starting the loop.
    pub async fn register_once(&self) -> Result<(), AgentError> {
        self.register().await
    }

    async fn register(&self) -> Result<(), AgentError> {
        let (arch, hw) = hardware::detect();
        let req = {
            let config = self.lock_config()?;
            RegisterRequest {
                agent_id: config.agent_id.clone(),
                name: config.effective_name(),
                host: local_host(),
                port: config.port,
                cpu_arch: arch,
                hardware: hw,
                kitt_version: env!("CARGO_PKG_VERSION").to_string(),
            }
        };
        let resp = self.client.register(&req).await?;
        tracing::info!(agent_id = %resp.agent_id, "registered with controller");
        {
            let mut config = self.lock_config()?;
            config.agent_id = Some(resp.agent_id.clone());
            if !resp.token.is_empty() {
                config.token = Some(resp.token.clone());
                self.client.set_agent_token(resp.token.clone());
            }
            config.save(&self.home)?;
        }
        if self.lock_config()?.token.is_none() {
            return Err(AgentError::Config(
                "controller issued no token and none is stored; delete agent.yaml and re-register"
                    .into(),
            ));
        }
        *self
            .agent_id
            .lock()
            .map_err(|_| AgentError::Config("agent id lock poisoned".into()))? =
            Some(resp.agent_id);
        Ok(())
    }

    /// One heartbeat cycle; tests drive the daemon with this instead of the
    /// timed loop.
    pub async fn beat_once(&self) -> Result<u64, AgentError> {
        self.beat().await
    }

    /// One heartbeat: report status, execute returned commands, adopt the
    /// returned interval and settings.
    async fn beat(&self) -> Result<u64, AgentError> {
        let agent_id = self
            .agent_id
            .lock()
            .ok()
            .and_then(|g| g.clone())
            .ok_or(AgentError::NotRegistered)?;
        let current_test_id = self
            .current
            .lock()
            .ok()
            .and_then(|g| g.as_ref().map(|t| t.test_id.clone()));
        let storage_dir = self.storage_dir()?;
        let req = HeartbeatRequest {
            status: if current_test_id.is_some() {
                "busy".into()
            } else {
                "online".into()
            },
            current_test_id,
            gpu_util: gpu_util(),
            gpu_mem_gb: 0.0,
            storage_free_gb: free_gb(&storage_dir),
            uptime_s: self.started.elapsed().as_secs(),
        };
        let resp = self.client.heartbeat(&agent_id, &req).await?;

        self.apply_settings(&resp.settings)?;
        for cmd in resp.commands {
            self.execute(cmd).await?;
        }
        Ok(resp.interval_s.max(1))
    }

    fn apply_settings(
        &self,
        settings: &std::collections::BTreeMap<String, String>,
    ) -> Result<(), AgentError> {
        let mut config = self.lock_config()?;
        if let Some(dir) = settings.get("model_storage_dir") {
            config.model_storage_dir = Some(PathBuf::from(dir));
        }
        if let Some(mount) = settings.get("model_share_mount") {
            config.model_share_mount = Some(PathBuf::from(mount));
        }
        Ok(())
    }

    async fn execute(&self, cmd: WireCommand) -> Result<(), AgentError> {
        tracing::info!(id = %cmd.id, kind = ?cmd.kind, "executing command");
        match cmd.kind {
            CommandKind::RunTest => {
                let payload: RunTestPayload = serde_json::from_value(cmd.payload)?;
                self.start_test(payload);
            }
            CommandKind::CleanupStorage => {
                let dir = self.storage_dir()?;
                crate::models::cleanup(&dir).await?;
            }
            CommandKind::StopContainer => {
                let payload: StopContainerPayload = serde_json::from_value(cmd.payload)?;
                self.stop_test(&payload.test_id).await;
            }
        }
        Ok(())
    }

    fn start_test(&self, payload: RunTestPayload) {
        {
            let mut current = match self.current.lock() {
                Ok(g) => g,
                Err(_) => return,
            };
            if let Some(running) = current.as_ref() {
                tracing::warn!(
                    running = %running.test_id,
                    requested = %payload.test_id,
                    "refusing second concurrent test"
                );
                return;
            }
            *current = Some(RunningTest {
                test_id: payload.test_id.clone(),
            });
        }

        let client = Arc::clone(&self.client);
        let runtime = Arc::clone(&self.runtime);
        let current = Arc::clone(&self.current);
        let env = match self.runner_env() {
            Ok(env) => env,
            Err(e) => {
                tracing::warn!(error = %e, "cannot build runner env");
                if let Ok(mut guard) = current.lock() {
                    *guard = None;
                }
                return;
            }
        };
        tokio::spawn(async move {
            let test_id = payload.test_id.clone();
            if let Err(e) = runner::run_test(client, runtime, env, payload).await {
                tracing::warn!(test = %test_id, error = %e, "status report failed");
            }
            if let Ok(mut guard) = current.lock() {
                *guard = None;
            }
        });
    }

    async fn stop_test(&self, test_id: &str) {
        // Containers get a deterministic name at launch, so the id is not
        // needed here; stopping one that never started is a no-op error.
        let name = format!("kitt-{test_id}");
        if let Err(e) = self.runtime.stop(&name).await {
            tracing::debug!(container = %name, error = %e, "stop by name failed");
        }
    }

    fn runner_env(&self) -> Result<RunnerEnv, AgentError> {
        let config = self.lock_config()?;
        let storage_dir = config
            .model_storage_dir
            .clone()
            .unwrap_or_else(|| self.home.join("models"));
        Ok(RunnerEnv {
            arch: hardware::host_arch(),
            share_mount: config.model_share_mount.clone(),
            results_dir: self.home.join("results"),
            storage_dir,
        })
    }

    fn storage_dir(&self) -> Result<PathBuf, AgentError> {
        Ok(self.runner_env()?.storage_dir)
    }

    fn lock_config(&self) -> Result<std::sync::MutexGuard<'_, AgentConfig>, AgentError> {
        self.config
            .lock()
            .map_err(|_| AgentError::Config("config lock poisoned".into()))
    }
}

fn local_host() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "127.0.0.1".to_string())
}

/// Best-effort GPU utilisation from nvidia-smi; 0.0 without one.
fn gpu_util() -> f64 {
    std::process::Command::new("nvidia-smi")
        .args(["--query-gpu=utilization.gpu", "--format=csv,noheader,nounits"])
        .output()
        .ok()
        .filter(|o| o.status.success())
        .and_then(|o| {
            String::from_utf8_lossy(&o.stdout)
                .lines()
                .next()?
                .trim()
                .parse()
                .ok()
        })
        .unwrap_or(0.0)
}

/// Free space on the filesystem holding `path`, via `df -Pk`.
fn free_gb(path: &std::path::Path) -> f64 {
    let probe = if path.exists() {
        path.to_path_buf()
    } else {
        PathBuf::from("/")
    };
    std::process::Command::new("df")
        .arg("-Pk")
        .arg(&probe)
        .output()
        .ok()
        .filter(|o| o.status.success())
        .and_then(|o| {
            let text = String::from_utf8_lossy(&o.stdout).to_string();
            let line = text.lines().nth(1)?.to_string();
            let avail_kb: f64 = line.split_whitespace().nth(3)?.parse().ok()?;
            Some(avail_kb / 1024.0 / 1024.0)
        })
        .unwrap_or(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn free_gb_reads_root() {
        // df on / should report something positive on any dev box.
        let gb = free_gb(std::path::Path::new("/"));
        assert!(gb >= 0.0);
    }
}
